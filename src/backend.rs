//! The backend side of a flow.
//!
//! A backend reaches the proxy over the Unix socket, introduces its flow with
//! one p2p HELLO carrying the flow [`Key`], and waits for the HELLO ACK.
//! After that both directions carry b2c frames: a big-endian `u32` length
//! that counts itself, followed by the body.
//!
//! Outgoing chunks are coalesced into frames of at most `frame_size` bytes,
//! which must leave room for the p2p header the proxy wraps them in; see
//! [`DEFAULT_FRAME_SIZE`].
use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::Shutdown,
    os::unix::net::UnixStream,
    path::Path,
    thread,
    time::Duration,
};

use log::{debug, info};
use thiserror::Error;

use crate::packet::{
    B2C_HEADER_SIZE, DEFAULT_BLOCK_SIZE, Dialect, FramingError, HEADER_SIZE, Header, InputBuffer,
    Key, MessageType, OutputBuffer, PacketPool, WireError,
};

/// Largest b2c frame the proxy accepts with its default block size.
pub const DEFAULT_FRAME_SIZE: usize = DEFAULT_BLOCK_SIZE - HEADER_SIZE;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend IO error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("the proxy is not ready")]
    NotReady,
    #[error("expected HELLO ACK, received {0}")]
    UnexpectedReply(String),
}

/// How often to try reaching the proxy socket.
#[derive(Debug, Clone, Copy)]
pub struct Retry {
    pub attempts: usize,
    pub interval: Duration,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            attempts: 50,
            interval: Duration::from_millis(100),
        }
    }
}

pub struct BackendConnection<T: Read + Write> {
    stream: T,
    key: Key,
    pool: PacketPool,
    ibuf: InputBuffer,
    obuf: OutputBuffer,
    inbox: VecDeque<Vec<u8>>,
}

/// Connects to the proxy listening on `path` and registers the flow `key`.
///
/// Both a refused connection and a proxy closing before the ACK count as
/// "not ready yet" and are retried.
pub fn connect(
    path: impl AsRef<Path>,
    key: Key,
    frame_size: usize,
    retry: Retry,
) -> Result<BackendConnection<UnixStream>, BackendError> {
    let path = path.as_ref();
    let mut attempt = 0;

    loop {
        attempt += 1;
        let res = UnixStream::connect(path)
            .map_err(BackendError::from)
            .and_then(|stream| BackendConnection::handshake(stream, key, frame_size));

        match res {
            Ok(conn) => return Ok(conn),
            Err(e @ (BackendError::Io(_) | BackendError::NotReady)) if attempt < retry.attempts => {
                debug!(
                    "ic-proxy-backend: fail to connect to {}: {e}",
                    path.display()
                );
                thread::sleep(retry.interval);
            }
            Err(e) => return Err(e),
        }
    }
}

impl<T: Read + Write> BackendConnection<T> {
    /// Sends HELLO for `key` and waits for the HELLO ACK.
    pub fn handshake(mut stream: T, key: Key, frame_size: usize) -> Result<Self, BackendError> {
        let mut hello = [0; HEADER_SIZE];
        Header::new(MessageType::Hello, &key).encode_into(&mut hello)?;
        stream.write_all(&hello)?;

        // the ACK is header only; what follows is already b2c
        let mut buf = [0; HEADER_SIZE];
        match stream.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                info!("ic-proxy-backend: the peer is not ready");
                return Err(BackendError::NotReady);
            }
            Err(e) => return Err(e.into()),
        }

        let ack = Header::decode(&buf)?;
        if ack.message_type()? != MessageType::HelloAck || !ack.is_to_client(&key) {
            return Err(BackendError::UnexpectedReply(format!(
                "{} for {}",
                ack.message_type()?,
                Key::from_p2c(&ack)
            )));
        }

        let mut pool = PacketPool::new(frame_size.max(B2C_HEADER_SIZE + 1), None);
        let mut obuf = OutputBuffer::new(Dialect::B2c);
        obuf.init_header(&mut pool, &Header::new(MessageType::Data, &key))?;

        Ok(Self {
            stream,
            key,
            pool,
            ibuf: InputBuffer::new(Dialect::B2c),
            obuf,
            inbox: VecDeque::new(),
        })
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Queues `data`, writing a frame out whenever one fills up.
    pub fn send(&mut self, data: &[u8]) -> Result<(), BackendError> {
        let max = self.pool.block_size() - B2C_HEADER_SIZE;
        for chunk in data.chunks(max) {
            let mut frames = Vec::new();
            self.obuf.push(&mut self.pool, chunk, |_, frame| {
                frames.push(frame.to_vec());
                Ok(())
            })?;
            self.write_frames(frames)?;
        }
        Ok(())
    }

    /// Writes out the frame in progress, if any.
    pub fn flush(&mut self) -> Result<(), BackendError> {
        let mut frames = Vec::new();
        self.obuf.flush(&mut self.pool, |_, frame| {
            frames.push(frame.to_vec());
            Ok(())
        })?;
        self.write_frames(frames)?;
        self.stream.flush()?;
        Ok(())
    }

    fn write_frames(&mut self, frames: Vec<Vec<u8>>) -> io::Result<()> {
        for frame in frames {
            debug!("ic-proxy-backend: sending {} bytes", frame.len());
            self.stream.write_all(&frame)?;
        }
        Ok(())
    }

    /// Next frame body from the remote end, `None` once the proxy closed the
    /// flow.
    pub fn recv(&mut self) -> Result<Option<Vec<u8>>, BackendError> {
        let mut buf = vec![0; self.pool.block_size()];

        while self.inbox.is_empty() {
            let n = match self.stream.read(&mut buf) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                if !self.ibuf.is_empty() {
                    return Err(BackendError::Io(io::ErrorKind::UnexpectedEof.into()));
                }
                return Ok(None);
            }

            let inbox = &mut self.inbox;
            self.ibuf.push(&mut self.pool, &buf[..n], |_, frame| {
                inbox.push_back(frame[B2C_HEADER_SIZE..].to_vec());
                Ok(())
            })?;
        }

        Ok(self.inbox.pop_front())
    }

    /// Everything received until the proxy closes the flow.
    pub fn recv_all(&mut self) -> Result<Vec<u8>, BackendError> {
        let mut out = Vec::new();
        while let Some(body) = self.recv()? {
            out.extend_from_slice(&body);
        }
        Ok(out)
    }
}

impl BackendConnection<UnixStream> {
    /// Flushes and ends the c2p direction; the proxy answers with a BYE to
    /// the remote end.
    pub fn shutdown(&mut self) -> Result<(), BackendError> {
        self.flush()?;
        self.stream.shutdown(Shutdown::Write)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use crate::packet::{Endpoint, Packet};

    use super::*;

    struct Duplex {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Duplex {
        fn new(input: Vec<u8>) -> Self {
            Self {
                input: Cursor::new(input),
                output: Vec::new(),
            }
        }
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            // a few bytes at a time, as a socket may
            let n = buf.len().min(7);
            self.input.read(&mut buf[..n])
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn key() -> Key {
        Key {
            session_id: 9,
            command_id: 1,
            send_slice: 1,
            recv_slice: 0,
            local: Endpoint::new(0, 2, 100),
            remote: Endpoint::new(1, 3, 200),
        }
    }

    fn message(kind: MessageType, key: &Key) -> Vec<u8> {
        let mut pool = PacketPool::new(DEFAULT_BLOCK_SIZE, None);
        Packet::message(&mut pool, kind, key).unwrap().as_bytes().to_vec()
    }

    fn frame(body: &[u8]) -> Vec<u8> {
        [&((body.len() + B2C_HEADER_SIZE) as u32).to_be_bytes()[..], body].concat()
    }

    #[test]
    fn handshake_then_receive_frames() {
        let input = [
            message(MessageType::HelloAck, &key().reverse()),
            frame(b"first"),
            frame(b"second"),
        ]
        .concat();
        let mut conn = BackendConnection::handshake(Duplex::new(input), key(), 64).unwrap();

        assert_eq!(conn.stream.output, message(MessageType::Hello, &key()));
        assert_eq!(conn.recv().unwrap(), Some(b"first".to_vec()));
        assert_eq!(conn.recv().unwrap(), Some(b"second".to_vec()));
        assert_eq!(conn.recv().unwrap(), None);
    }

    #[test]
    fn eof_before_ack_means_not_ready() {
        let res = BackendConnection::handshake(Duplex::new(Vec::new()), key(), 64);
        assert!(matches!(res, Err(BackendError::NotReady)));
    }

    #[test]
    fn ack_for_another_flow_is_rejected() {
        let other = Key {
            recv_slice: 5,
            ..key()
        };
        let input = message(MessageType::HelloAck, &other.reverse());
        let res = BackendConnection::handshake(Duplex::new(input), key(), 64);
        assert!(matches!(res, Err(BackendError::UnexpectedReply(_))));
    }

    #[test]
    fn sends_are_coalesced_into_frames() {
        let input = message(MessageType::HelloAck, &key().reverse());
        let mut conn = BackendConnection::handshake(Duplex::new(input), key(), 16).unwrap();
        conn.stream.output.clear();

        conn.send(b"ab").unwrap();
        conn.send(b"cd").unwrap();
        assert!(conn.stream.output.is_empty());
        conn.flush().unwrap();
        assert_eq!(conn.stream.output, frame(b"abcd"));

        // 12 payload bytes per frame of 16
        conn.stream.output.clear();
        conn.send(&[7; 20]).unwrap();
        conn.flush().unwrap();
        assert_eq!(conn.stream.output, [frame(&[7; 12]), frame(&[7; 8])].concat());
    }

    #[test]
    fn truncated_frame_at_eof() {
        let input = [
            message(MessageType::HelloAck, &key().reverse()),
            frame(b"cut")[..5].to_vec(),
        ]
        .concat();
        let mut conn = BackendConnection::handshake(Duplex::new(input), key(), 64).unwrap();
        assert!(matches!(conn.recv(), Err(BackendError::Io(_))));
    }
}
