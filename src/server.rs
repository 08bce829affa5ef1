//! The event-loop driver.
//!
//! [`Server`] owns the listeners, the maintenance timer, the signal streams
//! and one reader/writer task pair per connection, and executes the
//! [`Effect`]s the [`Proxy`] core emits. Everything that touches the core
//! runs on the driver task; the socket tasks only move bytes and report
//! back through one event channel.
//!
//! Reads are permit based: the reader performs exactly one read per
//! `Start`, so a connection the core stopped reading never delivers more
//! than the chunk already in flight.
use std::{
    collections::HashMap,
    fs, future, io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    path::PathBuf,
};

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpSocket, TcpStream, UnixListener, UnixStream},
    signal::unix::{SignalKind, signal},
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time::{self, Instant},
};

use crate::{
    addr::{AddrError, AddressTable},
    config::{Config, ConfigError, ConfigSource},
    packet::{Packet, PacketPool},
    proxy::{Completion, Effect, NodeIdentity, Proxy, Token},
};

const BACKLOG: u32 = 1024;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Addr(#[from] AddrError),
}

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug)]
enum ReadCmd {
    Start,
    Stop,
}

#[derive(Debug)]
enum WriteCmd {
    Write {
        packet: Packet,
        offset: usize,
        completion: Completion,
    },
    Shutdown,
}

#[derive(Debug)]
enum Event {
    Read(Token, Vec<u8>),
    Eof(Token, Option<io::Error>),
    Written(Packet, Completion, io::Result<()>),
    ShutdownDone(Token, io::Result<()>),
    Connected(Token, io::Result<TcpStream>),
    Reloaded(Box<Config>, AddressTable),
}

#[derive(Debug)]
enum Control {
    Quit { relaunch: bool },
    Reload,
}

/// Controls a running [`Server`] from outside the driver task.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    control: UnboundedSender<Control>,
}

impl ServerHandle {
    /// Stops accepting new work and exits once existing flows drained. A
    /// second request exits right away.
    pub fn quit(&self, relaunch: bool) {
        let _ = self.control.send(Control::Quit { relaunch });
    }

    /// Same as a SIGHUP.
    pub fn reload(&self) {
        let _ = self.control.send(Control::Reload);
    }
}

struct Conn {
    reads: UnboundedSender<ReadCmd>,
    writes: UnboundedSender<WriteCmd>,
    /// The core wants this connection read.
    reading: bool,
    /// A `Start` is outstanding.
    armed: bool,
    reader: JoinHandle<()>,
}

pub struct Server {
    source: ConfigSource,
    config: Config,
    proxy: Proxy,
    conns: HashMap<Token, Conn>,
    tcp: Option<TcpListener>,
    unix: Option<UnixListener>,
    events_tx: UnboundedSender<Event>,
    events_rx: UnboundedReceiver<Event>,
    control_tx: UnboundedSender<Control>,
    control_rx: UnboundedReceiver<Control>,
    forced: bool,
}

impl Server {
    pub fn new(source: ConfigSource) -> Result<Self, ServerError> {
        let config = source.load()?;
        let addrs = config.address_table()?;
        let me = NodeIdentity {
            content_id: config.content_id,
            dbid: config.dbid,
        };
        let pool = PacketPool::new(config.block_size, config.pool_capacity);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        info!("ic-proxy-server: setting up seg{},dbid{}", me.content_id, me.dbid);
        Ok(Self {
            source,
            config,
            proxy: Proxy::new(me, pool, addrs),
            conns: HashMap::new(),
            tcp: None,
            unix: None,
            events_tx,
            events_rx,
            control_tx,
            control_rx,
            forced: false,
        })
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            control: self.control_tx.clone(),
        }
    }

    /// Serves until quit, returning the process exit code: non-zero asks
    /// the supervisor for a restart.
    pub async fn run(mut self) -> Result<i32, ServerError> {
        let start = Instant::now() + self.config.timer_delay();
        let mut timer = time::interval_at(start, self.config.timer_period());
        let mut hup = signal(SignalKind::hangup())?;
        let mut term = signal(SignalKind::terminate())?;
        let mut quit = signal(SignalKind::quit())?;

        if !self.proxy.addresses().is_resolved() {
            let addrs = self.proxy.addresses().clone().resolve().await;
            self.proxy.set_addresses(addrs);
        }

        info!("ic-proxy-server: running");
        loop {
            // same-node deliveries queued during the previous turn
            if self.proxy.has_deferred() {
                self.proxy.run_deferred();
            }
            self.drain_effects();

            if self.forced || self.proxy.is_finished() {
                break;
            }

            tokio::select! {
                Some(event) = self.events_rx.recv() => self.on_event(event),
                Some(control) = self.control_rx.recv() => match control {
                    Control::Quit { relaunch } => self.quit(relaunch),
                    Control::Reload => self.reload(),
                },
                res = accept_tcp(&self.tcp) => self.on_peer_accept(res),
                res = accept_unix(&self.unix) => self.on_client_accept(res),
                _ = timer.tick(), if !self.proxy.is_quitting() => self.on_timer(),
                _ = hup.recv() => {
                    warn!("ic-proxy-server: received signal SIGHUP");
                    self.reload();
                }
                _ = term.recv() => {
                    warn!("ic-proxy-server: received signal SIGTERM");
                    self.quit(true);
                }
                _ = quit.recv() => {
                    warn!("ic-proxy-server: received signal SIGQUIT");
                    self.quit(true);
                }
                _ = future::ready(()), if self.proxy.has_deferred() => {}
            }
        }

        self.close_listeners();
        for (_, conn) in self.conns.drain() {
            conn.reader.abort();
        }

        let code = self.proxy.exit_code();
        info!("ic-proxy-server: closed with code {code}");
        Ok(code)
    }

    fn on_timer(&mut self) {
        self.ensure_listeners();
        self.proxy.maintain();
    }

    fn quit(&mut self, relaunch: bool) {
        if self.proxy.is_quitting() {
            warn!("ic-proxy-server: quit requested again, exiting now");
            self.forced = true;
            return;
        }

        self.close_listeners();
        self.proxy.quit(relaunch);
    }

    /// Re-reads the configuration. Host names are looked up off the driver
    /// task; the table is swapped in by [`Self::apply_reload`].
    fn reload(&mut self) {
        info!("ic-proxy-server: reloading the configuration");

        let config = match self.source.load() {
            Ok(config) => config,
            Err(e) => {
                warn!("ic-proxy-server: fail to reload, keeping the current one: {e}");
                return;
            }
        };
        let addrs = match config.address_table() {
            Ok(addrs) => addrs,
            Err(e) => {
                warn!("ic-proxy-server: fail to reload the addresses: {e}");
                return;
            }
        };

        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let addrs = addrs.resolve().await;
            let _ = events.send(Event::Reloaded(Box::new(config), addrs));
        });
    }

    fn apply_reload(&mut self, config: Config, addrs: AddressTable) {
        if config.dbid != self.config.dbid || config.content_id != self.config.content_id {
            warn!("ic-proxy-server: node identity cannot change on reload, ignored");
        }

        let dbid = self.config.dbid;
        let moved = self.proxy.addresses().my_port(dbid).ok() != addrs.my_port(dbid).ok();
        if moved {
            info!("ic-proxy-server: own port changed, re-listening");
            self.tcp = None;
        }
        if config.socket_path() != self.config.socket_path() {
            self.close_unix();
        }

        self.config.addresses = config.addresses;
        self.config.instance_port = config.instance_port;
        self.config.socket_dir = config.socket_dir;
        self.proxy.set_addresses(addrs);
        info!("ic-proxy-server: reloaded {} addresses", self.proxy.addresses().len());
        self.ensure_listeners();
    }

    fn ensure_listeners(&mut self) {
        if self.proxy.is_quitting() {
            return;
        }

        if self.tcp.is_none() {
            match self.bind_tcp() {
                Ok((listener, addr)) => {
                    info!("ic-proxy-server: setting up peer listener on {addr}");
                    self.tcp = Some(listener);
                }
                Err(e) => warn!("ic-proxy-server: peer listener is not up yet: {e}"),
            }
        }

        if self.unix.is_none() {
            match self.bind_unix() {
                Ok((listener, path)) => {
                    info!(
                        "ic-proxy-server: setting up client listener on {}",
                        path.display()
                    );
                    self.unix = Some(listener);
                }
                Err(e) => warn!("ic-proxy-server: client listener is not up yet: {e}"),
            }
        }
    }

    /// Listens on every interface at the port the table gives this node.
    fn bind_tcp(&self) -> Result<(TcpListener, SocketAddr), ServerError> {
        let dbid = self.config.dbid;
        let port = self.proxy.addresses().my_port(dbid)?;
        let ip: IpAddr = match self.proxy.addresses().addr_of(dbid) {
            Ok(addr) if addr.is_ipv6() => Ipv6Addr::UNSPECIFIED.into(),
            _ => Ipv4Addr::UNSPECIFIED.into(),
        };
        let addr = SocketAddr::new(ip, port);

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;

        Ok((socket.listen(BACKLOG)?, addr))
    }

    fn bind_unix(&self) -> Result<(UnixListener, PathBuf), ServerError> {
        let path = self.config.socket_path();
        match fs::remove_file(&path) {
            Ok(()) => debug!("ic-proxy-server: removed stale {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok((UnixListener::bind(&path)?, path))
    }

    fn close_listeners(&mut self) {
        if self.tcp.take().is_some() {
            info!("ic-proxy-server: closed peer listener");
        }
        self.close_unix();
    }

    fn close_unix(&mut self) {
        if self.unix.take().is_some() {
            let path = self.config.socket_path();
            if let Err(e) = fs::remove_file(&path) {
                debug!("ic-proxy-server: fail to remove {}: {e}", path.display());
            }
            info!("ic-proxy-server: closed client listener");
        }
    }

    fn on_peer_accept(&mut self, res: io::Result<TcpStream>) {
        let stream = match res {
            Ok(stream) => stream,
            Err(e) => {
                warn!("ic-proxy-server: fail to accept a peer: {e}");
                return;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!("ic-proxy-server: fail to set nodelay: {e}");
        }

        let token = self.proxy.on_peer_accepted();
        let (rd, wr) = stream.into_split();
        self.attach(token, Box::new(rd), Box::new(wr));
    }

    fn on_client_accept(&mut self, res: io::Result<UnixStream>) {
        let stream = match res {
            Ok(stream) => stream,
            Err(e) => {
                warn!("ic-proxy-server: fail to accept a client: {e}");
                return;
            }
        };

        let token = self.proxy.on_client_accepted();
        let (rd, wr) = stream.into_split();
        self.attach(token, Box::new(rd), Box::new(wr));
    }

    fn attach(&mut self, token: Token, rd: Reader, wr: Writer) {
        let (reads, read_rx) = mpsc::unbounded_channel();
        let (writes, write_rx) = mpsc::unbounded_channel();
        let block_size = self.proxy.pool().block_size();

        let reader = tokio::spawn(read_loop(token, rd, read_rx, self.events_tx.clone(), block_size));
        tokio::spawn(write_loop(token, wr, write_rx, self.events_tx.clone()));

        self.conns.insert(
            token,
            Conn {
                reads,
                writes,
                reading: false,
                armed: false,
                reader,
            },
        );
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Read(token, data) => {
                if let Some(conn) = self.conns.get_mut(&token) {
                    conn.armed = false;
                }
                self.proxy.on_read(token, &data);
                self.drain_effects();
                self.rearm(token);
            }
            Event::Eof(token, err) => {
                if let Some(conn) = self.conns.get_mut(&token) {
                    conn.armed = false;
                    conn.reading = false;
                }
                self.proxy.on_eof(token, err);
            }
            Event::Written(packet, completion, res) => {
                self.proxy.on_written(packet, completion, res);
            }
            Event::ShutdownDone(token, res) => self.proxy.on_shutdown(token, res),
            Event::Connected(token, res) => match res {
                Ok(stream) => {
                    let (rd, wr) = stream.into_split();
                    self.attach(token, Box::new(rd), Box::new(wr));
                    self.proxy.on_connected(token, Ok(()));
                }
                Err(e) => self.proxy.on_connected(token, Err(e)),
            },
            Event::Reloaded(config, addrs) => self.apply_reload(*config, addrs),
        }
    }

    fn rearm(&mut self, token: Token) {
        if let Some(conn) = self.conns.get_mut(&token) {
            if conn.reading && !conn.armed {
                conn.armed = true;
                let _ = conn.reads.send(ReadCmd::Start);
            }
        }
    }

    fn drain_effects(&mut self) {
        loop {
            let effects = self.proxy.take_effects();
            if effects.is_empty() {
                break;
            }
            for effect in effects {
                self.execute(effect);
            }
        }
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::Write {
                conn,
                packet,
                offset,
                completion,
            } => {
                let cmd = WriteCmd::Write {
                    packet,
                    offset,
                    completion,
                };
                let res = match self.conns.get(&conn) {
                    Some(c) => c.writes.send(cmd).map_err(|e| e.0),
                    None => Err(cmd),
                };
                if let Err(WriteCmd::Write {
                    packet, completion, ..
                }) = res
                {
                    self.proxy
                        .on_written(packet, completion, Err(io::ErrorKind::NotConnected.into()));
                }
            }
            Effect::StartRead(token) => {
                if let Some(conn) = self.conns.get_mut(&token) {
                    conn.reading = true;
                }
                self.rearm(token);
            }
            Effect::StopRead(token) => {
                if let Some(conn) = self.conns.get_mut(&token) {
                    conn.reading = false;
                    if conn.armed {
                        conn.armed = false;
                        let _ = conn.reads.send(ReadCmd::Stop);
                    }
                }
            }
            Effect::Shutdown(token) => {
                let sent = self
                    .conns
                    .get(&token)
                    .is_some_and(|c| c.writes.send(WriteCmd::Shutdown).is_ok());
                if !sent {
                    self.proxy
                        .on_shutdown(token, Err(io::ErrorKind::NotConnected.into()));
                }
            }
            Effect::Close(token) => {
                // dropping the write channel lets queued writes finish
                if let Some(conn) = self.conns.remove(&token) {
                    conn.reader.abort();
                }
            }
            Effect::Connect { conn, addr } => {
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    let res = match TcpStream::connect(addr).await {
                        Ok(stream) => stream.set_nodelay(true).map(|()| stream),
                        Err(e) => Err(e),
                    };
                    let _ = events.send(Event::Connected(conn, res));
                });
            }
        }
    }
}

async fn accept_tcp(listener: &Option<TcpListener>) -> io::Result<TcpStream> {
    match listener {
        Some(listener) => listener.accept().await.map(|(stream, _)| stream),
        None => future::pending().await,
    }
}

async fn accept_unix(listener: &Option<UnixListener>) -> io::Result<UnixStream> {
    match listener {
        Some(listener) => listener.accept().await.map(|(stream, _)| stream),
        None => future::pending().await,
    }
}

async fn read_loop(
    token: Token,
    mut rd: Reader,
    mut cmds: UnboundedReceiver<ReadCmd>,
    events: UnboundedSender<Event>,
    size: usize,
) {
    let mut buf = vec![0; size];

    loop {
        match cmds.recv().await {
            Some(ReadCmd::Start) => {}
            Some(ReadCmd::Stop) => continue,
            None => return,
        }

        let res = loop {
            tokio::select! {
                biased;
                cmd = cmds.recv() => match cmd {
                    Some(ReadCmd::Stop) => break None,
                    Some(ReadCmd::Start) => continue,
                    None => return,
                },
                res = rd.read(&mut buf) => match res {
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    res => break Some(res),
                },
            }
        };

        let event = match res {
            None => continue,
            Some(Ok(0)) => Event::Eof(token, None),
            Some(Ok(n)) => Event::Read(token, buf[..n].to_vec()),
            Some(Err(e)) => Event::Eof(token, Some(e)),
        };

        let done = matches!(event, Event::Eof(..));
        if events.send(event).is_err() || done {
            return;
        }
    }
}

async fn write_loop(
    token: Token,
    mut wr: Writer,
    mut cmds: UnboundedReceiver<WriteCmd>,
    events: UnboundedSender<Event>,
) {
    while let Some(cmd) = cmds.recv().await {
        let event = match cmd {
            WriteCmd::Write {
                packet,
                offset,
                completion,
            } => {
                let res = wr.write_all(&packet.as_bytes()[offset..]).await;
                Event::Written(packet, completion, res)
            }
            WriteCmd::Shutdown => Event::ShutdownDone(token, wr.shutdown().await),
        };

        if events.send(event).is_err() {
            error!("ic-proxy-server: driver is gone, dropping {token}");
            return;
        }
    }
}
