//! Plays one backend of a flow against a running proxy.
//!
//! ```text
//! ic_proxy_cli --local 0:2:100 --remote 1:3:200 send < input
//! ic_proxy_cli --local 1:3:200 --remote 0:2:100 recv > output
//! ```
use std::{
    error::Error,
    io::{self, Read, Write},
    path::PathBuf,
};

use clap::{Parser, Subcommand};
use ic_proxy::{
    backend::{self, DEFAULT_FRAME_SIZE, Retry},
    config,
    packet::{Endpoint, Key},
};
use log::info;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Directory of the proxy socket
    #[arg(long, default_value = "/tmp")]
    socket_dir: PathBuf,
    /// Port naming the proxy socket
    #[arg(long)]
    instance_port: u16,
    #[arg(long, default_value_t = 1)]
    session: i32,
    #[arg(long, default_value_t = 1)]
    command: u32,
    #[arg(long, default_value_t = 1, allow_hyphen_values = true)]
    send_slice: i16,
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    recv_slice: i16,
    /// This backend as `contentId:dbid:pid`
    #[arg(long, value_parser = parse_endpoint, allow_hyphen_values = true)]
    local: Endpoint,
    /// The other backend as `contentId:dbid:pid`
    #[arg(long, value_parser = parse_endpoint, allow_hyphen_values = true)]
    remote: Endpoint,
    #[command(subcommand)]
    action: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Sends stdin to the remote backend
    Send,
    /// Writes what the remote backend sends to stdout
    Recv,
}

fn parse_endpoint(value: &str) -> Result<Endpoint, String> {
    let parts: Vec<&str> = value.split(':').collect();
    let [content_id, dbid, pid] = parts.as_slice() else {
        return Err(format!("expected contentId:dbid:pid, got '{value}'"));
    };

    Ok(Endpoint::new(
        content_id.parse().map_err(|e| format!("bad contentId: {e}"))?,
        dbid.parse().map_err(|e| format!("bad dbid: {e}"))?,
        pid.parse().map_err(|e| format!("bad pid: {e}"))?,
    ))
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let key = Key {
        session_id: cli.session,
        command_id: cli.command,
        send_slice: cli.send_slice,
        recv_slice: cli.recv_slice,
        local: cli.local,
        remote: cli.remote,
    };
    let path = config::socket_path(&cli.socket_dir, cli.instance_port);

    let mut conn = backend::connect(&path, key, DEFAULT_FRAME_SIZE, Retry::default())?;
    info!("ic-proxy-cli: registered {key}");

    match cli.action {
        Action::Send => {
            let mut input = Vec::new();
            io::stdin().lock().read_to_end(&mut input)?;
            conn.send(&input)?;
            conn.shutdown()?;

            // the flow is over once the remote end said BYE
            let rest = conn.recv_all()?;
            info!("ic-proxy-cli: sent {} bytes, received {}", input.len(), rest.len());
        }
        Action::Recv => {
            let mut stdout = io::stdout().lock();
            while let Some(body) = conn.recv()? {
                stdout.write_all(&body)?;
            }
            stdout.flush()?;
            conn.shutdown()?;
        }
    }

    Ok(())
}
