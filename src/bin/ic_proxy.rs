use std::{error::Error, path::PathBuf, process};

use clap::Parser;
use ic_proxy::{ConfigSource, Overrides, Server};
use log::info;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// YAML configuration file; the command line wins over it
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Physical instance id of this node
    #[arg(long)]
    dbid: Option<u16>,
    /// Logical shard id of this node, -1 for the coordinator
    #[arg(long, allow_hyphen_values = true)]
    content_id: Option<i16>,
    /// Comma separated `dbid:contentId:host:port` entries
    #[arg(long)]
    addresses: Option<String>,
    /// Port naming the backend socket
    #[arg(long)]
    instance_port: Option<u16>,
    /// Directory of the backend socket
    #[arg(long)]
    socket_dir: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let source = ConfigSource {
        path: cli.config,
        overrides: Overrides {
            dbid: cli.dbid,
            content_id: cli.content_id,
            addresses: cli.addresses,
            instance_port: cli.instance_port,
            socket_dir: cli.socket_dir,
        },
    };

    let server = Server::new(source)?;
    let handle = server.handle();
    ctrlc::set_handler(move || handle.quit(true))?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let code = runtime.block_on(server.run())?;

    info!("ic-proxy: exiting with code {code}");
    process::exit(code);
}
