use std::{error::Error, net::IpAddr, sync::mpsc};

use clap::Parser;
use gml_server::{
    Config, Server,
    config::{DEFAULT_HEADER_LEN, DEFAULT_PORT},
};
use log::info;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Interface to listen on
    #[arg(short, long, default_value = "0.0.0.0")]
    address: IpAddr,
    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Bytes of packet header preceding the protocol tag
    #[arg(long, default_value_t = DEFAULT_HEADER_LEN)]
    header_len: usize,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = Config {
        address: cli.address,
        port: cli.port,
        header_len: cli.header_len,
        ..Config::default()
    };

    let server = Server::bind(config)?;
    server.open()?;
    server.start_processing_requests()?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;
    rx.recv()?;

    info!("shutting down");
    server.close();
    Ok(())
}
