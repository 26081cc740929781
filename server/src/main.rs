use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use server::config::Config;
use server::http::ControlPlane;
use server::quic;
use server::registry::Registry;
use server::tls::TlsMaterial;
use server::world::DefaultWorld;

/// Command line arguments; anything given here overrides the config file.
#[derive(Parser, Debug)]
#[command(author, version, about = "Lockstep game session server")]
struct Args {
    /// Host address to bind to
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port shared by the HTTPS listener (TCP) and the QUIC endpoint (UDP)
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory holding config.toml and the TLS material
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Warning: RUST_LOG not set, logs are suppressed. Try RUST_LOG=info.");
    }

    let args = Args::parse();
    let mut config = Config::load(&args.data_dir)?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.http_port = port;
    }

    // quinn and tokio-rustls share one process-wide crypto provider.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let tls = TlsMaterial::load_or_generate(&args.data_dir.join("tls"), &config.server.host)?;
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.http_port).parse()?;

    info!("starting lockstep server on {}", addr);
    info!(
        "frame interval {:?}, max {} clients/room, max {} rooms",
        config.lockstep.frame_interval(),
        config.lockstep.max_clients_per_room,
        config.server.max_room_number
    );
    info!("certificate hash: {}", tls.cert_hash_hex());

    let registry = Registry::new(config.clone(), DefaultWorld::factory());

    let quic_config = tls.quic_server_config()?;
    {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            if let Err(e) = quic::serve(addr, quic_config, registry).await {
                error!("quic endpoint failed: {}", e);
            }
        });
    }

    let listener = TcpListener::bind(addr).await?;
    let acceptor = TlsAcceptor::from(tls.http_server_config()?);
    let control = ControlPlane::new(Arc::clone(&registry), tls.cert_hash_hex());

    let result = control.serve(listener, acceptor).await;
    registry.destroy_all();
    result?;
    Ok(())
}
