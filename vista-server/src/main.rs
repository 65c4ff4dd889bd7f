//! Vista server: entry point.
//!
//! ```text
//! vista-server                  Run in the foreground
//! vista-server --config <path>  Load a custom config TOML
//! vista-server --gen-config     Write default config to stdout
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vista_core::{ChannelTransport, StreamService, Transport, ZstdEncoder};
use vista_server::config::ServerConfig;
use vista_server::driver::DriverLauncher;
use vista_server::service::StreamServer;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "vista-server", about = "Vista remote page streaming server")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "vista-server.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&ServerConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    // Load config, then let the environment override it.
    let mut config = ServerConfig::load(&cli.config);
    config.apply_env();

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let stream_config = config.to_stream_config();
    info!("vista-server v{}", env!("CARGO_PKG_VERSION"));
    info!("listen address: {}", config.network.listen_addr);
    info!("render driver: {}", config.driver.addr);
    info!("max sessions: {}", stream_config.max_sessions);
    info!("idle timeout: {:?}", stream_config.idle_timeout);

    let transport = Arc::new(ChannelTransport::new(config.network.outbound_queue));
    let launcher = DriverLauncher::new(
        config.driver.addr.clone(),
        config.driver_connect_timeout(),
        config.driver_io_timeout(),
    );
    let service = Arc::new(StreamService::new(
        stream_config,
        Arc::new(launcher),
        Arc::new(ZstdEncoder::new(config.quality.encoder_level)),
        Arc::clone(&transport) as Arc<dyn Transport>,
    ));

    let cancel = CancellationToken::new();
    let sweeper = service.spawn_sweeper(cancel.child_token());

    // Ctrl-C handler.
    let stop = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.cancel();
    });

    let listener = TcpListener::bind(config.listen_addr()?).await?;
    let server = Arc::new(StreamServer::new(Arc::clone(&service), transport));
    server.run(listener, cancel.clone()).await?;

    cancel.cancel();
    let _ = sweeper.await;
    let closed = service.shutdown().await;
    info!(closed, "vista-server stopped");

    Ok(())
}
