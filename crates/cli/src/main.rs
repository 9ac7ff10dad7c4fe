mod config;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use config::Config;
use tuya_rtsp::{Server, ServerConfig};

#[derive(Parser)]
#[command(
    name = "tuya-rtsp-server",
    about = "RTSP server bridging Tuya WebRTC cameras"
)]
struct Args {
    /// RTSP listen port
    #[arg(long, short, default_value_t = 8554)]
    port: u16,

    /// Path to the JSON config (session, signaling, cameras)
    #[arg(long, short)]
    config: PathBuf,

    /// Seconds to keep a stream alive after its last client leaves
    #[arg(long, default_value_t = 5)]
    shutdown_delay: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };
    let (inventory, cloud) = config.into_collaborators();

    let server = Server::new(
        ServerConfig {
            port: args.port,
            shutdown_delay: Duration::from_secs(args.shutdown_delay),
            ..Default::default()
        },
        inventory,
        cloud,
    );

    if let Err(e) = server.start().await {
        eprintln!("Failed to start server: {e}");
        std::process::exit(1);
    }

    println!("RTSP server on port {} — Ctrl-C to stop", args.port);
    let _ = tokio::signal::ctrl_c().await;

    server.stop().await;
}
