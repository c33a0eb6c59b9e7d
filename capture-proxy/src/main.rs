//! Capture Proxy Binary Entry Point

use capture_proxy::{init_logging, run_proxy, Args};
use clap::Parser;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let _guard = init_logging(&args.logging_config())?;

    tokio::select! {
        result = run_proxy(args) => {
            if let Err(e) = result {
                tracing::error!("Proxy server failed: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received, stopping proxy server...");
        }
    }

    Ok(())
}
