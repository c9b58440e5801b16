//! Entry point for the replica node: parse args, load and validate the
//! config, bring the node up, and tear it down on the first termination
//! signal.

use clap::Parser;
use tokio::signal;

/// Command line arguments for the node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short = 'c', long = "config", default_value_t = String::from("./config/config.toml"))]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();
    replica::config::RuntimeConfig::from_toml(&args.config)
        .ok_or("configuration rejected, refusing to start")?;

    replica::server::instance().lock().await.start().await;

    // Park until asked to stop, then kill the raft node so the background
    // loops drain before the process exits.
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = signal::ctrl_c() => log::info!("ctrl-c received, shutting down"),
            _ = sigterm.recv() => log::info!("SIGTERM received, shutting down"),
        }
    }
    #[cfg(not(unix))]
    signal::ctrl_c().await?;

    replica::server::instance().lock().await.stop();
    Ok(())
}
