use tokio::net::TcpListener;
use tokio::sync::mpsc;

use logwatchd::collector::{Collector, INGEST_CHANNEL_CAPACITY};
use logwatchd::config::Config;
use logwatchd::{manager, session};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;
    tokio::fs::create_dir_all(&config.state_dir).await?;

    let collector = Collector::bind(config.udp_addr).await?;
    let (ingest_tx, ingest_rx) = mpsc::channel(INGEST_CHANNEL_CAPACITY);
    tokio::spawn(collector.run(ingest_tx));

    let (manager_handle, manager_join) = manager::spawn(config.state_dir.clone(), ingest_rx);

    let listener = TcpListener::bind(config.tcp_addr).await?;
    tracing::info!(addr = %config.tcp_addr, "control listener up");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let manager_handle = manager_handle.clone();
                tokio::spawn(session::run(stream, peer, manager_handle));
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received shutdown signal");
                break;
            }
        }
    }

    drop(manager_handle);
    let _ = manager_join.await;
    Ok(())
}
