//! Tester binary serving the echo service.
//!
//! Commands are read from stdin and replies written to stdout unless
//! `--listen` names a TCP address, in which case the first controller to
//! connect is served. Logs go to stderr.

mod cli;

use std::{io, net::SocketAddr};

use btpwire::{config::TesterConfig, echo::EchoService, error::TesterError, runtime::Tester};
use clap::Parser;
use tokio::{net::TcpListener, runtime::Handle};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), TesterError> {
    tracing_subscriber::fmt().with_writer(io::stderr).init();

    let cli = cli::Cli::parse();
    let config = TesterConfig::new(cli.pool_slots, cli.mtu)?;
    if let Some(addr) = cli.metrics {
        install_metrics(addr)?;
    }

    let tester = Tester::builder()
        .config(config)
        .service(EchoService::new(Handle::current()))
        .build();

    match cli.listen {
        Some(addr) => {
            let listener = TcpListener::bind(addr).await?;
            info!(%addr, "waiting for controller");
            let (stream, peer) = listener.accept().await?;
            info!(%peer, "controller connected");
            let (reader, writer) = stream.into_split();
            tester.serve(reader, writer).await
        }
        None => tester.serve(tokio::io::stdin(), tokio::io::stdout()).await,
    }
}

#[cfg(feature = "metrics")]
fn install_metrics(addr: SocketAddr) -> Result<(), TesterError> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(io::Error::other)?;
    info!(%addr, "serving metrics");
    Ok(())
}

#[cfg(not(feature = "metrics"))]
#[expect(
    clippy::unnecessary_wraps,
    reason = "matches the signature of the metrics-enabled build"
)]
fn install_metrics(addr: SocketAddr) -> Result<(), TesterError> {
    tracing::warn!(%addr, "built without metrics support; ignoring --metrics");
    Ok(())
}
