use anyhow::Context;
use streamline_bin::config::Config;
use streamline_bin::run;
use streamline_tracing::Tracer;
use tokio::io::BufReader;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    // =========== load configs ===========
    let config = Config::load()?;

    // =========== init tracing ===========
    Tracer::new(config.log.format, config.log.use_color).init();
    tracing::info!(?config, "Loaded config");

    // =========== init interruption handling ===========
    let stop = CancellationToken::new();
    let signals = stop.clone();
    tokio::spawn(async move {
        if let Err(err) = handle_termination(signals).await {
            tracing::error!("signal handling failed: {err:#}");
        }
    });

    // =========== run ===========
    let input = BufReader::with_capacity(config.general.input_buffer_capacity, tokio::io::stdin());
    let mut output = tokio::io::stdout();
    let published = run(config, input, &mut output, stop).await?;
    tracing::info!(published, "Input exhausted, exiting");
    // A blocking stdin read left behind by a stop signal would hang runtime shutdown.
    std::process::exit(0)
}

async fn handle_termination(stop: CancellationToken) -> anyhow::Result<()> {
    // sigint is sent on Ctrl+C
    let mut sigint =
        signal(SignalKind::interrupt()).context("failed to register interrupt signal handler")?;

    // sigterm is sent on `kill <pid>`
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to register terminate signal handler")?;
    tokio::select! {
        _ = sigint.recv() => tracing::info!("Received SIGINT, ending input"),
        _ = sigterm.recv() => tracing::info!("Received SIGTERM, ending input"),
    }
    stop.cancel();
    Ok(())
}
