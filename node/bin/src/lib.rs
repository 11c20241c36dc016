pub mod config;

use crate::config::{Config, GeneralConfig};
use anyhow::Context;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use streamline_pipeline::Producer;
use streamline_publish::{FixedPartitions, MessageCreator, PublishRequest};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Publishes every line of `input` and writes the resulting messages to `output`,
/// one JSON document per line.
///
/// Lines holding valid JSON are published as that JSON value, other lines as a string.
/// Messages that cannot be created are logged and skipped. Cancelling `stop` ends the input;
/// lines read before that are still published. Returns the number of messages written.
pub async fn run<R, W>(
    config: Config,
    input: R,
    output: &mut W,
    stop: CancellationToken,
) -> anyhow::Result<usize>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let creator = Arc::new(MessageCreator::new(
        &config.publisher,
        Arc::new(FixedPartitions(config.general.partitions)),
    ));
    let (producer, pipeline) = creator
        .publish_pipeline(config.publisher.queue_buffer_size)
        .split();
    let mut pipeline = pipeline.on_error(|err| {
        tracing::warn!("skipping message: {err:#}");
        Ok(())
    });
    let reader = tokio::spawn(read_requests(input, producer, config.general, stop));

    let mut written = 0;
    while let Some(message) = pipeline.next().await {
        let line = serde_json::to_string(&message?)?;
        output.write_all(line.as_bytes()).await?;
        output.write_all(b"\n").await?;
        written += 1;
    }
    output.flush().await?;

    reader.await.context("input reader panicked")??;
    creator.stop();
    Ok(written)
}

async fn read_requests<R>(
    input: R,
    producer: Producer<PublishRequest>,
    general: GeneralConfig,
    stop: CancellationToken,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let res = loop {
        let line = tokio::select! {
            _ = stop.cancelled() => {
                tracing::info!("stop requested, ending input");
                break Ok(());
            }
            _ = producer.closed() => break Ok(()),
            line = lines.next_line() => line,
        };
        let line = match line.context("failed to read input") {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        };
        if line.trim().is_empty() {
            continue;
        }
        match producer.push(to_request(&general, line)).await {
            Ok(true) => {}
            Ok(false) => break Ok(()),
            Err(err) => break Err(err.into()),
        }
    };
    producer.end();
    res
}

fn to_request(general: &GeneralConfig, line: String) -> PublishRequest {
    let content = serde_json::from_str(&line).unwrap_or(serde_json::Value::String(line));
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as i64);
    PublishRequest {
        stream_id: general.stream_id.clone(),
        partition: None,
        partition_key: None,
        msg_chain_id: None,
        timestamp,
        content,
    }
}
