use crate::receiver::{StageReceiver, StageSender};
use async_trait::async_trait;

/// A transform step of a pipeline.
/// Examples: message creation, decryption, ordering of resent messages.
///
/// Any state is confined to the `run()` method: a stage value is consumed by a single run.
/// Cleanup that must happen on every exit path belongs after the receive loop (or in a
/// guard owned by `run`); the loop ends when input is exhausted, on `?` errors, and when
/// the run is cancelled (`recv()` returns `None`, `send()` fails). Long awaits on other work
/// should go through [`StageSender::until_cancelled`] so an early stop is not held up.
#[async_trait]
pub trait Stage: Send + 'static {
    /// The type of items this stage receives
    type Input: Send + 'static;

    /// The type of items this stage produces
    type Output: Send + 'static;

    /// Human-readable name for logging
    const NAME: &'static str;

    /// Buffer size for the output channel
    const OUTPUT_BUFFER_SIZE: usize;

    /// Run the stage, receiving from input and sending to output.
    ///
    /// Returning an error ends the stage; the error is forwarded downstream after every
    /// item already sent.
    async fn run(
        self,
        input: StageReceiver<Self::Input>,
        output: StageSender<Self::Output>,
    ) -> anyhow::Result<()>;
}
