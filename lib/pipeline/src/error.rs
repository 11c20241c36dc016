use std::error::Error as StdError;

/// Errors raised by the pipeline machinery itself.
///
/// Errors produced by sources, stages and callbacks travel as [`anyhow::Error`] and are
/// delivered to the consumer unchanged; this enum only covers the engine's own failure
/// modes.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Operation on a structure that already reached a terminal state
    /// (push after end, iterating a finalized pipeline, extending a started one).
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    /// The run was cancelled. Used to unwind stages; never delivered to the consumer.
    #[error("pipeline run was cancelled")]
    Cancelled,

    /// A stage task panicked.
    #[error("stage `{stage}` panicked")]
    StagePanicked { stage: &'static str },

    /// An `on_finally` callback failed while another error was already pending.
    /// The pending error is available through [`std::error::Error::source`].
    #[error("pipeline finalization failed: {message}")]
    Finalization {
        message: String,
        #[source]
        pending: Box<dyn StdError + Send + Sync + 'static>,
    },
}

impl PipelineError {
    /// Returns `true` if `err` is the internal cancellation signal.
    pub fn is_cancellation(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Cancelled)
        )
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
