//! Streamline Pipeline Framework
//!
//! This crate provides building blocks for staged, cancellable async pipelines over
//! unbounded sequences of items.
//!
//! # Core Concepts
//!
//! - **Pipeline**: a source plus an ordered chain of stages, consumed with `next()`
//! - **Stage**: a task transforming its input channel into its output channel
//! - **PushBuffer / PullBuffer**: adapters turning pushed items or foreign streams into a source
//! - **PushPipeline**: a pipeline fed through `push`/`end`/`pull`
//! - **KeyedQueue**: runs async jobs one at a time per key

pub mod builder;
mod combinators;
pub mod error;
pub mod keyed_queue;
pub mod pull_buffer;
pub mod push_buffer;
pub mod push_pipeline;
pub mod receiver;
pub mod traits;

#[cfg(test)]
mod tests;

pub use builder::{Pipeline, PipelineState, RunOutcome};
pub use error::{PipelineError, PipelineResult};
pub use keyed_queue::{KeyedQueue, KeyedQueueError};
pub use pull_buffer::PullBuffer;
pub use push_buffer::{BufferReader, PushBuffer, push_buffer, unbounded_push_buffer};
pub use push_pipeline::{Producer, PushPipeline};
pub use receiver::{StageItem, StageReceiver, StageSender};
pub use traits::Stage;
