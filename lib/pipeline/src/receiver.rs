use crate::error::PipelineError;
use crate::push_buffer::BufferReader;
use futures::Stream;
use std::future::Future;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Unit travelling between stages: an item or an error raised upstream.
///
/// Errors are carried in-band so they reach the consumer after every item that
/// preceded them.
pub type StageItem<T> = anyhow::Result<T>;

/// Creates the channel connecting a stage to its downstream neighbour.
pub(crate) fn stage_channel<T>(
    buffer: usize,
    cancel: CancellationToken,
) -> (StageSender<T>, StageReceiver<T>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (
        StageSender {
            tx,
            cancel: cancel.clone(),
        },
        StageReceiver::new(rx, cancel),
    )
}

/// Input side of a stage.
///
/// A wrapper around `tokio::sync::mpsc::Receiver` (or, for push pipelines, the push
/// buffer itself) that is aware of the run's cancellation token.
///
/// Semantics:
/// - `recv().await` delegates to the channel and yields items in arrival order.
/// - Once the run is cancelled, `recv()` returns `None`: cancellation looks like the end of
///   input, so stages unwind through their normal exit path.
#[derive(Debug)]
pub struct StageReceiver<T> {
    inbox: Inbox<T>,
    cancel: CancellationToken,
    // Set for standalone receivers: dropping the receiver cancels its producer.
    _guard: Option<DropGuard>,
}

#[derive(Debug)]
enum Inbox<T> {
    Channel(mpsc::Receiver<StageItem<T>>),
    // Read in place, so the buffer's capacity is the only slack between producer and stage.
    Buffer(BufferReader<T>),
}

impl<T> StageReceiver<T> {
    pub(crate) fn new(rx: mpsc::Receiver<StageItem<T>>, cancel: CancellationToken) -> Self {
        Self {
            inbox: Inbox::Channel(rx),
            cancel,
            _guard: None,
        }
    }

    pub(crate) fn from_buffer(reader: BufferReader<T>, cancel: CancellationToken) -> Self {
        Self {
            inbox: Inbox::Buffer(reader),
            cancel,
            _guard: None,
        }
    }

    /// Cancels the producing side when this receiver is dropped.
    pub(crate) fn cancel_on_drop(mut self) -> Self {
        self._guard = Some(self.cancel.clone().drop_guard());
        self
    }

    /// Receive the next item or upstream error, awaiting if necessary.
    /// Returns `None` when upstream is exhausted or the run was cancelled.
    pub async fn recv(&mut self) -> Option<StageItem<T>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let Self { inbox, cancel, .. } = self;
        let next = async move {
            match inbox {
                Inbox::Channel(rx) => rx.recv().await,
                Inbox::Buffer(reader) => reader.next().await,
            }
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            item = next => item,
        }
    }

    /// Like [`recv`](Self::recv), but surfaces an upstream error as `Err`.
    ///
    /// Handy for stages that should end on the first upstream failure:
    /// `while let Some(item) = input.recv_item().await? { ... }`.
    pub async fn recv_item(&mut self) -> anyhow::Result<Option<T>> {
        self.recv().await.transpose()
    }

    /// Returns `true` once the run this receiver belongs to was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes when the run is cancelled. Stages awaiting external work should
    /// `select!` on this to stay responsive to early termination.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Returns the number of items available without waiting.
    pub fn len(&self) -> usize {
        match &self.inbox {
            Inbox::Channel(rx) => rx.len(),
            Inbox::Buffer(reader) => reader.len(),
        }
    }

    /// Returns `true` if no item is available without waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Converts the receiver into a `Stream`, e.g. to feed a nested pipeline.
    pub fn into_stream(self) -> impl Stream<Item = StageItem<T>> + Send + 'static
    where
        T: Send + 'static,
    {
        futures::stream::unfold(self, |mut rx| async move {
            let item = rx.recv().await?;
            Some((item, rx))
        })
    }
}

/// Output side of a stage.
#[derive(Debug)]
pub struct StageSender<T> {
    tx: mpsc::Sender<StageItem<T>>,
    cancel: CancellationToken,
}

impl<T> Clone for StageSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<T> StageSender<T> {
    /// Sends an item downstream, waiting for buffer space.
    ///
    /// Fails with [`PipelineError::Cancelled`] once the run is cancelled or the
    /// downstream side is gone; stages should return that error with `?`.
    pub async fn send(&self, item: T) -> Result<(), PipelineError> {
        self.deliver(Ok(item)).await
    }

    /// Forwards an error downstream without ending the sending stage.
    pub async fn send_error(&self, err: anyhow::Error) -> Result<(), PipelineError> {
        self.deliver(Err(err)).await
    }

    pub(crate) async fn deliver(&self, item: StageItem<T>) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PipelineError::Cancelled),
            res = self.tx.send(item) => res.map_err(|_| PipelineError::Cancelled),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes when the run is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Drives `work` unless the run is cancelled first, in which case `work` is dropped
    /// and [`PipelineError::Cancelled`] is returned.
    pub async fn until_cancelled<F: Future>(&self, work: F) -> Result<F::Output, PipelineError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PipelineError::Cancelled),
            output = work => Ok(output),
        }
    }
}
