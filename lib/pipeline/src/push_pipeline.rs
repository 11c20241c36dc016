use crate::builder::{Pipeline, PipelineState, RunOutcome};
use crate::error::PipelineError;
use crate::push_buffer::{PushBuffer, push_buffer, unbounded_push_buffer};
use crate::receiver::{StageItem, StageReceiver, StageSender};
use crate::traits::Stage;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::OnceLock;
use tokio::sync::mpsc;

enum PullCommand<T> {
    Source(BoxStream<'static, StageItem<T>>),
    End,
    EndWithError(anyhow::Error),
}

/// A pipeline fed imperatively instead of by a source stream.
///
/// `In` is the type of pushed items, `T` the type of items leaving the last stage.
/// The producing half can be split off with [`split`](Self::split) and moved to another task.
pub struct PushPipeline<In, T = In> {
    producer: Producer<In>,
    pipeline: Pipeline<T, In>,
}

impl<In: Send + 'static> PushPipeline<In, In> {
    /// Creates a push pipeline buffering at most `capacity` pushed items ahead of its
    /// first stage. Every added stage holds up to its own output buffer on top of that.
    pub fn new(capacity: usize) -> Self {
        let (buffer, reader) = push_buffer(capacity);
        Self::from_buffer(buffer, Pipeline::from_push_buffer(reader))
    }

    /// Creates a push pipeline whose `push` never waits.
    pub fn unbounded() -> Self {
        let (buffer, reader) = unbounded_push_buffer();
        Self::from_buffer(buffer, Pipeline::from_push_buffer(reader))
    }

    fn from_buffer(buffer: PushBuffer<In>, pipeline: Pipeline<In, In>) -> Self {
        Self {
            producer: Producer {
                buffer,
                ended: Mutex::new(false),
                puller: OnceLock::new(),
            },
            pipeline,
        }
    }
}

impl<In: Send + 'static, T: Send + 'static> PushPipeline<In, T> {
    /// Separates the producing half from the consuming pipeline.
    pub fn split(self) -> (Producer<In>, Pipeline<T, In>) {
        (self.producer, self.pipeline)
    }

    /// Applies an arbitrary builder transformation to the consuming pipeline.
    pub fn then<U: Send + 'static>(
        self,
        f: impl FnOnce(Pipeline<T, In>) -> Pipeline<U, In>,
    ) -> PushPipeline<In, U> {
        PushPipeline {
            producer: self.producer,
            pipeline: f(self.pipeline),
        }
    }

    pub fn pipe<St: Stage<Input = T>>(self, stage: St) -> PushPipeline<In, St::Output> {
        self.then(|p| p.pipe(stage))
    }

    pub fn pipe_fn<U, F, Fut>(self, name: &'static str, body: F) -> PushPipeline<In, U>
    where
        U: Send + 'static,
        F: FnOnce(StageReceiver<T>, StageSender<U>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.then(|p| p.pipe_fn(name, body))
    }

    pub fn map<U, F>(self, f: F) -> PushPipeline<In, U>
    where
        U: Send + 'static,
        F: FnMut(T, usize) -> anyhow::Result<U> + Send + 'static,
    {
        self.then(|p| p.map(f))
    }

    pub fn map_async<U, F, Fut>(self, f: F) -> PushPipeline<In, U>
    where
        U: Send + 'static,
        F: FnMut(T, usize) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<U>> + Send + 'static,
    {
        self.then(|p| p.map_async(f))
    }

    pub fn on_finally<F, Fut>(self, callback: F) -> Self
    where
        F: FnOnce(RunOutcome) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.then(|p| p.on_finally(callback))
    }

    pub fn on_error<F>(self, handler: F) -> Self
    where
        F: FnMut(anyhow::Error) -> anyhow::Result<()> + Send + 'static,
    {
        self.then(|p| p.on_error(handler))
    }

    pub async fn push(&self, item: In) -> Result<bool, PipelineError> {
        self.producer.push(item).await
    }

    pub fn end(&self) {
        self.producer.end()
    }

    pub fn end_with_error(&self, err: anyhow::Error) {
        self.producer.end_with_error(err)
    }

    pub fn pull<St>(&self, source: St) -> Result<(), PipelineError>
    where
        St: Stream<Item = StageItem<In>> + Send + 'static,
    {
        self.producer.pull(source)
    }

    pub async fn next(&mut self) -> Option<StageItem<T>> {
        self.pipeline.next().await
    }

    pub async fn collect(&mut self) -> anyhow::Result<Vec<T>> {
        self.pipeline.collect().await
    }

    pub async fn close(&mut self) -> anyhow::Result<()> {
        self.pipeline.close().await
    }

    pub fn state(&self) -> PipelineState {
        self.pipeline.state()
    }

    pub fn into_stream(self) -> impl Stream<Item = StageItem<T>> + Send + 'static {
        self.pipeline.into_stream()
    }
}

/// Producing half of a [`PushPipeline`].
pub struct Producer<In> {
    buffer: PushBuffer<In>,
    // Set by the first `end`, which may still be queued behind pulled sources.
    ended: Mutex<bool>,
    // Spawned by the first `pull`; later pulls and a deferred `end` are queued behind it.
    puller: OnceLock<mpsc::UnboundedSender<PullCommand<In>>>,
}

impl<In: Send + 'static> Producer<In> {
    /// Pushes one item, waiting while the buffer is full.
    ///
    /// Returns `Ok(false)` if the consumer is gone. Pushing after `end` is an error.
    pub async fn push(&self, item: In) -> Result<bool, PipelineError> {
        if *self.ended.lock() {
            return Err(PipelineError::IllegalState("push after end"));
        }
        self.buffer.push(item).await
    }

    /// Ends input. If sources are still being pulled, input ends after the last of them.
    /// Only the first `end` or `end_with_error` counts.
    pub fn end(&self) {
        let mut ended = self.ended.lock();
        if std::mem::replace(&mut *ended, true) {
            return;
        }
        match self.puller.get() {
            Some(puller) => {
                if puller.send(PullCommand::End).is_err() {
                    self.buffer.end();
                }
            }
            None => self.buffer.end(),
        }
    }

    /// Ends input with an error, after every source pulled so far.
    pub fn end_with_error(&self, err: anyhow::Error) {
        let mut ended = self.ended.lock();
        if std::mem::replace(&mut *ended, true) {
            return;
        }
        match self.puller.get() {
            Some(puller) => {
                if let Err(mpsc::error::SendError(PullCommand::EndWithError(err))) =
                    puller.send(PullCommand::EndWithError(err))
                {
                    self.buffer.end_with_error(err);
                }
            }
            None => self.buffer.end_with_error(err),
        }
    }

    /// Feeds every item of `source` into the pipeline. Sources are drained one after another
    /// in the order they were pulled. A source error ends input with that error.
    pub fn pull<St>(&self, source: St) -> Result<(), PipelineError>
    where
        St: Stream<Item = StageItem<In>> + Send + 'static,
    {
        // Held until the source is queued, so a concurrent `end` cannot slip in between.
        let ended = self.ended.lock();
        if *ended || self.buffer.is_ended() {
            return Err(PipelineError::IllegalState("pull after end"));
        }
        let puller = self.puller.get_or_init(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(drain_sources(self.buffer.handle(), rx));
            tx
        });
        puller
            .send(PullCommand::Source(source.boxed()))
            .map_err(|_| PipelineError::IllegalState("pull after end"))
    }

    pub async fn closed(&self) {
        self.buffer.destroyed().await
    }

    pub fn is_closed(&self) -> bool {
        self.buffer.is_destroyed()
    }
}

async fn drain_sources<In: Send + 'static>(
    buffer: PushBuffer<In>,
    mut commands: mpsc::UnboundedReceiver<PullCommand<In>>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            PullCommand::End => {
                buffer.end();
                return;
            }
            PullCommand::EndWithError(err) => {
                buffer.end_with_error(err);
                return;
            }
            PullCommand::Source(mut source) => loop {
                let next = tokio::select! {
                    biased;
                    _ = buffer.destroyed() => return,
                    next = source.next() => next,
                };
                match next {
                    None => break,
                    Some(Ok(item)) => match buffer.push(item).await {
                        Ok(true) => {}
                        Ok(false) => return,
                        Err(err) => {
                            tracing::debug!(error = %err, "pulled source outlived input");
                            return;
                        }
                    },
                    Some(Err(err)) => {
                        buffer.end_with_error(err);
                        return;
                    }
                }
            },
        }
    }
}
