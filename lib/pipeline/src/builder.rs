use crate::error::PipelineError;
use crate::pull_buffer::PullBuffer;
use crate::push_buffer::BufferReader;
use crate::receiver::{StageItem, StageReceiver, StageSender, stage_channel};
use crate::traits::Stage;
use futures::future::BoxFuture;
use futures::{FutureExt, Stream};
use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Output buffer of closure stages and combinators.
pub(crate) const DEFAULT_STAGE_BUFFER: usize = 1;

tokio::task_local! {
    /// Cancellation token of the run whose stage is currently executing.
    /// Pipelines started inside a stage derive their token from it.
    static CURRENT_RUN: CancellationToken;
}

type FinallyFn = Box<dyn FnOnce(RunOutcome) -> BoxFuture<'static, anyhow::Result<()>> + Send>;
type ErrorHandler = Box<dyn FnMut(anyhow::Error) -> BoxFuture<'static, anyhow::Result<()>> + Send>;
type PrefixStage<S> = Box<dyn FnOnce(StageReceiver<S>, &mut Wiring) -> StageReceiver<S> + Send>;
type Chain<S, T> = Box<dyn FnOnce(StageReceiver<S>, &mut Wiring) -> StageReceiver<T> + Send>;

/// Lifecycle of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Errored,
    Finalizing,
    Finalized,
}

/// How a run ended; passed to `on_finally` callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
    Errored,
}

impl From<RunOutcome> for PipelineState {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Completed => PipelineState::Completed,
            RunOutcome::Cancelled => PipelineState::Cancelled,
            RunOutcome::Errored => PipelineState::Errored,
        }
    }
}

/// Spawned tasks of one run. Dropping it cancels the run.
pub(crate) struct Wiring {
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Wiring {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            tasks: Vec::new(),
        }
    }

    /// Spawns a task producing into a fresh channel; returns the channel's receiving end.
    pub(crate) fn spawn_source<T, F, Fut>(
        &mut self,
        name: &'static str,
        buffer: usize,
        body: F,
    ) -> StageReceiver<T>
    where
        T: Send + 'static,
        F: FnOnce(StageSender<T>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (output, receiver) = stage_channel(buffer, self.cancel.clone());
        let cancel = self.cancel.clone();
        let task = async move {
            let errors = output.clone();
            tracing::debug!(stage = name, "stage started");
            match body(output).await {
                Ok(()) => tracing::debug!(stage = name, "stage finished"),
                Err(err) if PipelineError::is_cancellation(&err) || cancel.is_cancelled() => {
                    tracing::debug!(stage = name, "stage cancelled")
                }
                Err(err) => {
                    tracing::debug!(stage = name, error = %err, "stage failed");
                    // Only fails if the run got cancelled meanwhile; the error is moot then.
                    let _ = errors.send_error(err).await;
                }
            }
        };
        let handle = tokio::spawn(CURRENT_RUN.scope(self.cancel.clone(), task));
        self.tasks.push((name, handle));
        receiver
    }

    /// Spawns a stage reading `input`; returns the stage's output receiver.
    pub(crate) fn spawn_stage<A, B, F, Fut>(
        &mut self,
        name: &'static str,
        buffer: usize,
        input: StageReceiver<A>,
        body: F,
    ) -> StageReceiver<B>
    where
        A: Send + 'static,
        B: Send + 'static,
        F: FnOnce(StageReceiver<A>, StageSender<B>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.spawn_source(name, buffer, move |output| body(input, output))
    }

    /// Cancels the run and waits for every task to unwind.
    /// Returns an error if any stage panicked.
    async fn shutdown(mut self) -> Option<anyhow::Error> {
        self.cancel.cancel();
        let mut first_panic = None;
        for (stage, handle) in std::mem::take(&mut self.tasks) {
            if let Err(err) = handle.await {
                if err.is_panic() {
                    tracing::error!(stage, "stage panicked");
                    first_panic.get_or_insert(PipelineError::StagePanicked { stage }.into());
                }
            }
        }
        first_panic
    }
}

impl Drop for Wiring {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Run<T> {
    output: StageReceiver<T>,
    wiring: Wiring,
}

/// Where a run takes its items from.
enum Source<S> {
    /// Pumped by a spawned task.
    Pull(PullBuffer<S>),
    /// Read directly by the first stage (or the consumer).
    Push(BufferReader<S>),
}

enum Plan<T, S> {
    Pending {
        source: Source<S>,
        prefix: Vec<PrefixStage<S>>,
        chain: Chain<S, T>,
    },
    Running(Run<T>),
    Done,
    /// The pipeline was extended after its run started.
    Invalid,
}

/// A chain of stages over an asynchronous source.
///
/// `T` is the type of items produced by the last stage, `S` the type of source items.
/// Nothing runs until the first call to [`next`](Self::next); every stage is then spawned
/// as a task connected to its neighbours by bounded channels.
///
/// Example:
/// ```ignore
/// let mut pipeline = Pipeline::from_items([1, 2, 3, 4, 5])
///     .map(|v, _| Ok(v * 2))
///     .map(|v, _| Ok(v - 1))
///     .on_finally(|_| async { Ok(()) });
/// assert_eq!(pipeline.collect().await?, [1, 3, 5, 7, 9]);
/// ```
pub struct Pipeline<T, S = T> {
    plan: Plan<T, S>,
    state: PipelineState,
    finally: Vec<FinallyFn>,
    on_error: Option<ErrorHandler>,
}

impl<T: Send + 'static> Pipeline<T, T> {
    /// Creates a pipeline over a fallible stream.
    pub fn new<St>(source: St) -> Self
    where
        St: Stream<Item = StageItem<T>> + Send + 'static,
    {
        Self::from_pull_buffer(PullBuffer::new(source))
    }

    /// Creates a pipeline over a fixed list of items.
    pub fn from_items<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::new(futures::stream::iter(items.into_iter().map(Ok)))
    }

    /// Creates a pipeline over a configured pull adapter.
    pub fn from_pull_buffer(source: PullBuffer<T>) -> Self {
        Self::from_source(Source::Pull(source))
    }

    /// Creates a pipeline reading a push buffer in place: the buffer's capacity bounds
    /// the items accepted ahead of the first stage.
    pub fn from_push_buffer(reader: BufferReader<T>) -> Self {
        Self::from_source(Source::Push(reader))
    }

    fn from_source(source: Source<T>) -> Self {
        Self {
            plan: Plan::Pending {
                source,
                prefix: Vec::new(),
                chain: Box::new(|input, _| input),
            },
            state: PipelineState::Idle,
            finally: Vec::new(),
            on_error: None,
        }
    }
}

impl<T: Send + 'static, S: Send + 'static> Pipeline<T, S> {
    /// Appends a stage.
    pub fn pipe<St>(self, stage: St) -> Pipeline<St::Output, S>
    where
        St: Stage<Input = T>,
    {
        self.extend(St::NAME, St::OUTPUT_BUFFER_SIZE, move |input, output| async move {
            stage.run(input, output).await
        })
    }

    /// Appends a stage given as a closure over its input and output.
    pub fn pipe_fn<U, F, Fut>(self, name: &'static str, body: F) -> Pipeline<U, S>
    where
        U: Send + 'static,
        F: FnOnce(StageReceiver<T>, StageSender<U>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.extend(name, DEFAULT_STAGE_BUFFER, body)
    }

    /// Inserts a stage right after the source, before every previously added stage.
    /// The stage must map source items to source items.
    pub fn pipe_before<St>(self, stage: St) -> Self
    where
        St: Stage<Input = S, Output = S>,
    {
        self.insert_first(St::NAME, St::OUTPUT_BUFFER_SIZE, move |input, output| async move {
            stage.run(input, output).await
        })
    }

    /// Closure flavour of [`pipe_before`](Self::pipe_before).
    pub fn pipe_before_fn<F, Fut>(self, name: &'static str, body: F) -> Self
    where
        F: FnOnce(StageReceiver<S>, StageSender<S>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.insert_first(name, DEFAULT_STAGE_BUFFER, body)
    }

    /// Registers a cleanup callback, run exactly once when consumption ends for any reason.
    /// The consumer observes the end of the pipeline only after every callback settled.
    pub fn on_finally<F, Fut>(mut self, callback: F) -> Self
    where
        F: FnOnce(RunOutcome) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.finally
            .push(Box::new(move |outcome| callback(outcome).boxed()));
        self
    }

    /// Sets the handler for errors reaching the end of the chain.
    ///
    /// Returning `Ok(())` swallows the error and iteration continues with the next
    /// upstream item; returning an error ends iteration with it.
    /// A later call replaces the handler.
    pub fn on_error<F>(self, mut handler: F) -> Self
    where
        F: FnMut(anyhow::Error) -> anyhow::Result<()> + Send + 'static,
    {
        self.on_error_async(move |err| futures::future::ready(handler(err)))
    }

    /// Async flavour of [`on_error`](Self::on_error); iteration waits for the handler.
    pub fn on_error_async<F, Fut>(mut self, mut handler: F) -> Self
    where
        F: FnMut(anyhow::Error) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_error = Some(Box::new(move |err| handler(err).boxed()));
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub(crate) fn extend<U, F, Fut>(
        mut self,
        name: &'static str,
        buffer: usize,
        body: F,
    ) -> Pipeline<U, S>
    where
        U: Send + 'static,
        F: FnOnce(StageReceiver<T>, StageSender<U>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let plan = match std::mem::replace(&mut self.plan, Plan::Done) {
            Plan::Pending {
                source,
                prefix,
                chain,
            } => Plan::Pending {
                source,
                prefix,
                chain: Box::new(move |input, wiring| {
                    let input = chain(input, wiring);
                    wiring.spawn_stage(name, buffer, input, body)
                }),
            },
            _ => {
                tracing::warn!(stage = name, "stage added to a pipeline that already started");
                Plan::Invalid
            }
        };
        Pipeline {
            plan,
            state: PipelineState::Idle,
            finally: std::mem::take(&mut self.finally),
            on_error: self.on_error.take(),
        }
    }

    fn insert_first<F, Fut>(mut self, name: &'static str, buffer: usize, body: F) -> Self
    where
        F: FnOnce(StageReceiver<S>, StageSender<S>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        match &mut self.plan {
            Plan::Pending { prefix, .. } => {
                prefix.insert(
                    0,
                    Box::new(move |input, wiring| wiring.spawn_stage(name, buffer, input, body)),
                );
                self
            }
            _ => {
                tracing::warn!(stage = name, "stage added to a pipeline that already started");
                self.extend(name, buffer, |_: StageReceiver<T>, _: StageSender<T>| async {
                    Ok(())
                })
            }
        }
    }

    fn start(&mut self) -> Result<(), PipelineError> {
        let Plan::Pending {
            source,
            prefix,
            chain,
        } = std::mem::replace(&mut self.plan, Plan::Done)
        else {
            return Err(PipelineError::IllegalState(
                "pipeline was extended after its run started",
            ));
        };

        let cancel = CURRENT_RUN
            .try_with(CancellationToken::child_token)
            .unwrap_or_default();
        let mut wiring = Wiring::new(cancel);
        let mut input = match source {
            Source::Pull(source) => source.spawn_with(&mut wiring),
            Source::Push(reader) => StageReceiver::from_buffer(reader, wiring.cancel.clone()),
        };
        for stage in prefix {
            input = stage(input, &mut wiring);
        }
        let output = chain(input, &mut wiring);
        tracing::debug!(stages = wiring.tasks.len(), "pipeline started");

        self.plan = Plan::Running(Run { output, wiring });
        self.state = PipelineState::Running;
        Ok(())
    }

    /// Pulls the next item, starting the run on first call.
    ///
    /// Returns `None` after normal completion (or cancellation of an enclosing run) and
    /// `Some(Err(_))` for the first unrecovered error. Either way the run is finalized before
    /// this returns. Calling it again afterwards yields [`PipelineError::IllegalState`].
    pub async fn next(&mut self) -> Option<StageItem<T>> {
        match self.state {
            PipelineState::Idle => {
                if let Err(err) = self.start() {
                    return self
                        .finalize(RunOutcome::Errored, Some(err.into()))
                        .await
                        .err()
                        .map(Err);
                }
            }
            PipelineState::Running => {}
            _ => {
                return Some(Err(
                    PipelineError::IllegalState("pipeline already finalized").into()
                ));
            }
        }

        loop {
            let item = match &mut self.plan {
                Plan::Running(run) => run.output.recv().await,
                _ => None,
            };
            match item {
                Some(Ok(item)) => return Some(Ok(item)),
                Some(Err(err)) => {
                    let err = match self.on_error.as_mut() {
                        Some(handler) => match handler(err).await {
                            Ok(()) => {
                                tracing::debug!("error swallowed by on_error handler");
                                continue;
                            }
                            Err(err) => err,
                        },
                        None => err,
                    };
                    return self
                        .finalize(RunOutcome::Errored, Some(err))
                        .await
                        .err()
                        .map(Err);
                }
                None => {
                    let outcome = match &self.plan {
                        Plan::Running(run) if run.wiring.cancel.is_cancelled() => {
                            RunOutcome::Cancelled
                        }
                        _ => RunOutcome::Completed,
                    };
                    return self.finalize(outcome, None).await.err().map(Err);
                }
            }
        }
    }

    /// Drains the pipeline into a list, failing on the first unrecovered error.
    pub async fn collect(&mut self) -> anyhow::Result<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }

    /// Stops consumption early: cancels every stage, waits for them to unwind and runs the
    /// `on_finally` callbacks. A no-op on an already finalized pipeline.
    pub async fn close(&mut self) -> anyhow::Result<()> {
        match self.state {
            PipelineState::Idle | PipelineState::Running => {
                self.finalize(RunOutcome::Cancelled, None).await
            }
            _ => Ok(()),
        }
    }

    /// Converts the pipeline into a `Stream`; the stream ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = StageItem<T>> + Send + 'static {
        futures::stream::unfold(Some(self), |pipeline| async move {
            let mut pipeline = pipeline?;
            let item = pipeline.next().await?;
            let keep_going = item.is_ok();
            Some((item, keep_going.then_some(pipeline)))
        })
    }

    async fn finalize(
        &mut self,
        mut outcome: RunOutcome,
        mut pending: Option<anyhow::Error>,
    ) -> anyhow::Result<()> {
        self.state = outcome.into();
        if let Plan::Running(run) = std::mem::replace(&mut self.plan, Plan::Done) {
            drop(run.output);
            if let Some(panic) = run.wiring.shutdown().await {
                outcome = RunOutcome::Errored;
                pending.get_or_insert(panic);
            }
        }

        self.state = PipelineState::Finalizing;
        let mut finally_error: Option<anyhow::Error> = None;
        for callback in std::mem::take(&mut self.finally) {
            if let Err(err) = callback(outcome).await {
                if finally_error.is_some() {
                    tracing::warn!(error = %err, "additional on_finally callback failed");
                } else {
                    finally_error = Some(err);
                }
            }
        }
        self.state = PipelineState::Finalized;
        tracing::debug!(?outcome, "pipeline finalized");

        match (finally_error, pending) {
            (None, None) => Ok(()),
            (None, Some(err)) | (Some(err), None) => Err(err),
            (Some(finally_error), Some(pending)) => Err(PipelineError::Finalization {
                message: format!("{finally_error:#}"),
                pending: pending.into(),
            }
            .into()),
        }
    }
}

impl<T, S> Drop for Pipeline<T, S> {
    fn drop(&mut self) {
        let Plan::Running(run) = std::mem::replace(&mut self.plan, Plan::Done) else {
            return;
        };
        drop(run.output);
        let wiring = run.wiring;
        wiring.cancel.cancel();
        let callbacks = std::mem::take(&mut self.finally);
        tracing::warn!("pipeline dropped while running, finalizing in background");

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        runtime.spawn(async move {
            let _ = wiring.shutdown().await;
            for callback in callbacks {
                if let Err(err) = callback(RunOutcome::Cancelled).await {
                    tracing::warn!(error = %err, "on_finally callback failed");
                }
            }
        });
    }
}
