use crate::builder::Wiring;
use crate::receiver::{StageItem, StageReceiver, StageSender, stage_channel};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use std::future::Future;
use tokio_util::sync::CancellationToken;

type ReleaseFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Adapts an asynchronous source into stage input.
///
/// A pump task drives the source and keeps at most `look_ahead` items buffered ahead of
/// the consumer. Once the consumer stops early, the source is dropped and the `on_release`
/// hook (if any) runs exactly once. A source error is forwarded after every item produced
/// before it and ends the pump.
pub struct PullBuffer<T> {
    source: BoxStream<'static, StageItem<T>>,
    look_ahead: usize,
    on_release: Option<ReleaseFn>,
}

impl<T: Send + 'static> PullBuffer<T> {
    pub fn new<St>(source: St) -> Self
    where
        St: Stream<Item = StageItem<T>> + Send + 'static,
    {
        Self {
            source: source.boxed(),
            look_ahead: 1,
            on_release: None,
        }
    }

    /// Number of items fetched ahead of the consumer. Clamped to at least 1.
    pub fn with_look_ahead(mut self, look_ahead: usize) -> Self {
        self.look_ahead = look_ahead.max(1);
        self
    }

    /// Hook run when the consumer terminates early, after the source was dropped.
    pub fn on_release<F, Fut>(mut self, release: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_release = Some(Box::new(move || release().boxed()));
        self
    }

    /// Starts pumping the source. Dropping the returned receiver releases the source.
    pub fn spawn(self) -> StageReceiver<T> {
        let (output, receiver) = stage_channel(self.look_ahead, CancellationToken::new());
        tokio::spawn(self.pump(output));
        receiver.cancel_on_drop()
    }

    pub(crate) fn spawn_with(self, wiring: &mut Wiring) -> StageReceiver<T> {
        wiring.spawn_source("source", self.look_ahead, move |output| async move {
            self.pump(output).await;
            Ok(())
        })
    }

    async fn pump(self, output: StageSender<T>) {
        let Self {
            mut source,
            on_release,
            ..
        } = self;

        let exhausted = loop {
            let next = tokio::select! {
                biased;
                _ = output.cancelled() => break false,
                next = source.next() => next,
            };
            match next {
                None => break true,
                Some(Err(err)) => {
                    tracing::debug!(error = %err, "pull source failed");
                    let _ = output.send_error(err).await;
                    break true;
                }
                Some(Ok(item)) => {
                    if output.send(item).await.is_err() {
                        break false;
                    }
                }
            }
        };

        if !exhausted {
            drop(source);
            if let Some(release) = on_release {
                tracing::debug!("pull source released early");
                release().await;
            }
        }
    }
}
