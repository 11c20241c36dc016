use crate::{
    Pipeline, PipelineError, PipelineState, PullBuffer, RunOutcome, Stage, StageReceiver,
    StageSender,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

struct Doubler;

#[async_trait]
impl Stage for Doubler {
    type Input = u32;
    type Output = u32;
    const NAME: &'static str = "doubler";
    const OUTPUT_BUFFER_SIZE: usize = 4;

    async fn run(
        self,
        mut input: StageReceiver<u32>,
        output: StageSender<u32>,
    ) -> anyhow::Result<()> {
        while let Some(value) = input.recv_item().await? {
            output.send(value * 2).await?;
        }
        Ok(())
    }
}

fn count_finally(
    counter: &Arc<AtomicUsize>,
) -> impl FnOnce(RunOutcome) -> futures::future::Ready<anyhow::Result<()>> + Send + 'static {
    let counter = counter.clone();
    move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        futures::future::ready(Ok(()))
    }
}

#[tokio::test]
async fn stage_then_map() {
    let finally = Arc::new(AtomicUsize::new(0));
    let mut pipeline = Pipeline::from_items([1u32, 2, 3, 4, 5])
        .pipe(Doubler)
        .map(|v, _| Ok(v - 1))
        .on_finally(count_finally(&finally));

    assert_eq!(pipeline.state(), PipelineState::Idle);
    let items = timeout(TEST_TIMEOUT, pipeline.collect()).await.unwrap().unwrap();
    assert_eq!(items, [1, 3, 5, 7, 9]);
    assert_eq!(finally.load(Ordering::SeqCst), 1);
    assert_eq!(pipeline.state(), PipelineState::Finalized);
}

#[tokio::test]
async fn stage_error_arrives_after_preceding_items() {
    let finally = Arc::new(AtomicUsize::new(0));
    let mut pipeline = Pipeline::from_items([1u32, 2, 3, 4, 5])
        .pipe_fn("fail_after_two", |mut input, output| async move {
            let mut seen = 0;
            while let Some(value) = input.recv_item().await? {
                output.send(value * 2 - 1).await?;
                seen += 1;
                if seen == 2 {
                    anyhow::bail!("stage failed after {seen} items");
                }
            }
            Ok(())
        })
        .on_finally(count_finally(&finally));

    assert_eq!(pipeline.next().await.unwrap().unwrap(), 1);
    assert_eq!(pipeline.next().await.unwrap().unwrap(), 3);
    let err = pipeline.next().await.unwrap().unwrap_err();
    assert_eq!(err.to_string(), "stage failed after 2 items");
    assert_eq!(finally.load(Ordering::SeqCst), 1);

    let err = pipeline.next().await.unwrap().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::IllegalState(_))
    ));
    assert_eq!(finally.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn error_from_middle_stage_flows_through_later_stages() {
    let finally = Arc::new(AtomicUsize::new(0));
    let mut pipeline = Pipeline::from_items([1u32, 2, 3, 4, 5])
        .pipe_fn("double", |mut input, output| async move {
            while let Some(value) = input.recv_item().await? {
                output.send(value * 2).await?;
                if value == 2 {
                    anyhow::bail!("double failed after input {value}");
                }
            }
            Ok(())
        })
        .map(|v, _| Ok(v - 1))
        .on_finally(count_finally(&finally));

    let mut items = Vec::new();
    let err = loop {
        match timeout(TEST_TIMEOUT, pipeline.next()).await.unwrap() {
            Some(Ok(item)) => items.push(item),
            Some(Err(err)) => break err,
            None => panic!("pipeline ended without the stage error"),
        }
    };
    assert_eq!(items, [1, 3]);
    assert_eq!(err.to_string(), "double failed after input 2");
    assert_eq!(finally.load(Ordering::SeqCst), 1);
    assert_eq!(pipeline.state(), PipelineState::Finalized);
}

#[tokio::test]
async fn iteration_waits_for_async_error_handler() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let handler_log = log.clone();
    let mut pipeline = Pipeline::from_items(0u32..3)
        .map(|v, _| {
            if v == 1 {
                anyhow::bail!("bad item {v}");
            }
            Ok(v)
        })
        .on_error_async(move |err| {
            let log = handler_log.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                log.lock().push(format!("handled {err}"));
                Ok(())
            }
        });

    while let Some(item) = timeout(TEST_TIMEOUT, pipeline.next()).await.unwrap() {
        log.lock().push(format!("item {}", item.unwrap()));
    }
    assert_eq!(*log.lock(), ["item 0", "handled bad item 1", "item 2"]);
}

#[tokio::test]
async fn swallowed_errors_skip_only_the_failing_item() {
    let errors = Arc::new(AtomicUsize::new(0));
    let errors_seen = errors.clone();
    let mut pipeline = Pipeline::from_items(0u32..9)
        .for_each(|_, index| {
            if index == 2 {
                anyhow::bail!("bad item at {index}");
            }
            Ok(())
        })
        .on_error(move |err| {
            assert_eq!(err.to_string(), "bad item at 2");
            errors_seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

    let items = timeout(TEST_TIMEOUT, pipeline.collect()).await.unwrap().unwrap();
    assert_eq!(items, [0, 1, 3, 4, 5, 6, 7, 8]);
    assert_eq!(errors.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn on_error_can_rethrow() {
    let mut pipeline = Pipeline::new(futures::stream::iter([
        Ok(1u32),
        Err(anyhow::anyhow!("source broke")),
        Ok(2),
    ]))
    .on_error_async(|err| async move { Err(err.context("rethrown")) });

    assert_eq!(pipeline.next().await.unwrap().unwrap(), 1);
    let err = pipeline.next().await.unwrap().unwrap_err();
    assert_eq!(format!("{err:#}"), "rethrown: source broke");
    assert_eq!(pipeline.state(), PipelineState::Finalized);
}

#[tokio::test]
async fn pipe_before_runs_right_after_source() {
    let mut pipeline = Pipeline::from_items([1u32, 2, 3])
        .map(|v, _| Ok(v.to_string()))
        .pipe_before_fn("add_one", |mut input, output| async move {
            while let Some(v) = input.recv_item().await? {
                output.send(v + 1).await?;
            }
            Ok(())
        })
        .pipe_before_fn("times_ten", |mut input, output| async move {
            while let Some(v) = input.recv_item().await? {
                output.send(v * 10).await?;
            }
            Ok(())
        });

    let items = timeout(TEST_TIMEOUT, pipeline.collect()).await.unwrap().unwrap();
    assert_eq!(items, ["11", "21", "31"]);
}

#[tokio::test]
async fn close_cancels_stages_and_releases_source() {
    let released = Arc::new(AtomicBool::new(false));
    let stage_cleaned_up = Arc::new(AtomicBool::new(false));
    let (outcome_tx, outcome_rx) = oneshot::channel();

    let source = PullBuffer::new(futures::stream::iter((0u32..).map(Ok))).on_release({
        let released = released.clone();
        move || async move { released.store(true, Ordering::SeqCst) }
    });
    let cleanup = stage_cleaned_up.clone();
    let mut pipeline = Pipeline::from_pull_buffer(source)
        .pipe_fn("passthrough", move |mut input, output| async move {
            while let Some(item) = input.recv().await {
                if output.send(item?).await.is_err() {
                    break;
                }
            }
            cleanup.store(true, Ordering::SeqCst);
            Ok(())
        })
        .on_finally(move |outcome| async move {
            let _ = outcome_tx.send(outcome);
            Ok(())
        });

    for expected in 0..3 {
        assert_eq!(pipeline.next().await.unwrap().unwrap(), expected);
    }
    timeout(TEST_TIMEOUT, pipeline.close()).await.unwrap().unwrap();

    assert!(released.load(Ordering::SeqCst));
    assert!(stage_cleaned_up.load(Ordering::SeqCst));
    assert_eq!(outcome_rx.await.unwrap(), RunOutcome::Cancelled);
    // Closing twice is a no-op.
    pipeline.close().await.unwrap();
}

#[tokio::test]
async fn dropping_running_pipeline_still_finalizes() {
    let (outcome_tx, outcome_rx) = oneshot::channel();
    let mut pipeline = Pipeline::from_items(0u32..).on_finally(move |outcome| async move {
        let _ = outcome_tx.send(outcome);
        Ok(())
    });
    assert_eq!(pipeline.next().await.unwrap().unwrap(), 0);
    drop(pipeline);

    let outcome = timeout(TEST_TIMEOUT, outcome_rx).await.unwrap().unwrap();
    assert_eq!(outcome, RunOutcome::Cancelled);
}

#[tokio::test]
async fn finalization_error_supersedes_pending_error() {
    let second_ran = Arc::new(AtomicBool::new(false));
    let second = second_ran.clone();
    let mut pipeline = Pipeline::new(futures::stream::iter([Err::<u32, _>(
        anyhow::anyhow!("source failed"),
    )]))
    .on_finally(|_| async { Err(anyhow::anyhow!("cleanup failed")) })
    .on_finally(move |_| async move {
        second.store(true, Ordering::SeqCst);
        Ok(())
    });

    let err = pipeline.next().await.unwrap().unwrap_err();
    assert!(second_ran.load(Ordering::SeqCst));
    let finalization = err.downcast_ref::<PipelineError>().unwrap();
    let PipelineError::Finalization { message, .. } = finalization else {
        panic!("unexpected error: {err:?}");
    };
    assert_eq!(message, "cleanup failed");
    let pending = std::error::Error::source(finalization).unwrap();
    assert_eq!(pending.to_string(), "source failed");
}

#[tokio::test]
async fn finally_error_without_pending_error_is_delivered() {
    let mut pipeline =
        Pipeline::from_items([1u32]).on_finally(|_| async { Err(anyhow::anyhow!("cleanup failed")) });
    assert_eq!(pipeline.next().await.unwrap().unwrap(), 1);
    let err = pipeline.next().await.unwrap().unwrap_err();
    assert_eq!(err.to_string(), "cleanup failed");
}

#[tokio::test]
async fn panicking_stage_surfaces_as_error() {
    let mut pipeline = Pipeline::from_items([1u32, 2]).map(|v, _| {
        if v == 2 {
            panic!("boom");
        }
        Ok(v)
    });

    assert_eq!(pipeline.next().await.unwrap().unwrap(), 1);
    let err = timeout(TEST_TIMEOUT, pipeline.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::StagePanicked { stage: "map" })
    ));
}

#[tokio::test]
async fn extending_started_pipeline_is_illegal() {
    let mut pipeline = Pipeline::from_items([1u32, 2]);
    assert_eq!(pipeline.next().await.unwrap().unwrap(), 1);

    let mut extended = pipeline.map(|v, _| Ok(v));
    let err = extended.next().await.unwrap().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::IllegalState(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nested_pipeline_finalizes_before_parent_stage_completes() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let stage_log = log.clone();
    let mut pipeline = Pipeline::from_items([1u32, 2])
        .pipe_fn("expand", move |mut input, output| async move {
            while let Some(value) = input.recv_item().await? {
                let child_log = stage_log.clone();
                let mut child = Pipeline::from_items([value, value * 10]).on_finally(
                    move |_| async move {
                        child_log.lock().push(format!("child {value} finalized"));
                        Ok(())
                    },
                );
                while let Some(item) = child.next().await {
                    output.send(item?).await?;
                }
                stage_log.lock().push(format!("parent done with {value}"));
            }
            Ok(())
        });

    let items = timeout(TEST_TIMEOUT, pipeline.collect()).await.unwrap().unwrap();
    assert_eq!(items, [1, 10, 2, 20]);
    assert_eq!(
        *log.lock(),
        [
            "child 1 finalized",
            "parent done with 1",
            "child 2 finalized",
            "parent done with 2"
        ]
    );
}

#[tokio::test]
async fn nested_pipeline_error_flows_through_parent() {
    let mut pipeline = Pipeline::from_items([1u32]).pipe_fn(
        "expand",
        |mut input, output: StageSender<u32>| async move {
            while let Some(value) = input.recv_item().await? {
                let mut child = Pipeline::from_items(value..value + 5).map(|v, index| {
                    if index == 3 {
                        anyhow::bail!("child failed at {v}");
                    }
                    Ok(v)
                });
                while let Some(item) = child.next().await {
                    output.send(item?).await?;
                }
            }
            Ok(())
        },
    );

    for expected in 1..=3 {
        assert_eq!(pipeline.next().await.unwrap().unwrap(), expected);
    }
    let err = pipeline.next().await.unwrap().unwrap_err();
    assert_eq!(err.to_string(), "child failed at 4");
}

#[tokio::test]
async fn nested_pipeline_inherits_cancellation() {
    let (outcome_tx, outcome_rx) = oneshot::channel();
    let mut pipeline = Pipeline::from_items([()]).pipe_fn(
        "endless_child",
        move |_input: StageReceiver<()>, output: StageSender<u32>| async move {
            let mut child = Pipeline::from_items(0u32..).on_finally(move |outcome| async move {
                let _ = outcome_tx.send(outcome);
                Ok(())
            });
            // Once the parent run is cancelled the child stops on its own.
            while let Some(item) = child.next().await {
                let _ = output.send(item?).await;
            }
            Ok(())
        },
    );

    assert_eq!(pipeline.next().await.unwrap().unwrap(), 0);
    timeout(TEST_TIMEOUT, pipeline.close()).await.unwrap().unwrap();
    let outcome = timeout(TEST_TIMEOUT, outcome_rx).await.unwrap().unwrap();
    assert_eq!(outcome, RunOutcome::Cancelled);
}

#[tokio::test]
async fn into_stream_stops_after_error() {
    use futures::StreamExt;

    let stream = Pipeline::new(futures::stream::iter([
        Ok(1u32),
        Err(anyhow::anyhow!("broken")),
        Ok(2),
    ]))
    .into_stream();
    let items: Vec<_> = stream.collect().await;
    assert_eq!(items.len(), 2);
    assert_eq!(*items[0].as_ref().unwrap(), 1);
    assert_eq!(items[1].as_ref().unwrap_err().to_string(), "broken");
}

#[tokio::test]
async fn pull_buffer_spawned_standalone() {
    let mut receiver = PullBuffer::new(futures::stream::iter([1u32, 2, 3].map(Ok)))
        .with_look_ahead(2)
        .spawn();
    let mut items = Vec::new();
    while let Some(item) = receiver.recv_item().await.unwrap() {
        items.push(item);
    }
    assert_eq!(items, [1, 2, 3]);
}
