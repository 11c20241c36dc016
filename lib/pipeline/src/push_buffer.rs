use crate::error::PipelineError;
use crate::receiver::StageItem;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

/// Creates a push buffer holding at most `capacity` unread items (at least 1).
pub fn push_buffer<T>(capacity: usize) -> (PushBuffer<T>, BufferReader<T>) {
    with_space(Some(Semaphore::new(capacity.max(1))))
}

/// Creates a push buffer that never blocks its producer.
pub fn unbounded_push_buffer<T>() -> (PushBuffer<T>, BufferReader<T>) {
    with_space(None)
}

fn with_space<T>(space: Option<Semaphore>) -> (PushBuffer<T>, BufferReader<T>) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(Queue {
            items: VecDeque::new(),
            end: None,
        }),
        item_ready: Notify::new(),
        space,
        destroyed: CancellationToken::new(),
    });
    (
        PushBuffer {
            shared: shared.clone(),
        },
        BufferReader { shared },
    )
}

enum End {
    Ok,
    Error(anyhow::Error),
}

struct Queue<T> {
    items: VecDeque<T>,
    end: Option<End>,
}

struct Shared<T> {
    queue: Mutex<Queue<T>>,
    item_ready: Notify,
    // `None` for unbounded buffers. One permit per free slot.
    space: Option<Semaphore>,
    destroyed: CancellationToken,
}

/// Producer side of a push buffer.
///
/// Items are read in the exact order they were pushed. While the buffer is full, `push`
/// waits for the reader to take an item.
pub struct PushBuffer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> PushBuffer<T> {
    /// Appends an item, waiting for space in a bounded buffer.
    ///
    /// Returns `Ok(false)` if the reader is gone and the item was discarded.
    /// Pushing after [`end`](Self::end) is an error.
    pub async fn push(&self, item: T) -> Result<bool, PipelineError> {
        self.check_open()?;
        if let Some(space) = &self.shared.space {
            tokio::select! {
                biased;
                _ = self.shared.destroyed.cancelled() => return Ok(false),
                permit = space.acquire() => match permit {
                    // The permit is handed back by the reader once the item is taken.
                    Ok(permit) => permit.forget(),
                    Err(_) => return Ok(false),
                },
            }
        }

        {
            let mut queue = self.shared.queue.lock();
            if queue.end.is_some() {
                // `end` raced with this push while waiting for space.
                drop(queue);
                self.release_slot();
                return Err(PipelineError::IllegalState("push after end"));
            }
            if self.shared.destroyed.is_cancelled() {
                return Ok(false);
            }
            queue.items.push_back(item);
        }
        self.shared.item_ready.notify_one();
        Ok(true)
    }

    /// Marks the end of input. Items already pushed are still delivered. Ending twice is a no-op.
    pub fn end(&self) {
        self.finish(End::Ok);
    }

    /// Ends input with an error, delivered to the reader after every pushed item.
    pub fn end_with_error(&self, err: anyhow::Error) {
        self.finish(End::Error(err));
    }

    /// Returns `true` once [`end`](Self::end) was called.
    pub fn is_ended(&self) -> bool {
        self.shared.queue.lock().end.is_some()
    }

    /// Completes once the reader is gone.
    pub async fn destroyed(&self) {
        self.shared.destroyed.cancelled().await
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.is_cancelled()
    }

    pub(crate) fn handle(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }

    fn check_open(&self) -> Result<(), PipelineError> {
        if self.shared.queue.lock().end.is_some() {
            Err(PipelineError::IllegalState("push after end"))
        } else {
            Ok(())
        }
    }

    fn release_slot(&self) {
        if let Some(space) = &self.shared.space {
            space.add_permits(1);
        }
    }

    fn finish(&self, end: End) {
        {
            let mut queue = self.shared.queue.lock();
            if queue.end.is_some() {
                return;
            }
            queue.end = Some(end);
        }
        self.shared.item_ready.notify_one();
    }
}

impl<T> std::fmt::Debug for PushBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushBuffer")
            .field("ended", &self.is_ended())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// Consumer side of a push buffer. Dropping it destroys the buffer.
pub struct BufferReader<T> {
    shared: Arc<Shared<T>>,
}

impl<T> BufferReader<T> {
    /// Takes the next item, waiting until one is pushed or input ends.
    ///
    /// Returns `None` after a normal end and `Some(Err(_))` once for an error end.
    pub async fn next(&mut self) -> Option<StageItem<T>> {
        loop {
            // Register interest before inspecting the queue so a push in between is not missed.
            let notified = self.shared.item_ready.notified();
            {
                let mut queue = self.shared.queue.lock();
                if let Some(item) = queue.items.pop_front() {
                    drop(queue);
                    if let Some(space) = &self.shared.space {
                        space.add_permits(1);
                    }
                    return Some(Ok(item));
                }
                match queue.end.take() {
                    Some(End::Error(err)) => {
                        queue.end = Some(End::Ok);
                        return Some(Err(err));
                    }
                    Some(End::Ok) => {
                        queue.end = Some(End::Ok);
                        return None;
                    }
                    None => {}
                }
                if self.shared.destroyed.is_cancelled() {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Number of unread items.
    pub fn len(&self) -> usize {
        self.shared.queue.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discards unread items and unblocks the producer. Later pushes are dropped.
    pub fn destroy(&mut self) {
        if self.shared.destroyed.is_cancelled() {
            return;
        }
        self.shared.destroyed.cancel();
        self.shared.queue.lock().items.clear();
        if let Some(space) = &self.shared.space {
            space.close();
        }
        self.shared.item_ready.notify_one();
    }
}

impl<T> std::fmt::Debug for BufferReader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferReader")
            .field("unread", &self.len())
            .field("destroyed", &self.shared.destroyed.is_cancelled())
            .finish()
    }
}

impl<T> Drop for BufferReader<T> {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn delivers_items_in_push_order() {
        let (buffer, mut reader) = unbounded_push_buffer();
        for i in 0..5 {
            assert!(buffer.push(i).await.unwrap());
        }
        buffer.end();

        let mut seen = Vec::new();
        while let Some(item) = reader.next().await {
            seen.push(item.unwrap());
        }
        assert_eq!(seen, [0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn push_waits_for_space() {
        let (buffer, mut reader) = push_buffer(2);
        buffer.push(1).await.unwrap();
        buffer.push(2).await.unwrap();

        let blocked = timeout(Duration::from_millis(50), buffer.push(3)).await;
        assert!(blocked.is_err(), "third push should wait for the reader");

        assert_eq!(reader.next().await.unwrap().unwrap(), 1);
        let pushed = timeout(Duration::from_secs(1), buffer.push(3)).await;
        assert!(pushed.unwrap().unwrap());
        assert_eq!(reader.len(), 2);
    }

    #[tokio::test]
    async fn end_with_error_is_delivered_after_items() {
        let (buffer, mut reader) = unbounded_push_buffer();
        buffer.push("a").await.unwrap();
        buffer.end_with_error(anyhow::anyhow!("boom"));
        // The first end wins.
        buffer.end();

        assert_eq!(reader.next().await.unwrap().unwrap(), "a");
        let err = reader.next().await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn push_after_end_fails() {
        let (buffer, _reader) = unbounded_push_buffer();
        buffer.end();
        let err = buffer.push(1).await.unwrap_err();
        assert!(matches!(err, PipelineError::IllegalState(_)));
    }

    #[tokio::test]
    async fn destroy_unblocks_waiting_producer() {
        let (buffer, reader) = push_buffer(1);
        buffer.push(1).await.unwrap();

        let producer = tokio::spawn(async move {
            let accepted = buffer.push(2).await.unwrap();
            (accepted, buffer)
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(reader);

        let (accepted, buffer) = timeout(Duration::from_secs(1), producer)
            .await
            .unwrap()
            .unwrap();
        assert!(!accepted);
        assert!(buffer.is_destroyed());
        assert!(!buffer.push(3).await.unwrap());
    }

    #[tokio::test]
    async fn reader_wakes_up_on_push() {
        let (buffer, mut reader) = unbounded_push_buffer();
        let consumer = tokio::spawn(async move { reader.next().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.push(7).await.unwrap();

        let item = timeout(Duration::from_secs(1), consumer).await.unwrap().unwrap();
        assert_eq!(item.unwrap().unwrap(), 7);
    }
}
