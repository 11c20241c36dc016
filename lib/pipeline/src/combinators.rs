//! Closure stages on top of [`Pipeline`].
//!
//! Every combinator keeps a per-stage index counting the items it received (errors are not
//! counted). Upstream errors pass through untouched; an error returned by the callback is sent
//! downstream in place of the item that caused it, and the stage keeps going. Async callbacks
//! are abandoned as soon as the run is cancelled.

use crate::builder::{DEFAULT_STAGE_BUFFER, Pipeline};
use std::future::Future;

impl<T: Send + 'static, S: Send + 'static> Pipeline<T, S> {
    /// Transforms every item.
    pub fn map<U, F>(self, mut f: F) -> Pipeline<U, S>
    where
        U: Send + 'static,
        F: FnMut(T, usize) -> anyhow::Result<U> + Send + 'static,
    {
        self.extend("map", DEFAULT_STAGE_BUFFER, move |mut input, output| async move {
            let mut index = 0;
            while let Some(item) = input.recv().await {
                let mapped = item.and_then(|item| {
                    let mapped = f(item, index);
                    index += 1;
                    mapped
                });
                output.deliver(mapped).await?;
            }
            Ok(())
        })
    }

    /// Transforms every item with an async callback; items are processed one at a time.
    pub fn map_async<U, F, Fut>(self, mut f: F) -> Pipeline<U, S>
    where
        U: Send + 'static,
        F: FnMut(T, usize) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<U>> + Send + 'static,
    {
        self.extend("map", DEFAULT_STAGE_BUFFER, move |mut input, output| async move {
            let mut index = 0;
            while let Some(item) = input.recv().await {
                let mapped = match item {
                    Ok(item) => {
                        let mapped = output.until_cancelled(f(item, index)).await?;
                        index += 1;
                        mapped
                    }
                    Err(err) => Err(err),
                };
                output.deliver(mapped).await?;
            }
            Ok(())
        })
    }

    /// Keeps the items the predicate accepts.
    pub fn filter<F>(self, mut predicate: F) -> Self
    where
        F: FnMut(&T, usize) -> anyhow::Result<bool> + Send + 'static,
    {
        self.extend("filter", DEFAULT_STAGE_BUFFER, move |mut input, output| async move {
            let mut index = 0;
            while let Some(item) = input.recv().await {
                let item = match item {
                    Ok(item) => {
                        let keep = predicate(&item, index);
                        index += 1;
                        match keep {
                            Ok(true) => Ok(item),
                            Ok(false) => continue,
                            Err(err) => Err(err),
                        }
                    }
                    Err(err) => Err(err),
                };
                output.deliver(item).await?;
            }
            Ok(())
        })
    }

    /// Keeps the items the async predicate accepts. The predicate gets its own copy of each item.
    pub fn filter_async<F, Fut>(self, mut predicate: F) -> Self
    where
        T: Clone,
        F: FnMut(T, usize) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        self.extend("filter", DEFAULT_STAGE_BUFFER, move |mut input, output| async move {
            let mut index = 0;
            while let Some(item) = input.recv().await {
                let item = match item {
                    Ok(item) => {
                        let keep = output.until_cancelled(predicate(item.clone(), index)).await?;
                        index += 1;
                        match keep {
                            Ok(true) => Ok(item),
                            Ok(false) => continue,
                            Err(err) => Err(err),
                        }
                    }
                    Err(err) => Err(err),
                };
                output.deliver(item).await?;
            }
            Ok(())
        })
    }

    /// Runs a side effect for every item and forwards the item unchanged.
    pub fn for_each<F>(self, mut f: F) -> Self
    where
        F: FnMut(&T, usize) -> anyhow::Result<()> + Send + 'static,
    {
        self.extend("for_each", DEFAULT_STAGE_BUFFER, move |mut input, output| async move {
            let mut index = 0;
            while let Some(item) = input.recv().await {
                let item = item.and_then(|item| {
                    let res = f(&item, index);
                    index += 1;
                    res.map(|()| item)
                });
                output.deliver(item).await?;
            }
            Ok(())
        })
    }

    /// Async flavour of [`for_each`](Self::for_each); the next item waits for the side effect.
    pub fn for_each_async<F, Fut>(self, mut f: F) -> Self
    where
        T: Clone,
        F: FnMut(T, usize) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.extend("for_each", DEFAULT_STAGE_BUFFER, move |mut input, output| async move {
            let mut index = 0;
            while let Some(item) = input.recv().await {
                let item = match item {
                    Ok(item) => {
                        let res = output.until_cancelled(f(item.clone(), index)).await?;
                        index += 1;
                        res.map(|()| item)
                    }
                    Err(err) => Err(err),
                };
                output.deliver(item).await?;
            }
            Ok(())
        })
    }

    /// Folds items into an accumulator, emitting the accumulator after every item.
    ///
    /// A failing step emits the error and leaves the accumulator unchanged.
    pub fn reduce<U, F>(self, init: U, mut f: F) -> Pipeline<U, S>
    where
        U: Clone + Send + 'static,
        F: FnMut(U, T, usize) -> anyhow::Result<U> + Send + 'static,
    {
        self.extend("reduce", DEFAULT_STAGE_BUFFER, move |mut input, output| async move {
            let mut acc = init;
            let mut index = 0;
            while let Some(item) = input.recv().await {
                let next = item.and_then(|item| {
                    let next = f(acc.clone(), item, index);
                    index += 1;
                    next
                });
                if let Ok(next) = &next {
                    acc = next.clone();
                }
                output.deliver(next).await?;
            }
            Ok(())
        })
    }

    /// Async flavour of [`reduce`](Self::reduce).
    pub fn reduce_async<U, F, Fut>(self, init: U, mut f: F) -> Pipeline<U, S>
    where
        U: Clone + Send + 'static,
        F: FnMut(U, T, usize) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<U>> + Send + 'static,
    {
        self.extend("reduce", DEFAULT_STAGE_BUFFER, move |mut input, output| async move {
            let mut acc = init;
            let mut index = 0;
            while let Some(item) = input.recv().await {
                let next = match item {
                    Ok(item) => {
                        let next = output.until_cancelled(f(acc.clone(), item, index)).await?;
                        index += 1;
                        next
                    }
                    Err(err) => Err(err),
                };
                if let Ok(next) = &next {
                    acc = next.clone();
                }
                output.deliver(next).await?;
            }
            Ok(())
        })
    }
}
