//! Bounded-concurrency mapping with per-item error isolation
//!
//! `parallel_map` is the only place the pipeline awaits many futures at once.
//! Workers pull indices from a shared cursor, so at most `concurrency`
//! invocations are in flight. Result slot `i` always corresponds to input
//! `i`; the progress callback fires in completion order, once per finished
//! item.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Options for `parallel_map`.
#[derive(Debug, Clone)]
pub struct ParallelOptions {
    /// Maximum invocations in flight.
    pub concurrency: usize,
    /// When true (default), an item's error is recorded in its slot and the
    /// remaining items still run. When false, the first error stops new items
    /// from starting; in-flight work may finish.
    pub continue_on_error: bool,
}

impl Default for ParallelOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            continue_on_error: true,
        }
    }
}

impl ParallelOptions {
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            ..Self::default()
        }
    }

    pub fn fail_fast(mut self) -> Self {
        self.continue_on_error = false;
        self
    }
}

/// Error record for one item.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ItemError {
    /// The mapped function returned an error; message preserved.
    #[error("{0}")]
    Failed(String),
    /// The run was cancelled (fail-fast mode) before this item started.
    #[error("cancelled before start")]
    Cancelled,
}

/// Map `f` over `items` with bounded concurrency.
///
/// Returns one result per input, in input order, regardless of completion
/// order. `on_progress(completed, total)` runs on the calling task after each
/// item finishes, in completion order.
pub async fn parallel_map<I, T, E, F, Fut>(
    items: Vec<I>,
    f: F,
    opts: ParallelOptions,
    mut on_progress: impl FnMut(usize, usize),
) -> Vec<Result<T, ItemError>>
where
    I: Send + 'static,
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
    F: Fn(I, usize) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<T, E>> + Send,
{
    let total = items.len();
    if total == 0 {
        return Vec::new();
    }

    let slots: Arc<Vec<Mutex<Option<I>>>> =
        Arc::new(items.into_iter().map(|i| Mutex::new(Some(i))).collect());
    let results: Arc<Mutex<Vec<Option<Result<T, ItemError>>>>> =
        Arc::new(Mutex::new((0..total).map(|_| None).collect()));
    let cursor = Arc::new(AtomicUsize::new(0));
    let cancelled = Arc::new(AtomicBool::new(false));
    let f = Arc::new(f);
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<()>();

    let mut workers = JoinSet::new();
    for _ in 0..opts.concurrency.max(1).min(total) {
        let slots = slots.clone();
        let results = results.clone();
        let cursor = cursor.clone();
        let cancelled = cancelled.clone();
        let f = f.clone();
        let done_tx = done_tx.clone();
        let continue_on_error = opts.continue_on_error;

        workers.spawn(async move {
            loop {
                if cancelled.load(Ordering::Acquire) {
                    break;
                }
                let index = cursor.fetch_add(1, Ordering::SeqCst);
                if index >= total {
                    break;
                }
                let item = lock(&slots[index])
                    .take()
                    .expect("cursor handed out the same index twice");
                let outcome = match f(item, index).await {
                    Ok(value) => Ok(value),
                    Err(e) => {
                        if !continue_on_error {
                            cancelled.store(true, Ordering::Release);
                        }
                        Err(ItemError::Failed(e.to_string()))
                    }
                };
                lock(&results)[index] = Some(outcome);
                let _ = done_tx.send(());
            }
        });
    }
    drop(done_tx);

    // Progress fires on the calling task, in completion order.
    let mut completed = 0usize;
    while done_rx.recv().await.is_some() {
        completed += 1;
        on_progress(completed, total);
    }
    while workers.join_next().await.is_some() {}

    let mut collected = lock(&results);
    collected
        .iter_mut()
        .map(|slot| slot.take().unwrap_or(Err(ItemError::Cancelled)))
        .collect()
}

/// Chunk `items` into batches of `batch_size`, then `parallel_map` over the
/// batches. The mapped function receives the batch and its batch index.
pub async fn parallel_batch<I, T, E, F, Fut>(
    items: Vec<I>,
    batch_size: usize,
    f: F,
    opts: ParallelOptions,
    on_progress: impl FnMut(usize, usize),
) -> Vec<Result<T, ItemError>>
where
    I: Send + 'static,
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
    F: Fn(Vec<I>, usize) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<T, E>> + Send,
{
    let batch_size = batch_size.max(1);
    let mut batches: Vec<Vec<I>> = Vec::new();
    let mut current = Vec::with_capacity(batch_size);
    for item in items {
        current.push(item);
        if current.len() == batch_size {
            batches.push(std::mem::replace(&mut current, Vec::with_capacity(batch_size)));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    parallel_map(batches, f, opts, on_progress).await
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::time::Duration;

    #[tokio::test]
    async fn results_keep_input_order_despite_random_completion() {
        let items: Vec<usize> = (0..20).collect();
        let results = parallel_map(
            items,
            |item, index| async move {
                let delay = rand::thread_rng().gen_range(0..20);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                assert_eq!(item, index);
                Ok::<_, std::convert::Infallible>(item * 10)
            },
            ParallelOptions::with_concurrency(8),
            |_, _| {},
        )
        .await;

        let values: Vec<usize> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, (0..20).map(|i| i * 10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn progress_fires_once_per_item_and_reaches_total() {
        let mut seen = Vec::new();
        parallel_map(
            (0..7).collect::<Vec<usize>>(),
            |_, _| async move { Ok::<_, std::convert::Infallible>(()) },
            ParallelOptions::with_concurrency(3),
            |completed, total| seen.push((completed, total)),
        )
        .await;

        assert_eq!(seen.len(), 7);
        // Completion counts are 1..=7 in order, total constant.
        assert_eq!(seen, (1..=7).map(|c| (c, 7)).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn one_failure_leaves_other_slots_valid() {
        let mut last = (0, 0);
        let results = parallel_map(
            (0..10).collect::<Vec<usize>>(),
            |item, _| async move {
                if item == 4 {
                    Err("injected failure".to_string())
                } else {
                    Ok(item)
                }
            },
            ParallelOptions::with_concurrency(4),
            |completed, total| last = (completed, total),
        )
        .await;

        assert_eq!(last, (10, 10));
        for (i, result) in results.iter().enumerate() {
            if i == 4 {
                let err = result.as_ref().unwrap_err();
                assert!(err.to_string().contains("injected failure"));
            } else {
                assert_eq!(*result.as_ref().unwrap(), i);
            }
        }
    }

    #[tokio::test]
    async fn fail_fast_stops_starting_new_items() {
        let started = Arc::new(AtomicUsize::new(0));
        let started_in_f = started.clone();
        let results = parallel_map(
            (0..100).collect::<Vec<usize>>(),
            move |item, _| {
                let started = started_in_f.clone();
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    if item == 0 {
                        Err("stop".to_string())
                    } else {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        Ok(item)
                    }
                }
            },
            ParallelOptions::with_concurrency(2).fail_fast(),
            |_, _| {},
        )
        .await;

        // Far fewer than 100 items ran; the rest are marked cancelled.
        assert!(started.load(Ordering::SeqCst) < 100);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(ItemError::Cancelled))));
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(ItemError::Failed(_)))));
    }

    #[tokio::test]
    async fn empty_input_returns_empty() {
        let results = parallel_map(
            Vec::<usize>::new(),
            |item, _| async move { Ok::<_, String>(item) },
            ParallelOptions::default(),
            |_, _| panic!("no progress expected"),
        )
        .await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn batches_chunk_then_map() {
        let results = parallel_batch(
            (0..7).collect::<Vec<usize>>(),
            3,
            |batch, batch_index| async move {
                Ok::<_, std::convert::Infallible>((batch_index, batch.len()))
            },
            ParallelOptions::default(),
            |_, _| {},
        )
        .await;

        let sizes: Vec<(usize, usize)> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(sizes, vec![(0, 3), (1, 3), (2, 1)]);
    }
}
