//! Bounded, order-preserving async map.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use futures::future::try_join_all;

/// Apply `f` to every item with at most `limit` calls in flight.
///
/// Workers pull the next index from a shared cursor and write into the slot
/// for that index, so the result order always equals the input order. The
/// first error ends the pool; in-flight calls are dropped and their results
/// discarded. Workers run inside the calling task.
pub async fn map_bounded<'a, T, R, E, F, Fut>(
    items: &'a [T],
    limit: usize,
    f: F,
) -> Result<Vec<R>, E>
where
    F: Fn(usize, &'a T) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    if items.is_empty() {
        return Ok(Vec::new());
    }
    let workers = limit.clamp(1, items.len());
    let cursor = AtomicUsize::new(0);
    let slots: Mutex<Vec<Option<R>>> = Mutex::new((0..items.len()).map(|_| None).collect());

    let (cursor_ref, slots_ref, f) = (&cursor, &slots, &f);
    try_join_all((0..workers).map(move |_| async move {
        loop {
            let index = cursor_ref.fetch_add(1, Ordering::Relaxed);
            let Some(item) = items.get(index) else {
                return Ok::<(), E>(());
            };
            let value = f(index, item).await?;
            slots_ref.lock().unwrap_or_else(PoisonError::into_inner)[index] = Some(value);
        }
    }))
    .await?;

    let slots = slots.into_inner().unwrap_or_else(PoisonError::into_inner);
    debug_assert!(slots.iter().all(Option::is_some));
    Ok(slots.into_iter().flatten().collect())
}
