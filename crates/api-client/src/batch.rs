//! Bounded-concurrency batches
//!
//! Requests run in fixed-size groups: every request in a group is started
//! together and the next group starts once the whole group has settled.

use std::future::Future;

use futures_util::future::join_all;

use crate::error::ApiResult;

/// Outcome of one batched request, tagged with its input position.
#[derive(Debug)]
pub struct BatchItem<T> {
    pub index: usize,
    pub result: ApiResult<T>,
}

impl<T> BatchItem<T> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Run `run` over `items` in groups of `concurrency`.
///
/// Results come back in input order. With `fail_fast`, the first group
/// that contains a failure ends the batch and its first error is returned.
pub async fn run_batch<I, T, F, Fut>(
    items: Vec<I>,
    concurrency: usize,
    fail_fast: bool,
    run: F,
) -> ApiResult<Vec<BatchItem<T>>>
where
    F: Fn(I) -> Fut,
    Fut: Future<Output = ApiResult<T>>,
{
    let group_size = concurrency.max(1);
    let mut results = Vec::with_capacity(items.len());
    let mut items = items.into_iter().enumerate().peekable();

    while items.peek().is_some() {
        let group: Vec<_> = items.by_ref().take(group_size).collect();
        let settled = join_all(group.into_iter().map(|(index, item)| {
            let fut = run(item);
            async move {
                BatchItem {
                    index,
                    result: fut.await,
                }
            }
        }))
        .await;

        if fail_fast && let Some(failed) = settled.iter().find_map(|i| i.result.as_ref().err()) {
            return Err(failed.clone());
        }
        results.extend(settled);
    }

    Ok(results)
}
