//! Async result plumbing shared by every replica call.
//!
//! Target I/O is expressed as futures resolving to `Result<T, TargetError>`.
//! Success values are transformed with `Result::map` / `TryFutureExt::map_ok`
//! and dependent calls are chained with `?` or `TryFutureExt::and_then`. This
//! module adds the fan-in helpers the runners need on top of that.

use crate::error::TargetError;
use futures::future::{self, BoxFuture};
use futures::{Future, FutureExt};
use std::time::Duration;

/// Boxed future returned by replica calls.
pub type TargetFuture<'a, T> = BoxFuture<'a, Result<T, TargetError>>;

/// Wait for every future, failing fast on the first error.
pub async fn all<T, F>(futures: impl IntoIterator<Item = F>) -> Result<Vec<T>, TargetError>
where
    F: Future<Output = Result<T, TargetError>>,
{
    future::try_join_all(futures).await
}

/// Race every future and resolve with the first success.
///
/// Fails only once every attempt has failed, with the last error seen.
pub async fn first_success<T, F>(futures: impl IntoIterator<Item = F>) -> Result<T, TargetError>
where
    F: Future<Output = Result<T, TargetError>> + Send,
{
    let attempts: Vec<_> = futures.into_iter().map(|f| f.boxed()).collect();
    if attempts.is_empty() {
        return Err(TargetError::other("no attempts to race"));
    }
    future::select_ok(attempts).await.map(|(value, _rest)| value)
}

/// Wait for every future and keep each individual outcome, in input order.
pub async fn settle_all<T, F>(
    futures: impl IntoIterator<Item = F>,
) -> Vec<Result<T, TargetError>>
where
    F: Future<Output = Result<T, TargetError>>,
{
    future::join_all(futures).await
}

/// Bound a replica call by an optional time limit.
pub async fn with_timeout<T, F>(limit: Option<Duration>, fut: F) -> Result<T, TargetError>
where
    F: Future<Output = Result<T, TargetError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .unwrap_or(Err(TargetError::TimedOut(limit))),
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn delayed(ms: u64, outcome: Result<u32, TargetError>) -> Result<u32, TargetError> {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        outcome
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_fails_fast() {
        let started = tokio::time::Instant::now();
        let result = all(vec![
            delayed(100, Ok(1)).boxed(),
            delayed(10, Err(TargetError::Offline)).boxed(),
        ])
        .await;

        assert_eq!(result, Err(TargetError::Offline));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_all_collects_in_order() {
        let result = all(vec![delayed(5, Ok(1)).boxed(), delayed(1, Ok(2)).boxed()]).await;
        assert_eq!(result, Ok(vec![1, 2]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_success_skips_failures() {
        let result = first_success(vec![
            delayed(0, Err(TargetError::Offline)).boxed(),
            delayed(20, Ok(2)).boxed(),
            delayed(40, Ok(3)).boxed(),
        ])
        .await;
        assert_eq!(result, Ok(2));
    }

    #[tokio::test]
    async fn test_first_success_all_fail() {
        let result = first_success(vec![
            delayed(0, Err(TargetError::Offline)).boxed(),
            delayed(1, Err(TargetError::InvalidAuth)).boxed(),
        ])
        .await;
        assert!(result.is_err());

        let empty: Vec<TargetFuture<'static, u32>> = Vec::new();
        assert!(first_success(empty).await.is_err());
    }

    #[tokio::test]
    async fn test_settle_all_keeps_each_outcome() {
        let outcomes = settle_all(vec![
            delayed(2, Ok(1)).boxed(),
            delayed(1, Err(TargetError::Offline)).boxed(),
        ])
        .await;
        assert_eq!(outcomes, vec![Ok(1), Err(TargetError::Offline)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout() {
        let limit = Some(Duration::from_millis(10));
        assert_eq!(
            with_timeout(limit, delayed(50, Ok(1))).await,
            Err(TargetError::TimedOut(Duration::from_millis(10)))
        );
        assert_eq!(with_timeout(limit, delayed(5, Ok(1))).await, Ok(1));
        assert_eq!(with_timeout(None, delayed(500, Ok(7))).await, Ok(7));
    }
}
