//! Soft and hard time limits around handler invocation.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use conveyor_core::TaskError;

/// Deadlines for one task. When both are present the soft limit must be
/// strictly smaller than the hard one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeLimitPolicy {
    pub soft: Option<Duration>,
    pub hard: Option<Duration>,
}

impl TimeLimitPolicy {
    pub fn new(soft: Option<Duration>, hard: Option<Duration>) -> Result<Self, anyhow::Error> {
        if let (Some(soft), Some(hard)) = (soft, hard) {
            if soft >= hard {
                anyhow::bail!(
                    "soft time limit ({:?}) must be smaller than the hard limit ({:?})",
                    soft,
                    hard
                );
            }
        }
        Ok(Self { soft, hard })
    }

    pub fn soft_only(soft: Duration) -> Self {
        Self {
            soft: Some(soft),
            hard: None,
        }
    }

    pub fn hard_only(hard: Duration) -> Self {
        Self {
            soft: None,
            hard: Some(hard),
        }
    }
}

async fn sleep_or_forever(duration: Option<Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

/// Run a handler under the given limits.
///
/// The handler receives a child of `external` and is cancelled when either
/// limit fires. A winning soft timer yields `SoftTimeLimitExceeded`, the
/// hard timer `TimeLimitExceeded`. Cancellation of `external` itself
/// propagates unchanged as [`TaskError::Cancelled`] so the caller can
/// distinguish revocation from a time-limit outcome.
pub async fn enforce<T, F, Fut>(
    policy: Option<&TimeLimitPolicy>,
    task_id: &str,
    external: &CancellationToken,
    run: F,
) -> Result<T, TaskError>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, TaskError>>,
{
    let linked = external.child_token();
    let soft = policy.and_then(|p| p.soft);
    let hard = policy.and_then(|p| p.hard);

    let fut = run(linked.clone());
    tokio::pin!(fut);

    tokio::select! {
        result = &mut fut => result,
        _ = sleep_or_forever(soft) => {
            linked.cancel();
            tracing::warn!(task_id = %task_id, limit_ms = soft.unwrap_or_default().as_millis() as u64, "Soft time limit exceeded");
            Err(TaskError::SoftTimeLimitExceeded {
                task_id: task_id.to_string(),
                limit: soft.unwrap_or_default(),
            })
        }
        _ = sleep_or_forever(hard) => {
            linked.cancel();
            tracing::error!(task_id = %task_id, limit_ms = hard.unwrap_or_default().as_millis() as u64, "Hard time limit exceeded");
            Err(TaskError::TimeLimitExceeded {
                task_id: task_id.to_string(),
                limit: hard.unwrap_or_default(),
            })
        }
        _ = external.cancelled() => {
            linked.cancel();
            Err(TaskError::Cancelled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_must_be_below_hard() {
        assert!(TimeLimitPolicy::new(
            Some(Duration::from_secs(10)),
            Some(Duration::from_secs(5))
        )
        .is_err());
        assert!(TimeLimitPolicy::new(
            Some(Duration::from_secs(5)),
            Some(Duration::from_secs(5))
        )
        .is_err());
        assert!(TimeLimitPolicy::new(
            Some(Duration::from_secs(1)),
            Some(Duration::from_secs(5))
        )
        .is_ok());
    }

    #[tokio::test]
    async fn fast_handler_passes_through() {
        let policy = TimeLimitPolicy::new(
            Some(Duration::from_millis(200)),
            Some(Duration::from_millis(400)),
        )
        .unwrap();
        let token = CancellationToken::new();
        let result = enforce(Some(&policy), "T1", &token, |_linked| async {
            Ok::<_, TaskError>(5)
        })
        .await
        .unwrap();
        assert_eq!(result, 5);
    }

    #[tokio::test]
    async fn soft_limit_wins_over_slow_handler() {
        let policy = TimeLimitPolicy::new(
            Some(Duration::from_millis(50)),
            Some(Duration::from_millis(500)),
        )
        .unwrap();
        let token = CancellationToken::new();
        let err = enforce(Some(&policy), "T1", &token, |linked| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            assert!(linked.is_cancelled());
            Ok::<_, TaskError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, TaskError::SoftTimeLimitExceeded { .. }));
    }

    #[tokio::test]
    async fn hard_limit_fires_without_soft() {
        let policy = TimeLimitPolicy::hard_only(Duration::from_millis(50));
        let token = CancellationToken::new();
        let err = enforce(Some(&policy), "T1", &token, |_linked| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, TaskError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, TaskError::TimeLimitExceeded { .. }));
    }

    #[tokio::test]
    async fn external_cancellation_propagates_unchanged() {
        let policy = TimeLimitPolicy::hard_only(Duration::from_secs(10));
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let err = enforce(Some(&policy), "T1", &token, |_linked| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, TaskError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, TaskError::Cancelled));
    }

    #[tokio::test]
    async fn no_policy_means_no_limits() {
        let token = CancellationToken::new();
        let result = enforce(None, "T1", &token, |_linked| async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok::<_, TaskError>("done")
        })
        .await
        .unwrap();
        assert_eq!(result, "done");
    }

    #[tokio::test]
    async fn handler_observing_its_token_returns_cancelled() {
        // A cooperative handler that returns Cancelled when its token fires
        // still classifies as a time-limit outcome only via the racing
        // timers; its own early return is whatever it reports.
        let policy = TimeLimitPolicy::hard_only(Duration::from_millis(40));
        let token = CancellationToken::new();
        let err = enforce(Some(&policy), "T1", &token, |linked| async move {
            linked.cancelled().await;
            Err::<(), _>(TaskError::Cancelled)
        })
        .await
        .unwrap_err();
        // The hard timer and the handler race; both outcomes are
        // cancellation-shaped.
        assert!(matches!(
            err,
            TaskError::TimeLimitExceeded { .. } | TaskError::Cancelled
        ));
    }
}
