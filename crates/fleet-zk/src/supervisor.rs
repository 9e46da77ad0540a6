//! Restart supervision for long-running mirror tasks.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{ZkError, ZkResult};

/// More than `max_restarts` restarts inside `window` is fatal.
#[derive(Debug, Clone, Copy)]
pub struct RestartBudget {
    pub max_restarts: usize,
    pub window: Duration,
}

impl Default for RestartBudget {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(5 * 60),
        }
    }
}

/// Run `make()` until it finishes cleanly or `cancel` fires, restarting it
/// immediately after every error.
pub async fn supervise<F, Fut>(
    name: &str,
    cancel: &CancellationToken,
    budget: RestartBudget,
    mut make: F,
) -> ZkResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ZkResult<()>>,
{
    let mut restarts: VecDeque<Instant> = VecDeque::new();
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = make() => result,
        };
        let err = match result {
            Ok(()) => {
                info!(task = %name, "supervised task finished");
                return Ok(());
            }
            Err(e) => e,
        };

        let now = Instant::now();
        while restarts
            .front()
            .is_some_and(|at| now.duration_since(*at) > budget.window)
        {
            restarts.pop_front();
        }
        restarts.push_back(now);
        if restarts.len() > budget.max_restarts {
            error!(task = %name, error = %err, restarts = restarts.len(), "restart budget exhausted");
            return Err(ZkError::RestartStorm {
                name: name.to_string(),
                restarts: restarts.len(),
                window: budget.window,
            });
        }
        warn!(task = %name, error = %err, restarts = restarts.len(), "supervised task failed, restarting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn storm_is_fatal() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let result = supervise("int", &cancel, RestartBudget::default(), || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ZkError::SessionLost)
            }
        })
        .await;
        assert!(matches!(result, Err(ZkError::RestartStorm { restarts: 6, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn spaced_failures_keep_restarting() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let result = supervise("int", &cancel, RestartBudget::default(), || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) >= 10 {
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_secs(90)).await;
                Err(ZkError::SessionLost)
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_supervision() {
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            stopper.cancel();
        });
        let result = supervise("int", &cancel, RestartBudget::default(), || async {
            std::future::pending::<()>().await;
            Ok(())
        })
        .await;
        assert!(result.is_ok());
    }
}
