//! Per-experiment context (REDESIGN FLAG #2).
//!
//! The original stashes the live emulator descriptor, result-file handle
//! and timeout/watchguard flags in process globals so a timer callback
//! (running on a separate OS thread, or a `SIGALRM` handler) can reach
//! them. Here every piece of state a timeout needs to act on is an
//! explicit value owned by the task running one experiment; a timer fires
//! a [`tokio_util::sync::CancellationToken`] rather than mutating a global.
//!
//! Two distinct timeouts apply across one experiment's lifetime (spec.md
//! §5) and this context keeps them from being conflated: [`guard_pre_fault`]
//! races the fixed 300s watchguard against everything up to a confirmed
//! fault delivery — on expiry the experiment is not recorded and the
//! caller restarts the shard — while [`arm_timeout`]'s per-run timeout
//! takes over only once a fault has actually landed, cancelling the
//! shared token so the post-fault wait classifies as `TIMEOUT` and is
//! recorded instead of erroring out.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{GqfiError, Result};

/// Owns the cancellation signal for exactly one in-flight experiment.
/// Dropped (and the token cancelled) when the experiment completes or the
/// owning task is torn down.
pub struct ExperimentContext {
    pub run_id: Uuid,
    token: CancellationToken,
    watchguard: Duration,
}

impl ExperimentContext {
    pub fn new(watchguard: Duration) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            token: CancellationToken::new(),
            watchguard,
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Races `fut` (everything from snapshot load up to a confirmed fault
    /// delivery) against the fixed watchguard fuse. A watchguard firing
    /// here means the engine is wedged before ever reaching the
    /// fault-injection point (spec.md §5) — the run is not recorded, and
    /// the returned error propagates up through [`super::ExperimentEngine::run_until_count`]
    /// as a hard failure the shard wrapper restarts on.
    pub async fn guard_pre_fault<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            result = fut => result,
            _ = tokio::time::sleep(self.watchguard) => Err(GqfiError::Timeout {
                run_id: self.run_id.to_string(),
                elapsed_secs: self.watchguard.as_secs(),
            }),
        }
    }

    /// Spawn a background timer that cancels this context after `duration`
    /// unless cancelled first for another reason. Returns a handle so the
    /// caller can abort the timer once the experiment finishes normally.
    pub fn arm_timeout(&self, duration: Duration) -> tokio::task::JoinHandle<()> {
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => token.cancel(),
                _ = token.cancelled() => {}
            }
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timeout_cancels_token_after_duration() {
        let ctx = ExperimentContext::new(Duration::from_secs(300));
        let handle = ctx.arm_timeout(Duration::from_millis(10));
        assert!(!ctx.is_cancelled());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(ctx.is_cancelled());
        handle.abort();
    }

    #[tokio::test]
    async fn manual_cancel_short_circuits_timer() {
        let ctx = ExperimentContext::new(Duration::from_secs(300));
        let handle = ctx.arm_timeout(Duration::from_secs(5));
        ctx.cancel();
        assert!(ctx.is_cancelled());
        // the timer task observes the cancellation and exits promptly
        tokio::time::timeout(Duration::from_millis(50), handle)
            .await
            .expect("timer task should exit promptly on cancel")
            .unwrap();
    }

    #[tokio::test]
    async fn guard_pre_fault_passes_through_a_fast_future() {
        let ctx = ExperimentContext::new(Duration::from_secs(300));
        let result = ctx.guard_pre_fault(async { Ok::<_, GqfiError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn guard_pre_fault_times_out_a_wedged_future() {
        let ctx = ExperimentContext::new(Duration::from_millis(10));
        let result = ctx
            .guard_pre_fault(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, GqfiError>(())
            })
            .await;
        assert!(matches!(result, Err(GqfiError::Timeout { .. })));
    }
}
