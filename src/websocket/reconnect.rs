use log::*;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Decides how long to wait before each reconnection attempt.
pub trait BackoffPolicy: Send + Sync {
    /// Delay before attempt `attempt` (0-indexed), or `None` to stop reconnecting.
    fn next_delay(&self, attempt: usize) -> Option<Duration>;
}

/// Always waits the same amount of time between reconnection attempts.
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
    max_attempts: Option<usize>,
}

impl FixedDelay {
    pub fn new(delay: Duration, max_attempts: Option<usize>) -> Self {
        Self {
            delay,
            max_attempts,
        }
    }
}

impl BackoffPolicy for FixedDelay {
    fn next_delay(&self, attempt: usize) -> Option<Duration> {
        if self.max_attempts.map_or(false, |max| attempt >= max) {
            return None;
        }
        Some(self.delay)
    }
}

/// initial_delay * 2^attempt, capped at max_delay.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    max_attempts: Option<usize>,
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: Option<usize>) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_attempts,
        }
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: usize) -> Option<Duration> {
        if self.max_attempts.map_or(false, |max| attempt >= max) {
            return None;
        }
        let factor = 2u32.checked_pow(attempt as u32).unwrap_or(u32::MAX);
        Some(
            self.initial_delay
                .checked_mul(factor)
                .unwrap_or(self.max_delay)
                .min(self.max_delay),
        )
    }
}

#[derive(Debug, Clone)]
pub struct NeverReconnect;

impl BackoffPolicy for NeverReconnect {
    fn next_delay(&self, _attempt: usize) -> Option<Duration> {
        None
    }
}

struct PendingRetry {
    id: u64,
    handle: JoinHandle<()>,
}

/// Owns the one timer that governs reconnection.
///
/// At most one retry is pending at any time; scheduling while one is pending
/// is a no-op, so a burst of transport errors cannot stack reconnect loops.
pub struct ReconnectScheduler {
    policy: Box<dyn BackoffPolicy>,
    pending: Arc<Mutex<Option<PendingRetry>>>,
    attempts: AtomicUsize,
    next_id: AtomicU64,
}

impl ReconnectScheduler {
    pub fn new(policy: Box<dyn BackoffPolicy>) -> Self {
        Self {
            policy,
            pending: Arc::new(Mutex::new(None)),
            attempts: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
        }
    }

    /// Runs `action` after `delay` unless a retry is already pending.
    ///
    /// Returns `true` if a new timer was armed.
    pub async fn schedule_retry<F>(&self, delay: Duration, action: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.pending.lock().await;
        if slot.is_some() {
            debug!("[Reconnect] Retry already pending, ignoring new request.");
            return false;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pending = Arc::clone(&self.pending);
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            {
                let mut slot = pending.lock().await;
                if slot.as_ref().map(|p| p.id) != Some(id) {
                    return;
                }
                *slot = None;
            }
            debug!("[Reconnect] Timer #{} fired.", id);
            action.await;
        });
        *slot = Some(PendingRetry { id, handle });
        true
    }

    /// Arms a retry using the policy's delay for the current attempt.
    pub async fn schedule<F>(&self, action: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let attempt = self.attempts.load(Ordering::SeqCst);
        let delay = match self.policy.next_delay(attempt) {
            Some(delay) => delay,
            None => {
                error!(
                    "[Reconnect] Backoff policy gave up after {} attempts. Stopping reconnection.",
                    attempt
                );
                return false;
            }
        };
        let armed = self.schedule_retry(delay, action).await;
        if armed {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            warn!(
                "[Reconnect] Retrying in {:?} (attempt {}).",
                delay,
                attempt + 1
            );
        }
        armed
    }

    /// Aborts the pending timer, if any. Returns whether one was cancelled.
    pub async fn cancel_pending(&self) -> bool {
        match self.pending.lock().await.take() {
            Some(retry) => {
                debug!("[Reconnect] Cancelling pending timer #{}.", retry.id);
                retry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Starts the backoff sequence over; called after a successful connect.
    pub fn reset(&self) {
        self.attempts.store(0, Ordering::SeqCst);
    }

    pub async fn is_pending(&self) -> bool {
        self.pending.lock().await.is_some()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}
