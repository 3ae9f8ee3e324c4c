//! # Reconnect Supervisor
//!
//! Keeps exactly one cloud session alive for the lifetime of the process.
//! Every attempt runs in its own task, so a panic inside a session turns
//! into a logged retry instead of taking the process down.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{error, info, warn};

use crate::cloud::{AbortOnDrop, CloudSession};

const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_JITTER: f64 = 0.2;

// ─── Backoff ────────────────────────────────────────────────────

/// Exponential backoff with up to 20% extra jitter.
///
/// Each call to [`Backoff::next_sleep`] returns `min(cap, delay)` plus
/// jitter, then doubles `delay` (bounded by `cap`).
#[derive(Debug, Clone)]
pub struct Backoff {
    delay: Duration,
    cap: Duration,
}

impl Backoff {
    /// `cap` is raised to at least one second.
    pub fn new(cap: Duration) -> Self {
        Self {
            delay: BASE_DELAY,
            cap: cap.max(BASE_DELAY),
        }
    }

    pub fn reset(&mut self) {
        self.delay = BASE_DELAY;
    }

    pub fn next_sleep(&mut self) -> Duration {
        let jitter = rand::rng().random_range(0.0..=MAX_JITTER);
        self.next_sleep_with(jitter)
    }

    fn next_sleep_with(&mut self, jitter: f64) -> Duration {
        let sleep = self.delay.min(self.cap);
        self.delay = (self.delay * 2).min(self.cap);
        sleep + sleep.mul_f64(jitter)
    }
}

// ─── Main Loop ──────────────────────────────────────────────────

/// Runs cloud sessions back to back, forever.
///
/// This function never returns; the binary stops it by dropping (or
/// aborting) the future, which also aborts the attempt in flight.
///
/// The delay goes back to one second whenever the session that just ended
/// had received a socket id, so a broker that drops healthy connections
/// is reconnected quickly while an unreachable one is retried slowly.
pub async fn run_forever(session: Arc<CloudSession>) {
    let mut backoff = Backoff::new(session.config().reconnect_delay_cap);
    let mut attempt: u64 = 0;

    loop {
        attempt += 1;
        let s = session.clone();
        let mut task = AbortOnDrop(tokio::spawn(async move { s.run().await }));

        match (&mut task.0).await {
            Ok(end) => {
                if end.handshake_completed() {
                    backoff.reset();
                }
                warn!(
                    "cloud_session_ended attempt={} phase={:?} error={}",
                    attempt, end.phase, end.error
                );
            }
            Err(e) if e.is_panic() => {
                error!("cloud_session_panicked attempt={} error={}", attempt, e);
            }
            Err(e) => {
                warn!("cloud_session_cancelled attempt={} error={}", attempt, e);
            }
        }

        let sleep = backoff.next_sleep();
        info!("cloud_reconnect_scheduled in_secs={:.2}", sleep.as_secs_f64());
        tokio::time::sleep(sleep).await;
    }
}

// ─── Start-up Retry ─────────────────────────────────────────────

/// Calls `attempt` until it succeeds, logging each failure and sleeping
/// `delay` in between. Used for start-up steps that must not exit the
/// process, such as loading configuration.
pub async fn retry_until_ok<T, E, F>(what: &str, delay: Duration, mut attempt: F) -> T
where
    E: std::fmt::Display,
    F: FnMut() -> Result<T, E>,
{
    loop {
        match attempt() {
            Ok(value) => return value,
            Err(e) => error!(
                "{}_failed error={} retry_in_secs={}",
                what,
                e,
                delay.as_secs()
            ),
        }
        tokio::time::sleep(delay).await;
    }
}
