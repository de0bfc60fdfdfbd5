//! Rumble keep-alive scheduling
//!
//! The pairing service caps a single rumble command at about one second of
//! physical effect. To sustain an effect until the caller explicitly stops
//! it, every non-zero rumble gets a background task that re-issues the same
//! command on a fixed period (500 ms by default, well under the cap).
//!
//! At most one keep-alive is active per controller token. It ends when:
//! - a new rumble command for the same token arrives (including 0/0)
//! - a re-issued rumble call fails (no retry)
//! - the device is removed
//! - the session stops or the service disconnects

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::service::ControllerService;
use crate::types::ControllerToken;

/// Default keep-alive period (and initial delay) in milliseconds
pub const DEFAULT_KEEPALIVE_MS: u64 = 500;

/// Handle to one token's repeating rumble task
///
/// Dropping the handle cancels the task, so removing it from the registry is
/// the single "take and cancel" operation.
#[derive(Debug)]
struct RumbleTimer {
    generation: u64,
    cancel: CancellationToken,
}

impl Drop for RumbleTimer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

type TimerRegistry = Arc<DashMap<ControllerToken, RumbleTimer>>;

/// Per-token registry of active rumble keep-alives
#[derive(Debug)]
pub struct RumbleScheduler {
    timers: TimerRegistry,
    period: Duration,
    next_generation: AtomicU64,
}

impl Default for RumbleScheduler {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_KEEPALIVE_MS))
    }
}

impl RumbleScheduler {
    pub fn new(period: Duration) -> Self {
        Self {
            timers: Arc::new(DashMap::new()),
            period,
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Issue a rumble command, keeping it alive if either motor is non-zero
    ///
    /// Any existing keep-alive for `token` is cancelled first. Returns whether
    /// the immediate remote call succeeded; scheduling never blocks.
    ///
    /// The timer is registered before the remote call, so `cancel`,
    /// `cancel_all` and `stop_all` issued while the call is in flight also
    /// prevent the keep-alive from starting.
    pub async fn rumble(
        &self,
        service: Arc<dyn ControllerService>,
        token: &ControllerToken,
        low_motor: i32,
        high_motor: i32,
    ) -> bool {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        let timer = RumbleTimer {
            generation,
            cancel: cancel.clone(),
        };
        if let Some(previous) = self.timers.insert(token.clone(), timer) {
            debug!(token = %token, generation = previous.generation, "Replaced active rumble keep-alive");
        }

        let accepted = match service.rumble(token, low_motor, high_motor).await {
            Ok(true) => true,
            Ok(false) => {
                debug!(token = %token, low_motor, high_motor, "Rumble rejected by service");
                false
            }
            Err(e) => {
                warn!(error = %e, token = %token, "Rumble call failed");
                false
            }
        };

        if !accepted || (low_motor == 0 && high_motor == 0) {
            self.release(token, generation);
            return accepted;
        }

        // Superseded, removed or stopped while the call was in flight
        if cancel.is_cancelled() {
            debug!(token = %token, generation, "Rumble keep-alive cancelled before it started");
            return true;
        }

        let task = KeepAlive {
            timers: Arc::clone(&self.timers),
            service,
            token: token.clone(),
            generation,
            low_motor,
            high_motor,
            period: self.period,
            cancel,
        };
        tokio::spawn(task.run());
        true
    }

    /// Cancel the keep-alive for `token`, if any
    pub fn cancel(&self, token: &ControllerToken) -> bool {
        self.timers.remove(token).is_some()
    }

    /// Cancel every keep-alive, returning the tokens that had one
    pub fn cancel_all(&self) -> Vec<ControllerToken> {
        let tokens: Vec<ControllerToken> = self.timers.iter().map(|e| e.key().clone()).collect();
        tokens
            .into_iter()
            .filter(|token| self.timers.remove(token).is_some())
            .collect()
    }

    /// Cancel every keep-alive and send a best-effort stop to each device
    pub async fn stop_all(&self, service: Option<&dyn ControllerService>) {
        let tokens = self.cancel_all();
        let Some(service) = service else {
            return;
        };

        for token in tokens {
            match service.rumble(&token, 0, 0).await {
                Ok(_) => debug!(token = %token, "Sent rumble stop"),
                Err(e) => debug!(error = %e, token = %token, "Rumble stop failed (ignored)"),
            }
        }
    }

    /// Whether a keep-alive is running or a rumble call for `token` is in flight
    pub fn is_active(&self, token: &ControllerToken) -> bool {
        self.timers.contains_key(token)
    }

    pub fn active_count(&self) -> usize {
        self.timers.len()
    }

    /// Drop the timer for `token` only if it still belongs to `generation`
    fn release(&self, token: &ControllerToken, generation: u64) {
        self.timers
            .remove_if(token, |_, timer| timer.generation == generation);
    }
}

/// Body of one repeating rumble task
struct KeepAlive {
    timers: TimerRegistry,
    service: Arc<dyn ControllerService>,
    token: ControllerToken,
    generation: u64,
    low_motor: i32,
    high_motor: i32,
    period: Duration,
    cancel: CancellationToken,
}

impl KeepAlive {
    fn is_current(&self) -> bool {
        self.timers
            .get(&self.token)
            .map(|timer| timer.generation == self.generation)
            .unwrap_or(false)
    }

    async fn run(self) {
        let mut ticks = interval_at(Instant::now() + self.period, self.period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticks.tick() => {}
            }

            // Cancelled by a newer command, removal, or stop
            if self.cancel.is_cancelled() || !self.is_current() {
                return;
            }

            match self
                .service
                .rumble(&self.token, self.low_motor, self.high_motor)
                .await
            {
                Ok(true) => continue,
                Ok(false) => info!(token = %self.token, "Rumble keep-alive rejected, stopping"),
                Err(e) => warn!(error = %e, token = %self.token, "Rumble keep-alive failed, stopping"),
            }

            self.timers
                .remove_if(&self.token, |_, timer| timer.generation == self.generation);
            return;
        }
    }
}
