//! Reconnection controller: decides when the client should try to
//! re-establish its channel after a disconnect, with exponential backoff
//! and jitter so a relay restart doesn't get thundered on by every client
//! at once.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

/// Computes the next backoff delay, before jitter: `min(prev * multiplier, max)`.
/// A `None` previous delay means this is the first attempt, which always
/// uses `initial`.
pub fn next_delay(prev: Option<Duration>, config: &BackoffConfig) -> Duration {
    match prev {
        None => config.initial,
        Some(prev) => {
            let scaled = prev.mul_f64(config.multiplier);
            scaled.min(config.max)
        }
    }
}

/// Applies symmetric jitter: `delay * (1 + jitter * (u - 0.5))` for a
/// uniform `u` in `[0, 1)`. Takes the random sample as a parameter so the
/// jitter math itself stays a pure, deterministically testable function.
pub fn apply_jitter(delay: Duration, jitter: f64, uniform_sample: f64) -> Duration {
    let factor = 1.0 + jitter * (uniform_sample - 0.5);
    delay.mul_f64(factor.max(0.0))
}

/// Drives the client's connection attempts through
/// `Disconnected → Connecting → Connected`, falling back to `Backoff` on
/// failure and computing the next delay each time. `Stopped` is terminal —
/// set when the caller explicitly gives up (`--no-reconnect`, or a
/// handshake rejection that isn't worth retrying).
pub struct ReconnectionController {
    state: ConnectionState,
    config: BackoffConfig,
    last_delay: Option<Duration>,
}

impl ReconnectionController {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            config,
            last_delay: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn begin_connecting(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    pub fn on_connected(&mut self) {
        self.state = ConnectionState::Connected;
        self.last_delay = None;
    }

    pub fn stop(&mut self) {
        self.state = ConnectionState::Stopped;
    }

    pub fn is_stopped(&self) -> bool {
        self.state == ConnectionState::Stopped
    }

    /// Records a failed attempt and returns the (jittered) delay to wait
    /// before the next one.
    pub fn on_disconnected(&mut self) -> Duration {
        self.state = ConnectionState::Backoff;
        let base = next_delay(self.last_delay, &self.config);
        self.last_delay = Some(base);
        let sample = rand::rng().random_range(0.0..1.0);
        apply_jitter(base, self.config.jitter, sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_delay_is_initial() {
        let config = BackoffConfig::default();
        assert_eq!(next_delay(None, &config), config.initial);
    }

    #[test]
    fn delay_doubles_each_attempt_until_capped() {
        let config = BackoffConfig::default();
        let d1 = next_delay(None, &config);
        let d2 = next_delay(Some(d1), &config);
        let d3 = next_delay(Some(d2), &config);
        assert_eq!(d1, Duration::from_secs(1));
        assert_eq!(d2, Duration::from_secs(2));
        assert_eq!(d3, Duration::from_secs(4));
    }

    #[test]
    fn delay_never_exceeds_max() {
        let config = BackoffConfig::default();
        let mut delay = config.initial;
        for _ in 0..20 {
            delay = next_delay(Some(delay), &config);
            assert!(delay <= config.max);
        }
        assert_eq!(delay, config.max);
    }

    #[test]
    fn jitter_is_bounded_by_configured_fraction() {
        let base = Duration::from_secs(10);
        let jitter = 0.1;
        let low = apply_jitter(base, jitter, 0.0);
        let high = apply_jitter(base, jitter, 1.0);
        let mid = apply_jitter(base, jitter, 0.5);
        assert_eq!(mid, base);
        assert_eq!(low, base.mul_f64(0.95));
        assert_eq!(high, base.mul_f64(1.05));
    }

    #[test]
    fn controller_resets_backoff_after_successful_connect() {
        let mut controller = ReconnectionController::new(BackoffConfig::default());
        controller.begin_connecting();
        let _ = controller.on_disconnected();
        let _ = controller.on_disconnected();
        controller.begin_connecting();
        controller.on_connected();
        assert_eq!(controller.state(), ConnectionState::Connected);

        // Next failure should start from `initial` again, not continue
        // doubling from where it left off.
        let delay = controller.on_disconnected();
        let lower_bound = BackoffConfig::default().initial.mul_f64(0.9);
        let upper_bound = BackoffConfig::default().initial.mul_f64(1.1);
        assert!(delay >= lower_bound && delay <= upper_bound);
    }

    #[test]
    fn stop_is_terminal() {
        let mut controller = ReconnectionController::new(BackoffConfig::default());
        controller.stop();
        assert!(controller.is_stopped());
    }
}
