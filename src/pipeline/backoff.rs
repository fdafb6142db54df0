use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Exponential delay between failed bus reads
///
/// Never gives up: once `circuit_threshold` consecutive failures are seen the
/// circuit is reported open (logged once) and reads keep retrying at the
/// capped delay until one succeeds.
#[derive(Debug)]
pub struct ReadBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    circuit_threshold: u32,
    consecutive_failures: u32,
    circuit_open: bool,
}

impl ReadBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, circuit_threshold: u32) -> Self {
        Self {
            initial_delay,
            max_delay,
            circuit_threshold,
            consecutive_failures: 0,
            circuit_open: false,
        }
    }

    /// Delay for the next retry, given the failures recorded so far
    pub fn next_delay(&self) -> Duration {
        let exponent = self.consecutive_failures.saturating_sub(1).min(31);
        self.initial_delay
            .saturating_mul(2_u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    /// Record one failed read
    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if !self.circuit_open && self.consecutive_failures >= self.circuit_threshold {
            self.circuit_open = true;
            log::error!(
                "🔌 Bus read circuit open after {} consecutive failures, retrying every {:?}",
                self.consecutive_failures,
                self.max_delay
            );
        }
    }

    /// Record a failure and sleep; returns false if cancelled while waiting
    pub async fn wait(&mut self, shutdown: &CancellationToken) -> bool {
        self.record_failure();
        let delay = self.next_delay();

        log::warn!(
            "⏳ Read retry attempt {} in {:?}",
            self.consecutive_failures,
            delay
        );

        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    pub fn reset(&mut self) {
        if self.circuit_open {
            log::info!(
                "✅ Bus read recovered after {} failures",
                self.consecutive_failures
            );
        }
        self.consecutive_failures = 0;
        self.circuit_open = false;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_circuit_open(&self) -> bool {
        self.circuit_open
    }
}
