use std::time::Duration;

use alloy_primitives::Address;

use crate::account::Layer;

/// Connection and fee parameters for one chain.
#[derive(Clone, Debug)]
pub struct LayerConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    /// Gas limit for plain value transfers.
    pub transfer_gas_limit: u64,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

impl LayerConfig {
    pub fn new(rpc_url: impl Into<String>, chain_id: u64) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            chain_id,
            transfer_gas_limit: 21_000,
            max_fee_per_gas: 20e9 as u128,
            max_priority_fee_per_gas: 1e9 as u128,
        }
    }

    pub fn with_fees(mut self, max_fee_per_gas: u128, max_priority_fee_per_gas: u128) -> Self {
        self.max_fee_per_gas = max_fee_per_gas;
        self.max_priority_fee_per_gas = max_priority_fee_per_gas;
        self
    }
}

/// Bounded exponential backoff for transient RPC failures.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Relative jitter applied to every delay, `0.2` means ±20%.
    pub jitter: f64,
    /// Ceiling on the total time spent retrying one call.
    pub max_elapsed: Duration,
    /// Bound on a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
            jitter: 0.2,
            max_elapsed: Duration::from_secs(60),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (zero based), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// How the load driver picks the next sending account.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum AccountSelection {
    #[default]
    RoundRobin,
    /// Relative weights keyed by account id; unlisted accounts weigh 1.
    Weighted(Vec<(String, u32)>),
}

#[derive(Clone, Debug)]
pub struct StressConfig {
    /// Identifies the run; intent ids are derived from it.
    pub run_id: String,
    /// Transactions per second.
    pub tx_rate: f64,
    /// Stop after this long, if set.
    pub duration: Option<Duration>,
    /// Stop after this many dispatched intents, if set.
    pub volume: Option<u64>,
    /// Maximum transactions submitted but not yet resolved.
    pub max_in_flight: usize,
    /// Layers intents are spread over, round-robin.
    pub layers: Vec<Layer>,
    pub selection: AccountSelection,
    /// Fixed recipient; otherwise a random other pool account.
    pub recipient: Option<Address>,
    /// Transfer value range in gwei, inclusive.
    pub value_gwei: (u64, u64),
    pub confirmation_timeout: Duration,
    pub receipt_poll_interval: Duration,
    /// How long in-flight work may finish after dispatch stops.
    pub drain_grace: Duration,
    /// Abort once this share of the rolling window failed.
    pub failure_threshold: f64,
    pub failure_window: usize,
    /// Persist every outcome in the account store.
    pub persist_outcomes: bool,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            run_id: "stress".to_string(),
            tx_rate: 10.0,
            duration: Some(Duration::from_secs(30)),
            volume: None,
            max_in_flight: 64,
            layers: vec![Layer::L2],
            selection: AccountSelection::RoundRobin,
            recipient: None,
            value_gwei: (1, 1),
            confirmation_timeout: Duration::from_secs(60),
            receipt_poll_interval: Duration::from_millis(500),
            drain_grace: Duration::from_secs(30),
            failure_threshold: 0.5,
            failure_window: 50,
            persist_outcomes: false,
        }
    }
}

impl StressConfig {
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_tx_rate(mut self, rate: f64) -> Self {
        self.tx_rate = rate;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_volume(mut self, volume: u64) -> Self {
        self.volume = Some(volume);
        self
    }

    pub fn with_max_in_flight(mut self, n: usize) -> Self {
        self.max_in_flight = n;
        self
    }

    pub fn with_layers(mut self, layers: Vec<Layer>) -> Self {
        self.layers = layers;
        self
    }

    pub fn with_selection(mut self, selection: AccountSelection) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout = timeout;
        self
    }

    pub fn with_receipt_poll_interval(mut self, interval: Duration) -> Self {
        self.receipt_poll_interval = interval;
        self
    }

    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: f64, window: usize) -> Self {
        self.failure_threshold = threshold;
        self.failure_window = window;
        self
    }

    pub fn with_persist_outcomes(mut self, persist: bool) -> Self {
        self.persist_outcomes = persist;
        self
    }

    /// Time between two dispatch tokens, `None` unless the rate gives a
    /// finite, non-zero period.
    pub fn tick_period(&self) -> Option<Duration> {
        if self.tx_rate.is_nan() || self.tx_rate <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(1.0 / self.tx_rate)
            .ok()
            .filter(|period| !period.is_zero())
    }
}

/// Parameters for moving value between layers.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// L1 inbox contract receiving deposits.
    pub inbox_address: Address,
    pub gas_limit: u64,
    /// Time budget for one operation, from submission to destination credit.
    pub deadline: Duration,
    pub poll_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            inbox_address: Address::ZERO,
            gas_limit: 300_000,
            deadline: Duration::from_secs(600),
            poll_interval: Duration::from_secs(2),
        }
    }
}

impl BridgeConfig {
    pub fn new(inbox_address: Address) -> Self {
        Self {
            inbox_address,
            ..Default::default()
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}
