//! The stress loop.
//!
//! A single ticker hands out dispatch tokens at the configured rate. Every
//! token becomes a task that reserves a nonce, signs, submits and then waits
//! for the receipt. The number of unresolved tasks is bounded by a semaphore;
//! a tick that finds no free slot waits for one instead of being dropped.
//!
//! Each account has a lane lock held from nonce reservation until the
//! submission call returns, so an account's transactions reach the endpoint
//! in nonce order while confirmations still overlap.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use alloy_primitives::{Address, B256};
use rand::{
    Rng,
    distr::{Distribution, weighted::WeightedIndex},
};
use serde::Serialize;
use tokio::{
    sync::{Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore},
    task::JoinSet,
    time::{Instant, MissedTickBehavior, interval, sleep_until},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    account::{AccountStatus, Layer, gwei_to_wei, wei_to_gwei},
    config::{AccountSelection, StressConfig},
    error::StressError,
    metrics::{OutcomeKind, Stats, StatsSnapshot, TransactionOutcome, print_snapshot},
    rpc::{ChainRpc, Confirmation, RejectReason, RpcClientPool},
    store::{AccountStore, StoreError},
    transaction::{Signer, TransactionIntent},
};

/// Why a run stopped before reaching its duration or volume.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum AbortReason {
    FailureThreshold { rate: f64 },
    StoreUnavailable { message: String },
    NoActiveAccounts,
    Cancelled,
    /// The configured rate has no usable tick period.
    InvalidRate { rate: f64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub target_rate: f64,
    pub abort: Option<AbortReason>,
    /// Intents that already had an outcome from an earlier run with this id.
    pub skipped: u64,
    pub suspended: Vec<String>,
    pub stats: StatsSnapshot,
}

impl RunSummary {
    pub fn print(&self) {
        print_snapshot(&format!("Run {}", self.run_id), self.target_rate, &self.stats);
        if let Some(abort) = &self.abort {
            println!("Aborted: {abort:?}");
        }
        if self.skipped > 0 {
            println!("Skipped {} intents recorded by an earlier run", self.skipped);
        }
        if !self.suspended.is_empty() {
            println!("Suspended accounts: {}", self.suspended.join(", "));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An intent that has been dispatched but has no outcome yet.
#[derive(Debug)]
struct Pending {
    account_id: String,
    layer: Layer,
    nonce: Option<u64>,
    hash: Option<B256>,
    started: Instant,
}

struct Dispatch {
    intent: TransactionIntent,
    /// Pool account credited on confirmation.
    recipient_id: Option<String>,
}

/// State shared between the scheduler and its submission tasks.
struct Shared<C> {
    store: AccountStore,
    signer: Signer,
    rpc: Arc<RpcClientPool<C>>,
    config: StressConfig,
    stats: Arc<Stats>,
    lanes: HashMap<String, Arc<AsyncMutex<()>>>,
    pending: Mutex<HashMap<String, Pending>>,
    suspended: Mutex<HashSet<String>>,
    abort: Mutex<Option<AbortReason>>,
    stop: CancellationToken,
}

impl<C: ChainRpc> Shared<C> {
    fn abort_run(&self, reason: AbortReason) {
        let mut abort = lock(&self.abort);
        if abort.is_none() {
            warn!(?reason, "Aborting run");
            *abort = Some(reason);
        }
        self.stop.cancel();
    }

    fn store_lost(&self, e: StoreError) {
        self.abort_run(AbortReason::StoreUnavailable {
            message: e.to_string(),
        });
    }

    fn is_suspended(&self, account_id: &str) -> bool {
        lock(&self.suspended).contains(account_id)
    }

    async fn suspend(&self, account_id: &str, reason: RejectReason) {
        if !lock(&self.suspended).insert(account_id.to_string()) {
            return;
        }
        warn!(account_id, %reason, "Suspending account");
        let id = account_id.to_string();
        if let Err(e) = self
            .store
            .run_blocking(move |store| store.set_status(&id, AccountStatus::Suspended))
            .await
        {
            self.store_lost(e);
        }
    }

    async fn rollback(&self, account_id: &str, layer: Layer, nonce: u64) {
        let id = account_id.to_string();
        if let Err(e) = self
            .store
            .run_blocking(move |store| store.rollback_nonce(&id, layer, nonce))
            .await
        {
            warn!(account_id, %layer, nonce, error = %e, "Nonce rollback failed");
        }
    }

    fn update_pending(&self, intent_id: &str, f: impl FnOnce(&mut Pending)) {
        if let Some(pending) = lock(&self.pending).get_mut(intent_id) {
            f(pending);
        }
    }

    async fn execute(self: Arc<Self>, dispatch: Dispatch, _permit: OwnedSemaphorePermit) {
        let (kind, error) = match self.submit(&dispatch.intent).await {
            Ok(hash) => self.confirm(&dispatch, hash).await,
            Err(e) => {
                if e.is_fatal_to_run() {
                    self.abort_run(AbortReason::StoreUnavailable {
                        message: e.to_string(),
                    });
                }
                (e.outcome_kind(), Some(e.to_string()))
            }
        };
        self.finish(&dispatch.intent.id, kind, error).await;
    }

    /// Reserve, sign and submit while holding the account's lane.
    async fn submit(&self, intent: &TransactionIntent) -> Result<B256, StressError> {
        let account_id = intent.account_id.as_str();
        let lane = self
            .lanes
            .get(account_id)
            .cloned()
            .ok_or_else(|| StressError::InvalidIntent(format!("{account_id} is not in the pool")))?;
        let _lane = lane.lock().await;

        if self.is_suspended(account_id) {
            return Err(StressError::InvalidIntent(format!("{account_id} is suspended")));
        }

        let (id, layer) = (account_id.to_string(), intent.layer);
        let (account, nonce) = self
            .store
            .run_blocking(move |store| Ok((store.get(&id)?, store.reserve_nonce(&id, layer)?)))
            .await?;
        self.update_pending(&intent.id, |p| p.nonce = Some(nonce));

        let signed = match self.signer.sign(&account, intent, nonce) {
            Ok(signed) => signed,
            Err(e) => {
                self.rollback(account_id, intent.layer, nonce).await;
                return Err(e.into());
            }
        };

        match self.rpc.submit(&signed).await {
            Ok(hash) => {
                self.update_pending(&intent.id, |p| p.hash = Some(hash));
                debug!(intent = %intent.id, account_id, nonce, %hash, "Submitted");
                Ok(hash)
            }
            Err(e) => {
                if e.never_delivered() {
                    self.rollback(account_id, intent.layer, nonce).await;
                }
                if let Some(
                    reason @ (RejectReason::NonceTooLow
                    | RejectReason::NonceTooHigh
                    | RejectReason::InsufficientFunds),
                ) = e.reject_reason()
                {
                    self.suspend(account_id, reason).await;
                }
                Err(e.into())
            }
        }
    }

    async fn confirm(&self, dispatch: &Dispatch, hash: B256) -> (OutcomeKind, Option<String>) {
        let intent = &dispatch.intent;
        let deadline = Instant::now() + self.config.confirmation_timeout;
        match self
            .rpc
            .wait_for_confirmation(intent.layer, hash, deadline, self.config.receipt_poll_interval)
            .await
        {
            Confirmation::Confirmed { .. } => {
                if let Err(e) = self.settle(dispatch).await {
                    self.store_lost(e);
                }
                (OutcomeKind::Confirmed, None)
            }
            Confirmation::Reverted { block } => (
                OutcomeKind::Failed,
                Some(format!("reverted in block {block:?}")),
            ),
            Confirmation::TimedOut => (
                OutcomeKind::TimedOut,
                Some("not confirmed before the confirmation timeout".into()),
            ),
        }
    }

    async fn settle(&self, dispatch: &Dispatch) -> Result<(), StoreError> {
        let intent = &dispatch.intent;
        let gwei = wei_to_gwei(intent.value);
        let (sender, layer) = (intent.account_id.clone(), intent.layer);
        let recipient = dispatch.recipient_id.clone();
        self.store
            .run_blocking(move |store| {
                store.apply_balance_delta(&sender, layer, -gwei)?;
                if let Some(recipient) = &recipient {
                    store.apply_balance_delta(recipient, layer, gwei)?;
                }
                Ok(())
            })
            .await
    }

    async fn finish(&self, intent_id: &str, kind: OutcomeKind, error: Option<String>) {
        let Some(pending) = lock(&self.pending).remove(intent_id) else {
            return;
        };
        self.record(intent_id, pending, kind, error).await;
        self.check_failure_rate();
    }

    async fn record(&self, intent_id: &str, pending: Pending, kind: OutcomeKind, error: Option<String>) {
        let outcome = TransactionOutcome {
            intent_id: intent_id.to_string(),
            account_id: pending.account_id,
            layer: pending.layer,
            nonce: pending.nonce,
            hash: pending.hash,
            kind,
            latency: pending.started.elapsed(),
            error,
        };
        match &outcome.error {
            Some(error) => debug!(intent = intent_id, ?kind, %error, "Outcome"),
            None => debug!(intent = intent_id, ?kind, "Outcome"),
        }

        self.stats.record(&outcome);
        if self.config.persist_outcomes {
            if let Err(e) = self
                .store
                .run_blocking(move |store| store.record_outcome(&outcome))
                .await
            {
                self.store_lost(e);
            }
        }
    }

    fn check_failure_rate(&self) {
        if let Some(rate) = self.stats.failure_rate() {
            if rate > self.config.failure_threshold {
                self.abort_run(AbortReason::FailureThreshold { rate });
            }
        }
    }

    /// Record everything still unresolved after the drain as timed out.
    ///
    /// Dispatch is over at this point, so these outcomes are not held
    /// against the failure threshold.
    async fn time_out_pending(&self) {
        let mut leftover: Vec<_> = lock(&self.pending).drain().collect();
        leftover.sort_by(|a, b| a.0.cmp(&b.0));
        if !leftover.is_empty() {
            warn!(count = leftover.len(), "Intents unresolved after drain");
        }
        for (intent_id, pending) in leftover {
            self.record(
                &intent_id,
                pending,
                OutcomeKind::TimedOut,
                Some("still in flight when the drain grace period ended".into()),
            )
            .await;
        }
    }
}

/// Picks sending accounts, skipping suspended ones.
struct Selector {
    ids: Vec<String>,
    weights: Vec<u32>,
    weighted: bool,
    cursor: usize,
}

impl Selector {
    fn new(ids: Vec<String>, selection: &AccountSelection) -> Self {
        let (weighted, weights) = match selection {
            AccountSelection::RoundRobin => (false, vec![1; ids.len()]),
            AccountSelection::Weighted(table) => {
                let weights = ids
                    .iter()
                    .map(|id| {
                        table
                            .iter()
                            .find(|(name, _)| name == id)
                            .map_or(1, |(_, w)| *w)
                    })
                    .collect();
                (true, weights)
            }
        };
        Self {
            ids,
            weights,
            weighted,
            cursor: 0,
        }
    }

    fn next(&mut self, excluded: &HashSet<String>) -> Option<usize> {
        if self.weighted {
            let weights = self
                .ids
                .iter()
                .zip(&self.weights)
                .map(|(id, w)| if excluded.contains(id) { 0 } else { *w });
            let dist = WeightedIndex::new(weights).ok()?;
            return Some(dist.sample(&mut rand::rng()));
        }

        for _ in 0..self.ids.len() {
            let index = self.cursor % self.ids.len();
            self.cursor = self.cursor.wrapping_add(1);
            if !excluded.contains(&self.ids[index]) {
                return Some(index);
            }
        }
        None
    }
}

/// Deterministic intent ids `{run_id}-{seq}`.
struct Sequence {
    run_id: String,
    next: u64,
    volume: Option<u64>,
    skip_recorded: bool,
    skipped: u64,
}

impl Sequence {
    fn exhausted(&self) -> bool {
        self.volume.is_some_and(|volume| self.next >= volume)
    }

    async fn next_id(&mut self, store: &AccountStore) -> Result<Option<(u64, String)>, StoreError> {
        while !self.exhausted() {
            let seq = self.next;
            self.next += 1;
            let id = format!("{}-{seq}", self.run_id);
            if self.skip_recorded {
                let key = id.clone();
                if store.run_blocking(move |store| store.outcome(&key)).await?.is_some() {
                    self.skipped += 1;
                    continue;
                }
            }
            return Ok(Some((seq, id)));
        }
        Ok(None)
    }
}

pub struct LoadDriver<C> {
    store: AccountStore,
    signer: Signer,
    rpc: Arc<RpcClientPool<C>>,
    config: StressConfig,
    stats: Arc<Stats>,
}

impl<C: ChainRpc> LoadDriver<C> {
    pub fn new(
        store: AccountStore,
        signer: Signer,
        rpc: Arc<RpcClientPool<C>>,
        config: StressConfig,
    ) -> Self {
        let stats = Arc::new(Stats::new(config.failure_window));
        Self {
            store,
            signer,
            rpc,
            config,
            stats,
        }
    }

    /// Live view of the run, safe to snapshot from another task.
    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    /// Drive load until the duration or volume is reached, the failure
    /// threshold trips or `cancel` fires, then drain and summarize.
    pub async fn run(&self, cancel: CancellationToken) -> RunSummary {
        let stop = cancel.child_token();
        let mut skipped = 0;

        let Some(period) = self.config.tick_period() else {
            warn!(rate = self.config.tx_rate, "Transaction rate has no usable tick period");
            return self.summary(
                Some(AbortReason::InvalidRate {
                    rate: self.config.tx_rate,
                }),
                0,
                Vec::new(),
            );
        };

        let pool = match self.store.list() {
            Ok(accounts) => accounts
                .into_iter()
                .filter(|a| a.is_active())
                .map(|a| (a.id, a.address))
                .collect::<Vec<_>>(),
            Err(e) => {
                return self.summary(
                    Some(AbortReason::StoreUnavailable {
                        message: e.to_string(),
                    }),
                    0,
                    Vec::new(),
                );
            }
        };

        let shared = Arc::new(Shared {
            store: self.store.clone(),
            signer: self.signer.clone(),
            rpc: self.rpc.clone(),
            config: self.config.clone(),
            stats: self.stats.clone(),
            lanes: pool
                .iter()
                .map(|(id, _)| (id.clone(), Arc::new(AsyncMutex::new(()))))
                .collect(),
            pending: Mutex::new(HashMap::new()),
            suspended: Mutex::new(HashSet::new()),
            abort: Mutex::new(None),
            stop: stop.clone(),
        });

        info!(
            run_id = %self.config.run_id,
            accounts = pool.len(),
            tx_rate = self.config.tx_rate,
            max_in_flight = self.config.max_in_flight,
            "Starting load driver"
        );

        let mut tasks = JoinSet::new();
        if pool.is_empty() {
            shared.abort_run(AbortReason::NoActiveAccounts);
        } else {
            skipped = self.dispatch(&shared, &pool, period, &mut tasks).await;
        }

        if cancel.is_cancelled() {
            shared.abort_run(AbortReason::Cancelled);
        }
        self.drain(&mut tasks).await;
        shared.time_out_pending().await;

        let abort = lock(&shared.abort).clone();
        let mut suspended: Vec<_> = lock(&shared.suspended).iter().cloned().collect();
        suspended.sort();
        self.summary(abort, skipped, suspended)
    }

    async fn dispatch(
        &self,
        shared: &Arc<Shared<C>>,
        pool: &[(String, Address)],
        period: Duration,
        tasks: &mut JoinSet<()>,
    ) -> u64 {
        let config = &self.config;
        let semaphore = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let end = config.duration.map(|d| Instant::now() + d);
        let layers = if config.layers.is_empty() {
            vec![Layer::L2]
        } else {
            config.layers.clone()
        };

        let mut selector = Selector::new(pool.iter().map(|(id, _)| id.clone()).collect(), &config.selection);
        let mut sequence = Sequence {
            run_id: config.run_id.clone(),
            next: 0,
            volume: config.volume,
            skip_recorded: config.persist_outcomes,
            skipped: 0,
        };

        while !sequence.exhausted() {
            tokio::select! {
                biased;
                _ = shared.stop.cancelled() => break,
                _ = sleep_until(end.unwrap_or_else(far_future)), if end.is_some() => {
                    info!("Duration elapsed, stopping dispatch");
                    break;
                }
                _ = ticker.tick() => {}
            }

            let permit = match semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    self.stats.record_deferred();
                    debug!("At max in-flight, deferring tick");
                    tokio::select! {
                        biased;
                        _ = shared.stop.cancelled() => break,
                        permit = semaphore.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    }
                }
            };

            let (seq, intent_id) = match sequence.next_id(&self.store).await {
                Ok(Some(next)) => next,
                Ok(None) => break,
                Err(e) => {
                    shared.abort_run(AbortReason::StoreUnavailable {
                        message: e.to_string(),
                    });
                    break;
                }
            };

            let excluded = lock(&shared.suspended).clone();
            let Some(sender) = selector.next(&excluded) else {
                shared.abort_run(AbortReason::NoActiveAccounts);
                break;
            };

            let layer = layers[(seq as usize) % layers.len()];
            let dispatch = self.build_intent(intent_id, layer, sender, pool);
            shared.track_pending(&dispatch.intent);
            self.stats.record_dispatched();
            tasks.spawn(shared.clone().execute(dispatch, permit));

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    warn!(error = %e, "Submission task failed");
                }
            }
        }

        if sequence.skipped > 0 {
            info!(skipped = sequence.skipped, "Skipped intents with recorded outcomes");
        }
        sequence.skipped
    }

    fn build_intent(
        &self,
        intent_id: String,
        layer: Layer,
        sender: usize,
        pool: &[(String, Address)],
    ) -> Dispatch {
        let mut rng = rand::rng();
        let (account_id, _) = &pool[sender];

        let (recipient, recipient_id) = match self.config.recipient {
            Some(address) => (address, None),
            None if pool.len() == 1 => (pool[0].1, Some(pool[0].0.clone())),
            None => {
                let mut other = rng.random_range(0..pool.len() - 1);
                if other >= sender {
                    other += 1;
                }
                (pool[other].1, Some(pool[other].0.clone()))
            }
        };

        let (lo, hi) = self.config.value_gwei;
        let gwei = if lo >= hi { lo } else { rng.random_range(lo..=hi) };

        Dispatch {
            intent: TransactionIntent::transfer(intent_id, account_id, layer, recipient, gwei_to_wei(gwei)),
            recipient_id,
        }
    }

    /// Wait for in-flight tasks up to the grace period, then abort the rest.
    async fn drain(&self, tasks: &mut JoinSet<()>) {
        let in_flight = tasks.len();
        if in_flight == 0 {
            return;
        }
        info!(in_flight, grace = ?self.config.drain_grace, "Draining in-flight transactions");

        let grace = sleep_until(Instant::now() + self.config.drain_grace);
        tokio::pin!(grace);
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Err(e)) if !e.is_cancelled() => warn!(error = %e, "Submission task failed"),
                    Some(_) => {}
                    None => return,
                },
                _ = &mut grace => {
                    warn!(remaining = tasks.len(), "Drain grace period ended");
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    return;
                }
            }
        }
    }

    fn summary(&self, abort: Option<AbortReason>, skipped: u64, suspended: Vec<String>) -> RunSummary {
        RunSummary {
            run_id: self.config.run_id.clone(),
            target_rate: self.config.tx_rate,
            abort,
            skipped,
            suspended,
            stats: self.stats.snapshot(),
        }
    }
}

impl<C> Shared<C> {
    fn track_pending(&self, intent: &TransactionIntent) {
        lock(&self.pending).insert(
            intent.id.clone(),
            Pending {
                account_id: intent.account_id.clone(),
                layer: intent.layer,
                nonce: None,
                hash: None,
                started: Instant::now(),
            },
        );
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400 * 365)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{
        account::AccountSpec,
        config::{LayerConfig, RetryPolicy},
        mock::MockChain,
        transaction::ChainParams,
    };

    const POOL: [&str; 3] = ["threaduser_0", "threaduser_1", "threaduser_2"];

    struct Harness {
        store: AccountStore,
        l1: MockChain,
        l2: MockChain,
    }

    impl Harness {
        fn new(l2: MockChain) -> Self {
            let store = AccountStore::in_memory();
            for name in POOL {
                store
                    .provision(&AccountSpec::named(name).unwrap(), [0, 0], AccountStatus::Active)
                    .unwrap();
            }
            Self {
                store,
                l1: MockChain::new(),
                l2,
            }
        }

        fn driver(&self, config: StressConfig) -> LoadDriver<MockChain> {
            let rpc = Arc::new(RpcClientPool::new(
                self.l1.clone(),
                self.l2.clone(),
                RetryPolicy::default().with_jitter(0.0),
            ));
            let signer = Signer::new(
                ChainParams::from(&LayerConfig::new("http://l1", 1337)),
                ChainParams::from(&LayerConfig::new("http://l2", 412346)),
            );
            LoadDriver::new(self.store.clone(), signer, rpc, config)
        }

        /// Nonces submitted per sender, in submission order. Senders are
        /// found through the persisted outcomes of `run_ids`.
        fn nonces_by_sender(&self, run_ids: &[&str]) -> BTreeMap<String, Vec<u64>> {
            let mut owners = HashMap::new();
            for run_id in run_ids {
                for seq in 0.. {
                    let Some(outcome) = self.store.outcome(&format!("{run_id}-{seq}")).unwrap() else {
                        break;
                    };
                    if let Some(hash) = outcome.hash {
                        owners.insert(hash, outcome.account_id);
                    }
                }
            }

            let mut by_sender = BTreeMap::new();
            for submission in self.l2.submissions() {
                let owner = owners.get(&submission.hash).cloned().unwrap_or_default();
                by_sender
                    .entry(owner)
                    .or_insert_with(Vec::new)
                    .push(submission.nonce);
            }
            by_sender
        }
    }

    fn config() -> StressConfig {
        StressConfig::default()
            .with_run_id("test")
            .with_tx_rate(10.0)
            .with_duration(Duration::from_secs(2))
            .with_receipt_poll_interval(Duration::from_millis(50))
            .with_drain_grace(Duration::from_secs(5))
            .with_persist_outcomes(true)
    }

    fn strictly_sequential(nonces: &[u64]) -> bool {
        nonces.windows(2).all(|w| w[1] == w[0] + 1)
    }

    #[tokio::test(start_paused = true)]
    async fn steady_rate_confirms_every_transaction() {
        let harness = Harness::new(MockChain::new());
        let summary = harness.driver(config()).run(CancellationToken::new()).await;

        assert_eq!(summary.abort, None);
        assert!((18..=21).contains(&summary.stats.recorded), "{:?}", summary.stats);
        assert_eq!(summary.stats.confirmed, summary.stats.recorded);
        assert_eq!(summary.stats.dispatched, summary.stats.recorded);

        assert_eq!(harness.l2.submissions().len() as u64, summary.stats.recorded);
        let by_sender = harness.nonces_by_sender(&["test"]);
        assert_eq!(by_sender.keys().collect::<Vec<_>>(), POOL);
        for nonces in by_sender.values() {
            assert_eq!(nonces[0], 0);
            assert!(strictly_sequential(nonces), "{nonces:?}");
        }

        let total: u64 = POOL
            .iter()
            .map(|id| harness.store.get(id).unwrap().l2.nonce)
            .sum();
        assert_eq!(total, summary.stats.recorded);
    }

    #[tokio::test(start_paused = true)]
    async fn submission_order_follows_reservation_order() {
        let harness = Harness::new(MockChain::new().with_submit_delay(Duration::from_millis(120)));
        let config = config()
            .with_tx_rate(20.0)
            .with_duration(Duration::from_secs(1))
            .with_selection(AccountSelection::Weighted(vec![
                ("threaduser_0".into(), 1),
                ("threaduser_1".into(), 0),
                ("threaduser_2".into(), 0),
            ]));

        let summary = harness.driver(config).run(CancellationToken::new()).await;
        assert!(summary.stats.recorded > 5);

        let nonces: Vec<_> = harness.l2.submissions().iter().map(|s| s.nonce).collect();
        assert_eq!(nonces, (0..nonces.len() as u64).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn resumed_run_never_reuses_a_nonce() {
        let harness = Harness::new(MockChain::new());
        let cancel = CancellationToken::new();
        let crash = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(750)).await;
            crash.cancel();
        });
        let first = harness.driver(config()).run(cancel).await;
        assert_eq!(first.abort, Some(AbortReason::Cancelled));

        let second = harness
            .driver(config().with_run_id("test-resumed"))
            .run(CancellationToken::new())
            .await;
        assert!(second.stats.recorded > 0);

        let by_sender = harness.nonces_by_sender(&["test", "test-resumed"]);
        assert_eq!(by_sender.len(), 3);
        for nonces in by_sender.values() {
            let unique: HashSet<_> = nonces.iter().collect();
            assert_eq!(unique.len(), nonces.len(), "{nonces:?}");
            assert!(strictly_sequential(nonces), "{nonces:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rerun_with_same_id_skips_recorded_intents() {
        let harness = Harness::new(MockChain::new());
        let config = config().with_volume(6).with_duration(Duration::from_secs(60));
        let first = harness.driver(config.clone()).run(CancellationToken::new()).await;
        assert_eq!(first.stats.recorded, 6);

        let second = harness
            .driver(config.with_volume(10))
            .run(CancellationToken::new())
            .await;
        assert_eq!(second.skipped, 6);
        assert_eq!(second.stats.recorded, 4);
        assert_eq!(harness.l2.submissions().len(), 10);
        assert!(harness.store.outcome("test-9").unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn failing_endpoint_aborts_early() {
        let l2 = MockChain::new();
        l2.reject_all_submissions(RejectReason::Other);
        let harness = Harness::new(l2);
        let config = config()
            .with_tx_rate(20.0)
            .with_duration(Duration::from_secs(60))
            .with_failure_threshold(0.5, 10);

        let summary = harness.driver(config).run(CancellationToken::new()).await;

        assert!(matches!(
            summary.abort,
            Some(AbortReason::FailureThreshold { rate }) if rate > 0.5
        ));
        assert!(summary.stats.dispatched < 20 * 60 / 10);
        assert_eq!(summary.stats.rejected, summary.stats.recorded);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_accounts_are_suspended() {
        let l2 = MockChain::new();
        l2.reject_all_submissions(RejectReason::InsufficientFunds);
        let harness = Harness::new(l2);
        let config = config().with_failure_threshold(1.0, 100);

        let summary = harness.driver(config).run(CancellationToken::new()).await;

        assert_eq!(summary.abort, Some(AbortReason::NoActiveAccounts));
        assert_eq!(summary.suspended, POOL);
        for id in POOL {
            assert_eq!(harness.store.get(id).unwrap().status, AccountStatus::Suspended);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_work_times_out_after_drain() {
        let harness = Harness::new(MockChain::new().with_receipt_delay(u32::MAX));
        let config = config()
            .with_duration(Duration::from_secs(1))
            .with_drain_grace(Duration::from_secs(2));

        let start = Instant::now();
        let summary = harness.driver(config).run(CancellationToken::new()).await;

        assert!(start.elapsed() < Duration::from_secs(4));
        assert!(summary.stats.recorded > 0);
        assert_eq!(summary.stats.timed_out, summary.stats.recorded);
        assert_eq!(summary.stats.dispatched, summary.stats.recorded);
        let outcome = harness.store.outcome("test-0").unwrap().unwrap();
        assert_eq!(outcome.kind, OutcomeKind::TimedOut);
        assert!(outcome.hash.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_timeouts_do_not_trip_the_failure_threshold() {
        let harness = Harness::new(MockChain::new().with_receipt_delay(u32::MAX));
        let config = config()
            .with_duration(Duration::from_secs(1))
            .with_drain_grace(Duration::from_secs(2))
            .with_failure_threshold(0.1, 2);

        let summary = harness.driver(config).run(CancellationToken::new()).await;

        assert!(summary.stats.timed_out >= 2);
        assert_eq!(summary.abort, None);
    }

    #[tokio::test(start_paused = true)]
    async fn unusable_rate_ends_the_run_without_dispatching() {
        let harness = Harness::new(MockChain::new());
        for rate in [0.0, f64::INFINITY] {
            let summary = harness
                .driver(config().with_tx_rate(rate))
                .run(CancellationToken::new())
                .await;
            assert!(matches!(summary.abort, Some(AbortReason::InvalidRate { .. })));
            assert_eq!(summary.stats.dispatched, 0);
        }
        assert!(harness.l2.submissions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_dispatch() {
        let harness = Harness::new(MockChain::new());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(450)).await;
            trigger.cancel();
        });

        let summary = harness
            .driver(config().with_duration(Duration::from_secs(30)))
            .run(cancel)
            .await;

        assert_eq!(summary.abort, Some(AbortReason::Cancelled));
        assert!(summary.stats.dispatched <= 5, "{:?}", summary.stats);
        assert_eq!(summary.stats.dispatched, summary.stats.recorded);
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_pool_defers_instead_of_dropping() {
        let harness = Harness::new(MockChain::new().with_receipt_delay(4));
        let config = config()
            .with_tx_rate(100.0)
            .with_duration(Duration::from_secs(1))
            .with_max_in_flight(2);

        let summary = harness.driver(config).run(CancellationToken::new()).await;

        assert!(summary.stats.deferred_ticks > 0);
        assert!(summary.stats.dispatched < 100);
        assert_eq!(summary.stats.confirmed, summary.stats.dispatched);
        assert!(summary.stats.achieved_rate < summary.target_rate);
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_transfers_move_cached_balances() {
        let harness = Harness::new(MockChain::new());
        let config = config().with_volume(9).with_duration(Duration::from_secs(60));
        let summary = harness.driver(config).run(CancellationToken::new()).await;
        assert_eq!(summary.stats.confirmed, 9);

        // value is 1 gwei per transfer and every transfer stays in the pool
        let total: i64 = POOL
            .iter()
            .map(|id| harness.store.get(id).unwrap().l2.balance_gwei)
            .sum();
        assert_eq!(total, 0);
        let sent = harness.store.get("threaduser_0").unwrap();
        assert_eq!(sent.l2.nonce, 3);
    }

    #[test]
    fn round_robin_skips_suspended_accounts() {
        let ids = POOL.iter().map(|s| s.to_string()).collect();
        let mut selector = Selector::new(ids, &AccountSelection::RoundRobin);
        let mut excluded = HashSet::new();
        assert_eq!(selector.next(&excluded), Some(0));
        excluded.insert("threaduser_1".to_string());
        assert_eq!(selector.next(&excluded), Some(2));
        assert_eq!(selector.next(&excluded), Some(0));
        excluded.extend(POOL.iter().map(|s| s.to_string()));
        assert_eq!(selector.next(&excluded), None);
    }

    #[test]
    fn weighted_selection_follows_weights() {
        let ids = vec!["a".to_string(), "b".to_string()];
        let mut selector = Selector::new(ids, &AccountSelection::Weighted(vec![("a".into(), 3)]));
        let picks = (0..4000)
            .filter(|_| selector.next(&HashSet::new()) == Some(0))
            .count();
        assert!((2700..3300).contains(&picks), "{picks}");
    }
}
