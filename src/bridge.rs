//! Moving value between layers.
//!
//! Every transfer is a [`BridgeOperation`] walking the phases
//! `initiated → l1-confirmed → l2-observed → complete`, or dropping into
//! `failed` from any non-terminal phase. "l1" and "l2" name the source and
//! destination side, so a withdrawal walks the same phases. Phases only move
//! forward; a failed operation is handed back to the caller, who can
//! [`BridgeOperation::resume`] it later.

use std::{fmt, sync::Arc};

use alloy_primitives::{Address, B256, U256, address};
use alloy_sol_macro::sol;
use alloy_sol_types::SolCall;
use serde::Serialize;
use tokio::{
    task::JoinSet,
    time::{Instant, sleep, timeout_at},
};
use tracing::{debug, info, warn};

use crate::{
    account::{Layer, wei_to_gwei},
    config::BridgeConfig,
    rpc::{ChainRpc, Confirmation, RpcClientPool},
    store::AccountStore,
    transaction::{Signer, TransactionIntent},
};

sol! {
    interface IInbox {
        function depositEth() external payable returns (uint256);
    }

    interface IArbSys {
        function withdrawEth(address destination) external payable returns (uint256);
    }
}

/// ArbSys precompile on the rollup.
pub const ARB_SYS_ADDRESS: Address = address!("0x0000000000000000000000000000000000000064");

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BridgePhase {
    Initiated,
    L1Confirmed,
    L2Observed,
    Complete,
    Failed,
}

impl BridgePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    fn next(&self) -> Option<BridgePhase> {
        match self {
            Self::Initiated => Some(Self::L1Confirmed),
            Self::L1Confirmed => Some(Self::L2Observed),
            Self::L2Observed => Some(Self::Complete),
            Self::Complete | Self::Failed => None,
        }
    }
}

impl fmt::Display for BridgePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initiated => "initiated",
            Self::L1Confirmed => "l1-confirmed",
            Self::L2Observed => "l2-observed",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("bridge operation {operation} cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub operation: String,
    pub from: BridgePhase,
    pub to: BridgePhase,
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeOperation {
    pub id: String,
    pub account_id: String,
    pub source: Layer,
    pub destination: Layer,
    pub amount: U256,
    pub phase: BridgePhase,
    /// Every phase this operation has been in, in order.
    pub history: Vec<BridgePhase>,
    /// Last phase reached before failing.
    pub last_phase: BridgePhase,
    #[serde(skip)]
    pub deadline: Instant,
    pub source_tx: Option<B256>,
    /// Destination balance before the source transaction was sent.
    pub destination_baseline: Option<U256>,
    /// Cached balance deltas already written, so a re-drive of settlement
    /// never applies one twice.
    pub source_debited: bool,
    pub destination_credited: bool,
    pub error: Option<String>,
}

impl BridgeOperation {
    pub fn new(
        id: impl Into<String>,
        account_id: impl Into<String>,
        source: Layer,
        amount: U256,
        deadline: Instant,
    ) -> Self {
        Self {
            id: id.into(),
            account_id: account_id.into(),
            source,
            destination: source.other(),
            amount,
            phase: BridgePhase::Initiated,
            history: vec![BridgePhase::Initiated],
            last_phase: BridgePhase::Initiated,
            deadline,
            source_tx: None,
            destination_baseline: None,
            source_debited: false,
            destination_credited: false,
            error: None,
        }
    }

    /// Move one phase forward. Regressions and skips are refused.
    pub fn advance(&mut self, to: BridgePhase) -> Result<(), InvalidTransition> {
        let allowed = match to {
            BridgePhase::Failed => !self.phase.is_terminal(),
            _ => self.phase.next() == Some(to),
        };
        if !allowed {
            return Err(InvalidTransition {
                operation: self.id.clone(),
                from: self.phase,
                to,
            });
        }

        info!(operation = %self.id, from = %self.phase, to = %to, "Bridge phase advanced");
        if to != BridgePhase::Failed {
            self.last_phase = to;
        }
        self.phase = to;
        self.history.push(to);
        Ok(())
    }

    fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(
            operation = %self.id,
            account = %self.account_id,
            phase = %self.phase,
            %reason,
            "Bridge operation failed"
        );
        self.error = Some(reason);
        // Only non-terminal operations are driven, so this transition is always valid.
        let _ = self.advance(BridgePhase::Failed);
    }

    /// Fresh operation continuing a failed one from its last reached phase.
    ///
    /// Once the source transaction is confirmed, resuming only waits for the
    /// destination credit again; the value is never sent twice.
    pub fn resume(&self, id: impl Into<String>, deadline: Instant) -> Self {
        let phase = self.last_phase;
        Self {
            id: id.into(),
            phase,
            history: vec![phase],
            last_phase: phase,
            deadline,
            error: None,
            ..self.clone()
        }
    }

    pub fn failure(&self) -> Option<BridgeFailure> {
        (self.phase == BridgePhase::Failed).then(|| BridgeFailure {
            operation_id: self.id.clone(),
            account_id: self.account_id.clone(),
            source: self.source,
            last_phase: self.last_phase,
            source_tx: self.source_tx,
            reason: self.error.clone().unwrap_or_default(),
        })
    }
}

/// Structured record of a failed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeFailure {
    pub operation_id: String,
    pub account_id: String,
    pub source: Layer,
    pub last_phase: BridgePhase,
    pub source_tx: Option<B256>,
    pub reason: String,
}

#[derive(Debug, Default, Serialize)]
pub struct BridgeReport {
    pub completed: Vec<String>,
    pub failures: Vec<BridgeFailure>,
}

type Observer = Arc<dyn Fn(&BridgeOperation) + Send + Sync>;

pub struct BridgeCoordinator<C> {
    store: AccountStore,
    signer: Signer,
    rpc: Arc<RpcClientPool<C>>,
    config: BridgeConfig,
    observer: Option<Observer>,
}

impl<C: ChainRpc> BridgeCoordinator<C> {
    pub fn new(
        store: AccountStore,
        signer: Signer,
        rpc: Arc<RpcClientPool<C>>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            store,
            signer,
            rpc,
            config,
            observer: None,
        }
    }

    /// Called after every phase change.
    pub fn with_observer(mut self, observer: impl Fn(&BridgeOperation) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Bridge `amount` from the account on `source` to the same account on
    /// the other layer and return the operation in its terminal phase.
    pub async fn bridge(&self, account_id: &str, source: Layer, amount: U256) -> BridgeOperation {
        let id = format!("bridge-{source}-{account_id}-{}", rand::random::<u32>());
        let deadline = Instant::now() + self.config.deadline;
        let mut op = BridgeOperation::new(id, account_id, source, amount, deadline);
        self.drive(&mut op).await;
        op
    }

    /// Bridge the same amount for many accounts concurrently.
    pub async fn bridge_all(self: &Arc<Self>, account_ids: &[String], source: Layer, amount: U256) -> BridgeReport {
        let mut tasks = JoinSet::new();
        for account_id in account_ids {
            let this = Arc::clone(self);
            let account_id = account_id.clone();
            tasks.spawn(async move { this.bridge(&account_id, source, amount).await });
        }

        let mut report = BridgeReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(op) => match op.failure() {
                    Some(failure) => report.failures.push(failure),
                    None => report.completed.push(op.account_id),
                },
                Err(e) => warn!(error = %e, "Bridge task panicked"),
            }
        }
        report
    }

    /// Run the state machine until the operation is terminal.
    pub async fn drive(&self, op: &mut BridgeOperation) {
        while !op.phase.is_terminal() {
            let step = match op.phase {
                BridgePhase::Initiated => self.send_source_tx(op).await,
                BridgePhase::L1Confirmed => self.observe_destination(op).await,
                BridgePhase::L2Observed => self.settle(op),
                BridgePhase::Complete | BridgePhase::Failed => break,
            };

            match step {
                Ok(next) => {
                    if let Err(e) = op.advance(next) {
                        op.fail(e.to_string());
                    }
                }
                Err(reason) => op.fail(reason),
            }

            if let Some(observer) = &self.observer {
                observer(op);
            }
        }
    }

    fn source_intent(&self, op: &BridgeOperation, recipient_address: Address) -> TransactionIntent {
        let (to, calldata) = match op.source {
            Layer::L1 => (self.config.inbox_address, IInbox::depositEthCall {}.abi_encode()),
            Layer::L2 => (
                ARB_SYS_ADDRESS,
                IArbSys::withdrawEthCall {
                    destination: recipient_address,
                }
                .abi_encode(),
            ),
        };
        TransactionIntent::transfer(format!("{}-source", op.id), &op.account_id, op.source, to, op.amount)
            .with_payload(calldata.into(), self.config.gas_limit)
    }

    /// `initiated → l1-confirmed`
    async fn send_source_tx(&self, op: &mut BridgeOperation) -> Result<BridgePhase, String> {
        let account = self.store.get(&op.account_id).map_err(|e| e.to_string())?;

        if op.destination_baseline.is_none() {
            let baseline = timeout_at(
                op.deadline,
                self.rpc.get_balance(op.destination, account.address),
            )
            .await
            .map_err(|_| "deadline passed reading destination balance".to_string())?
            .map_err(|e| format!("reading destination balance: {e}"))?;
            op.destination_baseline = Some(baseline);
        }

        let intent = self.source_intent(op, account.address);
        let nonce = self
            .store
            .reserve_nonce(&op.account_id, op.source)
            .map_err(|e| e.to_string())?;

        let signed = match self.signer.sign(&account, &intent, nonce) {
            Ok(signed) => signed,
            Err(e) => {
                self.rollback(&op.account_id, op.source, nonce);
                return Err(e.to_string());
            }
        };

        let hash = match timeout_at(op.deadline, self.rpc.submit(&signed)).await {
            Ok(Ok(hash)) => hash,
            Ok(Err(e)) => {
                if e.never_delivered() {
                    self.rollback(&op.account_id, op.source, nonce);
                }
                return Err(format!("submitting source transaction: {e}"));
            }
            Err(_) => return Err("deadline passed while submitting source transaction".into()),
        };
        op.source_tx = Some(hash);
        info!(operation = %op.id, %hash, nonce, layer = %op.source, "Bridge source transaction sent");

        match self
            .rpc
            .wait_for_confirmation(op.source, hash, op.deadline, self.config.poll_interval)
            .await
        {
            Confirmation::Confirmed { .. } => Ok(BridgePhase::L1Confirmed),
            Confirmation::Reverted { block } => {
                Err(format!("source transaction {hash} reverted in block {block:?}"))
            }
            Confirmation::TimedOut => Err(format!("source transaction {hash} not confirmed before deadline")),
        }
    }

    /// `l1-confirmed → l2-observed`
    async fn observe_destination(&self, op: &mut BridgeOperation) -> Result<BridgePhase, String> {
        let account = self.store.get(&op.account_id).map_err(|e| e.to_string())?;
        let baseline = op.destination_baseline.unwrap_or_default();
        let expected = baseline.saturating_add(op.amount);

        loop {
            let endpoint = self.rpc.endpoint(op.destination);
            match timeout_at(op.deadline, endpoint.balance(account.address)).await {
                Ok(Ok(balance)) if balance >= expected => return Ok(BridgePhase::L2Observed),
                Ok(Ok(balance)) => {
                    debug!(operation = %op.id, %balance, %expected, "Credit not visible yet")
                }
                Ok(Err(e)) => debug!(operation = %op.id, error = %e, "Balance poll failed"),
                Err(_) => break,
            }

            let now = Instant::now();
            if now >= op.deadline {
                break;
            }
            sleep(self.config.poll_interval.min(op.deadline - now)).await;
        }
        Err(format!(
            "credit of {} on {} not observed before deadline",
            op.amount, op.destination
        ))
    }

    /// `l2-observed → complete`
    ///
    /// The source debit goes first so the destination credit is the last
    /// write before completion. Each delta is applied at most once per
    /// operation, including across [`BridgeOperation::resume`].
    fn settle(&self, op: &mut BridgeOperation) -> Result<BridgePhase, String> {
        let gwei = wei_to_gwei(op.amount);
        if !op.source_debited {
            self.store
                .apply_balance_delta(&op.account_id, op.source, -gwei)
                .map_err(|e| format!("debiting {}: {e}", op.source))?;
            op.source_debited = true;
        }
        if !op.destination_credited {
            self.store
                .apply_balance_delta(&op.account_id, op.destination, gwei)
                .map_err(|e| format!("crediting {}: {e}", op.destination))?;
            op.destination_credited = true;
        }
        Ok(BridgePhase::Complete)
    }

    fn rollback(&self, account_id: &str, layer: Layer, nonce: u64) {
        if let Err(e) = self.store.rollback_nonce(account_id, layer, nonce) {
            warn!(account_id, %layer, nonce, error = %e, "Nonce rollback failed");
        }
    }
}
