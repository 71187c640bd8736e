//! Access to the L1 and L2 JSON-RPC endpoints.
//!
//! [`ChainRpc`] is the raw per-endpoint surface; [`RpcClientPool`] adds the
//! retry policy, per-layer routing and receipt polling on top of it.

mod provider;
mod retry;

use std::{fmt, future::Future, time::Duration};

use alloy_primitives::{Address, B256, Bytes, U256};
use tokio::time::{Instant, sleep, timeout_at};
use tracing::debug;

pub use provider::AlloyRpc;
pub use retry::with_retry;

use crate::{account::Layer, config::RetryPolicy, transaction::SignedTx};

/// Why a node refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NonceTooLow,
    NonceTooHigh,
    InsufficientFunds,
    InvalidSignature,
    /// The node already holds this exact transaction.
    AlreadyKnown,
    Other,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NonceTooLow => "nonce too low",
            Self::NonceTooHigh => "nonce too high",
            Self::InsufficientFunds => "insufficient funds",
            Self::InvalidSignature => "invalid signature",
            Self::AlreadyKnown => "already known",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    #[error("transient failure: {0}")]
    Transient(String),
    /// The request never left this process (connection refused, DNS, ...).
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("rejected ({reason}): {message}")]
    Rejected { reason: RejectReason, message: String },
    #[error("gave up after {attempts} attempts in {elapsed:?}: {last}")]
    RetriesExhausted {
        attempts: u32,
        elapsed: Duration,
        /// Whether any attempt may have reached the endpoint.
        maybe_delivered: bool,
        last: Box<RpcError>,
    },
}

impl RpcError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Unreachable(_))
    }

    /// True when no attempt can have reached the endpoint.
    pub fn never_delivered(&self) -> bool {
        match self {
            Self::Unreachable(_) => true,
            Self::RetriesExhausted {
                maybe_delivered, ..
            } => !maybe_delivered,
            _ => false,
        }
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Self::Rejected { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

/// Receipt lookup result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    Confirmed { block: Option<u64> },
    Reverted { block: Option<u64> },
    /// Known to the node but not mined yet.
    Pending,
    NotFound,
}

/// Terminal result of [`RpcClientPool::wait_for_confirmation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed { block: Option<u64> },
    Reverted { block: Option<u64> },
    TimedOut,
}

/// One chain endpoint. Implementations must be safe to call from many tasks.
pub trait ChainRpc: Send + Sync + 'static {
    fn send_raw_transaction(&self, raw: &Bytes)
    -> impl Future<Output = Result<B256, RpcError>> + Send;

    fn receipt(&self, hash: B256) -> impl Future<Output = Result<ReceiptStatus, RpcError>> + Send;

    fn balance(&self, address: Address) -> impl Future<Output = Result<U256, RpcError>> + Send;

    /// Transaction count including the node's pending pool.
    fn transaction_count(&self, address: Address)
    -> impl Future<Output = Result<u64, RpcError>> + Send;
}

/// Shared handle on both layer endpoints.
#[derive(Debug)]
pub struct RpcClientPool<C> {
    l1: C,
    l2: C,
    retry: RetryPolicy,
}

impl<C: ChainRpc> RpcClientPool<C> {
    pub fn new(l1: C, l2: C, retry: RetryPolicy) -> Self {
        Self { l1, l2, retry }
    }

    pub fn endpoint(&self, layer: Layer) -> &C {
        match layer {
            Layer::L1 => &self.l1,
            Layer::L2 => &self.l2,
        }
    }

    /// Submit a signed transaction. A node that already knows the exact
    /// transaction counts as an accepted submission.
    ///
    /// "nonce too low" after a retried attempt may mean an earlier attempt
    /// landed; the receipt decides.
    pub async fn submit(&self, tx: &SignedTx) -> Result<B256, RpcError> {
        let endpoint = self.endpoint(tx.layer);
        let mut attempts = 0u32;
        let result = with_retry(&self.retry, "send_raw_transaction", tx.layer, || {
            attempts += 1;
            endpoint.send_raw_transaction(&tx.raw)
        })
        .await;

        match result {
            Err(RpcError::Rejected {
                reason: RejectReason::AlreadyKnown,
                ..
            }) => {
                debug!(hash = %tx.hash, nonce = tx.nonce, "Node already knows transaction");
                Ok(tx.hash)
            }
            Err(
                err @ RpcError::Rejected {
                    reason: RejectReason::NonceTooLow,
                    ..
                },
            ) if attempts > 1 => match self.get_receipt(tx.layer, tx.hash).await {
                Ok(ReceiptStatus::NotFound) | Err(_) => Err(err),
                Ok(status) => {
                    debug!(hash = %tx.hash, nonce = tx.nonce, ?status, "Earlier attempt landed");
                    Ok(tx.hash)
                }
            },
            other => other,
        }
    }

    pub async fn get_receipt(&self, layer: Layer, hash: B256) -> Result<ReceiptStatus, RpcError> {
        let endpoint = self.endpoint(layer);
        with_retry(&self.retry, "get_receipt", layer, || endpoint.receipt(hash)).await
    }

    pub async fn get_balance(&self, layer: Layer, address: Address) -> Result<U256, RpcError> {
        let endpoint = self.endpoint(layer);
        with_retry(&self.retry, "get_balance", layer, || endpoint.balance(address)).await
    }

    /// Chain-reported nonce. Only for seeding new accounts and reconciliation;
    /// during a run the account store is authoritative.
    pub async fn get_chain_nonce(&self, layer: Layer, address: Address) -> Result<u64, RpcError> {
        let endpoint = self.endpoint(layer);
        with_retry(&self.retry, "get_transaction_count", layer, || {
            endpoint.transaction_count(address)
        })
        .await
    }

    /// Poll for a receipt every `poll_interval` until it is final or
    /// `deadline` passes. Never waits past the deadline.
    pub async fn wait_for_confirmation(
        &self,
        layer: Layer,
        hash: B256,
        deadline: Instant,
        poll_interval: Duration,
    ) -> Confirmation {
        let endpoint = self.endpoint(layer);
        loop {
            match timeout_at(deadline, endpoint.receipt(hash)).await {
                Ok(Ok(ReceiptStatus::Confirmed { block })) => return Confirmation::Confirmed { block },
                Ok(Ok(ReceiptStatus::Reverted { block })) => return Confirmation::Reverted { block },
                Ok(Ok(_)) => {}
                Ok(Err(err)) => debug!(%hash, %layer, error = %err, "Receipt poll failed"),
                Err(_) => return Confirmation::TimedOut,
            }

            let now = Instant::now();
            if now >= deadline {
                return Confirmation::TimedOut;
            }
            sleep(poll_interval.min(deadline - now)).await;
        }
    }
}
