//! Scripted in-process chain used by the unit tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use alloy_consensus::{Transaction, TxEnvelope};
use alloy_eips::eip2718::Decodable2718;
use alloy_primitives::{Address, B256, Bytes, U256};
use tokio::time::{Instant, sleep};

use crate::rpc::{ChainRpc, ReceiptStatus, RejectReason, RpcError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub hash: B256,
    pub nonce: u64,
    pub to: Option<Address>,
    pub value: U256,
    pub at: Instant,
}

#[derive(Debug)]
struct PendingCredit {
    address: Address,
    amount: U256,
    remaining_polls: u32,
}

#[derive(Debug, Default)]
struct State {
    submissions: Vec<Submission>,
    attempts: u64,
    fail_next: VecDeque<RpcError>,
    lose_responses: usize,
    reject_all: Option<RpcError>,
    submit_delay: Duration,
    receipt_delay: u32,
    receipt_polls: HashMap<B256, u32>,
    revert_all: bool,
    balances: HashMap<Address, U256>,
    balance_queries: HashMap<Address, u32>,
    credits: Vec<PendingCredit>,
    nonces: HashMap<Address, u64>,
}

#[derive(Debug, Clone, Default)]
pub struct MockChain {
    inner: Arc<Mutex<State>>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.lock().unwrap()
    }

    /// Receipts stay pending for this many polls.
    pub fn with_receipt_delay(self, polls: u32) -> Self {
        self.state().receipt_delay = polls;
        self
    }

    pub fn with_submit_delay(self, delay: Duration) -> Self {
        self.state().submit_delay = delay;
        self
    }

    pub fn fail_next_submissions(&self, count: usize, err: RpcError) {
        let mut state = self.state();
        for _ in 0..count {
            state.fail_next.push_back(err.clone());
        }
    }

    /// Accept the next `count` transactions but answer with a transient
    /// error, as when a response is lost after the node took the request.
    pub fn lose_next_responses(&self, count: usize) {
        self.state().lose_responses += count;
    }

    pub fn reject_all_submissions(&self, reason: RejectReason) {
        self.state().reject_all = Some(RpcError::Rejected {
            reason,
            message: reason.to_string(),
        });
    }

    pub fn revert_all(&self) {
        self.state().revert_all = true;
    }

    pub fn set_nonce(&self, address: Address, nonce: u64) {
        self.state().nonces.insert(address, nonce);
    }

    /// Credit `amount` once `polls` balance queries for `address` have
    /// returned the old value.
    pub fn credit_after_polls(&self, address: Address, amount: U256, polls: u32) {
        self.state().credits.push(PendingCredit {
            address,
            amount,
            remaining_polls: polls,
        });
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state().submissions.clone()
    }

    pub fn submission_attempts(&self) -> u64 {
        self.state().attempts
    }

    pub fn balance_queries(&self, address: Address) -> u32 {
        self.state().balance_queries.get(&address).copied().unwrap_or(0)
    }
}

impl ChainRpc for MockChain {
    async fn send_raw_transaction(&self, raw: &Bytes) -> Result<B256, RpcError> {
        let delay = self.state().submit_delay;
        if !delay.is_zero() {
            sleep(delay).await;
        }

        let mut state = self.state();
        state.attempts += 1;
        if let Some(err) = state.fail_next.pop_front() {
            return Err(err);
        }
        if let Some(err) = &state.reject_all {
            return Err(err.clone());
        }

        let envelope =
            TxEnvelope::decode_2718(&mut raw.as_ref()).map_err(|e| RpcError::Rejected {
                reason: RejectReason::Other,
                message: e.to_string(),
            })?;
        let hash = *envelope.tx_hash();
        if state.receipt_polls.contains_key(&hash) {
            // mined already, its nonce is used up
            return Err(RpcError::Rejected {
                reason: RejectReason::NonceTooLow,
                message: "nonce too low".into(),
            });
        }
        state.submissions.push(Submission {
            hash,
            nonce: envelope.nonce(),
            to: envelope.to(),
            value: envelope.value(),
            at: Instant::now(),
        });
        state.receipt_polls.insert(hash, 0);
        if state.lose_responses > 0 {
            state.lose_responses -= 1;
            return Err(RpcError::Transient("response lost".into()));
        }
        Ok(hash)
    }

    async fn receipt(&self, hash: B256) -> Result<ReceiptStatus, RpcError> {
        let mut state = self.state();
        let delay = state.receipt_delay;
        let revert = state.revert_all;
        let Some(polls) = state.receipt_polls.get_mut(&hash) else {
            return Ok(ReceiptStatus::NotFound);
        };
        if *polls < delay {
            *polls += 1;
            return Ok(ReceiptStatus::Pending);
        }
        let block = Some(1);
        Ok(if revert {
            ReceiptStatus::Reverted { block }
        } else {
            ReceiptStatus::Confirmed { block }
        })
    }

    async fn balance(&self, address: Address) -> Result<U256, RpcError> {
        let mut state = self.state();
        *state.balance_queries.entry(address).or_default() += 1;

        let mut credited = U256::ZERO;
        state.credits.retain_mut(|credit| {
            if credit.address != address {
                return true;
            }
            if credit.remaining_polls == 0 {
                credited += credit.amount;
                false
            } else {
                credit.remaining_polls -= 1;
                true
            }
        });

        let balance = state.balances.entry(address).or_default();
        *balance += credited;
        Ok(*balance)
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, RpcError> {
        Ok(self.state().nonces.get(&address).copied().unwrap_or(0))
    }
}
