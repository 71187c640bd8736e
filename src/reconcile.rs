//! Post-run comparison of stored nonces with what the chains report.
//!
//! Divergence is only reported. The store stays authoritative; correcting it
//! is an operator decision.

use std::cmp::Ordering;

use serde::Serialize;
use tracing::{info, warn};

use crate::{
    account::Layer,
    rpc::{ChainRpc, RpcClientPool},
    store::{AccountStore, StoreError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DivergenceKind {
    /// Nonces handed out that the chain never accepted, e.g. dropped or
    /// rejected transactions.
    StoreAhead,
    /// The account sent transactions the store does not know about.
    ChainAhead,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Divergence {
    pub account_id: String,
    pub layer: Layer,
    pub stored: u64,
    pub chain: u64,
    pub kind: DivergenceKind,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub checked: usize,
    pub divergences: Vec<Divergence>,
    /// Accounts whose chain nonce could not be read.
    pub unreachable: Vec<(String, Layer, String)>,
}

impl ReconcileReport {
    pub fn is_consistent(&self) -> bool {
        self.divergences.is_empty() && self.unreachable.is_empty()
    }
}

pub async fn reconcile<C: ChainRpc>(
    store: &AccountStore,
    rpc: &RpcClientPool<C>,
    layers: &[Layer],
) -> Result<ReconcileReport, StoreError> {
    let mut report = ReconcileReport::default();

    for account in store.list()? {
        for &layer in layers {
            report.checked += 1;
            let stored = account.layer(layer).nonce;
            let chain = match rpc.get_chain_nonce(layer, account.address).await {
                Ok(nonce) => nonce,
                Err(e) => {
                    warn!(account = %account.id, %layer, error = %e, "Could not read chain nonce");
                    report.unreachable.push((account.id.clone(), layer, e.to_string()));
                    continue;
                }
            };

            let kind = match stored.cmp(&chain) {
                Ordering::Equal => continue,
                Ordering::Greater => DivergenceKind::StoreAhead,
                Ordering::Less => DivergenceKind::ChainAhead,
            };
            warn!(account = %account.id, %layer, stored, chain, ?kind, "Nonce divergence");
            report.divergences.push(Divergence {
                account_id: account.id.clone(),
                layer,
                stored,
                chain,
                kind,
            });
        }
    }

    info!(
        checked = report.checked,
        divergences = report.divergences.len(),
        "Reconciliation finished"
    );
    Ok(report)
}
