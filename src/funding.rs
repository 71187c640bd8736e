//! Pool provisioning and funding from a root account.

use std::{sync::Arc, time::Duration};

use alloy_primitives::{B256, U256};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::{
    account::{Account, AccountSpec, AccountStatus, Layer, wei_to_gwei},
    rpc::{ChainRpc, Confirmation, RpcClientPool},
    store::{AccountStore, StoreError},
    transaction::{Signer, TransactionIntent},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FundingFailure {
    pub account_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FundingReport {
    pub layer: Layer,
    pub funded: Vec<String>,
    pub failed: Vec<FundingFailure>,
}

pub struct Funder<C> {
    store: AccountStore,
    signer: Signer,
    rpc: Arc<RpcClientPool<C>>,
    confirmation_timeout: Duration,
    poll_interval: Duration,
}

impl<C: ChainRpc> Funder<C> {
    pub fn new(store: AccountStore, signer: Signer, rpc: Arc<RpcClientPool<C>>) -> Self {
        Self {
            store,
            signer,
            rpc,
            confirmation_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_confirmation(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.confirmation_timeout = timeout;
        self.poll_interval = poll_interval;
        self
    }

    /// Register `specs` in the store. New accounts start from the chain's
    /// pending nonce on each layer; existing ones keep their counters.
    pub async fn provision(&self, specs: &[AccountSpec], status: AccountStatus) -> eyre::Result<Vec<Account>> {
        let mut accounts = Vec::with_capacity(specs.len());
        for spec in specs {
            let nonces = if self.store.exists(&spec.id)? {
                [0, 0]
            } else {
                [
                    self.rpc.get_chain_nonce(Layer::L1, spec.address).await?,
                    self.rpc.get_chain_nonce(Layer::L2, spec.address).await?,
                ]
            };
            accounts.push(self.store.provision(spec, nonces, status)?);
        }
        info!(count = accounts.len(), "Provisioned accounts");
        Ok(accounts)
    }

    /// Send `amount` from `root_id` to every account on `layer`.
    ///
    /// Transfers are submitted one after another so the root's nonces reach
    /// the endpoint in order; confirmations are awaited afterwards. Funded
    /// accounts move from `funding` to `active`.
    pub async fn fund(
        &self,
        root_id: &str,
        layer: Layer,
        account_ids: &[String],
        amount: U256,
    ) -> Result<FundingReport, StoreError> {
        let root = self.store.get(root_id)?;
        let mut report = FundingReport {
            layer,
            funded: Vec::new(),
            failed: Vec::new(),
        };
        let mut submitted: Vec<(String, B256)> = Vec::new();

        for account_id in account_ids {
            let account = self.store.get(account_id)?;
            self.store.set_status(account_id, AccountStatus::Funding)?;

            let intent = TransactionIntent::transfer(
                format!("fund-{layer}-{account_id}"),
                root_id,
                layer,
                account.address,
                amount,
            );
            let nonce = self.store.reserve_nonce(root_id, layer)?;
            let signed = match self.signer.sign(&root, &intent, nonce) {
                Ok(signed) => signed,
                Err(e) => {
                    self.store.rollback_nonce(root_id, layer, nonce)?;
                    report.failed.push(failure(account_id, e));
                    continue;
                }
            };

            match self.rpc.submit(&signed).await {
                Ok(hash) => submitted.push((account_id.clone(), hash)),
                Err(e) => {
                    if e.never_delivered() {
                        self.store.rollback_nonce(root_id, layer, nonce)?;
                    }
                    report.failed.push(failure(account_id, e));
                }
            }
        }

        let deadline = Instant::now() + self.confirmation_timeout;
        let gwei = wei_to_gwei(amount);
        for (account_id, hash) in submitted {
            match self
                .rpc
                .wait_for_confirmation(layer, hash, deadline, self.poll_interval)
                .await
            {
                Confirmation::Confirmed { .. } => {
                    self.store.apply_balance_delta(root_id, layer, -gwei)?;
                    self.store.apply_balance_delta(&account_id, layer, gwei)?;
                    self.store.set_status(&account_id, AccountStatus::Active)?;
                    report.funded.push(account_id);
                }
                Confirmation::Reverted { .. } => {
                    report.failed.push(failure(&account_id, format!("funding {hash} reverted")))
                }
                Confirmation::TimedOut => report.failed.push(failure(
                    &account_id,
                    format!("funding {hash} not confirmed in time"),
                )),
            }
        }

        for f in &report.failed {
            warn!(account = %f.account_id, %layer, reason = %f.reason, "Funding failed");
        }
        info!(%layer, funded = report.funded.len(), failed = report.failed.len(), "Funding finished");
        Ok(report)
    }
}

fn failure(account_id: &str, reason: impl ToString) -> FundingFailure {
    FundingFailure {
        account_id: account_id.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        account::{gwei_to_wei, named_pool},
        config::{LayerConfig, RetryPolicy},
        mock::MockChain,
        rpc::RejectReason,
        transaction::ChainParams,
    };

    fn funder(store: &AccountStore, l1: &MockChain, l2: &MockChain) -> Funder<MockChain> {
        let rpc = Arc::new(RpcClientPool::new(
            l1.clone(),
            l2.clone(),
            RetryPolicy::default().with_jitter(0.0),
        ));
        let signer = Signer::new(
            ChainParams::from(&LayerConfig::new("http://l1", 1337)),
            ChainParams::from(&LayerConfig::new("http://l2", 412346)),
        );
        Funder::new(store.clone(), signer, rpc)
            .with_confirmation(Duration::from_secs(10), Duration::from_millis(100))
    }

    #[tokio::test(start_paused = true)]
    async fn provision_seeds_new_accounts_from_chain() {
        let store = AccountStore::in_memory();
        let (l1, l2) = (MockChain::new(), MockChain::new());
        let specs = named_pool("threaduser_", 2).unwrap();
        l1.set_nonce(specs[0].address, 4);
        l2.set_nonce(specs[0].address, 11);

        let funder = funder(&store, &l1, &l2);
        let accounts = funder.provision(&specs, AccountStatus::Funding).await.unwrap();
        assert_eq!(accounts[0].l1.nonce, 4);
        assert_eq!(accounts[0].l2.nonce, 11);
        assert_eq!(accounts[1].l2.nonce, 0);

        // the chain moving on does not reset an existing record
        l2.set_nonce(specs[0].address, 30);
        let again = funder.provision(&specs, AccountStatus::Funding).await.unwrap();
        assert_eq!(again[0].l2.nonce, 11);
    }

    #[tokio::test(start_paused = true)]
    async fn funds_pool_from_root_in_nonce_order() {
        let store = AccountStore::in_memory();
        let (l1, l2) = (MockChain::new(), MockChain::new().with_receipt_delay(2));
        store
            .provision(&AccountSpec::named("root").unwrap(), [7, 0], AccountStatus::Active)
            .unwrap();
        let specs = named_pool("threaduser_", 3).unwrap();
        let funder = funder(&store, &l1, &l2);
        funder.provision(&specs, AccountStatus::Funding).await.unwrap();
        let ids: Vec<_> = specs.iter().map(|s| s.id.clone()).collect();

        let report = funder
            .fund("root", Layer::L2, &ids, gwei_to_wei(5))
            .await
            .unwrap();

        assert_eq!(report.funded, ids);
        assert!(report.failed.is_empty());
        let nonces: Vec<_> = l2.submissions().iter().map(|s| s.nonce).collect();
        assert_eq!(nonces, [0, 1, 2]);
        assert_eq!(store.get("root").unwrap().l2.balance_gwei, -15);
        for id in &ids {
            let account = store.get(id).unwrap();
            assert_eq!(account.status, AccountStatus::Active);
            assert_eq!(account.l2.balance_gwei, 5);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unfunded_accounts_stay_in_funding() {
        let store = AccountStore::in_memory();
        let (l1, l2) = (MockChain::new(), MockChain::new());
        l1.reject_all_submissions(RejectReason::InsufficientFunds);
        store
            .provision(&AccountSpec::named("root").unwrap(), [0, 0], AccountStatus::Active)
            .unwrap();
        store
            .provision(&AccountSpec::named("a").unwrap(), [0, 0], AccountStatus::Active)
            .unwrap();

        let report = funder(&store, &l1, &l2)
            .fund("root", Layer::L1, &["a".to_string()], gwei_to_wei(1))
            .await
            .unwrap();

        assert!(report.funded.is_empty());
        assert_eq!(report.failed[0].account_id, "a");
        assert_eq!(store.get("a").unwrap().status, AccountStatus::Funding);
        // the node saw the transfer, so the root nonce stays consumed
        assert_eq!(store.get("root").unwrap().l1.nonce, 1);
    }
}
