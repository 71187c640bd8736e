use alloy_consensus::TxEnvelope;
use alloy_eips::eip2718::Encodable2718;
use alloy_network::TxSignerSync;
use alloy_primitives::{Address, B256, Bytes, TxKind, U256};
use alloy_rpc_types_eth::{TransactionInput, TransactionRequest};
use serde::Serialize;

use crate::{
    account::{Account, CredentialUnavailable, Layer},
    config::LayerConfig,
};

/// Largest calldata accepted for an intent.
pub const MAX_PAYLOAD_BYTES: usize = 128 * 1024;

/// What should be sent, before a nonce is attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionIntent {
    /// Stable id used for idempotence and as the outcome key.
    pub id: String,
    pub account_id: String,
    pub layer: Layer,
    pub recipient: Address,
    pub value: U256,
    pub payload: Option<Bytes>,
    /// Overrides the gas limit derived from the layer config.
    pub gas_limit: Option<u64>,
}

impl TransactionIntent {
    pub fn transfer(
        id: impl Into<String>,
        account_id: impl Into<String>,
        layer: Layer,
        recipient: Address,
        value: U256,
    ) -> Self {
        Self {
            id: id.into(),
            account_id: account_id.into(),
            layer,
            recipient,
            value,
            payload: None,
            gas_limit: None,
        }
    }

    pub fn with_payload(mut self, payload: Bytes, gas_limit: u64) -> Self {
        self.payload = Some(payload);
        self.gas_limit = Some(gas_limit);
        self
    }
}

/// Nonce-stamped, signed and EIP-2718 encoded transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTx {
    pub intent_id: String,
    pub layer: Layer,
    pub nonce: u64,
    pub hash: B256,
    pub raw: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error(transparent)]
    CredentialUnavailable(#[from] CredentialUnavailable),
    #[error("invalid intent {intent}: {reason}")]
    InvalidIntent { intent: String, reason: String },
}

/// Per-layer signing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainParams {
    pub chain_id: u64,
    pub transfer_gas_limit: u64,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

impl From<&LayerConfig> for ChainParams {
    fn from(config: &LayerConfig) -> Self {
        Self {
            chain_id: config.chain_id,
            transfer_gas_limit: config.transfer_gas_limit,
            max_fee_per_gas: config.max_fee_per_gas,
            max_priority_fee_per_gas: config.max_priority_fee_per_gas,
        }
    }
}

/// Turns intents into signed transactions.
///
/// Signing only depends on its arguments and the fixed chain parameters, so
/// a failed or repeated signing attempt never touches account state.
#[derive(Debug, Clone)]
pub struct Signer {
    l1: ChainParams,
    l2: ChainParams,
}

impl Signer {
    pub fn new(l1: ChainParams, l2: ChainParams) -> Self {
        Self { l1, l2 }
    }

    pub fn params(&self, layer: Layer) -> &ChainParams {
        match layer {
            Layer::L1 => &self.l1,
            Layer::L2 => &self.l2,
        }
    }

    pub fn sign(
        &self,
        account: &Account,
        intent: &TransactionIntent,
        nonce: u64,
    ) -> Result<SignedTx, SignerError> {
        validate(account, intent)?;

        let signer = account.credential.signer()?;
        if signer.address() != account.address {
            return Err(CredentialUnavailable(format!(
                "credential of {} resolves to {}, expected {}",
                account.id,
                signer.address(),
                account.address
            ))
            .into());
        }

        let params = self.params(intent.layer);
        let gas = intent
            .gas_limit
            .unwrap_or_else(|| intrinsic_gas(params.transfer_gas_limit, intent.payload.as_ref()));

        let tx = tx(
            intent.recipient,
            params.chain_id,
            gas,
            intent.value,
            intent.payload.clone(),
            nonce,
            params.max_fee_per_gas,
            params.max_priority_fee_per_gas,
        );

        let mut typed_tx = tx.build_typed_tx().map_err(|_| SignerError::InvalidIntent {
            intent: intent.id.clone(),
            reason: "incomplete transaction request".into(),
        })?;
        let signature = signer
            .sign_transaction_sync(&mut typed_tx)
            .map_err(|e| CredentialUnavailable(format!("signing with {} failed: {e}", account.id)))?;
        let envelope: TxEnvelope = typed_tx.into_envelope(signature);

        Ok(SignedTx {
            intent_id: intent.id.clone(),
            layer: intent.layer,
            nonce,
            hash: *envelope.tx_hash(),
            raw: envelope.encoded_2718().into(),
        })
    }
}

fn validate(account: &Account, intent: &TransactionIntent) -> Result<(), SignerError> {
    let invalid = |reason: &str| SignerError::InvalidIntent {
        intent: intent.id.clone(),
        reason: reason.to_string(),
    };

    if intent.account_id != account.id {
        return Err(invalid("intent belongs to a different account"));
    }
    if intent.recipient == Address::ZERO {
        return Err(invalid("recipient is the zero address"));
    }
    if intent
        .payload
        .as_ref()
        .is_some_and(|p| p.len() > MAX_PAYLOAD_BYTES)
    {
        return Err(invalid("payload exceeds the maximum transaction size"));
    }
    Ok(())
}

/// Base transfer gas plus calldata cost.
fn intrinsic_gas(base: u64, payload: Option<&Bytes>) -> u64 {
    payload.map_or(base, |data| {
        let calldata: u64 = data.iter().map(|b| if *b == 0 { 4 } else { 16 }).sum();
        base + calldata
    })
}

/// Creates a type 2 transaction
#[allow(clippy::too_many_arguments)]
fn tx(
    to: Address,
    chain_id: u64,
    gas: u64,
    value: U256,
    data: Option<Bytes>,
    nonce: u64,
    max_fee_per_gas: u128,
    max_priority_fee_per_gas: u128,
) -> TransactionRequest {
    TransactionRequest {
        nonce: Some(nonce),
        value: Some(value),
        to: Some(TxKind::Call(to)),
        gas: Some(gas),
        max_fee_per_gas: Some(max_fee_per_gas),
        max_priority_fee_per_gas: Some(max_priority_fee_per_gas),
        chain_id: Some(chain_id),
        input: TransactionInput { input: None, data },
        ..Default::default()
    }
}
