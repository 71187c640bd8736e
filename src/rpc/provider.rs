use alloy_network::{Ethereum, ReceiptResponse};
use alloy_primitives::{Address, B256, Bytes, U256};
use alloy_provider::{Provider, RootProvider};
use alloy_rpc_client::RpcClient;
use alloy_transport::{RpcError as TransportRpcError, TransportError, TransportErrorKind};
use alloy_transport_http::reqwest;
use eyre::WrapErr;

use super::{ChainRpc, ReceiptStatus, RejectReason, RpcError};

/// HTTP JSON-RPC endpoint backed by an alloy [`RootProvider`].
#[derive(Debug, Clone)]
pub struct AlloyRpc {
    provider: RootProvider<Ethereum>,
}

impl AlloyRpc {
    pub fn connect(rpc_url: &str) -> eyre::Result<Self> {
        let url = rpc_url
            .parse()
            .wrap_err_with(|| format!("failed to parse `{rpc_url}` as URL"))?;
        let client = RpcClient::builder().http(url);
        Ok(Self {
            provider: RootProvider::<Ethereum>::new(client),
        })
    }
}

impl ChainRpc for AlloyRpc {
    async fn send_raw_transaction(&self, raw: &Bytes) -> Result<B256, RpcError> {
        let pending = self
            .provider
            .send_raw_transaction(raw)
            .await
            .map_err(classify)?;
        Ok(*pending.tx_hash())
    }

    async fn receipt(&self, hash: B256) -> Result<ReceiptStatus, RpcError> {
        if let Some(receipt) = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(classify)?
        {
            let block = receipt.block_number();
            return Ok(if receipt.status() {
                ReceiptStatus::Confirmed { block }
            } else {
                ReceiptStatus::Reverted { block }
            });
        }

        let known = self
            .provider
            .get_transaction_by_hash(hash)
            .await
            .map_err(classify)?;
        Ok(match known {
            Some(_) => ReceiptStatus::Pending,
            None => ReceiptStatus::NotFound,
        })
    }

    async fn balance(&self, address: Address) -> Result<U256, RpcError> {
        self.provider.get_balance(address).await.map_err(classify)
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, RpcError> {
        self.provider
            .get_transaction_count(address)
            .pending()
            .await
            .map_err(classify)
    }
}

/// Sort a transport error into the retry taxonomy.
fn classify(err: TransportError) -> RpcError {
    match &err {
        TransportRpcError::ErrorResp(payload) => classify_node_error(payload.code, &payload.message),
        TransportRpcError::Transport(kind) => match kind {
            TransportErrorKind::HttpError(http) if http.status == 429 || http.status >= 500 => {
                RpcError::Transient(err.to_string())
            }
            TransportErrorKind::HttpError(_) => RpcError::Rejected {
                reason: RejectReason::Other,
                message: err.to_string(),
            },
            TransportErrorKind::Custom(inner) => match inner.downcast_ref::<reqwest::Error>() {
                Some(e) if e.is_connect() => RpcError::Unreachable(err.to_string()),
                _ => RpcError::Transient(err.to_string()),
            },
            _ => RpcError::Transient(err.to_string()),
        },
        TransportRpcError::NullResp => RpcError::Transient(err.to_string()),
        _ => RpcError::Rejected {
            reason: RejectReason::Other,
            message: err.to_string(),
        },
    }
}

/// Classify a JSON-RPC error object returned by a node.
pub(crate) fn classify_node_error(code: i64, message: &str) -> RpcError {
    let lower = message.to_ascii_lowercase();
    let rejected = |reason| RpcError::Rejected {
        reason,
        message: message.to_string(),
    };

    if lower.contains("already known") || lower.contains("known transaction") {
        rejected(RejectReason::AlreadyKnown)
    } else if lower.contains("nonce too low") {
        rejected(RejectReason::NonceTooLow)
    } else if lower.contains("nonce too high") {
        rejected(RejectReason::NonceTooHigh)
    } else if lower.contains("insufficient funds") {
        rejected(RejectReason::InsufficientFunds)
    } else if lower.contains("invalid signature") || lower.contains("invalid sender") {
        rejected(RejectReason::InvalidSignature)
    } else if code == -32005
        || code == 429
        || lower.contains("rate limit")
        || lower.contains("too many requests")
        || lower.contains("timeout")
        || lower.contains("timed out")
    {
        RpcError::Transient(message.to_string())
    } else {
        rejected(RejectReason::Other)
    }
}
