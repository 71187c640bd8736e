//! Test accounts driving load against both layers.
//!
//! An [`Account`] is a snapshot read out of the account store: the record
//! part (address, credential, status) plus the per-layer nonce and balance
//! counters. Nothing outside the store mutates these values.

use std::{fmt, str::FromStr};

use alloy_primitives::{Address, U256, hex, keccak256, utils::Unit};
use alloy_signer_local::PrivateKeySigner;
use k256::ecdsa::SigningKey;
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};

/// The two chains of the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    L1,
    L2,
}

impl Layer {
    pub const ALL: [Layer; 2] = [Layer::L1, Layer::L2];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::L1 => "l1",
            Self::L2 => "l2",
        }
    }

    /// The layer on the other side of the bridge.
    pub fn other(&self) -> Layer {
        match self {
            Self::L1 => Self::L2,
            Self::L2 => Self::L1,
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Layer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "l1" => Ok(Self::L1),
            "l2" => Ok(Self::L2),
            other => Err(format!("unknown layer `{other}`, expected l1 or l2")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccountStatus {
    Active,
    Funding,
    Suspended,
}

/// Where the private key of an account comes from.
///
/// The store only ever holds this reference; the key itself is materialised
/// when a transaction is signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub enum CredentialRef {
    /// Hex encoded key. Only meant for throwaway test network keys.
    PrivateKey(String),
    /// Key derived from the account name.
    Named(String),
    /// Hex encoded key read from an environment variable.
    Env(String),
}

#[derive(Debug, thiserror::Error)]
#[error("credential unavailable: {0}")]
pub struct CredentialUnavailable(pub String);

impl CredentialRef {
    /// Loads the signing key behind this reference.
    pub fn signer(&self) -> Result<PrivateKeySigner, CredentialUnavailable> {
        match self {
            Self::PrivateKey(key) => signer_from_hex(key),
            Self::Named(name) => PrivateKeySigner::from_bytes(&keccak256(name.as_bytes()))
                .map_err(|e| CredentialUnavailable(format!("cannot derive key for {name}: {e}"))),
            Self::Env(var) => {
                let key = std::env::var(var)
                    .map_err(|_| CredentialUnavailable(format!("environment variable {var} is not set")))?;
                signer_from_hex(&key)
            }
        }
    }
}

fn signer_from_hex(key: &str) -> Result<PrivateKeySigner, CredentialUnavailable> {
    let mut privkey_bytes = [0u8; 32];
    hex::decode_to_slice(key.trim_start_matches("0x"), &mut privkey_bytes)
        .map_err(|e| CredentialUnavailable(format!("malformed private key: {e}")))?;

    let signing_key = SigningKey::from_slice(&privkey_bytes)
        .map_err(|e| CredentialUnavailable(format!("invalid private key: {e}")))?;

    Ok(PrivateKeySigner::from_signing_key(signing_key))
}

/// Nonce and cached balance of an account on one layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LayerState {
    pub nonce: u64,
    pub balance_gwei: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub id: String,
    pub address: Address,
    pub credential: CredentialRef,
    pub status: AccountStatus,
    pub l1: LayerState,
    pub l2: LayerState,
}

impl Account {
    pub fn layer(&self, layer: Layer) -> &LayerState {
        match layer {
            Layer::L1 => &self.l1,
            Layer::L2 => &self.l2,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

/// Identity of an account before it is registered in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSpec {
    pub id: String,
    pub address: Address,
    pub credential: CredentialRef,
}

impl AccountSpec {
    pub fn from_credential(
        id: impl Into<String>,
        credential: CredentialRef,
    ) -> Result<Self, CredentialUnavailable> {
        let address = credential.signer()?.address();
        Ok(Self {
            id: id.into(),
            address,
            credential,
        })
    }

    /// Account whose key is derived from its own id.
    pub fn named(name: &str) -> Result<Self, CredentialUnavailable> {
        Self::from_credential(name, CredentialRef::Named(name.to_string()))
    }
}

/// Derive the `{prefix}{i}` pool accounts in parallel.
pub fn named_pool(prefix: &str, count: usize) -> Result<Vec<AccountSpec>, CredentialUnavailable> {
    (0..count)
        .into_par_iter()
        .map(|i| AccountSpec::named(&format!("{prefix}{i}")))
        .collect()
}

/// Whole gwei contained in `wei`, saturating at `i64::MAX`.
pub fn wei_to_gwei(wei: U256) -> i64 {
    i64::try_from(wei / Unit::GWEI.wei()).unwrap_or(i64::MAX)
}

pub fn gwei_to_wei(gwei: u64) -> U256 {
    U256::from(gwei).saturating_mul(Unit::GWEI.wei())
}

#[cfg(test)]
mod tests {
    use alloy_primitives::utils::parse_ether;

    use super::*;

    #[test]
    fn named_accounts_are_deterministic() {
        let a = AccountSpec::named("threaduser_0").unwrap();
        let b = AccountSpec::named("threaduser_0").unwrap();
        let c = AccountSpec::named("threaduser_1").unwrap();
        assert_eq!(a.address, b.address);
        assert_ne!(a.address, c.address);
    }

    #[test]
    fn named_pool_uses_prefix_and_index() {
        let pool = named_pool("threaduser_", 4).unwrap();
        let ids: Vec<_> = pool.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, ["threaduser_0", "threaduser_1", "threaduser_2", "threaduser_3"]);
    }

    #[test]
    fn hex_and_env_credentials_resolve_to_the_same_key() {
        let key = "5ba8b410b0d2161dacd190f8aa6dfbc54ad1c84c67ee3e80611d92cc3fda8abd";
        let from_hex = CredentialRef::PrivateKey(format!("0x{key}")).signer().unwrap();

        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var("TESTNET_STRESS_ACCOUNT_KEY", key) };
        let from_env = CredentialRef::Env("TESTNET_STRESS_ACCOUNT_KEY".into())
            .signer()
            .unwrap();

        assert_eq!(from_hex.address(), from_env.address());
    }

    #[test]
    fn missing_credentials_are_reported() {
        let err = CredentialRef::Env("TESTNET_STRESS_DOES_NOT_EXIST".into())
            .signer()
            .unwrap_err();
        assert!(err.to_string().contains("TESTNET_STRESS_DOES_NOT_EXIST"));

        assert!(CredentialRef::PrivateKey("0xzz".into()).signer().is_err());
    }

    #[test]
    fn wei_converts_to_whole_gwei() {
        assert_eq!(wei_to_gwei(gwei_to_wei(7)), 7);
        assert_eq!(wei_to_gwei(U256::from(999_999_999u64)), 0);
        assert_eq!(wei_to_gwei(U256::MAX), i64::MAX);
        assert_eq!(gwei_to_wei(1_000_000_000), parse_ether("1").unwrap());
    }
}
