use crate::{
    metrics::OutcomeKind,
    rpc::{RejectReason, RpcError},
    store::StoreError,
    transaction::SignerError,
};

/// Run-wide error taxonomy.
///
/// Everything except [`StressError::StoreUnavailable`] is scoped to a single
/// intent and ends up recorded as an outcome.
#[derive(Debug, thiserror::Error)]
pub enum StressError {
    #[error("transient network failure: {0}")]
    TransientNetwork(String),
    #[error("rejected ({reason}): {message}")]
    Rejected { reason: RejectReason, message: String },
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("credential unavailable: {0}")]
    CredentialUnavailable(String),
    #[error("invalid intent: {0}")]
    InvalidIntent(String),
    #[error("account store unavailable: {0}")]
    StoreUnavailable(String),
}

impl StressError {
    pub fn outcome_kind(&self) -> OutcomeKind {
        match self {
            Self::Rejected { .. } => OutcomeKind::Rejected,
            Self::Timeout(_) => OutcomeKind::TimedOut,
            Self::TransientNetwork(_)
            | Self::CredentialUnavailable(_)
            | Self::InvalidIntent(_)
            | Self::StoreUnavailable(_) => OutcomeKind::Failed,
        }
    }

    pub fn is_fatal_to_run(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

impl From<RpcError> for StressError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Transient(msg) | RpcError::Unreachable(msg) => Self::TransientNetwork(msg),
            RpcError::Rejected { reason, message } => Self::Rejected { reason, message },
            err @ RpcError::RetriesExhausted { .. } => Self::Timeout(err.to_string()),
        }
    }
}

impl From<SignerError> for StressError {
    fn from(err: SignerError) -> Self {
        match err {
            SignerError::CredentialUnavailable(e) => Self::CredentialUnavailable(e.0),
            err @ SignerError::InvalidIntent { .. } => Self::InvalidIntent(err.to_string()),
        }
    }
}

impl From<StoreError> for StressError {
    fn from(err: StoreError) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::account::CredentialUnavailable;

    #[test]
    fn exhausted_retries_surface_as_timeouts() {
        let err: StressError = RpcError::RetriesExhausted {
            attempts: 9,
            elapsed: Duration::from_secs(60),
            maybe_delivered: true,
            last: Box::new(RpcError::Transient("HTTP 503".into())),
        }
        .into();
        assert!(matches!(err, StressError::Timeout(_)));
        assert_eq!(err.outcome_kind(), OutcomeKind::TimedOut);
    }

    #[test]
    fn only_store_failures_end_the_run() {
        let store: StressError = StoreError::Unavailable("disk gone".into()).into();
        assert!(store.is_fatal_to_run());

        let signer: StressError =
            SignerError::CredentialUnavailable(CredentialUnavailable("no key".into())).into();
        assert!(!signer.is_fatal_to_run());
        assert_eq!(signer.outcome_kind(), OutcomeKind::Failed);

        let rejected: StressError = RpcError::Rejected {
            reason: RejectReason::InsufficientFunds,
            message: "insufficient funds".into(),
        }
        .into();
        assert_eq!(rejected.outcome_kind(), OutcomeKind::Rejected);
        assert!(!rejected.is_fatal_to_run());
    }
}
