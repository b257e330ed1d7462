use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("rate limited: retry after {}s", .retry_after.as_secs())]
    RateLimited { retry_after: Duration },
    #[error("unauthorized caller")]
    Unauthorized,
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[error("unknown account: {account_id}")]
    UnknownAccount { account_id: String },
    #[error("insufficient balance: balance={balance} required={required}")]
    InsufficientBalance { balance: u64, required: u64 },
    #[error(
        "upstream failure{}: {message}",
        .status.map(|s| format!(" ({s})")).unwrap_or_default()
    )]
    UpstreamFailure {
        status: Option<u16>,
        message: String,
    },
    #[error("payment not completed: {reference}")]
    PaymentNotCompleted { reference: String },
    #[error("invalid payment reference {reference}: {reason}")]
    InvalidReference { reference: String, reason: String },
    #[error("store error during {step}: {source}")]
    Store {
        step: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("config error: {0}")]
    Config(String),
}

impl LedgerError {
    pub(crate) fn store(step: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| match source {
            StoreError::InsufficientBalance { balance, required } => {
                Self::InsufficientBalance { balance, required }
            }
            StoreError::UnknownAccount { account_id } => Self::UnknownAccount { account_id },
            source => Self::Store { step, source },
        }
    }

    /// Integer outcome written to the audit log and suggested to the HTTP layer.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::RateLimited { .. } => 429,
            Self::Unauthorized => 401,
            Self::InvalidRequest { .. } | Self::InvalidReference { .. } => 400,
            Self::UnknownAccount { .. } => 404,
            Self::InsufficientBalance { .. } => 403,
            Self::UpstreamFailure { status, .. } => match status {
                Some(status) if *status >= 400 => *status,
                _ => 502,
            },
            Self::PaymentNotCompleted { .. } => 402,
            Self::Store { .. } | Self::Config(_) => 500,
        }
    }

    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::PaymentNotCompleted { .. }
                | Self::UpstreamFailure { .. }
                | Self::Store { .. }
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
