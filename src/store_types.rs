use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountRecord {
    pub account_id: String,
    pub balance: u64,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BalanceEntryKind {
    /// First-touch provisioning grant.
    Grant,
    Debit,
    /// Compensating credit for a debit whose generation failed.
    Refund,
    Payment,
    Adjustment,
}

impl BalanceEntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Grant => "grant",
            Self::Debit => "debit",
            Self::Refund => "refund",
            Self::Payment => "payment",
            Self::Adjustment => "adjustment",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "grant" => Some(Self::Grant),
            "debit" => Some(Self::Debit),
            "refund" => Some(Self::Refund),
            "payment" => Some(Self::Payment),
            "adjustment" => Some(Self::Adjustment),
            _ => None,
        }
    }
}

/// One row of an account's append-only balance history.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BalanceEntryRecord {
    pub id: i64,
    pub account_id: String,
    pub kind: BalanceEntryKind,
    /// Signed change applied to the balance.
    pub delta: i64,
    pub balance_after: u64,
    /// Request id for debits/refunds, payment reference for payments.
    pub reference: Option<String>,
    pub ts_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentRecord {
    pub external_reference: String,
    pub account_id: String,
    pub amount: u64,
    pub credits_granted: u64,
    pub recorded_at_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingDebitRecord {
    pub request_id: String,
    pub account_id: String,
    pub amount: u64,
    pub ts_ms: u64,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    #[default]
    Private,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "public" => Some(Self::Public),
            "private" => Some(Self::Private),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactRecord {
    pub id: String,
    pub owner_account_id: String,
    pub prompt: String,
    pub location_uri: String,
    pub visibility: Visibility,
    pub created_at_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactPage {
    pub artifacts: Vec<ArtifactRecord>,
    pub total_pages: u64,
    pub current_page: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerationAttemptRecord {
    pub id: i64,
    pub account_id: Option<String>,
    pub endpoint: String,
    pub outcome_status: u16,
    pub remote_address: Option<String>,
    pub user_agent: Option<String>,
    pub ts_ms: u64,
}

/// An audit entry before the store assigns its id.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewGenerationAttempt {
    pub account_id: Option<String>,
    pub endpoint: String,
    pub outcome_status: u16,
    pub remote_address: Option<String>,
    pub user_agent: Option<String>,
}
