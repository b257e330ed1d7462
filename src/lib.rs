//! Metered access ledger: a credit balance per account, a global admission
//! gate, idempotent payment crediting, and a generation coordinator that never
//! charges for a failed upstream call.

pub mod admission;
pub mod audit;
pub mod clock;
pub mod config;
pub mod coordinator;
mod error;
pub mod generation;
pub mod ledger;
pub mod payments;
#[cfg(feature = "store-postgres")]
pub mod postgres_store;
pub mod providers;
pub mod sqlite_store;
pub mod store;
pub mod store_types;
pub mod telemetry;
pub mod utils;

pub use admission::{Admission, AdmissionConfig, AdmissionGate};
pub use audit::{AuditLog, Observability, ObservabilitySnapshot};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{LedgerConfig, Secret};
pub use coordinator::{CallContext, CoordinatorSettings, GenerationCoordinator, GenerationOutcome};
pub use error::{LedgerError, Result};
pub use generation::{
    AspectRatio, GeneratedItem, GenerationInput, GenerationProvider, GenerationRequest,
    ImageModel, MagicPrompt, Style, UpstreamError,
};
pub use ledger::{Ledger, SweepReport};
pub use payments::{
    CreditPlan, PaymentReconciler, PaymentStatus, PaymentVerifier, PlanCatalog, Reconciliation,
    VerifyError,
};
pub use sqlite_store::SqliteStore;
pub use store::{LedgerStore, PaymentGrant, StoreError};
pub use store_types::{
    AccountRecord, ArtifactPage, ArtifactRecord, BalanceEntryKind, BalanceEntryRecord,
    GenerationAttemptRecord, NewGenerationAttempt, PaymentRecord, PendingDebitRecord, Visibility,
};

#[cfg(feature = "store-postgres")]
pub use postgres_store::PostgresStore;
#[cfg(feature = "provider-ideogram")]
pub use providers::IdeogramClient;
#[cfg(feature = "provider-stripe")]
pub use providers::{CheckoutSession, StripeClient};
