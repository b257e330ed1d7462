use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::LedgerError;
use crate::admission::AdmissionConfig;
use crate::coordinator::CoordinatorSettings;
use crate::payments::{CreditPlan, PlanCatalog, default_plans};

pub const DEFAULT_IDEOGRAM_BASE_URL: &str = "https://api.ideogram.ai";
pub const DEFAULT_STRIPE_BASE_URL: &str = "https://api.stripe.com";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LedgerConfig {
    pub database_path: PathBuf,
    pub admission: AdmissionConfig,
    pub accounts: AccountsConfig,
    pub upstream: UpstreamConfig,
    pub payments: PaymentsConfig,
    pub ideogram: IdeogramConfig,
    pub stripe: StripeConfig,
    pub plans: Vec<CreditPlan>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("ledger.sqlite"),
            admission: AdmissionConfig::default(),
            accounts: AccountsConfig::default(),
            upstream: UpstreamConfig::default(),
            payments: PaymentsConfig::default(),
            ideogram: IdeogramConfig::default(),
            stripe: StripeConfig::default(),
            plans: default_plans(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AccountsConfig {
    /// Credits granted the first time an identity is seen.
    pub default_balance: u64,
    pub generation_cost: u64,
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            default_balance: 3,
            generation_cost: 1,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpstreamConfig {
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self { timeout_secs: 60 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PaymentsConfig {
    pub lookup_timeout_secs: u64,
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            lookup_timeout_secs: 15,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IdeogramConfig {
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
}

impl Default for IdeogramConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_IDEOGRAM_BASE_URL.to_string(),
            api_key_env: "IDEOGRAM_API_KEY".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StripeConfig {
    pub base_url: String,
    pub secret_key_env: String,
}

impl Default for StripeConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_STRIPE_BASE_URL.to_string(),
            secret_key_env: "STRIPE_SECRET_KEY".to_string(),
        }
    }
}

/// A secret resolved from the environment at startup.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<redacted>")
    }
}

impl LedgerConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, LedgerError> {
        let config: Self = toml::from_str(raw)
            .map_err(|err| LedgerError::Config(format!("invalid ledger config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, LedgerError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            LedgerError::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        self.admission.validate()?;
        if self.accounts.generation_cost == 0 {
            return Err(LedgerError::Config(
                "accounts.generation_cost must be > 0".to_string(),
            ));
        }
        if self.upstream.timeout_secs == 0 {
            return Err(LedgerError::Config(
                "upstream.timeout_secs must be > 0".to_string(),
            ));
        }
        if self.payments.lookup_timeout_secs == 0 {
            return Err(LedgerError::Config(
                "payments.lookup_timeout_secs must be > 0".to_string(),
            ));
        }

        let mut names = BTreeSet::new();
        for plan in &self.plans {
            if plan.name.trim().is_empty() {
                return Err(LedgerError::Config("plan name must not be empty".to_string()));
            }
            if plan.credits == 0 {
                return Err(LedgerError::Config(format!(
                    "plan {} must grant credits",
                    plan.name
                )));
            }
            if !names.insert(plan.name.as_str()) {
                return Err(LedgerError::Config(format!(
                    "duplicate plan name: {}",
                    plan.name
                )));
            }
        }
        Ok(())
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            generation_cost: self.accounts.generation_cost,
            upstream_timeout: Duration::from_secs(self.upstream.timeout_secs),
        }
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.payments.lookup_timeout_secs)
    }

    pub fn plan_catalog(&self) -> PlanCatalog {
        PlanCatalog::new(self.plans.clone())
    }

    pub fn ideogram_api_key(&self) -> Result<Secret, LedgerError> {
        secret_from_env(&self.ideogram.api_key_env)
    }

    pub fn stripe_secret_key(&self) -> Result<Secret, LedgerError> {
        secret_from_env(&self.stripe.secret_key_env)
    }
}

fn secret_from_env(key: &str) -> Result<Secret, LedgerError> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(Secret)
        .ok_or_else(|| LedgerError::Config(format!("missing environment variable {key}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = LedgerConfig::from_toml_str("").expect("config");
        assert_eq!(config, LedgerConfig::default());
        assert_eq!(config.admission.capacity, 100);
        assert_eq!(config.accounts.default_balance, 3);
        assert_eq!(config.plan_catalog().plans().len(), 2);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = LedgerConfig::from_toml_str(
            r#"
database_path = "/var/lib/ledger/ledger.sqlite"

[admission]
capacity = 10
refill_tokens = 10
interval_secs = 60

[accounts]
default_balance = 5

[[plans]]
name = "starter"
amount_cents = 499
credits = 40
"#,
        )
        .expect("config");
        assert_eq!(config.admission.capacity, 10);
        assert_eq!(config.accounts.default_balance, 5);
        assert_eq!(config.accounts.generation_cost, 1);
        assert_eq!(config.upstream.timeout_secs, 60);
        let catalog = config.plan_catalog();
        assert_eq!(catalog.resolve("starter").expect("starter").credits, 40);
        assert!(catalog.resolve("pro").is_err());
    }

    #[test]
    fn validation_rejects_bad_values() {
        let err = LedgerConfig::from_toml_str("[accounts]\ngeneration_cost = 0\n")
            .expect_err("zero cost");
        assert!(matches!(err, LedgerError::Config(_)));

        let err = LedgerConfig::from_toml_str(
            r#"
[[plans]]
name = "pro"
amount_cents = 1
credits = 1

[[plans]]
name = "pro"
amount_cents = 2
credits = 2
"#,
        )
        .expect_err("duplicate plan");
        assert!(err.to_string().contains("duplicate plan name"));

        assert!(LedgerConfig::from_toml_str("[admission]\ncapacity = 0\n").is_err());
        assert!(LedgerConfig::from_toml_str("not toml at all = = =").is_err());
    }

    #[test]
    fn secrets_are_redacted_in_debug() {
        let secret = Secret::new("sk_live_abc");
        assert_eq!(format!("{secret:?}"), "<redacted>");
        assert_eq!(secret.expose(), "sk_live_abc");
    }
}
