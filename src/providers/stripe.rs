use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::LedgerError;
use crate::config::{Secret, StripeConfig};
use crate::payments::{CreditPlan, PaymentStatus, PaymentVerifier, VerifyError};

#[derive(Deserialize)]
struct CheckoutSessionObject {
    id: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    payment_status: Option<String>,
    #[serde(default)]
    client_reference_id: Option<String>,
    #[serde(default)]
    amount_total: Option<u64>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

/// A freshly created hosted checkout page.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: Option<String>,
}

#[derive(Clone)]
pub struct StripeClient {
    http: reqwest::Client,
    base_url: String,
    secret_key: Secret,
}

impl std::fmt::Debug for StripeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeClient")
            .field("base_url", &self.base_url)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

impl StripeClient {
    pub fn new(secret_key: Secret, timeout: Duration) -> Result<Self, LedgerError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| LedgerError::Config(format!("stripe http client error: {err}")))?;
        Ok(Self {
            http,
            base_url: crate::config::DEFAULT_STRIPE_BASE_URL.to_string(),
            secret_key,
        })
    }

    pub fn from_config(
        config: &StripeConfig,
        secret_key: Secret,
        timeout: Duration,
    ) -> Result<Self, LedgerError> {
        let mut client = Self::new(secret_key, timeout)?;
        if !config.base_url.trim().is_empty() {
            client = client.with_base_url(config.base_url.clone());
        }
        Ok(client)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn sessions_url(&self) -> String {
        format!(
            "{}/v1/checkout/sessions",
            self.base_url.trim_end_matches('/')
        )
    }

    /// Creates a one-time payment session. The credits travel in the session
    /// metadata and the account in `client_reference_id`, which is what
    /// [`PaymentVerifier::verify_payment`] reads back.
    pub async fn create_checkout_session(
        &self,
        plan: &CreditPlan,
        account_id: &str,
        success_url: &str,
        cancel_url: &str,
    ) -> Result<CheckoutSession, LedgerError> {
        let credits = plan.credits.to_string();
        let amount = plan.amount_cents.to_string();
        let product_name = format!("{} Credits", plan.credits);
        let description = format!("One-time purchase of {} credits", plan.credits);
        let form: [(&str, &str); 13] = [
            ("mode", "payment"),
            ("payment_method_types[0]", "card"),
            ("line_items[0][price_data][currency]", "usd"),
            ("line_items[0][price_data][product_data][name]", &product_name),
            (
                "line_items[0][price_data][product_data][description]",
                &description,
            ),
            ("line_items[0][price_data][unit_amount]", &amount),
            ("line_items[0][quantity]", "1"),
            ("success_url", success_url),
            ("cancel_url", cancel_url),
            ("client_reference_id", account_id),
            ("metadata[credits]", &credits),
            ("metadata[plan]", &plan.name),
            ("metadata[account_id]", account_id),
        ];

        let response = self
            .http
            .post(self.sessions_url())
            .bearer_auth(self.secret_key.expose())
            .form(&form)
            .send()
            .await
            .map_err(|err| LedgerError::UpstreamFailure {
                status: None,
                message: format!("stripe request failed: {err}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let excerpt = crate::utils::http::error_excerpt(response).await;
            return Err(LedgerError::UpstreamFailure {
                status: Some(status.as_u16()),
                message: format!("stripe status {status}: {excerpt}"),
            });
        }

        let session = response
            .json::<CheckoutSessionObject>()
            .await
            .map_err(|err| LedgerError::UpstreamFailure {
                status: None,
                message: format!("stripe response decode error: {err}"),
            })?;
        tracing::info!(
            session_id = %session.id,
            plan = %plan.name,
            account_id,
            "checkout session created"
        );
        Ok(CheckoutSession {
            id: session.id,
            url: session.url,
        })
    }
}

/// Session ids are opaque but never contain path or query syntax.
fn is_plausible_session_id(reference: &str) -> bool {
    !reference.is_empty()
        && reference
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

#[async_trait]
impl PaymentVerifier for StripeClient {
    async fn verify_payment(&self, reference: &str) -> Result<PaymentStatus, VerifyError> {
        if !is_plausible_session_id(reference) {
            return Err(VerifyError::InvalidReference(
                "malformed checkout session id".to_string(),
            ));
        }

        let response = self
            .http
            .get(format!("{}/{reference}", self.sessions_url()))
            .bearer_auth(self.secret_key.expose())
            .send()
            .await
            .map_err(|err| VerifyError::Transport(format!("stripe request failed: {err}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::BAD_REQUEST {
            let excerpt = crate::utils::http::error_excerpt(response).await;
            return Err(VerifyError::InvalidReference(format!(
                "stripe status {status}: {excerpt}"
            )));
        }
        if !status.is_success() {
            let excerpt = crate::utils::http::error_excerpt(response).await;
            return Err(VerifyError::Transport(format!(
                "stripe status {status}: {excerpt}"
            )));
        }

        let session = response
            .json::<CheckoutSessionObject>()
            .await
            .map_err(|err| VerifyError::Transport(format!("stripe response decode error: {err}")))?;

        let credits = session
            .metadata
            .get("credits")
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .unwrap_or(0);

        Ok(PaymentStatus {
            completed: session.payment_status.as_deref() == Some("paid"),
            account_id: session.client_reference_id,
            amount: session.amount_total.unwrap_or(0),
            credits,
        })
    }
}
