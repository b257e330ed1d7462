use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use metered_ledger::{
    AdmissionConfig, BalanceEntryKind, CallContext, GeneratedItem, GenerationAttemptRecord,
    GenerationInput, GenerationProvider, GenerationRequest, Ledger, LedgerConfig, LedgerError,
    LedgerStore, ManualClock, PaymentStatus, PaymentVerifier, SqliteStore, UpstreamError,
    VerifyError,
};

enum Upstream {
    Images(usize),
    Hang(Duration),
    Late(Duration),
}

struct FakeProvider {
    upstream: Upstream,
    calls: AtomicUsize,
}

impl FakeProvider {
    fn new(upstream: Upstream) -> Arc<Self> {
        Arc::new(Self {
            upstream,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl GenerationProvider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<Vec<GeneratedItem>, UpstreamError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.upstream {
            Upstream::Images(count) => Ok((0..*count)
                .map(|idx| GeneratedItem {
                    uri: format!("https://cdn.example/{call}-{idx}-{}.png", request.style),
                })
                .collect()),
            Upstream::Hang(delay) => {
                tokio::time::sleep(*delay).await;
                Err(UpstreamError::new(None, "never answered"))
            }
            Upstream::Late(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(vec![GeneratedItem {
                    uri: format!("https://cdn.example/{call}-late.png"),
                }])
            }
        }
    }
}

struct NoPayments;

#[async_trait]
impl PaymentVerifier for NoPayments {
    async fn verify_payment(&self, reference: &str) -> Result<PaymentStatus, VerifyError> {
        Err(VerifyError::InvalidReference(format!("unknown {reference}")))
    }
}

fn input() -> GenerationInput {
    GenerationInput {
        prompt: "a paper boat on a pond".to_string(),
        aspect_ratio: "ASPECT_4_3".to_string(),
        model: "V_2_TURBO".to_string(),
        magic_prompt_option: "ON".to_string(),
        style: "DESIGN".to_string(),
        is_public: true,
    }
}

/// Audit entries are written on detached tasks; polls until `expected` exist.
async fn audited_attempts(ledger: &Ledger, expected: usize) -> Vec<GenerationAttemptRecord> {
    for _ in 0..100 {
        let attempts = ledger
            .generation_attempts(50, None)
            .await
            .expect("attempts");
        if attempts.len() >= expected {
            return attempts;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {expected} audit entries");
}

struct Harness {
    ledger: Arc<Ledger>,
    store: SqliteStore,
    _dir: tempfile::TempDir,
}

async fn harness(config: LedgerConfig, provider: Arc<FakeProvider>) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::new(dir.path().join("ledger.sqlite"));
    store.init().await.expect("init");
    let ledger = Ledger::new(
        &config,
        Arc::new(store.clone()),
        provider,
        Arc::new(NoPayments),
    )
    .expect("ledger");
    Harness {
        ledger: Arc::new(ledger),
        store,
        _dir: dir,
    }
}

#[tokio::test]
async fn scenario_a_three_successful_generations_spend_the_balance() {
    let h = harness(LedgerConfig::default(), FakeProvider::new(Upstream::Images(1))).await;
    let account = h.ledger.ensure_account("alice").await.expect("ensure");
    assert_eq!(account.balance, 3);

    for expected_balance in [2, 1, 0] {
        let outcome = h
            .ledger
            .generate(CallContext::for_account("alice"), &input())
            .await
            .expect("generate");
        assert_eq!(outcome.balance, expected_balance);
        assert_eq!(outcome.artifacts.len(), 1);
    }

    assert_eq!(h.ledger.get_balance("alice").await.expect("balance"), 0);
    assert_eq!(
        h.ledger
            .artifacts_for_owner("alice")
            .await
            .expect("artifacts")
            .len(),
        3
    );
    let attempts = audited_attempts(&h.ledger, 3).await;
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|a| a.outcome_status == 200));
    assert!(
        attempts
            .iter()
            .all(|a| a.account_id.as_deref() == Some("alice") && a.endpoint == "/api/generate")
    );

    let public = h.ledger.public_artifacts(1).await.expect("public");
    assert_eq!(public.artifacts.len(), 3);
    assert_eq!(public.total_pages, 1);
}

#[tokio::test]
async fn scenario_b_empty_balance_is_refused_without_side_effects() {
    let provider = FakeProvider::new(Upstream::Images(1));
    let mut config = LedgerConfig::default();
    config.accounts.default_balance = 0;
    let h = harness(config, Arc::clone(&provider)).await;
    h.ledger.ensure_account("bob").await.expect("ensure");

    let err = h
        .ledger
        .generate(CallContext::for_account("bob"), &input())
        .await
        .expect_err("insufficient");
    assert!(matches!(
        err,
        LedgerError::InsufficientBalance {
            balance: 0,
            required: 1
        }
    ));
    assert_eq!(err.status_code(), 403);

    assert_eq!(h.ledger.get_balance("bob").await.expect("balance"), 0);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    assert!(
        h.ledger
            .artifacts_for_owner("bob")
            .await
            .expect("artifacts")
            .is_empty()
    );

    let attempts = audited_attempts(&h.ledger, 1).await;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome_status, 403);
    assert_eq!(h.ledger.observability().insufficient_balance, 1);
}

#[tokio::test]
async fn scenario_d_admission_burst_admits_capacity_then_hints_retry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::new(dir.path().join("ledger.sqlite"));
    store.init().await.expect("init");

    let mut config = LedgerConfig::default();
    config.admission = AdmissionConfig::new(10, 10, Duration::from_secs(60));
    config.accounts.default_balance = 50;
    let clock = ManualClock::new(1_000_000);
    let ledger = Ledger::with_clock(
        &config,
        Arc::new(store.clone()),
        FakeProvider::new(Upstream::Images(1)),
        Arc::new(NoPayments),
        Arc::new(clock),
    )
    .expect("ledger");
    ledger.ensure_account("carol").await.expect("ensure");

    let mut admitted = 0;
    let mut hints = Vec::new();
    for _ in 0..15 {
        match ledger
            .generate(CallContext::for_account("carol"), &input())
            .await
        {
            Ok(_) => admitted += 1,
            Err(LedgerError::RateLimited { retry_after }) => hints.push(retry_after),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(admitted, 10);
    assert_eq!(hints.len(), 5);
    assert!(
        hints
            .iter()
            .all(|hint| *hint >= Duration::from_secs(1) && *hint <= Duration::from_secs(60))
    );
    assert_eq!(ledger.get_balance("carol").await.expect("balance"), 40);

    let snapshot = ledger.observability();
    assert_eq!(snapshot.requests, 15);
    assert_eq!(snapshot.admitted, 10);
    assert_eq!(snapshot.rate_limited, 5);

    let rejected = audited_attempts(&ledger, 15)
        .await
        .into_iter()
        .filter(|a| a.outcome_status == 429)
        .count();
    assert_eq!(rejected, 5);
}

#[tokio::test]
async fn scenario_e_upstream_timeout_restores_balance() {
    let mut config = LedgerConfig::default();
    config.upstream.timeout_secs = 1;
    let h = harness(config, FakeProvider::new(Upstream::Hang(Duration::from_secs(5)))).await;
    h.ledger.ensure_account("dave").await.expect("ensure");

    let err = h
        .ledger
        .generate(CallContext::for_account("dave"), &input())
        .await
        .expect_err("timeout");
    assert!(matches!(
        err,
        LedgerError::UpstreamFailure {
            status: Some(504),
            ..
        }
    ));
    assert!(err.is_retriable());

    assert_eq!(h.ledger.get_balance("dave").await.expect("balance"), 3);
    assert!(
        h.ledger
            .artifacts_for_owner("dave")
            .await
            .expect("artifacts")
            .is_empty()
    );

    let attempts = audited_attempts(&h.ledger, 1).await;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome_status, 504);

    let history = h
        .ledger
        .balance_history("dave", 10)
        .await
        .expect("history");
    let kinds: Vec<_> = history.iter().map(|entry| entry.kind).collect();
    assert_eq!(
        kinds,
        vec![
            BalanceEntryKind::Refund,
            BalanceEntryKind::Debit,
            BalanceEntryKind::Grant
        ]
    );
    let net: i64 = history
        .iter()
        .filter(|entry| entry.kind != BalanceEntryKind::Grant)
        .map(|entry| entry.delta)
        .sum();
    assert_eq!(net, 0);
}

#[tokio::test]
async fn concurrent_generations_never_overdraw() {
    let mut config = LedgerConfig::default();
    config.accounts.default_balance = 5;
    let h = harness(config, FakeProvider::new(Upstream::Images(2))).await;
    h.ledger.ensure_account("erin").await.expect("ensure");
    h.ledger
        .adjust_balance("erin", 3, Some("support credit"))
        .await
        .expect("adjust");

    let mut handles = Vec::new();
    for _ in 0..20 {
        let ledger = Arc::clone(&h.ledger);
        handles.push(tokio::spawn(async move {
            ledger
                .generate(CallContext::for_account("erin"), &input())
                .await
        }));
    }

    let mut succeeded = 0u64;
    for handle in handles {
        match handle.await.expect("join") {
            Ok(outcome) => {
                succeeded += 1;
                assert_eq!(outcome.artifacts.len(), 2);
            }
            Err(LedgerError::InsufficientBalance { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    // 5 granted + 3 adjusted - one credit per successful generation.
    assert_eq!(succeeded, 8);
    assert_eq!(h.ledger.get_balance("erin").await.expect("balance"), 0);
    assert_eq!(
        h.store
            .list_artifacts_for_owner("erin", 100)
            .await
            .expect("artifacts")
            .len(),
        16
    );
}

#[tokio::test]
async fn unknown_account_is_not_provisioned_by_generate() {
    let h = harness(LedgerConfig::default(), FakeProvider::new(Upstream::Images(1))).await;

    let err = h
        .ledger
        .generate(CallContext::for_account("stranger"), &input())
        .await
        .expect_err("unknown");
    assert!(matches!(err, LedgerError::UnknownAccount { .. }));
    assert_eq!(err.status_code(), 404);
    assert!(h.store.get_account("stranger").await.expect("get").is_none());
}

#[tokio::test]
async fn sweep_refunds_orphaned_debits_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = ManualClock::new(5_000_000);
    let store = SqliteStore::with_clock(dir.path().join("ledger.sqlite"), Arc::new(clock.clone()));
    store.init().await.expect("init");
    let ledger = Ledger::with_clock(
        &LedgerConfig::default(),
        Arc::new(store.clone()),
        FakeProvider::new(Upstream::Images(1)),
        Arc::new(NoPayments),
        Arc::new(clock.clone()),
    )
    .expect("ledger");
    ledger.ensure_account("frank").await.expect("ensure");

    // A debit whose coordinator never reached a terminal outcome.
    store
        .debit("frank", 1, "orphaned-request")
        .await
        .expect("debit");
    assert_eq!(ledger.get_balance("frank").await.expect("balance"), 2);

    let min_age = ledger.min_sweep_age();
    assert_eq!(min_age, Duration::from_secs(90));
    let early = ledger.sweep_stale_debits(min_age).await.expect("early sweep");
    assert_eq!(early.examined, 0);
    assert_eq!(ledger.get_balance("frank").await.expect("balance"), 2);

    clock.advance_millis(91_000);
    let report = ledger.sweep_stale_debits(min_age).await.expect("sweep");
    assert_eq!(report.examined, 1);
    assert_eq!(report.refunded, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(ledger.get_balance("frank").await.expect("balance"), 3);
    assert_eq!(ledger.observability().refunds, 1);

    let again = ledger.sweep_stale_debits(min_age).await.expect("sweep again");
    assert_eq!(again.examined, 0);
    assert_eq!(ledger.get_balance("frank").await.expect("balance"), 3);
}

#[tokio::test]
async fn sweep_leaves_in_flight_generations_alone() {
    let mut config = LedgerConfig::default();
    config.upstream.timeout_secs = 2;
    let h = harness(config, FakeProvider::new(Upstream::Late(Duration::from_millis(500)))).await;
    h.ledger.ensure_account("gina").await.expect("ensure");

    let in_flight = tokio::spawn({
        let ledger = Arc::clone(&h.ledger);
        async move {
            ledger
                .generate(CallContext::for_account("gina"), &input())
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(150)).await;

    let err = h
        .ledger
        .sweep_stale_debits(Duration::ZERO)
        .await
        .expect_err("age below upstream timeout");
    assert!(matches!(err, LedgerError::Config(_)));
    let err = h
        .ledger
        .sweep_stale_debits(Duration::from_secs(2))
        .await
        .expect_err("age without grace");
    assert!(matches!(err, LedgerError::Config(_)));

    let report = h
        .ledger
        .sweep_stale_debits(h.ledger.min_sweep_age())
        .await
        .expect("sweep");
    assert_eq!(report.examined, 0);

    let outcome = in_flight.await.expect("join").expect("generate");
    assert_eq!(outcome.artifacts.len(), 1);
    assert_eq!(outcome.balance, 2);
    assert_eq!(h.ledger.get_balance("gina").await.expect("balance"), 2);
    assert_eq!(h.ledger.observability().refunds, 0);
}
