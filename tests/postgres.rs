use std::sync::Arc;

use casting_billing::applications::{
    ApplicantProfile, Casting, CastingStatus, PgProfileDirectory, ProfileDirectory,
    ResponseStatus, TransitionError,
};
use casting_billing::identity::{Identity, Role};
use casting_billing::ledger::{Ledger, LedgerError};
use casting_billing::limits::{
    LimitError, LimitEvaluator, LimitKey, PgPlanCatalog, PlanCatalog, PlanQuota,
    StaticPlanCatalog,
};
use casting_billing::notifications::{start_notification_worker, LogSink};
use casting_billing::store::{PgStore, Store};
use casting_billing::{BillingServices, BillingSettings};
use futures_util::future::join_all;
use sqlx::PgPool;
use uuid::Uuid;

fn services(pool: &PgPool, store: Arc<dyn Store>) -> BillingServices {
    BillingServices::new(
        store,
        Arc::new(PgPlanCatalog::new(pool.clone())),
        Arc::new(PgProfileDirectory::new(pool.clone())),
        Arc::new(start_notification_worker(Arc::new(LogSink), 16)),
        BillingSettings {
            free_tier_quota: 0,
            response_cost: 1,
        },
    )
}

async fn insert_profile(pool: &PgPool, principal_id: Uuid) {
    sqlx::query("INSERT INTO profiles (principal_id, display_name) VALUES ($1, $2)")
        .bind(principal_id)
        .bind("Applicant")
        .execute(pool)
        .await
        .unwrap();
}

// key: postgres-tests -> row locks, guarded increment, plan lookups
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn row_lock_serializes_concurrent_deductions(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool.clone(), 5_000));
    let credits = Ledger::credit(store.clone());
    let principal = Uuid::new_v4();
    credits.grant(principal, 3, None, "seed").await.unwrap();

    let attempts = (0..6).map(|attempt| {
        let credits = credits.clone();
        tokio::spawn(async move {
            let reference = format!("pg-{attempt}");
            credits.deduct(principal, 1, Some(&reference), None).await
        })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 3);
    assert!(results
        .iter()
        .filter(|result| result.is_err())
        .all(|result| matches!(result, Err(LedgerError::InsufficientFunds { .. }))));
    let report = credits.reconcile(principal).await.unwrap();
    assert_eq!(report.balance, 0);
    assert!(report.consistent);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn guarded_increment_closes_the_casting(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool.clone(), 5_000));
    let services = services(&pool, store.clone());
    let employer = Identity::new(Uuid::new_v4(), Role::Employer);
    let casting = Casting::new(employer.principal_id, "Stage play", Some(1));
    store.insert_casting(&casting).await.unwrap();

    let mut response_ids = Vec::new();
    for _ in 0..2 {
        let applicant = Identity::new(Uuid::new_v4(), Role::Applicant);
        insert_profile(&pool, applicant.principal_id).await;
        services
            .credits
            .grant(applicant.principal_id, 1, None, "seed")
            .await
            .unwrap();
        let receipt = services
            .applications
            .apply_to_casting(&applicant, casting.id, None)
            .await
            .unwrap();
        response_ids.push(receipt.response.id);
    }

    services
        .transitions
        .set_status(&employer, response_ids[0], ResponseStatus::Accepted)
        .await
        .unwrap();
    let err = services
        .transitions
        .set_status(&employer, response_ids[1], ResponseStatus::Accepted)
        .await
        .unwrap_err();
    assert!(matches!(err, TransitionError::CastingFullOrClosed));

    let stored = store.find_casting(casting.id).await.unwrap().unwrap();
    assert_eq!(stored.accepted_count, 1);
    assert_eq!(stored.status, CastingStatus::Closed);
    let loser = store.find_response(response_ids[1]).await.unwrap().unwrap();
    assert_eq!(loser.status, ResponseStatus::Pending);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn plan_catalog_reads_active_subscriptions(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let plan_id = Uuid::new_v4();
    sqlx::query("INSERT INTO billing_plans (id, code, name) VALUES ($1, $2, $3)")
        .bind(plan_id)
        .bind("pro")
        .bind("Pro")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO billing_plan_entitlements (id, plan_id, entitlement_key, limit_quantity) VALUES ($1, $2, $3, $4)",
    )
    .bind(Uuid::new_v4())
    .bind(plan_id)
    .bind(LimitKey::MonthlyResponses.entitlement_key())
    .bind(Some(40_i64))
    .execute(&pool)
    .await
    .unwrap();
    let principal = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO principal_subscriptions (id, principal_id, plan_id, status) VALUES ($1, $2, $3, 'active')",
    )
    .bind(Uuid::new_v4())
    .bind(principal)
    .bind(plan_id)
    .execute(&pool)
    .await
    .unwrap();

    let catalog = PgPlanCatalog::new(pool.clone());
    let quota = catalog
        .quota_for(principal, LimitKey::MonthlyResponses)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(quota.plan_name, "Pro");
    assert_eq!(quota.base, 40);
    assert!(catalog
        .quota_for(Uuid::new_v4(), LimitKey::MonthlyResponses)
        .await
        .unwrap()
        .is_none());

    let directory = PgProfileDirectory::new(pool.clone());
    insert_profile(&pool, principal).await;
    let profile: ApplicantProfile = directory.profile(principal).await.unwrap().unwrap();
    assert_eq!(profile.display_name, "Applicant");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn concurrent_overrides_queue_on_the_advisory_lock(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool.clone(), 5_000));
    let limits = LimitEvaluator::new(
        store.clone(),
        Arc::new(StaticPlanCatalog::new(PlanQuota::free_tier(5))),
        5,
    );
    let principal = Uuid::new_v4();
    let key = LimitKey::MonthlyResponses;

    let attempts = (0..4).map(|_| {
        let limits = limits.clone();
        tokio::spawn(async move {
            limits
                .adjust_override(Uuid::new_v4(), principal, key, -3, "abuse")
                .await
        })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter(|result| result.is_err())
        .all(|result| matches!(result, Err(LimitError::WouldGoNegative { .. }))));
    assert_eq!(store.override_total(principal, key).await.unwrap(), -3);
}
