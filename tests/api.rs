use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::{Extension, Router};
use casting_billing::applications::{ApplicantProfile, Casting, InMemoryProfiles};
use casting_billing::limits::{PlanQuota, StaticPlanCatalog};
use casting_billing::notifications::{start_notification_worker, LogSink};
use casting_billing::routes::api_routes;
use casting_billing::store::{MemoryStore, Store};
use casting_billing::{BillingServices, BillingSettings};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use tower::ServiceExt; // for `oneshot`
use uuid::Uuid;

struct TestApp {
    router: Router,
    store: Arc<dyn Store>,
    profiles: Arc<InMemoryProfiles>,
}

fn app(monthly_quota: i64) -> TestApp {
    std::env::set_var("JWT_SECRET", "secret");
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let profiles = Arc::new(InMemoryProfiles::new());
    let services = BillingServices::new(
        store.clone(),
        Arc::new(StaticPlanCatalog::new(PlanQuota::free_tier(monthly_quota))),
        profiles.clone(),
        Arc::new(start_notification_worker(Arc::new(LogSink), 8)),
        BillingSettings::default(),
    );
    TestApp {
        router: api_routes().layer(Extension(services)),
        store,
        profiles,
    }
}

fn token(principal_id: Uuid, role: &str) -> String {
    let claims = json!({ "sub": principal_id, "role": role, "exp": 9999999999u64 });
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"secret"),
    )
    .unwrap()
}

async fn send(
    router: &Router,
    method: Method,
    uri: &str,
    bearer: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(bearer) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {bearer}"));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn balances_require_a_token() {
    let app = app(5);
    let (status, _) = send(&app.router, Method::GET, "/api/ledgers/credit/balance", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let principal = Uuid::new_v4();
    let bearer = token(principal, "applicant");
    let (status, body) = send(
        &app.router,
        Method::GET,
        "/api/ledgers/credit/balance",
        Some(&bearer),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance"], 0);
    assert_eq!(body["ledger"], "credit");

    let (status, _) = send(
        &app.router,
        Method::GET,
        "/api/ledgers/points/balance",
        Some(&bearer),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn grants_are_admin_only() {
    let app = app(5);
    let principal = Uuid::new_v4();
    let uri = format!("/api/admin/ledgers/credit/{principal}/grants");
    let payload = json!({ "amount": 5, "reference": "support-42" });

    let (status, _) = send(
        &app.router,
        Method::POST,
        &uri,
        Some(&token(principal, "applicant")),
        Some(payload.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let admin = token(Uuid::new_v4(), "admin");
    let (status, body) = send(&app.router, Method::POST, &uri, Some(&admin), Some(payload)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "applied");
    assert_eq!(body["balance"], 5);

    let (status, body) = send(
        &app.router,
        Method::GET,
        &format!("/api/admin/ledgers/credit/{principal}/reconcile"),
        Some(&admin),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["consistent"], true);
}

#[tokio::test]
async fn exhausted_quota_without_credits_is_payment_required() {
    let app = app(0);
    let employer = Uuid::new_v4();
    let applicant = Uuid::new_v4();
    app.profiles.insert(ApplicantProfile {
        principal_id: applicant,
        display_name: "Applicant".to_string(),
        age: None,
        gender: None,
        city: None,
    });
    let casting = Casting::new(employer, "Voice over", None);
    app.store.insert_casting(&casting).await.unwrap();

    let (status, body) = send(
        &app.router,
        Method::POST,
        &format!("/api/castings/{}/responses", casting.id),
        Some(&token(applicant, "applicant")),
        Some(json!({ "cover_letter": "Hello" })),
    )
    .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["required"], 1);
    assert_eq!(body["limit"]["plan_name"], "Free");
}

#[tokio::test]
async fn validation_errors_are_bad_requests() {
    let app = app(5);
    let bearer = token(Uuid::new_v4(), "employer");

    let (status, _) = send(
        &app.router,
        Method::GET,
        "/api/limits/daily_posts",
        Some(&bearer),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app.router,
        Method::PATCH,
        &format!("/api/responses/{}/status", Uuid::new_v4()),
        Some(&bearer),
        Some(json!({ "status": "archived" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app.router,
        Method::PATCH,
        &format!("/api/responses/{}/status", Uuid::new_v4()),
        Some(&bearer),
        Some(json!({ "status": "viewed" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
