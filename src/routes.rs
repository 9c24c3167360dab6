use axum::{
    routing::{get, patch, post, put},
    Router,
};

use crate::{applications, ledger, limits};

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/ledgers/:ledger/balance", get(ledger::api::get_balance))
        .route(
            "/api/ledgers/:ledger/transactions",
            get(ledger::api::list_transactions),
        )
        .route(
            "/api/admin/ledgers/:ledger/transactions",
            get(ledger::api::admin_search),
        )
        .route(
            "/api/admin/ledgers/:ledger/:principal_id/grants",
            post(ledger::api::admin_grant),
        )
        .route(
            "/api/admin/ledgers/:ledger/:principal_id/reconcile",
            get(ledger::api::admin_reconcile),
        )
        .route("/api/limits/:key", get(limits::api::get_status))
        .route(
            "/api/admin/limits/:principal_id/:key",
            put(limits::api::set_limit),
        )
        .route(
            "/api/admin/limits/:principal_id/:key/adjust",
            post(limits::api::adjust_override),
        )
        .route(
            "/api/admin/limits/:principal_id/:key/overrides",
            get(limits::api::list_overrides),
        )
        .route(
            "/api/castings/:casting_id/responses",
            post(applications::api::create_response),
        )
        .route(
            "/api/responses/:response_id/status",
            patch(applications::api::update_status),
        )
        .route(
            "/api/admin/responses/:response_id/refund",
            post(applications::api::settle_refund),
        )
}
