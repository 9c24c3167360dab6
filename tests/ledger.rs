use std::sync::Arc;

use casting_billing::ledger::{
    Ledger, LedgerError, LedgerKind, Page, TransactionFilter, TransactionKind,
};
use casting_billing::store::{MemoryStore, Store};
use futures_util::future::join_all;
use uuid::Uuid;

fn memory_store() -> Arc<dyn Store> {
    Arc::new(MemoryStore::new())
}

// key: ledger-tests -> non-negativity under contention
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_deductions_never_overdraw() {
    let store = memory_store();
    let credits = Ledger::credit(store.clone());
    let principal = Uuid::new_v4();
    credits.grant(principal, 5, None, "seed").await.unwrap();

    let attempts = (0..10).map(|attempt| {
        let credits = credits.clone();
        tokio::spawn(async move {
            let reference = format!("job-{attempt}");
            credits.deduct(principal, 1, Some(&reference), None).await
        })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let applied = results.iter().filter(|result| result.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|result| matches!(result, Err(LedgerError::InsufficientFunds { .. })))
        .count();
    assert_eq!(applied, 5);
    assert_eq!(rejected, 5);
    assert_eq!(credits.balance(principal).await.unwrap(), 0);

    let report = credits.reconcile(principal).await.unwrap();
    assert!(report.consistent);
    assert_eq!(report.ledger_sum, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_retries_with_one_reference_apply_once() {
    let store = memory_store();
    let wallet = Ledger::wallet(store.clone());
    let principal = Uuid::new_v4();
    wallet.grant(principal, 100, None, "top up").await.unwrap();

    let retries = (0..8).map(|_| {
        let wallet = wallet.clone();
        tokio::spawn(async move { wallet.deduct(principal, 30, Some("order-17"), None).await })
    });
    let outcomes: Vec<_> = join_all(retries)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(outcomes.iter().filter(|outcome| !outcome.is_replay()).count(), 1);
    let first_id = outcomes[0].transaction().id;
    assert!(outcomes
        .iter()
        .all(|outcome| outcome.transaction().id == first_id));
    assert_eq!(wallet.balance(principal).await.unwrap(), 70);

    let payments = wallet
        .search_transactions(&TransactionFilter {
            principal_id: Some(principal),
            kind: Some(TransactionKind::Payment),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(payments.len(), 1);
}

#[tokio::test]
async fn reused_reference_with_a_different_amount_conflicts() {
    let store = memory_store();
    let wallet = Ledger::wallet(store.clone());
    let principal = Uuid::new_v4();
    wallet.grant(principal, 50, None, "top up").await.unwrap();

    wallet
        .deduct(principal, 10, Some("order-1"), None)
        .await
        .unwrap();
    let err = wallet
        .deduct(principal, 20, Some("order-1"), None)
        .await
        .unwrap_err();
    match err {
        LedgerError::ReferenceConflict {
            existing_delta,
            requested_delta,
            ..
        } => {
            assert_eq!(existing_delta, -10);
            assert_eq!(requested_delta, -20);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(wallet.balance(principal).await.unwrap(), 40);
}

#[tokio::test]
async fn ledger_policies_are_enforced_per_kind() {
    let store = memory_store();
    let wallet = Ledger::wallet(store.clone());
    let credits = Ledger::credit(store.clone());
    let principal = Uuid::new_v4();

    assert!(matches!(
        wallet.deduct(principal, 1, None, None).await,
        Err(LedgerError::MissingReference { .. })
    ));
    assert!(matches!(
        wallet.purchase(principal, 10, Some("p-1")).await,
        Err(LedgerError::KindNotAllowed { .. })
    ));
    assert!(matches!(
        credits.deduct(principal, 0, None, None).await,
        Err(LedgerError::InvalidAmount(0))
    ));

    credits.purchase(principal, 10, Some("p-1")).await.unwrap();
    // Credit deductions may omit a reference.
    credits.deduct(principal, 4, None, None).await.unwrap();
    assert_eq!(credits.balance(principal).await.unwrap(), 6);
    assert_eq!(wallet.balance(principal).await.unwrap(), 0);
}

#[tokio::test]
async fn balances_always_equal_the_sum_of_history() {
    let store = memory_store();
    let wallet = Ledger::wallet(store.clone());
    let principal = Uuid::new_v4();

    wallet.grant(principal, 40, Some("t-1"), "top up").await.unwrap();
    wallet.deduct(principal, 15, Some("o-1"), None).await.unwrap();
    wallet.refund(principal, 5, Some("r-1"), None).await.unwrap();
    let _ = wallet.deduct(principal, 100, Some("o-2"), None).await;
    wallet.grant(principal, 40, Some("t-1"), "top up").await.unwrap();

    let history = wallet
        .list_transactions(principal, Page::default())
        .await
        .unwrap();
    let sum: i64 = history.iter().map(|transaction| transaction.delta).sum();
    assert_eq!(history.len(), 3);
    assert_eq!(sum, 30);
    assert_eq!(wallet.balance(principal).await.unwrap(), 30);
    assert!(wallet.reconcile(principal).await.unwrap().consistent);
}

#[tokio::test]
async fn history_is_paginated_newest_first() {
    let store = memory_store();
    let credits = Ledger::credit(store.clone());
    let principal = Uuid::new_v4();
    for amount in 1..=5 {
        credits
            .grant(principal, amount, None, "bulk")
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }

    let page = credits
        .list_transactions(principal, Page { limit: 2, offset: 1 })
        .await
        .unwrap();
    let deltas: Vec<i64> = page.iter().map(|transaction| transaction.delta).collect();
    assert_eq!(deltas, vec![4, 3]);

    let clamped = credits
        .list_transactions(principal, Page { limit: 0, offset: -3 })
        .await
        .unwrap();
    assert_eq!(clamped.len(), 1);
    assert_eq!(clamped[0].delta, 5);
    assert_eq!(credits.kind(), LedgerKind::Credit);
}
