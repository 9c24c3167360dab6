use std::sync::Arc;

use crate::applications::{ApplicationService, ProfileDirectory, ResponseTransitions};
use crate::config;
use crate::ledger::{Ledger, LedgerKind};
use crate::limits::{LimitEvaluator, PlanCatalog};
use crate::notifications::NotificationDispatcher;
use crate::store::Store;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BillingSettings {
    pub free_tier_quota: i64,
    pub response_cost: i64,
}

impl BillingSettings {
    pub fn from_env() -> Self {
        Self {
            free_tier_quota: *config::FREE_TIER_MONTHLY_RESPONSES,
            response_cost: *config::RESPONSE_CREDIT_COST,
        }
    }
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            free_tier_quota: 5,
            response_cost: 1,
        }
    }
}

/// key: billing-services -> one shared bundle per process, handed to handlers as an `Extension`
#[derive(Clone)]
pub struct BillingServices {
    pub wallet: Ledger,
    pub credits: Ledger,
    pub limits: LimitEvaluator,
    pub applications: ApplicationService,
    pub transitions: ResponseTransitions,
}

impl BillingServices {
    pub fn new(
        store: Arc<dyn Store>,
        catalog: Arc<dyn PlanCatalog>,
        profiles: Arc<dyn ProfileDirectory>,
        notifier: Arc<dyn NotificationDispatcher>,
        settings: BillingSettings,
    ) -> Self {
        let limits = LimitEvaluator::new(store.clone(), catalog, settings.free_tier_quota);
        let applications = ApplicationService::new(
            store.clone(),
            limits.clone(),
            profiles,
            notifier.clone(),
            settings.response_cost,
        );
        Self {
            wallet: Ledger::wallet(store.clone()),
            credits: Ledger::credit(store.clone()),
            transitions: ResponseTransitions::new(store, notifier),
            limits,
            applications,
        }
    }

    pub fn ledger(&self, kind: LedgerKind) -> &Ledger {
        match kind {
            LedgerKind::Wallet => &self.wallet,
            LedgerKind::Credit => &self.credits,
        }
    }
}
