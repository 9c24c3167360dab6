use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use super::models::{Casting, CastingStatus, Response, ResponseStatus};
use crate::identity::Identity;
use crate::ledger::{Ledger, LedgerError, LedgerKind, LedgerTransaction, RelatedEntity, TransactionKind};
use crate::notifications::{Notification, NotificationDispatcher};
use crate::store::{Store, StoreError, UnitOfWork};

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("response not found")]
    ResponseNotFound,
    #[error("casting not found")]
    CastingNotFound,
    #[error("only the casting owner can change response status")]
    Forbidden,
    #[error("cannot move a response from {} to {}", .from.as_str(), .to.as_str())]
    InvalidStatusTransition {
        from: ResponseStatus,
        to: ResponseStatus,
    },
    #[error("casting is full or closed")]
    CastingFullOrClosed,
    #[error("response is {}, not rejected", .0.as_str())]
    NotRejected(ResponseStatus),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug, Serialize)]
pub struct TransitionReceipt {
    pub response: Response,
    /// Casting counters after an acceptance.
    pub casting: Option<Casting>,
    pub refund: Option<LedgerTransaction>,
}

/// key: transition-engine -> status writes, guarded capacity, refund on rejection
#[derive(Clone)]
pub struct ResponseTransitions {
    store: Arc<dyn Store>,
    credits: Ledger,
    notifier: Arc<dyn NotificationDispatcher>,
}

impl ResponseTransitions {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn NotificationDispatcher>) -> Self {
        Self {
            credits: Ledger::credit(store.clone()),
            store,
            notifier,
        }
    }

    pub async fn set_status(
        &self,
        identity: &Identity,
        response_id: Uuid,
        next: ResponseStatus,
    ) -> Result<TransitionReceipt, TransitionError> {
        let snapshot = self
            .store
            .find_response(response_id)
            .await?
            .ok_or(TransitionError::ResponseNotFound)?;
        let casting = self
            .store
            .find_casting(snapshot.casting_id)
            .await?
            .ok_or(TransitionError::CastingNotFound)?;
        if !identity.is_admin() && casting.owner_id != identity.principal_id {
            return Err(TransitionError::Forbidden);
        }

        let now = Utc::now();
        let mut unit = self.store.begin().await?;
        let current = unit
            .lock_response(response_id)
            .await?
            .ok_or(TransitionError::ResponseNotFound)?;
        if !current.status.can_transition_to(next) {
            debug!(
                %response_id,
                from = current.status.as_str(),
                to = next.as_str(),
                "rejected status transition"
            );
            return Err(TransitionError::InvalidStatusTransition {
                from: current.status,
                to: next,
            });
        }

        unit.set_response_status(response_id, next, now).await?;

        let updated_casting = if next == ResponseStatus::Accepted {
            match unit.increment_accepted(current.casting_id, now).await? {
                Some(casting) => Some(casting),
                None => return Err(TransitionError::CastingFullOrClosed),
            }
        } else {
            None
        };

        let mut response = current;
        response.move_to(next, now);
        let refund = if response.refund_owed() {
            self.refund_in(unit.as_mut(), &response).await?
        } else {
            None
        };

        unit.commit().await?;

        info!(
            %response_id,
            casting_id = %response.casting_id,
            status = next.as_str(),
            refunded = refund.is_some(),
            "response status changed"
        );

        self.notifier.dispatch(Notification::ResponseStatusChanged {
            response_id,
            applicant_id: response.applicant_id,
            status: next,
        });
        if let Some(casting) = &updated_casting {
            if casting.status == CastingStatus::Closed {
                info!(casting_id = %casting.id, accepted = casting.accepted_count, "casting filled and closed");
                self.notifier.dispatch(Notification::CastingClosed {
                    casting_id: casting.id,
                    employer_id: casting.owner_id,
                    accepted_count: casting.accepted_count,
                });
            }
        }

        Ok(TransitionReceipt {
            response,
            casting: updated_casting,
            refund,
        })
    }

    /// Re-runnable compensation for a charged response rejected straight from
    /// `pending`. Writes at most one refund per response no matter how often it
    /// is invoked; rejections after review keep the charge.
    pub async fn settle_rejection_refund(
        &self,
        response_id: Uuid,
    ) -> Result<Option<LedgerTransaction>, TransitionError> {
        let mut unit = self.store.begin().await?;
        let response = unit
            .lock_response(response_id)
            .await?
            .ok_or(TransitionError::ResponseNotFound)?;
        if response.status != ResponseStatus::Rejected {
            return Err(TransitionError::NotRejected(response.status));
        }
        if !response.refund_owed() {
            return Ok(None);
        }
        let refund = self.refund_in(unit.as_mut(), &response).await?;
        unit.commit().await?;
        if let Some(refund) = &refund {
            info!(%response_id, amount = refund.delta, "rejection refund settled");
        }
        Ok(refund)
    }

    async fn refund_in(
        &self,
        unit: &mut dyn UnitOfWork,
        response: &Response,
    ) -> Result<Option<LedgerTransaction>, TransitionError> {
        if response.charged_amount <= 0 {
            return Ok(None);
        }
        if unit
            .has_related_transaction(LedgerKind::Credit, TransactionKind::Refund, response.id)
            .await?
        {
            return Ok(None);
        }
        let reference = format!("refund:{}", response.id);
        let outcome = self
            .credits
            .refund_in(
                unit,
                response.applicant_id,
                response.charged_amount,
                Some(&reference),
                Some(RelatedEntity::response(response.id)),
            )
            .await?;
        if outcome.is_replay() {
            return Ok(None);
        }
        Ok(Some(outcome.transaction().clone()))
    }
}
