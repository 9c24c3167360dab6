use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::models::ApplicantProfile;

/// key: profile-directory -> eligibility attributes for pre-billing checks
#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn profile(&self, principal_id: Uuid) -> Result<Option<ApplicantProfile>>;
}

#[derive(Clone)]
pub struct PgProfileDirectory {
    pool: PgPool,
}

impl PgProfileDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProfileDirectory for PgProfileDirectory {
    async fn profile(&self, principal_id: Uuid) -> Result<Option<ApplicantProfile>> {
        let profile = sqlx::query_as::<_, ApplicantProfile>(
            "SELECT principal_id, display_name, age, gender, city FROM profiles WHERE principal_id = $1",
        )
        .bind(principal_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(profile)
    }
}

/// Fixed set of profiles, for demos and tests.
#[derive(Default)]
pub struct InMemoryProfiles {
    profiles: RwLock<HashMap<Uuid, ApplicantProfile>>,
}

impl InMemoryProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, profile: ApplicantProfile) {
        let mut profiles = match self.profiles.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        profiles.insert(profile.principal_id, profile);
    }
}

#[async_trait]
impl ProfileDirectory for InMemoryProfiles {
    async fn profile(&self, principal_id: Uuid) -> Result<Option<ApplicantProfile>> {
        let profiles = match self.profiles.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(profiles.get(&principal_id).cloned())
    }
}
