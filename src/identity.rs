use axum::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Applicant,
    Employer,
    Admin,
}

impl Role {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "admin" => Role::Admin,
            "employer" => Role::Employer,
            _ => Role::Applicant,
        }
    }
}

/// Resolved caller. Authentication happens upstream; this is trusted input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Identity {
    pub principal_id: Uuid,
    pub role: Role,
}

impl Identity {
    pub fn new(principal_id: Uuid, role: Role) -> Self {
        Self { principal_id, role }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn require_admin(&self) -> Result<(), AppError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(AppError::Forbidden)
        }
    }
}

#[derive(Deserialize)]
struct Claims {
    sub: Uuid,
    role: String,
    #[allow(dead_code)]
    exp: usize,
}

#[async_trait]
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|value| value.to_string())
            .ok_or((StatusCode::UNAUTHORIZED, "Missing token".into()))?;
        let secret = crate::config::JWT_SECRET.as_str();
        let decoded = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| (StatusCode::UNAUTHORIZED, "Invalid token".into()))?;
        Ok(Identity {
            principal_id: decoded.claims.sub,
            role: Role::parse(&decoded.claims.role),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use jsonwebtoken::{encode, EncodingKey, Header};

    #[tokio::test]
    async fn identity_parsed_from_bearer_token() {
        let principal_id = Uuid::new_v4();
        let claims = serde_json::json!({
            "sub": principal_id,
            "role": "employer",
            "exp": 9999999999u64,
        });
        std::env::set_var("JWT_SECRET", "secret");
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        let request = Request::builder()
            .header("Authorization", format!("Bearer {}", token))
            .body(axum::body::Body::empty())
            .unwrap();
        let mut parts = request.into_parts().0;
        let identity = Identity::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(identity.principal_id, principal_id);
        assert_eq!(identity.role, Role::Employer);
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        let request = Request::builder()
            .body(axum::body::Body::empty())
            .unwrap();
        let mut parts = request.into_parts().0;
        let (status, _) = Identity::from_request_parts(&mut parts, &())
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
