use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts},
};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, get_current_timestamp, Algorithm, DecodingKey, EncodingKey,
    Header, Validation,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::GatewayError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    pub iat: u64,
    pub nbf: u64,
    pub exp: u64,
}

/// HS256 verification (and, for local use, issuance) of bearer tokens.
pub struct JwtVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_nbf = true;
        validation.set_required_spec_claims(&["exp", "nbf", "sub"]);

        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<Caller, GatewayError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            let reason = match e.kind() {
                ErrorKind::ExpiredSignature => "token expired",
                ErrorKind::ImmatureSignature => "token not yet valid",
                _ => "invalid token",
            };
            GatewayError::Unauthorized(reason.to_string())
        })?;

        Ok(Caller::from(data.claims))
    }

    pub fn issue(
        &self,
        subject: &str,
        account_id: Option<&str>,
        roles: &[String],
        ttl: Duration,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let now = get_current_timestamp();
        let claims = Claims {
            sub: subject.to_string(),
            account_id: account_id.map(str::to_string),
            roles: roles.to_vec(),
            iat: now,
            nbf: now,
            exp: now + ttl.as_secs(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
    }
}

/// The authenticated principal behind a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub subject: String,
    pub account_id: Option<String>,
    pub roles: Vec<String>,
}

impl Caller {
    pub fn has_any_role(&self, allowed: &[String]) -> bool {
        self.roles.iter().any(|role| allowed.contains(role))
    }
}

impl From<Claims> for Caller {
    fn from(claims: Claims) -> Self {
        Self {
            subject: claims.sub,
            account_id: claims.account_id,
            roles: claims.roles,
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
    Arc<JwtVerifier>: FromRef<S>,
{
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let auth = parts
            .headers
            .get(header::AUTHORIZATION)
            .ok_or_else(|| GatewayError::Unauthorized("missing credentials".to_string()))?
            .to_str()
            .map_err(|_| GatewayError::Unauthorized("invalid credentials".to_string()))?;

        let token = auth
            .strip_prefix("Bearer ")
            .ok_or_else(|| GatewayError::Unauthorized("expected a bearer token".to_string()))?;

        Arc::<JwtVerifier>::from_ref(state).verify(token.trim())
    }
}
