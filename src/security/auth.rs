//! Bearer token validation
//!
//! Tokens are HS256 JWTs whose claims carry the subject and the scopes it was
//! granted. Issuance exists for embedding and tests; credential checks that
//! precede issuance live outside this crate.

use crate::error::{CoordError, CoordResult};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Seconds of clock skew tolerated on `exp`
const EXPIRY_LEEWAY_SECS: u64 = 5;

/// Claims carried by a coordination token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    /// Subject: the acting agent or user
    pub sub: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub exp: usize,
    pub iat: usize,
}

impl Claims {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    /// Required scopes this token lacks
    pub fn missing_scopes(&self, required: &[String]) -> Vec<String> {
        required
            .iter()
            .filter(|scope| !self.has_scope(scope))
            .cloned()
            .collect()
    }
}

/// Validates and issues HS256 tokens
#[derive(Clone)]
pub struct TokenValidator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    algorithm: Algorithm,
}

impl std::fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidator")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl TokenValidator {
    pub fn new(secret: &str) -> Self {
        let secret = secret.as_bytes();
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            algorithm: Algorithm::HS256,
        }
    }

    /// Issue a token for `subject` valid for `ttl`
    pub fn issue(&self, subject: &str, scopes: &[&str], ttl: Duration) -> CoordResult<String> {
        let now = Utc::now().timestamp().max(0) as usize;
        let claims = Claims {
            sub: subject.to_string(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            exp: now + ttl.as_secs() as usize,
            iat: now,
        };
        self.encode(&claims)
    }

    /// Sign arbitrary claims
    pub fn encode(&self, claims: &Claims) -> CoordResult<String> {
        encode(&Header::new(self.algorithm), claims, &self.encoding_key)
            .map_err(|e| CoordError::internal(format!("token signing failed: {e}")))
    }

    /// Verify signature and expiry
    pub fn validate(&self, token: &str) -> CoordResult<Claims> {
        let mut validation = Validation::new(self.algorithm);
        validation.validate_exp = true;
        validation.leeway = EXPIRY_LEEWAY_SECS;

        let token_data = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|e| CoordError::authentication(e.to_string()))?;
        Ok(token_data.claims)
    }

    /// Validate the token and check it carries every required scope
    pub fn authorize(&self, token: &str, required_scopes: &[String]) -> CoordResult<Claims> {
        let claims = self.validate(token)?;
        let missing = claims.missing_scopes(required_scopes);
        if !missing.is_empty() {
            return Err(CoordError::Authorization {
                actor: claims.sub,
                missing_scopes: missing,
            });
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> TokenValidator {
        TokenValidator::new("unit-test-secret")
    }

    #[test]
    fn test_issue_and_validate() {
        let validator = validator();
        let token = validator
            .issue("planner", &["calendar:write"], Duration::from_secs(60))
            .unwrap();

        let claims = validator.validate(&token).unwrap();
        assert_eq!(claims.sub, "planner");
        assert!(claims.has_scope("calendar:write"));
    }

    #[test]
    fn test_authorize_reports_missing_scopes() {
        let validator = validator();
        let token = validator
            .issue("planner", &["calendar:read"], Duration::from_secs(60))
            .unwrap();

        let err = validator
            .authorize(&token, &["calendar:read".to_string(), "calendar:write".to_string()])
            .unwrap_err();
        match err {
            CoordError::Authorization {
                actor,
                missing_scopes,
            } => {
                assert_eq!(actor, "planner");
                assert_eq!(missing_scopes, vec!["calendar:write".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_wrong_secret_is_authentication_error() {
        let token = TokenValidator::new("other-secret")
            .issue("planner", &[], Duration::from_secs(60))
            .unwrap();
        assert!(matches!(
            validator().validate(&token),
            Err(CoordError::Authentication { .. })
        ));
    }

    #[test]
    fn test_expired_token_rejected() {
        let validator = validator();
        let now = Utc::now().timestamp() as usize;
        let token = validator
            .encode(&Claims {
                sub: "planner".to_string(),
                scopes: vec![],
                exp: now - 120,
                iat: now - 180,
            })
            .unwrap();

        assert!(matches!(
            validator.authorize(&token, &[]),
            Err(CoordError::Authentication { .. })
        ));
    }

    #[test]
    fn test_garbage_token() {
        assert!(matches!(
            validator().validate("not-a-jwt"),
            Err(CoordError::Authentication { .. })
        ));
    }
}
