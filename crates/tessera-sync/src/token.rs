//! # Peer Tokens
//!
//! Bearer tokens authenticating peer protocol calls.
//!
//! ## Flow
//! ```text
//! ┌────────────────────┐                              ┌────────────────────┐
//! │  Node A (client)   │                              │  Node B (server)   │
//! │                    │  POST /api/v1/sync/p2p/...   │                    │
//! │  mint_token(url) ──┼─► Authorization: Bearer … ──►┼─► verify_token(    │
//! │                    │   X-Issuer: https://node-a   │     token, path)   │
//! └────────────────────┘                              └────────────────────┘
//! ```
//!
//! Each token is bound to one HTTP method and one endpoint (`htm` / `htu`
//! claims), so a token minted for discovery cannot be replayed against the
//! entities endpoint. Tokens are HS256 with a secret shared by the fleet.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

/// HTTP method every peer protocol call uses.
const PEER_METHOD: &str = "POST";

/// Claims carried by a peer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerClaims {
    /// Unique token id.
    pub jti: String,

    /// HTTP method the token is valid for.
    pub htm: String,

    /// Target URL the token was minted for.
    pub htu: String,

    /// Domain of the minting node.
    pub iss: String,

    /// Issued at (Unix timestamp)
    pub iat: i64,

    /// Expiration (Unix timestamp)
    pub exp: i64,
}

/// Mints and verifies peer tokens.
pub trait TokenService: Send + Sync {
    /// Mints a token for a call to `resource_uri`.
    fn mint_token(&self, resource_uri: &str) -> SyncResult<String>;

    /// Verifies a token presented on `expected_path`.
    fn verify_token(&self, token: &str, expected_path: &str) -> SyncResult<PeerClaims>;
}

/// HMAC-signed JWT implementation of [`TokenService`].
pub struct JwtTokenService {
    secret: String,
    issuer: String,
    lifetime_secs: i64,
}

impl JwtTokenService {
    pub fn new(secret: impl Into<String>, issuer: impl Into<String>, lifetime_secs: i64) -> Self {
        JwtTokenService {
            secret: secret.into(),
            issuer: issuer.into(),
            lifetime_secs,
        }
    }
}

impl TokenService for JwtTokenService {
    fn mint_token(&self, resource_uri: &str) -> SyncResult<String> {
        let now = Utc::now();
        let exp = now + Duration::seconds(self.lifetime_secs);

        let claims = PeerClaims {
            jti: Uuid::new_v4().to_string(),
            htm: PEER_METHOD.to_string(),
            htu: resource_uri.to_string(),
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| SyncError::TokenMintFailed(e.to_string()))
    }

    fn verify_token(&self, token: &str, expected_path: &str) -> SyncResult<PeerClaims> {
        let token_data: TokenData<PeerClaims> = decode(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )?;
        let claims = token_data.claims;

        if !claims.htm.eq_ignore_ascii_case(PEER_METHOD) {
            return Err(SyncError::TokenInvalid(format!(
                "token is bound to method {}",
                claims.htm
            )));
        }

        if target_path(&claims.htu) != expected_path {
            return Err(SyncError::TokenInvalid(format!(
                "token is bound to {}, not {}",
                claims.htu, expected_path
            )));
        }

        Ok(claims)
    }
}

/// Path component of the `htu` claim. A bare path is returned as-is.
fn target_path(htu: &str) -> String {
    match url::Url::parse(htu) {
        Ok(url) => url.path().to_string(),
        Err(_) => htu.split('?').next().unwrap_or_default().to_string(),
    }
}

/// Extract bearer token from authorization header.
pub fn extract_bearer_token(auth_header: &str) -> Option<&str> {
    auth_header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DISCOVERY: &str = "/api/v1/sync/p2p/discovery";

    fn service() -> JwtTokenService {
        JwtTokenService::new("test-secret", "https://node-a.example.org", 300)
    }

    #[test]
    fn test_token_roundtrip() {
        let tokens = service();
        let token = tokens
            .mint_token("https://node-b.example.org/api/v1/sync/p2p/discovery")
            .unwrap();

        let claims = tokens.verify_token(&token, DISCOVERY).unwrap();
        assert_eq!(claims.iss, "https://node-a.example.org");
        assert_eq!(claims.htm, "POST");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_token_bound_to_endpoint() {
        let tokens = service();
        let token = tokens
            .mint_token("https://node-b.example.org/api/v1/sync/p2p/discovery")
            .unwrap();

        let err = tokens
            .verify_token(&token, "/api/v1/sync/p2p/entities")
            .unwrap_err();
        assert!(matches!(err, SyncError::TokenInvalid(_)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = service().mint_token(DISCOVERY).unwrap();
        let other = JwtTokenService::new("other-secret", "x", 300);
        assert!(other.verify_token(&token, DISCOVERY).is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let tokens = JwtTokenService::new("test-secret", "x", -3600);
        let token = tokens.mint_token(DISCOVERY).unwrap();
        assert!(tokens.verify_token(&token, DISCOVERY).is_err());
    }

    #[test]
    fn test_extract_bearer() {
        assert_eq!(extract_bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(extract_bearer_token("Basic abc"), None);
        assert_eq!(extract_bearer_token("Bearer "), None);
    }
}
