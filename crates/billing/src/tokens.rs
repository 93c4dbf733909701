//! Signed access tokens
//!
//! Opaque, email-bound proof of entitlement embedded in checkout session
//! metadata and outbound notification links. Format:
//! `base64url(JSON payload) . hex(HMAC-SHA256(payload))` under the server
//! secret. No session state; verification is recomputation.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// What a token grants; drives the expiry window and whether the
/// request id must match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    /// Post-payment report access (bound to a request id)
    Payment,
    EmailVerification,
    AccountSetup,
    PasswordReset,
}

impl TokenType {
    /// Expiry window in milliseconds
    pub fn expiry_ms(&self) -> i64 {
        match self {
            TokenType::Payment => 30 * DAY_MS,
            TokenType::EmailVerification => DAY_MS,
            TokenType::AccountSetup => 7 * DAY_MS,
            TokenType::PasswordReset => DAY_MS / 24,
        }
    }

    /// Whether verification must also match the request id
    pub fn binds_request(&self) -> bool {
        matches!(self, TokenType::Payment)
    }
}

/// The signed payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub email: String,
    pub request_id: Option<String>,
    pub token_type: TokenType,
    pub issued_at_ms: i64,
}

#[derive(Clone)]
pub struct AccessTokenService {
    secret: String,
}

impl AccessTokenService {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        let secret = std::env::var("ACCESS_TOKEN_SECRET")
            .map_err(|_| BillingError::Internal("ACCESS_TOKEN_SECRET not set".to_string()))?;
        Ok(Self::new(secret))
    }

    pub fn generate(
        &self,
        email: &str,
        request_id: Option<&str>,
        token_type: TokenType,
    ) -> BillingResult<String> {
        self.generate_at(
            email,
            request_id,
            token_type,
            OffsetDateTime::now_utc().unix_timestamp() * 1000,
        )
    }

    /// Deterministic variant for tests
    pub fn generate_at(
        &self,
        email: &str,
        request_id: Option<&str>,
        token_type: TokenType,
        issued_at_ms: i64,
    ) -> BillingResult<String> {
        let claims = TokenClaims {
            email: email.to_lowercase(),
            request_id: request_id.map(str::to_string),
            token_type,
            issued_at_ms,
        };
        let payload = serde_json::to_string(&claims)
            .map_err(|e| BillingError::Internal(format!("token payload: {}", e)))?;

        use base64::Engine as _;
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&payload);
        let signature = self.sign(&payload)?;

        Ok(format!("{}.{}", encoded, signature))
    }

    /// Verify a token against the expected email / request / type.
    ///
    /// Checks, in order: structural shape, signature, email
    /// (case-insensitive), request id when the type binds one, and age
    /// against the type's expiry window.
    pub fn verify(
        &self,
        token: &str,
        expected_email: &str,
        expected_request_id: Option<&str>,
        expected_type: TokenType,
    ) -> BillingResult<TokenClaims> {
        self.verify_at(
            token,
            expected_email,
            expected_request_id,
            expected_type,
            OffsetDateTime::now_utc().unix_timestamp() * 1000,
        )
    }

    pub fn verify_at(
        &self,
        token: &str,
        expected_email: &str,
        expected_request_id: Option<&str>,
        expected_type: TokenType,
        now_ms: i64,
    ) -> BillingResult<TokenClaims> {
        let (encoded, signature) = token
            .split_once('.')
            .ok_or_else(|| BillingError::Validation("malformed token".to_string()))?;

        use base64::Engine as _;
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| BillingError::Validation("malformed token".to_string()))?;
        let payload = String::from_utf8(payload)
            .map_err(|_| BillingError::Validation("malformed token".to_string()))?;

        let expected_signature = self.sign(&payload)?;
        if expected_signature != signature {
            return Err(BillingError::Validation("invalid token signature".to_string()));
        }

        let claims: TokenClaims = serde_json::from_str(&payload)
            .map_err(|_| BillingError::Validation("malformed token payload".to_string()))?;

        if claims.token_type != expected_type {
            return Err(BillingError::Validation("wrong token type".to_string()));
        }

        if !claims.email.eq_ignore_ascii_case(expected_email.trim()) {
            return Err(BillingError::Validation("token email mismatch".to_string()));
        }

        if expected_type.binds_request() && claims.request_id.as_deref() != expected_request_id {
            return Err(BillingError::Validation(
                "token request mismatch".to_string(),
            ));
        }

        if now_ms - claims.issued_at_ms >= expected_type.expiry_ms() {
            return Err(BillingError::Validation("token expired".to_string()));
        }

        Ok(claims)
    }

    fn sign(&self, payload: &str) -> BillingResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| BillingError::Internal("invalid token secret".to_string()))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> AccessTokenService {
        AccessTokenService::new("test-secret")
    }

    #[test]
    fn test_round_trip() {
        let svc = service();
        let token = svc
            .generate_at("a@b.com", Some("R1"), TokenType::Payment, 1_000_000)
            .unwrap();
        let claims = svc
            .verify_at(&token, "a@b.com", Some("R1"), TokenType::Payment, 1_000_001)
            .unwrap();
        assert_eq!(claims.email, "a@b.com");
        assert_eq!(claims.request_id.as_deref(), Some("R1"));
    }

    #[test]
    fn test_email_case_insensitive() {
        let svc = service();
        let token = svc
            .generate_at("A@B.com", Some("R1"), TokenType::Payment, 0)
            .unwrap();
        assert!(svc
            .verify_at(&token, "a@b.COM", Some("R1"), TokenType::Payment, 1)
            .is_ok());
    }

    #[test]
    fn test_expiry_boundary() {
        let svc = service();
        let issued = 0;
        let token = svc
            .generate_at("a@b.com", Some("R1"), TokenType::Payment, issued)
            .unwrap();

        let just_inside = TokenType::Payment.expiry_ms() - 1;
        assert!(svc
            .verify_at(&token, "a@b.com", Some("R1"), TokenType::Payment, just_inside)
            .is_ok());

        let at_expiry = TokenType::Payment.expiry_ms();
        assert!(svc
            .verify_at(&token, "a@b.com", Some("R1"), TokenType::Payment, at_expiry)
            .is_err());
    }

    #[test]
    fn test_email_mismatch_rejected() {
        let svc = service();
        let token = svc
            .generate_at("a@b.com", Some("R1"), TokenType::Payment, 0)
            .unwrap();
        assert!(svc
            .verify_at(&token, "other@b.com", Some("R1"), TokenType::Payment, 1)
            .is_err());
    }

    #[test]
    fn test_request_mismatch_rejected() {
        let svc = service();
        let token = svc
            .generate_at("a@b.com", Some("R1"), TokenType::Payment, 0)
            .unwrap();
        assert!(svc
            .verify_at(&token, "a@b.com", Some("R2"), TokenType::Payment, 1)
            .is_err());
    }

    #[test]
    fn test_tampered_payload_fails_signature() {
        let svc = service();
        let token = svc
            .generate_at("a@b.com", Some("R1"), TokenType::Payment, 0)
            .unwrap();

        // Flip a single character in the payload half
        let (payload, sig) = token.split_once('.').unwrap();
        let mut chars: Vec<char> = payload.chars().collect();
        chars[0] = if chars[0] == 'A' { 'B' } else { 'A' };
        let tampered: String = chars.into_iter().collect();
        let tampered = format!("{}.{}", tampered, sig);

        assert!(svc
            .verify_at(&tampered, "a@b.com", Some("R1"), TokenType::Payment, 1)
            .is_err());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = service()
            .generate_at("a@b.com", Some("R1"), TokenType::Payment, 0)
            .unwrap();
        let other = AccessTokenService::new("different-secret");
        assert!(other
            .verify_at(&token, "a@b.com", Some("R1"), TokenType::Payment, 1)
            .is_err());
    }

    #[test]
    fn test_expiry_table() {
        assert_eq!(TokenType::Payment.expiry_ms(), 30 * 86_400_000);
        assert_eq!(TokenType::EmailVerification.expiry_ms(), 86_400_000);
        assert_eq!(TokenType::AccountSetup.expiry_ms(), 7 * 86_400_000);
        assert_eq!(TokenType::PasswordReset.expiry_ms(), 3_600_000);
    }

    #[test]
    fn test_non_payment_tokens_ignore_request_binding() {
        let svc = service();
        let token = svc
            .generate_at("a@b.com", None, TokenType::EmailVerification, 0)
            .unwrap();
        // request id is not checked for verification tokens
        assert!(svc
            .verify_at(&token, "a@b.com", Some("R9"), TokenType::EmailVerification, 1)
            .is_ok());
    }
}
