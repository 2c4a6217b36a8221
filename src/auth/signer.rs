//! JWT assertion signing for the service-account flow.
//!
//! An assertion names the service account as issuer, targets the token
//! endpoint as audience, requests the cloud-platform scope and is valid for
//! exactly one hour. It is signed RS256 with the account's private key and
//! carries the key id in the `kid` header.

use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use super::{AuthError, CLOUD_PLATFORM_SCOPE, TOKEN_LIFETIME};

/// Claim set of a service-account assertion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssertionClaims {
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub scope: String,
}

/// Builds signed assertions for one service account.
pub struct CredentialSigner {
    issuer: String,
    key_id: String,
    audience: String,
    key: EncodingKey,
}

impl CredentialSigner {
    /// Parse the PEM key and check that it can actually sign.
    ///
    /// Fails with [`AuthError::Credential`] for malformed PEM, a non-RSA key,
    /// or empty identity fields.
    pub fn new(
        issuer: &str,
        private_key_pem: &str,
        key_id: &str,
        audience: &str,
    ) -> Result<Self, AuthError> {
        if issuer.is_empty() {
            return Err(AuthError::Credential("issuer is empty".to_string()));
        }
        if key_id.is_empty() {
            return Err(AuthError::Credential("key id is empty".to_string()));
        }

        let key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
            .map_err(|e| AuthError::Credential(format!("parsing private key: {e}")))?;

        let signer = Self {
            issuer: issuer.to_string(),
            key_id: key_id.to_string(),
            audience: audience.to_string(),
            key,
        };

        // The PEM wrapper parses lazily; a throwaway signature surfaces a bad
        // key body now instead of on the first refresh.
        signer.sign()?;
        Ok(signer)
    }

    /// Claims for an assertion issued now.
    pub fn claims(&self) -> AssertionClaims {
        let iat = Utc::now().timestamp();
        AssertionClaims {
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat,
            exp: iat + TOKEN_LIFETIME.as_secs() as i64,
            scope: CLOUD_PLATFORM_SCOPE.to_string(),
        }
    }

    /// Produce a fresh signed assertion.
    pub fn sign(&self) -> Result<String, AuthError> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.key_id.clone());

        encode(&header, &self.claims(), &self.key)
            .map_err(|e| AuthError::Credential(format!("signing assertion: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};

    use super::*;
    use crate::config::DEFAULT_TOKEN_URL;

    const PRIVATE_KEY: &str = include_str!("../../tests/fixtures/service_account_key_pkcs8.pem");
    const PRIVATE_KEY_PKCS1: &str =
        include_str!("../../tests/fixtures/service_account_key_pkcs1.pem");
    const PUBLIC_KEY: &str = include_str!("../../tests/fixtures/service_account_pub.pem");

    fn signer() -> CredentialSigner {
        CredentialSigner::new(
            "relay@proj.iam.gserviceaccount.com",
            PRIVATE_KEY,
            "kid-123",
            DEFAULT_TOKEN_URL,
        )
        .unwrap()
    }

    #[test]
    fn test_assertion_header_and_claims() {
        let assertion = signer().sign().unwrap();

        let header = decode_header(&assertion).unwrap();
        assert_eq!(header.alg, Algorithm::RS256);
        assert_eq!(header.kid.as_deref(), Some("kid-123"));

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[DEFAULT_TOKEN_URL]);
        let data = decode::<AssertionClaims>(
            &assertion,
            &DecodingKey::from_rsa_pem(PUBLIC_KEY.as_bytes()).unwrap(),
            &validation,
        )
        .unwrap();

        let claims = data.claims;
        assert_eq!(claims.iss, "relay@proj.iam.gserviceaccount.com");
        assert_eq!(claims.aud, DEFAULT_TOKEN_URL);
        assert_eq!(claims.scope, CLOUD_PLATFORM_SCOPE);
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn test_pkcs1_key_accepted() {
        let signer = CredentialSigner::new("a@b", PRIVATE_KEY_PKCS1, "kid", DEFAULT_TOKEN_URL);
        assert!(signer.is_ok());
    }

    #[test]
    fn test_malformed_pem_rejected() {
        let err = CredentialSigner::new("a@b", "not a key", "kid", DEFAULT_TOKEN_URL)
            .err()
            .unwrap();
        assert!(matches!(err, AuthError::Credential(_)));
    }

    #[test]
    fn test_public_key_rejected() {
        let err = CredentialSigner::new("a@b", PUBLIC_KEY, "kid", DEFAULT_TOKEN_URL)
            .err()
            .unwrap();
        assert!(matches!(err, AuthError::Credential(_)));
    }

    #[test]
    fn test_empty_key_id_rejected() {
        assert!(CredentialSigner::new("a@b", PRIVATE_KEY, "", DEFAULT_TOKEN_URL).is_err());
    }
}
