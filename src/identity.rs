//! Unit identity, read from the `uuid` claim of the auth token.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::Deserialize;

use crate::error::{PepeunitError, Result};
use crate::settings::SettingsStore;

/// Resolves the identifier of this unit. Fails with
/// [`PepeunitError::InvalidToken`] when the identity cannot be derived.
pub trait IdentityProvider: Send + Sync {
    fn unit_id(&self) -> Result<String>;
}

#[derive(Deserialize)]
struct Claims {
    uuid: Option<serde_json::Value>,
}

/// Extracts the unit id from a JWT-shaped token without verifying the signature.
pub fn unit_id_from_token(token: &str) -> Result<String> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(PepeunitError::InvalidToken(
            "expected three dot-separated segments".to_string(),
        ));
    }

    let payload = URL_SAFE_NO_PAD
        .decode(parts[1].trim_end_matches('='))
        .map_err(|e| PepeunitError::InvalidToken(format!("payload is not base64url: {e}")))?;
    let claims: Claims = serde_json::from_slice(&payload)
        .map_err(|e| PepeunitError::InvalidToken(format!("payload is not JSON: {e}")))?;

    match claims.uuid {
        Some(serde_json::Value::String(uuid)) => Ok(uuid),
        Some(_) => Err(PepeunitError::InvalidToken("uuid claim is not a string".to_string())),
        None => Err(PepeunitError::InvalidToken("uuid claim missing".to_string())),
    }
}

/// Identity backed by `PU_AUTH_TOKEN` of the current settings snapshot.
pub struct JwtIdentity {
    settings: Arc<SettingsStore>,
}

impl JwtIdentity {
    pub fn new(settings: Arc<SettingsStore>) -> Self {
        Self { settings }
    }
}

impl IdentityProvider for JwtIdentity {
    fn unit_id(&self) -> Result<String> {
        unit_id_from_token(&self.settings.snapshot().auth_token)
    }
}

#[cfg(test)]
pub(crate) fn token_for(uuid: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"uuid":"{uuid}","type":"Unit"}}"#));
    format!("{header}.{payload}.signature")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_uuid_claim() {
        let token = token_for("550e8400-e29b-41d4-a716-446655440000");
        assert_eq!(
            unit_id_from_token(&token).unwrap(),
            "550e8400-e29b-41d4-a716-446655440000"
        );
    }

    #[test]
    fn padded_payload_is_accepted() {
        let payload = base64::engine::general_purpose::URL_SAFE.encode(br#"{"uuid":"abc"}"#);
        let token = format!("h.{payload}.s");
        assert_eq!(unit_id_from_token(&token).unwrap(), "abc");
    }

    #[test]
    fn malformed_tokens_are_invalid() {
        for token in ["", "only.two", "a.!!!.c", "a.e30.c"] {
            assert!(
                matches!(unit_id_from_token(token), Err(PepeunitError::InvalidToken(_))),
                "token {token:?} should be rejected"
            );
        }
    }
}
