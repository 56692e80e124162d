//! Access-token exchange. The daily login dance (request-token URL, TOTP)
//! lives outside this crate; what the engine needs is turning a request
//! token into an access token at bootstrap when none was provided.

use crate::domain::errors::BrokerError;
use crate::infrastructure::kite::types::Envelope;
use serde::Deserialize;
use sha2::{Digest, Sha256};

#[derive(Debug, Deserialize)]
pub struct SessionData {
    pub access_token: String,
    #[serde(default)]
    pub user_id: String,
}

/// SHA-256 over `api_key + request_token + api_secret`, hex-encoded.
pub fn session_checksum(api_key: &str, request_token: &str, api_secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hasher.update(request_token.as_bytes());
    hasher.update(api_secret.as_bytes());
    hex::encode(hasher.finalize())
}

pub async fn exchange_request_token(
    base_url: &str,
    api_key: &str,
    api_secret: &str,
    request_token: &str,
) -> Result<SessionData, BrokerError> {
    let checksum = session_checksum(api_key, request_token, api_secret);
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/session/token", base_url))
        .form(&[
            ("api_key", api_key),
            ("request_token", request_token),
            ("checksum", checksum.as_str()),
        ])
        .header("X-Kite-Version", "3")
        .send()
        .await
        .map_err(|e| BrokerError::Retryable { status: None, message: e.to_string() })?;

    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .map_err(|e| BrokerError::Retryable { status: Some(status), message: e.to_string() })?;
    let envelope: Envelope<SessionData> = serde_json::from_str(&body)
        .map_err(|_| BrokerError::classify(Some(status), None, &body))?;
    if envelope.status == "success" {
        envelope
            .data
            .ok_or_else(|| BrokerError::Other { message: "empty session payload".to_string() })
    } else {
        Err(BrokerError::classify(
            Some(status),
            envelope.error_type.as_deref(),
            envelope.message.as_deref().unwrap_or("session exchange failed"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_stable_hex() {
        let a = session_checksum("key", "req", "secret");
        let b = session_checksum("key", "req", "secret");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, session_checksum("key", "req2", "secret"));
    }
}
