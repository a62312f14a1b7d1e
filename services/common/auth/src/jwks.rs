use std::time::Duration;

use jsonwebtoken::{Algorithm, DecodingKey};
use reqwest::Client;
use serde::Deserialize;
use tracing::warn;

use crate::error::{AuthError, AuthResult};

/// Pulls RS256 signing keys from the identity provider's JWKS endpoint.
#[derive(Clone)]
pub struct JwksFetcher {
    client: Client,
    url: String,
}

impl JwksFetcher {
    pub fn new(url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self::with_client(client, url)
    }

    pub fn with_client(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Keys that are not RSA/RS256 are skipped with a warning; identity providers
    /// commonly publish EC keys next to the RSA ones.
    pub async fn fetch(&self) -> AuthResult<Vec<(String, Algorithm, DecodingKey)>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|err| AuthError::JwksFetch(err.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::JwksFetch(format!(
                "HTTP {} from {}",
                response.status(),
                self.url
            )));
        }

        let body: JwksResponse = response
            .json()
            .await
            .map_err(|err| AuthError::JwksDecode(err.to_string()))?;

        let mut keys = Vec::new();
        for key in body.keys {
            match parse_entry(key) {
                Ok(entry) => keys.push(entry),
                Err(err @ (AuthError::JwksUnsupportedKey { .. } | AuthError::JwksUnsupportedAlg { .. })) => {
                    warn!(error = %err, url = %self.url, "skipping JWKS key");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(keys)
    }
}

fn parse_entry(key: JwkEntry) -> AuthResult<(String, Algorithm, DecodingKey)> {
    let kid = key.kid.ok_or(AuthError::JwksMissingKid)?;
    let kty = key.kty.unwrap_or_else(|| "RSA".to_string());
    if kty != "RSA" {
        return Err(AuthError::JwksUnsupportedKey { kid, kty });
    }
    if let Some(alg) = key.alg {
        if alg != "RS256" {
            return Err(AuthError::JwksUnsupportedAlg { kid, alg });
        }
    }

    let modulus = key
        .n
        .ok_or_else(|| AuthError::JwksMissingComponents(kid.clone()))?;
    let exponent = key
        .e
        .ok_or_else(|| AuthError::JwksMissingComponents(kid.clone()))?;

    let decoding_key = DecodingKey::from_rsa_components(&modulus, &exponent)
        .map_err(|err| AuthError::KeyParse(kid.clone(), err.to_string()))?;
    Ok((kid, Algorithm::RS256, decoding_key))
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<JwkEntry>,
}

#[derive(Debug, Deserialize)]
struct JwkEntry {
    kid: Option<String>,
    kty: Option<String>,
    alg: Option<String>,
    n: Option<String>,
    e: Option<String>,
}
