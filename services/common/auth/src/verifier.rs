use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde_json::Value;
use tracing::debug;

use crate::claims::Claims;
use crate::config::JwtConfig;
use crate::error::{AuthError, AuthResult};
use crate::jwks::JwksFetcher;
use crate::roles::ROLE_ADMIN;

/// Key id used for tokens that carry no `kid` header (shared-secret deployments).
pub const DEFAULT_KEY_ID: &str = "default";

#[derive(Clone)]
struct KeyEntry {
    algorithm: Algorithm,
    key: DecodingKey,
}

/// Thread-safe store of decoding keys, each pinned to one algorithm.
#[derive(Clone, Default)]
pub struct InMemoryKeyStore {
    inner: Arc<RwLock<HashMap<String, KeyEntry>>>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_key(&self, kid: impl Into<String>, algorithm: Algorithm, key: DecodingKey) {
        let mut guard = self.inner.write().unwrap_or_else(|p| p.into_inner());
        guard.insert(kid.into(), KeyEntry { algorithm, key });
    }

    pub fn insert_rsa_pem(&self, kid: impl Into<String>, pem: &[u8]) -> AuthResult<()> {
        let kid = kid.into();
        let key = DecodingKey::from_rsa_pem(pem)
            .map_err(|err| AuthError::KeyParse(kid.clone(), err.to_string()))?;
        self.insert_key(kid, Algorithm::RS256, key);
        Ok(())
    }

    pub fn insert_hmac_secret(&self, kid: impl Into<String>, secret: &[u8]) {
        self.insert_key(kid, Algorithm::HS256, DecodingKey::from_secret(secret));
    }

    fn get(&self, kid: &str) -> Option<KeyEntry> {
        let guard = self.inner.read().unwrap_or_else(|p| p.into_inner());
        guard.get(kid).cloned()
    }

    pub fn contains(&self, kid: &str) -> bool {
        let guard = self.inner.read().unwrap_or_else(|p| p.into_inner());
        guard.contains_key(kid)
    }

    /// Swap in a fresh RS256 key set while keeping shared-secret keys.
    pub fn replace_rsa_keys<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (String, Algorithm, DecodingKey)>,
    {
        let mut guard = self.inner.write().unwrap_or_else(|p| p.into_inner());
        guard.retain(|_, entry| entry.algorithm == Algorithm::HS256);
        for (kid, algorithm, key) in entries {
            guard.insert(kid, KeyEntry { algorithm, key });
        }
    }
}

/// Checks buyer and admin session tokens issued by the identity provider.
///
/// Keys come from a shared HS256 secret, static RS256 PEMs, a JWKS endpoint,
/// or any mix of them. Nothing here mints tokens.
#[derive(Clone)]
pub struct JwtVerifier {
    config: JwtConfig,
    store: InMemoryKeyStore,
    jwks: Option<JwksFetcher>,
}

impl JwtVerifier {
    pub fn new(config: JwtConfig) -> Self {
        Self::with_store(config, InMemoryKeyStore::new())
    }

    pub fn with_store(config: JwtConfig, store: InMemoryKeyStore) -> Self {
        Self {
            config,
            store,
            jwks: None,
        }
    }

    pub fn builder(config: JwtConfig) -> JwtVerifierBuilder {
        JwtVerifierBuilder::new(config)
    }

    pub fn store(&self) -> &InMemoryKeyStore {
        &self.store
    }

    pub fn jwks_fetcher(&self) -> Option<&JwksFetcher> {
        self.jwks.as_ref()
    }

    /// Resolves the signing key by `kid` (falling back to the shared secret for
    /// tokens without one), then checks signature, issuer, audience and expiry.
    pub fn verify(&self, token: &str) -> AuthResult<Claims> {
        let header =
            decode_header(token).map_err(|err| AuthError::InvalidHeader(err.to_string()))?;
        let kid = match header.kid {
            Some(kid) => kid,
            None if self.store.contains(DEFAULT_KEY_ID) => DEFAULT_KEY_ID.to_string(),
            None => return Err(AuthError::MissingKeyId),
        };
        let entry = self
            .store
            .get(&kid)
            .ok_or_else(|| AuthError::UnknownKeyId(kid.clone()))?;

        // The key decides the algorithm, never the token header.
        if header.alg != entry.algorithm {
            return Err(AuthError::AlgorithmMismatch {
                kid,
                found: format!("{:?}", header.alg),
            });
        }

        let mut validation = Validation::new(entry.algorithm);
        validation.set_issuer(&[self.config.issuer.clone()]);
        validation.set_audience(&[self.config.audience.clone()]);
        validation.leeway = self.config.leeway_seconds.into();

        let token_data = decode::<Value>(token, &entry.key, &validation)?;
        let claims = Claims::try_from(token_data.claims)?;
        debug!(kid, user_id = %claims.subject, admin = claims.has_role(ROLE_ADMIN), "session token verified");
        Ok(claims)
    }

    /// Re-reads the JWKS endpoint; returns how many RS256 keys were loaded.
    pub async fn refresh_jwks(&self) -> AuthResult<usize> {
        let fetcher = match &self.jwks {
            Some(fetcher) => fetcher,
            None => return Ok(0),
        };

        let keys = fetcher.fetch().await?;
        let count = keys.len();
        if count > 0 {
            self.store.replace_rsa_keys(keys);
        }
        Ok(count)
    }
}

/// Assembles the verifier from whichever key sources the deployment configures.
pub struct JwtVerifierBuilder {
    config: JwtConfig,
    store: InMemoryKeyStore,
    jwks: Option<JwksFetcher>,
}

impl JwtVerifierBuilder {
    fn new(config: JwtConfig) -> Self {
        Self {
            config,
            store: InMemoryKeyStore::new(),
            jwks: None,
        }
    }

    pub fn with_hmac_secret(self, secret: &[u8]) -> Self {
        self.store.insert_hmac_secret(DEFAULT_KEY_ID, secret);
        self
    }

    pub fn with_rsa_pem(self, kid: impl Into<String>, pem: &[u8]) -> AuthResult<Self> {
        self.store.insert_rsa_pem(kid, pem)?;
        Ok(self)
    }

    pub fn with_jwks_url(mut self, url: impl Into<String>) -> Self {
        self.jwks = Some(JwksFetcher::new(url));
        self
    }

    /// Fetches the JWKS once when a URL was given, so startup fails fast on a
    /// bad identity provider address.
    pub async fn build(self) -> AuthResult<JwtVerifier> {
        let verifier = JwtVerifier {
            config: self.config,
            store: self.store,
            jwks: self.jwks,
        };

        if verifier.jwks.is_some() {
            verifier.refresh_jwks().await?;
        }

        Ok(verifier)
    }
}
