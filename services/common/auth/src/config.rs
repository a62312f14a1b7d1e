use crate::error::{AuthError, AuthResult};

const DEFAULT_LEEWAY_SECONDS: u32 = 30;

/// What a buyer or admin session token must assert to be accepted.
///
/// Tokens are minted by the external identity provider; this side only checks
/// them against the expected issuer and audience.
#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub issuer: String,
    pub audience: String,
    /// Clock skew tolerated on `exp`.
    pub leeway_seconds: u32,
}

impl JwtConfig {
    pub fn new(issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            leeway_seconds: DEFAULT_LEEWAY_SECONDS,
        }
    }

    pub fn with_leeway(mut self, seconds: u32) -> Self {
        self.leeway_seconds = seconds;
        self
    }

    /// Reads `JWT_ISSUER`, `JWT_AUDIENCE` and the optional `JWT_LEEWAY_SECONDS`.
    pub fn from_env() -> AuthResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> AuthResult<Self> {
        let required = |key: &'static str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| AuthError::Config(format!("{key} must be set")))
        };
        let mut config = Self::new(required("JWT_ISSUER")?, required("JWT_AUDIENCE")?);
        if let Some(raw) = lookup("JWT_LEEWAY_SECONDS") {
            let seconds = raw
                .trim()
                .parse()
                .map_err(|_| AuthError::Config(format!("JWT_LEEWAY_SECONDS '{raw}' is not a number of seconds")))?;
            config = config.with_leeway(seconds);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn issuer_and_audience_are_required() {
        let err = JwtConfig::from_lookup(lookup(&[("JWT_ISSUER", "idp")])).unwrap_err();
        assert!(matches!(err, AuthError::Config(msg) if msg.contains("JWT_AUDIENCE")));
    }

    #[test]
    fn leeway_defaults_and_overrides() {
        let config =
            JwtConfig::from_lookup(lookup(&[("JWT_ISSUER", "idp"), ("JWT_AUDIENCE", "storefront")])).unwrap();
        assert_eq!(config.leeway_seconds, 30);

        let config = JwtConfig::from_lookup(lookup(&[
            ("JWT_ISSUER", "idp"),
            ("JWT_AUDIENCE", "storefront"),
            ("JWT_LEEWAY_SECONDS", "5"),
        ]))
        .unwrap();
        assert_eq!(config.leeway_seconds, 5);

        assert!(JwtConfig::from_lookup(lookup(&[
            ("JWT_ISSUER", "idp"),
            ("JWT_AUDIENCE", "storefront"),
            ("JWT_LEEWAY_SECONDS", "soon"),
        ]))
        .is_err());
    }
}
