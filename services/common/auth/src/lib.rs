pub mod claims;
pub mod config;
pub mod error;
pub mod extractors;
pub mod guards;
pub mod jwks;
pub mod roles;
pub mod verifier;

pub use claims::Claims;
pub use config::JwtConfig;
pub use error::{AuthError, AuthResult};
pub use extractors::{AuthContext, MaybeAuth};
pub use guards::{ensure_role, GuardError};
pub use jwks::JwksFetcher;
pub use roles::ROLE_ADMIN;
pub use verifier::{InMemoryKeyStore, JwtVerifier, JwtVerifierBuilder, DEFAULT_KEY_ID};
