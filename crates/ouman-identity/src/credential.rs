//! Credential hashing for the `userPassword` attribute using Argon2id
//!
//! Stored values carry an RFC 3112 style scheme prefix so the directory
//! (and other tools reading it) can tell hashes from plaintext:
//! `{ARGON2}$argon2id$v=19$m=65536,t=3,p=4$<salt>$<hash>`.
//!
//! Default cost follows the OWASP balanced profile (64 MiB, 3 passes,
//! 4 lanes). Values that already carry a recognized scheme are passed
//! through untouched, so imports may mix pre-hashed and plaintext values.

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use rand::rngs::OsRng;
use serde::Deserialize;
use tracing::{debug, warn};

use ouman_core::{OumanError, Result};

pub const ARGON2_SCHEME: &str = "{ARGON2}";

/// Scheme prefixes accepted as already-hashed
const KNOWN_SCHEMES: [&str; 16] = [
    "{ARGON2}",
    "{SSHA}",
    "{SHA}",
    "{SSHA256}",
    "{SSHA384}",
    "{SSHA512}",
    "{SHA256}",
    "{SHA384}",
    "{SHA512}",
    "{MD5}",
    "{SMD5}",
    "{CRYPT}",
    "{BCRYPT}",
    "{PBKDF2}",
    "{PBKDF2-SHA256}",
    "{PBKDF2-SHA512}",
];

const DEFAULT_MEMORY_COST_KIB: u32 = 64 * 1024;
const DEFAULT_TIME_COST: u32 = 3;
const DEFAULT_PARALLELISM: u32 = 4;
const OUTPUT_LEN: usize = 32;

/// Whether `value` already carries a recognized hash scheme
pub fn is_hashed(value: &str) -> bool {
    let upper = value.trim_start().to_uppercase();
    KNOWN_SCHEMES.iter().any(|scheme| upper.starts_with(scheme)) || upper.starts_with("$ARGON2")
}

/// Argon2 cost parameters, loadable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct CredentialSettings {
    #[serde(default = "default_memory_kib")]
    pub memory_kib: u32,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
}

fn default_memory_kib() -> u32 {
    DEFAULT_MEMORY_COST_KIB
}

fn default_iterations() -> u32 {
    DEFAULT_TIME_COST
}

fn default_parallelism() -> u32 {
    DEFAULT_PARALLELISM
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            memory_kib: DEFAULT_MEMORY_COST_KIB,
            iterations: DEFAULT_TIME_COST,
            parallelism: DEFAULT_PARALLELISM,
        }
    }
}

/// Hashes and verifies `userPassword` values
#[derive(Debug, Clone)]
pub struct CredentialHasher {
    params: Params,
}

impl CredentialHasher {
    pub fn new(settings: CredentialSettings) -> Result<Self> {
        let params = Params::new(
            settings.memory_kib,
            settings.iterations,
            settings.parallelism,
            Some(OUTPUT_LEN),
        )
        .map_err(|e| OumanError::Config {
            message: format!("invalid argon2 parameters: {}", e),
        })?;
        Ok(Self { params })
    }

    /// Minimum-cost parameters; only for tests and local tooling
    pub fn low_cost() -> Self {
        Self {
            params: Params::new(Params::MIN_M_COST.max(8), 1, 1, Some(OUTPUT_LEN))
                .unwrap_or_default(),
        }
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    /// Hash a plaintext password, returning the scheme-prefixed value
    pub fn hash(&self, password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| OumanError::credential(format!("hashing failed: {}", e)))?;
        Ok(format!("{}{}", ARGON2_SCHEME, hash))
    }

    /// Store pre-hashed values as-is, hash everything else
    pub fn prepare(&self, value: &str) -> Result<String> {
        if is_hashed(value) {
            debug!("Credential already carries a hash scheme, storing as-is");
            return Ok(value.to_string());
        }
        self.hash(value)
    }

    /// [`prepare`](Self::prepare) on the blocking pool, keeping the runtime responsive
    pub async fn prepare_async(&self, value: String) -> Result<String> {
        let hasher = self.clone();
        tokio::task::spawn_blocking(move || hasher.prepare(&value))
            .await
            .map_err(|e| OumanError::credential(format!("hashing task failed: {}", e)))?
    }

    /// Verify a plaintext password against a stored `{ARGON2}` or PHC value
    pub fn verify(&self, password: &str, stored: &str) -> bool {
        let phc = stored.strip_prefix(ARGON2_SCHEME).unwrap_or(stored);
        let parsed = match PasswordHash::new(phc) {
            Ok(h) => h,
            Err(e) => {
                warn!("Failed to parse stored credential: {}", e);
                return false;
            }
        };

        // The PHC string carries its own parameters
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    }

    /// Whether `value` is the credential held in `stored`: the same
    /// pre-hashed string, or a plaintext that verifies against it
    pub fn matches(&self, value: &str, stored: &str) -> bool {
        if is_hashed(value) {
            return value == stored;
        }
        self.verify(value, stored)
    }

    /// Like [`matches`](Self::matches), and a plaintext must also not need
    /// a rehash under this hasher's parameters
    pub fn is_current(&self, value: &str, stored: &str) -> bool {
        self.matches(value, stored) && (is_hashed(value) || !self.needs_rehash(stored))
    }

    pub async fn matches_async(&self, value: String, stored: String) -> Result<bool> {
        let hasher = self.clone();
        tokio::task::spawn_blocking(move || hasher.matches(&value, &stored))
            .await
            .map_err(|e| OumanError::credential(format!("verification task failed: {}", e)))
    }

    pub async fn is_current_async(&self, value: String, stored: String) -> Result<bool> {
        let hasher = self.clone();
        tokio::task::spawn_blocking(move || hasher.is_current(&value, &stored))
            .await
            .map_err(|e| OumanError::credential(format!("verification task failed: {}", e)))
    }

    /// Whether a stored value uses weaker parameters than this hasher
    pub fn needs_rehash(&self, stored: &str) -> bool {
        let phc = match stored.strip_prefix(ARGON2_SCHEME) {
            Some(phc) => phc,
            None => return true,
        };
        let parsed = match PasswordHash::new(phc) {
            Ok(h) => h,
            Err(_) => return true,
        };

        if parsed.algorithm.as_str() != "argon2id" {
            return true;
        }

        let below = |key: &str, current: u32| {
            parsed
                .params
                .get_str(key)
                .and_then(|v| v.parse::<u32>().ok())
                .map(|v| v < current)
                .unwrap_or(false)
        };

        below("m", self.params.m_cost()) || below("t", self.params.t_cost())
    }
}

impl Default for CredentialHasher {
    fn default() -> Self {
        Self {
            params: Params::new(
                DEFAULT_MEMORY_COST_KIB,
                DEFAULT_TIME_COST,
                DEFAULT_PARALLELISM,
                Some(OUTPUT_LEN),
            )
            .unwrap_or_default(),
        }
    }
}
