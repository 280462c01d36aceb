//! Process configuration
//!
//! Values are read once from the environment (a `.env` file is honoured via
//! `dotenvy`) into an immutable [`Config`] that is shared by every handler.

use std::env;
use std::time::Duration;

/// Default symbol set for short keys: `a-z`, `A-Z`, `0-9`.
pub const DEFAULT_ALPHABET: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

pub const DEFAULT_KEY_LENGTH: usize = 6;

pub const DEFAULT_PORT: u16 = 8080;

pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on one store operation.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest alphabet accepted for short keys.
pub const MAX_ALPHABET_LEN: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Client credentials for one OAuth provider.
#[derive(Clone)]
pub struct OAuthCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for OAuthCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthCredentials")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,

    /// Public origin of the service, without trailing slash.
    pub base_url: String,

    /// MAC key for session tokens.
    pub hash_key: Vec<u8>,
    /// AES-256 key for session tokens.
    pub block_key: [u8; 32],

    pub github: Option<OAuthCredentials>,
    pub google: Option<OAuthCredentials>,

    pub alphabet: String,
    pub key_length: usize,

    pub provider_timeout: Duration,
    pub store_timeout: Duration,

    /// Only verified emails link accounts when set.
    pub require_verified_email: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("database_url", &self.database_url)
            .field("base_url", &self.base_url)
            .field("github", &self.github)
            .field("google", &self.google)
            .field("alphabet", &self.alphabet)
            .field("key_length", &self.key_length)
            .field("provider_timeout", &self.provider_timeout)
            .field("store_timeout", &self.store_timeout)
            .field("require_verified_email", &self.require_verified_email)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Builds a configuration with defaults for everything but the origin and keys.
    pub fn new(base_url: impl Into<String>, hash_key: Vec<u8>, block_key: [u8; 32]) -> Self {
        Self {
            port: DEFAULT_PORT,
            database_url: "data.db".to_string(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            hash_key,
            block_key,
            github: None,
            google: None,
            alphabet: DEFAULT_ALPHABET.to_string(),
            key_length: DEFAULT_KEY_LENGTH,
            provider_timeout: DEFAULT_PROVIDER_TIMEOUT,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            require_verified_email: true,
        }
    }

    /// Reads the configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = match env::var("PORT") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                name: "PORT",
                reason: format!("not a port number: {raw}"),
            })?,
            Err(_) => DEFAULT_PORT,
        };

        let base_url = env::var("BASE_URL")
            .or_else(|_| env::var("URL"))
            .unwrap_or_else(|_| format!("http://localhost:{port}"));

        let hash_key = decode_key("HASH_KEY")?;
        if hash_key.len() < 32 {
            return Err(ConfigError::Invalid {
                name: "HASH_KEY",
                reason: format!("need at least 32 bytes, got {}", hash_key.len()),
            });
        }

        let block_key: [u8; 32] =
            decode_key("BLOCK_KEY")?
                .try_into()
                .map_err(|bytes: Vec<u8>| ConfigError::Invalid {
                    name: "BLOCK_KEY",
                    reason: format!("need exactly 32 bytes, got {}", bytes.len()),
                })?;

        let mut config = Config::new(base_url, hash_key, block_key);
        config.port = port;

        if let Ok(path) = env::var("DATABASE_URL") {
            config.database_url = path;
        }

        config.github = credentials("GITHUB_CLIENT_ID", "GITHUB_CLIENT_SECRET");
        config.google = credentials("GOOGLE_CLIENT_ID", "GOOGLE_CLIENT_SECRET");

        if let Ok(alphabet) = env::var("ALPHABET") {
            config.alphabet = alphabet;
        }
        if let Ok(raw) = env::var("KEY_LENGTH") {
            config.key_length = raw.parse().map_err(|_| ConfigError::Invalid {
                name: "KEY_LENGTH",
                reason: format!("not a number: {raw}"),
            })?;
        }
        if let Ok(raw) = env::var("PROVIDER_TIMEOUT_SECS") {
            let secs: u64 = raw.parse().map_err(|_| ConfigError::Invalid {
                name: "PROVIDER_TIMEOUT_SECS",
                reason: format!("not a number: {raw}"),
            })?;
            config.provider_timeout = Duration::from_secs(secs);
        }
        if let Ok(raw) = env::var("STORE_TIMEOUT_MS") {
            let millis: u64 = raw.parse().map_err(|_| ConfigError::Invalid {
                name: "STORE_TIMEOUT_MS",
                reason: format!("not a number: {raw}"),
            })?;
            config.store_timeout = Duration::from_millis(millis);
        }
        if let Ok(raw) = env::var("REQUIRE_VERIFIED_EMAIL") {
            config.require_verified_email = parse_bool(&raw).ok_or(ConfigError::Invalid {
                name: "REQUIRE_VERIFIED_EMAIL",
                reason: format!("not a boolean: {raw}"),
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks the short key settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_alphabet(&self.alphabet).map_err(|reason| ConfigError::Invalid {
            name: "ALPHABET",
            reason,
        })?;
        if self.key_length == 0 {
            return Err(ConfigError::Invalid {
                name: "KEY_LENGTH",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Session cookies get the `Secure` attribute when served over TLS.
    pub fn secure_cookies(&self) -> bool {
        self.base_url.starts_with("https://")
    }
}

/// Alphabet rules: non-empty, at most [`MAX_ALPHABET_LEN`] symbols, no
/// duplicates, and only symbols that need no escaping in a path segment.
pub fn validate_alphabet(alphabet: &str) -> Result<(), String> {
    let symbols: Vec<char> = alphabet.chars().collect();
    if symbols.is_empty() {
        return Err("must not be empty".to_string());
    }
    if symbols.len() > MAX_ALPHABET_LEN {
        return Err(format!(
            "at most {MAX_ALPHABET_LEN} symbols allowed, got {}",
            symbols.len()
        ));
    }
    for (i, c) in symbols.iter().enumerate() {
        if symbols[..i].contains(c) {
            return Err(format!("duplicate symbol {c:?}"));
        }
        if !is_path_safe(*c) {
            return Err(format!("symbol {c:?} cannot appear in a URL path"));
        }
    }
    Ok(())
}

/// ASCII symbols are limited to the unreserved set of RFC 3986.
fn is_path_safe(c: char) -> bool {
    if c.is_ascii() {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~')
    } else {
        !c.is_whitespace() && !c.is_control()
    }
}

fn decode_key(name: &'static str) -> Result<Vec<u8>, ConfigError> {
    let raw = env::var(name).map_err(|_| ConfigError::Missing(name))?;
    hex::decode(raw.trim()).map_err(|e| ConfigError::Invalid {
        name,
        reason: e.to_string(),
    })
}

fn credentials(id_var: &str, secret_var: &str) -> Option<OAuthCredentials> {
    let client_id = env::var(id_var).ok().filter(|v| !v.is_empty())?;
    let client_secret = env::var(secret_var).ok().filter(|v| !v.is_empty())?;
    Some(OAuthCredentials {
        client_id,
        client_secret,
    })
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
