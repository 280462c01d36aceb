//! Data models for the URL shortener application
//!
//! Records returned by the stores, filters accepted by them, and the
//! request/response bodies of the HTTP API.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// External identity providers a user can sign in with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    GitHub,
    Google,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::GitHub, Provider::Google];

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::GitHub => "github",
            Provider::Google => "google",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "github" => Ok(Provider::GitHub),
            "google" => Ok(Provider::Google),
            other => Err(Error::not_found(format!("Unknown provider {other:?}."))),
        }
    }
}

/// A local account.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    pub id: u64,

    pub name: String,

    /// Used as the linking key when a new provider signs in.
    pub email: Option<String>,

    /// Random key for `Authorization: Bearer` access. Never serialized.
    #[serde(skip)]
    pub api_key: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Identities owned by this user, ordered by provider.
    pub identities: Vec<Identity>,
}

/// Binding between a local user and one external provider account.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Identity {
    pub user_id: u64,
    pub provider: Provider,

    /// Provider-scoped subject id.
    pub subject: String,

    #[serde(skip_serializing)]
    pub access_token: String,
    #[serde(skip_serializing)]
    pub refresh_token: String,
    pub expiry: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Claimed identity returned by a provider after a successful OAuth exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct Assertion {
    pub provider: Provider,
    pub subject: String,
    pub email: Option<String>,
    /// Whether the provider vouches for `email`.
    pub email_verified: bool,
    pub name: Option<String>,
    pub access_token: String,
    pub refresh_token: String,
    pub expiry: Option<DateTime<Utc>>,
}

impl Assertion {
    /// An assertion carrying only the provider and subject.
    pub fn new(provider: Provider, subject: impl Into<String>) -> Self {
        Self {
            provider,
            subject: subject.into(),
            email: None,
            email_verified: false,
            name: None,
            access_token: String::new(),
            refresh_token: String::new(),
            expiry: None,
        }
    }
}

/// A shortened URL.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ShortLink {
    /// Key needed to retrieve the original URL.
    pub key: String,

    /// The original URL.
    pub url: String,

    pub owner_id: u64,

    /// Owner record, attached on lookup.
    #[serde(skip)]
    pub owner: Option<User>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Filter for [`crate::links::LinkStore::find`].
#[derive(Deserialize, Debug, Clone, Default)]
pub struct LinkFilter {
    pub key: Option<String>,
    pub url: Option<String>,
    pub owner_id: Option<u64>,

    #[serde(default)]
    pub offset: usize,
    /// Zero means no limit.
    #[serde(default)]
    pub limit: usize,
}

/// Filter for [`crate::users::UserStore::find_users`].
#[derive(Deserialize, Debug, Clone, Default)]
pub struct UserFilter {
    pub id: Option<u64>,
    pub email: Option<String>,
    pub api_key: Option<String>,

    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub limit: usize,
}

/// Fields accepted when creating a user directly.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct NewUser {
    pub name: String,
    pub email: Option<String>,
}

/// Fields that can be changed with `PATCH /me`.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct UserUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
}

/// Request payload for creating a short URL, as JSON or form data.
///
/// # Example
/// ```json
/// { "url": "https://example.com/very/long/url" }
/// ```
#[derive(Deserialize, Debug)]
pub struct CreateRequest {
    pub url: String,
}

/// Response returned after creating a short URL.
#[derive(Serialize, Deserialize, Debug)]
pub struct CreateResponse {
    pub key: String,
    pub shortened_url: String,
}

/// Query parameters for listing short URLs.
#[derive(Deserialize, Debug, Default)]
pub struct ListParams {
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

/// Response of `GET /short`.
#[derive(Serialize, Debug)]
pub struct ListResponse {
    pub shorts: Vec<ShortLink>,
    /// Total number of matches, independent of offset and limit.
    pub n: usize,
}

/// Query parameters of the OAuth callback.
#[derive(Deserialize, Debug, Default)]
pub struct CallbackParams {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub code: String,
}
