//! Database initialization and table definitions
//!
//! This module handles the setup of the embedded redb database. Records are
//! stored as JSON strings; secondary tables act as indexes and enforce the
//! uniqueness rules the services rely on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redb::{
    Database, MultimapTableDefinition, ReadableTable, TableDefinition, WriteTransaction,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};
use crate::model::{Identity, Provider, ShortLink, User};

/// Users by numeric id.
///
/// Value: JSON-serialized [`UserRow`]
pub const TABLE_USERS: TableDefinition<u64, &str> = TableDefinition::new("users_v1");

/// Email to user ids. Emails are not unique; ids come back ascending, so the
/// first value is the oldest account.
pub const TABLE_USER_EMAILS: MultimapTableDefinition<&str, u64> =
    MultimapTableDefinition::new("user_emails_v1");

/// API key to user id.
pub const TABLE_USER_API_KEYS: TableDefinition<&str, u64> =
    TableDefinition::new("user_api_keys_v1");

/// Identities keyed by `"{provider}:{subject}"`, which makes the
/// provider/subject pair globally unique.
///
/// Value: JSON-serialized [`IdentityRow`]
pub const TABLE_IDENTITIES: TableDefinition<&str, &str> = TableDefinition::new("identities_v1");

/// `"{user_id:020}:{provider}"` to identity key. At most one identity per
/// provider per user.
pub const TABLE_USER_IDENTITIES: TableDefinition<&str, &str> =
    TableDefinition::new("user_identities_v1");

/// Short links by key.
///
/// Value: JSON-serialized [`LinkRow`]
pub const TABLE_LINKS: TableDefinition<&str, &str> = TableDefinition::new("links_v1");

/// Insertion sequence to short key, for ordered listing.
pub const TABLE_LINK_SEQ: TableDefinition<u64, &str> = TableDefinition::new("link_seq_v1");

/// Owner id to the keys of their links.
pub const TABLE_OWNER_LINKS: MultimapTableDefinition<u64, &str> =
    MultimapTableDefinition::new("owner_links_v1");

/// Monotonic counters for ids and sequences.
pub const TABLE_COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters_v1");

pub(crate) const USER_ID_COUNTER: &str = "user_id";
pub(crate) const LINK_SEQ_COUNTER: &str = "link_seq";

/// Stored form of a [`User`], including the API key.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub(crate) struct UserRow {
    pub id: u64,
    pub name: String,
    pub email: Option<String>,
    /// Set when a provider vouched for `email`.
    #[serde(default)]
    pub email_verified: bool,
    pub api_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserRow {
    pub fn into_user(self, identities: Vec<Identity>) -> User {
        User {
            id: self.id,
            name: self.name,
            email: self.email,
            api_key: self.api_key,
            created_at: self.created_at,
            updated_at: self.updated_at,
            identities,
        }
    }
}

/// Stored form of an [`Identity`], including provider tokens.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub(crate) struct IdentityRow {
    pub user_id: u64,
    pub provider: Provider,
    pub subject: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expiry: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<IdentityRow> for Identity {
    fn from(row: IdentityRow) -> Self {
        Identity {
            user_id: row.user_id,
            provider: row.provider,
            subject: row.subject,
            access_token: row.access_token,
            refresh_token: row.refresh_token,
            expiry: row.expiry,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Stored form of a [`ShortLink`], including its insertion sequence.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub(crate) struct LinkRow {
    pub key: String,
    pub url: String,
    pub owner_id: u64,
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LinkRow {
    pub fn into_link(self, owner: Option<User>) -> ShortLink {
        ShortLink {
            key: self.key,
            url: self.url,
            owner_id: self.owner_id,
            owner,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

pub(crate) fn identity_key(provider: Provider, subject: &str) -> String {
    format!("{provider}:{subject}")
}

pub(crate) fn user_identity_key(user_id: u64, provider: Provider) -> String {
    format!("{user_id:020}:{provider}")
}

/// Reads and decodes a JSON value from a string-keyed table.
pub(crate) fn load_row<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static str>,
    key: &str,
) -> Result<Option<T>> {
    match table.get(key)? {
        Some(guard) => Ok(Some(serde_json::from_str(guard.value())?)),
        None => Ok(None),
    }
}

pub(crate) fn load_user_row(
    users: &impl ReadableTable<u64, &'static str>,
    id: u64,
) -> Result<Option<UserRow>> {
    match users.get(id)? {
        Some(guard) => Ok(Some(serde_json::from_str(guard.value())?)),
        None => Ok(None),
    }
}

/// Loads all identities of a user, ordered by provider.
pub(crate) fn load_identities(
    index: &impl ReadableTable<&'static str, &'static str>,
    identities: &impl ReadableTable<&'static str, &'static str>,
    user_id: u64,
) -> Result<Vec<Identity>> {
    // ';' sorts right after ':', bounding every "{user_id:020}:..." key.
    let start = format!("{user_id:020}:");
    let end = format!("{user_id:020};");

    let mut out = Vec::new();
    for entry in index.range(start.as_str()..end.as_str())? {
        let (_, identity_key) = entry?;
        if let Some(row) = load_row::<IdentityRow>(identities, identity_key.value())? {
            out.push(row.into());
        }
    }
    Ok(out)
}

/// Increments and returns the named counter. Starts at 1.
pub(crate) fn next_sequence(txn: &WriteTransaction, name: &str) -> Result<u64> {
    let mut counters = txn.open_table(TABLE_COUNTERS)?;
    let next = counters.get(name)?.map(|guard| guard.value()).unwrap_or(0) + 1;
    counters.insert(name, next)?;
    Ok(next)
}

/// Initializes the embedded database and creates required tables
///
/// # Arguments
///
/// * `db_path` - File path where the database should be stored (e.g., "data.db")
///
/// # Example
///
/// ```no_run
/// # use lil::database::init_db;
/// let db = init_db("data.db").expect("Failed to initialize database");
/// ```
pub fn init_db(db_path: &str) -> Result<Database, redb::Error> {
    let db = Database::create(db_path)?;

    let write_txn = db.begin_write()?;
    {
        write_txn.open_table(TABLE_USERS)?;
        write_txn.open_multimap_table(TABLE_USER_EMAILS)?;
        write_txn.open_table(TABLE_USER_API_KEYS)?;
        write_txn.open_table(TABLE_IDENTITIES)?;
        write_txn.open_table(TABLE_USER_IDENTITIES)?;
        write_txn.open_table(TABLE_LINKS)?;
        write_txn.open_table(TABLE_LINK_SEQ)?;
        write_txn.open_multimap_table(TABLE_OWNER_LINKS)?;
        write_txn.open_table(TABLE_COUNTERS)?;
    }
    write_txn.commit()?;

    Ok(db)
}

/// Runs a store operation on the blocking thread pool.
///
/// redb transactions block, and `begin_write` waits for any other writer.
/// The caller gets INTERNAL if the operation has not finished within
/// `limit`. An operation still queued at that point never runs; one already
/// running either commits as a whole or rolls back when its transaction is
/// dropped.
pub async fn run_blocking<T, F>(limit: Duration, op: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let expired = Arc::new(AtomicBool::new(false));
    let task = tokio::task::spawn_blocking({
        let expired = expired.clone();
        move || {
            if expired.load(Ordering::Acquire) {
                return Err(Error::new(ErrorKind::Internal, "store operation expired"));
            }
            op()
        }
    });

    match tokio::time::timeout(limit, task).await {
        Ok(joined) => joined.map_err(|err| Error::internal("store task failed", err))?,
        Err(_) => {
            expired.store(true, Ordering::Release);
            tracing::warn!(?limit, "store operation timed out");
            Err(Error::new(ErrorKind::Internal, "store operation timed out"))
        }
    }
}
