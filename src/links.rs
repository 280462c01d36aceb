//! Short link storage
//!
//! Keys come from a [`KeyGenerator`]; a collision triggers a fresh key, up
//! to [`MAX_KEY_ATTEMPTS`] tries, after which creation fails with CONFLICT.

use std::sync::Arc;

use chrono::Utc;
use redb::{Database, ReadableDatabase, ReadableMultimapTable, ReadableTable};
use reqwest::Url;

use crate::database::{
    load_identities, load_row, load_user_row, next_sequence, LinkRow, LINK_SEQ_COUNTER,
    TABLE_IDENTITIES, TABLE_LINKS, TABLE_LINK_SEQ, TABLE_OWNER_LINKS, TABLE_USERS,
    TABLE_USER_IDENTITIES,
};
use crate::error::{Error, Result};
use crate::keygen::KeyGenerator;
use crate::model::{LinkFilter, ShortLink};

/// Attempts at finding a free key before giving up.
pub const MAX_KEY_ATTEMPTS: usize = 5;

#[derive(Clone)]
pub struct LinkStore {
    db: Arc<Database>,
    keys: KeyGenerator,
}

impl LinkStore {
    pub fn new(db: Arc<Database>, keys: KeyGenerator) -> Self {
        Self { db, keys }
    }

    /// Shortens `url` on behalf of `owner_id`.
    ///
    /// - INVALID if the URL is empty, unparsable, or not http(s).
    /// - UNAUTHORIZED if the owner is anonymous or unknown.
    /// - CONFLICT if no free key was found.
    pub fn create(&self, url: &str, owner_id: u64) -> Result<ShortLink> {
        let url = validate_url(url)?;
        if owner_id == 0 {
            return Err(must_login());
        }

        let now = Utc::now();
        let txn = self.db.begin_write()?;
        let row = {
            let users = txn.open_table(TABLE_USERS)?;
            let owner = load_user_row(&users, owner_id)?.ok_or_else(must_login)?;

            let mut links = txn.open_table(TABLE_LINKS)?;
            let mut key = None;
            for attempt in 1..=MAX_KEY_ATTEMPTS {
                let candidate = self.keys.generate();
                if links.get(candidate.as_str())?.is_none() {
                    key = Some(candidate);
                    break;
                }
                tracing::warn!(attempt, key = %candidate, "short key collision");
            }
            let key = key.ok_or_else(|| {
                Error::conflict("Could not allocate a unique short key. Please try again.")
            })?;

            let row = LinkRow {
                key,
                url,
                owner_id: owner.id,
                seq: next_sequence(&txn, LINK_SEQ_COUNTER)?,
                created_at: now,
                updated_at: now,
            };

            let mut link_seq = txn.open_table(TABLE_LINK_SEQ)?;
            let mut owner_links = txn.open_multimap_table(TABLE_OWNER_LINKS)?;
            links.insert(row.key.as_str(), serde_json::to_string(&row)?.as_str())?;
            link_seq.insert(row.seq, row.key.as_str())?;
            owner_links.insert(row.owner_id, row.key.as_str())?;
            row
        };
        txn.commit()?;

        tracing::info!(key = %row.key, owner_id = row.owner_id, "created short");
        self.find_by_key(&row.key)
    }

    /// Looks up a link and attaches its owner. NOTFOUND if absent.
    pub fn find_by_key(&self, key: &str) -> Result<ShortLink> {
        let txn = self.db.begin_read()?;
        let links = txn.open_table(TABLE_LINKS)?;
        let users = txn.open_table(TABLE_USERS)?;
        let index = txn.open_table(TABLE_USER_IDENTITIES)?;
        let identities = txn.open_table(TABLE_IDENTITIES)?;

        let row = load_row::<LinkRow>(&links, key)?.ok_or_else(short_not_found)?;
        let owner = match load_user_row(&users, row.owner_id)? {
            Some(user) => {
                let id = user.id;
                Some(user.into_user(load_identities(&index, &identities, id)?))
            }
            None => None,
        };
        Ok(row.into_link(owner))
    }

    /// Lists links matching `filter` in insertion order, with the total
    /// number of matches before offset and limit are applied.
    pub fn find(&self, filter: &LinkFilter) -> Result<(Vec<ShortLink>, usize)> {
        let txn = self.db.begin_read()?;
        let links = txn.open_table(TABLE_LINKS)?;

        let mut rows: Vec<LinkRow> = Vec::new();
        if let Some(key) = &filter.key {
            rows.extend(load_row::<LinkRow>(&links, key)?);
        } else if let Some(owner_id) = filter.owner_id {
            let owner_links = txn.open_multimap_table(TABLE_OWNER_LINKS)?;
            for key in owner_links.get(owner_id)? {
                let key = key?;
                rows.extend(load_row::<LinkRow>(&links, key.value())?);
            }
            rows.sort_by_key(|row| row.seq);
        } else {
            let link_seq = txn.open_table(TABLE_LINK_SEQ)?;
            for entry in link_seq.iter()? {
                let (_, key) = entry?;
                rows.extend(load_row::<LinkRow>(&links, key.value())?);
            }
        }

        let url = filter
            .url
            .as_deref()
            .map(|url| Url::parse(url.trim()).map_or_else(|_| url.to_string(), String::from));
        rows.retain(|row| {
            url.as_ref().map_or(true, |url| &row.url == url)
                && filter.owner_id.map_or(true, |id| row.owner_id == id)
        });

        let total = rows.len();
        let limit = if filter.limit == 0 { usize::MAX } else { filter.limit };
        let page = rows
            .into_iter()
            .skip(filter.offset)
            .take(limit)
            .map(|row| row.into_link(None))
            .collect();
        Ok((page, total))
    }

    /// Permanently removes a link.
    ///
    /// NOTFOUND if absent, UNAUTHORIZED if `caller_id` is not the owner.
    pub fn delete(&self, key: &str, caller_id: u64) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut links = txn.open_table(TABLE_LINKS)?;
            let mut link_seq = txn.open_table(TABLE_LINK_SEQ)?;
            let mut owner_links = txn.open_multimap_table(TABLE_OWNER_LINKS)?;

            let row = load_row::<LinkRow>(&links, key)?.ok_or_else(short_not_found)?;
            if row.owner_id != caller_id {
                return Err(Error::unauthorized(
                    "You are not allowed to delete this short.",
                ));
            }

            links.remove(key)?;
            link_seq.remove(row.seq)?;
            owner_links.remove(row.owner_id, key)?;
        }
        txn.commit()?;

        tracing::info!(key, owner_id = caller_id, "deleted short");
        Ok(())
    }
}

fn must_login() -> Error {
    Error::unauthorized("You must be logged in to create a short.")
}

fn short_not_found() -> Error {
    Error::not_found("Short not found.")
}

/// Accepts absolute http and https URLs. Returns the trimmed input.
/// Returns the serialized form of the parsed URL, so the stored target is
/// always a valid `Location` value.
fn validate_url(raw: &str) -> Result<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::invalid("Missing URL."));
    }
    let parsed = Url::parse(raw).map_err(|_| Error::invalid("Invalid URL passed."))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed.into()),
        _ => Err(Error::invalid(
            "Invalid URL scheme. Only http and https are supported.",
        )),
    }
}
