//! User accounts
//!
//! Users are normally created by [`crate::identity::IdentityLinker`] during
//! sign-in; [`UserStore::create_user`] exists for tooling and tests. Every
//! mutating operation takes the acting user's id explicitly.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::RngCore;
use redb::{
    Database, ReadableDatabase, ReadableMultimapTable, ReadableTable, ReadableTableMetadata,
    WriteTransaction,
};

use crate::database::{
    identity_key, load_identities, load_row, load_user_row, next_sequence, user_identity_key,
    LinkRow, UserRow, TABLE_IDENTITIES, TABLE_LINKS, TABLE_LINK_SEQ, TABLE_OWNER_LINKS,
    TABLE_USERS, TABLE_USER_API_KEYS, TABLE_USER_EMAILS, TABLE_USER_IDENTITIES, USER_ID_COUNTER,
};
use crate::error::{Error, Result};
use crate::model::{NewUser, User, UserFilter, UserUpdate};

#[derive(Clone)]
pub struct UserStore {
    db: Arc<Database>,
}

impl UserStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Retrieves a user with their identities. Returns NOTFOUND if absent.
    pub fn find_user_by_id(&self, id: u64) -> Result<User> {
        let txn = self.db.begin_read()?;
        let users = txn.open_table(TABLE_USERS)?;
        let index = txn.open_table(TABLE_USER_IDENTITIES)?;
        let identities = txn.open_table(TABLE_IDENTITIES)?;

        let row = load_user_row(&users, id)?.ok_or_else(user_not_found)?;
        let identities = load_identities(&index, &identities, id)?;
        Ok(row.into_user(identities))
    }

    /// Retrieves users matching `filter`, with the total match count which
    /// ignores offset and limit.
    pub fn find_users(&self, filter: &UserFilter) -> Result<(Vec<User>, usize)> {
        let txn = self.db.begin_read()?;
        let users = txn.open_table(TABLE_USERS)?;
        let emails = txn.open_multimap_table(TABLE_USER_EMAILS)?;
        let api_keys = txn.open_table(TABLE_USER_API_KEYS)?;
        let index = txn.open_table(TABLE_USER_IDENTITIES)?;
        let identities = txn.open_table(TABLE_IDENTITIES)?;

        // Narrow candidates through the most selective index available.
        let candidates: Vec<u64> = if let Some(id) = filter.id {
            vec![id]
        } else if let Some(api_key) = &filter.api_key {
            api_keys
                .get(api_key.as_str())?
                .map(|guard| guard.value())
                .into_iter()
                .collect()
        } else if let Some(email) = &filter.email {
            let mut ids = Vec::new();
            for id in emails.get(email.as_str())? {
                ids.push(id?.value());
            }
            ids
        } else {
            let mut ids = Vec::with_capacity(users.len()? as usize);
            for entry in users.iter()? {
                ids.push(entry?.0.value());
            }
            ids
        };

        let mut matched = Vec::new();
        for id in candidates {
            let Some(row) = load_user_row(&users, id)? else {
                continue;
            };
            if filter.email.as_ref().is_some_and(|e| row.email.as_ref() != Some(e)) {
                continue;
            }
            if filter.api_key.as_ref().is_some_and(|k| &row.api_key != k) {
                continue;
            }
            matched.push(row);
        }

        let total = matched.len();
        let limit = if filter.limit == 0 { usize::MAX } else { filter.limit };
        let mut out = Vec::new();
        for row in matched.into_iter().skip(filter.offset).take(limit) {
            let id = row.id;
            out.push(row.into_user(load_identities(&index, &identities, id)?));
        }
        Ok((out, total))
    }

    /// Looks up the owner of an API key.
    pub fn find_user_by_api_key(&self, api_key: &str) -> Result<Option<User>> {
        let (mut users, _) = self.find_users(&UserFilter {
            api_key: Some(api_key.to_string()),
            limit: 1,
            ..UserFilter::default()
        })?;
        Ok(users.pop())
    }

    /// Creates a user outside the sign-in flow.
    pub fn create_user(&self, new_user: NewUser) -> Result<User> {
        let txn = self.db.begin_write()?;
        let row = create_user(&txn, &new_user.name, new_user.email.as_deref(), false, Utc::now())?;
        txn.commit()?;
        Ok(row.into_user(Vec::new()))
    }

    /// Updates name and email. Only the user themselves may do this.
    pub fn update_user(&self, id: u64, caller_id: u64, update: UserUpdate) -> Result<User> {
        if id != caller_id {
            return Err(Error::unauthorized("You are not allowed to update this user."));
        }

        let txn = self.db.begin_write()?;
        {
            let mut users = txn.open_table(TABLE_USERS)?;
            let mut emails = txn.open_multimap_table(TABLE_USER_EMAILS)?;

            let mut row = load_user_row(&users, id)?.ok_or_else(user_not_found)?;
            if let Some(name) = update.name {
                row.name = name;
            }
            if let Some(email) = update.email {
                if let Some(old) = &row.email {
                    emails.remove(old.as_str(), id)?;
                }
                // A self-edited address is not vouched for by any provider.
                row.email = Some(email).filter(|e| !e.is_empty());
                row.email_verified = false;
                if let Some(new) = &row.email {
                    emails.insert(new.as_str(), id)?;
                }
            }
            validate_name(&row.name)?;
            row.updated_at = Utc::now();
            users.insert(id, serde_json::to_string(&row)?.as_str())?;
        }
        txn.commit()?;

        self.find_user_by_id(id)
    }

    /// Permanently deletes a user, their identities and their short links.
    pub fn delete_user(&self, id: u64, caller_id: u64) -> Result<()> {
        if id != caller_id {
            return Err(Error::unauthorized("You are not allowed to delete this user."));
        }

        let txn = self.db.begin_write()?;
        delete_user(&txn, id)?;
        txn.commit()?;

        tracing::info!(user_id = id, "deleted user");
        Ok(())
    }
}

fn user_not_found() -> Error {
    Error::not_found("User not found.")
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::invalid("User name required."));
    }
    Ok(())
}

fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Inserts a new user row and its index entries inside `txn`.
pub(crate) fn create_user(
    txn: &WriteTransaction,
    name: &str,
    email: Option<&str>,
    email_verified: bool,
    now: DateTime<Utc>,
) -> Result<UserRow> {
    validate_name(name)?;

    let email = email.filter(|e| !e.is_empty()).map(str::to_string);
    let row = UserRow {
        id: next_sequence(txn, USER_ID_COUNTER)?,
        name: name.to_string(),
        email_verified: email_verified && email.is_some(),
        email,
        api_key: generate_api_key(),
        created_at: now,
        updated_at: now,
    };

    let mut users = txn.open_table(TABLE_USERS)?;
    let mut emails = txn.open_multimap_table(TABLE_USER_EMAILS)?;
    let mut api_keys = txn.open_table(TABLE_USER_API_KEYS)?;

    users.insert(row.id, serde_json::to_string(&row)?.as_str())?;
    if let Some(email) = &row.email {
        emails.insert(email.as_str(), row.id)?;
    }
    api_keys.insert(row.api_key.as_str(), row.id)?;

    Ok(row)
}

/// Returns the oldest user registered with `email`. With `verified_only`,
/// accounts whose email was never confirmed by a provider are skipped.
pub(crate) fn first_user_by_email(
    emails: &impl ReadableMultimapTable<&'static str, u64>,
    users: &impl ReadableTable<u64, &'static str>,
    email: &str,
    verified_only: bool,
) -> Result<Option<UserRow>> {
    for id in emails.get(email)? {
        let id = id?.value();
        if let Some(row) = load_user_row(users, id)? {
            if !verified_only || row.email_verified {
                return Ok(Some(row));
            }
        }
    }
    Ok(None)
}

fn delete_user(txn: &WriteTransaction, id: u64) -> Result<()> {
    let mut users = txn.open_table(TABLE_USERS)?;
    let mut emails = txn.open_multimap_table(TABLE_USER_EMAILS)?;
    let mut api_keys = txn.open_table(TABLE_USER_API_KEYS)?;
    let mut identities = txn.open_table(TABLE_IDENTITIES)?;
    let mut index = txn.open_table(TABLE_USER_IDENTITIES)?;
    let mut links = txn.open_table(TABLE_LINKS)?;
    let mut link_seq = txn.open_table(TABLE_LINK_SEQ)?;
    let mut owner_links = txn.open_multimap_table(TABLE_OWNER_LINKS)?;

    let row = load_user_row(&users, id)?.ok_or_else(user_not_found)?;

    // Identities.
    for identity in load_identities(&index, &identities, id)? {
        identities.remove(identity_key(identity.provider, &identity.subject).as_str())?;
        index.remove(user_identity_key(id, identity.provider).as_str())?;
    }

    // Short links.
    let mut keys = Vec::new();
    for key in owner_links.get(id)? {
        keys.push(key?.value().to_string());
    }
    for key in &keys {
        if let Some(link) = load_row::<LinkRow>(&links, key)? {
            link_seq.remove(link.seq)?;
        }
        links.remove(key.as_str())?;
    }
    owner_links.remove_all(id)?;

    if let Some(email) = &row.email {
        emails.remove(email.as_str(), id)?;
    }
    api_keys.remove(row.api_key.as_str())?;
    users.remove(id)?;

    Ok(())
}
