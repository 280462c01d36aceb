//! Resolving provider assertions to local accounts
//!
//! [`IdentityLinker::resolve`] runs in a single write transaction: either the
//! user and identity changes all commit together or nothing does. Correctness
//! under concurrent first logins rests on the `(provider, subject)` and
//! `(user, provider)` uniqueness checks below, which redb evaluates inside
//! the serialized write transaction.

use std::sync::Arc;

use chrono::Utc;
use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};

use crate::database::{
    identity_key, load_identities, load_row, load_user_row, user_identity_key, IdentityRow,
    TABLE_IDENTITIES, TABLE_USERS, TABLE_USER_EMAILS, TABLE_USER_IDENTITIES,
};
use crate::error::{Error, Result};
use crate::model::{Assertion, User};
use crate::users::{create_user, first_user_by_email};

#[derive(Clone)]
pub struct IdentityLinker {
    db: Arc<Database>,
    require_verified_email: bool,
}

impl IdentityLinker {
    pub fn new(db: Arc<Database>, require_verified_email: bool) -> Self {
        Self {
            db,
            require_verified_email,
        }
    }

    /// Finds or creates the user behind `assertion`, linking accounts by
    /// email where allowed.
    ///
    /// - INVALID if the subject is empty.
    /// - CONFLICT if the matched user already holds an identity for this
    ///   provider, or if the identity was claimed concurrently.
    pub fn resolve(&self, assertion: &Assertion) -> Result<User> {
        if assertion.subject.trim().is_empty() {
            return Err(Error::invalid("Identity subject required."));
        }

        let txn = self.db.begin_write()?;
        let user_id = self.resolve_in(&txn, assertion)?;
        txn.commit()?;

        let txn = self.db.begin_read()?;
        let users = txn.open_table(TABLE_USERS)?;
        let index = txn.open_table(TABLE_USER_IDENTITIES)?;
        let identities = txn.open_table(TABLE_IDENTITIES)?;
        let row = load_user_row(&users, user_id)?
            .ok_or_else(|| Error::not_found("User not found."))?;
        Ok(row.into_user(load_identities(&index, &identities, user_id)?))
    }

    /// Returns the id of the resolved user. Any error leaves `txn` uncommitted.
    fn resolve_in(&self, txn: &WriteTransaction, assertion: &Assertion) -> Result<u64> {
        let now = Utc::now();
        let key = identity_key(assertion.provider, &assertion.subject);

        // Known external account: refresh the tokens, keep the user as is.
        {
            let mut identities = txn.open_table(TABLE_IDENTITIES)?;
            if let Some(mut row) = load_row::<IdentityRow>(&identities, &key)? {
                row.access_token = assertion.access_token.clone();
                row.refresh_token = assertion.refresh_token.clone();
                row.expiry = assertion.expiry;
                row.updated_at = now;
                identities.insert(key.as_str(), serde_json::to_string(&row)?.as_str())?;

                tracing::debug!(user_id = row.user_id, provider = %assertion.provider, "refreshed identity");
                return Ok(row.user_id);
            }
        }

        let email = self.linkable_email(assertion);

        let existing = match email {
            Some(email) => {
                let emails = txn.open_multimap_table(TABLE_USER_EMAILS)?;
                let users = txn.open_table(TABLE_USERS)?;
                first_user_by_email(&emails, &users, email, self.require_verified_email)?
            }
            None => None,
        };

        let user_id = match existing {
            Some(row) => {
                tracing::info!(user_id = row.id, provider = %assertion.provider, "linking identity by email");
                row.id
            }
            None => {
                let name = display_name(assertion);
                let row = create_user(txn, &name, email, assertion.email_verified, now)?;
                tracing::info!(user_id = row.id, provider = %assertion.provider, "created user");
                row.id
            }
        };

        insert_identity(txn, user_id, &key, assertion, now)?;
        Ok(user_id)
    }

    /// The email usable for lookup and storage, if any.
    fn linkable_email<'a>(&self, assertion: &'a Assertion) -> Option<&'a str> {
        let email = assertion.email.as_deref().map(str::trim).filter(|e| !e.is_empty())?;
        if self.require_verified_email && !assertion.email_verified {
            return None;
        }
        Some(email)
    }
}

fn display_name(assertion: &Assertion) -> String {
    assertion
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .or_else(|| assertion.email.as_deref().filter(|e| !e.is_empty()))
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}:{}", assertion.provider, assertion.subject))
}

fn insert_identity(
    txn: &WriteTransaction,
    user_id: u64,
    key: &str,
    assertion: &Assertion,
    now: chrono::DateTime<Utc>,
) -> Result<()> {
    let mut identities = txn.open_table(TABLE_IDENTITIES)?;
    let mut index = txn.open_table(TABLE_USER_IDENTITIES)?;

    if identities.get(key)?.is_some() {
        return Err(Error::conflict("This account is already linked."));
    }

    let slot = user_identity_key(user_id, assertion.provider);
    if index.get(slot.as_str())?.is_some() {
        return Err(Error::conflict(format!(
            "User already has a {} identity.",
            assertion.provider
        )));
    }

    let row = IdentityRow {
        user_id,
        provider: assertion.provider,
        subject: assertion.subject.clone(),
        access_token: assertion.access_token.clone(),
        refresh_token: assertion.refresh_token.clone(),
        expiry: assertion.expiry,
        created_at: now,
        updated_at: now,
    };
    identities.insert(key, serde_json::to_string(&row)?.as_str())?;
    index.insert(slot.as_str(), key)?;
    Ok(())
}
