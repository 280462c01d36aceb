//! Shared application state

use std::sync::Arc;

use redb::Database;

use crate::config::Config;
use crate::database::run_blocking;
use crate::error::Result;
use crate::identity::IdentityLinker;
use crate::keygen::KeyGenerator;
use crate::links::LinkStore;
use crate::oauth::Providers;
use crate::session::SessionManager;
use crate::users::UserStore;

/// Application state shared across all HTTP handlers
///
/// Cloned per request; every field is cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub users: UserStore,
    pub links: LinkStore,
    pub sessions: SessionManager,
}

impl AppState {
    /// Wires the stores and the session manager over one database.
    pub fn new(config: Config, db: Arc<Database>, providers: Providers) -> Result<Self> {
        let keys = KeyGenerator::new(&config.alphabet, config.key_length)?;
        let linker = IdentityLinker::new(db.clone(), config.require_verified_email);
        let sessions = SessionManager::new(&config, providers, linker)?;

        Ok(Self {
            users: UserStore::new(db.clone()),
            links: LinkStore::new(db, keys),
            sessions,
            config: Arc::new(config),
        })
    }

    /// Runs a store operation off the async workers, bounded by the
    /// configured store timeout.
    pub async fn store<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        run_blocking(self.config.store_timeout, op).await
    }

    /// Public URL of a short key.
    pub fn short_url(&self, key: &str) -> String {
        format!("{}/s/{key}", self.config.base_url)
    }
}
