//! Client-held sessions and the OAuth login flow
//!
//! The session lives entirely in one encrypted cookie; there is no server
//! side session table. Every transition rewrites the cookie.

use std::mem;
use std::time::Duration;

use axum::http::Uri;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::config::Config;
use crate::database::run_blocking;
use crate::error::{Error, ErrorKind, Result};
use crate::identity::IdentityLinker;
use crate::model::{CallbackParams, Provider, User};
use crate::oauth::{exchange_timeout, Providers};
use crate::token::SecureToken;

pub const SESSION_COOKIE: &str = "session";

/// Lifetime of the session cookie, refreshed on every write.
pub const SESSION_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Random bytes in a CSRF nonce, before hex encoding.
const NONCE_BYTES: usize = 32;

/// Landing page after login when no redirect was deferred.
const DEFAULT_REDIRECT: &str = "/";

/// Payload of the session cookie.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    /// Authenticated user, 0 when anonymous.
    pub user_id: u64,
    pub redirect_url: String,
    /// Pending CSRF nonce.
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Anonymous,
    PendingOAuth { nonce: String, redirect: String },
    Authenticated(u64),
}

impl Session {
    pub fn state(&self) -> SessionState {
        if !self.state.is_empty() {
            SessionState::PendingOAuth {
                nonce: self.state.clone(),
                redirect: self.redirect_url.clone(),
            }
        } else if self.user_id != 0 {
            SessionState::Authenticated(self.user_id)
        } else {
            SessionState::Anonymous
        }
    }
}

#[derive(Clone)]
pub struct SessionManager {
    codec: SecureToken<Session>,
    providers: Providers,
    linker: IdentityLinker,
    secure_cookies: bool,
    provider_timeout: Duration,
    store_timeout: Duration,
}

impl SessionManager {
    pub fn new(config: &Config, providers: Providers, linker: IdentityLinker) -> Result<Self> {
        Ok(Self {
            codec: SecureToken::new(
                SESSION_COOKIE,
                &config.hash_key,
                &config.block_key,
                SESSION_MAX_AGE,
            )?,
            providers,
            linker,
            secure_cookies: config.secure_cookies(),
            provider_timeout: exchange_timeout(config.provider_timeout),
            store_timeout: config.store_timeout,
        })
    }

    pub fn providers(&self) -> &Providers {
        &self.providers
    }

    /// Reads the session from the request cookies. A missing or invalid
    /// cookie yields an anonymous session.
    pub fn load(&self, jar: &CookieJar) -> Session {
        match jar.get(SESSION_COOKIE) {
            Some(cookie) => self.codec.decode(cookie.value()).0,
            None => Session::default(),
        }
    }

    /// Writes the session back as a fresh cookie.
    pub fn store(&self, jar: CookieJar, session: &Session) -> Result<CookieJar> {
        let value = self.codec.encode(session)?;
        let cookie = Cookie::build((SESSION_COOKIE, value))
            .path("/")
            .http_only(true)
            .secure(self.secure_cookies)
            .same_site(SameSite::Lax)
            .max_age(time::Duration::seconds(SESSION_MAX_AGE.as_secs() as i64))
            .build();
        Ok(jar.add(cookie))
    }

    /// Starts a login with `provider`: mints a fresh nonce and returns the
    /// provider URL to send the user to. Any deferred redirect is kept.
    pub fn begin_login(&self, session: &mut Session, provider: Provider) -> Result<String> {
        let provider = self.providers.get(provider)?;

        let mut nonce = [0u8; NONCE_BYTES];
        rand::rng().fill_bytes(&mut nonce);
        session.state = hex::encode(nonce);

        Ok(provider.authorize_url(&session.state))
    }

    /// Completes a login. The nonce and deferred redirect are consumed
    /// whatever the outcome; on success the session is authenticated and
    /// the redirect target is returned.
    pub async fn callback(
        &self,
        session: &mut Session,
        provider: Provider,
        params: &CallbackParams,
    ) -> Result<(User, String)> {
        let expected = mem::take(&mut session.state);
        let redirect = mem::take(&mut session.redirect_url);

        if !nonce_matches(&expected, &params.state) {
            tracing::warn!(%provider, "oauth state mismatch");
            return Err(Error::invalid("Invalid OAuth state."));
        }
        if params.code.is_empty() {
            return Err(Error::invalid("Missing authorization code."));
        }

        let provider = self.providers.get(provider)?;
        let assertion = tokio::time::timeout(self.provider_timeout, provider.exchange(&params.code))
            .await
            .map_err(|_| Error::new(ErrorKind::Internal, "identity provider timed out"))??;

        let provider = assertion.provider;
        let linker = self.linker.clone();
        let user = run_blocking(self.store_timeout, move || linker.resolve(&assertion)).await?;
        session.user_id = user.id;

        tracing::info!(user_id = user.id, %provider, "logged in");
        Ok((user, safe_redirect(&redirect)))
    }

    /// Resets the session to anonymous.
    pub fn logout(&self, session: &mut Session) {
        *session = Session::default();
    }

    /// Remembers where an anonymous user was going before being sent to log in.
    pub fn defer_redirect(&self, session: &mut Session, uri: &Uri) {
        session.redirect_url = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| uri.path().to_string());
    }
}

/// Constant-time nonce comparison. An empty nonce never matches.
fn nonce_matches(expected: &str, actual: &str) -> bool {
    !expected.is_empty() && bool::from(expected.as_bytes().ct_eq(actual.as_bytes()))
}

/// Only same-origin absolute paths are followed after login.
fn safe_redirect(target: &str) -> String {
    if target.starts_with('/') && !target.starts_with("//") && !target.contains('\\') {
        target.to_string()
    } else {
        DEFAULT_REDIRECT.to_string()
    }
}
