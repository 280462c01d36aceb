//! Shared helpers for the HTTP tests

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, Response},
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::NamedTempFile;
use tower::ServiceExt;

use lil::config::Config;
use lil::database::init_db;
use lil::error::Result;
use lil::model::{Assertion, NewUser, Provider, User};
use lil::oauth::{IdentityProvider, Providers};
use lil::route::create_app;
use lil::state::AppState;
use lil::users::UserStore;

pub const BASE_URL: &str = "http://lil.test";

/// Provider that accepts codes of the form `subject` or `subject:email`.
/// Emails are reported as verified.
pub struct FakeProvider(pub Provider);

#[async_trait]
impl IdentityProvider for FakeProvider {
    fn provider(&self) -> Provider {
        self.0
    }

    fn authorize_url(&self, state: &str) -> String {
        format!("https://{}.test/authorize?state={state}", self.0)
    }

    async fn exchange(&self, code: &str) -> Result<Assertion> {
        let (subject, email) = match code.split_once(':') {
            Some((subject, email)) => (subject, Some(email.to_string())),
            None => (code, None),
        };
        let mut assertion = Assertion::new(self.0, subject);
        assertion.email_verified = email.is_some();
        assertion.email = email;
        assertion.name = Some(format!("{} user {subject}", self.0));
        assertion.access_token = format!("token-{subject}");
        Ok(assertion)
    }
}

pub struct TestApp {
    pub app: Router,
    pub users: UserStore,
    _db_file: NamedTempFile,
}

impl TestApp {
    pub fn new() -> Self {
        let db_file = NamedTempFile::new().expect("Failed to create temp file");
        let db = init_db(db_file.path().to_str().unwrap())
            .expect("Failed to initialize test database");

        let mut providers = Providers::new();
        providers.register(Arc::new(FakeProvider(Provider::GitHub)));
        providers.register(Arc::new(FakeProvider(Provider::Google)));

        let config = Config::new(BASE_URL, vec![7; 32], [9; 32]);
        let state = AppState::new(config, Arc::new(db), providers).unwrap();

        Self {
            users: state.users.clone(),
            app: create_app(state),
            _db_file: db_file,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.unwrap()
    }

    /// Creates a user directly and returns it with its API key.
    pub fn user(&self, name: &str) -> User {
        self.users
            .create_user(NewUser {
                name: name.to_string(),
                email: None,
            })
            .unwrap()
    }

    /// Runs the OAuth flow for `code` and returns the session cookie and
    /// the post-login redirect.
    pub async fn login(&self, provider: &str, code: &str, cookie: Option<&str>) -> (String, String) {
        let mut start = Request::get(format!("/oauth/{provider}"));
        if let Some(cookie) = cookie {
            start = start.header(header::COOKIE, cookie);
        }
        let response = self.send(start.body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), 302);
        let state = query_param(&location(&response), "state").expect("state parameter");
        let cookie = session_cookie(&response).expect("session cookie");

        let response = self
            .send(
                Request::get(format!(
                    "/oauth/{provider}/callback?state={state}&code={code}"
                ))
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
            )
            .await;
        assert_eq!(response.status(), 302, "callback failed");
        (
            session_cookie(&response).expect("session cookie"),
            location(&response),
        )
    }
}

/// Returns `name=value` of the cookie `name` set by the response.
pub fn set_cookie(response: &Response<Body>, name: &str) -> Option<String> {
    let prefix = format!("{name}=");
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find(|value| value.starts_with(&prefix))
        .map(|value| value.split(';').next().unwrap_or(value).to_string())
}

pub fn session_cookie(response: &Response<Body>) -> Option<String> {
    set_cookie(response, "session")
}

pub fn location(response: &Response<Body>) -> String {
    response
        .headers()
        .get(header::LOCATION)
        .expect("Location header")
        .to_str()
        .unwrap()
        .to_string()
}

pub fn query_param(url: &str, name: &str) -> Option<String> {
    let query = url.split_once('?')?.1;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

/// Helper function to parse response body as JSON
pub async fn response_json(response: Response<Body>) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("Failed to read response body")
        .to_bytes();

    serde_json::from_slice(&bytes).expect("Failed to parse JSON")
}

pub async fn response_text(response: Response<Body>) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("Failed to read response body")
        .to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}
