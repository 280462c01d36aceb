//! External identity providers
//!
//! A provider turns an authorization code into an [`Assertion`]. The token
//! exchange and profile fetch are single attempts with a timeout; failures
//! surface as INTERNAL.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet, EndpointSet,
    RedirectUrl, Scope, TokenResponse, TokenUrl,
};
use serde::Deserialize;

use crate::config::{Config, OAuthCredentials};
use crate::error::{Error, Result};
use crate::model::{Assertion, Provider};

const USER_AGENT: &str = concat!("lil/", env!("CARGO_PKG_VERSION"));

/// Capability of one external identity provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn provider(&self) -> Provider;

    /// URL the user is sent to, carrying `state` for the callback check.
    fn authorize_url(&self, state: &str) -> String;

    /// Exchanges an authorization code and fetches the provider profile.
    async fn exchange(&self, code: &str) -> Result<Assertion>;
}

/// Registered providers by tag.
#[derive(Clone, Default)]
pub struct Providers {
    inner: BTreeMap<Provider, Arc<dyn IdentityProvider>>,
}

impl Providers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the providers that have credentials in `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut providers = Self::new();
        if let Some(creds) = &config.github {
            providers.register(Arc::new(GitHubProvider::new(config, creds)?));
        }
        if let Some(creds) = &config.google {
            providers.register(Arc::new(GoogleProvider::new(config, creds)?));
        }
        Ok(providers)
    }

    pub fn register(&mut self, provider: Arc<dyn IdentityProvider>) {
        self.inner.insert(provider.provider(), provider);
    }

    pub fn get(&self, provider: Provider) -> Result<Arc<dyn IdentityProvider>> {
        self.inner
            .get(&provider)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("Provider {provider} is not configured.")))
    }

    pub fn list(&self) -> Vec<Provider> {
        self.inner.keys().copied().collect()
    }
}

/// OAuth client type with auth URL and token URL set.
type ConfiguredClient = oauth2::Client<
    oauth2::basic::BasicErrorResponse,
    oauth2::basic::BasicTokenResponse,
    oauth2::basic::BasicTokenIntrospectionResponse,
    oauth2::StandardRevocableToken,
    oauth2::basic::BasicRevocationErrorResponse,
    EndpointSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointSet,
>;

/// Authorization-code flow shared by the concrete providers.
struct CodeFlow {
    client: ConfiguredClient,
    http: reqwest::Client,
    scopes: &'static [&'static str],
}

/// Tokens returned by a successful code exchange.
struct Tokens {
    access_token: String,
    refresh_token: String,
    expiry: Option<chrono::DateTime<Utc>>,
}

impl CodeFlow {
    fn new(
        config: &Config,
        provider: Provider,
        creds: &OAuthCredentials,
        auth_url: &str,
        token_url: &str,
        scopes: &'static [&'static str],
    ) -> Result<Self> {
        let redirect = format!("{}/oauth/{provider}/callback", config.base_url);

        let client = BasicClient::new(ClientId::new(creds.client_id.clone()))
            .set_client_secret(ClientSecret::new(creds.client_secret.clone()))
            .set_auth_uri(
                AuthUrl::new(auth_url.to_string())
                    .map_err(|e| Error::internal("invalid authorization url", e))?,
            )
            .set_token_uri(
                TokenUrl::new(token_url.to_string())
                    .map_err(|e| Error::internal("invalid token url", e))?,
            )
            .set_redirect_uri(
                RedirectUrl::new(redirect)
                    .map_err(|e| Error::internal("invalid redirect url", e))?,
            );

        // Provider responses are never followed.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.provider_timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            http,
            scopes,
        })
    }

    fn authorize_url(&self, state: &str) -> String {
        let state = state.to_string();
        let mut request = self.client.authorize_url(move || CsrfToken::new(state));
        for scope in self.scopes {
            request = request.add_scope(Scope::new(scope.to_string()));
        }
        let (url, _) = request.url();
        url.to_string()
    }

    async fn exchange(&self, code: &str) -> Result<Tokens> {
        let token = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(&self.http)
            .await
            .map_err(|e| Error::internal("token exchange failed", e))?;

        Ok(Tokens {
            access_token: token.access_token().secret().clone(),
            refresh_token: token
                .refresh_token()
                .map(|t| t.secret().clone())
                .unwrap_or_default(),
            expiry: token
                .expires_in()
                .and_then(|d| chrono::Duration::from_std(d).ok())
                .map(|d| Utc::now() + d),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str, token: &str) -> Result<T> {
        Ok(self
            .http
            .get(url)
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }
}

#[derive(Debug, Deserialize)]
struct GitHubUser {
    id: u64,
    login: String,
    name: Option<String>,
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitHubEmail {
    email: String,
    primary: bool,
    verified: bool,
}

pub struct GitHubProvider {
    flow: CodeFlow,
}

impl GitHubProvider {
    pub fn new(config: &Config, creds: &OAuthCredentials) -> Result<Self> {
        Ok(Self {
            flow: CodeFlow::new(
                config,
                Provider::GitHub,
                creds,
                "https://github.com/login/oauth/authorize",
                "https://github.com/login/oauth/access_token",
                &["read:user", "user:email"],
            )?,
        })
    }
}

#[async_trait]
impl IdentityProvider for GitHubProvider {
    fn provider(&self) -> Provider {
        Provider::GitHub
    }

    fn authorize_url(&self, state: &str) -> String {
        self.flow.authorize_url(state)
    }

    async fn exchange(&self, code: &str) -> Result<Assertion> {
        let tokens = self.flow.exchange(code).await?;
        let user: GitHubUser = self
            .flow
            .get_json("https://api.github.com/user", &tokens.access_token)
            .await?;

        // The profile email is whatever the user made public; only the
        // emails endpoint says whether it was verified.
        let verified = match self
            .flow
            .get_json::<Vec<GitHubEmail>>("https://api.github.com/user/emails", &tokens.access_token)
            .await
        {
            Ok(emails) => emails.into_iter().find(|e| e.primary && e.verified),
            Err(err) => {
                tracing::warn!(error = %err, "github email lookup failed");
                None
            }
        };

        let mut assertion = Assertion::new(Provider::GitHub, user.id.to_string());
        match verified {
            Some(primary) => {
                assertion.email = Some(primary.email);
                assertion.email_verified = true;
            }
            None => assertion.email = user.email,
        }
        assertion.name = user.name.filter(|n| !n.is_empty()).or(Some(user.login));
        assertion.access_token = tokens.access_token;
        assertion.refresh_token = tokens.refresh_token;
        assertion.expiry = tokens.expiry;
        Ok(assertion)
    }
}

#[derive(Debug, Deserialize)]
struct GoogleUser {
    id: String,
    email: Option<String>,
    #[serde(default)]
    verified_email: bool,
    name: Option<String>,
}

pub struct GoogleProvider {
    flow: CodeFlow,
}

impl GoogleProvider {
    pub fn new(config: &Config, creds: &OAuthCredentials) -> Result<Self> {
        Ok(Self {
            flow: CodeFlow::new(
                config,
                Provider::Google,
                creds,
                "https://accounts.google.com/o/oauth2/v2/auth",
                "https://oauth2.googleapis.com/token",
                &[
                    "https://www.googleapis.com/auth/userinfo.email",
                    "https://www.googleapis.com/auth/userinfo.profile",
                ],
            )?,
        })
    }
}

#[async_trait]
impl IdentityProvider for GoogleProvider {
    fn provider(&self) -> Provider {
        Provider::Google
    }

    fn authorize_url(&self, state: &str) -> String {
        self.flow.authorize_url(state)
    }

    async fn exchange(&self, code: &str) -> Result<Assertion> {
        let tokens = self.flow.exchange(code).await?;
        let user: GoogleUser = self
            .flow
            .get_json(
                "https://www.googleapis.com/oauth2/v2/userinfo",
                &tokens.access_token,
            )
            .await?;

        let mut assertion = Assertion::new(Provider::Google, user.id);
        assertion.email = user.email;
        assertion.email_verified = user.verified_email;
        assertion.name = user.name;
        assertion.access_token = tokens.access_token;
        assertion.refresh_token = tokens.refresh_token;
        assertion.expiry = tokens.expiry;
        Ok(assertion)
    }
}

/// Timeout applied around a whole provider exchange.
pub const fn exchange_timeout(per_request: Duration) -> Duration {
    // Token exchange plus up to two profile requests.
    per_request.saturating_mul(3)
}
