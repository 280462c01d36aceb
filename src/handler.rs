//! HTTP request handlers
//!
//! Handlers translate between HTTP and the stores. Every store call takes
//! the acting user explicitly, taken from the [`CurrentUser`] extension that
//! the authentication middleware sets.

use axum::{
    body::Bytes,
    extract::{FromRequest, Path, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Form, Json,
};
use axum_extra::extract::cookie::CookieJar;
use serde_json::json;

use crate::error::{Error, Result};
use crate::middleware::{flash_cookie, CurrentUser, Flash};
use crate::model::{
    CallbackParams, CreateRequest, CreateResponse, LinkFilter, ListParams, ListResponse,
    Provider, UserUpdate,
};
use crate::state::AppState;

/// Default page size of `GET /short`.
pub const DEFAULT_LIST_LIMIT: usize = 20;

/// Redirect with `302 Found`.
pub fn found(location: &str) -> Response {
    redirect(StatusCode::FOUND, location)
}

fn redirect(status: StatusCode, location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => (status, [(header::LOCATION, value)]).into_response(),
        Err(_) => Error::invalid("Invalid redirect location.").into_response(),
    }
}

fn is_json(headers: &HeaderMap, name: header::HeaderName) -> bool {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/json"))
}

/// `GET /` reports the caller and any pending flash message.
pub async fn index(request: Request) -> impl IntoResponse {
    let extensions = request.extensions();
    let user = extensions.get::<CurrentUser>().map(|CurrentUser(user)| user);
    let flash = extensions.get::<Flash>().and_then(|Flash(flash)| flash.as_deref());
    Json(json!({ "user": user, "flash": flash }))
}

/// Resolves a short key to its target with `301 Moved Permanently`.
pub async fn redirect_url(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response> {
    let links = state.links.clone();
    let link = state.store(move || links.find_by_key(&key)).await?;
    Ok(redirect(StatusCode::MOVED_PERMANENTLY, &link.url))
}

/// Creates a short URL from a JSON body `{url}` or a form field `url`.
///
/// # Response
///
/// - **201 Created** with `{key, shortened_url}`
/// - **400 Bad Request** for a missing or non-http(s) URL
pub async fn create_short_url(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    request: Request,
) -> Result<impl IntoResponse> {
    let payload = if is_json(request.headers(), header::CONTENT_TYPE) {
        Json::<CreateRequest>::from_request(request, &state)
            .await
            .map_err(|_| Error::invalid("We couldn't parse the request body."))?
            .0
    } else {
        Form::<CreateRequest>::from_request(request, &state)
            .await
            .map_err(|_| Error::invalid("Missing URL."))?
            .0
    };

    let links = state.links.clone();
    let link = state.store(move || links.create(&payload.url, user.id)).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateResponse {
            shortened_url: state.short_url(&link.key),
            key: link.key,
        }),
    ))
}

/// Lists short URLs, oldest first.
///
/// Paging comes from `offset`/`limit` query parameters (default limit 20)
/// or, with a JSON content type, from a [`LinkFilter`] body that may also
/// narrow by key, target URL or owner.
pub async fn list_urls(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ListResponse>> {
    let filter = if is_json(&headers, header::CONTENT_TYPE) && !body.is_empty() {
        serde_json::from_slice::<LinkFilter>(&body)
            .map_err(|_| Error::invalid("Invalid JSON body"))?
    } else {
        LinkFilter {
            offset: params.offset.unwrap_or(0),
            limit: params.limit.unwrap_or(DEFAULT_LIST_LIMIT),
            ..LinkFilter::default()
        }
    };

    let links = state.links.clone();
    let (shorts, n) = state.store(move || links.find(&filter)).await?;
    Ok(Json(ListResponse { shorts, n }))
}

/// Deletes one of the caller's short URLs.
///
/// JSON callers get a message body; others are redirected to `/short`
/// with a flash message.
pub async fn delete_short_url(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(key): Path<String>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<Response> {
    let links = state.links.clone();
    let target = key.clone();
    state.store(move || links.delete(&target, user.id)).await?;

    let message = format!("Successfully deleted short {key}.");
    if is_json(&headers, header::ACCEPT) {
        return Ok(Json(json!({ "message": message, "deleted_key": key })).into_response());
    }
    Ok((jar.add(flash_cookie(&message)), found("/short")).into_response())
}

/// Lists the login entry points of the configured providers.
pub async fn login_index(State(state): State<AppState>) -> impl IntoResponse {
    let providers: Vec<_> = state
        .sessions
        .providers()
        .list()
        .into_iter()
        .map(|provider| json!({ "name": provider, "url": format!("/oauth/{provider}") }))
        .collect();
    Json(json!({ "providers": providers }))
}

/// Starts the OAuth flow by redirecting to the provider.
pub async fn oauth_login(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    jar: CookieJar,
) -> Result<Response> {
    let provider: Provider = provider.parse()?;

    let mut session = state.sessions.load(&jar);
    let url = state.sessions.begin_login(&mut session, provider)?;
    let jar = state.sessions.store(jar, &session)?;

    Ok((jar, found(&url)).into_response())
}

/// Completes the OAuth flow.
///
/// The session is written back even on failure so the consumed nonce
/// cannot be replayed.
pub async fn oauth_callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(params): Query<CallbackParams>,
    jar: CookieJar,
) -> Result<Response> {
    let provider: Provider = provider.parse()?;

    let mut session = state.sessions.load(&jar);
    let outcome = state.sessions.callback(&mut session, provider, &params).await;
    let jar = state.sessions.store(jar, &session)?;

    match outcome {
        Ok((_, target)) => Ok((jar, found(&target)).into_response()),
        Err(err) => Ok((jar, err).into_response()),
    }
}

pub async fn logout(State(state): State<AppState>, jar: CookieJar) -> Result<Response> {
    let mut session = state.sessions.load(&jar);
    state.sessions.logout(&mut session);
    let jar = state.sessions.store(jar, &session)?;
    Ok((jar, found("/")).into_response())
}

pub async fn get_me(Extension(CurrentUser(user)): Extension<CurrentUser>) -> impl IntoResponse {
    Json(user)
}

pub async fn update_me(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(update): Json<UserUpdate>,
) -> Result<impl IntoResponse> {
    let users = state.users.clone();
    let user = state.store(move || users.update_user(user.id, user.id, update)).await?;
    Ok(Json(user))
}

/// Deletes the caller's account and ends the session.
pub async fn delete_me(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    jar: CookieJar,
) -> Result<Response> {
    let users = state.users.clone();
    state.store(move || users.delete_user(user.id, user.id)).await?;

    let mut session = state.sessions.load(&jar);
    state.sessions.logout(&mut session);
    let jar = state.sessions.store(jar, &session)?;
    Ok((jar, StatusCode::NO_CONTENT).into_response())
}

pub async fn debug_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub async fn debug_commit() -> &'static str {
    option_env!("LIL_COMMIT").unwrap_or("unknown")
}
