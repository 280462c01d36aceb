use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

use crate::error::{Error, ErrorKind, Result};
use crate::handler::found;
use crate::model::User;
use crate::state::AppState;

pub const FLASH_COOKIE: &str = "flash";

/// The authenticated caller, set by [`authenticate`].
#[derive(Clone, Debug)]
pub struct CurrentUser(pub User);

/// One-shot message left by the previous response.
#[derive(Clone, Debug, Default)]
pub struct Flash(pub Option<String>);

/// Identifies the caller.
///
/// An `Authorization: Bearer <api key>` header takes precedence over the
/// session cookie. An unknown API key is rejected; an invalid session
/// cookie is treated as anonymous.
pub async fn authenticate(
    State(state): State<AppState>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Result<Response> {
    let user = match bearer_token(request.headers()).map(str::to_string) {
        Some(api_key) => {
            let users = state.users.clone();
            let user = state
                .store(move || users.find_user_by_api_key(&api_key))
                .await?;
            Some(user.ok_or_else(|| Error::unauthorized("Invalid API key."))?)
        }
        None => session_user(&state, &jar).await?,
    };

    if let Some(user) = user {
        request.extensions_mut().insert(CurrentUser(user));
    }
    Ok(next.run(request).await)
}

async fn session_user(state: &AppState, jar: &CookieJar) -> Result<Option<User>> {
    let user_id = state.sessions.load(jar).user_id;
    if user_id == 0 {
        return Ok(None);
    }
    let users = state.users.clone();
    match state.store(move || users.find_user_by_id(user_id)).await {
        Ok(user) => Ok(Some(user)),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            tracing::warn!(user_id, "session refers to unknown user");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Guards routes that need a logged-in caller. Anonymous callers are sent
/// to the login page, remembering where they were going.
pub async fn require_auth(
    State(state): State<AppState>,
    jar: CookieJar,
    request: Request,
    next: Next,
) -> Result<Response> {
    if request.extensions().get::<CurrentUser>().is_some() {
        return Ok(next.run(request).await);
    }

    let mut session = state.sessions.load(&jar);
    state.sessions.defer_redirect(&mut session, request.uri());
    let jar = state.sessions.store(jar, &session)?;
    Ok((jar, found("/login")).into_response())
}

/// Reads the flash cookie into a [`Flash`] extension and clears it, unless
/// the response sets a new one.
pub async fn load_flash(jar: CookieJar, mut request: Request, next: Next) -> Response {
    let flash = jar
        .get(FLASH_COOKIE)
        .and_then(|cookie| URL_SAFE_NO_PAD.decode(cookie.value()).ok())
        .and_then(|bytes| String::from_utf8(bytes).ok());
    let had_cookie = jar.get(FLASH_COOKIE).is_some();

    request.extensions_mut().insert(Flash(flash));
    let response = next.run(request).await;

    if !had_cookie || sets_flash(response.headers()) {
        return response;
    }
    (jar.remove(Cookie::build(FLASH_COOKIE).path("/")), response).into_response()
}

/// Cookie carrying `message` to the next request.
pub fn flash_cookie(message: &str) -> Cookie<'static> {
    Cookie::build((FLASH_COOKIE, URL_SAFE_NO_PAD.encode(message)))
        .path("/")
        .http_only(true)
        .build()
}

fn sets_flash(headers: &HeaderMap) -> bool {
    let prefix = format!("{FLASH_COOKIE}=");
    headers
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.starts_with(&prefix))
}
