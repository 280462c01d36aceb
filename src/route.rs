//! Route definitions for the URL shortener
//!
//! This module configures all HTTP routes and maps them to their respective handlers.

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;

use crate::handler::{
    create_short_url, debug_commit, debug_version, delete_me, delete_short_url, get_me, index,
    list_urls, login_index, logout, oauth_callback, oauth_login, redirect_url, update_me,
};
use crate::middleware::{authenticate, load_flash, require_auth};
use crate::state::AppState;

/// Creates the application router
///
/// # Route Definitions
///
/// Public:
/// - `GET /` - Current user and flash message
/// - `GET /s/{key}` - Redirects to the original URL
/// - `GET /login` - Configured login providers
/// - `GET /oauth/{provider}` - Starts an OAuth login
/// - `GET /oauth/{provider}/callback` - Completes an OAuth login
/// - `POST|DELETE /logout` - Ends the session
/// - `GET /debug/version`, `GET /debug/commit`
///
/// Authenticated (session cookie or `Authorization: Bearer <api key>`):
/// - `POST /short/new` - Creates a short URL
/// - `GET /short` - Lists the caller's short URLs
/// - `DELETE /s/{key}` - Deletes a short URL owned by the caller
/// - `GET|PATCH|DELETE /me` - The caller's account
///
/// # Example Usage
///
/// ```no_run
/// # use std::sync::Arc;
/// # use lil::config::Config;
/// # use lil::database::init_db;
/// # use lil::oauth::Providers;
/// # use lil::route::create_app;
/// # use lil::state::AppState;
/// let config = Config::from_env().unwrap();
/// let db = Arc::new(init_db(&config.database_url).unwrap());
/// let providers = Providers::from_config(&config).unwrap();
/// let app = create_app(AppState::new(config, db, providers).unwrap());
/// // axum::serve(listener, app).await.unwrap();
/// ```
pub fn create_app(state: AppState) -> Router {
    let auth = middleware::from_fn_with_state(state.clone(), require_auth);

    let private_routes = Router::new()
        .route("/short/new", post(create_short_url))
        .route("/short", get(list_urls))
        .route("/me", get(get_me).patch(update_me).delete(delete_me))
        .route_layer(auth.clone());

    Router::new()
        .route("/", get(index))
        // Resolution is public, deletion is not.
        .route(
            "/s/{key}",
            get(redirect_url).merge(delete(delete_short_url).route_layer(auth)),
        )
        .route("/login", get(login_index))
        .route("/oauth/{provider}", get(oauth_login))
        .route("/oauth/{provider}/callback", get(oauth_callback))
        .route("/logout", post(logout).delete(logout))
        .route("/debug/version", get(debug_version))
        .route("/debug/commit", get(debug_commit))
        .merge(private_routes)
        .layer(middleware::from_fn_with_state(state.clone(), authenticate))
        .layer(middleware::from_fn(load_flash))
        .with_state(state)
}
