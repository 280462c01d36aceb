//! Integration tests for the URL shortener API
//!
//! These tests drive the whole application stack through the router:
//! routing, authentication, sessions, storage and error mapping.

mod common;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use serde_json::{json, Value};

use common::{
    location, response_json, response_text, session_cookie, set_cookie, TestApp, BASE_URL,
};

fn bearer(api_key: &str) -> String {
    format!("Bearer {api_key}")
}

async fn create_short(app: &TestApp, api_key: &str, url: &str) -> Value {
    let response = app
        .send(
            Request::post("/short/new")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::AUTHORIZATION, bearer(api_key))
                .body(Body::from(json!({ "url": url }).to_string()))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    response_json(response).await
}

#[tokio::test]
async fn test_short_link_lifecycle() {
    let app = TestApp::new();
    let owner = app.user("owner");
    let other = app.user("other");

    let body = create_short(&app, &owner.api_key, "https://example.com").await;
    let key = body["key"].as_str().unwrap().to_string();
    assert_eq!(key.len(), 6);
    assert_eq!(body["shortened_url"], format!("{BASE_URL}/s/{key}"));

    // Public resolution
    let response = app
        .send(Request::get(format!("/s/{key}")).body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(location(&response), "https://example.com/");

    // Someone else cannot delete it
    let response = app
        .send(
            Request::delete(format!("/s/{key}"))
                .header(header::AUTHORIZATION, bearer(&other.api_key))
                .header(header::ACCEPT, "application/json")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // The owner can
    let response = app
        .send(
            Request::delete(format!("/s/{key}"))
                .header(header::AUTHORIZATION, bearer(&owner.api_key))
                .header(header::ACCEPT, "application/json")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["deleted_key"], key.as_str());

    let response = app
        .send(Request::get(format!("/s/{key}")).body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response_json(response).await["error"], "Short not found.");
}

#[tokio::test]
async fn test_invalid_scheme_is_rejected() {
    let app = TestApp::new();
    let user = app.user("ann");

    for url in ["ftp://x", "javascript:alert(1)"] {
        let response = app
            .send(
                Request::post("/short/new")
                    .header(header::CONTENT_TYPE, "application/json")
                    .header(header::AUTHORIZATION, bearer(&user.api_key))
                    .body(Body::from(json!({ "url": url }).to_string()))
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response_json(response).await["error"],
            "Invalid URL scheme. Only http and https are supported."
        );
    }

    let response = app
        .send(
            Request::get("/short")
                .header(header::AUTHORIZATION, bearer(&user.api_key))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response_json(response).await["n"], 0);
}

#[tokio::test]
async fn test_created_links_always_resolve() {
    let app = TestApp::new();
    let user = app.user("ann");

    let cases = [
        ("https://example.com/a\nb", "https://example.com/ab"),
        ("https://example.com/café", "https://example.com/caf%C3%A9"),
    ];
    for (url, target) in cases {
        let key = create_short(&app, &user.api_key, url).await["key"]
            .as_str()
            .unwrap()
            .to_string();

        let response = app
            .send(Request::get(format!("/s/{key}")).body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY, "{url:?}");
        assert_eq!(location(&response), target);
    }
}

#[tokio::test]
async fn test_malformed_json_is_rejected() {
    let app = TestApp::new();
    let user = app.user("ann");

    let response = app
        .send(
            Request::post("/short/new")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::AUTHORIZATION, bearer(&user.api_key))
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_create_from_form() {
    let app = TestApp::new();
    let user = app.user("ann");

    let response = app
        .send(
            Request::post("/short/new")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .header(header::AUTHORIZATION, bearer(&user.api_key))
                .body(Body::from("url=https%3A%2F%2Fexample.com%2Fform"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let key = response_json(response).await["key"]
        .as_str()
        .unwrap()
        .to_string();
    let response = app
        .send(Request::get(format!("/s/{key}")).body(Body::empty()).unwrap())
        .await;
    assert_eq!(location(&response), "https://example.com/form");
}

#[tokio::test]
async fn test_list_pagination() {
    let app = TestApp::new();
    let user = app.user("ann");
    let other = app.user("bob");

    for i in 0..25 {
        create_short(&app, &user.api_key, &format!("https://example.com/{i}")).await;
    }
    create_short(&app, &other.api_key, "https://example.com/bob").await;

    // Default limit is 20
    let response = app
        .send(
            Request::get("/short")
                .header(header::AUTHORIZATION, bearer(&user.api_key))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["n"], 26);
    assert_eq!(body["shorts"].as_array().unwrap().len(), 20);
    assert_eq!(body["shorts"][0]["url"], "https://example.com/0");

    let response = app
        .send(
            Request::get("/short?offset=20&limit=10")
                .header(header::AUTHORIZATION, bearer(&user.api_key))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    let body = response_json(response).await;
    assert_eq!(body["n"], 26);
    assert_eq!(body["shorts"].as_array().unwrap().len(), 6);
    assert_eq!(body["shorts"][0]["url"], "https://example.com/20");
    assert_eq!(body["shorts"][5]["url"], "https://example.com/bob");

    // JSON filter body
    let response = app
        .send(
            Request::get("/short")
                .header(header::AUTHORIZATION, bearer(&user.api_key))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({ "url": "https://example.com/7" }).to_string(),
                ))
                .unwrap(),
        )
        .await;
    let body = response_json(response).await;
    assert_eq!(body["n"], 1);
    assert_eq!(body["shorts"][0]["url"], "https://example.com/7");

    let response = app
        .send(
            Request::get("/short")
                .header(header::AUTHORIZATION, bearer(&user.api_key))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({ "owner_id": other.id }).to_string()))
                .unwrap(),
        )
        .await;
    let body = response_json(response).await;
    assert_eq!(body["n"], 1);
    assert_eq!(body["shorts"][0]["url"], "https://example.com/bob");
}

#[tokio::test]
async fn test_list_includes_every_owner() {
    let app = TestApp::new();
    let ann = app.user("ann");
    let bob = app.user("bob");

    let key = create_short(&app, &ann.api_key, "https://example.com/ann").await["key"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .send(
            Request::get("/short")
                .header(header::AUTHORIZATION, bearer(&bob.api_key))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    let body = response_json(response).await;
    assert_eq!(body["n"], 1);
    assert_eq!(body["shorts"][0]["key"], key.as_str());
    assert_eq!(body["shorts"][0]["owner_id"], ann.id);
}

#[tokio::test]
async fn test_oauth_login_follows_deferred_redirect() {
    let app = TestApp::new();

    // Anonymous access to a private page
    let response = app
        .send(Request::get("/short?offset=0").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/login");
    let cookie = session_cookie(&response).unwrap();

    let (cookie, target) = app
        .login("github", "123:a@x.com", Some(&cookie))
        .await;
    assert_eq!(target, "/short?offset=0");

    let response = app
        .send(
            Request::get("/me")
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let me = response_json(response).await;
    assert_eq!(me["name"], "github user 123");
    assert_eq!(me["email"], "a@x.com");
    assert_eq!(me["identities"][0]["provider"], "github");
    assert_eq!(me["identities"][0]["subject"], "123");
    assert!(me.get("api_key").is_none());
    assert!(me["identities"][0].get("access_token").is_none());
}

#[tokio::test]
async fn test_login_without_deferred_redirect_lands_home() {
    let app = TestApp::new();
    let (_, target) = app.login("google", "g-1", None).await;
    assert_eq!(target, "/");
}

#[tokio::test]
async fn test_repeated_and_cross_provider_login() {
    let app = TestApp::new();

    let (first, _) = app.login("github", "123:e@x.com", None).await;
    let (again, _) = app.login("github", "123:e@x.com", None).await;
    let (google, _) = app.login("google", "g-9:e@x.com", None).await;

    let mut ids = Vec::new();
    for cookie in [&first, &again, &google] {
        let response = app
            .send(
                Request::get("/me")
                    .header(header::COOKIE, cookie.as_str())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        ids.push(response_json(response).await["id"].clone());
    }
    assert_eq!(ids[0], ids[1]);
    assert_eq!(ids[0], ids[2]);

    let response = app
        .send(
            Request::get("/me")
                .header(header::COOKIE, google.as_str())
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    let me = response_json(response).await;
    assert_eq!(me["identities"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_second_identity_for_provider_conflicts() {
    let app = TestApp::new();
    app.login("github", "1:e@x.com", None).await;

    let response = app
        .send(Request::get("/oauth/github").body(Body::empty()).unwrap())
        .await;
    let state = common::query_param(&location(&response), "state").unwrap();
    let cookie = session_cookie(&response).unwrap();

    let response = app
        .send(
            Request::get(format!("/oauth/github/callback?state={state}&code=2:e@x.com"))
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_csrf_mismatch_does_not_authenticate() {
    let app = TestApp::new();

    let response = app
        .send(Request::get("/oauth/github").body(Body::empty()).unwrap())
        .await;
    let cookie = session_cookie(&response).unwrap();

    let response = app
        .send(
            Request::get("/oauth/github/callback?state=forged&code=123")
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response_json_error(response).await, "Invalid OAuth state.");
}

async fn response_json_error(response: axum::http::Response<Body>) -> String {
    let cookie = session_cookie(&response);
    assert!(cookie.is_some(), "session must be rewritten");
    response_json(response).await["error"]
        .as_str()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn test_callback_nonce_cannot_be_replayed() {
    let app = TestApp::new();

    let response = app
        .send(Request::get("/oauth/github").body(Body::empty()).unwrap())
        .await;
    let state = common::query_param(&location(&response), "state").unwrap();
    let pending = session_cookie(&response).unwrap();

    let callback = format!("/oauth/github/callback?state={state}&code=5");
    let response = app
        .send(
            Request::get(&callback)
                .header(header::COOKIE, &pending)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FOUND);
    let logged_in = session_cookie(&response).unwrap();

    // Same callback against the updated cookie
    let response = app
        .send(
            Request::get(&callback)
                .header(header::COOKIE, &logged_in)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_logout_ends_session() {
    let app = TestApp::new();
    let (cookie, _) = app.login("github", "9", None).await;

    let response = app
        .send(
            Request::post("/logout")
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/");
    let anonymous = session_cookie(&response).unwrap();

    let response = app
        .send(
            Request::get("/me")
                .header(header::COOKIE, &anonymous)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/login");
}

#[tokio::test]
async fn test_delete_sets_flash_message() {
    let app = TestApp::new();
    let (cookie, _) = app.login("github", "77", None).await;

    let response = app
        .send(
            Request::post("/short/new")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::COOKIE, &cookie)
                .body(Body::from(json!({ "url": "https://example.com" }).to_string()))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let key = response_json(response).await["key"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .send(
            Request::delete(format!("/s/{key}"))
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/short");
    let flash = set_cookie(&response, "flash").unwrap();

    let response = app
        .send(
            Request::get("/")
                .header(header::COOKIE, format!("{cookie}; {flash}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    // Read once, then cleared
    let cleared = set_cookie(&response, "flash").unwrap();
    assert_eq!(cleared, "flash=");
    let body = response_json(response).await;
    assert_eq!(
        body["flash"],
        format!("Successfully deleted short {key}.")
    );
    assert_eq!(body["user"]["name"], "github user 77");
}

#[tokio::test]
async fn test_login_index_lists_providers() {
    let app = TestApp::new();
    let response = app
        .send(Request::get("/login").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(
        body["providers"],
        json!([
            { "name": "github", "url": "/oauth/github" },
            { "name": "google", "url": "/oauth/google" },
        ])
    );
}

#[tokio::test]
async fn test_unknown_provider_is_not_found() {
    let app = TestApp::new();
    let response = app
        .send(Request::get("/oauth/gitlab").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_debug_endpoints() {
    let app = TestApp::new();
    let response = app
        .send(Request::get("/debug/version").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_text(response).await, env!("CARGO_PKG_VERSION"));

    let response = app
        .send(Request::get("/debug/commit").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_update_and_delete_account() {
    let app = TestApp::new();
    let (cookie, _) = app.login("github", "42:me@x.com", None).await;

    let response = app
        .send(
            Request::patch("/me")
                .header(header::COOKIE, &cookie)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({ "name": "Renamed" }).to_string()))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["name"], "Renamed");

    let response = app
        .send(
            Request::delete("/me")
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // The old cookie now names a user that no longer exists
    let response = app
        .send(
            Request::get("/me")
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FOUND);
}
