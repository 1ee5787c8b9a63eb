// Authentication integration tests: Digest challenge/response, nonce
// replay, Basic credentials, role gating and session login.

mod common;

use etude_core::auth::{self, Challenge, DigestAlgorithm};
use etude_core::prelude::*;

use common::{base_url, start_host};

fn users_config(kind: &str, require_tls_for_basic: bool) -> serde_json::Value {
    serde_json::json!({
        "listen": ["http://127.0.0.1:0"],
        "auth": {
            "realm": "app",
            "algorithm": "SHA-256",
            "type": kind,
            "requireTlsForBasic": require_tls_for_basic
        },
        "roles": {"admin": ["user"]},
        "users": [
            {
                "username": "u",
                "password": auth::password_digest(DigestAlgorithm::Sha256, "u", "app", "secret"),
                "role": "admin"
            },
            {
                "username": "viewer",
                "password": auth::password_digest(DigestAlgorithm::Sha256, "viewer", "app", "pw"),
                "role": "user"
            }
        ],
        "routes": [
            {"match": "/login", "handler": "action", "methods": ["POST"]},
            {"match": "/secret", "handler": "action", "role": "admin"}
        ]
    })
}

async fn secret(req: &mut WebRequest) -> WebResult<()> {
    req.set_content_type("text/plain");
    req.write_body(b"top").await
}

async fn login(req: &mut WebRequest) -> WebResult<()> {
    let username = req.var("username").unwrap_or_default().to_string();
    let password = req.var("password").unwrap_or_default().to_string();
    if req.login(&username, &password) {
        req.set_content_type("text/plain");
        req.write_body(b"welcome").await
    } else {
        req.error_response(401, "").await
    }
}

#[test]
fn test_digest_challenge_then_success() {
    // S4: no credentials draws the Digest challenge; the armed client
    // answers it and gets through.
    fiber::run(async {
        let host = start_host(users_config("digest", true)).await;
        host.add_action("/secret", secret);
        let base = base_url(&host);

        let mut anonymous = WebClient::new();
        let status = anonymous.get(&format!("{}/secret", base)).await.unwrap();
        assert_eq!(status, 401);
        let challenge = anonymous.header("WWW-Authenticate").unwrap();
        assert!(challenge.starts_with("Digest "), "challenge: {}", challenge);
        assert!(challenge.contains("realm=\"app\""));
        assert!(challenge.contains("qop=\"auth\""));
        assert!(challenge.contains("algorithm=SHA-256"));
        assert!(challenge.contains("opaque=\""));

        let mut client = WebClient::new();
        client.set_credentials("u", "secret");
        let status = client.get(&format!("{}/secret", base)).await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(client.response().await.unwrap(), b"top");
    });
}

#[test]
fn test_digest_nonce_replay_is_stale() {
    fiber::run(async {
        let host = start_host(users_config("digest", true)).await;
        host.add_action("/secret", secret);
        let base = base_url(&host);
        let url = format!("{}/secret", base);

        // Draw a challenge and answer it by hand so the exact nc is
        // under test control.
        let mut client = WebClient::new();
        assert_eq!(client.get(&url).await.unwrap(), 401);
        let challenge = Challenge::parse(client.header("WWW-Authenticate").unwrap()).unwrap();
        let Challenge::Digest {
            realm,
            nonce,
            qop,
            opaque,
            algorithm,
            stale,
        } = challenge
        else {
            panic!("expected digest challenge");
        };
        assert!(!stale);

        let authorization = auth::digest_authorization(
            &realm,
            &nonce,
            qop.as_deref(),
            opaque.as_deref(),
            algorithm,
            "u",
            "secret",
            "GET",
            "/secret",
            1,
            "0011223344556677",
        );
        let status = client
            .fetch(Method::Get, &url, &[("Authorization", authorization.as_str())], None)
            .await
            .unwrap();
        assert_eq!(status, 200);
        client.drain().await.unwrap();

        // The same nonce with the same nc is a replay: challenged again
        // with stale=true.
        let status = client
            .fetch(Method::Get, &url, &[("Authorization", authorization.as_str())], None)
            .await
            .unwrap();
        assert_eq!(status, 401);
        let rechallenge = client.header("WWW-Authenticate").unwrap();
        assert!(rechallenge.contains("stale=true"), "got: {}", rechallenge);
    });
}

#[test]
fn test_basic_auth_roundtrip() {
    fiber::run(async {
        let host = start_host(users_config("basic", false)).await;
        host.add_action("/secret", secret);
        let base = base_url(&host);

        let mut client = WebClient::new();
        client.set_credentials("u", "secret");
        let status = client.get(&format!("{}/secret", base)).await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(client.response().await.unwrap(), b"top");

        let mut wrong = WebClient::new();
        wrong.set_credentials("u", "nope");
        let status = wrong.get(&format!("{}/secret", base)).await.unwrap();
        assert_eq!(status, 401);
    });
}

#[test]
fn test_basic_requires_tls_when_configured() {
    fiber::run(async {
        let host = start_host(users_config("basic", true)).await;
        host.add_action("/secret", secret);
        let base = base_url(&host);

        // Credentials are correct, but the connection is cleartext.
        let mut client = WebClient::new();
        client.set_credentials("u", "secret");
        let status = client.get(&format!("{}/secret", base)).await.unwrap();
        assert_eq!(status, 401);
    });
}

#[test]
fn test_role_gate_403() {
    fiber::run(async {
        let host = start_host(users_config("basic", false)).await;
        host.add_action("/secret", secret);
        let base = base_url(&host);

        // Authenticates fine, but "user" does not reach "admin".
        let mut client = WebClient::new();
        client.set_credentials("viewer", "pw");
        let status = client.get(&format!("{}/secret", base)).await.unwrap();
        assert_eq!(status, 403);
    });
}

#[test]
fn test_session_login_grants_access() {
    fiber::run(async {
        let host = start_host(users_config("digest", true)).await;
        host.add_action("/secret", secret);
        host.add_action("/login", login);
        let base = base_url(&host);

        let mut client = WebClient::new();
        let status = client
            .fetch(
                Method::Post,
                &format!("{}/login", base),
                &[("Content-Type", "application/x-www-form-urlencoded")],
                Some(b"username=u&password=secret"),
            )
            .await
            .unwrap();
        assert_eq!(status, 200);
        let cookie = client
            .header("Set-Cookie")
            .and_then(|c| c.split(';').next())
            .expect("session cookie")
            .to_string();
        client.drain().await.unwrap();

        // The session stands in for credentials.
        let status = client
            .fetch(
                Method::Get,
                &format!("{}/secret", base),
                &[("Cookie", cookie.as_str())],
                None,
            )
            .await
            .unwrap();
        assert_eq!(status, 200);
        assert_eq!(client.response().await.unwrap(), b"top");

        // A bad password never creates one.
        let mut failed = WebClient::new();
        let status = failed
            .fetch(
                Method::Post,
                &format!("{}/login", base),
                &[("Content-Type", "application/x-www-form-urlencoded")],
                Some(b"username=u&password=wrong"),
            )
            .await
            .unwrap();
        assert_eq!(status, 401);
    });
}
