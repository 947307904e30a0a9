//! In-process tests of the gateway router against a live backend
//!
//! Requests are driven through the router with `oneshot`; the backend is a
//! small axum app on an ephemeral port that echoes what it received.

use api_gateway::{
    api::{router, AppState, Stores},
    auth::{hash_password, issue_token},
    config::GatewayConfig,
    model::{LogFilter, NewService, NewUser, Role, ServiceStatus, Visibility},
    proxy::ProxyForwarder,
    store::{LogStore, MemoryCounterStore, MemoryStore, Page, ServiceStore, UserStore},
};
use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode, Uri},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tower::ServiceExt;

const SECRET: &str = "gateway-test-secret";

#[derive(Clone, Default)]
struct Seen(Arc<Mutex<Vec<HeaderMap>>>);

impl Seen {
    fn last(&self) -> HeaderMap {
        self.0.lock().unwrap().last().cloned().expect("backend saw no request")
    }

    fn count(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

async fn echo(State(seen): State<Seen>, uri: Uri, headers: HeaderMap) -> Json<Value> {
    seen.0.lock().unwrap().push(headers);
    Json(json!({ "path": uri.path(), "query": uri.query() }))
}

async fn slow() -> &'static str {
    tokio::time::sleep(Duration::from_secs(5)).await;
    "late"
}

async fn spawn_backend() -> (String, Seen) {
    let seen = Seen::default();
    let app = Router::new()
        .route("/slow", get(slow))
        .route("/plain", get(|| async { "not json" }))
        .fallback(echo)
        .with_state(seen.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), seen)
}

/// Raw backend that answers 404 with a 100-byte JSON body, sends 5 bytes and hangs up
async fn spawn_truncating_backend() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            let head = "HTTP/1.1 404 Not Found\r\n\
                        Content-Type: application/json\r\n\
                        Content-Length: 100\r\n\r\n";
            socket.write_all(head.as_bytes()).await.ok();
            socket.write_all(b"{\"err").await.ok();
            socket.shutdown().await.ok();
        }
    });
    format!("http://{}", addr)
}

struct Harness {
    app: Router,
    state: AppState,
    store: Arc<MemoryStore>,
    backend: String,
    seen: Seen,
}

impl Harness {
    async fn new() -> Self {
        Self::with_global_limit(1000).await
    }

    async fn with_global_limit(global_limit: u32) -> Self {
        let (backend, seen) = spawn_backend().await;
        let store = Arc::new(MemoryStore::new());
        for (username, role) in [
            ("admin", Role::Admin),
            ("alice", Role::Developer),
            ("bob", Role::Developer),
            ("victor", Role::Viewer),
        ] {
            store
                .insert_user(NewUser {
                    username: username.to_string(),
                    email: format!("{}@example.com", username),
                    full_name: None,
                    password_hash: hash_password("s3cret", 4).unwrap(),
                    role,
                    is_active: true,
                })
                .await
                .unwrap();
        }

        let mut config = GatewayConfig::parse(&format!(
            "[auth]\njwt_secret = \"{}\"\npassword_hash_cost = 4\n",
            SECRET
        ))
        .unwrap();
        config.rate_limit.global_limit = global_limit;

        let forwarder = Arc::new(ProxyForwarder::new(Duration::from_millis(500)).unwrap());
        let counters = Arc::new(MemoryCounterStore::new());
        let (state, _writer) = AppState::new(
            config,
            Stores::memory(store.clone()),
            Some(counters),
            forwarder,
        );
        state.health.set_ready(true);

        Self {
            app: router(state.clone()),
            state,
            store,
            backend,
            seen,
        }
    }

    async fn user_id(&self, username: &str) -> i64 {
        self.store
            .user_by_username(username)
            .await
            .unwrap()
            .unwrap()
            .id
    }

    async fn register(&self, owner: &str, service: Value) -> i64 {
        self.register_at(owner, &self.backend, service).await
    }

    async fn register_at(&self, owner: &str, base_url: &str, service: Value) -> i64 {
        let mut service = service;
        service["base_url"] = json!(base_url);
        let new: NewService = serde_json::from_value(service).unwrap();
        let owner_id = self.user_id(owner).await;
        self.store.insert_service(owner_id, new).await.unwrap().id
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, headers, body)
    }

    async fn logs(&self) -> Vec<api_gateway::model::AccessLogRecord> {
        self.state.logger.flush().await;
        self.store.find_logs(&LogFilter::default()).await.unwrap()
    }
}

fn token(username: &str) -> String {
    format!("Bearer {}", issue_token(username, SECRET, 60).unwrap())
}

fn get_as(uri: &str, username: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("authorization", token(username))
        .body(Body::empty())
        .unwrap()
}

fn json_as(method: &str, uri: &str, username: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", token(username))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_forwarding_applies_header_allow_list() {
    let h = Harness::new().await;
    h.register(
        "alice",
        json!({
            "name": "orders",
            "base_url": "",
            "forward_headers": ["X-Request-Id"],
            "auth_header_name": "X-User-Id",
        }),
    )
    .await;

    let request = Request::builder()
        .uri("/gateway/orders/items/42?expand=lines")
        .header("authorization", token("alice"))
        .header("x-request-id", "req-1")
        .header("x-internal", "secret")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = h.send(request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["path"], "/items/42");
    assert_eq!(body["query"], "expand=lines");

    let seen = h.seen.last();
    assert_eq!(seen["x-request-id"], "req-1");
    assert_eq!(seen["x-api-gateway"], "true");
    let alice = h.user_id("alice").await;
    assert_eq!(seen["x-user-id"], alice.to_string().as_str());
    assert!(seen.get("x-internal").is_none());
    assert!(seen.get("authorization").is_none());

    let logs = h.logs().await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status_code, 200);
    assert_eq!(logs[0].user_id, Some(alice));
    assert_eq!(logs[0].path, "/gateway/orders/items/42");
    assert_eq!(logs[0].query_params["expand"], "lines");
    assert_eq!(logs[0].headers["authorization"], "[redacted]");
}

#[tokio::test]
async fn test_api_key_identity_is_injected() {
    let h = Harness::new().await;
    h.register(
        "alice",
        json!({ "name": "orders", "base_url": "", "auth_header_name": "X-Caller" }),
    )
    .await;

    let (status, _, key) = h
        .send(json_as(
            "POST",
            "/api/auth/api-keys",
            "alice",
            json!({ "name": "ci" }),
        ))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let value = key["key"].as_str().unwrap().to_string();
    assert_eq!(value.len(), 32);

    let request = Request::builder()
        .uri("/gateway/orders")
        .header("x-api-key", &value)
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = h.send(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(h.seen.last()["x-caller"], format!("ApiKey {}", value).as_str());

    let logs = h.logs().await;
    assert_eq!(logs[0].api_key_id, key["id"].as_i64());
    assert_eq!(logs[0].headers["x-api-key"], "[redacted]");
}

#[tokio::test]
async fn test_backend_timeout_is_bad_gateway() {
    let h = Harness::new().await;
    let id = h
        .register(
            "alice",
            json!({
                "name": "slowpoke",
                "base_url": "",
                "visibility": "public",
                "require_authentication": false,
            }),
        )
        .await;

    let request = Request::builder()
        .uri("/gateway/slowpoke/slow")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = h.send(request).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["detail"], "Service timeout");

    let logs = h.logs().await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status_code, 502);
    assert_eq!(logs[0].service_id, Some(id));
    assert_eq!(logs[0].error.as_deref(), Some("Service timeout"));
}

#[tokio::test]
async fn test_non_json_backend_body_is_dropped() {
    let h = Harness::new().await;
    h.register(
        "alice",
        json!({
            "name": "plain",
            "base_url": "",
            "visibility": "public",
            "require_authentication": false,
        }),
    )
    .await;

    let request = Request::builder()
        .uri("/gateway/plain/plain")
        .body(Body::empty())
        .unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("content-type").is_none());
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert!(bytes.is_empty());
}

#[tokio::test]
async fn test_truncated_backend_body_keeps_backend_status() {
    let h = Harness::new().await;
    let backend = spawn_truncating_backend().await;
    h.register_at(
        "alice",
        &backend,
        json!({
            "name": "flaky",
            "visibility": "public",
            "require_authentication": false,
        }),
    )
    .await;

    let request = Request::builder()
        .uri("/gateway/flaky/items/1")
        .body(Body::empty())
        .unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(response.headers().get("content-type").is_none());
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert!(bytes.is_empty());

    let logs = h.logs().await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status_code, 404);
}

#[tokio::test]
async fn test_private_service_of_another_owner_is_not_found() {
    let h = Harness::new().await;
    h.register("alice", json!({ "name": "orders", "base_url": "" }))
        .await;

    let (status, _, body) = h.send(get_as("/gateway/orders", "bob")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["detail"], "Service 'orders' not found");
    assert_eq!(h.seen.count(), 0);
}

#[tokio::test]
async fn test_rate_limit_per_user() {
    let h = Harness::new().await;
    h.register(
        "alice",
        json!({ "name": "orders", "base_url": "", "visibility": "public", "rate_limit": 1 }),
    )
    .await;

    let (first, _, _) = h.send(get_as("/gateway/orders", "alice")).await;
    let (second, headers, body) = h.send(get_as("/gateway/orders", "alice")).await;
    // a different caller has its own window
    let (other, _, _) = h.send(get_as("/gateway/orders", "bob")).await;

    assert_eq!(first, StatusCode::OK);
    assert_eq!(second, StatusCode::TOO_MANY_REQUESTS);
    assert!(headers.contains_key("retry-after"));
    assert!(body["detail"]
        .as_str()
        .unwrap()
        .starts_with("Rate limit exceeded. Try again in"));
    assert_eq!(other, StatusCode::OK);
    assert_eq!(h.seen.count(), 2);
}

#[tokio::test]
async fn test_login_and_token_use() {
    let h = Harness::new().await;

    let login = |password: &str| {
        Request::builder()
            .method("POST")
            .uri("/api/auth/login")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(format!("username=alice&password={}", password)))
            .unwrap()
    };

    let (status, headers, _) = h.send(login("wrong")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(headers["www-authenticate"], "Bearer");

    let (status, _, body) = h.send(login("s3cret")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["token_type"], "bearer");
    let access_token = body["access_token"].as_str().unwrap();

    let request = Request::builder()
        .uri("/api/services")
        .header("authorization", format!("Bearer {}", access_token))
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = h.send(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 0);

    let anonymous = Request::builder()
        .uri("/api/services")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = h.send(anonymous).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["detail"], "Not authenticated");
}

#[tokio::test]
async fn test_register_requires_admin() {
    let h = Harness::new().await;
    let user = json!({
        "username": "carol",
        "email": "carol@example.com",
        "password": "hunter22",
        "role": "service_owner",
    });

    let (status, _, _) = h
        .send(json_as("POST", "/api/auth/register", "alice", user.clone()))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _, body) = h
        .send(json_as("POST", "/api/auth/register", "admin", user.clone()))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["username"], "carol");
    assert_eq!(body["role"], "service_owner");
    assert!(body.get("password_hash").is_none());

    let (status, _, _) = h
        .send(json_as("POST", "/api/auth/register", "admin", user))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_admin_user_management() {
    let h = Harness::new().await;

    let (status, _, _) = h.send(get_as("/api/admin/users", "alice")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _, page) = h
        .send(get_as("/api/admin/users?page=2&size=3", "admin"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 4);
    assert_eq!(page["pages"], 2);
    assert_eq!(page["items"][0]["username"], "victor");
    assert!(page["items"][0].get("password_hash").is_none());

    let (status, _, _) = h
        .send(get_as("/api/admin/users?page=18446744073709551615&size=100", "admin"))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let bob = h.user_id("bob").await;
    let path = format!("/api/admin/users/{}", bob);
    let (status, _, user) = h.send(get_as(&path, "admin")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(user["email"], "bob@example.com");

    let (status, _, user) = h
        .send(json_as(
            "PUT",
            &path,
            "admin",
            json!({ "role": "service_owner", "email": null, "password": "changed" }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(user["role"], "service_owner");
    assert_eq!(user["email"], "bob@example.com");
    let stored = h.store.user_by_id(bob).await.unwrap().unwrap();
    assert!(api_gateway::auth::verify_password("changed", &stored.password_hash));

    // a deactivated user's token stops resolving
    let (status, _, _) = h
        .send(json_as("PUT", &path, "admin", json!({ "is_active": false })))
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, body) = h.send(get_as("/api/services", "bob")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["detail"], "Inactive user");

    let admin = h.user_id("admin").await;
    let (status, _, body) = h
        .send(json_as(
            "DELETE",
            &format!("/api/admin/users/{}", admin),
            "admin",
            json!({}),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "Cannot delete yourself");

    let (status, _, _) = h.send(json_as("DELETE", &path, "admin", json!({}))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _, body) = h.send(get_as(&path, "admin")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["detail"], "User not found");
    let (status, _, _) = h.send(json_as("DELETE", &path, "admin", json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _, _) = h
        .send(json_as("PUT", &path, "admin", json!({ "full_name": "Bob" })))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_api_key_listing_and_revocation() {
    let h = Harness::new().await;
    for name in ["one", "two", "three"] {
        h.send(json_as(
            "POST",
            "/api/auth/api-keys",
            "alice",
            json!({ "name": name }),
        ))
        .await;
    }

    let (status, _, page) = h
        .send(get_as("/api/auth/api-keys?page=2&size=2", "alice"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 3);
    assert_eq!(page["pages"], 2);
    assert_eq!(page["items"].as_array().unwrap().len(), 1);
    assert_eq!(page["has_next"], false);
    assert_eq!(page["has_prev"], true);

    let (status, _, _) = h
        .send(get_as("/api/auth/api-keys?size=500", "alice"))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, _, first) = h.send(get_as("/api/auth/api-keys", "alice")).await;
    let id = first["items"][0]["id"].as_i64().unwrap();
    let value = first["items"][0]["key"].as_str().unwrap().to_string();

    // bob cannot revoke alice's key
    let (status, _, body) = h
        .send(json_as("DELETE", &format!("/api/auth/api-keys/{}", id), "bob", json!({})))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["detail"], "API key not found");

    let (status, _, _) = h
        .send(json_as("DELETE", &format!("/api/auth/api-keys/{}", id), "alice", json!({})))
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let request = Request::builder()
        .uri("/api/services")
        .header("x-api-key", value)
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = h.send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(headers["www-authenticate"], "ApiKey");
    assert_eq!(body["detail"], "Invalid API key");
}

#[tokio::test]
async fn test_service_lifecycle() {
    let h = Harness::new().await;
    let create = json!({
        "name": "billing",
        "base_url": h.backend,
        "visibility": "private",
        "rate_limit": 10,
    });

    let (status, _, _) = h
        .send(json_as("POST", "/api/services", "victor", create.clone()))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _, created) = h
        .send(json_as("POST", "/api/services", "alice", create.clone()))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = created["id"].as_i64().unwrap();
    assert_eq!(created["status"], "active");
    assert_eq!(created["require_authentication"], true);

    let (status, _, _) = h
        .send(json_as("POST", "/api/services", "alice", create))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = h
        .send(json_as(
            "POST",
            "/api/services",
            "alice",
            json!({ "name": "bad", "base_url": "ftp://nowhere" }),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let path = format!("/api/services/{}", id);
    let (status, _, _) = h.send(get_as(&path, "bob")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _, _) = h.send(get_as(&path, "admin")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, updated) = h
        .send(json_as(
            "PUT",
            &path,
            "alice",
            json!({ "status": "maintenance", "description": null }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["status"], "maintenance");
    assert_eq!(updated["name"], "billing");
    assert_eq!(updated["rate_limit"], 10);

    let (status, _, body) = h.send(get_as("/gateway/billing", "alice")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["detail"], "Service 'billing' is maintenance");

    let (status, _, _) = h
        .send(json_as("PUT", &path, "bob", json!({ "status": "active" })))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _, list) = h
        .send(get_as("/api/services?status=maintenance", "alice"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["total"], 1);
    let (_, _, list) = h.send(get_as("/api/services", "bob")).await;
    assert_eq!(list["total"], 0);
    let (_, _, list) = h.send(get_as("/api/services", "admin")).await;
    assert_eq!(list["total"], 1);

    h.state.logger.flush().await;
    let (status, _, stats) = h
        .send(get_as(&format!("{}/stats", path), "alice"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["name"], "billing");
    assert_eq!(stats["total_requests"], 1);
    assert_eq!(stats["success_rate"], 0.0);

    let (status, _, _) = h.send(json_as("DELETE", &path, "alice", json!({}))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _, _) = h.send(get_as(&path, "alice")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(h.store.service_by_id(id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_monitoring_logs_and_stats() {
    let h = Harness::new().await;
    let id = h
        .register(
            "alice",
            json!({ "name": "orders", "base_url": "", "visibility": "public" }),
        )
        .await;

    h.send(get_as("/gateway/orders/a", "alice")).await;
    h.send(get_as("/gateway/orders/a", "alice")).await;
    h.send(get_as("/gateway/missing", "alice")).await;
    h.state.logger.flush().await;

    let (status, _, _) = h.send(get_as("/api/monitoring/logs", "alice")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _, logs) = h
        .send(get_as("/api/monitoring/logs?status_code=404", "admin"))
        .await;
    assert_eq!(status, StatusCode::OK);
    let logs = logs.as_array().unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0]["path"], "/gateway/missing");

    let (status, _, _) = h
        .send(get_as("/api/monitoring/logs?limit=0", "admin"))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, stats) = h
        .send(get_as(
            &format!("/api/monitoring/stats?service_id={}", id),
            "alice",
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["total_requests"], 2);
    assert_eq!(stats["success_rate"], 100.0);
    assert_eq!(stats["status_code_distribution"]["2xx"], 2);
    assert_eq!(stats["top_endpoints"][0]["path"], "/gateway/orders/a");
    assert_eq!(stats["top_endpoints"][0]["count"], 2);
}

fn anonymous(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_global_shedding_runs_before_service_resolution() {
    let h = Harness::with_global_limit(2).await;

    for _ in 0..2 {
        let (status, _, body) = h.send(anonymous("/gateway/nowhere")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["detail"], "Service 'nowhere' not found");
    }

    let (status, headers, body) = h.send(anonymous("/gateway/nowhere")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(headers.contains_key("retry-after"));
    assert_eq!(body["detail"], "Too many requests");

    // an authenticated caller is shed under its own key
    let (status, _, _) = h.send(get_as("/gateway/nowhere", "alice")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let logs = h.logs().await;
    assert_eq!(logs.len(), 4);
    assert_eq!(logs.iter().filter(|r| r.status_code == 429).count(), 1);
}

#[tokio::test]
async fn test_management_routes_are_shed_by_client_ip() {
    let h = Harness::with_global_limit(2).await;

    for _ in 0..2 {
        let (status, _, body) = h.send(anonymous("/api/services")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["detail"], "Not authenticated");
    }

    // a valid token does not help: management shedding keys on the address
    let (status, headers, body) = h.send(get_as("/api/services", "alice")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(headers.contains_key("retry-after"));
    assert_eq!(body["detail"], "Too many requests");
}

#[tokio::test]
async fn test_health_and_metrics_routes() {
    let h = Harness::new().await;

    let request = Request::builder()
        .uri("/health/ready")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = h.send(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    h.state.health.set_ready(false);
    let request = Request::builder()
        .uri("/health/ready")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = h.send(request).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    h.send(get_as("/gateway/missing", "alice")).await;
    let response = h
        .app
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let text = String::from_utf8(
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec(),
    )
    .unwrap();
    assert!(text.contains("gateway_rejections_total"));
    assert!(text.contains("stage=\"resolve\""));
}

#[tokio::test]
async fn test_seeded_config_is_routable() {
    let config = GatewayConfig::parse(&format!(
        r#"
[auth]
jwt_secret = "{SECRET}"

[[users]]
username = "ops"
password_hash = "{hash}"
role = "service_owner"

[[services]]
owner = "ops"
name = "status"
base_url = "http://127.0.0.1:9"
status = "inactive"
visibility = "public"
require_authentication = false
"#,
        hash = hash_password("pw", 4).unwrap()
    ))
    .unwrap();

    let store = Arc::new(MemoryStore::new());
    config.seed(&store).await.unwrap();
    let services = store
        .list_services(&Default::default(), Page::numbered(1, 10).unwrap())
        .await
        .unwrap();
    assert_eq!(services.1, 1);
    assert_eq!(services.0[0].status, ServiceStatus::Inactive);
    assert_eq!(services.0[0].visibility, Visibility::Public);

    let forwarder = Arc::new(ProxyForwarder::new(Duration::from_secs(1)).unwrap());
    let (state, _writer) = AppState::new(config, Stores::memory(store), None, forwarder);
    let response = router(state)
        .oneshot(
            Request::builder()
                .uri("/gateway/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_cors_preflight_allows_any_origin() {
    let h = Harness::new().await;
    let request = Request::builder()
        .method("OPTIONS")
        .uri("/api/services")
        .header("origin", "https://console.example.com")
        .header("access-control-request-method", "GET")
        .body(Body::empty())
        .unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["access-control-allow-origin"], "*");
}
