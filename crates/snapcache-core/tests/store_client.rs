use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use snapcache_core::api::SearchPage;
use snapcache_core::auth::{build_header, AuthError, Identity, Macaroon, REFRESH_SENTINEL};
use snapcache_core::cache::ResponseCache;
use snapcache_core::{ApiError, Config, RetryConfig, Session, StoreClient};
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn config(server: &MockServer) -> Config {
    Config {
        api_url: server.uri(),
        search_url: server.uri(),
        dashboard_url: server.uri(),
        login_url: server.uri(),
        retry: RetryConfig::default()
            .with_max_retries(2)
            .with_backoff_base(Duration::from_millis(1))
            .with_timeout(Duration::from_millis(800)),
        ..Config::default()
    }
}

fn client(server: &MockServer) -> StoreClient {
    StoreClient::new(config(server)).unwrap()
}

fn discharge(key: &[u8]) -> String {
    Macaroon::new("login.example.com", "caveat-1", key).unwrap().serialize()
}

fn logged_in() -> Session {
    let mut root = Macaroon::new("dashboard", "root-id", b"root-key").unwrap();
    root.add_third_party_caveat("login.example.com", b"vid", "caveat-1").unwrap();

    let mut session = Session::new();
    session.set_root(root.serialize());
    session.complete_login(
        Identity {
            nickname: Some("toto".to_string()),
            ..Default::default()
        },
        discharge(b"discharge-key"),
    );
    session
}

fn authorized_with(expected: String) -> impl Fn(&Request) -> bool + Send + Sync + 'static {
    move |request: &Request| {
        request
            .headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            == Some(expected.as_str())
    }
}

fn refresh_required() -> ResponseTemplate {
    ResponseTemplate::new(401).insert_header("WWW-Authenticate", REFRESH_SENTINEL)
}

// ===== Public catalogue =====

#[tokio::test]
async fn snap_details_served_from_cache_within_window() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/snaps/details/lxd"))
        .and(query_param("channel", "stable"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "snap_id": "abc",
            "title": "LXD",
            "publisher": "Canonical"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let first = client.snap_details("lxd").await.unwrap();
    let second = client.snap_details("lxd").await.unwrap();

    assert_eq!(first.data.snap_id, "abc");
    assert_eq!(second.data.snap_id, "abc");
    assert!(!second.is_stale_due_to_error);
    assert_eq!(client.snap_id("lxd").await.unwrap(), "abc");
}

#[tokio::test]
async fn snap_details_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/snaps/details/nope"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    match client(&server).snap_details("nope").await {
        Err(ApiError::NotFound(message)) => assert_eq!(message, "Snap not found: nope"),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn stale_details_served_when_store_fails() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/snaps/details/lxd"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"snap_id": "abc"})))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    // One attempt plus two retries
    Mock::given(method("GET"))
        .and(path("/api/v1/snaps/details/lxd"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .with_priority(2)
        .mount(&server)
        .await;

    let client = StoreClient::new(Config {
        freshness_window_secs: 0,
        ..config(&server)
    })
    .unwrap();

    assert!(!client.snap_details("lxd").await.unwrap().is_stale_due_to_error);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let stale = client.snap_details("lxd").await.unwrap();
    assert!(stale.is_stale_due_to_error);
    assert_eq!(stale.data.snap_id, "abc");
}

#[tokio::test]
async fn failure_without_cache_propagates() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/snaps/details/lxd"))
        .respond_with(ResponseTemplate::new(502))
        .expect(3)
        .mount(&server)
        .await;

    assert!(matches!(
        client(&server).snap_details("lxd").await,
        Err(ApiError::Unavailable(_))
    ));
}

#[tokio::test]
async fn search_converts_offset_to_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/snaps/search"))
        .and(query_param("q", "editor"))
        .and(query_param("page", "3"))
        .and(query_param("size", "10"))
        .and(query_param("confinement", "strict,classic"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_embedded": {"clickindex:package": [
                {"package_name": "vim-editor", "title": "Vim"},
                {"package_name": "atom", "title": "Atom"}
            ]},
            "total": 22
        })))
        .expect(1)
        .mount(&server)
        .await;

    let results = client(&server)
        .search("editor", SearchPage { size: 10, offset: 25 })
        .await
        .unwrap();
    assert_eq!(results.data.snaps().len(), 2);
}

#[tokio::test]
async fn search_rejects_zero_page_size() {
    let server = MockServer::start().await;
    assert!(matches!(
        client(&server).search("x", SearchPage { size: 0, offset: 0 }).await,
        Err(ApiError::InvalidRequest(_))
    ));
}

#[tokio::test]
async fn featured_snaps_unwrap_embedded_list() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/snaps/search"))
        .and(query_param("section", "featured"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_embedded": {"clickindex:package": [{"package_name": "spotify", "title": "Spotify"}]}
        })))
        .mount(&server)
        .await;

    let featured = client(&server).featured_snaps().await.unwrap();
    assert_eq!(featured.data.len(), 1);
    assert_eq!(featured.data[0].package_name, "spotify");
}

#[tokio::test]
async fn metrics_posts_query_list() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/snaps/metrics"))
        .and(body_json(json!([{
            "metric_name": "installed_base_by_country_percent",
            "snap_id": "abc",
            "start": "2024-03-01",
            "end": "2024-03-08"
        }])))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "metric_name": "installed_base_by_country_percent",
            "buckets": ["2024-03-08"],
            "series": [{"name": "FR", "values": [12.5]}]
        }])))
        .expect(1)
        .mount(&server)
        .await;

    let today = chrono::NaiveDate::from_ymd_opt(2024, 3, 8).unwrap();
    let query = snapcache_core::models::MetricsQuery::installed_base_by_country("abc", today, 7).unwrap();
    let metrics = client(&server).metrics(&[query]).await.unwrap();
    assert_eq!(metrics.data[0].series[0].average(), Some(12.5));
}

// ===== Publisher =====

#[tokio::test]
async fn stale_discharge_is_refreshed_and_request_reissued() {
    let server = MockServer::start().await;
    let mut session = logged_in();
    let root = session.macaroon_root.clone().unwrap();
    let fresh = discharge(b"fresh-key");

    Mock::given(method("GET"))
        .and(path("/dev/api/account"))
        .and(authorized_with(build_header(&root, &fresh).unwrap()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "username": "toto",
            "snaps": {"16": {"hello": {"snap-id": "h"}}}
        })))
        .expect(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/dev/api/account"))
        .respond_with(refresh_required())
        .expect(1)
        .with_priority(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v2/tokens/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"discharge_macaroon": fresh})))
        .expect(1)
        .mount(&server)
        .await;

    let account = client(&server).account(&mut session).await.unwrap();
    assert_eq!(account.data.username.as_deref(), Some("toto"));
    assert_eq!(account.data.snap_names("16"), vec!["hello"]);
    assert_eq!(session.macaroon_discharge.as_deref(), Some(fresh.as_str()));
}

#[tokio::test]
async fn refresh_cycles_are_capped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dev/api/account"))
        .respond_with(refresh_required())
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v2/tokens/refresh"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"discharge_macaroon": discharge(b"fresh-key")})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let mut session = logged_in();
    assert!(matches!(
        client(&server).account(&mut session).await,
        Err(ApiError::MacaroonRefreshRequired(1))
    ));
}

#[tokio::test]
async fn refresh_service_failure_surfaces_as_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dev/api/account"))
        .respond_with(refresh_required())
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v2/tokens/refresh"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let mut session = logged_in();
    assert!(matches!(
        client(&server).account(&mut session).await,
        Err(ApiError::Auth(AuthError::AuthService(_)))
    ));
}

#[tokio::test]
async fn unauthorized_with_valid_account_is_forbidden() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dev/api/snaps/abc/status"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/dev/api/acl/verify/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "account": {"username": "toto"},
            "allowed": false
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut session = logged_in();
    assert!(matches!(
        client(&server).snap_status(&mut session, "abc").await,
        Err(ApiError::Forbidden(_))
    ));
    assert!(session.is_authenticated());
}

#[tokio::test]
async fn unknown_account_clears_session() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dev/api/snaps/abc/metadata"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/dev/api/acl/verify/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"account": null, "allowed": false})))
        .mount(&server)
        .await;

    let mut session = logged_in();
    assert!(matches!(
        client(&server).snap_metadata(&mut session, "abc").await,
        Err(ApiError::Auth(AuthError::NotAuthenticated))
    ));
    assert_eq!(session, Session::default());
}

#[tokio::test]
async fn missing_snap_for_valid_account_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dev/api/snaps/gone/status"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/dev/api/acl/verify/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "account": {"username": "toto"},
            "allowed": true
        })))
        .mount(&server)
        .await;

    let mut session = logged_in();
    assert!(matches!(
        client(&server).snap_status(&mut session, "gone").await,
        Err(ApiError::NotFound(_))
    ));
}

#[tokio::test]
async fn unsigned_agreement_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dev/api/account"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error_list": [{"code": "user-not-ready", "message": "Developer has not signed agreement."}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/dev/api/acl/verify/"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let mut session = logged_in();
    assert!(matches!(
        client(&server).account(&mut session).await,
        Err(ApiError::AgreementNotSigned)
    ));
}

#[tokio::test]
async fn missing_username_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dev/api/account"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error_list": [{"code": "user-not-ready", "message": "Developer profile is missing namespace."}]
        })))
        .mount(&server)
        .await;

    let mut session = logged_in();
    assert!(matches!(
        client(&server).account(&mut session).await,
        Err(ApiError::MissingUsername)
    ));
}

#[tokio::test]
async fn metadata_update_sends_whitelisted_fields_uncached() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/dev/api/snaps/abc/metadata"))
        .and(body_json(json!({"title": "Better title"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"title": "Better title"})))
        .expect(2)
        .mount(&server)
        .await;

    let client = client(&server);
    let mut session = logged_in();
    let changes = json!({"title": "Better title", "snap_id": "abc"});
    let changes = changes.as_object().unwrap();

    for _ in 0..2 {
        let updated = client
            .update_snap_metadata(&mut session, "abc", changes)
            .await
            .unwrap();
        assert_eq!(updated["title"], "Better title");
    }
    assert!(client.accessor().cache().is_empty().await);
}

#[tokio::test]
async fn invalid_stored_credentials_log_out() {
    let server = MockServer::start().await;
    let mut session = logged_in();
    session.set_discharge("not a macaroon".to_string());

    assert!(matches!(
        client(&server).account(&mut session).await,
        Err(ApiError::Auth(AuthError::InvalidCredential(_)))
    ));
    assert!(!session.is_authenticated());
}

#[tokio::test]
async fn begin_login_stores_root_and_returns_caveat() {
    let server = MockServer::start().await;
    let host = url::Url::parse(&server.uri()).unwrap().host_str().unwrap().to_string();
    let mut root = Macaroon::new("dashboard", "root-id", b"root-key").unwrap();
    root.add_third_party_caveat(&host, b"vid", "login-caveat").unwrap();

    Mock::given(method("POST"))
        .and(path("/dev/api/acl/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"macaroon": root.serialize()})))
        .expect(1)
        .mount(&server)
        .await;

    let mut session = Session::new();
    let caveat = client(&server).begin_login(&mut session).await.unwrap();
    assert_eq!(caveat, "login-caveat");
    assert_eq!(session.macaroon_root, Some(root.serialize()));
    assert!(!session.is_authenticated());
}

#[tokio::test]
async fn account_is_cached_in_memory_only() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dev/api/account"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"username": "toto"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/snaps/details/lxd"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"snap_id": "abc"})))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(ResponseCache::persistent(dir.path().to_path_buf()).unwrap());
    let client = StoreClient::with_cache(config(&server), cache).unwrap();
    let mut session = logged_in();

    client.account(&mut session).await.unwrap();
    let second = client.account(&mut session).await.unwrap();
    assert_eq!(second.data.username.as_deref(), Some("toto"));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

    client.snap_details("lxd").await.unwrap();
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
}

#[tokio::test]
async fn unreachable_store_without_cache_is_unavailable() {
    // Bind then release a port so nothing is listening on it
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);
    let config = Config {
        api_url: url,
        retry: RetryConfig::default()
            .with_max_retries(1)
            .with_backoff_base(Duration::from_millis(1))
            .with_timeout(Duration::from_millis(800)),
        ..Config::default()
    };

    match StoreClient::new(config).unwrap().snap_details("lxd").await {
        Err(ApiError::Unavailable(_)) => {}
        other => panic!("unexpected {:?}", other),
    }
}
