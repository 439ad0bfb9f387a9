use std::path::Path;

use serde_json::json;
use tempfile::TempDir;

use xhs_core::{
    load_worker_config, LoginStatusResponse, PublishKind, PublishRequest, QrLoginResponse,
    SessionService,
};

fn service_in(root: &TempDir) -> SessionService {
    let fixture = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/worker.toml");
    let mut config = load_worker_config(fixture).expect("fixture should parse");
    config.paths.data_dir = root.path().to_string_lossy().into_owned();
    SessionService::new(config).expect("service init")
}

#[tokio::test]
async fn unknown_users_poll_as_not_found() {
    let tmp = TempDir::new().expect("tempdir");
    let service = service_in(&tmp);

    let status = service.poll_login_status("ghost").await.expect("poll");
    assert!(matches!(status, LoginStatusResponse::NotFound));
}

#[tokio::test]
async fn closing_an_unknown_session_reports_nothing_closed() {
    let tmp = TempDir::new().expect("tempdir");
    let service = service_in(&tmp);

    assert!(!service.close_session("ghost").await.closed);
    assert!(!service.close_session("ghost").await.closed);
}

#[tokio::test]
async fn cookie_sync_without_an_active_session_is_inactive() {
    let tmp = TempDir::new().expect("tempdir");
    let service = service_in(&tmp);

    let sync = service.sync_cookies("ghost").await.expect("sync");
    assert!(!sync.active);
    assert_eq!(sync.synced, 0);
}

#[tokio::test]
async fn verifying_an_empty_cookie_bundle_fails_without_a_browser() {
    let tmp = TempDir::new().expect("tempdir");
    let service = service_in(&tmp);

    let err = service
        .verify_cookies("creator-7", Vec::new(), None)
        .await
        .expect_err("empty bundle must fail");
    assert_eq!(err.caller_message(), "Cookie expired or not logged in");

    let health = service.health();
    assert_eq!(health.pool.checked_out, 0);
    assert_eq!(health.pool.available, 0);
    let cache = service
        .config()
        .users_root()
        .join("creator-7")
        .join("cookie_cache.json");
    assert!(!cache.exists());
}

#[tokio::test]
async fn publish_without_a_stored_login_fails_without_a_browser() {
    let tmp = TempDir::new().expect("tempdir");
    let service = service_in(&tmp);
    let request = PublishRequest {
        kind: PublishKind::Images,
        sources: vec!["pic.jpg".to_string()],
        title: "标题".to_string(),
        description: String::new(),
    };

    let response = service.publish("creator-7", request).await.expect("publish");

    assert!(!response.success);
    assert_eq!(response.message, "Cookie expired or not logged in");
    assert!(response.screenshot.is_none());

    // Failed publish went through a full checkout cycle and was not kept.
    let health = service.health();
    assert_eq!(health.pool.checked_out, 0);
    assert_eq!(health.pool.available, 0);
    assert_eq!(health.publish_slots_free, 2);
    assert_eq!(health.metrics.publishes, 1);
    assert_eq!(health.metrics.publish_failures, 1);

    // The run also hit the diagnostics sinks.
    assert!(service.config().failure_log_path().exists());
    assert!(service.config().runs_db_path().exists());
}

#[tokio::test]
async fn wiping_an_inactive_user_clears_the_profile_directory() {
    let tmp = TempDir::new().expect("tempdir");
    let service = service_in(&tmp);
    let profile_dir = service.config().users_root().join("creator-7");
    std::fs::create_dir_all(&profile_dir).expect("seed profile");
    std::fs::write(profile_dir.join("cookie_cache.json"), b"{}").expect("seed cache");

    assert!(service.wipe_user_data("creator-7").await.expect("wipe").wiped);
    assert!(!profile_dir.exists());

    // Wiping again is fine: unknown users wipe to the same end state.
    assert!(service.wipe_user_data("creator-7").await.expect("wipe").wiped);
}

#[tokio::test]
async fn health_reflects_the_configured_limits() {
    let tmp = TempDir::new().expect("tempdir");
    let service = service_in(&tmp);

    let health = service.health();
    assert_eq!(health.pool.capacity, 3);
    assert_eq!(health.pool.available, 0);
    assert_eq!(health.pool.checked_out, 0);
    assert_eq!(health.publish_slots_free, 2);
    assert_eq!(health.metrics.qr_requests, 0);
}

#[test]
fn responses_serialize_with_snake_case_status_tags() {
    let ready = QrLoginResponse::QrReady {
        image_base64: "aGk=".to_string(),
        source: "canvas".to_string(),
        degraded: false,
        expires_in_seconds: 90,
    };
    assert_eq!(
        serde_json::to_value(&ready).expect("serialize"),
        json!({
            "status": "qr_ready",
            "image_base64": "aGk=",
            "source": "canvas",
            "degraded": false,
            "expires_in_seconds": 90,
        })
    );
    assert_eq!(
        serde_json::to_value(QrLoginResponse::AlreadyLoggedIn).expect("serialize"),
        json!({"status": "already_logged_in"})
    );
    assert_eq!(
        serde_json::to_value(LoginStatusResponse::Waiting).expect("serialize"),
        json!({"status": "waiting"})
    );
}
