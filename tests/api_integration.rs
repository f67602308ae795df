//! End-to-end API tests over the assembled router with an in-memory hub.

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Method, Request, StatusCode};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use smartly_bridge::auth::compute_signature;
use smartly_bridge::credentials::{Credentials, TrustProxyMode};
use smartly_bridge::hub::{
    AreaEntry, DeviceEntry, EntityEntry, FloorEntry, HistoryState, MemoryHub, StateSnapshot,
};
use smartly_bridge::web_api::create_router;
use smartly_bridge::{AppConfig, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const SECRET: &str = "integration-secret";
const CLIENT_ID: &str = "ha_integration";

fn test_config(allowed_cidrs: &str, trust_proxy: TrustProxyMode, go2rtc_url: &str) -> AppConfig {
    AppConfig {
        host: "127.0.0.1".into(),
        port: 0,
        hub_url: "http://localhost:8123".into(),
        hub_token: String::new(),
        go2rtc_url: go2rtc_url.into(),
        push_batch_interval: Duration::from_millis(500),
        credentials: Credentials {
            instance_id: "home-test".into(),
            client_id: CLIENT_ID.into(),
            client_secret: SECRET.into(),
            allowed_cidrs: smartly_bridge::credentials::parse_cidrs(allowed_cidrs),
            webhook_url: String::new(),
            trust_proxy,
            turn: None,
        },
    }
}

fn test_state(hub: Arc<MemoryHub>) -> AppState {
    AppState::new(
        test_config("", TrustProxyMode::Never, "http://localhost:1984"),
        hub,
    )
}

fn snapshot(entity_id: &str, state: &str, attributes: Value) -> StateSnapshot {
    StateSnapshot {
        entity_id: entity_id.into(),
        state: state.into(),
        attributes: attributes.as_object().cloned().unwrap_or_default(),
        last_changed: Utc::now(),
        last_updated: Utc::now(),
    }
}

fn labeled_entity(entity_id: &str) -> EntityEntry {
    EntityEntry {
        entity_id: entity_id.into(),
        labels: vec!["smartly".into()],
        ..Default::default()
    }
}

struct Signed {
    nonce: String,
    timestamp: String,
}

impl Signed {
    fn fresh() -> Self {
        Self {
            nonce: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now().timestamp().to_string(),
        }
    }
}

fn build_request(
    method: Method,
    path_and_query: &str,
    body: Option<&Value>,
    signed: &Signed,
    peer: SocketAddr,
    extra_headers: &[(&str, &str)],
) -> Request<Body> {
    let body_bytes = body
        .map(|v| serde_json::to_vec(v).unwrap())
        .unwrap_or_default();
    let signature = compute_signature(
        SECRET,
        method.as_str(),
        path_and_query,
        &signed.timestamp,
        &signed.nonce,
        &body_bytes,
    );

    let mut builder = Request::builder()
        .method(method)
        .uri(path_and_query)
        .header("X-Client-Id", CLIENT_ID)
        .header("X-Timestamp", &signed.timestamp)
        .header("X-Nonce", &signed.nonce)
        .header("X-Signature", signature)
        .header("Content-Type", "application/json");
    for (name, value) in extra_headers {
        builder = builder.header(*name, *value);
    }

    let mut request = builder.body(Body::from(body_bytes)).unwrap();
    request.extensions_mut().insert(ConnectInfo(peer));
    request
}

fn peer() -> SocketAddr {
    SocketAddr::from(([192, 168, 1, 50], 40000))
}

async fn send(
    app: &axum::Router,
    method: Method,
    path: &str,
    body: Option<&Value>,
) -> (StatusCode, Value) {
    let request = build_request(method, path, body, &Signed::fresh(), peer(), &[]);
    let resp = app.clone().oneshot(request).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

// ---- auth ---------------------------------------------------------------

#[tokio::test]
async fn unsigned_request_is_rejected() {
    let app = create_router(test_state(Arc::new(MemoryHub::new())));
    let mut request = Request::builder()
        .method(Method::GET)
        .uri("/api/smartly/sync/states")
        .body(Body::empty())
        .unwrap();
    request.extensions_mut().insert(ConnectInfo(peer()));

    let resp = app.oneshot(request).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value["error"], json!("missing_headers"));
}

#[tokio::test]
async fn tampered_signature_is_rejected() {
    let app = create_router(test_state(Arc::new(MemoryHub::new())));
    let signed = Signed::fresh();
    let mut request = build_request(
        Method::GET,
        "/api/smartly/sync/states",
        None,
        &signed,
        peer(),
        &[],
    );
    request
        .headers_mut()
        .insert("X-Signature", "0".repeat(64).parse().unwrap());

    let resp = app.oneshot(request).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn replayed_request_is_rejected() {
    let hub = Arc::new(MemoryHub::new());
    let app = create_router(test_state(hub));
    let signed = Signed::fresh();

    let first = build_request(Method::GET, "/api/smartly/sync/states", None, &signed, peer(), &[]);
    let resp = app.clone().oneshot(first).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let replay = build_request(Method::GET, "/api/smartly/sync/states", None, &signed, peer(), &[]);
    let resp = app.oneshot(replay).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value["error"], json!("nonce_reused"));
}

#[tokio::test]
async fn cidr_allow_list_and_forwarded_header() {
    let hub = Arc::new(MemoryHub::new());
    let config = test_config("203.0.113.0/24", TrustProxyMode::Auto, "http://localhost:1984");
    let app = create_router(AppState::new(config, hub));

    // private peer, public allow-list: the forwarded hop is trusted
    let allowed = build_request(
        Method::GET,
        "/api/smartly/sync/states",
        None,
        &Signed::fresh(),
        SocketAddr::from(([10, 0, 0, 1], 1234)),
        &[("X-Forwarded-For", "203.0.113.50")],
    );
    let resp = app.clone().oneshot(allowed).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // forwarded hop outside the allow-list
    let denied = build_request(
        Method::GET,
        "/api/smartly/sync/states",
        None,
        &Signed::fresh(),
        SocketAddr::from(([10, 0, 0, 1], 1234)),
        &[("X-Forwarded-For", "198.51.100.7")],
    );
    let resp = app.oneshot(denied).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value["error"], json!("ip_not_allowed"));
}

#[tokio::test]
async fn rate_limit_returns_retry_after() {
    let app = create_router(test_state(Arc::new(MemoryHub::new())));

    for _ in 0..60 {
        let request = build_request(
            Method::GET,
            "/api/smartly/sync/states",
            None,
            &Signed::fresh(),
            peer(),
            &[],
        );
        let resp = app.clone().oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    let request = build_request(
        Method::GET,
        "/api/smartly/sync/states",
        None,
        &Signed::fresh(),
        peer(),
        &[],
    );
    let resp = app.oneshot(request).await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = resp
        .headers()
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after > 0);
    assert_eq!(
        resp.headers().get("x-ratelimit-remaining").unwrap(),
        "0"
    );
}

// ---- control ------------------------------------------------------------

#[tokio::test]
async fn control_happy_path() {
    let hub = Arc::new(MemoryHub::new());
    hub.insert_entity(labeled_entity("light.bedroom"));
    hub.set_state(snapshot("light.bedroom", "off", json!({})));
    hub.set_post_call_state(snapshot(
        "light.bedroom",
        "on",
        json!({"brightness": 200, "friendly_name": "Bedroom"}),
    ));
    let app = create_router(test_state(hub.clone()));

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/smartly/control",
        Some(&json!({
            "entity_id": "light.bedroom",
            "action": "turn_on",
            "service_data": {"brightness": 200},
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["entity_id"], json!("light.bedroom"));
    assert_eq!(body["action"], json!("turn_on"));
    assert_eq!(body["new_state"], json!("on"));
    assert_eq!(body["new_attributes"]["brightness"], json!(200));

    let calls = hub.recorded_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].domain, "light");
    assert_eq!(calls[0].action, "turn_on");
    assert_eq!(calls[0].data["brightness"], json!(200));
    assert_eq!(calls[0].data["entity_id"], json!("light.bedroom"));
}

#[tokio::test]
async fn control_denies_and_shape_errors() {
    let hub = Arc::new(MemoryHub::new());
    hub.insert_entity(labeled_entity("lock.front"));
    hub.insert_entity(EntityEntry {
        entity_id: "light.private".into(),
        ..Default::default()
    });
    let app = create_router(test_state(hub));

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/smartly/control",
        Some(&json!({"entity_id": "light.private", "action": "turn_on"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], json!("entity_not_allowed"));

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/smartly/control",
        Some(&json!({"entity_id": "lock.front", "action": "toggle"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], json!("service_not_allowed"));

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/smartly/control",
        Some(&json!({"entity_id": "light.ghost", "action": "turn_on"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], json!("entity_not_found"));

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/smartly/control",
        Some(&json!({"entity_id": "Bad.Entity!", "action": "turn_on"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("invalid_entity_id"));

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/smartly/control",
        Some(&json!({"entity_id": "lock.front"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("missing_required_fields"));
}

// ---- sync ---------------------------------------------------------------

#[tokio::test]
async fn sync_structure_builds_the_tree() {
    let hub = Arc::new(MemoryHub::new());
    hub.insert_floor(FloorEntry {
        id: "f1".into(),
        name: Some("Ground".into()),
    });
    hub.insert_area(AreaEntry {
        id: "a1".into(),
        name: Some("Room 101".into()),
        floor_id: Some("f1".into()),
    });
    hub.insert_device(DeviceEntry {
        id: "d1".into(),
        name: Some("Switch Box".into()),
        area_id: Some("a1".into()),
    });
    hub.insert_entity(EntityEntry {
        entity_id: "switch.room_101_light".into(),
        device_id: Some("d1".into()),
        labels: vec!["smartly".into()],
        ..Default::default()
    });
    hub.insert_entity(labeled_entity("sensor.unassigned_temp"));
    hub.insert_entity(EntityEntry {
        entity_id: "sensor.hidden".into(),
        ..Default::default()
    });
    let app = create_router(test_state(hub));

    let (status, body) = send(&app, Method::GET, "/api/smartly/sync/structure", None).await;
    assert_eq!(status, StatusCode::OK);

    let floors = body["floors"].as_array().unwrap();
    assert_eq!(floors.len(), 2);
    assert_eq!(body["entities"].as_array().unwrap().len(), 2);

    let unassigned = floors.iter().find(|f| f["id"] == "_unassigned").unwrap();
    assert_eq!(
        unassigned["areas"][0]["devices"][0]["entities"][0]["entity_id"],
        json!("sensor.unassigned_temp")
    );
    let f1 = floors.iter().find(|f| f["id"] == "f1").unwrap();
    assert_eq!(
        f1["areas"][0]["devices"][0]["entities"][0]["entity_id"],
        json!("switch.room_101_light")
    );
}

#[tokio::test]
async fn sync_states_formats_numeric_sensors() {
    let hub = Arc::new(MemoryHub::new());
    hub.insert_entity(labeled_entity("sensor.plug_current"));
    hub.set_state(snapshot(
        "sensor.plug_current",
        "12.3456",
        json!({"device_class": "current", "unit_of_measurement": "mA"}),
    ));
    let app = create_router(test_state(hub));

    let (status, body) = send(&app, Method::GET, "/api/smartly/sync/states", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], json!(1));
    assert_eq!(body["states"][0]["state"], json!(12.3));
}

// ---- history ------------------------------------------------------------

fn seed_history(hub: &MemoryHub, entity_id: &str, n: usize, days: i64) {
    let base = Utc::now() - ChronoDuration::hours(1);
    let step = (days * 24 * 3600 - 3600) / (n as i64);
    let states: Vec<HistoryState> = (0..n)
        .map(|i| {
            let t: DateTime<Utc> = base - ChronoDuration::seconds(step * i as i64);
            HistoryState {
                state: format!("{}", 20.0 + (i % 10) as f64),
                attributes: if i == n - 1 {
                    Some(
                        json!({"device_class": "temperature", "unit_of_measurement": "°C"})
                            .as_object()
                            .cloned()
                            .unwrap(),
                    )
                } else {
                    None
                },
                last_changed: t,
                last_updated: t,
            }
        })
        .collect();
    hub.set_history(entity_id, states);
}

#[tokio::test]
async fn history_pagination_walks_every_event() {
    let hub = Arc::new(MemoryHub::new());
    hub.insert_entity(labeled_entity("sensor.temperature"));
    seed_history(&hub, "sensor.temperature", 225, 7);
    let app = create_router(test_state(hub));

    let start = (Utc::now() - ChronoDuration::days(7)).to_rfc3339();
    let base = format!(
        "/api/smartly/history/sensor.temperature?start_time={}&page_size=100",
        urlencoding::encode(&start)
    );

    let mut pages = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let path = match &cursor {
            Some(c) => format!("{base}&cursor={c}"),
            None => base.clone(),
        };
        let (status, body) = send(&app, Method::GET, &path, None).await;
        assert_eq!(status, StatusCode::OK);
        pages.push(body["history"].as_array().unwrap().len());
        assert_eq!(body["page_size"], json!(100));
        if body["has_more"] == json!(true) {
            cursor = Some(body["next_cursor"].as_str().unwrap().to_string());
        } else {
            assert!(body.get("next_cursor").is_none());
            break;
        }
    }

    assert_eq!(pages, vec![100, 100, 25]);
}

#[tokio::test]
async fn history_rejects_tampered_cursor_and_bad_ranges() {
    let hub = Arc::new(MemoryHub::new());
    hub.insert_entity(labeled_entity("sensor.temperature"));
    let app = create_router(test_state(hub));

    let (status, body) = send(
        &app,
        Method::GET,
        "/api/smartly/history/sensor.temperature?cursor=bogus!!",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("invalid_cursor"));

    let start = (Utc::now() - ChronoDuration::days(45)).to_rfc3339();
    let path = format!(
        "/api/smartly/history/sensor.temperature?start_time={}",
        urlencoding::encode(&start)
    );
    let (status, body) = send(&app, Method::GET, &path, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("invalid_time_range"));

    let (status, body) = send(&app, Method::GET, "/api/smartly/history/sensor.ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], json!("entity_not_found"));
}

#[tokio::test]
async fn history_batch_limits_and_denials() {
    let hub = Arc::new(MemoryHub::new());
    hub.insert_entity(labeled_entity("sensor.ok"));
    hub.insert_entity(EntityEntry {
        entity_id: "sensor.secret".into(),
        ..Default::default()
    });
    seed_history(&hub, "sensor.ok", 10, 1);
    let app = create_router(test_state(hub));

    let too_many: Vec<String> = (0..51).map(|i| format!("sensor.s{i}")).collect();
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/smartly/history/batch",
        Some(&json!({"entity_ids": too_many})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("too_many_entities"));

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/smartly/history/batch",
        Some(&json!({"entity_ids": ["sensor.ok", "sensor.secret"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["denied_entities"], json!(["sensor.secret"]));
    assert!(body["history"]["sensor.ok"].as_array().unwrap().len() >= 10);

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/smartly/history/batch",
        Some(&json!({"entity_ids": ["sensor.secret"]})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], json!("acl_denied"));
}

#[tokio::test]
async fn statistics_validates_period() {
    let hub = Arc::new(MemoryHub::new());
    hub.insert_entity(labeled_entity("sensor.energy"));
    let app = create_router(test_state(hub));

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/smartly/history/statistics",
        Some(&json!({"entity_id": "sensor.energy", "period": "fortnight"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("invalid_period"));

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/smartly/history/statistics",
        Some(&json!({"entity_id": "sensor.energy", "period": "hour"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["period"], json!("hour"));
    assert_eq!(body["count"], json!(0));
}

// ---- camera & webrtc ----------------------------------------------------

async fn spawn_go2rtc_stub() -> SocketAddr {
    use axum::routing::{post, put};

    let app = axum::Router::new()
        .route(
            "/api/webrtc",
            post(|| async {
                axum::Json(json!({"type": "answer", "sdp": "v=0\r\ns=stub\r\n"}))
            })
            .delete(|| async { StatusCode::OK }),
        )
        .route("/api/streams", put(|| async { StatusCode::OK }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn camera_snapshot_with_etag_revalidation() {
    let hub = Arc::new(MemoryHub::new());
    hub.insert_entity(labeled_entity("camera.front"));
    hub.set_state(snapshot("camera.front", "idle", json!({})));
    hub.set_camera_image(
        "camera.front",
        "image/jpeg",
        bytes::Bytes::from_static(&[0xff, 0xd8, 0xff, 0xe0]),
    );
    let app = create_router(test_state(hub));

    let request = build_request(
        Method::GET,
        "/api/smartly/camera/camera.front/snapshot",
        None,
        &Signed::fresh(),
        peer(),
        &[],
    );
    let resp = app.clone().oneshot(request).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("content-type").unwrap(), "image/jpeg");
    let etag = resp.headers().get("etag").unwrap().to_str().unwrap().to_string();
    assert_eq!(etag.len(), 64);
    let cache_control = resp.headers().get("cache-control").unwrap().to_str().unwrap();
    assert!(cache_control.contains("private"));

    let request = build_request(
        Method::GET,
        "/api/smartly/camera/camera.front/snapshot",
        None,
        &Signed::fresh(),
        peer(),
        &[("If-None-Match", etag.as_str())],
    );
    let resp = app.oneshot(request).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
}

#[tokio::test]
async fn camera_stream_forwards_bytes_without_reframing() {
    let hub = Arc::new(MemoryHub::new());
    hub.insert_entity(labeled_entity("camera.front"));
    hub.set_state(snapshot("camera.front", "idle", json!({})));
    let mjpeg_body: Vec<u8> =
        b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xff\xd8\xff\xd9\r\n".to_vec();
    hub.set_mjpeg_body("camera.front", bytes::Bytes::from(mjpeg_body.clone()));
    let app = create_router(test_state(hub));

    let request = build_request(
        Method::GET,
        "/api/smartly/camera/camera.front/stream",
        None,
        &Signed::fresh(),
        peer(),
        &[],
    );
    let resp = app.oneshot(request).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "multipart/x-mixed-replace;boundary=frame"
    );
    assert_eq!(resp.headers().get("connection").unwrap(), "close");

    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes.as_ref(), mjpeg_body.as_slice());
}

#[tokio::test]
async fn camera_registry_round_trip() {
    let hub = Arc::new(MemoryHub::new());
    let app = create_router(test_state(hub));

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/smartly/camera/config",
        Some(&json!({
            "action": "register",
            "entity_id": "camera.garage",
            "name": "Garage",
            "snapshot_url": "http://cam.local/shot.jpg",
            "username": "admin",
            "password": "hunter2",
            "verify_ssl": false,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["action"], json!("registered"));

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/smartly/camera/config",
        Some(&json!({"action": "list"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], json!(1));
    assert_eq!(body["cameras"][0]["has_snapshot"], json!(true));

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/smartly/camera/config",
        Some(&json!({"action": "sideways"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("invalid_action"));
}

#[tokio::test]
async fn webrtc_token_is_single_use_end_to_end() {
    let go2rtc_addr = spawn_go2rtc_stub().await;
    let hub = Arc::new(MemoryHub::new());
    hub.insert_entity(labeled_entity("camera.front"));
    hub.set_state(snapshot("camera.front", "idle", json!({})));
    hub.set_stream_source("camera.front", "rtsp://10.0.0.9/main");

    let config = test_config("", TrustProxyMode::Never, &format!("http://{go2rtc_addr}"));
    let app = create_router(AppState::new(config, hub));

    // token issuance requires HMAC
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/smartly/camera/camera.front/webrtc",
        Some(&json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let token = body["token"].as_str().unwrap().to_string();
    assert!(body["expires_in"].as_i64().unwrap() >= 299);
    assert!(body["ice_servers"].as_array().unwrap().len() >= 2);

    // the SDP exchange is token-protected, no HMAC headers at all
    let offer = json!({"token": token, "sdp": "v=0\r\n", "type": "offer"});
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/smartly/camera/camera.front/webrtc/offer")
        .header("Content-Type", "application/json")
        .body(Body::from(serde_json::to_vec(&offer).unwrap()))
        .unwrap();
    let resp = app.clone().oneshot(request).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let answer: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(answer["type"], json!("answer"));
    let session_id = answer["session_id"].as_str().unwrap().to_string();

    // second use of the same token fails
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/smartly/camera/camera.front/webrtc/offer")
        .header("Content-Type", "application/json")
        .body(Body::from(serde_json::to_vec(&offer).unwrap()))
        .unwrap();
    let resp = app.clone().oneshot(request).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let err: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(err["error"], json!("invalid_or_expired_token"));

    // ICE rides on the session id
    let ice = json!({
        "session_id": session_id,
        "candidate": {"candidate": "candidate:1 1 UDP 1 10.0.0.2 50000 typ host", "sdpMid": "0", "sdpMLineIndex": 0},
    });
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/smartly/camera/camera.front/webrtc/ice")
        .header("Content-Type", "application/json")
        .body(Body::from(serde_json::to_vec(&ice).unwrap()))
        .unwrap();
    let resp = app.clone().oneshot(request).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // hangup closes the session; a second hangup cannot find it
    let hangup = json!({"session_id": session_id});
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/smartly/camera/camera.front/webrtc/hangup")
        .header("Content-Type", "application/json")
        .body(Body::from(serde_json::to_vec(&hangup).unwrap()))
        .unwrap();
    let resp = app.clone().oneshot(request).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/smartly/camera/camera.front/webrtc/hangup")
        .header("Content-Type", "application/json")
        .body(Body::from(serde_json::to_vec(&hangup).unwrap()))
        .unwrap();
    let resp = app.oneshot(request).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn webrtc_token_for_unlabeled_camera_is_denied() {
    let hub = Arc::new(MemoryHub::new());
    hub.insert_entity(EntityEntry {
        entity_id: "camera.private".into(),
        ..Default::default()
    });
    let app = create_router(test_state(hub));

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/smartly/camera/camera.private/webrtc",
        Some(&json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], json!("entity_not_allowed"));
}
