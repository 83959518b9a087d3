//! End-to-end: collector over HTTP into a live server, read back through the
//! dashboard API, with alerts delivered to a local webhook.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use vitalscope::clock::{SharedClock, SystemClock};
use vitalscope::collector::{CapturedError, Collector, HttpTransport, Vital};
use vitalscope::config::{CollectorConfig, Config};
use vitalscope::server::{self, AppState};
use vitalscope::store::{SharedStore, SqliteEventStore};

const CHROME: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Captures webhook posts.
async fn start_webhook() -> (String, Arc<Mutex<Vec<Value>>>) {
    let received: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let router = Router::new().route(
        "/hook",
        post(move |Json(body): Json<Value>| {
            let sink = sink.clone();
            async move {
                sink.lock().push(body);
                "ok"
            }
        }),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind webhook");
    let addr = listener.local_addr().expect("webhook addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    (format!("http://{addr}/hook"), received)
}

struct Running {
    _dir: tempfile::TempDir,
    base: String,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

async fn start_server(webhook_url: &str) -> Running {
    let dir = tempfile::tempdir().expect("tempdir");

    let mut cfg = Config::default();
    cfg.alerts.webhook_url = webhook_url.to_string();
    cfg.symbolication.sourcemap_dir = dir.path().join("maps");
    cfg.insight.api_key_env = "VITALSCOPE_PIPELINE_UNSET_KEY".to_string();
    cfg.validate().expect("valid config");

    let store: SharedStore =
        Arc::new(SqliteEventStore::open(dir.path().join("events.db")).expect("open store"));
    let clock: SharedClock = Arc::new(SystemClock);
    let state = AppState::from_config(&cfg, store, clock, None).expect("state");

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind api");
    let addr = listener.local_addr().expect("api addr");

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    let task = tokio::spawn(server::serve(listener, Arc::new(state), async move {
        shutdown.cancelled().await;
    }));

    Running {
        _dir: dir,
        base: format!("http://{addr}"),
        cancel,
        task,
    }
}

async fn get_json(url: &str) -> Value {
    reqwest::get(url)
        .await
        .expect("request")
        .error_for_status()
        .expect("status")
        .json()
        .await
        .expect("json")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_collector_to_dashboard() {
    let (webhook_url, webhook) = start_webhook().await;
    let server = start_server(&webhook_url).await;

    let map = r#"{"version":3,"sources":["src/checkout.ts"],"names":[],"mappings":"AAAA"}"#;
    let client = reqwest::Client::new();
    let upload = client
        .post(format!("{}/api/sourcemaps?release=3.1.0&name=bundle.js.map", server.base))
        .body(map)
        .send()
        .await
        .expect("upload");
    assert!(upload.status().is_success());

    let mut cfg = CollectorConfig::new("shop", format!("{}/api/ingest", server.base));
    cfg.batch_size = 100;
    cfg.flush_interval = Duration::from_secs(60);
    cfg.compression = "gzip".to_string();
    cfg.user_agent = Some(CHROME.to_string());
    cfg.page_url = Some("https://shop.example/cart".to_string());

    let transport = Arc::new(HttpTransport::new(&cfg).expect("transport"));
    let collector = Collector::start(cfg, transport, Arc::new(SystemClock)).expect("collector");

    collector.record_vital(Vital::new("LCP", 1800.0));
    collector.record_vital(Vital::new("LCP", 2200.0));
    collector.record_vital(Vital::new("INP", 450.0));
    collector.record_frame(json!({"kind": "click", "target": "#pay"}));

    let mut error = CapturedError::new("cart is undefined");
    error.stack = Some("TypeError: cart is undefined\n    at pay (https://shop.example/bundle.js:1:0)".to_string());
    error.release = Some("3.1.0".to_string());
    error.user_id = Some("u-42".to_string());
    collector.record_error(error);

    collector.shutdown().await;
    assert_eq!(collector.pending(), 0);
    assert_eq!(collector.batches_sent(), 1);

    let stats = get_json(&format!("{}/api/stats?appId=shop&period=1h", server.base)).await;
    assert_eq!(stats["errorCount"], 1);

    let recent = &stats["recentErrors"][0];
    assert_eq!(recent["message"], "cart is undefined");
    assert_eq!(recent["userId"], "u-42");
    assert_eq!(recent["device"]["browser"], "Chrome");
    assert_eq!(recent["replayEvents"][0]["target"], "#pay");
    assert_eq!(
        recent["stack"],
        "TypeError: cart is undefined\n    at pay (src/checkout.ts:1:0)"
    );

    let inp = stats["vitals"]
        .as_array()
        .expect("vitals")
        .iter()
        .find(|v| v["name"] == "INP")
        .expect("inp")
        .clone();
    assert_eq!(inp["value"], 450.0);
    assert_eq!(inp["rating"], "needs-improvement");

    let filtered = get_json(&format!("{}/api/stats?appId=shop&userId=nobody", server.base)).await;
    assert_eq!(filtered["recentErrors"], json!([]));

    let demographics = get_json(&format!("{}/api/demographics?appId=shop", server.base)).await;
    assert_eq!(demographics["browsers"], json!([{"name": "Chrome", "value": 4}]));

    // New error plus the INP budget breach.
    let mut messages = Vec::new();
    for _ in 0..100 {
        messages = webhook.lock().clone();
        if messages.len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(messages.len(), 2);
    let contents: Vec<&str> = messages
        .iter()
        .filter_map(|m| m["content"].as_str())
        .collect();
    assert!(contents.iter().any(|c| c.contains("New Error Detected") && c.contains("cart is undefined")));
    assert!(contents.iter().any(|c| c.contains("Performance Budget Exceeded") && c.contains("INP")));
    assert!(messages.iter().all(|m| m["username"] == "AI Frontend Monitor"));

    server.cancel.cancel();
    server.task.await.expect("join").expect("serve");
}

#[tokio::test]
async fn test_rejects_malformed_batches() {
    let (webhook_url, webhook) = start_webhook().await;
    let server = start_server(&webhook_url).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/ingest", server.base))
        .header("Content-Type", "application/json")
        .body(r#"{"appId":"shop","events":"nope"}"#)
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status().as_u16(), 400);

    let stats = get_json(&format!("{}/api/stats?appId=shop", server.base)).await;
    assert_eq!(stats["errorCount"], 0);
    assert!(webhook.lock().is_empty());

    server.cancel.cancel();
    server.task.await.expect("join").expect("serve");
}
