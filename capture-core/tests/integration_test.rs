use async_trait::async_trait;
use axum::{body::Bytes, Router};
use capture_core::{
    CertificateAuthority, ConfigError, Flow, HookOutcome, InterceptError, Interceptor,
    InterceptorConfig, Metrics, PathTemplate, ProxyConfig, ProxyError, ProxyServer,
    TelemetryCaptureConfig,
};
use flate2::{write::GzEncoder, Compression};
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const TELEMETRY_PREFIX: &str = "https://incoming.telemetry.mozilla.org/submit/org-mozilla-bergamot";
const PING: &str = r#"{"ping_info":{"seq":7},"client_info":{"client_id":"abc"}}"#;

// Helper to find a free port
async fn get_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Echo server counting the requests that reach it.
async fn spawn_upstream() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let counter = hits.clone();
    let app = Router::new().fallback(move |body: Bytes| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            body
        }
    });
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, hits)
}

struct RunningProxy {
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<capture_core::Result<()>>,
}

impl RunningProxy {
    async fn start(mut config: ProxyConfig, extra: Option<Arc<dyn Interceptor>>) -> Self {
        let _ = tracing_subscriber::fmt::try_init();
        let port = get_free_port().await;
        config.listen_addr = SocketAddr::from(([127, 0, 0, 1], port));
        let addr = config.listen_addr;

        let mut server = ProxyServer::new(config, CertificateAuthority::generate().unwrap());
        if let Some(interceptor) = extra {
            server = server.with_interceptor(interceptor);
        }
        let metrics = server.metrics();

        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.run_until(async move {
            let _ = rx.await;
        }));

        for _ in 0..50 {
            if TcpStream::connect(addr).await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        Self {
            addr,
            metrics,
            shutdown: Some(tx),
            handle,
        }
    }

    fn client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(format!("http://{}", self.addr)).unwrap())
            .danger_accept_invalid_certs(true) // For our generated CA
            .pool_max_idle_per_host(0)
            .build()
            .unwrap()
    }

    async fn stop(mut self) -> capture_core::Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("proxy did not stop")
            .unwrap()
    }
}

fn capture_config(prefix: &str, root: &Path, template: &str) -> ProxyConfig {
    ProxyConfig {
        interceptors: vec![InterceptorConfig::TelemetryCapture(TelemetryCaptureConfig {
            match_prefix: prefix.to_string(),
            storage_root: root.to_path_buf(),
            path_template: template.parse::<PathTemplate>().unwrap(),
            run_id: None,
        })],
        ..ProxyConfig::default()
    }
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn files_under(root: &Path) -> usize {
    std::fs::read_dir(root).map(|dir| dir.count()).unwrap_or(0)
}

#[tokio::test]
async fn test_admin_api_reports_health_and_metrics() {
    let admin_port = get_free_port().await;
    let config = ProxyConfig {
        admin_port: Some(admin_port),
        ..ProxyConfig::default()
    };
    let proxy = RunningProxy::start(config, None).await;

    let mut health = None;
    for _ in 0..20 {
        match reqwest::get(format!("http://127.0.0.1:{}/health", admin_port)).await {
            Ok(resp) => {
                health = Some(resp);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    let health = health.expect("admin API did not come up");
    assert!(health.status().is_success());
    assert!(health.text().await.unwrap().contains("ok"));

    let resp = reqwest::get(format!("http://127.0.0.1:{}/metrics", admin_port))
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let body = resp.text().await.unwrap();
    assert!(body.contains("captures_written"));

    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_non_matching_request_is_forwarded_unchanged() {
    let storage = tempfile::tempdir().unwrap();
    let (upstream, hits) = spawn_upstream().await;
    let config = capture_config(
        &format!("http://{}/submit/test-app", upstream),
        storage.path(),
        "",
    );
    let proxy = RunningProxy::start(config, None).await;

    let resp = proxy
        .client()
        .post(format!("http://{}/other/endpoint", upstream))
        .body("payload-bytes")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "payload-bytes");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(files_under(storage.path()), 0);

    let snapshot = proxy.metrics.snapshot();
    assert_eq!(snapshot.forwarded_flows, 1);
    assert_eq!(snapshot.intercepted_flows, 0);

    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_matching_request_is_captured_without_reaching_upstream() {
    let storage = tempfile::tempdir().unwrap();
    let (upstream, hits) = spawn_upstream().await;
    let prefix = format!("http://{}/submit/test-app", upstream);
    let proxy = RunningProxy::start(capture_config(&prefix, storage.path(), ""), None).await;

    let resp = proxy
        .client()
        .post(format!("{}/metrics/1/some-doc-id", prefix))
        .header("content-type", "application/json")
        .body(PING)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.bytes().await.unwrap().is_empty());
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    let written = std::fs::read_to_string(storage.path().join("7.json")).unwrap();
    assert_eq!(
        written,
        "{\n    \"client_info\": {\n        \"client_id\": \"abc\"\n    },\n    \"ping_info\": {\n        \"seq\": 7\n    }\n}"
    );

    let snapshot = proxy.metrics.snapshot();
    assert_eq!(snapshot.intercepted_flows, 1);
    assert_eq!(snapshot.captures_written, 1);

    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_https_ping_is_captured_per_client() {
    let storage = tempfile::tempdir().unwrap();
    let proxy = RunningProxy::start(
        capture_config(TELEMETRY_PREFIX, storage.path(), "{client_id}"),
        None,
    )
    .await;

    // Answered inside the MITM tunnel, so the real endpoint is never contacted
    let resp = proxy
        .client()
        .post(format!("{}/metrics/1/abc", TELEMETRY_PREFIX))
        .body(PING)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.bytes().await.unwrap().is_empty());

    let written = std::fs::read_to_string(storage.path().join("abc").join("7.json")).unwrap();
    let stored: serde_json::Value = serde_json::from_str(&written).unwrap();
    assert_eq!(stored, serde_json::from_str::<serde_json::Value>(PING).unwrap());

    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_malformed_ping_is_forwarded() {
    let storage = tempfile::tempdir().unwrap();
    let (upstream, hits) = spawn_upstream().await;
    let prefix = format!("http://{}/submit/test-app", upstream);
    let proxy = RunningProxy::start(capture_config(&prefix, storage.path(), ""), None).await;

    let resp = proxy
        .client()
        .post(format!("{}/metrics/1/doc", prefix))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "not json");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(files_under(storage.path()), 0);
    assert_eq!(proxy.metrics.snapshot().malformed_payloads, 1);

    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_gzip_ping_is_decoded_for_capture() {
    let storage = tempfile::tempdir().unwrap();
    let (upstream, hits) = spawn_upstream().await;
    let prefix = format!("http://{}/submit/test-app", upstream);
    let proxy = RunningProxy::start(capture_config(&prefix, storage.path(), ""), None).await;

    let resp = proxy
        .client()
        .post(format!("{}/metrics/1/doc", prefix))
        .header("content-encoding", "gzip")
        .body(gzip(br#"{"ping_info":{"seq":9}}"#))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.bytes().await.unwrap().is_empty());
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    let written = std::fs::read_to_string(storage.path().join("9.json")).unwrap();
    assert_eq!(written, "{\n    \"ping_info\": {\n        \"seq\": 9\n    }\n}");

    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_compressed_body_is_forwarded_as_sent() {
    let storage = tempfile::tempdir().unwrap();
    let (upstream, hits) = spawn_upstream().await;
    let prefix = format!("http://{}/submit/test-app", upstream);
    let proxy = RunningProxy::start(capture_config(&prefix, storage.path(), ""), None).await;

    let compressed = gzip(br#"{"ping_info":{"seq":9}}"#);
    let resp = proxy
        .client()
        .post(format!("http://{}/elsewhere", upstream))
        .header("content-encoding", "gzip")
        .body(compressed.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.bytes().await.unwrap().as_ref(), compressed.as_slice());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(files_under(storage.path()), 0);

    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_storage_failure_forwards_request_upstream() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-directory");
    std::fs::write(&blocker, b"").unwrap();
    let (upstream, hits) = spawn_upstream().await;
    let prefix = format!("http://{}/submit/test-app", upstream);
    let proxy = RunningProxy::start(capture_config(&prefix, &blocker, ""), None).await;

    let body = r#"{"ping_info":{"seq":1}}"#;
    let resp = proxy
        .client()
        .post(format!("{}/metrics/1/doc", prefix))
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), body);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let snapshot = proxy.metrics.snapshot();
    assert_eq!(snapshot.capture_failures, 1);
    assert_eq!(snapshot.captures_written, 0);
    assert_eq!(snapshot.forwarded_flows, 1);

    proxy.stop().await.unwrap();
}

/// Records every upstream response body it is shown.
#[derive(Default)]
struct ResponseRecorder {
    bodies: Mutex<Vec<Bytes>>,
}

#[async_trait]
impl Interceptor for ResponseRecorder {
    fn name(&self) -> &str {
        "response-recorder"
    }

    async fn on_response(&self, flow: &Flow) {
        if let Some(response) = &flow.response {
            self.bodies.lock().unwrap().push(response.body.clone());
        }
    }

    fn observes_responses(&self) -> bool {
        true
    }
}

#[tokio::test]
async fn test_response_observer_sees_upstream_body() {
    let (upstream, hits) = spawn_upstream().await;
    let recorder = Arc::new(ResponseRecorder::default());
    let proxy = RunningProxy::start(
        ProxyConfig::default(),
        Some(recorder.clone() as Arc<dyn Interceptor>),
    )
    .await;

    let resp = proxy
        .client()
        .post(format!("http://{}/echo", upstream))
        .body("hello")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "hello");
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let bodies = recorder.bodies.lock().unwrap().clone();
    assert_eq!(bodies, vec![Bytes::from_static(b"hello")]);

    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_upstream_returns_bad_gateway() {
    let storage = tempfile::tempdir().unwrap();
    let closed_port = get_free_port().await;
    let proxy = RunningProxy::start(
        capture_config(TELEMETRY_PREFIX, storage.path(), ""),
        None,
    )
    .await;

    let resp = proxy
        .client()
        .get(format!("http://127.0.0.1:{}/anything", closed_port))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);
    assert_eq!(proxy.metrics.snapshot().upstream_errors, 1);

    // Proxy keeps serving after an upstream failure
    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_empty_match_prefix_fails_startup() {
    let storage = tempfile::tempdir().unwrap();
    let config = ProxyConfig {
        listen_addr: SocketAddr::from(([127, 0, 0, 1], get_free_port().await)),
        ..capture_config("", storage.path(), "")
    };
    let server = ProxyServer::new(config, CertificateAuthority::generate().unwrap());

    let err = tokio::time::timeout(Duration::from_secs(5), server.run())
        .await
        .expect("startup validation should not block")
        .unwrap_err();
    assert!(matches!(err, ProxyError::Config(_)));
}

struct MisconfiguredInterceptor;

#[async_trait]
impl Interceptor for MisconfiguredInterceptor {
    fn name(&self) -> &str {
        "misconfigured"
    }

    async fn on_request(&self, _flow: &Flow) -> HookOutcome {
        HookOutcome::Fail(ConfigError::missing("upstream_token").into())
    }
}

#[tokio::test]
async fn test_fatal_interceptor_error_stops_proxy() {
    let (upstream, hits) = spawn_upstream().await;
    let mut proxy = RunningProxy::start(
        ProxyConfig::default(),
        Some(Arc::new(MisconfiguredInterceptor) as Arc<dyn Interceptor>),
    )
    .await;

    let resp = proxy
        .client()
        .get(format!("http://{}/", upstream))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    drop(resp);
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    // Stops on its own; the external shutdown is never sent
    let _keep_open = proxy.shutdown.take();
    let outcome = tokio::time::timeout(Duration::from_secs(5), proxy.handle)
        .await
        .expect("proxy should stop after a fatal error")
        .unwrap();
    match outcome {
        Err(ProxyError::Intercept(InterceptError::Configuration(e))) => {
            assert_eq!(e.field, "upstream_token")
        }
        other => panic!("expected fatal configuration error, got {:?}", other.err()),
    }
}
