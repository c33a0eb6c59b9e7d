//! Telemetry capture: store matching ping submissions and answer them locally

use crate::admin::Metrics;
use crate::config::{is_single_component, PathSegment, TelemetryCaptureConfig};
use crate::error::InterceptError;
use crate::flow::{Flow, FlowRequest, FlowResponse};
use crate::interceptor::{HookOutcome, Interceptor};
use crate::store::{format_payload, CaptureRecord, CaptureStore};
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tracing::info;

const SEQ_POINTER: &str = "/ping_info/seq";
const CLIENT_ID_POINTER: &str = "/client_info/client_id";

/// Captures request bodies sent to `match_prefix` and answers them with an
/// empty `200 OK`, so nothing reaches the real collection server.
pub struct TelemetryCaptureInterceptor {
    config: TelemetryCaptureConfig,
    store: CaptureStore,
    metrics: Arc<Metrics>,
    validated: OnceLock<Result<(), InterceptError>>,
}

impl TelemetryCaptureInterceptor {
    pub const NAME: &'static str = "telemetry-capture";

    /// Successful captures are counted in `metrics`.
    pub fn new(config: TelemetryCaptureConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            store: CaptureStore::new(config.storage_root.clone()),
            config,
            metrics,
            validated: OnceLock::new(),
        }
    }

    pub fn matches(&self, request: &FlowRequest) -> bool {
        request.url.starts_with(&self.config.match_prefix)
    }

    /// Parses the body and derives where it is stored.
    pub fn capture_record(&self, request: &FlowRequest) -> Result<CaptureRecord, InterceptError> {
        let parsed: Value = serde_json::from_slice(request.content())
            .map_err(|e| InterceptError::malformed(format!("body is not JSON: {}", e)))?;

        let filename = format!("{}.json", sequence_number(&parsed)?);

        let mut directory = PathBuf::new();
        for segment in self.config.path_template.segments() {
            match segment {
                PathSegment::Literal(literal) => directory.push(literal),
                PathSegment::RunId => {
                    // validate() guarantees presence
                    directory.push(self.config.run_id.as_deref().unwrap_or_default())
                }
                PathSegment::ClientId => directory.push(client_id(&parsed)?),
            }
        }

        Ok(CaptureRecord {
            directory,
            filename,
            payload: format_payload(&parsed)?,
        })
    }
}

/// `ping_info.seq` as a non-negative integer (digit strings are accepted).
fn sequence_number(parsed: &Value) -> Result<u64, InterceptError> {
    match parsed.pointer(SEQ_POINTER) {
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| InterceptError::malformed(format!("ping_info.seq `{}` is not a non-negative integer", n))),
        Some(Value::String(s)) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => s
            .parse()
            .map_err(|_| InterceptError::malformed(format!("ping_info.seq `{}` is out of range", s))),
        Some(other) => Err(InterceptError::malformed(format!(
            "ping_info.seq has unexpected value {}",
            other
        ))),
        None => Err(InterceptError::malformed("ping_info.seq is missing")),
    }
}

fn client_id(parsed: &Value) -> Result<&str, InterceptError> {
    let id = parsed
        .pointer(CLIENT_ID_POINTER)
        .and_then(Value::as_str)
        .ok_or_else(|| InterceptError::malformed("client_info.client_id is missing"))?;
    if !is_single_component(id) {
        return Err(InterceptError::malformed(format!(
            "client_info.client_id `{}` is not usable as a directory name",
            id
        )));
    }
    Ok(id)
}

#[async_trait]
impl Interceptor for TelemetryCaptureInterceptor {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn validate(&self) -> Result<(), InterceptError> {
        self.config.validate().map_err(InterceptError::from)
    }

    async fn on_request(&self, flow: &Flow) -> HookOutcome {
        if let Err(e) = self.validated.get_or_init(|| self.validate()) {
            return HookOutcome::Fail(e.clone());
        }
        if !self.matches(&flow.request) {
            return HookOutcome::Continue;
        }

        let record = match self.capture_record(&flow.request) {
            Ok(record) => record,
            Err(e) => return HookOutcome::Fail(e),
        };

        match self.store.write_record(&record).await {
            Ok(path) => {
                Metrics::incr(&self.metrics.captures_written);
                info!(
                    flow_id = %flow.id,
                    path = %path.display(),
                    "Intercepted telemetry request (stored as {}), responding with a 200 OK without sending it upstream",
                    record.filename
                );
                HookOutcome::Respond(FlowResponse::synthetic_ok())
            }
            Err(e) => HookOutcome::Fail(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathTemplate;
    use bytes::Bytes;
    use hudsucker::hyper::{HeaderMap, Method, StatusCode};
    use proptest::prelude::*;
    use std::path::Path;
    use tempfile::tempdir;

    const PREFIX: &str = "https://incoming.telemetry.mozilla.org/submit/org-mozilla-bergamot";
    const BODY: &str = r#"{"ping_info":{"seq":7},"client_info":{"client_id":"abc"}}"#;

    fn config(root: &Path, template: &str, run_id: Option<&str>) -> TelemetryCaptureConfig {
        TelemetryCaptureConfig {
            match_prefix: PREFIX.to_string(),
            storage_root: root.to_path_buf(),
            path_template: template.parse().unwrap(),
            run_id: run_id.map(String::from),
        }
    }

    fn flow(url: &str, body: &str) -> Flow {
        Flow::new(
            "127.0.0.1:40000".parse().unwrap(),
            FlowRequest::new(
                Method::POST,
                url,
                HeaderMap::new(),
                Bytes::copy_from_slice(body.as_bytes()),
            ),
        )
    }

    fn capture_interceptor(config: TelemetryCaptureConfig) -> TelemetryCaptureInterceptor {
        TelemetryCaptureInterceptor::new(config, Arc::default())
    }

    fn ping_url(suffix: &str) -> String {
        format!("{}/{}", PREFIX, suffix)
    }

    #[tokio::test]
    async fn test_client_segmented_capture_scenario() {
        let dir = tempdir().unwrap();
        let metrics = Arc::new(Metrics::default());
        let interceptor =
            TelemetryCaptureInterceptor::new(config(dir.path(), "{client_id}", None), metrics.clone());

        let outcome = interceptor
            .on_request(&flow(&ping_url("metrics/1/abc"), BODY))
            .await;
        match outcome {
            HookOutcome::Respond(res) => {
                assert_eq!(res.status, StatusCode::OK);
                assert!(res.body.is_empty());
            }
            other => panic!("expected synthetic response, got {:?}", other),
        }

        let written = std::fs::read_to_string(dir.path().join("abc/7.json")).unwrap();
        let original: Value = serde_json::from_str(BODY).unwrap();
        assert_eq!(serde_json::from_str::<Value>(&written).unwrap(), original);
        assert!(written.find("\"client_info\"").unwrap() < written.find("\"ping_info\"").unwrap());
        assert!(written.contains("\n    \"client_info\": {"));
        assert_eq!(metrics.snapshot().captures_written, 1);
    }

    #[tokio::test]
    async fn test_non_matching_url_is_ignored() {
        let dir = tempdir().unwrap();
        let interceptor = capture_interceptor(config(dir.path(), "", None));

        let outcome = interceptor
            .on_request(&flow("https://example.com/submit/org-mozilla-bergamot", BODY))
            .await;
        assert!(matches!(outcome, HookOutcome::Continue));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_body_fails_without_capture() {
        let dir = tempdir().unwrap();
        let interceptor = capture_interceptor(config(dir.path(), "", None));

        for body in ["not json", r#"{"ping_info":{}}"#, r#"{"ping_info":{"seq":-1}}"#] {
            let outcome = interceptor.on_request(&flow(&ping_url("x"), body)).await;
            assert!(
                matches!(outcome, HookOutcome::Fail(InterceptError::MalformedPayload { .. })),
                "body {:?} gave {:?}",
                body,
                outcome
            );
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_same_sequence_keeps_latest_content() {
        let dir = tempdir().unwrap();
        let interceptor = capture_interceptor(config(dir.path(), "", None));

        let first = r#"{"ping_info":{"seq":3},"marker":"first"}"#;
        let second = r#"{"ping_info":{"seq":3},"marker":"second"}"#;
        interceptor.on_request(&flow(&ping_url("a"), first)).await;
        interceptor.on_request(&flow(&ping_url("a"), second)).await;

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        let written = std::fs::read_to_string(dir.path().join("3.json")).unwrap();
        assert!(written.contains("second"));
    }

    #[tokio::test]
    async fn test_shared_directory_collides_across_clients() {
        // Without a client segment two clients with the same seq share one file.
        let dir = tempdir().unwrap();
        let global = capture_interceptor(config(dir.path(), "{run_id}", Some("run")));
        let a = r#"{"ping_info":{"seq":1},"client_info":{"client_id":"a"}}"#;
        let b = r#"{"ping_info":{"seq":1},"client_info":{"client_id":"b"}}"#;
        global.on_request(&flow(&ping_url("p"), a)).await;
        global.on_request(&flow(&ping_url("p"), b)).await;
        assert_eq!(std::fs::read_dir(dir.path().join("run")).unwrap().count(), 1);

        let segmented =
            capture_interceptor(config(dir.path(), "seg/{client_id}", None));
        segmented.on_request(&flow(&ping_url("p"), a)).await;
        segmented.on_request(&flow(&ping_url("p"), b)).await;
        assert!(dir.path().join("seg/a/1.json").exists());
        assert!(dir.path().join("seg/b/1.json").exists());
    }

    #[tokio::test]
    async fn test_hostile_client_id_is_rejected() {
        let dir = tempdir().unwrap();
        let interceptor = capture_interceptor(config(dir.path(), "{client_id}", None));
        let body = r#"{"ping_info":{"seq":1},"client_info":{"client_id":"../../escape"}}"#;

        let outcome = interceptor.on_request(&flow(&ping_url("p"), body)).await;
        assert!(matches!(outcome, HookOutcome::Fail(InterceptError::MalformedPayload { .. })));
    }

    #[tokio::test]
    async fn test_empty_prefix_is_configuration_error() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path(), "", None);
        cfg.match_prefix = String::new();
        let interceptor = capture_interceptor(cfg);

        let outcome = interceptor
            .on_request(&flow("https://anything.example/", BODY))
            .await;
        match outcome {
            HookOutcome::Fail(e) => assert!(e.is_fatal()),
            other => panic!("expected configuration failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_storage_failure_is_reported() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let metrics = Arc::new(Metrics::default());
        let interceptor = TelemetryCaptureInterceptor::new(config(&blocker, "", None), metrics.clone());

        let outcome = interceptor.on_request(&flow(&ping_url("p"), BODY)).await;
        assert!(matches!(outcome, HookOutcome::Fail(InterceptError::Storage { .. })));
        assert_eq!(metrics.snapshot().captures_written, 0);
    }

    #[test]
    fn test_run_and_literal_segments() {
        let dir = tempdir().unwrap();
        let interceptor = capture_interceptor(config(
            dir.path(),
            "telemetry/{run_id}/{client_id}",
            Some("foo"),
        ));
        let record = interceptor
            .capture_record(&flow(&ping_url("p"), BODY).request)
            .unwrap();
        assert_eq!(record.directory, PathBuf::from("telemetry/foo/abc"));
        assert_eq!(record.filename, "7.json");
        assert_eq!(PathTemplate::default().segments().len(), 0);
    }

    proptest! {
        #[test]
        fn prop_filename_follows_sequence(seq in any::<u64>()) {
            let interceptor = capture_interceptor(config(Path::new("/unused"), "", None));
            let body = format!(r#"{{"ping_info":{{"seq":{}}}}}"#, seq);
            let record = interceptor.capture_record(&flow(&ping_url("p"), &body).request).unwrap();
            prop_assert_eq!(record.filename, format!("{}.json", seq));
        }
    }
}
