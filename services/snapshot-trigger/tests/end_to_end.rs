//! Message-to-file scenarios driven through the dispatcher with a scripted
//! camera API and paused tokio time.

use async_trait::async_trait;
use parking_lot::Mutex;
use snapshot_trigger::config::{DispatchMode, TriggerConfig, WorkflowConfig};
use snapshot_trigger::{
    ApiResponse, CameraApi, CameraApiError, DispatchOutcome, EventDispatcher, EventFilter,
    GlobalCooldown, ImageStore, MessageLog, SkipReason, SnapshotWorkflow, WorkflowFailure,
};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const TOPIC: &str = "cameras/SERIAL123/events";
const PERSON: &[u8] = br#"{"objects":[{"type":"person","confidence":85}]}"#;

/// Camera API replaying queued responses
#[derive(Default)]
struct ScriptedCameraApi {
    generate: Mutex<VecDeque<ApiResponse>>,
    downloads: Mutex<VecDeque<ApiResponse>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedCameraApi {
    fn generate(self, status: u16, body: &'static str) -> Self {
        self.generate.lock().push_back(ApiResponse::new(status, body));
        self
    }

    fn download(self, status: u16, body: &'static str) -> Self {
        self.downloads.lock().push_back(ApiResponse::new(status, body));
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl CameraApi for ScriptedCameraApi {
    async fn generate_snapshot(&self, device_serial: &str) -> Result<ApiResponse, CameraApiError> {
        self.calls.lock().push(format!("generate {}", device_serial));
        Ok(self
            .generate
            .lock()
            .pop_front()
            .unwrap_or_else(|| ApiResponse::new(202, "{}")))
    }

    async fn download(&self, url: &str) -> Result<ApiResponse, CameraApiError> {
        self.calls.lock().push(format!("download {}", url));
        Ok(self
            .downloads
            .lock()
            .pop_front()
            .unwrap_or_else(|| ApiResponse::new(404, "")))
    }
}

struct Harness {
    dir: PathBuf,
    api: Arc<ScriptedCameraApi>,
    dispatcher: EventDispatcher,
}

impl Harness {
    async fn new(api: ScriptedCameraApi) -> Self {
        let dir = std::env::temp_dir().join(format!("snapshot-e2e-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();

        let api = Arc::new(api);
        let workflow = SnapshotWorkflow::new(
            api.clone(),
            ImageStore::new(dir.join("images"), "%d%m%Y_%H%M%S"),
            WorkflowConfig::default(),
        );
        let log = MessageLog::open(dir.join("file.log")).await.unwrap();
        let dispatcher = EventDispatcher::new(
            EventFilter::new(TriggerConfig::default()),
            Arc::new(GlobalCooldown::new(Duration::from_secs(60))),
            Arc::new(workflow),
            DispatchMode::Inline,
            1,
        )
        .with_message_log(Arc::new(log));

        Self { dir, api, dispatcher }
    }

    fn images(&self) -> Vec<String> {
        list(&self.dir.join("images"))
    }

    fn log_lines(&self) -> usize {
        std::fs::read_to_string(self.dir.join("file.log"))
            .unwrap()
            .lines()
            .count()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn list(dir: &Path) -> Vec<String> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[tokio::test(start_paused = true)]
async fn qualifying_detection_stores_one_image() {
    let harness = Harness::new(
        ScriptedCameraApi::default()
            .generate(202, r#"{"url":"https://img.example/a.jpg"}"#)
            .download(200, "JPEGDATA"),
    )
    .await;

    let outcome = harness.dispatcher.on_message(TOPIC, PERSON).await;

    let artifact = match outcome {
        DispatchOutcome::Captured(artifact) => artifact,
        other => panic!("Expected Captured, got {:?}", other),
    };
    assert_eq!(std::fs::read(&artifact.path).unwrap(), b"JPEGDATA");

    let images = harness.images();
    assert_eq!(images.len(), 1);
    assert!(images[0].ends_with("-SERIAL123.jpg"));
    assert_eq!(
        harness.api.calls(),
        vec![
            "generate SERIAL123".to_string(),
            "download https://img.example/a.jpg".to_string(),
        ]
    );
    assert_eq!(harness.log_lines(), 1);
}

#[tokio::test(start_paused = true)]
async fn second_detection_within_cooldown_makes_no_request() {
    let harness = Harness::new(
        ScriptedCameraApi::default()
            .generate(202, r#"{"url":"https://img.example/a.jpg"}"#)
            .download(200, "JPEGDATA"),
    )
    .await;

    let started = tokio::time::Instant::now();
    assert!(matches!(
        harness.dispatcher.on_message(TOPIC, PERSON).await,
        DispatchOutcome::Captured(_)
    ));

    // Second event ten seconds after the first
    tokio::time::sleep_until(started + Duration::from_secs(10)).await;
    assert!(matches!(
        harness.dispatcher.on_message(TOPIC, PERSON).await,
        DispatchOutcome::RateLimited { .. }
    ));

    assert_eq!(harness.api.calls().len(), 2);
    assert_eq!(harness.images().len(), 1);
    assert_eq!(harness.log_lines(), 2);
}

#[tokio::test(start_paused = true)]
async fn two_objects_do_not_trigger() {
    let harness = Harness::new(ScriptedCameraApi::default()).await;

    let payload = br#"{"objects":[{"type":"person","confidence":90},{"type":"person","confidence":90}]}"#;
    assert!(matches!(
        harness.dispatcher.on_message(TOPIC, payload).await,
        DispatchOutcome::NotTriggered(SkipReason::ObjectCount(2))
    ));

    assert!(harness.api.calls().is_empty());
    assert!(harness.images().is_empty());
    assert_eq!(harness.log_lines(), 1);
}

#[tokio::test(start_paused = true)]
async fn rejected_submit_stores_nothing_and_service_continues() {
    let harness = Harness::new(
        ScriptedCameraApi::default()
            .generate(500, "internal error")
            .generate(202, r#"{"url":"https://img.example/b.jpg"}"#)
            .download(200, "JPEGDATA"),
    )
    .await;

    assert!(matches!(
        harness.dispatcher.on_message(TOPIC, PERSON).await,
        DispatchOutcome::Failed(WorkflowFailure::SubmitRejected { status: 500, .. })
    ));
    assert!(harness.images().is_empty());

    // Unrelated traffic is still handled
    assert!(matches!(
        harness.dispatcher.on_message("cameras/OTHER/events", b"not json").await,
        DispatchOutcome::Malformed
    ));

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(matches!(
        harness.dispatcher.on_message(TOPIC, PERSON).await,
        DispatchOutcome::Captured(_)
    ));
    assert_eq!(harness.images().len(), 1);
    assert_eq!(harness.log_lines(), 3);
}

#[tokio::test(start_paused = true)]
async fn snapshot_url_never_published() {
    let harness = Harness::new(ScriptedCameraApi::default()).await;

    let started = tokio::time::Instant::now();
    match harness.dispatcher.on_message(TOPIC, PERSON).await {
        DispatchOutcome::Failed(WorkflowFailure::SnapshotUrlNotFound { attempts }) => {
            assert_eq!(attempts, 10)
        }
        other => panic!("Expected SnapshotUrlNotFound, got {:?}", other),
    }

    assert_eq!(started.elapsed(), Duration::from_secs(45));
    let calls = harness.api.calls();
    assert_eq!(calls.len(), 10);
    assert!(calls.iter().all(|c| c == "generate SERIAL123"));
    assert!(harness.images().is_empty());
}

#[tokio::test(start_paused = true)]
async fn topic_serial_cannot_redirect_the_request() {
    let harness = Harness::new(ScriptedCameraApi::default()).await;

    for topic in ["cameras/x?y/events", "cameras/x#frag/events", "cameras/../events"] {
        assert!(matches!(
            harness.dispatcher.on_message(topic, PERSON).await,
            DispatchOutcome::NotTriggered(SkipReason::InvalidSerial(_))
        ));
    }

    assert!(harness.api.calls().is_empty());
    assert_eq!(harness.log_lines(), 3);
}
