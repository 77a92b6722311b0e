use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chorus_core::{
    ArtifactRef, AvatarSelector, BlobStore, CleanupHandle, CleanupJob, ConnectionRegistry,
    DispatchState, SpeechDispatcher, SpeechQueueItem, SpeechSynthesizer, StaticVoiceCatalog,
    SynthesisError, SynthesisGateway, VoiceSelection,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::mpsc;

// Encodes the text itself as the "audio"; fails on anything mentioning "boom"
struct FakeSynthesizer {
    calls: AtomicUsize,
}

#[async_trait]
impl SpeechSynthesizer for FakeSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        _voice: &VoiceSelection,
    ) -> Result<String, SynthesisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if text.contains("boom") {
            return Err(SynthesisError::Upstream("provider unavailable".into()));
        }
        Ok(format!("data:audio/mp3;base64,{}", STANDARD.encode(text)))
    }
}

struct Harness {
    _dir: TempDir,
    store: Arc<BlobStore>,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<SpeechDispatcher>,
    synth: Arc<FakeSynthesizer>,
    jobs: mpsc::Receiver<CleanupJob>,
}

impl Harness {
    async fn new() -> Self {
        Self::with_stall_timeout(None).await
    }

    async fn with_stall_timeout(stall: Option<Duration>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BlobStore::open(dir.path()).await.unwrap());
        let (tx, jobs) = mpsc::channel(256);
        let cleanup = CleanupHandle::new(tx, Arc::clone(&store));
        let registry = Arc::new(ConnectionRegistry::new());
        let synth = Arc::new(FakeSynthesizer {
            calls: AtomicUsize::new(0),
        });
        let gateway = SynthesisGateway::new(
            synth.clone(),
            Arc::clone(&store),
            cleanup.clone(),
            Duration::from_secs(300),
        );
        let catalog = Arc::new(StaticVoiceCatalog::new(
            HashMap::new(),
            vec![VoiceSelection::new("id_001", "google")],
        ));
        let dispatcher = Arc::new(
            SpeechDispatcher::new(
                Arc::clone(&registry),
                gateway,
                catalog,
                cleanup,
                AvatarSelector::default(),
            )
            .with_stall_timeout(stall)
            .with_seed(7),
        );

        Self {
            _dir: dir,
            store,
            registry,
            dispatcher,
            synth,
            jobs,
        }
    }

    fn connect(&self, avatar_id: &str) -> (chorus_core::ConnectionId, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel(32);
        (self.registry.register(avatar_id, tx), rx)
    }

    /// Immediate cleanup jobs filed since the last call
    fn immediate_jobs(&mut self) -> Vec<ArtifactRef> {
        let mut out = Vec::new();
        while let Ok(job) = self.jobs.try_recv() {
            if job.is_immediate() {
                out.push(job.artifact);
            }
        }
        out
    }

    async fn item(&self, avatar_id: &str) -> SpeechQueueItem {
        let artifact = self.store.create(b"ID3").await.unwrap();
        SpeechQueueItem {
            payload: json!({"text": format!("for {}", avatar_id)})
                .as_object()
                .cloned()
                .unwrap(),
            target_avatar_id: avatar_id.to_string(),
            artifact,
            voice: VoiceSelection::new("id_001", "google"),
        }
    }
}

fn artifact_of(msg: &Value) -> ArtifactRef {
    ArtifactRef::from_url(msg["avatar_audio"].as_str().unwrap()).unwrap()
}

#[tokio::test]
async fn single_avatar_speak_and_finish() {
    let mut h = Harness::new().await;
    let (_conn, mut rx) = h.connect("X");

    let passthrough = h.dispatcher.intercept("tts", json!({"text": "hi"})).await;
    assert!(!passthrough, "speech requests must not be broadcast");

    let msg = rx.try_recv().expect("X receives the speak message");
    assert_eq!(msg["signal"], "avatar_speak");
    assert_eq!(msg["text"], "hi");
    let a1 = artifact_of(&msg);
    assert_eq!(std::fs::read(h.store.path_of(&a1)).unwrap(), b"hi");
    assert_eq!(h.dispatcher.state().await, DispatchState::Dispatching);
    assert_eq!(h.dispatcher.recent_avatars().await, vec!["X".to_string()]);

    // only the fallback delayed job so far
    assert!(h.immediate_jobs().is_empty());

    let url = msg["avatar_audio"].as_str().unwrap();
    assert!(h.dispatcher.complete_url(url).await.unwrap());
    assert_eq!(h.immediate_jobs(), vec![a1]);
    assert_eq!(h.dispatcher.state().await, DispatchState::Idle);
}

#[tokio::test]
async fn no_avatars_connected_drops_request() {
    let mut h = Harness::new().await;

    assert!(!h.dispatcher.intercept("tts", json!({"text": "hi"})).await);
    assert_eq!(h.dispatcher.queue_len().await, 0);
    assert_eq!(h.dispatcher.state().await, DispatchState::Idle);
    assert_eq!(h.synth.calls.load(Ordering::SeqCst), 0);
    assert!(h.immediate_jobs().is_empty());

    let err = h.dispatcher.submit(json!({"text": "hi"})).await.unwrap_err();
    assert!(matches!(err, chorus_core::ChorusError::NoAvatarsConnected));
}

#[tokio::test]
async fn other_updates_pass_through() {
    let h = Harness::new().await;
    assert!(h.dispatcher.intercept("chat", json!({"text": "hello"})).await);
    assert!(h.dispatcher.intercept("clear_tts", Value::Null).await);
    assert!(h.dispatcher.intercept("clear", Value::Null).await);
}

#[tokio::test]
async fn missing_text_is_dropped_before_selection() {
    let h = Harness::new().await;
    let (_conn, mut rx) = h.connect("X");

    assert!(!h.dispatcher.intercept("tts", json!({"content": {}})).await);
    assert!(rx.try_recv().is_err());
    assert!(h.dispatcher.recent_avatars().await.is_empty());
}

#[tokio::test]
async fn synthesis_failure_drops_only_that_request() {
    let h = Harness::new().await;
    let (_conn, mut rx) = h.connect("X");

    assert!(!h.dispatcher.intercept("tts", json!({"text": "boom"})).await);
    assert!(rx.try_recv().is_err());
    assert_eq!(h.dispatcher.queue_len().await, 0);

    assert!(!h.dispatcher.intercept("tts", json!({"text": "fine"})).await);
    assert_eq!(rx.try_recv().unwrap()["text"], "fine");
}

#[tokio::test]
async fn one_item_in_flight_across_all_avatars() {
    let h = Harness::new().await;
    let (_x, mut rx_x) = h.connect("X");
    let (_y, mut rx_y) = h.connect("Y");

    for i in 0..3 {
        h.dispatcher
            .submit(json!({"content": {"sanitized": format!("line {}", i)}}))
            .await
            .unwrap();
    }

    let mut delivered = Vec::new();
    while let Ok(m) = rx_x.try_recv() {
        delivered.push(m);
    }
    while let Ok(m) = rx_y.try_recv() {
        delivered.push(m);
    }
    assert_eq!(delivered.len(), 1);
    assert_eq!(h.dispatcher.queue_len().await, 2);

    // finishing advances exactly one item at a time, in FIFO order
    let mut texts = vec![delivered[0]["content"]["sanitized"].clone()];
    let mut current = artifact_of(&delivered[0]);
    for _ in 0..2 {
        assert!(h.dispatcher.complete(&current).await);
        let next = rx_x.try_recv().or_else(|_| rx_y.try_recv()).unwrap();
        assert!(rx_x.try_recv().is_err() && rx_y.try_recv().is_err());
        texts.push(next["content"]["sanitized"].clone());
        current = artifact_of(&next);
    }
    assert_eq!(texts, vec![json!("line 0"), json!("line 1"), json!("line 2")]);
}

#[tokio::test]
async fn concurrent_submissions_never_double_admit() {
    let h = Harness::new().await;
    let mut receivers = Vec::new();
    for id in ["A", "B", "C"] {
        let (_conn, rx) = h.connect(id);
        receivers.push(rx);
    }

    let mut tasks = Vec::new();
    for i in 0..20 {
        let dispatcher = Arc::clone(&h.dispatcher);
        tasks.push(tokio::spawn(async move {
            dispatcher
                .submit(json!({"text": format!("msg {}", i)}))
                .await
                .unwrap();
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    let drain = |receivers: &mut Vec<mpsc::Receiver<Value>>| {
        let mut got = Vec::new();
        for rx in receivers.iter_mut() {
            while let Ok(m) = rx.try_recv() {
                got.push(m);
            }
        }
        got
    };

    let mut got = drain(&mut receivers);
    assert_eq!(got.len(), 1);
    assert_eq!(h.dispatcher.queue_len().await, 19);

    for _ in 0..19 {
        let current = artifact_of(&got[0]);
        assert!(h.dispatcher.complete(&current).await);
        got = drain(&mut receivers);
        assert_eq!(got.len(), 1);
    }
    assert_eq!(h.dispatcher.queue_len().await, 0);
}

#[tokio::test]
async fn delivery_failure_cleans_up_and_advances() {
    let mut h = Harness::new().await;
    let (_conn, mut rx) = h.connect("X");

    let first = h.item("X").await;
    let ghost = h.item("ghost").await;
    let last = h.item("X").await;
    h.dispatcher.enqueue(first.clone()).await;
    h.dispatcher.enqueue(ghost.clone()).await;
    h.dispatcher.enqueue(last.clone()).await;
    assert_eq!(artifact_of(&rx.try_recv().unwrap()), first.artifact);

    assert!(h.dispatcher.complete(&first.artifact).await);
    // ghost had no recipients: cleaned up, and the queue moved on to `last`
    assert_eq!(artifact_of(&rx.try_recv().unwrap()), last.artifact);
    assert_eq!(h.immediate_jobs(), vec![first.artifact, ghost.artifact]);
    assert_eq!(h.dispatcher.in_flight().await, Some(last.artifact));
}

#[tokio::test]
async fn delivery_failure_from_idle_returns_to_idle() {
    let mut h = Harness::new().await;
    let ghost = h.item("ghost").await;

    h.dispatcher.enqueue(ghost.clone()).await;
    assert_eq!(h.dispatcher.state().await, DispatchState::Idle);
    assert_eq!(h.dispatcher.queue_len().await, 0);
    assert_eq!(h.immediate_jobs(), vec![ghost.artifact]);
}

#[tokio::test]
async fn clear_drops_queue_but_not_the_item_in_flight() {
    let mut h = Harness::new().await;
    let (_conn, mut rx) = h.connect("X");

    let playing = h.item("X").await;
    h.dispatcher.enqueue(playing.clone()).await;
    let mut queued = Vec::new();
    for _ in 0..5 {
        let item = h.item("X").await;
        queued.push(item.artifact.clone());
        h.dispatcher.enqueue(item).await;
    }
    assert_eq!(rx.try_recv().map(|m| artifact_of(&m)).unwrap(), playing.artifact);
    assert_eq!(h.dispatcher.queue_len().await, 5);

    assert!(h.dispatcher.intercept("clear_tts", Value::Null).await);

    let filed = h.immediate_jobs();
    assert_eq!(filed.len(), 5);
    assert_eq!(filed, queued);
    assert!(!filed.contains(&playing.artifact));
    assert_eq!(h.dispatcher.queue_len().await, 0);
    assert_eq!(h.dispatcher.state().await, DispatchState::Idle);
    assert!(h.store.exists(&playing.artifact), "in-flight audio keeps playing");

    // the released item's late finish still files its cleanup, once
    assert!(!h.dispatcher.complete(&playing.artifact).await);
    assert_eq!(h.immediate_jobs(), vec![playing.artifact.clone()]);
    assert!(!h.dispatcher.complete(&playing.artifact).await);
    assert!(h.immediate_jobs().is_empty());
}

#[tokio::test]
async fn completion_for_unknown_artifact_is_a_no_op() {
    let mut h = Harness::new().await;
    let (_conn, mut rx) = h.connect("X");
    let playing = h.item("X").await;
    let waiting = h.item("X").await;
    h.dispatcher.enqueue(playing.clone()).await;
    h.dispatcher.enqueue(waiting.clone()).await;
    rx.try_recv().unwrap();

    let stranger = ArtifactRef::parse("tts_unknown.mp3").unwrap();
    assert!(!h.dispatcher.complete(&stranger).await);
    assert!(h.dispatcher.complete_url("/tts-blob/..").await.is_err());
    assert!(h.immediate_jobs().is_empty());
    assert_eq!(h.dispatcher.in_flight().await, Some(playing.artifact.clone()));
    assert!(rx.try_recv().is_err());

    // a duplicate finish must not advance twice
    assert!(h.dispatcher.complete(&playing.artifact).await);
    assert!(!h.dispatcher.complete(&playing.artifact).await);
    assert_eq!(h.dispatcher.in_flight().await, Some(waiting.artifact));
    assert_eq!(h.immediate_jobs(), vec![playing.artifact]);
}

#[tokio::test]
async fn disconnect_mid_playback_stalls_until_finish_or_clear() {
    let mut h = Harness::new().await;
    let (y, mut rx) = h.connect("Y");
    let first = h.item("Y").await;
    let second = h.item("Y").await;
    h.dispatcher.enqueue(first.clone()).await;
    h.dispatcher.enqueue(second.clone()).await;
    rx.try_recv().unwrap();

    h.registry.unregister(y);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.dispatcher.state().await, DispatchState::Dispatching);
    assert_eq!(h.dispatcher.queue_len().await, 1);

    assert_eq!(h.dispatcher.clear().await, 1);
    assert_eq!(h.dispatcher.state().await, DispatchState::Idle);
    assert_eq!(h.immediate_jobs(), vec![second.artifact]);
}

#[tokio::test]
async fn late_finish_after_disconnect_skips_absent_avatar() {
    let mut h = Harness::new().await;
    let (y, mut rx) = h.connect("Y");
    let first = h.item("Y").await;
    let second = h.item("Y").await;
    h.dispatcher.enqueue(first.clone()).await;
    h.dispatcher.enqueue(second.clone()).await;
    rx.try_recv().unwrap();
    h.registry.unregister(y);

    assert!(h.dispatcher.complete(&first.artifact).await);
    assert_eq!(h.dispatcher.state().await, DispatchState::Idle);
    assert_eq!(h.immediate_jobs(), vec![first.artifact, second.artifact]);
}

#[tokio::test(start_paused = true)]
async fn stall_watchdog_releases_silent_clients() {
    let mut h = Harness::with_stall_timeout(Some(Duration::from_secs(5))).await;
    let (_conn, mut rx) = h.connect("X");
    let first = h.item("X").await;
    let second = h.item("X").await;
    h.dispatcher.enqueue(first.clone()).await;
    h.dispatcher.enqueue(second.clone()).await;
    rx.try_recv().unwrap();

    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(h.immediate_jobs(), vec![first.artifact]);
    assert_eq!(h.dispatcher.in_flight().await, Some(second.artifact.clone()));
    assert_eq!(artifact_of(&rx.try_recv().unwrap()), second.artifact);

    // completing in time disarms that item's watchdog
    assert!(h.dispatcher.complete(&second.artifact).await);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.immediate_jobs(), vec![second.artifact]);
}

#[tokio::test]
async fn status_reports_queue_and_pool() {
    let h = Harness::new().await;
    let (_conn, _rx) = h.connect("X");
    h.dispatcher.enqueue(h.item("X").await).await;
    h.dispatcher.enqueue(h.item("X").await).await;

    let status = h.dispatcher.status().await;
    assert_eq!(status.state, DispatchState::Dispatching);
    assert_eq!(status.queued, 1);
    assert_eq!(status.queued_avatars, vec!["X".to_string()]);
    assert_eq!(status.connected_avatars, vec!["X".to_string()]);
    assert!(status.in_flight.is_some());

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["state"], "dispatching");
}
