//! Speech queue and single-flight dispatcher.
//!
//! At most one [`SpeechQueueItem`] is in flight across the whole avatar
//! pool. The queue, the in-flight slot and the recency window sit behind one
//! mutex and every transition (enqueue, admit, complete, clear) runs as a
//! single critical section, so two callers can never both observe `Idle`
//! and double-admit.
//!
//! ```text
//!            admit (>=1 recipient)
//!   Idle ───────────────────────────▶ Dispatching
//!    ▲  ╲ admit (0 recipients):           │
//!    │   ╲ cleanup, try next item         │ complete(artifact) / clear
//!    └────────────────────────────────────┘
//! ```
//!
//! Completion is event driven. A client that never reports
//! `avatar_finished` holds the pool until an external clear, unless the
//! optional stall watchdog is configured.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::blob::ArtifactRef;
use crate::cleanup::CleanupHandle;
use crate::protocol::{self, UpdateKind};
use crate::registry::ConnectionRegistry;
use crate::selector::{AvatarSelector, RecencyWindow};
use crate::synthesis::{SynthesisError, SynthesisGateway, VoiceCatalog, VoiceSelection};
use crate::{ChorusError, Result};

// artifacts released by clear/watchdog while their client may still be playing
const MAX_DETACHED: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    Idle,
    Dispatching,
}

/// One admitted speech request, ready for delivery
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechQueueItem {
    pub payload: Map<String, Value>,
    pub target_avatar_id: String,
    pub artifact: ArtifactRef,
    pub voice: VoiceSelection,
}

#[derive(Debug)]
struct InFlight {
    artifact: ArtifactRef,
    avatar_id: String,
    since: Instant,
    generation: u64,
}

struct DispatcherState {
    queue: VecDeque<SpeechQueueItem>,
    in_flight: Option<InFlight>,
    recency: RecencyWindow,
    detached: VecDeque<ArtifactRef>,
    generation: u64,
    rng: StdRng,
}

impl DispatcherState {
    fn detach(&mut self, artifact: ArtifactRef) {
        self.detached.push_back(artifact);
        while self.detached.len() > MAX_DETACHED {
            // still covered by its delayed fallback cleanup
            self.detached.pop_front();
        }
    }
}

/// Shared by the dispatcher and its watchdog tasks
struct Core {
    registry: Arc<ConnectionRegistry>,
    cleanup: CleanupHandle,
    state: Mutex<DispatcherState>,
    stall_timeout: Option<Duration>,
}

/// Snapshot for the status endpoint and tests
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStatus {
    pub state: DispatchState,
    pub in_flight: Option<InFlightStatus>,
    pub queued: usize,
    pub queued_avatars: Vec<String>,
    pub recent_avatars: Vec<String>,
    pub connected_avatars: Vec<String>,
    pub scheduled_cleanups: usize,
    pub generated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct InFlightStatus {
    pub artifact: ArtifactRef,
    pub avatar_id: String,
    pub elapsed_ms: u64,
}

pub struct SpeechDispatcher {
    core: Arc<Core>,
    gateway: SynthesisGateway,
    catalog: Arc<dyn VoiceCatalog>,
    selector: AvatarSelector,
}

impl SpeechDispatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        gateway: SynthesisGateway,
        catalog: Arc<dyn VoiceCatalog>,
        cleanup: CleanupHandle,
        selector: AvatarSelector,
    ) -> Self {
        let state = DispatcherState {
            queue: VecDeque::new(),
            in_flight: None,
            recency: selector.new_window(),
            detached: VecDeque::new(),
            generation: 0,
            rng: StdRng::from_entropy(),
        };
        Self {
            core: Arc::new(Core {
                registry,
                cleanup,
                state: Mutex::new(state),
                stall_timeout: None,
            }),
            gateway,
            catalog,
            selector,
        }
    }

    /// Release an item that has not completed after `timeout`.
    /// Must be applied before the dispatcher is shared.
    pub fn with_stall_timeout(mut self, timeout: Option<Duration>) -> Self {
        if let Some(core) = Arc::get_mut(&mut self.core) {
            core.stall_timeout = timeout;
        }
        self
    }

    /// Deterministic avatar selection, for tests and replays
    pub fn with_seed(mut self, seed: u64) -> Self {
        if let Some(core) = Arc::get_mut(&mut self.core) {
            core.state.get_mut().rng = StdRng::seed_from_u64(seed);
        }
        self
    }

    /// Entry point for control updates. Returns whether the update should
    /// continue to the regular broadcast: speech requests are consumed here,
    /// clears and everything else pass through.
    pub async fn intercept(&self, kind: &str, payload: Value) -> bool {
        match UpdateKind::parse(kind) {
            UpdateKind::SpeakRequest => {
                match self.submit(payload).await {
                    Ok(artifact) => {
                        debug!(target: "dispatcher", artifact = %artifact, "Speech request admitted")
                    }
                    Err(ChorusError::NoAvatarsConnected) => {
                        warn!(target: "dispatcher", "No connected avatars available for TTS; request dropped")
                    }
                    Err(ChorusError::EmptyText) => {
                        warn!(target: "dispatcher", "No text content found in speech request; dropped")
                    }
                    Err(e) => {
                        warn!(target: "dispatcher", error = %e, "Speech request dropped")
                    }
                }
                false
            }
            UpdateKind::Clear => {
                self.clear().await;
                true
            }
            UpdateKind::Other => true,
        }
    }

    /// Admission pipeline: pick an avatar from the current pool, pick one of
    /// its voices, synthesize, then enqueue. Any failure drops only this
    /// request.
    #[tracing::instrument(target = "dispatcher", skip(self, payload))]
    pub async fn submit(&self, payload: Value) -> Result<ArtifactRef> {
        let started = Instant::now();
        info!(target: "dispatcher", received_at = %chrono::Utc::now().to_rfc3339(), "New speech request received");

        let payload = match payload {
            Value::Object(map) => map,
            Value::String(text) => {
                let mut map = Map::new();
                map.insert("text".to_string(), Value::String(text));
                map
            }
            _ => Map::new(),
        };
        let text = protocol::extract_text(&payload).ok_or(ChorusError::EmptyText)?;

        let pool = self.core.registry.list_distinct_avatars();
        let avatar_id = {
            let mut guard = self.core.state.lock().await;
            let state = &mut *guard;
            self.selector
                .choose(&pool, &mut state.recency, &mut state.rng)
                .ok_or(ChorusError::NoAvatarsConnected)?
        };
        info!(target: "dispatcher", avatar_id = %avatar_id, pool = pool.len(), "Selected avatar");

        let voices = self.catalog.voices(&avatar_id).await;
        let voice = {
            let mut state = self.core.state.lock().await;
            voices.choose(&mut state.rng).cloned()
        }
        .ok_or_else(|| {
            SynthesisError::InvalidVoice(format!("avatar {} has no TTS voices", avatar_id))
        })?;
        debug!(target: "dispatcher", voice = %voice.voice_id, provider = %voice.provider, chars = text.len(), "Selected voice");

        let artifact = self.gateway.synthesize(&text, &voice).await?;

        self.enqueue(SpeechQueueItem {
            payload,
            target_avatar_id: avatar_id,
            artifact: artifact.clone(),
            voice,
        })
        .await;
        debug!(target: "dispatcher", elapsed_ms = started.elapsed().as_millis() as u64, "Admission finished");
        Ok(artifact)
    }

    /// Append an item to the queue and try to admit it
    pub async fn enqueue(&self, item: SpeechQueueItem) {
        let mut state = self.core.state.lock().await;
        info!(
            target: "dispatcher",
            avatar_id = %item.target_avatar_id,
            artifact = %item.artifact,
            position = state.queue.len() + 1,
            "Item added to queue"
        );
        state.queue.push_back(item);
        admit(&self.core, &mut state);
    }

    /// Completion signal from a client. Only the in-flight artifact moves the
    /// queue forward; anything else is ignored, apart from artifacts a clear
    /// released mid-playback, which still get their cleanup filed.
    /// Returns true when the in-flight item completed.
    pub async fn complete(&self, artifact: &ArtifactRef) -> bool {
        let mut state = self.core.state.lock().await;

        if state
            .in_flight
            .as_ref()
            .is_some_and(|f| &f.artifact == artifact)
        {
            if let Some(done) = state.in_flight.take() {
                info!(
                    target: "dispatcher",
                    avatar_id = %done.avatar_id,
                    artifact = %done.artifact,
                    played_ms = done.since.elapsed().as_millis() as u64,
                    remaining = state.queue.len(),
                    "Avatar finished speaking"
                );
                self.core.cleanup.delete_now(done.artifact);
            }
            admit(&self.core, &mut state);
            return true;
        }

        if let Some(pos) = state.detached.iter().position(|a| a == artifact) {
            if let Some(released) = state.detached.remove(pos) {
                debug!(target: "dispatcher", artifact = %released, "Finished signal for released item");
                self.core.cleanup.delete_now(released);
            }
            return false;
        }

        debug!(target: "dispatcher", artifact = %artifact, "Finished signal for an artifact not in flight; ignored");
        false
    }

    /// Complete by the URL a client echoed back
    pub async fn complete_url(&self, artifact_url: &str) -> Result<bool> {
        let artifact = ArtifactRef::from_url(artifact_url)?;
        Ok(self.complete(&artifact).await)
    }

    /// Drop every queued item (cleanup filed for each) and force `Idle`.
    /// An item already dispatched keeps playing; its later finish signal
    /// still cleans it up. Returns the number of queued items dropped.
    pub async fn clear(&self) -> usize {
        let mut state = self.core.state.lock().await;
        let dropped: Vec<SpeechQueueItem> = state.queue.drain(..).collect();
        for item in &dropped {
            self.core.cleanup.delete_now(item.artifact.clone());
        }
        if let Some(playing) = state.in_flight.take() {
            debug!(target: "dispatcher", artifact = %playing.artifact, "Released in-flight item on clear");
            state.detach(playing.artifact);
        }
        info!(target: "dispatcher", cleared = dropped.len(), "Cleared speech queue");
        dropped.len()
    }

    pub async fn state(&self) -> DispatchState {
        if self.core.state.lock().await.in_flight.is_some() {
            DispatchState::Dispatching
        } else {
            DispatchState::Idle
        }
    }

    pub async fn in_flight(&self) -> Option<ArtifactRef> {
        self.core
            .state
            .lock()
            .await
            .in_flight
            .as_ref()
            .map(|f| f.artifact.clone())
    }

    pub async fn queue_len(&self) -> usize {
        self.core.state.lock().await.queue.len()
    }

    pub async fn recent_avatars(&self) -> Vec<String> {
        self.core.state.lock().await.recency.to_vec()
    }

    pub async fn status(&self) -> DispatcherStatus {
        let connected_avatars: Vec<String> = self
            .core
            .registry
            .list_distinct_avatars()
            .into_iter()
            .collect();
        let state = self.core.state.lock().await;
        DispatcherStatus {
            state: if state.in_flight.is_some() {
                DispatchState::Dispatching
            } else {
                DispatchState::Idle
            },
            in_flight: state.in_flight.as_ref().map(|f| InFlightStatus {
                artifact: f.artifact.clone(),
                avatar_id: f.avatar_id.clone(),
                elapsed_ms: f.since.elapsed().as_millis() as u64,
            }),
            queued: state.queue.len(),
            queued_avatars: state
                .queue
                .iter()
                .map(|i| i.target_avatar_id.clone())
                .collect(),
            recent_avatars: state.recency.to_vec(),
            connected_avatars,
            scheduled_cleanups: self.core.cleanup.scheduled(),
            generated_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Admit transition. Runs with the state lock held; delivery is a
/// non-blocking fan-out so the lock is never held across I/O.
fn admit(core: &Arc<Core>, state: &mut DispatcherState) {
    loop {
        if let Some(current) = &state.in_flight {
            debug!(
                target: "dispatcher",
                avatar_id = %current.avatar_id,
                queued = state.queue.len(),
                "Avatar currently speaking; holding queue"
            );
            return;
        }
        let Some(item) = state.queue.pop_front() else {
            debug!(target: "dispatcher", "Queue empty");
            return;
        };

        let message = protocol::speak_message(&item.payload, &item.artifact);
        let recipients = core.registry.send_to(&item.target_avatar_id, &message);
        if recipients == 0 {
            let err = ChorusError::Delivery {
                avatar_id: item.target_avatar_id.clone(),
            };
            warn!(target: "dispatcher", artifact = %item.artifact, error = %err, "Message dropped; advancing queue");
            core.cleanup.delete_now(item.artifact);
            continue;
        }

        state.generation += 1;
        let generation = state.generation;
        info!(
            target: "dispatcher",
            avatar_id = %item.target_avatar_id,
            artifact = %item.artifact,
            voice = %item.voice.voice_id,
            provider = %item.voice.provider,
            recipients,
            remaining = state.queue.len(),
            "Dispatched speech"
        );
        state.in_flight = Some(InFlight {
            artifact: item.artifact,
            avatar_id: item.target_avatar_id,
            since: Instant::now(),
            generation,
        });

        if let Some(timeout) = core.stall_timeout {
            tokio::spawn(watchdog(Arc::clone(core), generation, timeout));
        }
        return;
    }
}

async fn watchdog(core: Arc<Core>, generation: u64, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    let mut state = core.state.lock().await;
    let stalled = state
        .in_flight
        .as_ref()
        .is_some_and(|f| f.generation == generation);
    if !stalled {
        return;
    }
    if let Some(stuck) = state.in_flight.take() {
        warn!(
            target: "dispatcher",
            avatar_id = %stuck.avatar_id,
            artifact = %stuck.artifact,
            timeout_ms = timeout.as_millis() as u64,
            "No finished signal before stall timeout; releasing"
        );
        core.cleanup.delete_now(stuck.artifact);
    }
    admit(&core, &mut state);
}
