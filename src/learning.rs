//! The learning loop: feedback-driven fitness and memory promotion.
//!
//! Two streams feed it: implicit per-interaction outcomes (success, latency,
//! confidence) and explicit feedback events. Updates are queued and applied
//! by a single background task, decoupled from the request path, with
//! at-least-once delivery and id-keyed idempotence.
//!
//! Fitness state lives in the [`FitnessBook`], a non-suspending score table
//! shared with the registry (capability ordering) and the router (candidate
//! scoring).

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, RwLock},
};

use tokio::sync::{mpsc, oneshot};

use crate::{
    capability::{Capability, Intent},
    config::LearningConfig,
    memory::MemoryFabric,
};

/// Score assigned to a pair never observed before.
const NEUTRAL_FITNESS: f32 = 0.5;

// ─── FitnessBook ──────────────────────────────────────────────────────────────

/// EWMA success scores per `(agent, intent)` and `(capability, intent)`.
///
/// All operations are synchronous and cheap; the book is read on the routing
/// hot path.
pub struct FitnessBook {
    lambda: f32,
    agents: RwLock<HashMap<(String, Intent), f32>>,
    capabilities: RwLock<HashMap<(Capability, Intent), f32>>,
}

impl FitnessBook {
    pub fn new(lambda: f32) -> Self {
        Self {
            lambda: lambda.clamp(0.0, 1.0),
            agents: RwLock::new(HashMap::new()),
            capabilities: RwLock::new(HashMap::new()),
        }
    }

    /// Fold a `[0, 1]` observation into the EWMA for each participant.
    pub fn observe(
        &self,
        participants: &[(String, Vec<Capability>)],
        intent: Intent,
        observation: f32,
    ) {
        let observation = observation.clamp(0.0, 1.0);
        let lambda = self.lambda;
        if let Ok(mut agents) = self.agents.write() {
            for (agent_id, _) in participants {
                let slot = agents
                    .entry((agent_id.clone(), intent))
                    .or_insert(NEUTRAL_FITNESS);
                *slot = lambda * *slot + (1.0 - lambda) * observation;
            }
        }
        if let Ok(mut capabilities) = self.capabilities.write() {
            for (_, caps) in participants {
                for cap in caps {
                    let slot = capabilities.entry((*cap, intent)).or_insert(NEUTRAL_FITNESS);
                    *slot = lambda * *slot + (1.0 - lambda) * observation;
                }
            }
        }
    }

    /// Move each participant's fitness toward 1 (positive score) or 0
    /// (negative score), scaled by `|score|`. Guaranteed monotone in the
    /// direction of the score's sign within one update.
    pub fn nudge(&self, participants: &[(String, Vec<Capability>)], intent: Intent, score: f32) {
        if score == 0.0 {
            return;
        }
        let target = if score > 0.0 { 1.0 } else { 0.0 };
        let step = (1.0 - self.lambda) * score.abs().min(1.0);
        if let Ok(mut agents) = self.agents.write() {
            for (agent_id, _) in participants {
                let slot = agents
                    .entry((agent_id.clone(), intent))
                    .or_insert(NEUTRAL_FITNESS);
                *slot += step * (target - *slot);
            }
        }
        if let Ok(mut capabilities) = self.capabilities.write() {
            for (_, caps) in participants {
                for cap in caps {
                    let slot = capabilities.entry((*cap, intent)).or_insert(NEUTRAL_FITNESS);
                    *slot += step * (target - *slot);
                }
            }
        }
    }

    pub fn agent_fitness(&self, agent_id: &str, intent: Intent) -> f32 {
        self.agents
            .read()
            .ok()
            .and_then(|m| m.get(&(agent_id.to_owned(), intent)).copied())
            .unwrap_or(NEUTRAL_FITNESS)
    }

    pub fn capability_fitness(&self, cap: Capability, intent: Intent) -> f32 {
        self.capabilities
            .read()
            .ok()
            .and_then(|m| m.get(&(cap, intent)).copied())
            .unwrap_or(NEUTRAL_FITNESS)
    }

    /// Mean fitness of an agent across every intent it has been observed on.
    pub fn overall(&self, agent_id: &str) -> f32 {
        let Ok(agents) = self.agents.read() else {
            return NEUTRAL_FITNESS;
        };
        let scores: Vec<f32> = agents
            .iter()
            .filter(|((id, _), _)| id == agent_id)
            .map(|(_, score)| *score)
            .collect();
        if scores.is_empty() {
            NEUTRAL_FITNESS
        } else {
            scores.iter().sum::<f32>() / scores.len() as f32
        }
    }
}

// ─── LearningEvent ────────────────────────────────────────────────────────────

/// One update for the background task.
pub enum LearningEvent {
    /// Implicit outcome of a completed interaction.
    Outcome {
        interaction_id: String,
        participants: Vec<(String, Vec<Capability>)>,
        intent: Intent,
        success: bool,
        latency_ms: u64,
        confidence: f32,
    },
    /// Explicit feedback on an interaction.
    Feedback {
        event_id: String,
        interaction_id: String,
        participants: Vec<(String, Vec<Capability>)>,
        intent: Intent,
        score: f32,
        source: String,
    },
    /// Barrier: acknowledged once everything enqueued before it is applied.
    Flush(oneshot::Sender<()>),
}

impl LearningEvent {
    fn idempotence_key(&self) -> Option<String> {
        match self {
            LearningEvent::Outcome { interaction_id, .. } => {
                Some(format!("outcome:{interaction_id}"))
            }
            LearningEvent::Feedback { event_id, .. } => Some(format!("feedback:{event_id}")),
            LearningEvent::Flush(_) => None,
        }
    }

    fn coalesce_key(&self) -> Option<String> {
        match self {
            LearningEvent::Outcome { interaction_id, .. } => {
                Some(format!("outcome:{interaction_id}"))
            }
            LearningEvent::Feedback {
                interaction_id,
                source,
                ..
            } => Some(format!("feedback:{interaction_id}:{source}")),
            LearningEvent::Flush(_) => None,
        }
    }
}

// ─── LearningHandle ───────────────────────────────────────────────────────────

type Overflow = Arc<Mutex<HashMap<String, LearningEvent>>>;

/// Multi-producer handle onto the learning queue.
#[derive(Clone)]
pub struct LearningHandle {
    tx: mpsc::Sender<LearningEvent>,
    overflow: Overflow,
}

impl LearningHandle {
    /// Enqueue an update. When the queue is full the event coalesces into
    /// the overflow map (replacing an older event for the same interaction
    /// and source) instead of being dropped outright.
    pub fn submit(&self, event: LearningEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                if let Some(key) = event.coalesce_key() {
                    if let Ok(mut overflow) = self.overflow.lock() {
                        overflow.insert(key, event);
                    }
                }
                log::debug!("[learning] queue full, coalesced update");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::warn!("[learning] update dropped: loop has shut down");
            }
        }
    }

    /// Wait until every update submitted before this call has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(LearningEvent::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

// ─── LearningLoop ─────────────────────────────────────────────────────────────

/// The serial consumer of learning updates.
pub struct LearningLoop {
    fitness: Arc<FitnessBook>,
    fabric: Arc<MemoryFabric>,
    seen: HashSet<String>,
}

impl LearningLoop {
    /// Spawn the background task. Dropping every handle ends the loop.
    pub fn spawn(
        fitness: Arc<FitnessBook>,
        fabric: Arc<MemoryFabric>,
        config: &LearningConfig,
    ) -> (LearningHandle, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(config.queue_capacity.max(1));
        let overflow: Overflow = Arc::new(Mutex::new(HashMap::new()));
        let handle = LearningHandle {
            tx,
            overflow: overflow.clone(),
        };

        let mut state = LearningLoop {
            fitness,
            fabric,
            seen: HashSet::new(),
        };
        let join = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                state.drain_overflow(&overflow).await;
                state.apply(event).await;
            }
            log::debug!("[learning] loop stopped");
        });
        (handle, join)
    }

    async fn drain_overflow(&mut self, overflow: &Overflow) {
        let drained: Vec<LearningEvent> = match overflow.lock() {
            Ok(mut map) => map.drain().map(|(_, e)| e).collect(),
            Err(_) => Vec::new(),
        };
        for event in drained {
            self.apply(event).await;
        }
    }

    async fn apply(&mut self, event: LearningEvent) {
        if let Some(key) = event.idempotence_key() {
            if !self.seen.insert(key) {
                return;
            }
        }
        match event {
            LearningEvent::Outcome {
                interaction_id,
                participants,
                intent,
                success,
                latency_ms,
                confidence,
            } => {
                let base = if success { 1.0 } else { 0.0 };
                // Feedback already attached to the interaction shifts the
                // observation before it is folded in.
                let feedback = self
                    .fabric
                    .interaction(&interaction_id)
                    .and_then(|r| r.feedback_score)
                    .unwrap_or(0.0);
                let observation = (base + 0.5 * feedback).clamp(0.0, 1.0);
                self.fitness.observe(&participants, intent, observation);
                log::debug!(
                    "[learning] outcome interaction_id={interaction_id} intent={intent} \
                     success={success} latency_ms={latency_ms} confidence={confidence:.2}"
                );
            }
            LearningEvent::Feedback {
                event_id,
                interaction_id,
                participants,
                intent,
                score,
                source,
            } => {
                if let Err(e) = self.fabric.apply_feedback(&interaction_id, score, &source).await {
                    log::warn!("[learning] feedback {event_id} not applied to memory: {e}");
                }
                self.fitness.nudge(&participants, intent, score);
                log::debug!(
                    "[learning] feedback event_id={event_id} interaction_id={interaction_id} score={score:.2}"
                );
            }
            LearningEvent::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
