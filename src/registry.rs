//! `AgentRegistry` — capability-indexed directory and lifecycle manager for
//! agents.
//!
//! # Locking discipline
//! The registry map is guarded by a plain `RwLock`; lookups never suspend.
//! Lifecycle transitions for one agent are totally ordered by that agent's
//! async operation lock, so a single agent never services two dispatches
//! concurrently and `busy` always means exactly one checked-out task.
//!
//! # Lifecycle
//! ```text
//! uninitialized --initialize--> ready --dispatch--> busy --complete--> ready
//! ready/busy --error--> degraded --N failures--> failed
//! degraded --recover--> ready
//! any --shutdown--> shutdown (terminal)
//! ```
//! A `failed` agent is not selectable until a re-initialize succeeds.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use tokio::sync::Mutex;

use crate::{
    agent::{Agent, AgentDescriptor, AgentProfile, AgentStatus},
    capability::Capability,
    config::RegistryConfig,
    error::{CoreError, CoreResult},
    events::{CoreEvent, EventBus},
    learning::FitnessBook,
    orchestrator::Deadline,
};

// ─── AgentEntry ───────────────────────────────────────────────────────────────

struct AgentState {
    status: AgentStatus,
    instance: Option<Arc<dyn Agent>>,
    consecutive_failures: u32,
    last_latency_ms: Option<u64>,
}

struct AgentEntry {
    descriptor: AgentDescriptor,
    /// Totally orders lifecycle transitions for this agent.
    op_lock: Mutex<()>,
    state: RwLock<AgentState>,
}

impl AgentEntry {
    fn status(&self) -> AgentStatus {
        self.state
            .read()
            .map(|s| s.status)
            .unwrap_or(AgentStatus::Failed)
    }
}

// ─── AgentRegistry ────────────────────────────────────────────────────────────

pub struct AgentRegistry {
    entries: RwLock<HashMap<String, Arc<AgentEntry>>>,
    fitness: Arc<FitnessBook>,
    bus: Option<Arc<dyn EventBus>>,
    config: RegistryConfig,
}

impl AgentRegistry {
    pub fn new(fitness: Arc<FitnessBook>, config: RegistryConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            fitness,
            bus: None,
            config,
        }
    }

    pub fn with_event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    // ── Registration ─────────────────────────────────────────────────────

    /// Atomically insert a new agent record.
    ///
    /// Rejects an empty capability set and unresolved dependencies; a
    /// duplicate id is a conflict.
    pub fn register(&self, descriptor: AgentDescriptor) -> CoreResult<()> {
        if descriptor.capabilities.is_empty() {
            return Err(CoreError::Validation(format!(
                "agent '{}' declares no capabilities",
                descriptor.agent_id
            )));
        }
        let mut entries = self.entries_write()?;
        if entries.contains_key(&descriptor.agent_id) {
            return Err(CoreError::Conflict(format!(
                "agent '{}' is already registered",
                descriptor.agent_id
            )));
        }
        for dep in &descriptor.dependencies {
            if !entries.contains_key(dep) {
                return Err(CoreError::Validation(format!(
                    "agent '{}' depends on unregistered agent '{dep}'",
                    descriptor.agent_id
                )));
            }
        }

        let agent_id = descriptor.agent_id.clone();
        entries.insert(
            agent_id.clone(),
            Arc::new(AgentEntry {
                descriptor,
                op_lock: Mutex::new(()),
                state: RwLock::new(AgentState {
                    status: AgentStatus::Uninitialized,
                    instance: None,
                    consecutive_failures: 0,
                    last_latency_ms: None,
                }),
            }),
        );
        drop(entries);
        log::info!("[registry] registered agent_id={agent_id}");
        self.publish_status(&agent_id, AgentStatus::Uninitialized);
        Ok(())
    }

    /// Shut an agent down and remove its record.
    ///
    /// Fails with a conflict while the agent stays busy beyond the grace
    /// window, or while other agents depend on it.
    pub async fn unregister(&self, agent_id: &str) -> CoreResult<()> {
        {
            let entries = self.entries_read()?;
            if !entries.contains_key(agent_id) {
                return Err(CoreError::Validation(format!("unknown agent '{agent_id}'")));
            }
            if let Some(dependent) = entries
                .values()
                .find(|e| e.descriptor.dependencies.iter().any(|d| d == agent_id))
            {
                return Err(CoreError::Conflict(format!(
                    "agent '{}' still depends on '{agent_id}'",
                    dependent.descriptor.agent_id
                )));
            }
        }
        let entry = self.entry(agent_id)?;

        let grace = Duration::from_millis(self.config.unregister_grace_ms);
        let waited = tokio::time::Instant::now();
        loop {
            let _op = entry.op_lock.lock().await;
            let status = entry.status();
            if status != AgentStatus::Busy {
                let mut state = self.state_write(&entry)?;
                state.status = AgentStatus::Shutdown;
                state.instance = None;
                break;
            }
            drop(_op);
            if waited.elapsed() >= grace {
                return Err(CoreError::Conflict(format!(
                    "agent '{agent_id}' is busy beyond the grace window"
                )));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        self.entries_write()?.remove(agent_id);
        log::info!("[registry] unregistered agent_id={agent_id}");
        self.publish_status(agent_id, AgentStatus::Shutdown);
        Ok(())
    }

    // ── Lookup ───────────────────────────────────────────────────────────

    /// Handle to an instantiated agent.
    pub fn get(&self, agent_id: &str) -> CoreResult<Arc<dyn Agent>> {
        let entry = self.entry(agent_id)?;
        let state = self.state_read(&entry)?;
        state.instance.clone().ok_or_else(|| {
            CoreError::Validation(format!("agent '{agent_id}' is not instantiated"))
        })
    }

    pub fn profile(&self, agent_id: &str) -> CoreResult<AgentProfile> {
        Ok(self.entry(agent_id)?.descriptor.profile())
    }

    pub fn status(&self, agent_id: &str) -> CoreResult<AgentStatus> {
        Ok(self.entry(agent_id)?.status())
    }

    pub fn dependencies_of(&self, agent_id: &str) -> CoreResult<Vec<String>> {
        Ok(self.entry(agent_id)?.descriptor.dependencies.clone())
    }

    /// Last dispatch latency, for routing tie-breaks.
    pub fn last_latency_ms(&self, agent_id: &str) -> Option<u64> {
        let entry = self.entry(agent_id).ok()?;
        self.state_read(&entry).ok().and_then(|s| s.last_latency_ms)
    }

    /// Agents declaring `cap`, ordered by learned fitness (descending), then
    /// id. Shut-down agents are excluded; callers filter by status further.
    pub fn find_by_capability(&self, cap: Capability) -> Vec<String> {
        let Ok(entries) = self.entries_read() else {
            return Vec::new();
        };
        let mut ids: Vec<String> = entries
            .values()
            .filter(|e| {
                e.descriptor.capabilities.contains(&cap) && e.status() != AgentStatus::Shutdown
            })
            .map(|e| e.descriptor.agent_id.clone())
            .collect();
        ids.sort_by(|a, b| {
            let fa = self.fitness.overall(a);
            let fb = self.fitness.overall(b);
            fb.partial_cmp(&fa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.cmp(b))
        });
        ids
    }

    /// Every registered agent id.
    pub fn all_ids(&self) -> Vec<String> {
        self.entries_read()
            .map(|m| {
                let mut ids: Vec<String> = m.keys().cloned().collect();
                ids.sort();
                ids
            })
            .unwrap_or_default()
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Lazy initialization: run the constructor and the agent's self-check.
    ///
    /// Also serves as the operator-triggered re-initialize for `failed`
    /// agents and as an explicit recover for `degraded` ones.
    pub async fn instantiate(&self, agent_id: &str) -> CoreResult<()> {
        let entry = self.entry(agent_id)?;
        let _op = entry.op_lock.lock().await;
        self.instantiate_locked(agent_id, &entry).await
    }

    async fn instantiate_locked(&self, agent_id: &str, entry: &Arc<AgentEntry>) -> CoreResult<()> {
        match entry.status() {
            AgentStatus::Ready | AgentStatus::Busy => return Ok(()),
            AgentStatus::Shutdown => {
                return Err(CoreError::Conflict(format!(
                    "agent '{agent_id}' is shut down"
                )));
            }
            AgentStatus::Uninitialized | AgentStatus::Degraded | AgentStatus::Failed => {}
        }

        let instance = match (entry.descriptor.constructor)() {
            Ok(instance) => instance,
            Err(e) => {
                self.state_write(entry)?.status = AgentStatus::Failed;
                self.publish_status(agent_id, AgentStatus::Failed);
                log::warn!("[registry] constructor failed agent_id={agent_id}: {e}");
                return Err(e);
            }
        };
        if let Err(e) = instance.health().await {
            self.state_write(entry)?.status = AgentStatus::Failed;
            self.publish_status(agent_id, AgentStatus::Failed);
            log::warn!("[registry] self-check failed agent_id={agent_id}: {e}");
            return Err(e);
        }

        {
            let mut state = self.state_write(entry)?;
            state.instance = Some(instance);
            state.status = AgentStatus::Ready;
            state.consecutive_failures = 0;
        }
        log::info!("[registry] agent ready agent_id={agent_id}");
        self.publish_status(agent_id, AgentStatus::Ready);
        Ok(())
    }

    /// Check an agent out for one dispatch: `ready → busy`.
    ///
    /// An uninitialized agent is instantiated first. A busy agent is waited
    /// on (transitions are serialized) until the deadline expires.
    pub async fn checkout(&self, agent_id: &str, deadline: Deadline) -> CoreResult<Arc<dyn Agent>> {
        let entry = self.entry(agent_id)?;
        loop {
            {
                let _op = entry.op_lock.lock().await;
                match entry.status() {
                    AgentStatus::Uninitialized => {
                        self.instantiate_locked(agent_id, &entry).await?;
                    }
                    AgentStatus::Ready => {}
                    AgentStatus::Busy => {
                        // fall through to the wait below
                    }
                    status => {
                        return Err(CoreError::Conflict(format!(
                            "agent '{agent_id}' is {status}, not dispatchable"
                        )));
                    }
                }
                if entry.status() == AgentStatus::Ready {
                    let mut state = self.state_write(&entry)?;
                    let Some(instance) = state.instance.clone() else {
                        state.status = AgentStatus::Degraded;
                        drop(state);
                        self.publish_status(agent_id, AgentStatus::Degraded);
                        return Err(CoreError::InternalInvariant(format!(
                            "agent '{agent_id}' is ready with no instance"
                        )));
                    };
                    state.status = AgentStatus::Busy;
                    drop(state);
                    self.publish_status(agent_id, AgentStatus::Busy);
                    return Ok(instance);
                }
            }
            deadline.check()?;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Return a checked-out agent: `busy → ready` on success, `busy →
    /// degraded` (escalating to `failed`) on error.
    pub async fn complete(&self, agent_id: &str, success: bool, latency_ms: u64) -> CoreResult<()> {
        let entry = self.entry(agent_id)?;
        let _op = entry.op_lock.lock().await;
        let next = {
            let mut state = self.state_write(&entry)?;
            if state.status != AgentStatus::Busy {
                log::error!(
                    "[registry] complete() on non-busy agent agent_id={agent_id} status={}",
                    state.status
                );
                state.status = AgentStatus::Degraded;
                AgentStatus::Degraded
            } else if success {
                state.status = AgentStatus::Ready;
                state.consecutive_failures = 0;
                state.last_latency_ms = Some(latency_ms);
                AgentStatus::Ready
            } else {
                state.consecutive_failures += 1;
                state.last_latency_ms = Some(latency_ms);
                state.status = if state.consecutive_failures >= self.config.failure_threshold {
                    AgentStatus::Failed
                } else {
                    AgentStatus::Degraded
                };
                state.status
            }
        };
        self.publish_status(agent_id, next);
        Ok(())
    }

    /// Quarantine an agent that overran its cancellation grace period or
    /// violated an invariant.
    pub async fn mark_degraded(&self, agent_id: &str, reason: &str) -> CoreResult<()> {
        let entry = self.entry(agent_id)?;
        let _op = entry.op_lock.lock().await;
        let next = {
            let mut state = self.state_write(&entry)?;
            if state.status == AgentStatus::Shutdown {
                return Ok(());
            }
            state.consecutive_failures += 1;
            state.status = if state.consecutive_failures >= self.config.failure_threshold {
                AgentStatus::Failed
            } else {
                AgentStatus::Degraded
            };
            state.status
        };
        log::warn!("[registry] agent degraded agent_id={agent_id} reason={reason}");
        self.publish_status(agent_id, next);
        Ok(())
    }

    // ── Health ───────────────────────────────────────────────────────────

    /// Probe every instantiated agent and return the resulting status map.
    ///
    /// A degraded agent that passes its probe recovers to ready; a failing
    /// probe degrades (escalating to failed). Busy agents are skipped.
    pub async fn health_all(&self) -> HashMap<String, AgentStatus> {
        let ids = self.all_ids();
        let mut out = HashMap::new();
        for agent_id in ids {
            let Ok(entry) = self.entry(&agent_id) else {
                continue;
            };
            let _op = entry.op_lock.lock().await;
            let (status, instance) = {
                let Ok(state) = self.state_read(&entry) else {
                    continue;
                };
                (state.status, state.instance.clone())
            };
            let probed = match (status, instance) {
                (AgentStatus::Ready | AgentStatus::Degraded, Some(instance)) => {
                    match instance.health().await {
                        Ok(()) => {
                            if status == AgentStatus::Degraded {
                                if let Ok(mut state) = self.state_write(&entry) {
                                    state.status = AgentStatus::Ready;
                                    state.consecutive_failures = 0;
                                }
                                self.publish_status(&agent_id, AgentStatus::Ready);
                                AgentStatus::Ready
                            } else {
                                status
                            }
                        }
                        Err(e) => {
                            log::warn!("[registry] probe failed agent_id={agent_id}: {e}");
                            let next = {
                                match self.state_write(&entry) {
                                    Ok(mut state) => {
                                        state.consecutive_failures += 1;
                                        state.status = if state.consecutive_failures
                                            >= self.config.failure_threshold
                                        {
                                            AgentStatus::Failed
                                        } else {
                                            AgentStatus::Degraded
                                        };
                                        state.status
                                    }
                                    Err(_) => AgentStatus::Degraded,
                                }
                            };
                            self.publish_status(&agent_id, next);
                            next
                        }
                    }
                }
                (status, _) => status,
            };
            out.insert(agent_id, probed);
        }
        out
    }

    /// Run [`AgentRegistry::health_all`] on the configured interval.
    pub fn spawn_health_monitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = Duration::from_millis(registry.config.health_interval_ms.max(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let statuses = registry.health_all().await;
                log::debug!("[registry] health sweep agents={}", statuses.len());
            }
        })
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn entry(&self, agent_id: &str) -> CoreResult<Arc<AgentEntry>> {
        self.entries_read()?
            .get(agent_id)
            .cloned()
            .ok_or_else(|| CoreError::Validation(format!("unknown agent '{agent_id}'")))
    }

    fn publish_status(&self, agent_id: &str, status: AgentStatus) {
        if let Some(bus) = &self.bus {
            bus.publish(CoreEvent::AgentStatus {
                agent_id: agent_id.to_owned(),
                status,
            });
        }
    }

    fn entries_read(
        &self,
    ) -> CoreResult<std::sync::RwLockReadGuard<'_, HashMap<String, Arc<AgentEntry>>>> {
        self.entries
            .read()
            .map_err(|_| CoreError::InternalInvariant("registry lock poisoned".into()))
    }

    fn entries_write(
        &self,
    ) -> CoreResult<std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<AgentEntry>>>> {
        self.entries
            .write()
            .map_err(|_| CoreError::InternalInvariant("registry lock poisoned".into()))
    }

    fn state_read<'a>(
        &self,
        entry: &'a AgentEntry,
    ) -> CoreResult<std::sync::RwLockReadGuard<'a, AgentState>> {
        entry
            .state
            .read()
            .map_err(|_| CoreError::InternalInvariant("agent state lock poisoned".into()))
    }

    fn state_write<'a>(
        &self,
        entry: &'a AgentEntry,
    ) -> CoreResult<std::sync::RwLockWriteGuard<'a, AgentState>> {
        entry
            .state
            .write()
            .map_err(|_| CoreError::InternalInvariant("agent state lock poisoned".into()))
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        agent::{AgentConstructor, AgentReply, AgentType, InvocationContext},
        capability::Intent,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubAgent {
        agent_id: String,
        healthy: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Agent for StubAgent {
        async fn invoke(&self, _ctx: InvocationContext) -> CoreResult<AgentReply> {
            Ok(AgentReply::new("ok", 0.9))
        }
        async fn health(&self) -> CoreResult<()> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(CoreError::Transient("unhealthy".into()))
            }
        }
        fn describe(&self) -> AgentProfile {
            AgentProfile {
                agent_id: self.agent_id.clone(),
                name: self.agent_id.clone(),
                agent_type: AgentType::Custom("stub".into()),
                capabilities: vec![Capability::Conversational],
            }
        }
    }

    fn descriptor(agent_id: &str, caps: Vec<Capability>) -> (AgentDescriptor, Arc<AtomicBool>) {
        let healthy = Arc::new(AtomicBool::new(true));
        let healthy2 = healthy.clone();
        let id = agent_id.to_owned();
        let ctor: AgentConstructor = Arc::new(move || {
            Ok(Arc::new(StubAgent {
                agent_id: id.clone(),
                healthy: healthy2.clone(),
            }) as Arc<dyn Agent>)
        });
        (
            AgentDescriptor::new(agent_id, agent_id, AgentType::Custom("stub".into()), caps, ctor),
            healthy,
        )
    }

    fn registry() -> AgentRegistry {
        AgentRegistry::new(Arc::new(FitnessBook::new(0.9)), RegistryConfig {
            failure_threshold: 2,
            unregister_grace_ms: 50,
            health_interval_ms: 1_000,
        })
    }

    #[test]
    fn register_rejects_duplicates_and_empty_capabilities() {
        let reg = registry();
        let (desc, _) = descriptor("a1", vec![Capability::Conversational]);
        reg.register(desc).unwrap();

        let (dup, _) = descriptor("a1", vec![Capability::Conversational]);
        assert_eq!(
            reg.register(dup).unwrap_err().kind(),
            crate::error::ErrorKind::Conflict
        );

        let (empty, _) = descriptor("a2", vec![]);
        assert_eq!(
            reg.register(empty).unwrap_err().kind(),
            crate::error::ErrorKind::Validation
        );
    }

    #[test]
    fn register_rejects_unresolved_dependency() {
        let reg = registry();
        let (mut desc, _) = descriptor("a1", vec![Capability::Conversational]);
        desc.dependencies.push("ghost".to_owned());
        assert_eq!(
            reg.register(desc).unwrap_err().kind(),
            crate::error::ErrorKind::Validation
        );
    }

    #[tokio::test]
    async fn instantiate_transitions_to_ready() {
        let reg = registry();
        let (desc, _) = descriptor("a1", vec![Capability::Conversational]);
        reg.register(desc).unwrap();
        assert_eq!(reg.status("a1").unwrap(), AgentStatus::Uninitialized);

        reg.instantiate("a1").await.unwrap();
        assert_eq!(reg.status("a1").unwrap(), AgentStatus::Ready);
        assert!(reg.get("a1").is_ok());
    }

    #[tokio::test]
    async fn failed_self_check_marks_failed() {
        let reg = registry();
        let (desc, healthy) = descriptor("a1", vec![Capability::Conversational]);
        healthy.store(false, Ordering::SeqCst);
        reg.register(desc).unwrap();
        assert!(reg.instantiate("a1").await.is_err());
        assert_eq!(reg.status("a1").unwrap(), AgentStatus::Failed);
    }

    #[tokio::test]
    async fn checkout_and_complete_round_trip() {
        let reg = registry();
        let (desc, _) = descriptor("a1", vec![Capability::Conversational]);
        reg.register(desc).unwrap();
        reg.instantiate("a1").await.unwrap();

        let _agent = reg.checkout("a1", Deadline::none()).await.unwrap();
        assert_eq!(reg.status("a1").unwrap(), AgentStatus::Busy);

        reg.complete("a1", true, 12).await.unwrap();
        assert_eq!(reg.status("a1").unwrap(), AgentStatus::Ready);
        assert_eq!(reg.last_latency_ms("a1"), Some(12));
    }

    #[tokio::test]
    async fn checkout_instantiates_lazily() {
        let reg = registry();
        let (desc, _) = descriptor("a1", vec![Capability::Conversational]);
        reg.register(desc).unwrap();
        let _agent = reg.checkout("a1", Deadline::none()).await.unwrap();
        assert_eq!(reg.status("a1").unwrap(), AgentStatus::Busy);
    }

    #[tokio::test]
    async fn failures_escalate_to_failed() {
        let reg = registry();
        let (desc, _) = descriptor("a1", vec![Capability::Conversational]);
        reg.register(desc).unwrap();
        reg.instantiate("a1").await.unwrap();

        let _ = reg.checkout("a1", Deadline::none()).await.unwrap();
        reg.complete("a1", false, 5).await.unwrap();
        assert_eq!(reg.status("a1").unwrap(), AgentStatus::Degraded);

        // Second consecutive failure hits the threshold of 2.
        reg.mark_degraded("a1", "cancellation overrun").await.unwrap();
        assert_eq!(reg.status("a1").unwrap(), AgentStatus::Failed);

        // Operator-triggered re-initialize brings it back.
        reg.instantiate("a1").await.unwrap();
        assert_eq!(reg.status("a1").unwrap(), AgentStatus::Ready);
    }

    #[tokio::test]
    async fn unregister_restores_capability_index() {
        let reg = registry();
        let (a, _) = descriptor("a1", vec![Capability::Conversational]);
        reg.register(a).unwrap();
        let before = reg.find_by_capability(Capability::Conversational);
        assert_eq!(before, vec!["a1".to_owned()]);

        let (b, _) = descriptor("b1", vec![Capability::Conversational]);
        reg.register(b).unwrap();
        reg.unregister("b1").await.unwrap();
        assert_eq!(reg.find_by_capability(Capability::Conversational), before);
    }

    #[tokio::test]
    async fn unregister_busy_agent_conflicts_after_grace() {
        let reg = registry();
        let (desc, _) = descriptor("a1", vec![Capability::Conversational]);
        reg.register(desc).unwrap();
        reg.instantiate("a1").await.unwrap();
        let _agent = reg.checkout("a1", Deadline::none()).await.unwrap();

        let err = reg.unregister("a1").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
        assert_eq!(reg.status("a1").unwrap(), AgentStatus::Busy);
    }

    #[tokio::test]
    async fn unregister_dependency_target_conflicts() {
        let reg = registry();
        let (base, _) = descriptor("base", vec![Capability::Search]);
        reg.register(base).unwrap();
        let (mut dep, _) = descriptor("dep", vec![Capability::Analysis]);
        dep.dependencies.push("base".to_owned());
        reg.register(dep).unwrap();

        let err = reg.unregister("base").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn health_all_recovers_degraded_agents() {
        let reg = registry();
        let (desc, _) = descriptor("a1", vec![Capability::Conversational]);
        reg.register(desc).unwrap();
        reg.instantiate("a1").await.unwrap();
        reg.mark_degraded("a1", "test").await.unwrap();
        assert_eq!(reg.status("a1").unwrap(), AgentStatus::Degraded);

        let statuses = reg.health_all().await;
        assert_eq!(statuses.get("a1"), Some(&AgentStatus::Ready));
    }

    #[tokio::test]
    async fn health_all_degrades_unhealthy_agents() {
        let reg = registry();
        let (desc, healthy) = descriptor("a1", vec![Capability::Conversational]);
        reg.register(desc).unwrap();
        reg.instantiate("a1").await.unwrap();

        healthy.store(false, Ordering::SeqCst);
        let statuses = reg.health_all().await;
        assert_eq!(statuses.get("a1"), Some(&AgentStatus::Degraded));
    }

    #[tokio::test]
    async fn find_by_capability_orders_by_fitness() {
        let fitness = Arc::new(FitnessBook::new(0.5));
        let reg = AgentRegistry::new(fitness.clone(), RegistryConfig::default());
        let (a, _) = descriptor("alpha", vec![Capability::CodeGeneration]);
        let (b, _) = descriptor("beta", vec![Capability::CodeGeneration]);
        reg.register(a).unwrap();
        reg.register(b).unwrap();

        // Equal fitness: lexicographic order.
        assert_eq!(
            reg.find_by_capability(Capability::CodeGeneration),
            vec!["alpha".to_owned(), "beta".to_owned()]
        );

        // Raise beta's fitness; it should now lead.
        fitness.observe(
            &[("beta".to_owned(), vec![Capability::CodeGeneration])],
            Intent::CodeGeneration,
            1.0,
        );
        assert_eq!(
            reg.find_by_capability(Capability::CodeGeneration),
            vec!["beta".to_owned(), "alpha".to_owned()]
        );
    }
}
