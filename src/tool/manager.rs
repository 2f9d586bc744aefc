//! `ToolManager` — exclusive owner of every registered tool.
//!
//! Agents never hold tool handles directly: they receive a [`ToolScope`],
//! which carries a weak reference to the manager plus an optional name
//! filter. If the manager is dropped, scoped invocations fail with a
//! tool-unavailable result rather than keeping the tools alive.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock, Weak},
    time::Instant,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    capability::Capability,
    error::{CoreError, CoreResult, ErrorKind},
    tool::contract::{PrivilegePolicy, Tool, ToolHealth, ToolHealthReport, UnifiedResult},
};

// ─── ToolDescriptor ───────────────────────────────────────────────────────────

/// Summary of a registered tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    pub capabilities: Vec<Capability>,
    pub privileged: bool,
}

// ─── ToolManager ──────────────────────────────────────────────────────────────

/// Registry and dispatcher for tools.
pub struct ToolManager {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    /// Last observed execution latency per tool, fed into health reports.
    last_latency_ms: RwLock<HashMap<String, u64>>,
}

impl ToolManager {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            last_latency_ms: RwLock::new(HashMap::new()),
        }
    }

    /// Register and initialize a tool.
    ///
    /// Rejects privileged tools that do not advertise a guarded policy, and
    /// duplicate names.
    pub async fn register(&self, tool: Arc<dyn Tool>) -> CoreResult<()> {
        let name = tool.name().to_owned();
        if tool.capabilities().is_empty() {
            return Err(CoreError::Validation(format!(
                "tool '{name}' declares no capabilities"
            )));
        }
        if tool.privileged() && !tool.policy().is_guarded() {
            return Err(CoreError::Validation(format!(
                "privileged tool '{name}' must advertise a guarded input policy"
            )));
        }
        {
            let map = self.tools_read()?;
            if map.contains_key(&name) {
                return Err(CoreError::Conflict(format!("tool '{name}' already registered")));
            }
        }

        tool.initialize()
            .await
            .map_err(|e| CoreError::Validation(format!("tool '{name}' failed to initialize: {e}")))?;

        self.tools_write()?.insert(name.clone(), tool);
        log::info!("[tools] registered tool={name}");
        Ok(())
    }

    /// Shut down and remove a tool. Removing an unknown name is a no-op.
    pub async fn remove(&self, name: &str) -> CoreResult<()> {
        let tool = self.tools_write()?.remove(name);
        if let Some(tool) = tool {
            tool.shutdown().await;
            log::info!("[tools] removed tool={name}");
        }
        Ok(())
    }

    /// Descriptors for every registered tool, sorted by name.
    pub fn list(&self) -> Vec<ToolDescriptor> {
        let Ok(map) = self.tools_read() else {
            return Vec::new();
        };
        let mut out: Vec<ToolDescriptor> = map
            .values()
            .map(|t| ToolDescriptor {
                name: t.name().to_owned(),
                capabilities: t.capabilities().to_vec(),
                privileged: t.privileged(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Names of tools implementing `cap`, sorted.
    pub fn find_by_capability(&self, cap: Capability) -> Vec<String> {
        let Ok(map) = self.tools_read() else {
            return Vec::new();
        };
        let mut out: Vec<String> = map
            .values()
            .filter(|t| t.capabilities().contains(&cap))
            .map(|t| t.name().to_owned())
            .collect();
        out.sort();
        out
    }

    /// Execute `action` on the named tool.
    ///
    /// The guarded-policy checks run here, at the call boundary: actions
    /// outside the allowlist and arguments matching a blocked pattern fail
    /// with a validation result before the tool sees them. A tool whose
    /// probe reports `unavailable` fails without being invoked.
    pub async fn execute(&self, name: &str, action: &str, args: Value) -> UnifiedResult {
        let tool = match self.tools_read().ok().and_then(|m| m.get(name).cloned()) {
            Some(t) => t,
            None => {
                return UnifiedResult::failure(
                    name,
                    "unknown",
                    ErrorKind::Validation,
                    format!("unknown tool '{name}'"),
                    0,
                );
            }
        };
        let category = tool
            .capabilities()
            .first()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "unknown".to_owned());

        if let PrivilegePolicy::Guarded {
            allowed_actions,
            blocked_patterns,
        } = tool.policy()
        {
            if !allowed_actions.iter().any(|a| a == action) {
                return UnifiedResult::failure(
                    name,
                    category,
                    ErrorKind::Validation,
                    format!("action '{action}' not in the allowlist of privileged tool '{name}'"),
                    0,
                );
            }
            let rendered = args.to_string();
            if let Some(pattern) = blocked_patterns.iter().find(|p| rendered.contains(p.as_str())) {
                return UnifiedResult::failure(
                    name,
                    category,
                    ErrorKind::Validation,
                    format!("arguments match blocked pattern '{pattern}'"),
                    0,
                );
            }
        }

        let probe = tool.health().await;
        if probe.health == ToolHealth::Unavailable {
            return UnifiedResult::failure(
                name,
                category,
                ErrorKind::ToolUnavailable,
                format!("tool '{name}' is unavailable"),
                0,
            );
        }

        let started = Instant::now();
        let mut result = tool.execute(action, args).await;
        let elapsed = started.elapsed().as_millis() as u64;
        if result.execution_time_ms == 0 {
            result.execution_time_ms = elapsed;
        }
        if let Ok(mut lat) = self.last_latency_ms.write() {
            lat.insert(name.to_owned(), elapsed);
        }
        log::debug!(
            "[tools] executed tool={name} action={action} success={} duration_ms={elapsed}",
            result.success
        );
        result
    }

    /// Probe every tool.
    pub async fn health_all(&self) -> HashMap<String, ToolHealthReport> {
        let tools: Vec<Arc<dyn Tool>> = match self.tools_read() {
            Ok(map) => map.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        let mut out = HashMap::new();
        for tool in tools {
            let mut report = tool.health().await;
            if report.last_response_time_ms.is_none() {
                report.last_response_time_ms = self
                    .last_latency_ms
                    .read()
                    .ok()
                    .and_then(|m| m.get(tool.name()).copied());
            }
            out.insert(tool.name().to_owned(), report);
        }
        out
    }

    /// Shut down every tool and clear the registry.
    pub async fn shutdown_all(&self) {
        let tools: Vec<Arc<dyn Tool>> = match self.tools_write() {
            Ok(mut map) => map.drain().map(|(_, t)| t).collect(),
            Err(_) => Vec::new(),
        };
        for tool in tools {
            tool.shutdown().await;
        }
    }

    /// Build a scope exposing a subset of tools (or all, when `allowed` is
    /// `None`).
    pub fn scope(self: &Arc<Self>, allowed: Option<Vec<String>>) -> ToolScope {
        ToolScope {
            manager: Arc::downgrade(self),
            allowed: allowed.map(|names| names.into_iter().collect()),
        }
    }

    fn tools_read(
        &self,
    ) -> CoreResult<std::sync::RwLockReadGuard<'_, HashMap<String, Arc<dyn Tool>>>> {
        self.tools
            .read()
            .map_err(|_| CoreError::InternalInvariant("tool registry lock poisoned".into()))
    }

    fn tools_write(
        &self,
    ) -> CoreResult<std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<dyn Tool>>>> {
        self.tools
            .write()
            .map_err(|_| CoreError::InternalInvariant("tool registry lock poisoned".into()))
    }
}

impl Default for ToolManager {
    fn default() -> Self {
        Self::new()
    }
}

// ─── ToolScope ────────────────────────────────────────────────────────────────

/// An agent's view of the tool manager: weak reference plus name filter.
#[derive(Clone)]
pub struct ToolScope {
    manager: Weak<ToolManager>,
    allowed: Option<HashSet<String>>,
}

impl ToolScope {
    /// A scope with no tools at all.
    pub fn none() -> Self {
        Self {
            manager: Weak::new(),
            allowed: Some(HashSet::new()),
        }
    }

    /// Whether `name` is visible through this scope.
    pub fn available(&self, name: &str) -> bool {
        if let Some(allowed) = &self.allowed {
            if !allowed.contains(name) {
                return false;
            }
        }
        self.manager
            .upgrade()
            .map(|m| m.tools_read().map(|t| t.contains_key(name)).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Descriptors of the tools visible through this scope.
    pub fn list(&self) -> Vec<ToolDescriptor> {
        let Some(manager) = self.manager.upgrade() else {
            return Vec::new();
        };
        manager
            .list()
            .into_iter()
            .filter(|d| {
                self.allowed
                    .as_ref()
                    .map(|a| a.contains(&d.name))
                    .unwrap_or(true)
            })
            .collect()
    }

    /// Execute a tool through the scope.
    pub async fn execute(&self, name: &str, action: &str, args: Value) -> UnifiedResult {
        if let Some(allowed) = &self.allowed {
            if !allowed.contains(name) {
                return UnifiedResult::failure(
                    name,
                    "unknown",
                    ErrorKind::Validation,
                    format!("tool '{name}' is outside this invocation's scope"),
                    0,
                );
            }
        }
        match self.manager.upgrade() {
            Some(manager) => manager.execute(name, action, args).await,
            None => UnifiedResult::failure(
                name,
                "unknown",
                ErrorKind::ToolUnavailable,
                "tool manager is gone",
                0,
            ),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoTool {
        name: &'static str,
        privileged: bool,
        policy: PrivilegePolicy,
        health: ToolHealth,
    }

    impl EchoTool {
        fn open(name: &'static str) -> Self {
            Self {
                name,
                privileged: false,
                policy: PrivilegePolicy::Open,
                health: ToolHealth::Available,
            }
        }
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn capabilities(&self) -> &[Capability] {
            &[Capability::Search]
        }
        fn privileged(&self) -> bool {
            self.privileged
        }
        fn policy(&self) -> PrivilegePolicy {
            self.policy.clone()
        }
        async fn health(&self) -> ToolHealthReport {
            ToolHealthReport {
                health: self.health,
                last_response_time_ms: None,
            }
        }
        async fn execute(&self, action: &str, args: Value) -> UnifiedResult {
            match action {
                "echo" => UnifiedResult::ok(self.name, "search", args, 0),
                other => UnifiedResult::failure(
                    self.name,
                    "search",
                    ErrorKind::Validation,
                    format!("unknown action '{other}'"),
                    0,
                ),
            }
        }
    }

    #[tokio::test]
    async fn register_and_execute() {
        let manager = Arc::new(ToolManager::new());
        manager.register(Arc::new(EchoTool::open("echo"))).await.unwrap();
        let result = manager.execute("echo", "echo", json!({"x": 1})).await;
        assert!(result.success);
        assert_eq!(result.data, json!({"x": 1}));
        assert_eq!(result.tool_name, "echo");
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let manager = Arc::new(ToolManager::new());
        manager.register(Arc::new(EchoTool::open("echo"))).await.unwrap();
        let err = manager.register(Arc::new(EchoTool::open("echo"))).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn privileged_without_guard_is_refused() {
        let manager = Arc::new(ToolManager::new());
        let tool = EchoTool {
            name: "shell",
            privileged: true,
            policy: PrivilegePolicy::Open,
            health: ToolHealth::Available,
        };
        let err = manager.register(Arc::new(tool)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn guarded_policy_enforced_at_call_boundary() {
        let manager = Arc::new(ToolManager::new());
        let tool = EchoTool {
            name: "writer",
            privileged: true,
            policy: PrivilegePolicy::Guarded {
                allowed_actions: vec!["echo".into()],
                blocked_patterns: vec!["/etc/passwd".into()],
            },
            health: ToolHealth::Available,
        };
        manager.register(Arc::new(tool)).await.unwrap();

        let denied = manager.execute("writer", "rm", json!({})).await;
        assert_eq!(denied.error_kind(), Some(ErrorKind::Validation));

        let blocked = manager
            .execute("writer", "echo", json!({"path": "/etc/passwd"}))
            .await;
        assert_eq!(blocked.error_kind(), Some(ErrorKind::Validation));

        let allowed = manager.execute("writer", "echo", json!({"path": "/tmp/x"})).await;
        assert!(allowed.success);
    }

    #[tokio::test]
    async fn unavailable_tool_is_not_invoked() {
        let manager = Arc::new(ToolManager::new());
        let tool = EchoTool {
            name: "down",
            privileged: false,
            policy: PrivilegePolicy::Open,
            health: ToolHealth::Unavailable,
        };
        manager.register(Arc::new(tool)).await.unwrap();
        let result = manager.execute("down", "echo", json!({})).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::ToolUnavailable));
    }

    #[tokio::test]
    async fn unknown_tool_fails_validation() {
        let manager = Arc::new(ToolManager::new());
        let result = manager.execute("ghost", "echo", json!({})).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Validation));
    }

    #[tokio::test]
    async fn scope_filters_and_survives_manager() {
        let manager = Arc::new(ToolManager::new());
        manager.register(Arc::new(EchoTool::open("a"))).await.unwrap();
        manager.register(Arc::new(EchoTool::open("b"))).await.unwrap();

        let scope = manager.scope(Some(vec!["a".into()]));
        assert!(scope.available("a"));
        assert!(!scope.available("b"));

        let denied = scope.execute("b", "echo", json!({})).await;
        assert_eq!(denied.error_kind(), Some(ErrorKind::Validation));

        drop(manager);
        let gone = scope.execute("a", "echo", json!({})).await;
        assert_eq!(gone.error_kind(), Some(ErrorKind::ToolUnavailable));
    }

    #[tokio::test]
    async fn find_by_capability_returns_sorted_names() {
        let manager = Arc::new(ToolManager::new());
        manager.register(Arc::new(EchoTool::open("zeta"))).await.unwrap();
        manager.register(Arc::new(EchoTool::open("alpha"))).await.unwrap();
        assert_eq!(
            manager.find_by_capability(Capability::Search),
            vec!["alpha".to_owned(), "zeta".to_owned()]
        );
        assert!(manager.find_by_capability(Capability::Testing).is_empty());
    }
}
