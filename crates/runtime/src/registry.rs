//! Tool registry: merges local tools and tool-server capabilities into
//! immutable, versioned snapshots.
//!
//! A [`RegistrySnapshot`] is built wholesale and never mutated, so a reload
//! can install a new version while dispatches issued under an older one keep
//! running against the snapshot they captured. Partial availability is normal
//! operation: a tool that fails to load or a server that fails to connect is
//! excluded with a warning, never fatal.

use crate::model::ToolSpec;
use crate::tools::{LocalTool, McpConnector, RemoteConnector, ToolError};
use jsonschema::JSONSchema;
use mcp::ServerConfig;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// A tool descriptor paired with its executable capability.
pub struct ToolBinding {
    spec: ToolSpec,
    validator: Arc<JSONSchema>,
    kind: BindingKind,
}

#[derive(Clone)]
enum BindingKind {
    Local(Arc<dyn LocalTool>),
    Remote {
        connector: Arc<dyn RemoteConnector>,
        /// The tool's own name on the server, without the namespace prefix.
        tool: String,
    },
}

impl ToolBinding {
    pub fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    pub fn is_local(&self) -> bool {
        matches!(self.kind, BindingKind::Local(_))
    }

    /// Name of the providing server, or `None` for local tools.
    pub fn server(&self) -> Option<&str> {
        match &self.kind {
            BindingKind::Local(_) => None,
            BindingKind::Remote { connector, .. } => Some(connector.server_name()),
        }
    }

    /// Check invocation arguments against the tool's parameter schema.
    pub fn validate(&self, args: &Value) -> Result<(), ToolError> {
        if let Err(errors) = self.validator.validate(args) {
            let detail = errors
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ToolError::InvalidInput(detail));
        }
        Ok(())
    }

    /// Build the execution future for this binding.
    ///
    /// The future owns everything it needs so the coordinator can run it on a
    /// detached task and abandon it on deadline overrun.
    pub(crate) fn invoke(
        &self,
        args: Value,
        deadline: Duration,
    ) -> impl Future<Output = Result<String, ToolError>> + Send + 'static {
        let kind = self.kind.clone();
        async move {
            match kind {
                BindingKind::Local(tool) => tool.execute(args).await.map(render_payload),
                BindingKind::Remote { connector, tool } => {
                    connector.call(&tool, args, deadline).await
                }
            }
        }
    }
}

fn render_payload(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// A read-only, versioned view of all currently loadable tools.
pub struct RegistrySnapshot {
    version: u64,
    tools: HashMap<String, ToolBinding>,
    specs: Vec<ToolSpec>,
}

impl RegistrySnapshot {
    fn empty() -> Self {
        Self {
            version: 0,
            tools: HashMap::new(),
            specs: Vec::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, name: &str) -> Option<&ToolBinding> {
        self.tools.get(name)
    }

    /// Descriptors advertised to the model, sorted by name.
    pub fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// The tool sets one connected server contributes to a snapshot.
pub(crate) struct RemoteTools {
    pub connector: Arc<dyn RemoteConnector>,
    pub tools: Vec<mcp::Tool>,
}

/// Build one snapshot from loaded sources.
///
/// Collision rule: remote tools are namespaced `<server>.<tool>`; if a
/// qualified name still matches a local tool's name, the local binding wins
/// and the remote entry is dropped with a warning.
pub(crate) fn build_snapshot(
    version: u64,
    locals: &[Arc<dyn LocalTool>],
    remotes: Vec<RemoteTools>,
) -> RegistrySnapshot {
    let mut tools: HashMap<String, ToolBinding> = HashMap::new();

    for tool in locals {
        let name = tool.name().to_string();
        let schema = tool.schema();
        let validator = match JSONSchema::compile(&schema) {
            Ok(validator) => Arc::new(validator),
            Err(e) => {
                tracing::warn!(tool = %name, error = %e, "skipping local tool with invalid schema");
                continue;
            }
        };
        if tools.contains_key(&name) {
            tracing::warn!(tool = %name, "duplicate local tool name; keeping the first");
            continue;
        }
        tools.insert(
            name.clone(),
            ToolBinding {
                spec: ToolSpec {
                    name,
                    description: tool.description().to_string(),
                    schema,
                },
                validator,
                kind: BindingKind::Local(Arc::clone(tool)),
            },
        );
    }

    for remote in remotes {
        let server = remote.connector.server_name().to_string();
        for tool in remote.tools {
            let qualified = format!("{server}.{}", tool.name);
            if tools.contains_key(&qualified) {
                tracing::warn!(
                    tool = %qualified,
                    server = %server,
                    "remote tool collides with a local name; local wins"
                );
                continue;
            }
            let schema = tool.input_schema;
            let validator = match JSONSchema::compile(&schema) {
                Ok(validator) => Arc::new(validator),
                Err(e) => {
                    tracing::warn!(tool = %qualified, error = %e, "skipping remote tool with invalid schema");
                    continue;
                }
            };
            tools.insert(
                qualified.clone(),
                ToolBinding {
                    spec: ToolSpec {
                        name: qualified,
                        description: tool.description.unwrap_or_default(),
                        schema,
                    },
                    validator,
                    kind: BindingKind::Remote {
                        connector: Arc::clone(&remote.connector),
                        tool: tool.name,
                    },
                },
            );
        }
    }

    let mut specs: Vec<ToolSpec> = tools.values().map(|b| b.spec.clone()).collect();
    specs.sort_by(|a, b| a.name.cmp(&b.name));

    RegistrySnapshot {
        version,
        tools,
        specs,
    }
}

/// Aggregates tool sources and owns the current snapshot.
pub struct ToolRegistry {
    local: Vec<Arc<dyn LocalTool>>,
    server_configs: Vec<ServerConfig>,
    servers: Mutex<HashMap<String, Arc<mcp::Server>>>,
    current: RwLock<Arc<RegistrySnapshot>>,
    version: AtomicU64,
}

impl ToolRegistry {
    pub fn new(local: Vec<Arc<dyn LocalTool>>, server_configs: Vec<ServerConfig>) -> Self {
        Self {
            local,
            server_configs,
            servers: Mutex::new(HashMap::new()),
            current: RwLock::new(Arc::new(RegistrySnapshot::empty())),
            version: AtomicU64::new(0),
        }
    }

    /// Rebuild the snapshot from all sources and install it atomically.
    ///
    /// Always succeeds as a whole; individual tools and servers that fail are
    /// excluded. Safe to call while dispatches are in flight.
    pub async fn load(&self) -> Arc<RegistrySnapshot> {
        let remotes = self.connect_servers().await;
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = Arc::new(build_snapshot(version, &self.local, remotes));
        tracing::info!(version, tools = snapshot.len(), "registry snapshot installed");
        *self.current.write().await = Arc::clone(&snapshot);
        snapshot
    }

    /// Rebuild, replacing the current snapshot. Idempotent.
    pub async fn reload(&self) -> Arc<RegistrySnapshot> {
        self.load().await
    }

    /// The last successfully built snapshot.
    pub async fn current(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&*self.current.read().await)
    }

    /// Shut down all tool-server connections.
    pub async fn shutdown(&self) {
        let mut pool = self.servers.lock().await;
        for (_name, server) in pool.drain() {
            server.shutdown().await;
        }
    }

    /// Connect (or reuse) every configured server, refreshing tool listings.
    /// A server that cannot be reached is excluded until the next load.
    async fn connect_servers(&self) -> Vec<RemoteTools> {
        let mut pool = self.servers.lock().await;
        let mut out = Vec::new();

        for config in &self.server_configs {
            if let Some(server) = pool.get(&config.name).cloned() {
                if server.is_running().await && server.refresh_tools().await.is_ok() {
                    out.push(RemoteTools {
                        connector: Arc::new(McpConnector::new(Arc::clone(&server))),
                        tools: server.tools().await,
                    });
                    continue;
                }
                tracing::warn!(server = %config.name, "tool server connection lost; respawning");
                server.shutdown().await;
                pool.remove(&config.name);
            }

            let server = match mcp::Server::spawn(config.clone()).await {
                Ok(server) => server,
                Err(e) => {
                    tracing::warn!(server = %config.name, error = %e, "failed to spawn tool server; excluded");
                    continue;
                }
            };
            let initialized = server.initialize().await.map(|_| ());
            match initialized {
                Ok(()) => {
                    let server = Arc::new(server);
                    let tools = server.tools().await;
                    pool.insert(config.name.clone(), Arc::clone(&server));
                    out.push(RemoteTools {
                        connector: Arc::new(McpConnector::new(server)),
                        tools,
                    });
                }
                Err(e) => {
                    tracing::warn!(server = %config.name, error = %e, "tool server failed to initialize; excluded");
                }
            }
        }

        out
    }
}
