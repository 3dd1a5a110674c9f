//! Server: owns the shared stores, the node pool, and one listener per
//! enabled protocol. Also runs the local console node.

use crate::admission::AdmissionPipeline;
use crate::config::{ProtocolConfig, ServerConfig};
use crate::events::EventSink;
use crate::handoff::{HandoffLauncher, NoWindows, WindowControl};
use crate::listener::{Listener, ListenerSpec};
use crate::node::{Node, NodePool};
use crate::reputation::{DnsblResolver, ReputationStore};
use nodegate_core::{
    CommandLine, GateError, GateResult, NodeKind, NodeStatus, ServerEvent, StatusCategory,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

/// Status text for the local node while it runs.
const STATUS_LOCAL: &str = "Local session";

/// The admission server.
pub struct Server {
    config: ServerConfig,
    events: EventSink,
    pool: NodePool,
    reputation: Arc<ReputationStore>,
    listeners: Vec<Listener>,
    local_launcher: Arc<HandoffLauncher>,
    local_running: Arc<AtomicBool>,
}

impl Server {
    /// Build a server that resolves DNS through the system resolver and
    /// has no window support.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_parts(config, DnsblResolver::system(), Arc::new(NoWindows))
    }

    /// Build a server with an explicit resolver and window control.
    pub fn with_parts(
        config: ServerConfig,
        resolver: DnsblResolver,
        windows: Arc<dyn WindowControl>,
    ) -> Self {
        let events = EventSink::new();
        let pool = NodePool::new(config.nodes, config.binkp.enabled);

        let blocking = &config.blocking;
        let reputation = Arc::new(ReputationStore::load(
            blocking.use_good_ip.then_some(blocking.good_ip_file.as_path()),
            blocking.use_bad_ip.then_some(blocking.bad_ip_file.as_path()),
        ));

        let launcher = |command: &CommandLine| {
            HandoffLauncher::new(command.clone(), config.home.clone())
                .minimized(config.launch_minimized)
                .with_window_control(windows.clone())
        };

        let protocols: [(&str, &ProtocolConfig, NodeKind); 3] = [
            ("telnet", &config.telnet, NodeKind::Instance),
            ("ssh", &config.ssh, NodeKind::Instance),
            ("binkp", &config.binkp, NodeKind::Gateway),
        ];
        let listeners = protocols
            .into_iter()
            .filter(|(_, proto, _)| proto.enabled)
            .map(|(name, proto, kind)| {
                // Each listener tracks its own attempts.
                let pipeline = AdmissionPipeline::new(
                    config.blocking.clone(),
                    reputation.clone(),
                    resolver.clone(),
                );
                Listener::new(
                    ListenerSpec {
                        name: name.to_string(),
                        bind: config.bind.clone(),
                        port: proto.port,
                        kind,
                        probe: proto.probe,
                    },
                    Arc::new(pipeline),
                    pool.clone(),
                    launcher(&proto.command),
                    events.clone(),
                )
            })
            .collect();

        let local_launcher = Arc::new(launcher(&config.telnet.command));

        Self {
            config,
            events,
            pool,
            reputation,
            listeners,
            local_launcher,
            local_running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub fn pool(&self) -> &NodePool {
        &self.pool
    }

    pub fn reputation(&self) -> &Arc<ReputationStore> {
        &self.reputation
    }

    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    /// Current occupancy of every pooled node.
    pub fn snapshot(&self) -> Vec<Node> {
        self.pool.snapshot()
    }

    /// Start every enabled listener, then the local node if configured.
    ///
    /// If any listener fails to bind, those already started are stopped
    /// again and the bind error is returned.
    pub async fn start(&self) -> GateResult<Vec<SocketAddr>> {
        let mut bound = Vec::with_capacity(self.listeners.len());
        for listener in &self.listeners {
            match listener.start().await {
                Ok(addr) => bound.push(addr),
                Err(e) => {
                    self.stop().await;
                    return Err(e);
                }
            }
        }
        info!(
            listeners = bound.len(),
            nodes = self.pool.capacity(),
            "server started"
        );

        if self.config.launch_local_node {
            self.launch_local()?;
        }
        Ok(bound)
    }

    /// Stop every listener. Handed-off sessions keep running.
    pub async fn stop(&self) {
        for listener in &self.listeners {
            listener.stop().await;
        }
    }

    /// Run the worker for the local console node in the background.
    ///
    /// Only one local session may run at a time.
    pub fn launch_local(&self) -> GateResult<JoinHandle<()>> {
        if self
            .local_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(GateError::Other(format!(
                "local node {} is already running",
                self.config.local_node
            )));
        }

        let node = self.config.local_node;
        let launcher = self.local_launcher.clone();
        let events = self.events.clone();
        let running = LocalRunning(self.local_running.clone());

        events.node(local_status(node, true));
        events.status(format!("Launching local node {node}"), StatusCategory::Status);

        Ok(tokio::spawn(async move {
            let _running = running;
            match launcher.launch_local(node).await {
                Ok(status) => events.status(
                    format!("Local node {node} exited ({status})"),
                    StatusCategory::Status,
                ),
                Err(e) => events.status(
                    format!("Local node {node} failed: {e}"),
                    StatusCategory::Error,
                ),
            }
            events.node(local_status(node, false));
        }))
    }

    pub fn local_running(&self) -> bool {
        self.local_running.load(Ordering::Acquire)
    }
}

/// Clears the local-session flag when the session task ends.
struct LocalRunning(Arc<AtomicBool>);

impl Drop for LocalRunning {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn local_status(number: u32, in_use: bool) -> NodeStatus {
    NodeStatus {
        number,
        kind: NodeKind::Instance,
        in_use,
        status: if in_use {
            STATUS_LOCAL.to_string()
        } else {
            crate::node::pool::STATUS_WAITING.to_string()
        },
        remote_addr: None,
    }
}
