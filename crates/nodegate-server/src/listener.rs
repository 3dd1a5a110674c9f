//! Per-protocol TCP listener and connection dispatcher.
//!
//! One accept loop runs per listener. Every accepted connection gets its
//! own task that runs admission, leases a node, hands the socket to a
//! worker, and releases the node when the worker exits. The accept loop
//! never waits on any of that.
//!
//! The loop is cancelled through an `mpsc` channel from [`Listener::stop`].
//! Dropping the `TcpListener` when the loop ends closes the socket; handoff
//! tasks already running are left to finish with their workers.

use crate::admission::{send_busy, AdmissionPipeline, Verdict};
use crate::events::EventSink;
use crate::handoff::HandoffLauncher;
use crate::node::NodePool;
use nodegate_core::{GateError, GateResult, NodeKind, StatusCategory};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Starting,
    Listening,
    Stopping,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Listening => "listening",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// What a listener serves and where.
#[derive(Debug, Clone)]
pub struct ListenerSpec {
    /// Protocol name used in status messages ("telnet", "ssh", "binkp").
    pub name: String,
    pub bind: String,
    /// Port to bind; `0` lets the OS choose.
    pub port: u16,
    /// Which nodes this listener leases.
    pub kind: NodeKind,
    /// Run the ESC probe before leasing.
    pub probe: bool,
}

/// Everything a connection task needs, shared by all of them.
struct Dispatch {
    spec: ListenerSpec,
    pipeline: Arc<AdmissionPipeline>,
    pool: NodePool,
    launcher: HandoffLauncher,
    events: EventSink,
}

/// Handle to a running accept loop.
struct Running {
    cancel_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// A TCP listener for one protocol.
pub struct Listener {
    dispatch: Arc<Dispatch>,
    state: Mutex<ListenerState>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl Listener {
    pub fn new(
        spec: ListenerSpec,
        pipeline: Arc<AdmissionPipeline>,
        pool: NodePool,
        launcher: HandoffLauncher,
        events: EventSink,
    ) -> Self {
        Self {
            dispatch: Arc::new(Dispatch {
                spec,
                pipeline,
                pool,
                launcher,
                events,
            }),
            state: Mutex::new(ListenerState::Stopped),
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.dispatch.spec.name
    }

    pub fn state(&self) -> ListenerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ListenerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Address actually bound, while listening.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Bind and spawn the accept loop.
    ///
    /// Failing to bind is the only fatal listener error.
    pub async fn start(&self) -> GateResult<SocketAddr> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(GateError::Other(format!(
                "{} listener already running",
                self.name()
            )));
        }

        self.set_state(ListenerState::Starting);
        let spec = &self.dispatch.spec;
        let addr = format!("{}:{}", spec.bind, spec.port);

        let tcp_listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                self.set_state(ListenerState::Stopped);
                self.dispatch.events.status(
                    format!("Unable to listen for {} on {addr}: {e}", spec.name),
                    StatusCategory::Error,
                );
                return Err(GateError::Bind(format!("{addr}: {e}")));
            }
        };
        let local_addr = match tcp_listener.local_addr() {
            Ok(a) => a,
            Err(e) => {
                self.set_state(ListenerState::Stopped);
                return Err(GateError::Bind(format!("{addr}: {e}")));
            }
        };

        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);
        let dispatch = self.dispatch.clone();
        let task = tokio::spawn(async move {
            accept_loop(tcp_listener, cancel_rx, dispatch).await;
        });

        *running = Some(Running {
            cancel_tx,
            task,
            local_addr,
        });
        self.set_state(ListenerState::Listening);
        self.dispatch.events.status(
            format!("Listening for {} on {local_addr}", spec.name),
            StatusCategory::Status,
        );
        Ok(local_addr)
    }

    /// Stop accepting. Sessions already handed off keep running.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        self.set_state(ListenerState::Stopping);
        let _ = running.cancel_tx.send(()).await;
        if let Err(e) = running.task.await {
            warn!(listener = %self.name(), error = %e, "accept loop ended abnormally");
        }
        self.set_state(ListenerState::Stopped);
        self.dispatch.events.status(
            format!("Stopped listening for {}", self.name()),
            StatusCategory::Status,
        );
    }
}

async fn accept_loop(
    listener: TcpListener,
    mut cancel_rx: mpsc::Receiver<()>,
    dispatch: Arc<Dispatch>,
) {
    let name = dispatch.spec.name.clone();
    loop {
        tokio::select! {
            _ = cancel_rx.recv() => {
                debug!(listener = %name, "accept loop cancelled");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!(listener = %name, peer = %peer, "connection accepted");
                        let dispatch = dispatch.clone();
                        tokio::spawn(async move {
                            serve_connection(dispatch, stream, peer).await;
                        });
                    }
                    Err(e) => {
                        warn!(listener = %name, error = %e, "accept failed");
                    }
                }
            }
        }
    }
}

/// Admission, lease, handoff, release for one caller.
async fn serve_connection(dispatch: Arc<Dispatch>, mut stream: TcpStream, peer: SocketAddr) {
    let ip = peer.ip().to_string();
    let events = &dispatch.events;
    let spec = &dispatch.spec;

    events.status(
        format!("{} connection from {ip}", spec.name),
        StatusCategory::Connect,
    );

    let verdict = dispatch.pipeline.evaluate(&mut stream, &ip, spec.probe).await;
    if let Verdict::Reject(reason) = verdict {
        let category = if reason.bans() {
            StatusCategory::Warning
        } else {
            StatusCategory::Info
        };
        events.status(format!("Rejected {ip}: {reason}"), category);
        send_busy(&mut stream).await;
        return;
    }

    let Some(lease) = dispatch.pool.lease(spec.kind, Some(&ip)) else {
        events.status(
            format!("No free {} node for {ip}", spec.kind),
            StatusCategory::Warning,
        );
        send_busy(&mut stream).await;
        return;
    };
    let node = lease.number();
    if let Some(node) = dispatch.pool.get(node) {
        events.node(node.to_status());
    }
    info!(listener = %spec.name, node, peer = %peer, "handing off");

    let result = match stream.into_std() {
        Ok(socket) => dispatch.launcher.handoff(node, socket).await,
        Err(e) => Err(GateError::Transport(e.to_string())),
    };
    match result {
        Ok(status) => events.status(
            format!("Node {node} session from {ip} ended ({status})"),
            StatusCategory::Disconnect,
        ),
        Err(e) => events.status(
            format!("Node {node} launch failed for {ip}: {e}"),
            StatusCategory::Error,
        ),
    }

    if let Some(status) = lease.release() {
        events.node(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BlockingConfig, NodeRange};
    use crate::reputation::{DnsblResolver, ReputationStore};
    use nodegate_core::{CommandLine, ServerEvent};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::sync::broadcast;

    fn pool(low: u32, high: u32) -> NodePool {
        NodePool::new(NodeRange { low, high }, false)
    }

    fn listener(
        store: ReputationStore,
        pool: NodePool,
        command: CommandLine,
    ) -> (Listener, EventSink) {
        let pipeline = AdmissionPipeline::new(
            BlockingConfig::default(),
            Arc::new(store),
            DnsblResolver::system(),
        );
        let events = EventSink::new();
        let spec = ListenerSpec {
            name: "telnet".into(),
            bind: "127.0.0.1".into(),
            port: 0,
            kind: NodeKind::Instance,
            probe: false,
        };
        let l = Listener::new(
            spec,
            Arc::new(pipeline),
            pool,
            HandoffLauncher::new(command, ""),
            events.clone(),
        );
        (l, events)
    }

    async fn read_all(addr: SocketAddr) -> Vec<u8> {
        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf
    }

    async fn next_node_event(
        rx: &mut broadcast::Receiver<ServerEvent>,
    ) -> nodegate_core::NodeStatus {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let ServerEvent::Node(status) = event {
                return status;
            }
        }
    }

    #[tokio::test]
    async fn test_deny_listed_caller_gets_busy() {
        let store = ReputationStore::from_lists(Vec::<&str>::new(), ["127.0.0.1"], None);
        let (l, _) = listener(store, pool(2, 4), CommandLine::new("true", ""));
        let addr = l.start().await.unwrap();

        assert_eq!(read_all(addr).await, b"BUSY\r\n");
        l.stop().await;
    }

    #[tokio::test]
    async fn test_pool_exhausted_gets_busy() {
        let nodes = pool(2, 2);
        let _held = nodes.lease(NodeKind::Instance, None).unwrap();
        let (l, events) = listener(
            ReputationStore::empty(),
            nodes.clone(),
            CommandLine::new("true", ""),
        );
        let mut rx = events.subscribe();
        let addr = l.start().await.unwrap();

        assert_eq!(read_all(addr).await, b"BUSY\r\n");

        // Exhaustion is not a ban.
        let saw_warning = loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let ServerEvent::Status(m) = event {
                if m.category == StatusCategory::Warning {
                    break m.text;
                }
            }
        };
        assert!(saw_warning.contains("No free instance node"));
        l.stop().await;
    }

    #[tokio::test]
    async fn test_node_released_after_launch_failure() {
        let nodes = pool(2, 3);
        let (l, events) = listener(
            ReputationStore::empty(),
            nodes.clone(),
            CommandLine::new("/nonexistent/nodegate-worker", "-H@H -N@N"),
        );
        let mut rx = events.subscribe();
        let addr = l.start().await.unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();

        let leased = next_node_event(&mut rx).await;
        assert_eq!(leased.number, 2);
        assert!(leased.in_use);
        assert_eq!(leased.remote_addr.as_deref(), Some("127.0.0.1"));

        let released = next_node_event(&mut rx).await;
        assert_eq!(released.number, 2);
        assert!(!released.in_use);
        assert_eq!(nodes.available(NodeKind::Instance), 2);
        l.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_worker_exit_releases_node_and_closes_socket() {
        let nodes = pool(2, 2);
        let (l, events) = listener(
            ReputationStore::empty(),
            nodes.clone(),
            CommandLine::new("true", "-H@H -N@N"),
        );
        let mut rx = events.subscribe();
        let addr = l.start().await.unwrap();

        // The worker exits at once; the caller then sees the socket close.
        assert!(read_all(addr).await.is_empty());

        assert!(next_node_event(&mut rx).await.in_use);
        assert!(!next_node_event(&mut rx).await.in_use);
        assert_eq!(nodes.available(NodeKind::Instance), 1);
        l.stop().await;
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let (l, _) = listener(ReputationStore::empty(), pool(2, 4), CommandLine::new("true", ""));
        assert_eq!(l.state(), ListenerState::Stopped);

        let addr = l.start().await.unwrap();
        assert_eq!(l.state(), ListenerState::Listening);
        assert_eq!(l.local_addr().await, Some(addr));
        assert!(l.start().await.is_err());

        l.stop().await;
        assert_eq!(l.state(), ListenerState::Stopped);
        assert_eq!(l.local_addr().await, None);

        // Stopping twice is harmless.
        l.stop().await;
        assert_eq!(l.state(), ListenerState::Stopped);
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let pipeline = AdmissionPipeline::new(
            BlockingConfig::default(),
            Arc::new(ReputationStore::empty()),
            DnsblResolver::system(),
        );
        let l = Listener::new(
            ListenerSpec {
                name: "ssh".into(),
                bind: "127.0.0.1".into(),
                port,
                kind: NodeKind::Instance,
                probe: false,
            },
            Arc::new(pipeline),
            pool(2, 4),
            HandoffLauncher::new(CommandLine::new("true", ""), ""),
            EventSink::new(),
        );

        let err = l.start().await.unwrap_err();
        assert!(matches!(err, GateError::Bind(_)), "got {err:?}");
        assert_eq!(l.state(), ListenerState::Stopped);
    }
}
