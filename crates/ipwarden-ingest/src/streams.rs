//! One SSE log stream per connected node.
//!
//! The manager owns a map `node_id → task handle` and keeps it consistent
//! with the panel's node list through three control loops:
//!
//!   - discovery (2 min): connected node without a live task → spawn
//!   - cancel    (60 s):  running task whose node is gone → abort
//!   - refresh   (2 h):   abort everything, force-refresh the node list,
//!                        rebuild; bounds staleness of nodes and tokens
//!
//! Stream tasks reconnect themselves on any error after a 10 s pause, so
//! every failure mode inside a stream is transient.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};

use ipwarden_core::{
    unix_now, Node, NodeId, NODE_CANCEL_INTERVAL, NODE_DISCOVERY_INTERVAL, STREAM_RECONNECT_DELAY,
    STREAM_REFRESH_INTERVAL, STREAM_SPAWN_SPACING,
};
use ipwarden_panel::PanelClient;

use crate::parser::LogParser;
use crate::table::ActiveUserTable;

pub struct NodeStreamManager {
    panel: Arc<PanelClient>,
    parser: Arc<LogParser>,
    table: Arc<ActiveUserTable>,
    tasks: tokio::sync::Mutex<HashMap<NodeId, JoinHandle<()>>>,
}

impl NodeStreamManager {
    pub fn new(panel: Arc<PanelClient>, parser: Arc<LogParser>, table: Arc<ActiveUserTable>) -> Self {
        Self { panel, parser, table, tasks: tokio::sync::Mutex::new(HashMap::new()) }
    }

    /// Spawn a stream for every connected node, spaced out so the panel is
    /// not hit by a connection stampede.
    pub async fn spawn_connected(&self, nodes: &[Node]) {
        for node in nodes.iter().filter(|n| n.is_connected()) {
            self.spawn_stream(node.clone()).await;
            sleep(STREAM_SPAWN_SPACING).await;
        }
    }

    async fn spawn_stream(&self, node: Node) {
        // The node's own address shows up in its logs; never treat it as a
        // client.
        if !node.address.is_empty() {
            self.parser.add_invalid_ip(&node.address);
        }
        info!(node = %node, "starting log stream");
        let handle = tokio::spawn(stream_node(
            Arc::clone(&self.panel),
            Arc::clone(&self.parser),
            Arc::clone(&self.table),
            node.clone(),
        ));
        self.tasks.lock().await.insert(node.id, handle);
    }

    pub async fn active_stream_count(&self) -> usize {
        self.tasks.lock().await.values().filter(|h| !h.is_finished()).count()
    }

    /// Periodically pick up nodes that became connected.
    pub async fn discovery_loop(self: Arc<Self>) {
        loop {
            sleep(NODE_DISCOVERY_INTERVAL).await;
            let nodes = match self.panel.list_nodes(false).await {
                Ok(nodes) => nodes,
                Err(e) => {
                    warn!(error = %e, "node discovery failed");
                    continue;
                }
            };
            for node in nodes.into_iter().filter(|n| n.is_connected()) {
                let running = {
                    let tasks = self.tasks.lock().await;
                    tasks.get(&node.id).map(|h| !h.is_finished()).unwrap_or(false)
                };
                if !running {
                    info!(node = %node, "discovered new connected node");
                    self.spawn_stream(node).await;
                    sleep(STREAM_SPAWN_SPACING).await;
                }
            }
        }
    }

    /// Periodically cancel streams for nodes no longer connected.
    pub async fn cancel_loop(self: Arc<Self>) {
        loop {
            sleep(NODE_CANCEL_INTERVAL).await;
            let nodes = match self.panel.list_nodes(false).await {
                Ok(nodes) => nodes,
                Err(e) => {
                    warn!(error = %e, "node status check failed");
                    continue;
                }
            };
            let connected: HashSet<NodeId> =
                nodes.iter().filter(|n| n.is_connected()).map(|n| n.id).collect();

            let mut tasks = self.tasks.lock().await;
            tasks.retain(|node_id, handle| {
                if handle.is_finished() {
                    return false;
                }
                if !connected.contains(node_id) {
                    info!(node_id = *node_id, "cancelling stream for disconnected node");
                    handle.abort();
                    return false;
                }
                true
            });
        }
    }

    /// Every two hours: tear down all streams and rebuild from a forced
    /// node-list refresh.
    pub async fn refresh_loop(self: Arc<Self>) {
        loop {
            sleep(STREAM_REFRESH_INTERVAL).await;
            info!("refreshing all node log streams");
            {
                let mut tasks = self.tasks.lock().await;
                for (_, handle) in tasks.drain() {
                    handle.abort();
                }
            }
            // Let aborted tasks observe cancellation before reconnecting.
            sleep(Duration::from_secs(2)).await;

            match self.panel.list_nodes(true).await {
                Ok(nodes) => self.spawn_connected(&nodes).await,
                Err(e) => warn!(error = %e, "node refresh failed, streams stay down until discovery"),
            }
            let count = self.active_stream_count().await;
            info!(streams = count, "node log streams rebuilt");
        }
    }
}

/// Body of one stream task: connect, consume `data:` lines, reconnect on any
/// failure. Starts on `https` and keeps whichever scheme last worked.
async fn stream_node(
    panel: Arc<PanelClient>,
    parser: Arc<LogParser>,
    table: Arc<ActiveUserTable>,
    node: Node,
) {
    let mut scheme = "https";
    loop {
        let resp = match panel.open_log_stream(node.id, scheme).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(node = %node, scheme, error = %e, "log stream connect failed");
                scheme = if scheme == "https" { "http" } else { "https" };
                sleep(STREAM_RECONNECT_DELAY).await;
                continue;
            }
        };

        info!(node = %node, scheme, "log stream connected");
        let mut byte_stream = resp.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = byte_stream.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(node = %node, error = %e, "log stream read failed");
                    break;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim_end_matches('\r').to_string();
                buffer.drain(..=newline);

                let Some(payload) = line.strip_prefix("data: ") else {
                    continue;
                };
                if payload.trim().is_empty() {
                    continue;
                }
                if let Some(record) = parser.parse_line(payload).await {
                    table.record(
                        &record.username,
                        &record.ip,
                        node.id,
                        &node.name,
                        &record.inbound,
                        unix_now(),
                    );
                }
            }
        }

        sleep(STREAM_RECONNECT_DELAY).await;
    }
}
