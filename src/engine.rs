//! Delivery engine: per-relay fan-out, latency accounting, failure
//! classification, and history recording.
//!
//! One `relay_signal` call sends one encoded datagram to every resolved
//! target concurrently — wall time is bounded by the slowest target, not
//! the sum.  Failed targets are classified and, when requested, handed to
//! the buffer manager; there is no in-band retry.  The relay record insert
//! happens after every per-target send has completed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::join_all;
use serde_json::{json, Map, Value};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::buffer::{BufferManager, DeliveryCallback};
use crate::codec::encode_signal;
use crate::config::NODE_SENDER_NAME;
use crate::events::{topic, EventBus};
use crate::logging;
use crate::rlog;
use crate::rules::{apply_transform, RuleEngine};
use crate::storage::{now_ms, Priority, RelayRecordRow, Store, StoreError};

/// One relay request, from the tool surface or a RELAY_REQUEST datagram.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub signal_type: u16,
    pub source_server: String,
    pub target_servers: Vec<String>,
    pub payload: Map<String, Value>,
    pub priority: Priority,
    pub buffer_if_offline: bool,
}

/// Outcome of one relay call.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RelayResult {
    pub relay_id: String,
    pub relayed: bool,
    pub targets_reached: Vec<String>,
    pub targets_failed: Vec<String>,
    pub targets_buffered: Vec<String>,
    pub latency_ms: u64,
}

pub struct RelayEngine {
    store: Arc<Mutex<Store>>,
    peer_ports: HashMap<String, u16>,
    socket: Arc<UdpSocket>,
    events: EventBus,
    rules: RuleEngine,
    buffer: Arc<BufferManager>,
}

impl RelayEngine {
    pub fn new(
        store: Arc<Mutex<Store>>,
        peer_ports: HashMap<String, u16>,
        socket: Arc<UdpSocket>,
        events: EventBus,
        buffer: Arc<BufferManager>,
    ) -> Self {
        let rules = RuleEngine::new(store.clone());
        Self {
            store,
            peer_ports,
            socket,
            events,
            rules,
            buffer,
        }
    }

    pub fn rules(&self) -> &RuleEngine {
        &self.rules
    }

    pub fn buffer(&self) -> &BufferManager {
        &self.buffer
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn peer_ports(&self) -> &HashMap<String, u16> {
        &self.peer_ports
    }

    /// Resolve a peer name to its loopback socket address.
    pub fn resolve_peer(&self, name: &str) -> Option<SocketAddr> {
        self.peer_ports
            .get(name)
            .map(|port| SocketAddr::from(([127, 0, 0, 1], *port)))
    }

    /// Relay one signal to every target, fanning out concurrently.
    ///
    /// Matching rules contribute extra targets and rewrite the payload in
    /// descending rule priority before anything is sent.
    pub async fn relay_signal(&self, request: RelayRequest) -> Result<RelayResult, StoreError> {
        let start = Instant::now();
        let relay_id = Uuid::new_v4().to_string();

        let matched = self
            .rules
            .match_rules(request.signal_type, &request.source_server)
            .await?;
        let mut payload = request.payload.clone();
        let mut targets = request.target_servers.clone();
        for rule in &matched {
            if let Some(ref spec) = rule.transform {
                payload = apply_transform(&payload, spec);
            }
            for target in &rule.relay_to {
                if !targets.contains(target) {
                    targets.push(target.clone());
                }
            }
        }

        let frame = encode_signal(
            request.signal_type,
            NODE_SENDER_NAME,
            &payload,
            now_ms() / 1000,
        );

        let sends = targets.iter().map(|target| {
            let frame = &frame;
            let addr = self.resolve_peer(target);
            let socket = &self.socket;
            async move {
                match addr {
                    Some(addr) => match socket.send_to(frame, addr).await {
                        Ok(_) => Ok(()),
                        Err(e) => Err(format!("send to {target} failed: {e}")),
                    },
                    None => Err(format!("unknown target {target}")),
                }
            }
        });
        let results = join_all(sends).await;

        let mut targets_reached = Vec::new();
        let mut targets_failed = Vec::new();
        let mut errors = Vec::new();
        for (target, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => targets_reached.push(target.clone()),
                Err(error) => {
                    rlog!(
                        "relay {relay_id}: target {} failed: {error}",
                        logging::server_name(target)
                    );
                    targets_failed.push(target.clone());
                    errors.push(error);
                }
            }
        }

        let mut targets_buffered = Vec::new();
        if request.buffer_if_offline {
            for target in &targets_failed {
                self.buffer
                    .buffer_signal(
                        request.signal_type,
                        &request.source_server,
                        target,
                        payload.clone(),
                        request.priority,
                    )
                    .await?;
                targets_buffered.push(target.clone());
            }
        }

        let latency_ms = start.elapsed().as_millis() as u64;
        let relayed = !targets_reached.is_empty();
        let record = RelayRecordRow {
            id: relay_id.clone(),
            signal_type: request.signal_type,
            source_server: request.source_server.clone(),
            target_servers: targets.clone(),
            payload,
            priority: request.priority,
            relayed_at: now_ms(),
            success: relayed,
            targets_reached: targets_reached.clone(),
            targets_failed: targets_failed.clone(),
            latency_ms,
            error_message: if errors.is_empty() {
                None
            } else {
                Some(errors.join("; "))
            },
        };
        self.store.lock().await.insert_relay_record(&record)?;

        if relayed {
            self.events.emit(
                topic::RELAY_SENT,
                json!({
                    "relay_id": relay_id,
                    "signal_type": request.signal_type,
                    "targets_reached": targets_reached,
                    "latency_ms": latency_ms,
                }),
            );
        }
        if !targets_failed.is_empty() {
            self.events.emit(
                topic::RELAY_FAILED,
                json!({
                    "relay_id": relay_id,
                    "signal_type": request.signal_type,
                    "targets_failed": targets_failed,
                }),
            );
        }

        rlog!(
            "relay {relay_id}: {} reached {}/{} targets in {latency_ms}ms",
            logging::signal_code(request.signal_type),
            targets_reached.len(),
            targets.len()
        );

        Ok(RelayResult {
            relay_id,
            relayed,
            targets_reached,
            targets_failed,
            targets_buffered,
            latency_ms,
        })
    }

    /// Relay to every known peer except the excluded ones.
    pub async fn multicast(
        &self,
        signal_type: u16,
        source_server: &str,
        payload: Map<String, Value>,
        priority: Priority,
        exclude: &[String],
    ) -> Result<RelayResult, StoreError> {
        let mut targets: Vec<String> = self
            .peer_ports
            .keys()
            .filter(|name| !exclude.contains(name))
            .cloned()
            .collect();
        targets.sort();

        self.relay_signal(RelayRequest {
            signal_type,
            source_server: source_server.to_string(),
            target_servers: targets,
            payload,
            priority,
            buffer_if_offline: true,
        })
        .await
    }

    /// Build the delivery callback the buffer manager drives: encode the
    /// buffered row and send it to its target's configured port.
    pub fn delivery_callback(&self) -> DeliveryCallback {
        let socket = self.socket.clone();
        let peer_ports = self.peer_ports.clone();
        Arc::new(move |row| {
            let socket = socket.clone();
            let addr = peer_ports
                .get(&row.target_server)
                .map(|port| SocketAddr::from(([127, 0, 0, 1], *port)));
            Box::pin(async move {
                let Some(addr) = addr else {
                    return false;
                };
                let frame = encode_signal(
                    row.signal_type,
                    NODE_SENDER_NAME,
                    &row.payload,
                    now_ms() / 1000,
                );
                socket.send_to(&frame, addr).await.is_ok()
            })
        })
    }
}
