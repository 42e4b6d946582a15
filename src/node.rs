//! Node runtime: the UDP dispatcher and the periodic tickers.
//!
//! `RelayNode::start` wires the store, event bus, buffer manager, delivery
//! engine, stats aggregator, and protocol handler together, installs the
//! delivery callback, and spawns the long-running tasks:
//!
//! - inbound datagram dispatcher (decode, tumble, dispatch inline),
//! - buffer retry ticker (one in-flight pass at a time),
//! - stats rollup ticker,
//! - heartbeat ticker (fire-and-forget to every known peer port),
//! - retention ticker.
//!
//! Shutdown stops every ticker before the store handle is released;
//! in-flight work is allowed to complete.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::buffer::BufferManager;
use crate::codec::{decode_datagram, encode_signal, signal};
use crate::config::{NodeConfig, ConfigError, NODE_SENDER_NAME};
use crate::engine::RelayEngine;
use crate::events::EventBus;
use crate::handlers::ProtocolHandler;
use crate::logging;
use crate::ops::Operator;
use crate::rlog;
use crate::stats::StatsAggregator;
use crate::storage::{now_ms, Store, StoreError};
use crate::tumbler::Tumbler;

/// Largest datagram the dispatcher will accept.
const MAX_DATAGRAM: usize = 64 * 1024;

const RETENTION_TICK: Duration = Duration::from_secs(3600);

#[derive(Debug)]
pub enum NodeError {
    Io(std::io::Error),
    Store(StoreError),
    Config(ConfigError),
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeError::Io(e) => write!(f, "io error: {e}"),
            NodeError::Store(e) => write!(f, "store error: {e}"),
            NodeError::Config(e) => write!(f, "config error: {e}"),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<std::io::Error> for NodeError {
    fn from(e: std::io::Error) -> Self {
        NodeError::Io(e)
    }
}

impl From<StoreError> for NodeError {
    fn from(e: StoreError) -> Self {
        NodeError::Store(e)
    }
}

impl From<ConfigError> for NodeError {
    fn from(e: ConfigError) -> Self {
        NodeError::Config(e)
    }
}

pub struct RelayNode {
    engine: Arc<RelayEngine>,
    stats: Arc<StatsAggregator>,
    buffer: Arc<BufferManager>,
    handler: Arc<ProtocolHandler>,
    events: EventBus,
    socket: Arc<UdpSocket>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayNode {
    /// Bind the socket, assemble the subsystems, and spawn the runtime
    /// tasks.  The node runs until [`RelayNode::shutdown`].
    pub async fn start(config: NodeConfig, store: Store) -> Result<Self, NodeError> {
        let incoming = config.incoming_codes()?;
        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", config.port)).await?);
        let local = socket.local_addr()?;
        rlog!("node: listening on {local}");

        let store = Arc::new(Mutex::new(store));
        let events = EventBus::new();
        let buffer = Arc::new(BufferManager::new(
            store.clone(),
            events.clone(),
            config.buffer.clone(),
        ));
        let engine = Arc::new(RelayEngine::new(
            store.clone(),
            config.peer_ports.clone(),
            socket.clone(),
            events.clone(),
            buffer.clone(),
        ));
        buffer.install_delivery_callback(engine.delivery_callback());

        let stats = Arc::new(StatsAggregator::new(store.clone(), events.clone()));
        let handler = Arc::new(ProtocolHandler::new(
            engine.clone(),
            stats.clone(),
            socket.clone(),
        ));
        let tumbler = Tumbler::new(incoming);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        tasks.push(Self::spawn_dispatcher(
            socket.clone(),
            tumbler,
            handler.clone(),
            shutdown_rx.clone(),
        ));
        tasks.push(Self::spawn_buffer_ticker(
            buffer.clone(),
            config.buffer_tick_ms,
            shutdown_rx.clone(),
        ));
        tasks.push(Self::spawn_stats_ticker(
            stats.clone(),
            config.stats_aggregation_interval_ms,
            shutdown_rx.clone(),
        ));
        tasks.push(Self::spawn_heartbeat_ticker(
            socket.clone(),
            config.peer_ports.clone(),
            config.heartbeat_interval_ms,
            shutdown_rx.clone(),
        ));
        tasks.push(Self::spawn_retention_ticker(
            store,
            config.retention_hours,
            shutdown_rx,
        ));
        Ok(Self {
            engine,
            stats,
            buffer,
            handler,
            events,
            socket,
            shutdown_tx,
            tasks,
        })
    }

    pub fn engine(&self) -> Arc<RelayEngine> {
        self.engine.clone()
    }

    pub fn buffer(&self) -> Arc<BufferManager> {
        self.buffer.clone()
    }

    pub fn handler(&self) -> Arc<ProtocolHandler> {
        self.handler.clone()
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    /// Build the operator tool surface over this node.
    pub fn operator(&self) -> Operator {
        Operator::new(self.engine.clone(), self.stats.clone())
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.socket.local_addr()
    }

    /// Stop every ticker and the dispatcher, letting in-flight work finish,
    /// then release the store.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        rlog!("node: shutdown complete");
    }

    // -----------------------------------------------------------------------
    // Task bodies
    // -----------------------------------------------------------------------

    fn spawn_dispatcher(
        socket: Arc<UdpSocket>,
        tumbler: Tumbler,
        handler: Arc<ProtocolHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    result = socket.recv_from(&mut buf) => {
                        let (len, from) = match result {
                            Ok(pair) => pair,
                            Err(e) => {
                                rlog!("node: recv error: {e}");
                                continue;
                            }
                        };
                        let Some(decoded) = decode_datagram(&buf[..len]) else {
                            rlog!("node: undecodable {len}-byte datagram from {from}");
                            continue;
                        };
                        if !tumbler.admit(&decoded, now_ms()) {
                            continue;
                        }
                        handler.handle(decoded, from).await;
                    }
                }
            }
        })
    }

    fn spawn_buffer_ticker(
        buffer: Arc<BufferManager>,
        tick_ms: u64,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            if tick_ms == 0 {
                return;
            }
            let mut ticker = tokio::time::interval(Duration::from_millis(tick_ms));
            ticker.tick().await; // skip the immediate first tick
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        // Awaiting here keeps passes strictly sequential.
                        match buffer.process_buffer().await {
                            Ok(outcome) => {
                                if outcome.expired > 0 || outcome.attempted > 0 {
                                    rlog!(
                                        "buffer: pass expired={} attempted={} delivered={}",
                                        outcome.expired,
                                        outcome.attempted,
                                        outcome.delivered
                                    );
                                }
                            }
                            Err(e) => rlog!("buffer: pass failed: {e}"),
                        }
                    }
                }
            }
        })
    }

    fn spawn_stats_ticker(
        stats: Arc<StatsAggregator>,
        interval_ms: u64,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            if interval_ms == 0 {
                return;
            }
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = stats.rollup().await {
                            rlog!("stats: rollup failed: {e}");
                        }
                    }
                }
            }
        })
    }

    fn spawn_heartbeat_ticker(
        socket: Arc<UdpSocket>,
        peer_ports: std::collections::HashMap<String, u16>,
        interval_ms: u64,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            if interval_ms == 0 || peer_ports.is_empty() {
                return;
            }
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let frame = encode_signal(
                            signal::HEARTBEAT,
                            NODE_SENDER_NAME,
                            &serde_json::Map::new(),
                            now_ms() / 1000,
                        );
                        for (name, port) in &peer_ports {
                            let addr = std::net::SocketAddr::from(([127, 0, 0, 1], *port));
                            if let Err(e) = socket.send_to(&frame, addr).await {
                                rlog!(
                                    "heartbeat: send to {} failed: {e}",
                                    logging::server_name(name)
                                );
                            }
                        }
                    }
                }
            }
        })
    }

    fn spawn_retention_ticker(
        store: Arc<Mutex<Store>>,
        retention_hours: u64,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            if retention_hours == 0 {
                return;
            }
            let mut ticker = tokio::time::interval(RETENTION_TICK);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let cutoff = now_ms().saturating_sub(retention_hours * 3_600_000);
                        match store.lock().await.prune_before(cutoff) {
                            Ok((relays, stats, buffer)) if relays + stats + buffer > 0 => {
                                rlog!(
                                    "retention: pruned {relays} relay(s), {stats} stat row(s), {buffer} buffer row(s)"
                                );
                            }
                            Ok(_) => {}
                            Err(e) => rlog!("retention: prune failed: {e}"),
                        }
                    }
                }
            }
        })
    }
}
