//! Dispatch of validated inbound signals.
//!
//! PING gets a PONG with the node's past-hour stats, RELAY_REQUEST drives
//! the delivery engine and answers with RELAY_RESPONSE or RELAY_FAILED,
//! HEARTBEAT is recorded and not replied to, and anything else is logged
//! and dropped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

use crate::codec::{encode_signal, signal, DecodedSignal};
use crate::config::NODE_SENDER_NAME;
use crate::engine::{RelayEngine, RelayRequest};
use crate::events::topic;
use crate::logging;
use crate::rlog;
use crate::stats::StatsAggregator;
use crate::storage::{now_ms, Priority};

const HOUR_MS: u64 = 3_600_000;

pub struct ProtocolHandler {
    engine: Arc<RelayEngine>,
    stats: Arc<StatsAggregator>,
    socket: Arc<UdpSocket>,
    /// Sender name → last heartbeat arrival, epoch ms.  Observational only.
    last_heartbeat: Mutex<HashMap<String, u64>>,
}

impl ProtocolHandler {
    pub fn new(
        engine: Arc<RelayEngine>,
        stats: Arc<StatsAggregator>,
        socket: Arc<UdpSocket>,
    ) -> Self {
        Self {
            engine,
            stats,
            socket,
            last_heartbeat: Mutex::new(HashMap::new()),
        }
    }

    /// Heartbeat arrivals seen so far, by sender name.
    pub async fn heartbeats(&self) -> HashMap<String, u64> {
        self.last_heartbeat.lock().await.clone()
    }

    /// Handle one admitted signal.
    pub async fn handle(&self, decoded: DecodedSignal, from: SocketAddr) {
        match decoded.signal_type {
            signal::PING => self.handle_ping(decoded, from).await,
            signal::RELAY_REQUEST => self.handle_relay_request(decoded, from).await,
            signal::HEARTBEAT => self.handle_heartbeat(decoded).await,
            other => {
                rlog!(
                    "handler: dropping unhandled signal {} from {from}",
                    logging::signal_code(other)
                );
            }
        }
    }

    /// Reply destination: the sender's configured peer port when known,
    /// otherwise the datagram's source address.
    fn reply_addr(&self, decoded: &DecodedSignal, from: SocketAddr) -> SocketAddr {
        decoded
            .sender()
            .and_then(|name| self.engine.resolve_peer(name))
            .unwrap_or(from)
    }

    async fn send_reply(&self, signal_type: u16, payload: Map<String, Value>, to: SocketAddr) {
        let frame = encode_signal(signal_type, NODE_SENDER_NAME, &payload, now_ms() / 1000);
        if let Err(e) = self.socket.send_to(&frame, to).await {
            rlog!(
                "handler: reply {} to {to} failed: {e}",
                logging::signal_code(signal_type)
            );
        }
    }

    async fn handle_ping(&self, decoded: DecodedSignal, from: SocketAddr) {
        let now = now_ms();
        let (total_relayed, success_rate) =
            match self.stats.query(now.saturating_sub(HOUR_MS), None, None).await {
                Ok(report) => (report.total_relayed, report.success_rate),
                Err(e) => {
                    rlog!("handler: stats lookup for PONG failed: {e}");
                    (0, 0.0)
                }
            };

        let mut payload = Map::new();
        payload.insert("echo".to_string(), Value::Object(decoded.payload.clone()));
        payload.insert("status".to_string(), json!("operational"));
        payload.insert("total_relayed".to_string(), json!(total_relayed));
        payload.insert("success_rate".to_string(), json!(success_rate));

        let to = self.reply_addr(&decoded, from);
        self.send_reply(signal::PONG, payload, to).await;
    }

    async fn handle_relay_request(&self, decoded: DecodedSignal, from: SocketAddr) {
        let to = self.reply_addr(&decoded, from);
        let source_server = decoded
            .sender()
            .unwrap_or(NODE_SENDER_NAME)
            .to_string();

        let request = match Self::parse_relay_request(&decoded, source_server) {
            Ok(request) => request,
            Err(error) => {
                rlog!("handler: malformed RELAY_REQUEST from {from}: {error}");
                let mut payload = Map::new();
                payload.insert("error".to_string(), json!(error));
                self.send_reply(signal::RELAY_FAILED, payload, to).await;
                return;
            }
        };

        match self.engine.relay_signal(request).await {
            Ok(result) => {
                let payload = match serde_json::to_value(&result) {
                    Ok(Value::Object(map)) => map,
                    _ => Map::new(),
                };
                self.send_reply(signal::RELAY_RESPONSE, payload, to).await;
            }
            Err(e) => {
                rlog!("handler: relay request failed: {e}");
                self.engine
                    .events()
                    .emit(topic::ERROR, json!({ "message": e.to_string() }));
                let mut payload = Map::new();
                payload.insert("error".to_string(), json!(e.to_string()));
                self.send_reply(signal::RELAY_FAILED, payload, to).await;
            }
        }
    }

    fn parse_relay_request(
        decoded: &DecodedSignal,
        source_server: String,
    ) -> Result<RelayRequest, String> {
        let signal_type = decoded
            .payload
            .get("signal_type")
            .and_then(Value::as_u64)
            .and_then(|n| u16::try_from(n).ok())
            .ok_or("missing or invalid signal_type")?;

        let target_servers: Vec<String> = decoded
            .payload
            .get("target_servers")
            .and_then(Value::as_array)
            .map(|targets| {
                targets
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .ok_or("missing target_servers")?;
        if target_servers.is_empty() {
            return Err("target_servers must not be empty".to_string());
        }

        let payload = match decoded.payload.get("payload") {
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return Err("payload must be an object".to_string()),
            None => Map::new(),
        };

        let priority = decoded
            .payload
            .get("priority")
            .and_then(Value::as_str)
            .map(Priority::parse)
            .unwrap_or_default();

        Ok(RelayRequest {
            signal_type,
            source_server,
            target_servers,
            payload,
            priority,
            buffer_if_offline: true,
        })
    }

    async fn handle_heartbeat(&self, decoded: DecodedSignal) {
        let sender = decoded.sender().unwrap_or("unknown").to_string();
        rlog!("handler: heartbeat from {}", logging::server_name(&sender));
        self.last_heartbeat.lock().await.insert(sender, now_ms());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferManager;
    use crate::codec::decode_datagram;
    use crate::config::BufferConfig;
    use crate::events::EventBus;
    use crate::storage::Store;
    use serde_json::json;

    async fn handler_with_peers(peers: &[(&str, u16)]) -> (ProtocolHandler, Arc<UdpSocket>) {
        let store = Arc::new(Mutex::new(Store::open_in_memory().expect("store")));
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.expect("bind"));
        let events = EventBus::new();
        let buffer = Arc::new(BufferManager::new(
            store.clone(),
            events.clone(),
            BufferConfig::default(),
        ));
        let peer_ports = peers
            .iter()
            .map(|(name, port)| (name.to_string(), *port))
            .collect();
        let engine = Arc::new(RelayEngine::new(
            store.clone(),
            peer_ports,
            socket.clone(),
            events.clone(),
            buffer,
        ));
        let stats = Arc::new(StatsAggregator::new(store, events));
        (
            ProtocolHandler::new(engine, stats, socket.clone()),
            socket,
        )
    }

    fn decoded_from(signal_type: u16, sender: &str, extra: Map<String, Value>) -> DecodedSignal {
        let mut payload = extra;
        payload.insert("sender".to_string(), json!(sender));
        DecodedSignal {
            signal_type,
            protocol_version: crate::codec::PROTOCOL_VERSION,
            timestamp: now_ms() / 1000,
            payload,
        }
    }

    #[tokio::test]
    async fn ping_gets_pong_with_echo_and_status() {
        let (handler, _socket) = handler_with_peers(&[]).await;
        let caller = UdpSocket::bind("127.0.0.1:0").await.expect("caller");
        let caller_addr = caller.local_addr().expect("addr");

        let mut extra = Map::new();
        extra.insert("probe".to_string(), json!(42));
        handler
            .handle(decoded_from(signal::PING, "stranger", extra), caller_addr)
            .await;

        let mut buf = [0u8; 2048];
        let (len, _) = caller.recv_from(&mut buf).await.expect("pong");
        let pong = decode_datagram(&buf[..len]).expect("decode");
        assert_eq!(pong.signal_type, signal::PONG);
        assert_eq!(pong.payload.get("status"), Some(&json!("operational")));
        assert_eq!(
            pong.payload
                .get("echo")
                .and_then(|e| e.get("probe")),
            Some(&json!(42))
        );
        assert!(pong.payload.contains_key("total_relayed"));
        assert!(pong.payload.contains_key("success_rate"));
    }

    #[tokio::test]
    async fn relay_request_is_executed_and_answered() {
        let target = UdpSocket::bind("127.0.0.1:0").await.expect("target");
        let target_port = target.local_addr().expect("addr").port();
        let (handler, _socket) = handler_with_peers(&[("beta", target_port)]).await;

        let caller = UdpSocket::bind("127.0.0.1:0").await.expect("caller");
        let caller_addr = caller.local_addr().expect("addr");

        let mut extra = Map::new();
        extra.insert("signal_type".to_string(), json!(0x04));
        extra.insert("target_servers".to_string(), json!(["beta"]));
        extra.insert("payload".to_string(), json!({"note": "hi"}));
        handler
            .handle(
                decoded_from(signal::RELAY_REQUEST, "stranger", extra),
                caller_addr,
            )
            .await;

        // The target receives the relayed signal.
        let mut buf = [0u8; 2048];
        let (len, _) = target.recv_from(&mut buf).await.expect("relayed");
        let relayed = decode_datagram(&buf[..len]).expect("decode");
        assert_eq!(relayed.signal_type, 0x04);
        assert_eq!(relayed.payload.get("note"), Some(&json!("hi")));

        // The caller receives a RELAY_RESPONSE naming the reached target.
        let (len, _) = caller.recv_from(&mut buf).await.expect("response");
        let response = decode_datagram(&buf[..len]).expect("decode");
        assert_eq!(response.signal_type, signal::RELAY_RESPONSE);
        assert_eq!(response.payload.get("relayed"), Some(&json!(true)));
        assert_eq!(
            response.payload.get("targets_reached"),
            Some(&json!(["beta"]))
        );
    }

    #[tokio::test]
    async fn malformed_relay_request_gets_relay_failed() {
        let (handler, _socket) = handler_with_peers(&[]).await;
        let caller = UdpSocket::bind("127.0.0.1:0").await.expect("caller");
        let caller_addr = caller.local_addr().expect("addr");

        // No target_servers at all.
        let mut extra = Map::new();
        extra.insert("signal_type".to_string(), json!(0x04));
        handler
            .handle(
                decoded_from(signal::RELAY_REQUEST, "stranger", extra),
                caller_addr,
            )
            .await;

        let mut buf = [0u8; 2048];
        let (len, _) = caller.recv_from(&mut buf).await.expect("failure");
        let failed = decode_datagram(&buf[..len]).expect("decode");
        assert_eq!(failed.signal_type, signal::RELAY_FAILED);
        assert!(failed.payload.contains_key("error"));
    }

    #[tokio::test]
    async fn heartbeat_is_recorded_without_reply() {
        let (handler, _socket) = handler_with_peers(&[]).await;
        let from: SocketAddr = "127.0.0.1:9999".parse().expect("addr");

        handler
            .handle(decoded_from(signal::HEARTBEAT, "beta", Map::new()), from)
            .await;

        let seen = handler.heartbeats().await;
        assert!(seen.contains_key("beta"));
    }
}
