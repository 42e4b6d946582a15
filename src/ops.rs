//! Transport-neutral operator tool surface.
//!
//! Four operations over the engine handle: `relay_signal`,
//! `configure_relay`, `get_relay_stats`, and `buffer_signals`.  Whatever
//! transport fronts these (RPC, REST, a CLI) only marshals the typed
//! request and response structs below.
//!
//! Numeric statistics are rounded to two decimals at this boundary.
//! Client mistakes (missing fields, bad grouping names, empty filters)
//! surface as [`OpsError::InvalidRequest`]; store failures propagate as
//! [`OpsError::Store`] for the caller to report as a server error.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::NODE_SENDER_NAME;
use crate::engine::{RelayEngine, RelayRequest};
use crate::rules::NewRule;
use crate::stats::{GroupBy, GroupStats, StatsAggregator, StatsReport};
use crate::storage::{
    now_ms, BufferFilter, BufferedSignalRow, Priority, RelayRuleRow, RulePatch, StoreError,
};

const DAY_MS: u64 = 86_400_000;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum OpsError {
    /// The request itself was malformed; the caller should signal a client
    /// error with this message.
    InvalidRequest(String),
    /// The store failed; the caller should signal a server error.
    Store(StoreError),
}

impl std::fmt::Display for OpsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpsError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            OpsError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for OpsError {}

impl From<StoreError> for OpsError {
    fn from(e: StoreError) -> Self {
        // An empty/invalid filter is the caller's mistake, not a store fault.
        match e {
            StoreError::InvalidFilter(msg) => OpsError::InvalidRequest(msg),
            other => OpsError::Store(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Request / response shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RelaySignalParams {
    pub signal_type: u16,
    pub target_servers: Vec<String>,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub priority: Priority,
    /// Accepted for compatibility; retry behavior is governed entirely by
    /// the buffer manager, so this flag has no effect beyond
    /// `buffer_if_offline`.
    #[serde(default = "default_true")]
    pub retry_on_fail: bool,
    #[serde(default = "default_true")]
    pub buffer_if_offline: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize)]
pub struct RelaySignalResponse {
    pub relay_id: String,
    pub relayed: bool,
    pub targets_reached: Vec<String>,
    pub targets_buffered: Vec<String>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Add,
    Update,
    Remove,
    List,
}

impl RuleAction {
    fn as_str(self) -> &'static str {
        match self {
            RuleAction::Add => "add",
            RuleAction::Update => "update",
            RuleAction::Remove => "remove",
            RuleAction::List => "list",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigureRelayParams {
    pub action: RuleAction,
    pub rule_id: Option<i64>,
    pub signal_pattern: Option<u16>,
    pub source_filter: Option<String>,
    pub relay_to: Option<Vec<String>>,
    pub transform: Option<Map<String, Value>>,
    pub priority: Option<i64>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigureRelayResponse {
    pub rule_id: Option<i64>,
    pub action: &'static str,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules: Option<Vec<RelayRuleRow>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GetRelayStatsParams {
    /// Epoch ms; defaults to 24 hours ago.
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub group_by: Option<String>,
    /// Include the aggregate failure count in the response.
    #[serde(default = "default_true")]
    pub include_failures: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GetRelayStatsResponse {
    pub total_relayed: i64,
    pub success_rate: f64,
    pub avg_latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub by_group: Option<std::collections::HashMap<String, GroupStats>>,
    pub buffer_stats: crate::storage::BufferStateCounts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferAction {
    List,
    Retry,
    Clear,
    Flush,
}

impl BufferAction {
    fn as_str(self) -> &'static str {
        match self {
            BufferAction::List => "list",
            BufferAction::Retry => "retry",
            BufferAction::Clear => "clear",
            BufferAction::Flush => "flush",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BufferSignalsParams {
    pub action: BufferAction,
    pub buffer_ids: Option<Vec<String>>,
    pub target_server: Option<String>,
    pub signal_type: Option<u16>,
    pub max_age_hours: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BufferSignalsResponse {
    pub action: &'static str,
    pub affected_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer_items: Option<Vec<BufferedSignalRow>>,
}

// ---------------------------------------------------------------------------
// Operator handle
// ---------------------------------------------------------------------------

pub struct Operator {
    engine: Arc<RelayEngine>,
    stats: Arc<StatsAggregator>,
}

impl Operator {
    pub fn new(engine: Arc<RelayEngine>, stats: Arc<StatsAggregator>) -> Self {
        Self { engine, stats }
    }

    /// Relay a signal to one or more named targets.
    pub async fn relay_signal(
        &self,
        params: RelaySignalParams,
    ) -> Result<RelaySignalResponse, OpsError> {
        if params.target_servers.is_empty() {
            return Err(OpsError::InvalidRequest(
                "target_servers must name at least one peer".to_string(),
            ));
        }

        let result = self
            .engine
            .relay_signal(RelayRequest {
                signal_type: params.signal_type,
                source_server: NODE_SENDER_NAME.to_string(),
                target_servers: params.target_servers,
                payload: params.payload,
                priority: params.priority,
                buffer_if_offline: params.buffer_if_offline,
            })
            .await?;

        Ok(RelaySignalResponse {
            relay_id: result.relay_id,
            relayed: result.relayed,
            targets_reached: result.targets_reached,
            targets_buffered: result.targets_buffered,
            latency_ms: result.latency_ms,
        })
    }

    /// Manage routing rules.
    pub async fn configure_relay(
        &self,
        params: ConfigureRelayParams,
    ) -> Result<ConfigureRelayResponse, OpsError> {
        let rules = self.engine.rules();
        match params.action {
            RuleAction::Add => {
                let signal_pattern = params.signal_pattern.ok_or_else(|| {
                    OpsError::InvalidRequest("add requires signal_pattern".to_string())
                })?;
                let relay_to = params.relay_to.unwrap_or_default();
                if relay_to.is_empty() {
                    return Err(OpsError::InvalidRequest(
                        "add requires a non-empty relay_to".to_string(),
                    ));
                }
                let rule_id = rules
                    .add_rule(NewRule {
                        signal_pattern,
                        source_filter: params.source_filter,
                        relay_to,
                        transform: params.transform,
                        priority: params.priority.unwrap_or(0),
                        enabled: params.enabled.unwrap_or(true),
                    })
                    .await?;
                Ok(ConfigureRelayResponse {
                    rule_id: Some(rule_id),
                    action: RuleAction::Add.as_str(),
                    success: true,
                    rules: None,
                })
            }
            RuleAction::Update => {
                let rule_id = params.rule_id.ok_or_else(|| {
                    OpsError::InvalidRequest("update requires rule_id".to_string())
                })?;
                let patch = RulePatch {
                    signal_pattern: params.signal_pattern,
                    source_filter: params.source_filter.map(Some),
                    relay_to: params.relay_to,
                    transform: params.transform.map(Some),
                    priority: params.priority,
                    enabled: params.enabled,
                };
                let success = rules.update_rule(rule_id, patch).await?;
                Ok(ConfigureRelayResponse {
                    rule_id: Some(rule_id),
                    action: RuleAction::Update.as_str(),
                    success,
                    rules: None,
                })
            }
            RuleAction::Remove => {
                let rule_id = params.rule_id.ok_or_else(|| {
                    OpsError::InvalidRequest("remove requires rule_id".to_string())
                })?;
                let success = rules.remove_rule(rule_id).await?;
                Ok(ConfigureRelayResponse {
                    rule_id: Some(rule_id),
                    action: RuleAction::Remove.as_str(),
                    success,
                    rules: None,
                })
            }
            RuleAction::List => {
                let listed = rules.list_rules().await?;
                Ok(ConfigureRelayResponse {
                    rule_id: None,
                    action: RuleAction::List.as_str(),
                    success: true,
                    rules: Some(listed),
                })
            }
        }
    }

    /// Query aggregated relay statistics.
    pub async fn get_relay_stats(
        &self,
        params: GetRelayStatsParams,
    ) -> Result<GetRelayStatsResponse, OpsError> {
        let group_by = match params.group_by.as_deref() {
            Some(name) => Some(GroupBy::parse(name).ok_or_else(|| {
                OpsError::InvalidRequest(format!("unknown group_by {name:?}"))
            })?),
            None => None,
        };
        let since = params
            .since
            .unwrap_or_else(|| now_ms().saturating_sub(DAY_MS));

        let report = self.stats.query(since, params.until, group_by).await?;
        Ok(round_report(report, params.include_failures))
    }

    /// Inspect or manage the offline buffer.
    pub async fn buffer_signals(
        &self,
        params: BufferSignalsParams,
    ) -> Result<BufferSignalsResponse, OpsError> {
        let buffer = self.engine.buffer();
        let filter = BufferFilter {
            ids: params.buffer_ids.clone(),
            target_server: params.target_server.clone(),
            signal_type: params.signal_type,
            max_age_hours: params.max_age_hours,
        };

        match params.action {
            BufferAction::List => {
                let items = buffer.list_buffered(&filter).await?;
                Ok(BufferSignalsResponse {
                    action: BufferAction::List.as_str(),
                    affected_count: items.len(),
                    buffer_items: Some(items),
                })
            }
            BufferAction::Retry => {
                let ids = params.buffer_ids.ok_or_else(|| {
                    OpsError::InvalidRequest("retry requires buffer_ids".to_string())
                })?;
                let outcome = buffer.retry_buffered(&ids).await?;
                Ok(BufferSignalsResponse {
                    action: BufferAction::Retry.as_str(),
                    affected_count: outcome.attempted,
                    buffer_items: None,
                })
            }
            BufferAction::Clear => {
                let affected = buffer.clear_buffered(&filter).await?;
                Ok(BufferSignalsResponse {
                    action: BufferAction::Clear.as_str(),
                    affected_count: affected,
                    buffer_items: None,
                })
            }
            BufferAction::Flush => {
                let outcome = buffer
                    .flush_buffer(params.target_server.as_deref())
                    .await?;
                Ok(BufferSignalsResponse {
                    action: BufferAction::Flush.as_str(),
                    affected_count: outcome.attempted,
                    buffer_items: None,
                })
            }
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn round_report(report: StatsReport, include_failures: bool) -> GetRelayStatsResponse {
    let failure_count = include_failures.then_some(report.failure_count);
    GetRelayStatsResponse {
        total_relayed: report.total_relayed,
        success_rate: round2(report.success_rate),
        avg_latency_ms: report.avg_latency_ms.map(round2),
        failure_count,
        by_group: report.by_group.map(|groups| {
            groups
                .into_iter()
                .map(|(key, stats)| {
                    (
                        key,
                        GroupStats {
                            count: stats.count,
                            success_rate: round2(stats.success_rate),
                            avg_latency: stats.avg_latency.map(round2),
                        },
                    )
                })
                .collect()
        }),
        buffer_stats: report.buffer_stats,
    }
}
