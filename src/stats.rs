//! Periodic rollup of relay history into aggregated statistics, plus the
//! query API the tool surface exposes.
//!
//! The rollup reads raw relay records for the previous hour (capped at
//! 10 000 rows per tick), expands each record per target, and writes one
//! bucket per unique `(signal_type, source_server, target_server)` key.
//! Re-rolling a period replaces its buckets rather than duplicating them.
//!
//! The query's `avg_latency_ms` is a sample-weighted mean of bucket means —
//! an accepted approximation of the true per-relay mean given the rollup
//! design.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;

use crate::events::{topic, EventBus};
use crate::logging;
use crate::rlog;
use crate::storage::{now_ms, BufferStateCounts, StatsBucketRow, Store, StoreError};

const HOUR_MS: u64 = 3_600_000;

/// Maximum raw relay rows consumed per rollup tick.
const ROLLUP_ROW_CAP: usize = 10_000;

/// Grouping dimension for stats queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    SignalType,
    Source,
    Target,
    Hour,
    Day,
}

impl GroupBy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "signal_type" => Some(GroupBy::SignalType),
            "source" => Some(GroupBy::Source),
            "target" => Some(GroupBy::Target),
            "hour" => Some(GroupBy::Hour),
            "day" => Some(GroupBy::Day),
            _ => None,
        }
    }
}

/// Aggregates for one group key.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GroupStats {
    pub count: i64,
    /// Percentage in `[0, 100]`.
    pub success_rate: f64,
    pub avg_latency: Option<f64>,
}

/// Result shape for a stats query.
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub total_relayed: i64,
    /// Per-target failure contributions summed over the window.
    pub failure_count: i64,
    /// Percentage in `[0, 100]`; zero when nothing was relayed.
    pub success_rate: f64,
    /// Sample-weighted mean of bucket means, restricted to buckets that
    /// carry latency samples.
    pub avg_latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub by_group: Option<HashMap<String, GroupStats>>,
    pub buffer_stats: BufferStateCounts,
}

pub struct StatsAggregator {
    store: Arc<Mutex<Store>>,
    events: EventBus,
}

impl StatsAggregator {
    pub fn new(store: Arc<Mutex<Store>>, events: EventBus) -> Self {
        Self { store, events }
    }

    /// Roll up the previous hour.  Returns the number of buckets written.
    pub async fn rollup(&self) -> Result<usize, StoreError> {
        self.rollup_at(now_ms()).await
    }

    /// Roll up the hour preceding `now`, aligned to the hour boundary.
    /// Split out from [`StatsAggregator::rollup`] so tests can pin the clock.
    pub async fn rollup_at(&self, now: u64) -> Result<usize, StoreError> {
        let period_start = (now.saturating_sub(HOUR_MS) / HOUR_MS) * HOUR_MS;
        let mut store = self.store.lock().await;

        let records = store.list_relay_records_since(period_start, ROLLUP_ROW_CAP)?;
        let buffered = store.buffered_counts_between(period_start, period_start + HOUR_MS)?;

        let mut acc: HashMap<(u16, String, String), BucketAcc> = HashMap::new();
        for record in &records {
            for target in &record.target_servers {
                let key = (
                    record.signal_type,
                    record.source_server.clone(),
                    target.clone(),
                );
                let entry = acc.entry(key).or_default();
                entry.total += 1;
                if record.targets_reached.contains(target) {
                    entry.success += 1;
                }
                if record.targets_failed.contains(target) {
                    entry.failure += 1;
                }
                entry.latency_samples.push(record.latency_ms);
            }
        }
        for (signal_type, source, target, count) in buffered {
            acc.entry((signal_type, source, target)).or_default().buffered = count;
        }

        let buckets: Vec<StatsBucketRow> = acc
            .into_iter()
            .map(|((signal_type, source, target), entry)| {
                let (avg, max) = entry.latency_summary();
                StatsBucketRow {
                    id: 0,
                    period_start,
                    signal_type: Some(signal_type),
                    source_server: Some(source),
                    target_server: Some(target),
                    total_relayed: entry.total,
                    success_count: entry.success,
                    failure_count: entry.failure,
                    avg_latency_ms: avg,
                    max_latency_ms: max,
                    buffered_count: entry.buffered,
                }
            })
            .collect();

        store.replace_stats_buckets(period_start, &buckets)?;
        drop(store);

        rlog!(
            "stats: rolled up {} bucket(s) for period {}",
            buckets.len(),
            logging::format_iso_hour(period_start)
        );
        self.events.emit(
            topic::STATS_UPDATE,
            json!({
                "period_start": period_start,
                "buckets": buckets.len(),
            }),
        );
        Ok(buckets.len())
    }

    /// Query aggregated stats for `[since, until]`, optionally grouped.
    pub async fn query(
        &self,
        since: u64,
        until: Option<u64>,
        group_by: Option<GroupBy>,
    ) -> Result<StatsReport, StoreError> {
        let store = self.store.lock().await;
        let buckets = store.list_stats_buckets(since, until.unwrap_or_else(now_ms))?;
        let buffer_stats = store.buffer_state_counts()?;
        drop(store);

        let total: i64 = buckets.iter().map(|b| b.total_relayed).sum();
        let success: i64 = buckets.iter().map(|b| b.success_count).sum();
        let failure_count: i64 = buckets.iter().map(|b| b.failure_count).sum();
        let success_rate = if total > 0 {
            success as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        let avg_latency_ms = weighted_avg_latency(&buckets);

        let by_group = group_by.map(|dimension| {
            let mut groups: HashMap<String, Vec<&StatsBucketRow>> = HashMap::new();
            for bucket in &buckets {
                groups.entry(group_key(bucket, dimension)).or_default().push(bucket);
            }
            groups
                .into_iter()
                .map(|(key, members)| {
                    let count: i64 = members.iter().map(|b| b.total_relayed).sum();
                    let success: i64 = members.iter().map(|b| b.success_count).sum();
                    let rate = if count > 0 {
                        success as f64 / count as f64 * 100.0
                    } else {
                        0.0
                    };
                    let avg = weighted_avg_latency_refs(&members);
                    (
                        key,
                        GroupStats {
                            count,
                            success_rate: rate,
                            avg_latency: avg,
                        },
                    )
                })
                .collect()
        });

        Ok(StatsReport {
            total_relayed: total,
            failure_count,
            success_rate,
            avg_latency_ms,
            by_group,
            buffer_stats,
        })
    }
}

#[derive(Default)]
struct BucketAcc {
    total: i64,
    success: i64,
    failure: i64,
    buffered: i64,
    latency_samples: Vec<u64>,
}

impl BucketAcc {
    fn latency_summary(&self) -> (Option<f64>, Option<i64>) {
        if self.latency_samples.is_empty() {
            return (None, None);
        }
        let sum: u64 = self.latency_samples.iter().sum();
        let avg = sum as f64 / self.latency_samples.len() as f64;
        let max = self.latency_samples.iter().max().copied().unwrap_or(0) as i64;
        (Some(avg), Some(max))
    }
}

fn group_key(bucket: &StatsBucketRow, dimension: GroupBy) -> String {
    match dimension {
        GroupBy::SignalType => match bucket.signal_type {
            Some(code) => format!("signal_{code}"),
            None => "signal_unknown".to_string(),
        },
        GroupBy::Source => bucket
            .source_server
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        GroupBy::Target => bucket
            .target_server
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        GroupBy::Hour => logging::format_iso_hour(bucket.period_start),
        GroupBy::Day => logging::format_iso_day(bucket.period_start),
    }
}

fn weighted_avg_latency(buckets: &[StatsBucketRow]) -> Option<f64> {
    let refs: Vec<&StatsBucketRow> = buckets.iter().collect();
    weighted_avg_latency_refs(&refs)
}

/// Sample-weighted mean of bucket means over buckets with a non-null avg.
fn weighted_avg_latency_refs(buckets: &[&StatsBucketRow]) -> Option<f64> {
    let mut weighted_sum = 0.0;
    let mut weight = 0i64;
    for bucket in buckets {
        if let Some(avg) = bucket.avg_latency_ms {
            weighted_sum += avg * bucket.total_relayed as f64;
            weight += bucket.total_relayed;
        }
    }
    if weight > 0 {
        Some(weighted_sum / weight as f64)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Priority, RelayRecordRow};
    use serde_json::Map;

    fn record(
        id: &str,
        relayed_at: u64,
        targets: &[&str],
        reached: &[&str],
        latency: u64,
    ) -> RelayRecordRow {
        RelayRecordRow {
            id: id.to_string(),
            signal_type: 0x50,
            source_server: "X".to_string(),
            target_servers: targets.iter().map(|t| t.to_string()).collect(),
            payload: Map::new(),
            priority: Priority::Normal,
            relayed_at,
            success: !reached.is_empty(),
            targets_reached: reached.iter().map(|t| t.to_string()).collect(),
            targets_failed: targets
                .iter()
                .filter(|t| !reached.contains(t))
                .map(|t| t.to_string())
                .collect(),
            latency_ms: latency,
            error_message: None,
        }
    }

    fn aggregator() -> StatsAggregator {
        let store = Store::open_in_memory().expect("store");
        StatsAggregator::new(Arc::new(Mutex::new(store)), EventBus::new())
    }

    #[tokio::test]
    async fn rollup_expands_records_per_target() {
        let aggregator = aggregator();
        let now = 2 * HOUR_MS + 600_000;
        let in_period = HOUR_MS + 60_000;
        {
            let store = aggregator.store.lock().await;
            store
                .insert_relay_record(&record("r1", in_period, &["A", "B"], &["A"], 10))
                .expect("insert");
            store
                .insert_relay_record(&record("r2", in_period + 1, &["A"], &["A"], 30))
                .expect("insert");
        }

        let written = aggregator.rollup_at(now).await.expect("rollup");
        assert_eq!(written, 2);

        let buckets = aggregator
            .store
            .lock()
            .await
            .list_stats_buckets(0, now)
            .expect("list");
        let bucket_a = buckets
            .iter()
            .find(|b| b.target_server.as_deref() == Some("A"))
            .expect("A bucket");
        assert_eq!(bucket_a.total_relayed, 2);
        assert_eq!(bucket_a.success_count, 2);
        assert_eq!(bucket_a.failure_count, 0);
        assert_eq!(bucket_a.avg_latency_ms, Some(20.0));
        assert_eq!(bucket_a.max_latency_ms, Some(30));

        let bucket_b = buckets
            .iter()
            .find(|b| b.target_server.as_deref() == Some("B"))
            .expect("B bucket");
        assert_eq!(bucket_b.total_relayed, 1);
        assert_eq!(bucket_b.success_count, 0);
        assert_eq!(bucket_b.failure_count, 1);
    }

    #[tokio::test]
    async fn query_totals_and_grouping() {
        let aggregator = aggregator();
        let now = 2 * HOUR_MS + 600_000;
        let in_period = HOUR_MS + 60_000;
        {
            let store = aggregator.store.lock().await;
            // Three relays from X to A: two reach, one fails.
            store
                .insert_relay_record(&record("r1", in_period, &["A"], &["A"], 5))
                .expect("insert");
            store
                .insert_relay_record(&record("r2", in_period + 1, &["A"], &["A"], 15))
                .expect("insert");
            store
                .insert_relay_record(&record("r3", in_period + 2, &["A"], &[], 10))
                .expect("insert");
        }
        aggregator.rollup_at(now).await.expect("rollup");

        let report = aggregator
            .query(0, Some(now), Some(GroupBy::Source))
            .await
            .expect("query");
        assert_eq!(report.total_relayed, 3);
        assert!((report.success_rate - 66.666).abs() < 0.01);
        assert!(report.avg_latency_ms.expect("latency") >= 0.0);

        let groups = report.by_group.expect("groups");
        let x = groups.get("X").expect("X group");
        assert_eq!(x.count, 3);
        assert!((x.success_rate - 66.666).abs() < 0.01);
    }

    #[tokio::test]
    async fn query_with_no_data_reports_zeroes() {
        let aggregator = aggregator();
        let report = aggregator.query(0, None, None).await.expect("query");
        assert_eq!(report.total_relayed, 0);
        assert_eq!(report.success_rate, 0.0);
        assert!(report.avg_latency_ms.is_none());
        assert!(report.by_group.is_none());
    }

    #[tokio::test]
    async fn group_keys_follow_dimension_formats() {
        let bucket = StatsBucketRow {
            id: 0,
            period_start: 1_785_662_045_000 / HOUR_MS * HOUR_MS,
            signal_type: Some(0x50),
            source_server: Some("X".to_string()),
            target_server: Some("A".to_string()),
            total_relayed: 1,
            success_count: 1,
            failure_count: 0,
            avg_latency_ms: None,
            max_latency_ms: None,
            buffered_count: 0,
        };
        assert_eq!(group_key(&bucket, GroupBy::SignalType), "signal_80");
        assert_eq!(group_key(&bucket, GroupBy::Source), "X");
        assert_eq!(group_key(&bucket, GroupBy::Target), "A");
        assert_eq!(group_key(&bucket, GroupBy::Hour), "2026-08-02T09");
        assert_eq!(group_key(&bucket, GroupBy::Day), "2026-08-02");
    }

    #[tokio::test]
    async fn rerolling_a_period_does_not_double_count() {
        let aggregator = aggregator();
        let now = 2 * HOUR_MS + 600_000;
        {
            let store = aggregator.store.lock().await;
            store
                .insert_relay_record(&record("r1", HOUR_MS + 1, &["A"], &["A"], 5))
                .expect("insert");
        }
        aggregator.rollup_at(now).await.expect("rollup");
        aggregator.rollup_at(now).await.expect("rollup again");

        let report = aggregator.query(0, Some(now), None).await.expect("query");
        assert_eq!(report.total_relayed, 1);
        assert_eq!(report.success_rate, 100.0);
    }
}
