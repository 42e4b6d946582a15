//! Inbound admission filter.
//!
//! A decoded datagram is accepted iff its signal type is on the configured
//! whitelist (when one is configured at all) and its timestamp falls inside
//! the freshness window: at most five minutes of skew in either direction,
//! and never more than one minute into the future.
//!
//! The peer whitelist is advisory only — datagrams from unknown senders are
//! admitted.  Heartbeats from anyone are welcomed; this is a deliberate
//! design choice, not an oversight.  Rejection is silent: log, then drop.

use std::collections::HashSet;

use crate::codec::DecodedSignal;
use crate::logging;
use crate::rlog;

/// Maximum absolute clock skew tolerated, in milliseconds.
const MAX_SKEW_MS: i64 = 300_000;

/// Maximum future drift tolerated, in milliseconds.
const MAX_FUTURE_MS: i64 = 60_000;

pub struct Tumbler {
    /// Accepted signal codes.  Empty means accept every code.
    incoming: HashSet<u16>,
}

impl Tumbler {
    pub fn new(incoming_codes: impl IntoIterator<Item = u16>) -> Self {
        Self {
            incoming: incoming_codes.into_iter().collect(),
        }
    }

    /// Whether the signal passes admission.  The caller drops rejected
    /// datagrams without replying.
    pub fn admit(&self, decoded: &DecodedSignal, now_ms: u64) -> bool {
        if !self.incoming.is_empty() && !self.incoming.contains(&decoded.signal_type) {
            rlog!(
                "tumbler: rejected signal {} (not whitelisted)",
                logging::signal_code(decoded.signal_type)
            );
            return false;
        }

        let ts_ms = (decoded.timestamp as i64).saturating_mul(1000);
        let now = now_ms as i64;
        if (now - ts_ms).abs() > MAX_SKEW_MS || ts_ms - now > MAX_FUTURE_MS {
            rlog!(
                "tumbler: rejected stale signal {} (ts {} now {})",
                logging::signal_code(decoded.signal_type),
                ts_ms,
                now
            );
            return false;
        }

        true
    }
}
