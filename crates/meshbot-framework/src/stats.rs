//! Dispatch counters and the combined stats snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use meshbot_core::{Store, StoreResult};

/// Process-lifetime counters, shared by the dispatcher, router and API.
#[derive(Debug)]
pub struct DispatchCounters {
    started: Instant,
    rx_events: AtomicU64,
    tx_parts: AtomicU64,
    plugin_failures: AtomicU64,
    timeouts: AtomicU64,
}

impl Default for DispatchCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchCounters {
    /// Creates zeroed counters; uptime starts now.
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            rx_events: AtomicU64::new(0),
            tx_parts: AtomicU64::new(0),
            plugin_failures: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_rx(&self) {
        self.rx_events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_tx(&self) {
        self.tx_parts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_plugin_failure(&self) {
        self.plugin_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Events accepted by `submit`.
    pub fn rx_events(&self) -> u64 {
        self.rx_events.load(Ordering::Relaxed)
    }

    /// Frames handed to the radio.
    pub fn tx_parts(&self) -> u64 {
        self.tx_parts.load(Ordering::Relaxed)
    }

    /// Plugin hooks that failed, panicked or overran.
    pub fn plugin_failures(&self) -> u64 {
        self.plugin_failures.load(Ordering::Relaxed)
    }

    /// `submit` calls that gave up waiting.
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Whole seconds since the counters were created.
    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

/// Formats seconds as `1d 2h 3m 4s`, omitting leading zero units.
pub fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;
    let secs = seconds % 60;

    let mut parts = Vec::with_capacity(4);
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if days > 0 || hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if days > 0 || hours > 0 || minutes > 0 {
        parts.push(format!("{minutes}m"));
    }
    parts.push(format!("{secs}s"));
    parts.join(" ")
}

/// Store totals combined with the live counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Distinct stations ever heard.
    pub station_count: u64,
    /// Stored conversation messages, both directions.
    pub message_count: u64,
    /// Rows in the name history.
    pub name_rows: u64,
    /// Events accepted by `submit` since start.
    pub rx_messages: u64,
    /// Frames handed to the radio since start.
    pub tx_messages: u64,
    /// Plugin hooks that failed, panicked or overran.
    pub plugin_failures: u64,
    /// `submit` calls that gave up waiting.
    pub dispatch_timeouts: u64,
    /// Seconds since the counters were created.
    pub uptime_seconds: u64,
    /// `uptime_seconds` formatted by [`format_uptime`].
    pub uptime_human: String,
}

impl StatsSnapshot {
    /// Reads store totals and merges in `counters`.
    pub async fn collect(store: &dyn Store, counters: &DispatchCounters) -> StoreResult<Self> {
        let totals = store.read_stats().await?;
        let uptime = counters.uptime_seconds();
        Ok(Self {
            station_count: totals.station_count,
            message_count: totals.message_count,
            name_rows: totals.name_rows,
            rx_messages: counters.rx_events(),
            tx_messages: counters.tx_parts(),
            plugin_failures: counters.plugin_failures(),
            dispatch_timeouts: counters.timeouts(),
            uptime_seconds: uptime,
            uptime_human: format_uptime(uptime),
        })
    }

    /// The three-line summary used by `/stats`.
    pub fn summary(&self) -> String {
        format!(
            "Uptime: {}\nDB users: {} (name rows: {})\nRX msgs: {} | TX msgs: {}",
            self.uptime_human, self.station_count, self.name_rows, self.rx_messages, self.tx_messages
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(0), "0s");
        assert_eq!(format_uptime(61), "1m 1s");
        assert_eq!(format_uptime(3_600), "1h 0m 0s");
        assert_eq!(format_uptime(90_061), "1d 1h 1m 1s");
    }

    #[test]
    fn test_counters() {
        let counters = DispatchCounters::new();
        counters.record_rx();
        counters.record_rx();
        counters.record_tx();
        assert_eq!(counters.rx_events(), 2);
        assert_eq!(counters.tx_parts(), 1);
        assert_eq!(counters.timeouts(), 0);
    }
}
