/// Health types shared between the daemon's engine tasks and external
/// observers (dashboards, the CSV observation log, offline training).
///
/// `HealthSnapshot` is a deep copy taken from the health store: consumers
/// get an internally consistent view per interface without holding any
/// lock. Interfaces keep their enumeration order, which is also the
/// selector's tie-break order, so the snapshot serializes to a JSON object
/// whose keys appear in that order.

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::FAILED_PROBE_MS;

/// Per-interface metrics as seen at snapshot time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IfaceHealth {
    /// Recent latency samples in milliseconds, oldest first
    pub latencies: Vec<f64>,
    /// Outbound dials that established a connection
    pub successes: u64,
    /// Outbound dials that failed or timed out
    pub failures: u64,
    /// Streams currently relaying through this interface
    pub active_conns: i64,
    /// Payload bytes forwarded client → remote
    pub bytes_sent: u64,
    /// Payload bytes forwarded remote → client
    pub bytes_received: u64,
}

impl IfaceHealth {
    /// Total dial outcomes recorded so far.
    pub fn attempts(&self) -> u64 {
        self.successes + self.failures
    }

    /// Mean over every retained sample; an unprobed interface scores as
    /// one failed probe.
    pub fn avg_latency(&self) -> f64 {
        if self.latencies.is_empty() {
            return FAILED_PROBE_MS;
        }
        self.latencies.iter().sum::<f64>() / self.latencies.len() as f64
    }

    /// Mean over the newest `n` samples (or fewer if the history is
    /// shorter). Empty history yields the failure sentinel.
    pub fn latency_avg_last(&self, n: usize) -> f64 {
        let tail_len = self.latencies.len().min(n);
        if tail_len == 0 {
            return FAILED_PROBE_MS;
        }
        let tail = &self.latencies[self.latencies.len() - tail_len..];
        tail.iter().sum::<f64>() / tail_len as f64
    }

    /// Fraction of dials that succeeded. An interface that was never
    /// dialed counts as perfect: unknown is treated as good.
    pub fn success_rate(&self) -> f64 {
        let attempts = self.attempts();
        if attempts == 0 {
            return 1.0;
        }
        self.successes as f64 / attempts as f64
    }
}

/// Read-only view of every interface's metrics, in enumeration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthSnapshot {
    entries: Vec<(String, IfaceHealth)>,
}

impl HealthSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interface. Insertion order is preserved everywhere the
    /// snapshot is iterated or serialized.
    pub fn push(&mut self, name: impl Into<String>, health: IfaceHealth) {
        self.entries.push((name.into(), health));
    }

    pub fn get(&self, name: &str) -> Option<&IfaceHealth> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, h)| h)
    }

    /// Record a hypothetical dial failure on a local working copy. Used by
    /// the dispatcher's fallback loop so a just-failed interface ranks
    /// lower on the next selector call without touching the live store.
    pub fn bump_failure(&mut self, name: &str) {
        if let Some((_, h)) = self.entries.iter_mut().find(|(n, _)| n == name) {
            h.failures += 1;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &IfaceHealth)> {
        self.entries.iter().map(|(n, h)| (n.as_str(), h))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for HealthSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, health) in &self.entries {
            map.serialize_entry(name, health)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(latencies: &[f64], successes: u64, failures: u64) -> IfaceHealth {
        IfaceHealth {
            latencies: latencies.to_vec(),
            successes,
            failures,
            ..Default::default()
        }
    }

    #[test]
    fn avg_latency_of_empty_is_sentinel() {
        assert_eq!(sample(&[], 0, 0).avg_latency(), FAILED_PROBE_MS);
    }

    #[test]
    fn avg_latency_over_all_samples() {
        assert_eq!(sample(&[10.0, 20.0, 30.0], 0, 0).avg_latency(), 20.0);
    }

    #[test]
    fn latency_avg_last_uses_tail() {
        let h = sample(&[100.0, 100.0, 10.0, 20.0, 30.0, 40.0, 50.0], 0, 0);
        assert_eq!(h.latency_avg_last(5), 30.0);
        // Shorter history than the window just averages everything
        assert_eq!(sample(&[10.0, 20.0], 0, 0).latency_avg_last(5), 15.0);
        assert_eq!(sample(&[], 0, 0).latency_avg_last(5), FAILED_PROBE_MS);
    }

    #[test]
    fn success_rate_with_no_attempts_is_one() {
        assert_eq!(sample(&[], 0, 0).success_rate(), 1.0);
    }

    #[test]
    fn success_rate_counts_attempts() {
        assert_eq!(sample(&[], 3, 1).success_rate(), 0.75);
    }

    #[test]
    fn bump_failure_only_touches_named_entry() {
        let mut snap = HealthSnapshot::new();
        snap.push("wlan0", sample(&[], 2, 0));
        snap.push("eth0", sample(&[], 5, 1));
        snap.bump_failure("wlan0");
        assert_eq!(snap.get("wlan0").unwrap().failures, 1);
        assert_eq!(snap.get("eth0").unwrap().failures, 1);
        // Unknown names are a no-op
        snap.bump_failure("tun9");
    }

    #[test]
    fn serializes_as_object_in_insertion_order() {
        let mut snap = HealthSnapshot::new();
        snap.push("wlan0", sample(&[12.5, 14.0], 1, 0));
        snap.push("eth0", sample(&[], 0, 0));
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.starts_with('{'));
        assert!(json.find("wlan0").unwrap() < json.find("eth0").unwrap());
        assert!(json.contains("\"latencies\":[12.5,14.0]"));
    }
}
