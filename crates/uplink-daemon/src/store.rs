/// Shared health store.
///
/// The single piece of shared mutable state in the engine. Every mutation
/// takes the inner mutex for a short, I/O-free critical section; readers
/// get deep-copied snapshots and never observe a torn per-interface
/// record. Interface records are created once at startup and live for the
/// process lifetime. Mutations against unknown names are silently
/// dropped, which covers the brief window during shutdown where a relay
/// outlives the enumeration.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uplink_protocol::health::{HealthSnapshot, IfaceHealth};
use uplink_protocol::history::LatencyHistory;

#[derive(Debug)]
struct IfaceMetrics {
    latencies: LatencyHistory,
    successes: u64,
    failures: u64,
    active_conns: i64,
    bytes_sent: u64,
    bytes_received: u64,
}

impl IfaceMetrics {
    fn new(history_len: usize) -> Self {
        Self {
            latencies: LatencyHistory::new(history_len),
            successes: 0,
            failures: 0,
            active_conns: 0,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }
}

#[derive(Debug)]
struct Inner {
    /// Enumeration order, preserved into every snapshot
    order: Vec<String>,
    metrics: HashMap<String, IfaceMetrics>,
}

#[derive(Debug)]
pub struct HealthStore {
    inner: Mutex<Inner>,
}

impl HealthStore {
    /// Create a store with one record per enumerated interface.
    pub fn new<'a>(names: impl Iterator<Item = &'a str>, history_len: usize) -> Self {
        let order: Vec<String> = names.map(str::to_string).collect();
        let metrics = order
            .iter()
            .map(|n| (n.clone(), IfaceMetrics::new(history_len)))
            .collect();
        Self {
            inner: Mutex::new(Inner { order, metrics }),
        }
    }

    fn with_iface(&self, name: &str, f: impl FnOnce(&mut IfaceMetrics)) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(m) = inner.metrics.get_mut(name) {
            f(m);
        }
    }

    /// Append a latency sample (milliseconds; the failure sentinel counts
    /// as a sample too). The oldest sample is evicted when full.
    pub fn record_probe(&self, name: &str, latency_ms: f64) {
        self.with_iface(name, |m| m.latencies.push(latency_ms));
    }

    pub fn record_success(&self, name: &str) {
        self.with_iface(name, |m| m.successes += 1);
    }

    pub fn record_failure(&self, name: &str) {
        self.with_iface(name, |m| m.failures += 1);
    }

    pub fn inc_active(&self, name: &str) {
        self.with_iface(name, |m| m.active_conns += 1);
    }

    pub fn dec_active(&self, name: &str) {
        self.with_iface(name, |m| {
            m.active_conns -= 1;
            debug_assert!(m.active_conns >= 0, "active_conns underflow on {name}");
        });
    }

    pub fn add_bytes_sent(&self, name: &str, n: u64) {
        self.with_iface(name, |m| m.bytes_sent += n);
    }

    pub fn add_bytes_received(&self, name: &str, n: u64) {
        self.with_iface(name, |m| m.bytes_received += n);
    }

    /// Deep-copied view of every interface, in enumeration order.
    pub fn snapshot(&self) -> HealthSnapshot {
        let inner = self.inner.lock().unwrap();
        let mut snap = HealthSnapshot::new();
        for name in &inner.order {
            let m = &inner.metrics[name];
            snap.push(
                name,
                IfaceHealth {
                    latencies: m.latencies.to_vec(),
                    successes: m.successes,
                    failures: m.failures,
                    active_conns: m.active_conns,
                    bytes_sent: m.bytes_sent,
                    bytes_received: m.bytes_received,
                },
            );
        }
        snap
    }
}

/// Holds one `active_conns` increment for the lifetime of a relay. The
/// drop decrements again, which keeps the gauge balanced on every exit
/// path, errors and cancellation included.
pub struct ActiveGuard {
    store: Arc<HealthStore>,
    name: String,
}

impl ActiveGuard {
    pub fn new(store: Arc<HealthStore>, name: &str) -> Self {
        store.inc_active(name);
        Self {
            store,
            name: name.to_string(),
        }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.store.dec_active(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uplink_protocol::FAILED_PROBE_MS;

    fn store(names: &[&str]) -> HealthStore {
        HealthStore::new(names.iter().copied(), 4)
    }

    #[test]
    fn dial_outcomes_sum_to_attempts() {
        let s = store(&["eth0"]);
        s.record_success("eth0");
        s.record_success("eth0");
        s.record_failure("eth0");
        let snap = s.snapshot();
        let h = snap.get("eth0").unwrap();
        assert_eq!(h.successes, 2);
        assert_eq!(h.failures, 1);
        assert_eq!(h.attempts(), 3);
    }

    #[test]
    fn probe_history_is_bounded() {
        let s = store(&["eth0"]);
        for i in 0..10 {
            s.record_probe("eth0", i as f64);
        }
        let snap = s.snapshot();
        assert_eq!(snap.get("eth0").unwrap().latencies, vec![6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn sentinel_is_stored_like_any_sample() {
        let s = store(&["eth0"]);
        s.record_probe("eth0", FAILED_PROBE_MS);
        let snap = s.snapshot();
        assert_eq!(snap.get("eth0").unwrap().latencies, vec![FAILED_PROBE_MS]);
    }

    #[test]
    fn unknown_interface_is_ignored() {
        let s = store(&["eth0"]);
        s.record_success("tun9");
        s.record_probe("tun9", 1.0);
        s.add_bytes_sent("tun9", 100);
        assert!(s.snapshot().get("tun9").is_none());
    }

    #[test]
    fn active_guard_balances_on_drop() {
        let s = Arc::new(store(&["eth0"]));
        {
            let _guard = ActiveGuard::new(Arc::clone(&s), "eth0");
            assert_eq!(s.snapshot().get("eth0").unwrap().active_conns, 1);
            let _second = ActiveGuard::new(Arc::clone(&s), "eth0");
            assert_eq!(s.snapshot().get("eth0").unwrap().active_conns, 2);
        }
        assert_eq!(s.snapshot().get("eth0").unwrap().active_conns, 0);
    }

    #[test]
    fn byte_counters_accumulate() {
        let s = store(&["eth0"]);
        s.add_bytes_sent("eth0", 4096);
        s.add_bytes_sent("eth0", 100);
        s.add_bytes_received("eth0", 12);
        let snap = s.snapshot();
        let h = snap.get("eth0").unwrap();
        assert_eq!(h.bytes_sent, 4196);
        assert_eq!(h.bytes_received, 12);
    }

    #[test]
    fn snapshot_keeps_enumeration_order() {
        let s = store(&["wlan0", "eth0", "wwan0"]);
        let names: Vec<String> = s.snapshot().iter().map(|(n, _)| n.to_string()).collect();
        assert_eq!(names, vec!["wlan0", "eth0", "wwan0"]);
    }

    #[test]
    fn snapshot_is_a_deep_copy() {
        let s = store(&["eth0"]);
        let before = s.snapshot();
        s.record_success("eth0");
        assert_eq!(before.get("eth0").unwrap().successes, 0);
        assert_eq!(s.snapshot().get("eth0").unwrap().successes, 1);
    }
}
