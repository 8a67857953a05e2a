/// Interface latency prober.
///
/// Drives the periodic measurement rounds: one timed TCP connect per
/// interface, sequentially in enumeration order, never overlapping.
/// Results land in the health store and, when configured, in the CSV
/// observation log. A round in which every interface failed is treated
/// as a possible outage and backs off hard before retrying.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use uplink_protocol::FAILED_PROBE_MS;

use crate::egress;
use crate::observation::{unix_now, ObservationLog, ObservationRow};
use crate::overlay::{overlay_network_id, OverlayRoutes};
use crate::SharedState;

pub async fn run(
    state: Arc<SharedState>,
    overlay: Option<Arc<dyn OverlayRoutes>>,
    mut observations: Option<ObservationLog>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let probe_cfg = state.config.probe.clone();
    let timeout = Duration::from_secs(probe_cfg.timeout_seconds);
    let period = Duration::from_secs(probe_cfg.period_seconds);
    let backoff = Duration::from_secs(probe_cfg.outage_backoff_seconds);

    info!(
        host = %probe_cfg.host,
        port = probe_cfg.port,
        period_s = probe_cfg.period_seconds,
        "Health monitor started"
    );

    loop {
        let mut probed = 0usize;
        let mut failed = 0usize;

        for iface in state.interfaces.iter() {
            // The stop signal is honored between probes only; an
            // in-flight probe always runs to completion or timeout.
            if cancel.is_cancelled() {
                info!("Health monitor stopping");
                return Ok(());
            }

            let target = probe_target(&probe_cfg.host, &iface.name, overlay.as_deref()).await;

            // Counters as they stood before this probe, for the log row
            let pre = state.store.snapshot();

            let latency = probe_latency(iface.ipv4, &target, probe_cfg.port, timeout).await;
            probed += 1;
            if latency >= FAILED_PROBE_MS {
                failed += 1;
            }

            state.store.record_probe(&iface.name, latency);
            info!(iface = %iface.name, ip = %iface.ipv4, latency_ms = latency, "Probe complete");

            if let Some(log) = observations.as_mut() {
                let (successes, failures, active_conns) = pre
                    .get(&iface.name)
                    .map(|h| (h.successes, h.failures, h.active_conns))
                    .unwrap_or_default();
                let row = ObservationRow {
                    timestamp: unix_now(),
                    interface_name: iface.name.clone(),
                    latency,
                    successes,
                    failures,
                    active_conns,
                };
                if let Err(e) = log.record(&row).await {
                    warn!(error = %e, "Failed to append observation row");
                }
            }
        }

        if probed > 0 && failed == probed {
            warn!(
                backoff_s = probe_cfg.outage_backoff_seconds,
                "All interfaces failed latency probes; possible outage, backing off"
            );
        }

        let delay = round_delay(probed, failed, period, backoff);
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Health monitor stopping");
                return Ok(());
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Probe the configured target, unless the interface belongs to an
/// overlay network whose default gateway we can resolve.
async fn probe_target(
    default_host: &str,
    iface_name: &str,
    overlay: Option<&dyn OverlayRoutes>,
) -> String {
    let Some(overlay) = overlay else {
        return default_host.to_string();
    };
    let Some(network_id) = overlay_network_id(iface_name) else {
        return default_host.to_string();
    };
    match overlay.default_gateway(network_id).await {
        Some(gateway) => {
            debug!(
                iface = iface_name,
                network_id,
                gateway = %gateway,
                "Probing overlay gateway instead of default target"
            );
            gateway.to_string()
        }
        None => {
            debug!(
                iface = iface_name,
                network_id, "No overlay gateway found, using default probe target"
            );
            default_host.to_string()
        }
    }
}

/// Wall-clock time for one TCP connect from `local_ip` to `host:port`,
/// in milliseconds. Timeouts, refusals, and every other I/O error all
/// collapse into the failure sentinel; the socket is closed as soon as
/// the connection is established.
pub(crate) async fn probe_latency(
    local_ip: Ipv4Addr,
    host: &str,
    port: u16,
    timeout: Duration,
) -> f64 {
    let start = Instant::now();
    match tokio::time::timeout(timeout, egress::connect_from(local_ip, host, port)).await {
        Ok(Ok(stream)) => {
            let elapsed = start.elapsed().as_secs_f64() * 1000.0;
            drop(stream);
            elapsed
        }
        Ok(Err(e)) => {
            warn!(ip = %local_ip, host, error = %e, "Latency probe failed");
            FAILED_PROBE_MS
        }
        Err(_) => {
            warn!(ip = %local_ip, host, timeout_s = timeout.as_secs(), "Latency probe timed out");
            FAILED_PROBE_MS
        }
    }
}

/// Delay to apply after a round: full-outage rounds back off hard, every
/// other round sleeps the configured period.
pub(crate) fn round_delay(
    probed: usize,
    failed: usize,
    period: Duration,
    backoff: Duration,
) -> Duration {
    if probed > 0 && failed == probed {
        backoff
    } else {
        period
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::net::TcpListener;

    const PERIOD: Duration = Duration::from_secs(10);
    const BACKOFF: Duration = Duration::from_secs(60);

    #[test]
    fn healthy_round_sleeps_period() {
        assert_eq!(round_delay(2, 0, PERIOD, BACKOFF), PERIOD);
        assert_eq!(round_delay(2, 1, PERIOD, BACKOFF), PERIOD);
    }

    #[test]
    fn total_outage_backs_off() {
        assert_eq!(round_delay(2, 2, PERIOD, BACKOFF), BACKOFF);
        assert_eq!(round_delay(1, 1, PERIOD, BACKOFF), BACKOFF);
    }

    #[test]
    fn empty_round_does_not_back_off() {
        assert_eq!(round_delay(0, 0, PERIOD, BACKOFF), PERIOD);
    }

    #[tokio::test]
    async fn probe_measures_reachable_target() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let latency =
            probe_latency(Ipv4Addr::LOCALHOST, "127.0.0.1", port, Duration::from_secs(3)).await;
        assert!(latency >= 0.0);
        assert!(latency < FAILED_PROBE_MS);
    }

    #[tokio::test]
    async fn probe_failure_yields_sentinel() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let latency =
            probe_latency(Ipv4Addr::LOCALHOST, "127.0.0.1", port, Duration::from_secs(3)).await;
        assert_eq!(latency, FAILED_PROBE_MS);
    }

    struct FixedGateway(Ipv4Addr);

    #[async_trait]
    impl OverlayRoutes for FixedGateway {
        async fn default_gateway(&self, _network_id: &str) -> Option<Ipv4Addr> {
            Some(self.0)
        }
    }

    struct NoRoutes;

    #[async_trait]
    impl OverlayRoutes for NoRoutes {
        async fn default_gateway(&self, _network_id: &str) -> Option<Ipv4Addr> {
            None
        }
    }

    #[tokio::test]
    async fn overlay_interface_probes_gateway() {
        let overlay = FixedGateway(Ipv4Addr::new(10, 147, 17, 1));
        let target = probe_target(
            "www.google.com",
            "ZeroTier One [8056c2e21c000001]",
            Some(&overlay as &dyn OverlayRoutes),
        )
        .await;
        assert_eq!(target, "10.147.17.1");
    }

    #[tokio::test]
    async fn plain_interface_keeps_default_target() {
        let overlay = FixedGateway(Ipv4Addr::new(10, 147, 17, 1));
        let target = probe_target("www.google.com", "eth0", Some(&overlay as &dyn OverlayRoutes)).await;
        assert_eq!(target, "www.google.com");
    }

    #[tokio::test]
    async fn missing_gateway_falls_back_to_default() {
        let target = probe_target(
            "www.google.com",
            "ZeroTier One [8056c2e21c000001]",
            Some(&NoRoutes as &dyn OverlayRoutes),
        )
        .await;
        assert_eq!(target, "www.google.com");
    }

    #[tokio::test]
    async fn no_overlay_client_keeps_default_target() {
        let target = probe_target("www.google.com", "ZeroTier One [8056c2e21c000001]", None).await;
        assert_eq!(target, "www.google.com");
    }
}
