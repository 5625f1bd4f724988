//! Lightweight Prometheus-compatible metrics for the adapter.
//!
//! Uses atomic counters for lock-free instrumentation. Rendered in Prometheus
//! text exposition format and embedded in the `status` snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Lightweight Prometheus-compatible metrics for the adapter.
#[derive(Debug)]
pub struct Metrics {
    /// Connectivity establishment attempts (counter)
    pub connectivity_attempts_total: AtomicU64,
    /// Links that reached CONNECTED (counter)
    pub connections_total: AtomicU64,
    /// Links that dropped to DISCONNECTED (counter)
    pub connection_losses_total: AtomicU64,
    /// Datagrams read from the game and sent over ICE (counter)
    pub game_to_ice_packets_total: AtomicU64,
    /// Payload bytes read from the game and sent over ICE (counter)
    pub game_to_ice_bytes_total: AtomicU64,
    /// Datagrams received over ICE and written to the game (counter)
    pub ice_to_game_packets_total: AtomicU64,
    /// Payload bytes received over ICE and written to the game (counter)
    pub ice_to_game_bytes_total: AtomicU64,
    /// GPGNet messages received from the game (counter)
    pub gpgnet_messages_in_total: AtomicU64,
    /// GPGNet messages written to the game (counter)
    pub gpgnet_messages_out_total: AtomicU64,
    /// Adapter start time (for uptime calculation)
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connectivity_attempts_total: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            connection_losses_total: AtomicU64::new(0),
            game_to_ice_packets_total: AtomicU64::new(0),
            game_to_ice_bytes_total: AtomicU64::new(0),
            ice_to_game_packets_total: AtomicU64::new(0),
            ice_to_game_bytes_total: AtomicU64::new(0),
            gpgnet_messages_in_total: AtomicU64::new(0),
            gpgnet_messages_out_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Count one datagram of `len` payload bytes from the game
    pub fn record_game_to_ice(&self, len: usize) {
        self.game_to_ice_packets_total.fetch_add(1, Ordering::Relaxed);
        self.game_to_ice_bytes_total.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Count one datagram of `len` payload bytes towards the game
    pub fn record_ice_to_game(&self, len: usize) {
        self.ice_to_game_packets_total.fetch_add(1, Ordering::Relaxed);
        self.ice_to_game_bytes_total.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let counters: [(&str, &str, &AtomicU64); 9] = [
            (
                "ice_adapter_connectivity_attempts_total",
                "Connectivity establishment attempts",
                &self.connectivity_attempts_total,
            ),
            (
                "ice_adapter_connections_total",
                "Peer links that reached connected",
                &self.connections_total,
            ),
            (
                "ice_adapter_connection_losses_total",
                "Peer links that were lost",
                &self.connection_losses_total,
            ),
            (
                "ice_adapter_game_to_ice_packets_total",
                "Datagrams relayed from the game over ICE",
                &self.game_to_ice_packets_total,
            ),
            (
                "ice_adapter_game_to_ice_bytes_total",
                "Bytes relayed from the game over ICE",
                &self.game_to_ice_bytes_total,
            ),
            (
                "ice_adapter_ice_to_game_packets_total",
                "Datagrams relayed from ICE to the game",
                &self.ice_to_game_packets_total,
            ),
            (
                "ice_adapter_ice_to_game_bytes_total",
                "Bytes relayed from ICE to the game",
                &self.ice_to_game_bytes_total,
            ),
            (
                "ice_adapter_gpgnet_messages_in_total",
                "GPGNet messages received from the game",
                &self.gpgnet_messages_in_total,
            ),
            (
                "ice_adapter_gpgnet_messages_out_total",
                "GPGNet messages sent to the game",
                &self.gpgnet_messages_out_total,
            ),
        ];

        let mut out = String::new();
        for (name, help, value) in counters.iter() {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {}\n",
                value.load(Ordering::Relaxed)
            ));
        }
        out.push_str(&format!(
            "# HELP ice_adapter_uptime_seconds Adapter uptime in seconds\n\
             # TYPE ice_adapter_uptime_seconds gauge\n\
             ice_adapter_uptime_seconds {}\n",
            self.start_time.elapsed().as_secs()
        ));
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render_format() {
        let m = Metrics::new();
        m.record_game_to_ice(100);
        m.record_game_to_ice(28);
        m.connections_total.fetch_add(3, Ordering::Relaxed);
        let output = m.render();
        assert!(output.contains("ice_adapter_game_to_ice_packets_total 2"));
        assert!(output.contains("ice_adapter_game_to_ice_bytes_total 128"));
        assert!(output.contains("ice_adapter_connections_total 3"));
        assert!(output.contains("ice_adapter_connection_losses_total 0"));
    }

    #[test]
    fn test_metrics_default_zero() {
        let m = Metrics::new();
        assert_eq!(m.connectivity_attempts_total.load(Ordering::Relaxed), 0);
        assert_eq!(m.ice_to_game_bytes_total.load(Ordering::Relaxed), 0);
        assert_eq!(m.gpgnet_messages_in_total.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_metrics_render_prometheus_format() {
        let m = Metrics::new();
        let output = m.render();
        assert!(output.contains("# HELP ice_adapter_gpgnet_messages_out_total"));
        assert!(output.contains("# TYPE ice_adapter_gpgnet_messages_out_total counter"));
        assert!(output.contains("# TYPE ice_adapter_uptime_seconds gauge"));
        assert!(output
            .lines()
            .any(|l| l.starts_with("ice_adapter_uptime_seconds ")));
    }
}
