//! Echo-based liveness probe for an established link
//!
//! Only the offering side runs the checker. Every tick it sends an echo over
//! the data channel; the answering side bounces it back. A link that has been
//! silent for longer than the echo timeout is reported lost.
//!
//! # Echo Datagram
//!
//! ```text
//! ┌──────────┬───────────┬──────────────────────────────┐
//! │ 'e' (1B) │ role (1B) │ sender millis, big-endian 8B │
//! └──────────┴───────────┴──────────────────────────────┘
//! role: 0 = request, 1 = reply
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::timer::{lock, Clock, Scheduler};

// ============================================================================
// Constants
// ============================================================================

/// Tag of echo datagrams on the data channel
pub const ECHO_TAG: u8 = b'e';

/// Total echo datagram length
pub const ECHO_LEN: usize = 10;

/// Weight of the previous average when folding in a new sample
const RTT_SMOOTHING: f64 = 0.8;

// ============================================================================
// Echo Encoding
// ============================================================================

/// Direction of an echo
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoRole {
    Request = 0,
    Reply = 1,
}

/// Build an echo datagram
pub fn encode_echo(role: EchoRole, millis: u64) -> [u8; ECHO_LEN] {
    let mut buf = [0u8; ECHO_LEN];
    buf[0] = ECHO_TAG;
    buf[1] = role as u8;
    buf[2..].copy_from_slice(&millis.to_be_bytes());
    buf
}

/// Parse an echo datagram
pub fn decode_echo(data: &[u8]) -> Option<(EchoRole, u64)> {
    if data.len() != ECHO_LEN || data[0] != ECHO_TAG {
        return None;
    }
    let role = match data[1] {
        0 => EchoRole::Request,
        1 => EchoRole::Reply,
        _ => return None,
    };
    let mut millis = [0u8; 8];
    millis.copy_from_slice(&data[2..]);
    Some((role, u64::from_be_bytes(millis)))
}

/// The reply to send back for an echo request
///
/// Keeps the sender timestamp so the requester can compute the round trip.
/// Echoes of unexpected shape are bounced unchanged.
pub fn turn_around(data: &[u8]) -> Vec<u8> {
    match decode_echo(data) {
        Some((EchoRole::Request, millis)) => encode_echo(EchoRole::Reply, millis).to_vec(),
        _ => data.to_vec(),
    }
}

// ============================================================================
// Checker
// ============================================================================

/// What the checker needs from the link it watches
pub trait CheckerLink: Send + Sync {
    /// Send an echo over the data channel
    fn send_echo(&self, data: &[u8]);

    /// No packet arrived within the echo timeout on the link started as
    /// `link_generation`
    fn echo_timed_out(&self, link_generation: u64);
}

#[derive(Debug, Default)]
struct RunState {
    running: bool,
    /// Bumped on every start and stop; ticks of another run are no-ops
    generation: u64,
    /// Link the current run watches, as given to `start`
    link_generation: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct EchoStats {
    /// Smoothed round trip in milliseconds, `None` until the first reply
    pub average_rtt: Option<f64>,
    pub echos_received: u64,
    pub invalid_echos_received: u64,
}

/// Periodic echo sender and silence detector
pub struct ConnectivityChecker {
    label: String,
    interval: Duration,
    timeout: Duration,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    link: Weak<dyn CheckerLink>,
    run: Mutex<RunState>,
    last_packet_received: AtomicU64,
    stats: Mutex<EchoStats>,
}

impl ConnectivityChecker {
    pub fn new(
        label: String,
        interval: Duration,
        timeout: Duration,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
        link: Weak<dyn CheckerLink>,
    ) -> Self {
        Self {
            label,
            interval,
            timeout,
            scheduler,
            clock,
            link,
            run: Mutex::new(RunState::default()),
            last_packet_received: AtomicU64::new(0),
            stats: Mutex::new(EchoStats::default()),
        }
    }

    /// Start probing the link `link_generation`
    ///
    /// No-op if already running for that link. A run for another link is
    /// replaced.
    pub fn start(self: &Arc<Self>, link_generation: u64) {
        let mut run = lock(&self.run);
        if run.running && run.link_generation == link_generation {
            return;
        }
        run.running = true;
        run.generation += 1;
        run.link_generation = link_generation;
        let generation = run.generation;

        log::debug!("Starting connectivity checker for peer {}", self.label);
        *lock(&self.stats) = EchoStats::default();
        self.last_packet_received
            .store(self.clock.now_millis(), Ordering::SeqCst);

        self.schedule_tick(generation, Duration::ZERO);
    }

    /// Stop probing; pending ticks become no-ops
    pub fn stop(&self) {
        let mut run = lock(&self.run);
        if !run.running {
            return;
        }
        run.running = false;
        run.generation += 1;
        log::debug!("Stopped connectivity checker for peer {}", self.label);
    }

    pub fn is_running(&self) -> bool {
        lock(&self.run).running
    }

    /// Any datagram arrived on the link
    pub fn packet_received(&self) {
        self.last_packet_received
            .store(self.clock.now_millis(), Ordering::SeqCst);
    }

    /// An echo reply arrived; fold its round trip into the average
    pub fn echo_received(&self, data: &[u8]) {
        self.packet_received();

        let mut stats = lock(&self.stats);
        stats.echos_received += 1;

        let sent = match decode_echo(data) {
            Some((EchoRole::Reply, millis)) => millis,
            _ => {
                log::trace!("Received invalid echo, length: {}", data.len());
                stats.invalid_echos_received += 1;
                return;
            }
        };

        let rtt = self.clock.now_millis().saturating_sub(sent) as f64;
        stats.average_rtt = Some(match stats.average_rtt {
            Some(average) => average * RTT_SMOOTHING + rtt * (1.0 - RTT_SMOOTHING),
            None => rtt,
        });
    }

    pub fn average_rtt(&self) -> Option<f64> {
        lock(&self.stats).average_rtt
    }

    pub fn stats(&self) -> EchoStats {
        *lock(&self.stats)
    }

    /// Millisecond timestamp of the last inbound datagram
    pub fn last_packet_received(&self) -> u64 {
        self.last_packet_received.load(Ordering::SeqCst)
    }

    fn schedule_tick(self: &Arc<Self>, generation: u64, delay: Duration) {
        let checker = Arc::downgrade(self);
        self.scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(checker) = checker.upgrade() {
                    checker.tick(generation);
                }
            }),
        );
    }

    fn tick(self: &Arc<Self>, generation: u64) {
        {
            let mut run = lock(&self.run);
            if !run.running || run.generation != generation {
                return;
            }

            let silent_for = self
                .clock
                .now_millis()
                .saturating_sub(self.last_packet_received());
            if silent_for > self.timeout.as_millis() as u64 {
                log::warn!(
                    "Didn't receive any answer to echo requests for the past {} seconds from {}, aborting connection",
                    self.timeout.as_secs(),
                    self.label
                );
                run.running = false;
                run.generation += 1;
                let link_generation = run.link_generation;
                drop(run);

                let link = self.link.clone();
                self.scheduler.schedule(
                    Duration::ZERO,
                    Box::new(move || {
                        if let Some(link) = link.upgrade() {
                            link.echo_timed_out(link_generation);
                        }
                    }),
                );
                return;
            }
        }

        log::trace!("Running connectivity checker for {}", self.label);
        if let Some(link) = self.link.upgrade() {
            link.send_echo(&encode_echo(EchoRole::Request, self.clock.now_millis()));
        }

        self.schedule_tick(generation, self.interval);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ManualClock, ManualScheduler};

    #[derive(Default)]
    struct RecordingLink {
        sent: Mutex<Vec<Vec<u8>>>,
        timeouts: Mutex<Vec<u64>>,
    }

    impl CheckerLink for RecordingLink {
        fn send_echo(&self, data: &[u8]) {
            lock(&self.sent).push(data.to_vec());
        }

        fn echo_timed_out(&self, link_generation: u64) {
            lock(&self.timeouts).push(link_generation);
        }
    }

    fn setup() -> (Arc<ConnectivityChecker>, Arc<RecordingLink>, Arc<ManualScheduler>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let scheduler = Arc::new(ManualScheduler::new(Arc::clone(&clock)));
        let link = Arc::new(RecordingLink::default());
        let weak: Weak<dyn CheckerLink> = Arc::downgrade(&link) as Weak<dyn CheckerLink>;
        let checker = Arc::new(ConnectivityChecker::new(
            "bob(7)".to_string(),
            Duration::from_secs(1),
            Duration::from_secs(10),
            scheduler.clone(),
            clock,
            weak,
        ));
        (checker, link, scheduler)
    }

    #[test]
    fn test_echo_encoding() {
        let echo = encode_echo(EchoRole::Request, 0x0102_0304_0506_0708);
        assert_eq!(echo[0], b'e');
        assert_eq!(echo[1], 0);
        assert_eq!(&echo[2..], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(
            decode_echo(&echo),
            Some((EchoRole::Request, 0x0102_0304_0506_0708))
        );

        let reply = turn_around(&echo);
        assert_eq!(decode_echo(&reply), Some((EchoRole::Reply, 0x0102_0304_0506_0708)));
    }

    #[test]
    fn test_decode_echo_rejects_bad_shapes() {
        assert_eq!(decode_echo(b"e"), None);
        assert_eq!(decode_echo(&[b'e', 7, 0, 0, 0, 0, 0, 0, 0, 0]), None);
        assert_eq!(decode_echo(&[b'd', 0, 0, 0, 0, 0, 0, 0, 0, 0]), None);
    }

    #[test]
    fn test_sends_echo_every_interval() {
        let (checker, link, scheduler) = setup();
        checker.start(1);

        scheduler.advance(Duration::ZERO);
        assert_eq!(lock(&link.sent).len(), 1);

        scheduler.advance(Duration::from_secs(1));
        scheduler.advance(Duration::from_secs(1));
        assert_eq!(lock(&link.sent).len(), 3);

        let (role, _) = decode_echo(&lock(&link.sent)[0]).unwrap();
        assert_eq!(role, EchoRole::Request);
    }

    #[test]
    fn test_start_is_idempotent() {
        let (checker, link, scheduler) = setup();
        checker.start(1);
        checker.start(1);

        scheduler.advance(Duration::ZERO);
        assert_eq!(lock(&link.sent).len(), 1);
    }

    #[test]
    fn test_stop_cancels_ticks() {
        let (checker, link, scheduler) = setup();
        checker.start(1);
        scheduler.advance(Duration::ZERO);
        checker.stop();
        assert!(!checker.is_running());

        scheduler.advance(Duration::from_secs(30));
        assert_eq!(lock(&link.sent).len(), 1);
        assert!(lock(&link.timeouts).is_empty());
    }

    #[test]
    fn test_silence_reports_timeout_once() {
        let (checker, link, scheduler) = setup();
        checker.start(1);

        for _ in 0..12 {
            scheduler.advance(Duration::from_secs(1));
        }

        assert_eq!(*lock(&link.timeouts), vec![1]);
        assert!(!checker.is_running());

        scheduler.advance(Duration::from_secs(5));
        assert_eq!(*lock(&link.timeouts), vec![1]);
    }

    #[test]
    fn test_inbound_packets_keep_link_alive() {
        let (checker, link, scheduler) = setup();
        checker.start(1);

        for _ in 0..30 {
            scheduler.advance(Duration::from_secs(1));
            checker.packet_received();
        }

        assert!(lock(&link.timeouts).is_empty());
        assert!(checker.is_running());
    }

    #[test]
    fn test_average_rtt_smoothing() {
        let (checker, _link, scheduler) = setup();
        let now = scheduler.clock().now_millis();

        assert_eq!(checker.average_rtt(), None);

        checker.echo_received(&encode_echo(EchoRole::Reply, now - 100));
        assert_eq!(checker.average_rtt(), Some(100.0));

        checker.echo_received(&encode_echo(EchoRole::Reply, now - 200));
        assert!((checker.average_rtt().unwrap() - 120.0).abs() < 1e-9);

        checker.echo_received(b"e-garbage");
        let stats = checker.stats();
        assert_eq!(stats.echos_received, 3);
        assert_eq!(stats.invalid_echos_received, 1);
        assert!((stats.average_rtt.unwrap() - 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_rtt_sample_seeds_average() {
        let (checker, _link, scheduler) = setup();
        let now = scheduler.clock().now_millis();

        checker.echo_received(&encode_echo(EchoRole::Reply, now));
        assert_eq!(checker.average_rtt(), Some(0.0));

        // Smoothed against the zero seed, not re-seeded
        checker.echo_received(&encode_echo(EchoRole::Reply, now - 100));
        assert!((checker.average_rtt().unwrap() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_timeout_carries_link_generation() {
        let (checker, link, scheduler) = setup();
        checker.start(4);
        checker.start(4);
        scheduler.advance(Duration::ZERO);

        // A start for another link replaces the run
        checker.start(5);
        for _ in 0..12 {
            scheduler.advance(Duration::from_secs(1));
        }

        assert_eq!(*lock(&link.timeouts), vec![5]);
    }
}
