//! Behavioral detection: sliding-window trackers for port scans, host
//! scans, and flood attacks.
//!
//! Flood detection keys on `(destination, protocol, destination port)` and
//! keeps a deque of recent packet timestamps, evicting entries older than
//! the flood window from the front on every insertion. Scan detection keeps
//! one tracker per source IP with two views of the same window: ports
//! targeted per destination host, and hosts targeted per destination port.
//!
//! Both arenas are LRU-bounded so a long-running session - or an adversary
//! cycling through spoofed sources - cannot grow tracker memory without
//! bound; the least recently active keys are evicted first.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::num::NonZeroUsize;

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use serde::Serialize;

use crate::config::DetectionSettings;
use crate::packet::PacketMeta;

/// A behavioral detection result. At most one finding is produced per
/// packet; flood takes precedence over the scan checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Finding {
    Flood {
        dst_ip: IpAddr,
        protocol: u8,
        dst_port: u16,
        threshold: usize,
        window_secs: u64,
    },
    PortScan {
        src_ip: IpAddr,
        dst_ip: IpAddr,
        threshold: usize,
        window_secs: u64,
    },
    HostScan {
        src_ip: IpAddr,
        dst_port: u16,
        threshold: usize,
        window_secs: u64,
    },
}

// Display carries the full operator-facing message; the structured fields
// stay available for JSON output.
impl std::fmt::Display for Finding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Flood {
                dst_ip,
                protocol,
                dst_port,
                threshold,
                window_secs,
            } => write!(
                f,
                "Flood attack (DoS): target {}, protocol {}, port {}: more than {} packets in {}s",
                dst_ip, protocol, dst_port, threshold, window_secs
            ),
            Self::PortScan {
                src_ip,
                dst_ip,
                threshold,
                window_secs,
            } => write!(
                f,
                "Port scan: {} probed {}+ ports on {} within {}s",
                src_ip, threshold, dst_ip, window_secs
            ),
            Self::HostScan {
                src_ip,
                dst_port,
                threshold,
                window_secs,
            } => write!(
                f,
                "Host scan: {} probed {}+ hosts on port {} within {}s",
                src_ip, threshold, dst_port, window_secs
            ),
        }
    }
}

/// Per-source-IP scan tracker. Created lazily on the first packet from a
/// new source; both maps are cleared together when the window expires.
struct ScanTracker {
    window_start: DateTime<Utc>,
    ports_targeted: HashMap<IpAddr, HashSet<u16>>,
    hosts_targeted: HashMap<u16, HashSet<IpAddr>>,
}

impl ScanTracker {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            window_start: now,
            ports_targeted: HashMap::new(),
            hosts_targeted: HashMap::new(),
        }
    }

    fn reset(&mut self, now: DateTime<Utc>) {
        self.window_start = now;
        self.ports_targeted.clear();
        self.hosts_targeted.clear();
    }
}

type FloodKey = (IpAddr, u8, u16);

/// Stateful behavioral analyzer. Mutated exclusively by the capture
/// thread; `reset` must be called at the start of every capture session so
/// windows never span sessions.
pub struct BehaviorAnalyzer {
    portscan_count: usize,
    portscan_window: Duration,
    hostscan_count: usize,
    hostscan_window: Duration,
    flood_count: usize,
    flood_window: Duration,
    scan_trackers: LruCache<IpAddr, ScanTracker>,
    flood_trackers: LruCache<FloodKey, VecDeque<DateTime<Utc>>>,
}

impl BehaviorAnalyzer {
    pub fn new(settings: &DetectionSettings) -> Self {
        let sources = NonZeroUsize::new(settings.max_tracked_sources.max(1)).unwrap();
        let targets = NonZeroUsize::new(settings.max_tracked_targets.max(1)).unwrap();
        Self {
            portscan_count: settings.portscan_count,
            portscan_window: Duration::seconds(settings.portscan_window_secs as i64),
            hostscan_count: settings.hostscan_count,
            hostscan_window: Duration::seconds(settings.hostscan_window_secs as i64),
            flood_count: settings.flood_count,
            flood_window: Duration::seconds(settings.flood_window_secs as i64),
            scan_trackers: LruCache::new(sources),
            flood_trackers: LruCache::new(targets),
        }
    }

    /// Clears all tracker state. Invoked at the start of every capture
    /// session.
    pub fn reset(&mut self) {
        self.scan_trackers.clear();
        self.flood_trackers.clear();
    }

    /// Runs flood detection, then scan detection, returning the first
    /// finding. Packets without an IP layer are ignored.
    pub fn process(&mut self, meta: &PacketMeta, now: DateTime<Utc>) -> Option<Finding> {
        let src_ip = meta.src_ip?;
        let dst_ip = meta.dst_ip?;

        if let Some(finding) = self.check_flood(dst_ip, meta.protocol, meta.dst_port, now) {
            return Some(finding);
        }
        self.check_scans(src_ip, dst_ip, meta.dst_port, now)
    }

    fn check_flood(
        &mut self,
        dst_ip: IpAddr,
        protocol: u8,
        dst_port: u16,
        now: DateTime<Utc>,
    ) -> Option<Finding> {
        let key = (dst_ip, protocol, dst_port);
        let timestamps = self
            .flood_trackers
            .get_or_insert_mut(key, VecDeque::new);

        timestamps.push_back(now);

        // Timestamps are monotonically non-decreasing, so a single forward
        // scan from the oldest end evicts everything outside the window.
        let cutoff = now - self.flood_window;
        while timestamps.front().is_some_and(|t| *t < cutoff) {
            timestamps.pop_front();
        }

        if timestamps.len() > self.flood_count {
            // Empty the tracker so the next alert requires a fresh burst
            // instead of firing on every subsequent packet.
            timestamps.clear();
            return Some(Finding::Flood {
                dst_ip,
                protocol,
                dst_port,
                threshold: self.flood_count,
                window_secs: self.flood_window.num_seconds() as u64,
            });
        }
        None
    }

    fn check_scans(
        &mut self,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        dst_port: u16,
        now: DateTime<Utc>,
    ) -> Option<Finding> {
        let tracker = self
            .scan_trackers
            .get_or_insert_mut(src_ip, || ScanTracker::new(now));

        // Both scan views share one window-reset timer per source.
        if now - tracker.window_start > self.portscan_window {
            tracker.reset(now);
        }

        if dst_port > 0 {
            tracker
                .ports_targeted
                .entry(dst_ip)
                .or_default()
                .insert(dst_port);
            tracker
                .hosts_targeted
                .entry(dst_port)
                .or_default()
                .insert(dst_ip);
        }

        for (target_ip, ports) in tracker.ports_targeted.iter_mut() {
            if ports.len() >= self.portscan_count {
                let target_ip = *target_ip;
                // Cleared so continued scanning re-alerts once the set
                // refills, rather than on every packet.
                ports.clear();
                return Some(Finding::PortScan {
                    src_ip,
                    dst_ip: target_ip,
                    threshold: self.portscan_count,
                    window_secs: self.portscan_window.num_seconds() as u64,
                });
            }
        }

        for (target_port, hosts) in tracker.hosts_targeted.iter_mut() {
            if hosts.len() >= self.hostscan_count {
                let target_port = *target_port;
                hosts.clear();
                return Some(Finding::HostScan {
                    src_ip,
                    dst_port: target_port,
                    threshold: self.hostscan_count,
                    window_secs: self.hostscan_window.num_seconds() as u64,
                });
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ProtocolKind;

    fn settings() -> DetectionSettings {
        DetectionSettings {
            portscan_count: 20,
            portscan_window_secs: 10,
            hostscan_count: 20,
            hostscan_window_secs: 10,
            flood_count: 500,
            flood_window_secs: 2,
            ..Default::default()
        }
    }

    fn udp_meta(src: &str, dst: &str, dst_port: u16) -> PacketMeta {
        let mut meta = PacketMeta::raw(64);
        meta.src_ip = Some(src.parse().unwrap());
        meta.dst_ip = Some(dst.parse().unwrap());
        meta.protocol = 17;
        meta.kind = ProtocolKind::Udp;
        meta.src_port = 40_000;
        meta.dst_port = dst_port;
        meta
    }

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_flood_fires_exactly_once_per_burst() {
        let mut analyzer = BehaviorAnalyzer::new(&settings());
        let meta = udp_meta("10.0.0.1", "10.0.0.9", 53);

        // 500 packets within the window: below threshold, no finding.
        for i in 0..500 {
            let ts = t0() + Duration::milliseconds(i * 2);
            assert_eq!(analyzer.process(&meta, ts), None, "packet {}", i);
        }

        // The 501st strictly exceeds the threshold.
        let finding = analyzer.process(&meta, t0() + Duration::milliseconds(1001));
        assert!(matches!(finding, Some(Finding::Flood { dst_port: 53, .. })));

        // Tracker was reset: the next packet starts a fresh burst.
        assert_eq!(
            analyzer.process(&meta, t0() + Duration::milliseconds(1002)),
            None
        );
    }

    #[test]
    fn test_flood_window_eviction() {
        let mut analyzer = BehaviorAnalyzer::new(&settings());
        let meta = udp_meta("10.0.0.1", "10.0.0.9", 53);

        // 400 packets, then a 3-second gap: the old timestamps fall out of
        // the 2-second window, so another 400 still stay below threshold.
        for i in 0..400 {
            analyzer.process(&meta, t0() + Duration::milliseconds(i));
        }
        let later = t0() + Duration::seconds(3);
        for i in 0..400 {
            assert_eq!(
                analyzer.process(&meta, later + Duration::milliseconds(i)),
                None
            );
        }
    }

    #[test]
    fn test_port_scan_fires_on_threshold_distinct_port() {
        let mut analyzer = BehaviorAnalyzer::new(&settings());

        for port in 1..20u16 {
            let meta = udp_meta("192.168.1.66", "10.0.0.9", port);
            assert_eq!(analyzer.process(&meta, t0()), None, "port {}", port);
        }

        let meta = udp_meta("192.168.1.66", "10.0.0.9", 20);
        let finding = analyzer.process(&meta, t0());
        assert_eq!(
            finding,
            Some(Finding::PortScan {
                src_ip: "192.168.1.66".parse().unwrap(),
                dst_ip: "10.0.0.9".parse().unwrap(),
                threshold: 20,
                window_secs: 10,
            })
        );
    }

    #[test]
    fn test_port_scan_realerts_only_after_set_refills() {
        let mut analyzer = BehaviorAnalyzer::new(&settings());

        for port in 1..=20u16 {
            analyzer.process(&udp_meta("192.168.1.66", "10.0.0.9", port), t0());
        }

        // The 21st new port lands in an emptied set: no finding until the
        // set reaches the threshold again.
        assert_eq!(
            analyzer.process(&udp_meta("192.168.1.66", "10.0.0.9", 21), t0()),
            None
        );
        for port in 22..40u16 {
            assert_eq!(
                analyzer.process(&udp_meta("192.168.1.66", "10.0.0.9", port), t0()),
                None
            );
        }
        let finding = analyzer.process(&udp_meta("192.168.1.66", "10.0.0.9", 40), t0());
        assert!(matches!(finding, Some(Finding::PortScan { .. })));
    }

    #[test]
    fn test_host_scan_fires_on_threshold_distinct_host() {
        let mut analyzer = BehaviorAnalyzer::new(&settings());

        for host in 1..20u8 {
            let meta = udp_meta("192.168.1.66", &format!("10.0.0.{}", host), 22);
            assert_eq!(analyzer.process(&meta, t0()), None);
        }

        let meta = udp_meta("192.168.1.66", "10.0.0.20", 22);
        let finding = analyzer.process(&meta, t0());
        assert_eq!(
            finding,
            Some(Finding::HostScan {
                src_ip: "192.168.1.66".parse().unwrap(),
                dst_port: 22,
                threshold: 20,
                window_secs: 10,
            })
        );
    }

    #[test]
    fn test_window_expiry_clears_both_maps() {
        let mut analyzer = BehaviorAnalyzer::new(&settings());

        // 19 distinct ports, just below threshold.
        for port in 1..20u16 {
            analyzer.process(&udp_meta("192.168.1.66", "10.0.0.9", port), t0());
        }

        // Past the window: the tracker resets fully, so 19 further ports
        // (one arriving with the reset) still produce no finding.
        let later = t0() + Duration::seconds(11);
        for port in 1..20u16 {
            assert_eq!(
                analyzer.process(&udp_meta("192.168.1.66", "10.0.0.9", port), later),
                None
            );
        }
        // The 20th distinct port within the new window fires.
        let finding = analyzer.process(&udp_meta("192.168.1.66", "10.0.0.9", 20), later);
        assert!(matches!(finding, Some(Finding::PortScan { .. })));
    }

    #[test]
    fn test_portless_packets_only_tick_the_window() {
        let mut analyzer = BehaviorAnalyzer::new(&settings());
        let mut meta = udp_meta("192.168.1.66", "10.0.0.9", 0);
        meta.protocol = 1;
        meta.kind = ProtocolKind::Icmp;

        for _ in 0..50 {
            assert_eq!(analyzer.process(&meta, t0()), None);
        }
    }

    #[test]
    fn test_non_ip_packets_are_ignored() {
        let mut analyzer = BehaviorAnalyzer::new(&settings());
        let meta = PacketMeta::raw(42);
        assert_eq!(analyzer.process(&meta, t0()), None);
    }

    #[test]
    fn test_flood_takes_precedence_over_scan() {
        let mut s = settings();
        s.flood_count = 3;
        s.portscan_count = 2;
        let mut analyzer = BehaviorAnalyzer::new(&s);

        // Alternate between two ports. Each completed pair trips the port
        // scan; the fourth visit to a port pushes its flood key past the
        // threshold. Packets 7 and 8 report floods, and because flood is
        // checked first those packets never reach the scan view at all.
        let findings: Vec<_> = [1u16, 2, 1, 2, 1, 2, 1, 2]
            .iter()
            .enumerate()
            .map(|(i, port)| {
                analyzer.process(
                    &udp_meta("10.0.0.1", "10.0.0.9", *port),
                    t0() + Duration::milliseconds(i as i64),
                )
            })
            .collect();

        assert!(matches!(findings[1], Some(Finding::PortScan { .. })));
        assert!(matches!(findings[3], Some(Finding::PortScan { .. })));
        assert!(matches!(findings[5], Some(Finding::PortScan { .. })));
        assert!(matches!(
            findings[6],
            Some(Finding::Flood { dst_port: 1, .. })
        ));
        assert!(matches!(
            findings[7],
            Some(Finding::Flood { dst_port: 2, .. })
        ));
    }

    #[test]
    fn test_reset_clears_all_state() {
        let mut analyzer = BehaviorAnalyzer::new(&settings());
        for port in 1..20u16 {
            analyzer.process(&udp_meta("192.168.1.66", "10.0.0.9", port), t0());
        }
        analyzer.reset();

        // Post-reset the count starts over.
        let finding = analyzer.process(&udp_meta("192.168.1.66", "10.0.0.9", 20), t0());
        assert_eq!(finding, None);
    }

    #[test]
    fn test_tracker_arena_is_bounded() {
        let mut s = settings();
        s.max_tracked_sources = 100;
        let mut analyzer = BehaviorAnalyzer::new(&s);

        // Far more sources than the arena admits; memory stays bounded by
        // evicting the least recently active trackers.
        for i in 0..10_000u32 {
            let src = format!("10.{}.{}.{}", (i >> 16) & 0xff, (i >> 8) & 0xff, i & 0xff);
            analyzer.process(&udp_meta(&src, "10.0.0.9", 80), t0());
        }
        assert!(analyzer.scan_trackers.len() <= 100);
    }
}
