//! Detection pipeline - merges the three analysis layers into one verdict
//! per packet.
//!
//! For every captured frame: extract features, consult the statistical
//! model (`None` while it is still training), run the behavioral trackers,
//! apply the rule-based protocol-error checks, and resolve a single
//! severity tag. A behavioral or rule finding always yields `danger`; a
//! statistical outlier alone yields `anomaly`; statistics can never
//! downgrade a packet once a rule or behavioral finding fired.
//!
//! The optional target-IP allow-list is applied at emission time only:
//! filtered-out packets still feed the model and the trackers so the
//! background state stays warm, they are just never surfaced.
//!
//! The pipeline owns all mutable detection state and is driven by exactly
//! one thread per session; no locking is needed under that single-writer
//! discipline.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::Ordering;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::behavior::BehaviorAnalyzer;
use crate::config::Config;
use crate::features::FeatureVector;
use crate::model::{AnomalyDetector, Verdict};
use crate::packet::{PacketMeta, ProtocolKind};
use crate::stats::SharedStats;

/// Final classification of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Normal,
    Anomaly,
    Danger,
}

impl Severity {
    /// Fixed-width console label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Anomaly => "ANOMALY",
            Self::Danger => "DANGER",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Anomaly => write!(f, "anomaly"),
            Self::Danger => write!(f, "danger"),
        }
    }
}

/// One fully classified packet, created once by the pipeline and immutable
/// thereafter. Emitted to the consumer in capture order.
#[derive(Debug, Clone, Serialize)]
pub struct ClassifiedPacket {
    pub sequence_id: u64,
    pub timestamp: DateTime<Utc>,
    pub summary: String,
    pub packet: PacketMeta,
    pub features: FeatureVector,
    /// `None` for packets seen while the statistical model was training.
    pub verdict: Option<Verdict>,
    pub severity: Severity,
    pub rule_finding: Option<String>,
    pub behavior_finding: Option<String>,
}

/// Session-scoped orchestrator owning the model, the behavioral trackers,
/// and the emission filter.
pub struct DetectionPipeline {
    model: AnomalyDetector,
    behavior: BehaviorAnalyzer,
    targets: HashSet<IpAddr>,
    stats: SharedStats,
    next_seq: u64,
}

impl DetectionPipeline {
    pub fn new(config: &Config, targets: HashSet<IpAddr>, stats: SharedStats) -> Self {
        Self {
            model: AnomalyDetector::new(config.detection.training_packets),
            behavior: BehaviorAnalyzer::new(&config.detection),
            targets,
            stats,
            next_seq: 0,
        }
    }

    pub fn model(&self) -> &AnomalyDetector {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut AnomalyDetector {
        &mut self.model
    }

    /// Regenerates the explanation for a feature vector on request.
    pub fn explain(&self, features: &FeatureVector) -> String {
        self.model.explain(features)
    }

    /// Clears per-session tracker state. Must be called when a new capture
    /// session starts so sliding windows never span sessions.
    pub fn start_session(&mut self) {
        self.behavior.reset();
        self.next_seq = 0;
    }

    /// Classifies one raw frame. Returns `None` when the packet was dropped
    /// by the target-IP filter; detection state is updated either way.
    pub fn process(&mut self, data: &[u8], timestamp: DateTime<Utc>) -> Option<ClassifiedPacket> {
        let packet = PacketMeta::parse(data);
        if packet.kind == ProtocolKind::Other && packet.src_ip.is_none() && packet.arp.is_none() {
            self.stats.malformed.fetch_add(1, Ordering::Relaxed);
        }

        let features = FeatureVector::from_packet(&packet);

        let verdict = self.model.observe_or_classify(features);
        if verdict.is_none() {
            self.stats.training_observed.fetch_add(1, Ordering::Relaxed);
        }
        if self.model.take_just_trained() {
            info!("statistical model finished training; classifying from next packet");
            self.stats.signal_training_complete();
        }

        if verdict == Some(Verdict::Outlier) {
            tracing::debug!("outlier explanation: {}", self.model.explain(&features));
        }

        let behavior_finding = self
            .behavior
            .process(&packet, timestamp)
            .map(|f| f.to_string());
        let rule_finding = rule_check(&packet);

        let severity = if behavior_finding.is_some() || rule_finding.is_some() {
            Severity::Danger
        } else if verdict == Some(Verdict::Outlier) {
            Severity::Anomaly
        } else {
            Severity::Normal
        };
        self.stats.record(severity);

        // Allow-list filter: applied after all detectors ran, so their
        // windows and the training buffer saw this packet regardless.
        if !self.targets.is_empty() && !self.involves_target(&packet) {
            self.stats.filtered_out.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let sequence_id = self.next_seq;
        self.next_seq += 1;

        Some(ClassifiedPacket {
            sequence_id,
            timestamp,
            summary: packet.summary(),
            features,
            verdict,
            severity,
            rule_finding,
            behavior_finding,
            packet,
        })
    }

    /// Whether either endpoint is in the configured target set. ARP packets
    /// are matched on their sender/target protocol addresses.
    fn involves_target(&self, packet: &PacketMeta) -> bool {
        let (src, dst) = match (&packet.arp, packet.src_ip, packet.dst_ip) {
            (Some(arp), _, _) => (
                Some(IpAddr::from(arp.sender_ip)),
                Some(IpAddr::from(arp.target_ip)),
            ),
            (None, src, dst) => (src, dst),
        };
        src.is_some_and(|ip| self.targets.contains(&ip))
            || dst.is_some_and(|ip| self.targets.contains(&ip))
    }
}

/// Rule-based protocol-error checks: TCP RST plus the ICMP error types
/// that signal delivery problems (unreachable, time exceeded, redirect).
fn rule_check(packet: &PacketMeta) -> Option<String> {
    if let Some(tcp) = &packet.tcp {
        if tcp.rst {
            return Some("TCP reset (RST): connection refused or aborted".to_string());
        }
        return None;
    }

    if let Some(icmp) = &packet.icmp {
        return match icmp.icmp_type {
            3 => Some("ICMP destination unreachable".to_string()),
            11 => Some("ICMP time exceeded".to_string()),
            5 => Some("ICMP redirect".to_string()),
            _ => None,
        };
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::test_support::*;
    use crate::stats::SessionStats;
    use chrono::Duration;
    use std::net::Ipv4Addr;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn pipeline_with_training(training_packets: usize) -> DetectionPipeline {
        let mut config = Config::default();
        config.detection.training_packets = training_packets;
        DetectionPipeline::new(&config, HashSet::new(), SessionStats::new())
    }

    /// A "normal traffic" frame: TCP, length about 100, ports 80/443.
    fn normal_frame(i: usize) -> Vec<u8> {
        let port = if i % 2 == 0 { 80 } else { 443 };
        tcp_frame(
            ip("192.168.1.5"),
            ip("10.0.0.2"),
            port,
            port,
            0x10,
            46 + (i % 21), // frame length 100 +/- 10
        )
    }

    #[test]
    fn test_no_verdict_during_training() {
        let mut pipeline = pipeline_with_training(50);
        for i in 0..50 {
            let cp = pipeline.process(&normal_frame(i), t0()).unwrap();
            assert_eq!(cp.verdict, None);
            assert_eq!(cp.severity, Severity::Normal);
        }
        assert!(pipeline.model().is_trained());

        let cp = pipeline.process(&normal_frame(3), t0()).unwrap();
        assert!(cp.verdict.is_some());
    }

    #[test]
    fn test_sequence_ids_are_contiguous() {
        let mut pipeline = pipeline_with_training(1000);
        for expected in 0..10u64 {
            let cp = pipeline.process(&normal_frame(0), t0()).unwrap();
            assert_eq!(cp.sequence_id, expected);
        }
    }

    #[test]
    fn test_rule_finding_forces_danger_over_normal_verdict() {
        let mut pipeline = pipeline_with_training(50);
        for i in 0..50 {
            pipeline.process(&normal_frame(i), t0());
        }

        // In-distribution TCP RST: statistical verdict is Normal, severity
        // must still be danger.
        let rst = tcp_frame(ip("192.168.1.5"), ip("10.0.0.2"), 80, 80, 0x04, 50);
        let cp = pipeline.process(&rst, t0()).unwrap();
        assert_eq!(cp.verdict, Some(Verdict::Normal));
        assert!(cp.rule_finding.as_deref().unwrap().contains("RST"));
        assert_eq!(cp.severity, Severity::Danger);
    }

    #[test]
    fn test_icmp_error_types_are_rule_findings() {
        let mut pipeline = pipeline_with_training(1000);

        for (icmp_type, needle) in [(3u8, "unreachable"), (11, "time exceeded"), (5, "redirect")] {
            let frame = icmp_frame(ip("10.0.0.1"), ip("10.0.0.2"), icmp_type, 0);
            let cp = pipeline.process(&frame, t0()).unwrap();
            assert!(
                cp.rule_finding.as_deref().unwrap().contains(needle),
                "type {}",
                icmp_type
            );
            assert_eq!(cp.severity, Severity::Danger);
        }

        // Echo request is not an error.
        let echo = icmp_frame(ip("10.0.0.1"), ip("10.0.0.2"), 8, 0);
        let cp = pipeline.process(&echo, t0()).unwrap();
        assert_eq!(cp.rule_finding, None);
        assert_eq!(cp.severity, Severity::Normal);
    }

    #[test]
    fn test_behavior_finding_forces_danger() {
        let mut pipeline = pipeline_with_training(100_000); // stays untrained

        let mut last = None;
        for port in 1..=20u16 {
            let frame = udp_frame(ip("192.168.1.66"), ip("10.0.0.9"), 40_000, port, 8);
            last = pipeline.process(&frame, t0());
        }
        let cp = last.unwrap();
        assert!(cp.behavior_finding.as_deref().unwrap().contains("Port scan"));
        assert_eq!(cp.severity, Severity::Danger);
        // The model had no say: still training.
        assert_eq!(cp.verdict, None);
    }

    #[test]
    fn test_target_filter_drops_but_keeps_trackers_warm() {
        let mut config = Config::default();
        config.detection.training_packets = 100_000;
        config.detection.flood_count = 50;
        let targets: HashSet<IpAddr> = ["172.16.0.1".parse().unwrap()].into();
        let stats = SessionStats::new();
        let mut pipeline = DetectionPipeline::new(&config, targets, stats.clone());

        // 50 packets between non-target hosts: all dropped at emission.
        let frame = udp_frame(ip("10.0.0.1"), ip("10.0.0.9"), 40_000, 53, 8);
        for i in 0..50 {
            assert!(pipeline
                .process(&frame, t0() + Duration::milliseconds(i))
                .is_none());
        }
        assert_eq!(stats.filtered_out.load(Ordering::Relaxed), 50);

        // The 51st packet comes from a targeted source to the same flood
        // key. The tracker kept counting while packets were filtered, so
        // the flood fires now.
        let from_target = udp_frame(ip("172.16.0.1"), ip("10.0.0.9"), 40_000, 53, 8);
        let cp = pipeline
            .process(&from_target, t0() + Duration::milliseconds(51))
            .unwrap();
        assert!(cp.behavior_finding.as_deref().unwrap().contains("Flood"));
        assert_eq!(cp.severity, Severity::Danger);
    }

    #[test]
    fn test_arp_packets_match_filter_on_arp_addresses() {
        let mut config = Config::default();
        config.detection.training_packets = 100_000;
        let targets: HashSet<IpAddr> = ["192.168.1.7".parse().unwrap()].into();
        let mut pipeline = DetectionPipeline::new(&config, targets, SessionStats::new());

        let matching = arp_frame(1, ip("192.168.1.7"), ip("192.168.1.1"));
        assert!(pipeline.process(&matching, t0()).is_some());

        let other = arp_frame(1, ip("192.168.1.8"), ip("192.168.1.1"));
        assert!(pipeline.process(&other, t0()).is_none());
    }

    #[test]
    fn test_training_complete_signal_fires_once() {
        let mut config = Config::default();
        config.detection.training_packets = 10;
        let stats = SessionStats::new();
        let mut pipeline = DetectionPipeline::new(&config, HashSet::new(), stats.clone());

        for i in 0..10 {
            pipeline.process(&normal_frame(i), t0());
        }
        assert!(stats.take_training_complete());
        assert!(!stats.take_training_complete());
    }

    #[test]
    fn test_session_reset_clears_behavior_windows() {
        let mut pipeline = pipeline_with_training(100_000);

        for port in 1..20u16 {
            let frame = udp_frame(ip("192.168.1.66"), ip("10.0.0.9"), 40_000, port, 8);
            pipeline.process(&frame, t0());
        }
        pipeline.start_session();

        // Post-reset, the 20th distinct port is just the first of a new
        // window.
        let frame = udp_frame(ip("192.168.1.66"), ip("10.0.0.9"), 40_000, 20, 8);
        let cp = pipeline.process(&frame, t0()).unwrap();
        assert_eq!(cp.behavior_finding, None);
        assert_eq!(cp.sequence_id, 0);
    }

    /// The end-to-end scenario: 1000 normal packets train the model, then a
    /// wildly different packet must come back as a statistical anomaly with
    /// a usable explanation.
    #[test]
    fn test_end_to_end_outlier_after_training() {
        let mut pipeline = pipeline_with_training(1000);

        for i in 0..1000 {
            let cp = pipeline.process(&normal_frame(i), t0()).unwrap();
            assert_eq!(cp.verdict, None);
        }
        assert!(pipeline.model().is_trained());

        // GRE packet, 9000 bytes, port 31337 in the features via the raw
        // payload: build an oversized IPv4 frame with protocol 47.
        let outlier_frame = ipv4_frame(47, ip("203.0.113.5"), ip("10.0.0.2"), &[0u8; 8966]);
        let cp = pipeline.process(&outlier_frame, t0()).unwrap();
        assert_eq!(cp.verdict, Some(Verdict::Outlier));
        assert_eq!(cp.severity, Severity::Anomaly);

        let explanation = pipeline.explain(&cp.features);
        assert!(explanation.contains("Unusually large packet"));
        assert!(explanation.contains("Uncommon transport protocol"));
    }
}
