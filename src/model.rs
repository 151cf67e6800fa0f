//! Statistical anomaly model lifecycle.
//!
//! [`AnomalyDetector`] is a two-state machine. While `Untrained` it buffers
//! feature vectors; once the configured number has been observed it fits the
//! outlier model, computes explanatory statistics from the full buffer, and
//! switches to `Trained`, classifying every subsequent packet. Packets seen
//! during the training phase are never classified, not even retroactively.
//!
//! A trained model persists as two artifacts: an opaque model blob (bincode)
//! and a JSON statistics document, mirroring each other's lifetime. Loading
//! succeeds only if both parse; anything else counts as absence and forces
//! retraining.

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Distribution};
use tracing::{info, warn};

use crate::error::ModelError;
use crate::features::{FeatureVector, FEATURE_DIM};
use crate::forest::{IsolationForest, OutlierModel};

/// Maximum number of common ports kept in the statistics document.
pub const MAX_COMMON_PORTS: usize = 50;

/// Classification of a single packet by the trained model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Normal,
    Outlier,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Outlier => write!(f, "outlier"),
        }
    }
}

/// Per-feature statistics computed once at training time, used to produce
/// human-readable explanations for flagged packets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplanatoryStats {
    pub mean: [f64; FEATURE_DIM],
    pub std: [f64; FEATURE_DIM],
    /// The most frequent nonzero ports seen in training, both source and
    /// destination columns, capped at [`MAX_COMMON_PORTS`].
    pub common_ports: BTreeSet<u16>,
}

impl ExplanatoryStats {
    /// Computes mean/std per feature and the common-port set from the full
    /// training buffer. Port ranking is by descending frequency, ties broken
    /// by ascending port number, so the truncation is deterministic.
    fn from_buffer(buffer: &[FeatureVector]) -> Self {
        let mut mean = [0.0; FEATURE_DIM];
        let mut std = [0.0; FEATURE_DIM];

        for i in 0..FEATURE_DIM {
            let column: Vec<f64> = buffer.iter().map(|f| f.0[i]).collect();
            let data = Data::new(column);
            mean[i] = data.mean().unwrap_or(0.0);
            std[i] = data.std_dev().unwrap_or(0.0);
        }

        let mut counts: HashMap<u16, u32> = HashMap::new();
        for f in buffer {
            for port in [f.src_port(), f.dst_port()] {
                if port > 0.0 && port <= u16::MAX as f64 {
                    *counts.entry(port as u16).or_insert(0) += 1;
                }
            }
        }
        let mut ranked: Vec<(u16, u32)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let common_ports = ranked
            .into_iter()
            .take(MAX_COMMON_PORTS)
            .map(|(port, _)| port)
            .collect();

        Self {
            mean,
            std,
            common_ports,
        }
    }
}

/// Online-trained statistical outlier detector for packet feature vectors.
pub struct AnomalyDetector {
    training_target: usize,
    buffer: Vec<FeatureVector>,
    forest: IsolationForest,
    stats: Option<ExplanatoryStats>,
    trained: bool,
    just_trained: bool,
}

impl AnomalyDetector {
    pub fn new(training_packets: usize) -> Self {
        Self {
            training_target: training_packets.max(1),
            buffer: Vec::new(),
            forest: IsolationForest::default(),
            stats: None,
            trained: false,
            just_trained: false,
        }
    }

    pub fn is_trained(&self) -> bool {
        self.trained
    }

    /// Packets buffered so far and the training target.
    pub fn training_progress(&self) -> (usize, usize) {
        (self.buffer.len(), self.training_target)
    }

    pub fn stats(&self) -> Option<&ExplanatoryStats> {
        self.stats.as_ref()
    }

    /// One-shot flag set when training just completed, consumed by the
    /// caller to notify the presentation side exactly once.
    pub fn take_just_trained(&mut self) -> bool {
        std::mem::take(&mut self.just_trained)
    }

    /// While untrained, buffers the vector and returns `None`; training is
    /// triggered when the buffer reaches the configured target. Once
    /// trained, classifies the vector.
    ///
    /// A fit failure is recovered locally: the buffer is discarded and
    /// training restarts from empty.
    pub fn observe_or_classify(&mut self, features: FeatureVector) -> Option<Verdict> {
        if !self.trained {
            self.buffer.push(features);
            if self.buffer.len() >= self.training_target {
                if let Err(e) = self.fit() {
                    warn!("model fit failed, restarting training: {}", e);
                    self.buffer.clear();
                }
            }
            return None;
        }

        if self.forest.is_outlier(&features) {
            Some(Verdict::Outlier)
        } else {
            Some(Verdict::Normal)
        }
    }

    /// Fits the outlier model and the explanatory statistics on the entire
    /// buffer, then clears it. The buffer is never retained after training.
    fn fit(&mut self) -> Result<(), ModelError> {
        info!("fitting statistical model on {} packets", self.buffer.len());
        self.forest.fit(&self.buffer)?;
        self.stats = Some(ExplanatoryStats::from_buffer(&self.buffer));
        self.trained = true;
        self.just_trained = true;
        self.buffer.clear();
        self.buffer.shrink_to_fit();
        info!(
            "statistical model trained (decision boundary {:.3})",
            self.forest.threshold()
        );
        Ok(())
    }

    /// Explains why a feature vector looks anomalous against the training
    /// statistics. Every applicable reason is reported, in fixed order.
    /// Pure with respect to the stats, so repeated calls are identical.
    pub fn explain(&self, features: &FeatureVector) -> String {
        let stats = match &self.stats {
            Some(s) => s,
            None => return "No training statistics available.".to_string(),
        };

        let mut reasons = Vec::new();
        let length = features.length();
        let mean_len = stats.mean[0];
        let std_len = stats.std[0];

        if length > mean_len + 3.0 * std_len {
            reasons.push(format!(
                "Unusually large packet (len {:.0}, trained mean {:.0})",
                length, mean_len
            ));
        }
        if length > 0.0 && length < mean_len - 3.0 * std_len {
            reasons.push(format!(
                "Unusually small packet (len {:.0}, trained mean {:.0})",
                length, mean_len
            ));
        }

        let proto = features.protocol() as u8;
        if proto != 0 && !matches!(proto, 6 | 17 | 1) {
            reasons.push(format!("Uncommon transport protocol (proto {})", proto));
        }

        let src_port = features.src_port() as u16;
        if src_port > 0 && !stats.common_ports.contains(&src_port) {
            reasons.push(format!("Rare source port ({})", src_port));
        }
        let dst_port = features.dst_port() as u16;
        if dst_port > 0 && !stats.common_ports.contains(&dst_port) {
            reasons.push(format!("Rare destination port ({})", dst_port));
        }

        if reasons.is_empty() {
            return "Anomalous due to a subtle combination of features.".to_string();
        }
        reasons.join(" | ")
    }

    /// Persists the trained model and its statistics as two artifacts.
    /// A no-op when untrained; a write failure is reported but leaves the
    /// in-memory model fully usable.
    pub fn save_if_trained(&self, model_path: &Path, stats_path: &Path) -> Result<(), ModelError> {
        if !self.trained {
            return Ok(());
        }

        let file = File::create(model_path)?;
        let mut writer = BufWriter::new(file);
        bincode::serde::encode_into_std_write(
            &self.forest,
            &mut writer,
            bincode::config::standard(),
        )?;

        let stats_file = File::create(stats_path)?;
        serde_json::to_writer_pretty(BufWriter::new(stats_file), &self.stats)?;

        info!(
            "saved model to {} and statistics to {}",
            model_path.display(),
            stats_path.display()
        );
        Ok(())
    }

    /// Restores a previously saved model. Returns `true` on success. On any
    /// failure the detector stays `Untrained` and the artifacts are removed
    /// so the next session does not trip over them again.
    pub fn load(&mut self, model_path: &Path, stats_path: &Path) -> bool {
        if !model_path.exists() || !stats_path.exists() {
            return false;
        }

        match Self::read_artifacts(model_path, stats_path) {
            Ok((forest, stats)) if forest.is_fitted() && stats.is_some() => {
                self.forest = forest;
                self.stats = stats;
                self.trained = true;
                self.buffer.clear();
                info!("loaded trained model from {}", model_path.display());
                true
            }
            Ok(_) => {
                warn!("persisted model artifacts are incomplete; retraining");
                Self::clear_persisted(model_path, stats_path);
                false
            }
            Err(e) => {
                warn!("failed to load persisted model ({}); retraining", e);
                Self::clear_persisted(model_path, stats_path);
                false
            }
        }
    }

    fn read_artifacts(
        model_path: &Path,
        stats_path: &Path,
    ) -> Result<(IsolationForest, Option<ExplanatoryStats>), ModelError> {
        let file = File::open(model_path)?;
        let mut reader = BufReader::new(file);
        let forest: IsolationForest =
            bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())?;

        let stats_file = File::open(stats_path)?;
        let stats: Option<ExplanatoryStats> =
            serde_json::from_reader(BufReader::new(stats_file))?;

        Ok((forest, stats))
    }

    /// Deletes both persisted artifacts; missing files are not an error.
    pub fn clear_persisted(model_path: &Path, stats_path: &Path) {
        for path in [model_path, stats_path] {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove {}: {}", path.display(), e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn normal_vec(i: usize) -> FeatureVector {
        let length = 90.0 + (i % 21) as f64;
        let port = if i % 2 == 0 { 80.0 } else { 443.0 };
        FeatureVector::new(length, 6.0, port, port)
    }

    fn trained_detector(n: usize) -> AnomalyDetector {
        let mut detector = AnomalyDetector::new(n);
        for i in 0..n {
            detector.observe_or_classify(normal_vec(i));
        }
        assert!(detector.is_trained());
        detector
    }

    fn temp_paths(tag: &str) -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir();
        (
            dir.join(format!("netsentry_test_{}_{}.bin", tag, std::process::id())),
            dir.join(format!("netsentry_test_{}_{}.json", tag, std::process::id())),
        )
    }

    #[test]
    fn test_training_phase_returns_none_and_buffers() {
        let mut detector = AnomalyDetector::new(100);
        for i in 0..99 {
            assert_eq!(detector.observe_or_classify(normal_vec(i)), None);
            assert_eq!(detector.training_progress().0, i + 1);
            assert!(!detector.is_trained());
        }

        // The packet that fills the buffer triggers the fit but still gets
        // no verdict.
        assert_eq!(detector.observe_or_classify(normal_vec(99)), None);
        assert!(detector.is_trained());
        assert_eq!(detector.training_progress().0, 0);
    }

    #[test]
    fn test_just_trained_flag_is_one_shot() {
        let mut detector = trained_detector(100);
        assert!(detector.take_just_trained());
        assert!(!detector.take_just_trained());
    }

    #[test]
    fn test_classifies_after_training() {
        let mut detector = trained_detector(1000);

        let outlier = FeatureVector::new(9000.0, 47.0, 31_337.0, 31_337.0);
        assert_eq!(detector.observe_or_classify(outlier), Some(Verdict::Outlier));

        let inlier = normal_vec(3);
        assert_eq!(detector.observe_or_classify(inlier), Some(Verdict::Normal));
    }

    #[test]
    fn test_common_ports_ranked_by_frequency() {
        // 60 distinct rare ports plus two dominant ones; the dominant ports
        // must survive the truncation to MAX_COMMON_PORTS.
        let mut buffer = Vec::new();
        for i in 0..500 {
            buffer.push(FeatureVector::new(100.0, 6.0, 80.0, 443.0));
            buffer.push(FeatureVector::new(
                100.0,
                6.0,
                (10_000 + (i % 60)) as f64,
                80.0,
            ));
        }
        let stats = ExplanatoryStats::from_buffer(&buffer);
        assert!(stats.common_ports.len() <= MAX_COMMON_PORTS);
        assert!(stats.common_ports.contains(&80));
        assert!(stats.common_ports.contains(&443));
    }

    #[test]
    fn test_explain_reports_all_applicable_reasons_in_order() {
        let detector = trained_detector(1000);
        let outlier = FeatureVector::new(9000.0, 47.0, 31_337.0, 31_337.0);
        let explanation = detector.explain(&outlier);

        let large = explanation.find("Unusually large packet").unwrap();
        let proto = explanation.find("Uncommon transport protocol").unwrap();
        let sport = explanation.find("Rare source port").unwrap();
        let dport = explanation.find("Rare destination port").unwrap();
        assert!(large < proto && proto < sport && sport < dport);
    }

    #[test]
    fn test_explain_is_idempotent() {
        let detector = trained_detector(500);
        let features = FeatureVector::new(9000.0, 47.0, 31_337.0, 31_337.0);
        assert_eq!(detector.explain(&features), detector.explain(&features));
    }

    #[test]
    fn test_explain_without_stats() {
        let detector = AnomalyDetector::new(100);
        let features = FeatureVector::new(100.0, 6.0, 80.0, 80.0);
        assert_eq!(
            detector.explain(&features),
            "No training statistics available."
        );
    }

    #[test]
    fn test_explain_subtle_combination_fallback() {
        let detector = trained_detector(1000);
        // In-distribution on every individual feature.
        let features = FeatureVector::new(100.0, 6.0, 80.0, 443.0);
        assert_eq!(
            detector.explain(&features),
            "Anomalous due to a subtle combination of features."
        );
    }

    #[test]
    fn test_save_load_round_trip() {
        let (model_path, stats_path) = temp_paths("roundtrip");
        let detector = trained_detector(1000);
        detector.save_if_trained(&model_path, &stats_path).unwrap();

        let mut restored = AnomalyDetector::new(1000);
        assert!(restored.load(&model_path, &stats_path));
        assert!(restored.is_trained());

        // Same verdict for a fixed sample, bit-identical statistics.
        let probe = FeatureVector::new(9000.0, 47.0, 31_337.0, 31_337.0);
        assert_eq!(
            restored.observe_or_classify(probe),
            Some(Verdict::Outlier)
        );
        assert_eq!(restored.stats(), detector.stats());

        AnomalyDetector::clear_persisted(&model_path, &stats_path);
    }

    #[test]
    fn test_load_missing_artifacts_forces_retrain() {
        let (model_path, stats_path) = temp_paths("missing");
        let mut detector = AnomalyDetector::new(100);
        assert!(!detector.load(&model_path, &stats_path));
        assert!(!detector.is_trained());
    }

    #[test]
    fn test_load_corrupt_artifact_is_treated_as_absence() {
        let (model_path, stats_path) = temp_paths("corrupt");
        std::fs::write(&model_path, b"not a model").unwrap();
        std::fs::write(&stats_path, b"{ not json").unwrap();

        let mut detector = AnomalyDetector::new(100);
        assert!(!detector.load(&model_path, &stats_path));
        assert!(!detector.is_trained());
        // The broken artifacts were cleaned up.
        assert!(!model_path.exists());
        assert!(!stats_path.exists());
    }

    #[test]
    fn test_save_untrained_is_a_noop() {
        let (model_path, stats_path) = temp_paths("untrained");
        let detector = AnomalyDetector::new(100);
        detector.save_if_trained(&model_path, &stats_path).unwrap();
        assert!(!model_path.exists());
        assert!(!stats_path.exists());
    }
}
