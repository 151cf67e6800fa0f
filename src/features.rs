//! Feature extraction for the statistical model.
//!
//! Each packet is summarized as a fixed 4-field numeric vector:
//! `[length, protocol, source port, destination port]`. Fields without a
//! meaningful value (no IP layer, portless transport) are 0, so the
//! extraction is pure and total.

use serde::{Deserialize, Serialize};

use crate::packet::PacketMeta;

/// Number of fields in a feature vector.
pub const FEATURE_DIM: usize = 4;

/// Fixed-size numeric summary of one packet. Immutable once extracted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector(pub [f64; FEATURE_DIM]);

impl FeatureVector {
    pub fn new(length: f64, protocol: f64, src_port: f64, dst_port: f64) -> Self {
        Self([length, protocol, src_port, dst_port])
    }

    pub fn from_packet(meta: &PacketMeta) -> Self {
        Self([
            meta.length as f64,
            meta.protocol as f64,
            meta.src_port as f64,
            meta.dst_port as f64,
        ])
    }

    pub fn length(&self) -> f64 {
        self.0[0]
    }

    pub fn protocol(&self) -> f64 {
        self.0[1]
    }

    pub fn src_port(&self) -> f64 {
        self.0[2]
    }

    pub fn dst_port(&self) -> f64 {
        self.0[3]
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
}
