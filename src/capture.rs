//! Packet capture - the producer side of the pipeline.
//!
//! A dedicated OS thread owns the pcap handle and the entire
//! [`DetectionPipeline`]; every packet is fully classified (including a
//! potential training-buffer append or model fit) before the next one is
//! read. Classified packets flow to the consumer over an unbounded ordered
//! channel, so classification order always equals capture order and nothing
//! is dropped between the two sides.
//!
//! Shutdown is cooperative: the loop polls a shared flag after each packet,
//! with the pcap read timeout bounding how long a quiet interface can delay
//! the check.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use pcap::{Active, Capture, Device};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::config::CaptureSettings;
use crate::error::{CaptureError, Result};
use crate::pipeline::{ClassifiedPacket, DetectionPipeline};

/// Outcome of a capture session, returned through the thread handle so the
/// caller gets the pipeline (and its trained model) back.
pub type SessionResult = (DetectionPipeline, std::result::Result<(), CaptureError>);

/// The packet capture producer. Opens the device up front so permission
/// problems surface synchronously, then runs the capture loop on its own
/// thread.
pub struct PacketCapture {
    settings: CaptureSettings,
    shutdown: Arc<AtomicBool>,
}

impl PacketCapture {
    pub fn new(settings: CaptureSettings) -> Self {
        Self {
            settings,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Opens the configured device and starts the capture/classification
    /// thread. The pipeline is moved into the thread and handed back when
    /// the session ends.
    pub fn start(
        self,
        mut pipeline: DetectionPipeline,
    ) -> Result<(
        mpsc::UnboundedReceiver<ClassifiedPacket>,
        JoinHandle<SessionResult>,
    )> {
        let cap = self.open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = Arc::clone(&self.shutdown);

        let handle = thread::Builder::new()
            .name("packet-capture".into())
            .spawn(move || {
                pipeline.start_session();
                let result = capture_loop(cap, &mut pipeline, tx, shutdown);
                if let Err(ref e) = result {
                    error!("capture session ended with error: {}", e);
                }
                info!("capture thread terminated");
                (pipeline, result)
            })?;

        Ok((rx, handle))
    }

    fn open(&self) -> std::result::Result<Capture<Active>, CaptureError> {
        let device = match &self.settings.interface {
            Some(name) => Device::from(name.as_str()),
            None => Device::lookup()
                .map_err(|e| map_open_error("default", e))?
                .ok_or(CaptureError::NoDeviceFound)?,
        };

        info!("opening capture on device: {}", device.name);
        let device_name = device.name.clone();

        let mut cap = Capture::from_device(device)
            .map_err(|e| map_open_error(&device_name, e))?
            .promisc(self.settings.promiscuous)
            .timeout(self.settings.timeout_ms)
            .open()
            .map_err(|e| map_open_error(&device_name, e))?;

        if let Some(filter) = &self.settings.filter {
            cap.filter(filter, true)
                .map_err(|e| CaptureError::FilterSet {
                    filter: filter.clone(),
                    source: e,
                })?;
            info!("applied capture filter: {}", filter);
        }

        Ok(cap)
    }
}

/// The main capture loop. Every error in the per-packet path is already
/// absorbed inside the pipeline; only capture-stream errors terminate the
/// session.
fn capture_loop(
    mut cap: Capture<Active>,
    pipeline: &mut DetectionPipeline,
    tx: mpsc::UnboundedSender<ClassifiedPacket>,
    shutdown: Arc<AtomicBool>,
) -> std::result::Result<(), CaptureError> {
    while !shutdown.load(Ordering::Relaxed) {
        match cap.next_packet() {
            Ok(packet) => {
                let timestamp = timeval_to_datetime(packet.header.ts);
                if let Some(classified) = pipeline.process(packet.data, timestamp) {
                    if tx.send(classified).is_err() {
                        // Consumer went away; nothing left to do.
                        break;
                    }
                }
            }
            Err(pcap::Error::TimeoutExpired) => {
                // Woke up to check the shutdown flag.
                continue;
            }
            Err(pcap::Error::NoMorePackets) => break,
            Err(e) => return Err(CaptureError::Stream(e)),
        }
    }
    Ok(())
}

/// Converts a pcap header timestamp to a `DateTime<Utc>`, falling back to
/// the wall clock for out-of-range values.
pub fn timeval_to_datetime(ts: libc::timeval) -> DateTime<Utc> {
    let nanos = (ts.tv_usec as u32).saturating_mul(1000);
    DateTime::from_timestamp(ts.tv_sec as i64, nanos).unwrap_or_else(Utc::now)
}

/// pcap reports missing privileges as a generic open error; recognize the
/// usual message shapes so the caller can give actionable advice.
fn map_open_error(device: &str, source: pcap::Error) -> CaptureError {
    let text = source.to_string().to_lowercase();
    if text.contains("permission denied") || text.contains("operation not permitted") {
        CaptureError::PermissionDenied {
            device: device.to_string(),
        }
    } else {
        CaptureError::DeviceOpen {
            device: device.to_string(),
            source,
        }
    }
}

/// Lists the capture devices available on this host, in the order pcap
/// reports them. Used by the `list-interfaces` subcommand.
pub fn list_devices() -> std::result::Result<Vec<Device>, CaptureError> {
    Device::list().map_err(CaptureError::Stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeval_conversion() {
        let ts = libc::timeval {
            tv_sec: 1_700_000_000,
            tv_usec: 250_000,
        };
        let dt = timeval_to_datetime(ts);
        assert_eq!(dt.timestamp(), 1_700_000_000);
        assert_eq!(dt.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn test_permission_error_mapping() {
        let err = map_open_error(
            "eth0",
            pcap::Error::PcapError("socket: Operation not permitted".into()),
        );
        assert!(matches!(err, CaptureError::PermissionDenied { .. }));

        let err = map_open_error("eth0", pcap::Error::PcapError("device busy".into()));
        assert!(matches!(err, CaptureError::DeviceOpen { .. }));
    }
}
