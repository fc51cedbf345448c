//! Event system for UI decoupling.
//!
//! The uploader, the streaming engine and the session orchestrator report
//! through an observer instead of printing, so the CLI decides how things are
//! shown.

use std::fmt;
use std::time::Duration;

use crate::stream::{SessionState, SessionSummary, WindowReport};

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Phases of a complete run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fx3Phase {
    /// Waiting for device connection.
    WaitingForDevice,
    /// Firmware upload in progress.
    FirmwareUpload,
    /// Waiting for the device to come back with the new firmware.
    ReEnumerating,
    /// Programming GPIOs, attenuator and gain.
    Configuring,
    /// Bulk streaming.
    Streaming,
    /// All operations complete.
    Complete,
}

impl fmt::Display for Fx3Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fx3Phase::WaitingForDevice => write!(f, "Waiting for Device"),
            Fx3Phase::FirmwareUpload => write!(f, "Firmware Upload"),
            Fx3Phase::ReEnumerating => write!(f, "Re-enumerating"),
            Fx3Phase::Configuring => write!(f, "Configuring"),
            Fx3Phase::Streaming => write!(f, "Streaming"),
            Fx3Phase::Complete => write!(f, "Complete"),
        }
    }
}

/// Events emitted by the uploader, the engine and the session.
#[derive(Debug, Clone)]
pub enum Fx3Event {
    /// Device connected.
    DeviceConnected { vid: u16, pid: u16 },
    /// Phase changed.
    PhaseChanged { from: Fx3Phase, to: Fx3Phase },
    /// One firmware chunk written.
    UploadProgress {
        address: u32,
        chunk_len: usize,
        bytes_done: u64,
        bytes_total: u64,
    },
    /// CPU reset line toggled.
    ResetState { asserted: bool },
    /// A device command failed without aborting the run.
    CommandFailed { command: String, message: String },
    /// Streaming engine changed state.
    SessionStateChanged { from: SessionState, to: SessionState },
    /// One throughput window completed.
    Window(WindowReport),
    /// Waiting for in-flight transfers after stop.
    Draining { in_flight: usize },
    /// Streaming session finished.
    SessionComplete(SessionSummary),
    /// Log message.
    Log { level: LogLevel, message: String },
}

/// Observer trait for receiving events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait Fx3Observer: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &Fx3Event);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl Fx3Observer for NullObserver {
    fn on_event(&self, _event: &Fx3Event) {}
}

fn kilobytes_per_sec(rate: f64) -> u64 {
    (rate / 1024.0) as u64
}

fn secs(d: Duration) -> String {
    format!("{:.3}s", d.as_secs_f64())
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl Fx3Observer for TracingObserver {
    fn on_event(&self, event: &Fx3Event) {
        match event {
            Fx3Event::DeviceConnected { vid, pid } => {
                tracing::info!(vid = %format!("{:04X}", vid), pid = %format!("{:04X}", pid), "Device connected");
            }
            Fx3Event::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            Fx3Event::UploadProgress {
                address,
                chunk_len,
                bytes_done,
                bytes_total,
            } => {
                let pct = if *bytes_total > 0 {
                    (*bytes_done * 100) / *bytes_total
                } else {
                    100
                };
                tracing::debug!(
                    address = %format!("0x{:08X}", address),
                    len = chunk_len,
                    progress = %format!("{}%", pct),
                    "Uploaded chunk"
                );
            }
            Fx3Event::ResetState { asserted } => {
                tracing::info!(
                    "Setting CPU reset mode {}",
                    if *asserted { "on" } else { "off" }
                );
            }
            Fx3Event::CommandFailed { command, message } => {
                tracing::warn!(command = %command, "Command failed: {}", message);
            }
            Fx3Event::SessionStateChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "Session state");
            }
            Fx3Event::Window(report) => {
                tracing::info!(
                    pass = report.success_count,
                    fail = report.failure_count,
                    last_len = report.last_transfer_len,
                    elapsed = %secs(report.elapsed),
                    "Data rate: {} KBps",
                    kilobytes_per_sec(report.bytes_per_sec)
                );
            }
            Fx3Event::Draining { in_flight } => {
                tracing::info!("{} transfers are pending", in_flight);
            }
            Fx3Event::SessionComplete(summary) => {
                tracing::info!(
                    pass = summary.success_count,
                    fail = summary.failure_count,
                    bytes = summary.total_bytes,
                    windows = summary.windows_reported,
                    dropped_slots = summary.slots_dropped,
                    elapsed = %secs(summary.elapsed),
                    "Transfers completed"
                );
            }
            Fx3Event::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use super::*;

    /// Observer that keeps every event for later inspection.
    #[derive(Default)]
    pub struct RecordingObserver {
        events: Mutex<Vec<Fx3Event>>,
    }

    impl RecordingObserver {
        pub fn events(&self) -> Vec<Fx3Event> {
            self.events.lock().unwrap().clone()
        }

        pub fn windows(&self) -> Vec<WindowReport> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    Fx3Event::Window(r) => Some(r),
                    _ => None,
                })
                .collect()
        }
    }

    impl Fx3Observer for RecordingObserver {
        fn on_event(&self, event: &Fx3Event) {
            self.events.lock().unwrap().push(event.clone());
        }
    }
}
