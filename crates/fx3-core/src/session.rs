//! FX3 Session - High-level orchestrator for a complete run.
//!
//! Optionally flashes firmware into RAM through the bootloader, waits for the
//! device to come back with the streaming firmware, programs the analog front
//! end and streams until stopped.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::control::{self, FrontendConfig};
use crate::events::{Fx3Event, Fx3Observer, Fx3Phase, LogLevel, TracingObserver};
use crate::image::FirmwareImage;
use crate::protocol::constants::{
    CYPRESS_VENDOR_ID, DEFAULT_DISPATCH_TIMEOUT, DEFAULT_PACKETS_PER_REQUEST,
    DEFAULT_QUEUE_DEPTH, DEFAULT_SAMPLE_RATE, FX3_BOOTLOADER_PID, FX3_FIRMWARE_PID,
    SAMPLE_RATE_MAX, SAMPLE_RATE_MIN, STREAM_ENDPOINT,
};
use crate::stream::{SessionSummary, StopSignal, StreamConfig, run_session};
use crate::transport::{ControlTransport, NusbTransport, TransportError};
use crate::upload::{UploadReport, set_reset_state, upload_image};

const DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for an FX3 session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Firmware image to upload. `None` streams from whatever is resident.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_path: Option<String>,
    pub vendor_id: u16,
    /// PID of the ROM bootloader.
    pub bootloader_pid: u16,
    /// PID after the streaming firmware has started.
    pub firmware_pid: u16,
    /// Bulk IN endpoint address.
    pub endpoint: u8,
    pub queue_depth: usize,
    pub packets_per_request: usize,
    /// ADC sample rate in Hz.
    pub sample_rate: u32,
    pub dispatch_timeout_ms: u64,
    /// Pause after upload or reset before looking for the device again.
    pub reenumerate_delay_ms: u64,
    /// How long to wait for a device to appear.
    pub device_timeout_secs: u64,
    /// Hold the CPU in reset while loading.
    pub toggle_reset: bool,
    pub frontend: FrontendConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            firmware_path: None,
            vendor_id: CYPRESS_VENDOR_ID,
            bootloader_pid: FX3_BOOTLOADER_PID,
            firmware_pid: FX3_FIRMWARE_PID,
            endpoint: STREAM_ENDPOINT,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            packets_per_request: DEFAULT_PACKETS_PER_REQUEST,
            sample_rate: DEFAULT_SAMPLE_RATE,
            dispatch_timeout_ms: DEFAULT_DISPATCH_TIMEOUT.as_millis() as u64,
            reenumerate_delay_ms: 1000,
            device_timeout_secs: 10,
            toggle_reset: true,
            frontend: FrontendConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the sample rate and front-end settings.
    pub fn validate(&self) -> Result<()> {
        if !(SAMPLE_RATE_MIN..=SAMPLE_RATE_MAX).contains(&self.sample_rate) {
            return Err(anyhow!(
                "Sample rate {} Hz out of range {}-{} Hz",
                self.sample_rate,
                SAMPLE_RATE_MIN,
                SAMPLE_RATE_MAX
            ));
        }
        self.frontend.validate()?;
        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            endpoint: self.endpoint,
            queue_depth: self.queue_depth,
            packets_per_request: self.packets_per_request,
            sample_rate: self.sample_rate,
            dispatch_timeout: Duration::from_millis(self.dispatch_timeout_ms),
        }
    }

    fn reenumerate_delay(&self) -> Duration {
        Duration::from_millis(self.reenumerate_delay_ms)
    }

    fn device_timeout(&self) -> Duration {
        Duration::from_secs(self.device_timeout_secs)
    }
}

/// Call `open` every `interval` until it finds a device or `timeout` passes.
/// Errors other than "not found" end the wait immediately.
pub fn poll_for_device<T, F>(mut open: F, timeout: Duration, interval: Duration) -> Result<T>
where
    F: FnMut() -> Result<T, TransportError>,
{
    let start = Instant::now();
    let mut poll_count = 0u64;

    loop {
        poll_count += 1;
        match open() {
            Ok(t) => {
                info!("Device found after {} polls", poll_count);
                return Ok(t);
            }
            Err(TransportError::DeviceNotFound { vid, pid }) => {
                if start.elapsed() >= timeout {
                    return Err(anyhow!(
                        "Timeout waiting for device {:04X}:{:04X} after {}s",
                        vid,
                        pid,
                        timeout.as_secs()
                    ));
                }
                thread::sleep(interval);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// FX3 Session - orchestrates upload, configuration and streaming.
pub struct Fx3Session<O: Fx3Observer> {
    config: SessionConfig,
    observer: Arc<O>,
    phase: Fx3Phase,
}

impl Fx3Session<TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_observer(config, Arc::new(TracingObserver))
    }
}

impl<O: Fx3Observer + 'static> Fx3Session<O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(config: SessionConfig, observer: Arc<O>) -> Self {
        Self {
            config,
            observer,
            phase: Fx3Phase::WaitingForDevice,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn phase(&self) -> Fx3Phase {
        self.phase
    }

    fn set_phase(&mut self, to: Fx3Phase) {
        let from = self.phase;
        self.phase = to;
        self.observer.on_event(&Fx3Event::PhaseChanged { from, to });
    }

    /// Run the complete session: upload when a firmware path is set, then stream.
    #[instrument(skip(self, stop))]
    pub fn run(&mut self, stop: StopSignal) -> Result<SessionSummary> {
        if let Some(path) = self.config.firmware_path.clone() {
            let image = load_image(&path)?;
            self.return_to_bootloader();
            self.upload(&image)?;
            thread::sleep(self.config.reenumerate_delay());
        }
        self.stream(stop)
    }

    /// If the streaming firmware is already running, send it back to the bootloader.
    fn return_to_bootloader(&mut self) {
        let Ok(transport) =
            NusbTransport::open_with_ids(self.config.vendor_id, self.config.firmware_pid)
        else {
            return;
        };
        self.observer.on_event(&Fx3Event::Log {
            level: LogLevel::Info,
            message: "Firmware already running, resetting to bootloader".to_string(),
        });
        if let Err(e) = control::reset_to_bootloader(&transport) {
            warn!("Reset to bootloader failed: {}", e);
        }
        drop(transport);
        self.set_phase(Fx3Phase::ReEnumerating);
        thread::sleep(self.config.reenumerate_delay());
    }

    /// Wait for the bootloader and upload `image` into device RAM.
    ///
    /// A failure leaves the device in an undefined state; power cycle it
    /// before trying again.
    pub fn upload(&mut self, image: &FirmwareImage) -> Result<UploadReport> {
        self.set_phase(Fx3Phase::WaitingForDevice);
        let transport = self.wait_for_device(self.config.bootloader_pid)?;

        self.set_phase(Fx3Phase::FirmwareUpload);
        load_firmware(
            &transport,
            image,
            self.config.toggle_reset,
            self.observer.as_ref(),
        )
    }

    /// Wait for the streaming firmware, configure the front end and stream
    /// until `stop` is raised.
    pub fn stream(&mut self, stop: StopSignal) -> Result<SessionSummary> {
        self.config.validate()?;
        self.set_phase(Fx3Phase::ReEnumerating);
        let mut transport = self.wait_for_device(self.config.firmware_pid)?;

        self.set_phase(Fx3Phase::Configuring);
        if let Err(e) = control::configure_frontend(&transport, &self.config.frontend) {
            warn!("Front-end configuration failed: {}", e);
            self.observer.on_event(&Fx3Event::CommandFailed {
                command: "configure front end".to_string(),
                message: e.to_string(),
            });
        }

        self.set_phase(Fx3Phase::Streaming);
        let summary = run_session(
            &mut transport,
            self.config.stream_config(),
            stop,
            self.observer.as_ref(),
        )?;

        self.set_phase(Fx3Phase::Complete);
        Ok(summary)
    }

    /// Poll for `pid` under the configured vendor ID.
    pub fn wait_for_device(&self, pid: u16) -> Result<NusbTransport> {
        let vid = self.config.vendor_id;
        info!(
            vid = %format!("{:04X}", vid),
            pid = %format!("{:04X}", pid),
            "Waiting for device..."
        );
        let transport = poll_for_device(
            || NusbTransport::open_with_ids(vid, pid),
            self.config.device_timeout(),
            DEVICE_POLL_INTERVAL,
        )?;
        self.observer.on_event(&Fx3Event::DeviceConnected {
            vid: transport.vendor_id(),
            pid: transport.product_id(),
        });
        Ok(transport)
    }
}

/// Read and validate an image file.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<FirmwareImage> {
    let path = path.as_ref();
    info!(path = %path.display(), "Loading firmware image");
    FirmwareImage::load(path).with_context(|| format!("{}", path.display()))
}

/// Upload `image`, optionally wrapped in CPU reset on/off.
///
/// Reset toggling failures are logged and ignored; upload failures are fatal.
pub fn load_firmware<T, O>(
    transport: &T,
    image: &FirmwareImage,
    toggle_reset: bool,
    observer: &O,
) -> Result<UploadReport>
where
    T: ControlTransport + ?Sized,
    O: Fx3Observer + ?Sized,
{
    if toggle_reset {
        toggle_cpu_reset(transport, true, observer);
    }
    let report = upload_image(transport, image, observer)
        .context("Firmware upload failed; power cycle the device before retrying")?;
    if toggle_reset {
        toggle_cpu_reset(transport, false, observer);
    }
    Ok(report)
}

fn toggle_cpu_reset<T, O>(transport: &T, asserted: bool, observer: &O)
where
    T: ControlTransport + ?Sized,
    O: Fx3Observer + ?Sized,
{
    observer.on_event(&Fx3Event::ResetState { asserted });
    if let Err(e) = set_reset_state(transport, asserted) {
        warn!("Can't modify CPU reset state: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::events::test_support::RecordingObserver;
    use crate::image::test_support::build_image;
    use crate::transport::MockTransport;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("fx3-core-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.vendor_id, 0x04B4);
        assert_eq!(config.bootloader_pid, 0x00F3);
        assert_eq!(config.firmware_pid, 0x00F1);
        assert_eq!(config.endpoint, 0x81);

        let stream = config.stream_config();
        assert_eq!(stream.queue_depth, 16);
        assert_eq!(stream.packets_per_request, 8);
        assert_eq!(stream.dispatch_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let path = temp_path("config.toml");
        let mut config = SessionConfig {
            firmware_path: Some("SDDC_FX3.img".to_string()),
            queue_depth: 32,
            sample_rate: 64_000_000,
            ..Default::default()
        };
        config.frontend.attenuation = 10;
        config.frontend.dither = true;

        config.save_to_file(&path).unwrap();
        let loaded = SessionConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: SessionConfig = toml::from_str(
            r#"
            queue_depth = 4
            [frontend]
            gain_mode = "low"
            "#,
        )
        .unwrap();
        assert_eq!(config.queue_depth, 4);
        assert_eq!(config.firmware_pid, FX3_FIRMWARE_PID);
        assert_eq!(config.frontend.gain_mode, crate::control::GainMode::Low);
        assert_eq!(config.frontend.vga_gain, 1);
        assert!(config.firmware_path.is_none());
    }

    #[test]
    fn test_out_of_range_config_rejected() {
        let path = temp_path("bad-gain.toml");
        std::fs::write(&path, "[frontend]\nvga_gain = 200\n").unwrap();
        let result = SessionConfig::load_from_file(&path);
        std::fs::remove_file(&path).ok();
        assert!(result.unwrap_err().to_string().contains("VGA gain 200"));

        let config = SessionConfig {
            sample_rate: 1_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let mut config = SessionConfig::default();
        config.frontend.attenuation = 64;
        assert!(config.validate().is_err());
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_poll_for_device_retries_not_found() {
        let mut attempts = 0;
        let found = poll_for_device(
            || {
                attempts += 1;
                if attempts < 3 {
                    Err(TransportError::DeviceNotFound { vid: 1, pid: 2 })
                } else {
                    Ok(attempts)
                }
            },
            Duration::from_secs(5),
            Duration::ZERO,
        )
        .unwrap();
        assert_eq!(found, 3);
    }

    #[test]
    fn test_poll_for_device_times_out() {
        let result: Result<()> = poll_for_device(
            || Err(TransportError::DeviceNotFound { vid: 1, pid: 2 }),
            Duration::ZERO,
            Duration::ZERO,
        );
        assert!(result.unwrap_err().to_string().contains("Timeout"));
    }

    #[test]
    fn test_poll_for_device_stops_on_other_errors() {
        let mut attempts = 0;
        let result: Result<()> = poll_for_device(
            || {
                attempts += 1;
                Err(TransportError::Disconnected)
            },
            Duration::from_secs(5),
            Duration::ZERO,
        );
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_load_firmware_wraps_upload_in_reset() {
        let image = FirmwareImage::from_bytes(build_image(&[(0x100, &[7u8; 8][..])], None)).unwrap();
        let mock = MockTransport::new();
        let observer = RecordingObserver::default();

        let report = load_firmware(&mock, &image, true, &observer).unwrap();

        let records = mock.control_records();
        assert_eq!(records.len(), 3);
        assert_eq!((records[0].value, records[0].data.clone()), (0xE600, vec![1]));
        assert_eq!(records[1].value, 0x100);
        assert_eq!((records[2].value, records[2].data.clone()), (0xE600, vec![0]));
        assert_eq!(report.bytes, 8);

        let resets: Vec<_> = observer
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Fx3Event::ResetState { asserted } => Some(asserted),
                _ => None,
            })
            .collect();
        assert_eq!(resets, vec![true, false]);
    }

    #[test]
    fn test_load_firmware_reset_failure_is_not_fatal() {
        let image = FirmwareImage::from_bytes(build_image(&[(0, &[1u8; 4][..])], None)).unwrap();
        let mock = MockTransport::new();
        mock.fail_control_at(0);

        assert!(load_firmware(&mock, &image, true, &NullObserver).is_ok());
        assert_eq!(mock.control_records().len(), 3);
    }

    #[test]
    fn test_load_firmware_upload_failure_is_fatal() {
        let image = FirmwareImage::from_bytes(build_image(&[(0, &[1u8; 4][..])], None)).unwrap();
        let mock = MockTransport::new();
        mock.fail_control_at(0);

        let err = load_firmware(&mock, &image, false, &NullObserver).unwrap_err();
        assert!(err.to_string().contains("power cycle"));
        assert_eq!(mock.control_records().len(), 1);
    }

    #[test]
    fn test_load_image_missing_file() {
        assert!(load_image(temp_path("missing.img")).is_err());
    }
}
