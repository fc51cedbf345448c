//! USB Transport layer abstraction.
//!
//! Defines the `ControlTransport` and `BulkTransport` traits consumed by the
//! uploader and the streaming engine, allowing different implementations
//! (nusb, mock, etc.).

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Endpoint 0x{address:02X} not found")]
    EndpointNotFound { address: u8 },

    #[error("Control transfer 0x{request:02X} failed: {message}")]
    ControlFailed { request: u8, message: String },

    #[error("Bulk transfer failed: {0}")]
    BulkFailed(String),

    #[error("Buffer allocation failed: {0}")]
    AllocationFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Host-to-device vendor control transfer.
#[derive(Debug, Clone, Copy)]
pub struct ControlRequest<'a> {
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub data: &'a [u8],
    /// `None` blocks until the transfer completes or the transport fails.
    pub timeout: Option<Duration>,
}

/// Device-to-host vendor control transfer.
#[derive(Debug, Clone, Copy)]
pub struct ControlReadRequest {
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
    pub timeout: Option<Duration>,
}

/// Blocking vendor control transfers to the device.
pub trait ControlTransport {
    /// Issue one host-to-device control transfer.
    fn control_out(&self, request: ControlRequest<'_>) -> Result<(), TransportError>;

    /// Issue one device-to-host control transfer.
    fn control_in(&self, request: ControlReadRequest) -> Result<Vec<u8>, TransportError>;

    /// Get the current VID.
    fn vendor_id(&self) -> u16;

    /// Get the current PID.
    fn product_id(&self) -> u16;
}

/// One finished bulk transfer handed back by [`BulkTransport::dispatch_events`].
#[derive(Debug)]
pub struct BulkCompletion<B> {
    /// Slot index the transfer was submitted for.
    pub slot: usize,
    /// The buffer, returned to its owner.
    pub buffer: B,
    /// Bytes actually received.
    pub actual_len: usize,
    /// Transport-reported status.
    pub status: Result<(), TransportError>,
}

/// A rejected submission; the buffer goes back to the caller.
#[derive(Debug, Error)]
#[error("submit failed: {error}")]
pub struct SubmitError<B> {
    #[source]
    pub error: TransportError,
    pub buffer: B,
}

/// Asynchronous bulk IN transfers.
///
/// Completions are never delivered through callbacks running on a
/// transport-owned thread. `dispatch_events` blocks on the caller's thread
/// and returns every completion that became ready, so the caller handles
/// them one at a time and may resubmit from there.
pub trait BulkTransport {
    /// Transfer buffer type; owned by the caller between submissions.
    type Buffer;

    /// `wMaxPacketSize` of `endpoint`, without any SuperSpeed burst factor.
    fn max_packet_size(&mut self, endpoint: u8) -> Result<usize, TransportError>;

    /// Allocate a buffer for transfers of `len` bytes on `endpoint`.
    fn allocate(&mut self, endpoint: u8, len: usize) -> Result<Self::Buffer, TransportError>;

    /// Queue a bulk IN transfer for `slot`. Non-blocking.
    fn submit_bulk(
        &mut self,
        endpoint: u8,
        slot: usize,
        buffer: Self::Buffer,
    ) -> Result<(), SubmitError<Self::Buffer>>;

    /// Wait up to `timeout` for completions and return all that are ready.
    fn dispatch_events(
        &mut self,
        timeout: Duration,
    ) -> Result<Vec<BulkCompletion<Self::Buffer>>, TransportError>;
}
