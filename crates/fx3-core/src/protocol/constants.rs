//! Protocol constants for the FX3 bootloader and the streaming firmware.

use std::time::Duration;

// ============================================================================
// Device Identification
// ============================================================================

/// Cypress Semiconductor Vendor ID
pub const CYPRESS_VENDOR_ID: u16 = 0x04B4;

/// FX3 ROM bootloader Product ID (no firmware loaded)
pub const FX3_BOOTLOADER_PID: u16 = 0x00F3;

/// Product ID once the streaming firmware is running
pub const FX3_FIRMWARE_PID: u16 = 0x00F1;

/// Interface claimed for both control and bulk traffic
pub const FX3_INTERFACE: u8 = 0;

/// Bulk IN endpoint carrying the sample stream
pub const STREAM_ENDPOINT: u8 = 0x81;

// ============================================================================
// Firmware Image Layout
// ============================================================================

/// Image signature bytes: 'C', 'Y', <any>, 0xB0
pub const IMAGE_MAGIC_C: u8 = b'C';
pub const IMAGE_MAGIC_Y: u8 = b'Y';
pub const IMAGE_TYPE_MARKER: u8 = 0xB0;

/// Signature length at the head of every image
pub const IMAGE_SIGNATURE_LEN: usize = 4;

/// Segment header: encoded length (u32 LE) + load address (u32 LE)
pub const SEGMENT_HEADER_LEN: usize = 8;

/// Trailing checksum word
pub const IMAGE_CHECKSUM_LEN: usize = 4;

/// Largest image accepted (device code-memory limit).
pub const MAX_IMAGE_SIZE: usize = 0x86000;

// ============================================================================
// Upload Wire Format
// ============================================================================

/// Vendor request for internal RAM writes ("RW_INTERNAL")
pub const REQUEST_RW_INTERNAL: u8 = 0xA0;

/// Firmware bytes per control transfer
pub const FW_CHUNK_SIZE: usize = 4 * 1024;

/// Per-chunk upload timeout
pub const UPLOAD_TIMEOUT: Duration = Duration::from_millis(100);

/// CPU control/status register address used to hold the CPU in reset
pub const CPUCS_ADDRESS: u16 = 0xE600;

/// Timeout for `SETARGFX3` writes
pub const ARGUMENT_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// Streaming Defaults
// ============================================================================

/// Number of bulk transfers kept in flight
pub const DEFAULT_QUEUE_DEPTH: usize = 16;

/// Request size in packets of the endpoint's max packet size
pub const DEFAULT_PACKETS_PER_REQUEST: usize = 8;

/// ADC sample rate requested by `STARTADC`
pub const DEFAULT_SAMPLE_RATE: u32 = 50_000_000;

/// Accepted sample rate range (Hz)
pub const SAMPLE_RATE_MIN: u32 = 10_000_000;
pub const SAMPLE_RATE_MAX: u32 = 150_000_000;

/// DAT-31 attenuator ceiling
pub const MAX_ATTENUATION: u8 = 63;

/// AD8340 gain ceiling within one gain range
pub const MAX_VGA_GAIN: u8 = 127;

/// Upper bound for one blocking dispatch call
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(1);

/// Length of the `READINFODEBUG` response
pub const DEBUG_INFO_LEN: u16 = 64;
