//! Firmware upload over vendor control transfers.
//!
//! A failed upload is not rolled back and is never retried: the device is left
//! in an undefined state and usually needs a power cycle before the next
//! attempt.

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::events::{Fx3Event, Fx3Observer};
use crate::image::{FirmwareImage, ParseError, Segment, SegmentIter};
use crate::protocol::constants::{CPUCS_ADDRESS, REQUEST_RW_INTERNAL, UPLOAD_TIMEOUT};
use crate::transport::{ControlRequest, ControlTransport, TransportError};

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Invalid firmware image: {0}")]
    Parse(#[source] ParseError),
    #[error("Unable to send firmware to device at 0x{address:08X}: {source}")]
    TransferFailed {
        address: u32,
        #[source]
        source: TransportError,
    },
    #[error("Firmware file is truncated at offset 0x{offset:X} ({unconsumed} bytes not uploaded)")]
    ImageTruncated { offset: usize, unconsumed: usize },
}

impl From<ParseError> for UploadError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::Truncated { offset, unconsumed } => {
                UploadError::ImageTruncated { offset, unconsumed }
            }
            other => UploadError::Parse(other),
        }
    }
}

/// What a successful upload wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub segments: usize,
    pub transfers: usize,
    pub bytes: u64,
    pub checksum_present: bool,
    pub entry_point: Option<u32>,
}

/// Write one chunk to device RAM at `address`.
fn write_chunk<T: ControlTransport + ?Sized>(
    transport: &T,
    address: u32,
    chunk: &[u8],
) -> Result<(), UploadError> {
    transport
        .control_out(ControlRequest {
            request: REQUEST_RW_INTERNAL,
            value: (address & 0xFFFF) as u16,
            index: (address >> 16) as u16,
            data: chunk,
            timeout: Some(UPLOAD_TIMEOUT),
        })
        .map_err(|source| UploadError::TransferFailed { address, source })
}

fn upload_segment<T: ControlTransport + ?Sized, O: Fx3Observer + ?Sized>(
    transport: &T,
    segment: &Segment<'_>,
    report: &mut UploadReport,
    bytes_total: u64,
    observer: &O,
) -> Result<(), UploadError> {
    if segment.is_entry_point() {
        // Zero-length write to the entry point starts the program.
        info!(address = %format!("0x{:08X}", segment.address), "Jumping to entry point");
        write_chunk(transport, segment.address, &[])?;
        report.transfers += 1;
        report.entry_point = Some(segment.address);
        return Ok(());
    }

    debug!(
        "Loading {} bytes to address {:08x}",
        segment.byte_len(),
        segment.address
    );
    for (address, chunk) in segment.chunks() {
        write_chunk(transport, address, chunk)?;
        report.transfers += 1;
        report.bytes += chunk.len() as u64;
        observer.on_event(&Fx3Event::UploadProgress {
            address,
            chunk_len: chunk.len(),
            bytes_done: report.bytes,
            bytes_total,
        });
    }
    Ok(())
}

/// Parse `image` and write every segment to the device.
///
/// Signature and size problems fail before any transfer. A transfer failure
/// aborts immediately. Truncation is reported after every preceding segment
/// was written.
#[instrument(level = "info", skip_all, fields(len = image.len()))]
pub fn upload_firmware<T: ControlTransport + ?Sized, O: Fx3Observer + ?Sized>(
    transport: &T,
    image: &[u8],
    observer: &O,
) -> Result<UploadReport, UploadError> {
    let mut segments = SegmentIter::new(image)?;
    let bytes_total: u64 = SegmentIter::new(image)?
        .map_while(Result::ok)
        .map(|s| u64::from(s.byte_len()))
        .sum();

    info!("Uploading firmware ({} bytes)", image.len());

    let mut report = UploadReport::default();
    for item in segments.by_ref() {
        let segment = item.inspect_err(|e| warn!("{}", e))?;
        upload_segment(transport, &segment, &mut report, bytes_total, observer)?;
        report.segments += 1;
    }
    report.checksum_present = segments.checksum().is_some();

    info!(
        segments = report.segments,
        transfers = report.transfers,
        bytes = report.bytes,
        "Firmware upload done"
    );
    Ok(report)
}

/// Upload an already loaded image.
pub fn upload_image<T: ControlTransport + ?Sized, O: Fx3Observer + ?Sized>(
    transport: &T,
    image: &FirmwareImage,
    observer: &O,
) -> Result<UploadReport, UploadError> {
    upload_firmware(transport, image.raw_data(), observer)
}

/// Hold (`true`) or release (`false`) the device CPU reset line.
pub fn set_reset_state<T: ControlTransport + ?Sized>(
    transport: &T,
    asserted: bool,
) -> Result<(), TransportError> {
    debug!(asserted, "CPUCS write");
    transport.control_out(ControlRequest {
        request: REQUEST_RW_INTERNAL,
        value: CPUCS_ADDRESS,
        index: 0,
        data: &[u8::from(asserted)],
        timeout: Some(UPLOAD_TIMEOUT),
    })
}
