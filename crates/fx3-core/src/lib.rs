//! FX3-Core: firmware loading and bulk streaming for Cypress FX3 receivers.
//!
//! This crate loads RAM firmware into an FX3 through its ROM bootloader and
//! then keeps a fixed queue of bulk IN transfers running against the
//! streaming firmware, counting bytes and reporting throughput.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Device IDs, request codes, firmware arguments
//! - **Transport**: USB communication abstraction (nusb, mock)
//! - **Image**: Firmware image parsing
//! - **Upload**: Chunked RAM upload and CPU reset control
//! - **Control**: Vendor commands for the streaming firmware
//! - **Stream**: Bulk transfer engine and statistics
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use fx3_core::session::{Fx3Session, SessionConfig};
//! use fx3_core::stream::StopSignal;
//!
//! let config = SessionConfig {
//!     firmware_path: Some("SDDC_FX3.img".to_string()),
//!     ..Default::default()
//! };
//!
//! let mut session = Fx3Session::new(config);
//! let summary = session.run(StopSignal::new()).expect("session failed");
//! println!("{} bytes received", summary.total_bytes);
//! ```

pub mod control;
pub mod events;
pub mod image;
pub mod protocol;
pub mod session;
pub mod stream;
pub mod transport;
pub mod upload;

// Re-exports for convenience
pub use control::{FrontendConfig, GainMode, send_command};
pub use events::{Fx3Event, Fx3Observer, Fx3Phase, LogLevel, NullObserver, TracingObserver};
pub use image::{FirmwareImage, ParseError, ParsedImage, Segment, SegmentIter, parse};
pub use protocol::{Argument, Fx3Command, GpioPin};
pub use session::{Fx3Session, SessionConfig};
pub use stream::{
    SessionError, SessionState, SessionSummary, StopSignal, StreamConfig, StreamingSession,
    WindowReport, run_session,
};
pub use transport::{
    BulkTransport, ControlTransport, MockTransport, NusbTransport, TransportError,
};
pub use upload::{UploadError, UploadReport, set_reset_state, upload_firmware};
