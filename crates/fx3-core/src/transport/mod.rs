//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::{ControlRecord, MockCompletion, MockTransport, StopTrigger};
pub use nusb::NusbTransport;
pub use traits::{
    BulkCompletion, BulkTransport, ControlReadRequest, ControlRequest, ControlTransport,
    SubmitError, TransportError,
};
