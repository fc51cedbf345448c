//! nusb-based USB transport implementation.

use std::collections::VecDeque;
use std::time::Duration;

use nusb::transfer::{Buffer, Bulk, ControlIn, ControlOut, ControlType, In, Recipient};
use nusb::{Endpoint, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument};

use super::traits::{
    BulkCompletion, BulkTransport, ControlReadRequest, ControlRequest, ControlTransport,
    SubmitError, TransportError,
};
use crate::protocol::constants::FX3_INTERFACE;

/// nusb has no "wait forever"; untimed requests get this bound instead.
const UNTIMED_CONTROL_TIMEOUT: Duration = Duration::from_secs(3600);

/// nusb-based USB transport.
pub struct NusbTransport {
    interface: Interface,
    vid: u16,
    pid: u16,
    bulk_in: Option<BulkInQueue>,
}

/// An opened bulk IN endpoint plus the slots submitted on it, oldest first.
/// nusb completes transfers on one endpoint in submission order.
struct BulkInQueue {
    endpoint: Endpoint<Bulk, In>,
    pending: VecDeque<usize>,
}

impl NusbTransport {
    /// Open a device with specific VID/PID.
    #[instrument(level = "info", fields(vid = format!("{:04X}", vid), pid = format!("{:04X}", pid)))]
    pub fn open_with_ids(vid: u16, pid: u16) -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| d.vendor_id() == vid && d.product_id() == pid)
            .ok_or(TransportError::DeviceNotFound { vid, pid })?;

        info!(
            vendor_id = %format!("{:04X}", vid),
            product_id = %format!("{:04X}", pid),
            "Found device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let interface = device
            .detach_and_claim_interface(FX3_INTERFACE)
            .wait()
            .map_err(|e| TransportError::ClaimInterfaceFailed {
                interface: FX3_INTERFACE,
                message: e.to_string(),
            })?;

        info!("Device opened successfully");

        Ok(Self {
            interface,
            vid,
            pid,
            bulk_in: None,
        })
    }

    fn bulk_in(&mut self, address: u8) -> Result<&mut BulkInQueue, TransportError> {
        let reopen = self
            .bulk_in
            .as_ref()
            .is_none_or(|q| q.endpoint.endpoint_address() != address);

        if reopen {
            let endpoint = self
                .interface
                .endpoint::<Bulk, In>(address)
                .map_err(|_| TransportError::EndpointNotFound { address })?;
            debug!(
                endpoint = %format!("0x{:02X}", address),
                max_packet_size = endpoint.max_packet_size(),
                "Bulk IN endpoint opened"
            );
            self.bulk_in = Some(BulkInQueue {
                endpoint,
                pending: VecDeque::new(),
            });
        }

        self.bulk_in
            .as_mut()
            .ok_or(TransportError::EndpointNotFound { address })
    }
}

impl ControlTransport for NusbTransport {
    #[instrument(skip(self, request), fields(request = %format!("0x{:02X}", request.request), len = request.data.len()))]
    fn control_out(&self, request: ControlRequest<'_>) -> Result<(), TransportError> {
        self.interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request: request.request,
                    value: request.value,
                    index: request.index,
                    data: request.data,
                },
                request.timeout.unwrap_or(UNTIMED_CONTROL_TIMEOUT),
            )
            .wait()
            .map_err(|e| TransportError::ControlFailed {
                request: request.request,
                message: e.to_string(),
            })
    }

    #[instrument(skip(self, request), fields(request = %format!("0x{:02X}", request.request), len = request.length))]
    fn control_in(&self, request: ControlReadRequest) -> Result<Vec<u8>, TransportError> {
        let data = self
            .interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request: request.request,
                    value: request.value,
                    index: request.index,
                    length: request.length,
                },
                request.timeout.unwrap_or(UNTIMED_CONTROL_TIMEOUT),
            )
            .wait()
            .map_err(|e| TransportError::ControlFailed {
                request: request.request,
                message: e.to_string(),
            })?;
        debug!(bytes_read = data.len(), "Control read complete");
        Ok(data)
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}

impl BulkTransport for NusbTransport {
    type Buffer = Buffer;

    fn max_packet_size(&mut self, endpoint: u8) -> Result<usize, TransportError> {
        Ok(self.bulk_in(endpoint)?.endpoint.max_packet_size())
    }

    fn allocate(&mut self, endpoint: u8, len: usize) -> Result<Buffer, TransportError> {
        let queue = self.bulk_in(endpoint)?;
        let mut buffer = queue.endpoint.allocate(len);
        buffer.set_requested_len(len);
        Ok(buffer)
    }

    fn submit_bulk(
        &mut self,
        endpoint: u8,
        slot: usize,
        mut buffer: Buffer,
    ) -> Result<(), SubmitError<Buffer>> {
        let queue = match self.bulk_in(endpoint) {
            Ok(queue) => queue,
            Err(error) => return Err(SubmitError { error, buffer }),
        };
        let len = buffer.capacity();
        buffer.set_requested_len(len);
        queue.endpoint.submit(buffer);
        queue.pending.push_back(slot);
        Ok(())
    }

    fn dispatch_events(
        &mut self,
        timeout: Duration,
    ) -> Result<Vec<BulkCompletion<Buffer>>, TransportError> {
        let Some(queue) = self.bulk_in.as_mut() else {
            return Ok(Vec::new());
        };

        let mut completions = Vec::new();
        let mut wait = timeout;
        while !queue.pending.is_empty() {
            let Some(completion) = queue.endpoint.wait_next_complete(wait) else {
                break;
            };
            // Later completions only drain what is already finished.
            wait = Duration::ZERO;

            let Some(slot) = queue.pending.pop_front() else {
                break;
            };
            completions.push(BulkCompletion {
                slot,
                actual_len: completion.actual_len,
                status: completion
                    .status
                    .map_err(|e| TransportError::BulkFailed(e.to_string())),
                buffer: completion.buffer,
            });
        }

        Ok(completions)
    }
}
