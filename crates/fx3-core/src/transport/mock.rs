//! Mock USB transport for testing.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{
    BulkCompletion, BulkTransport, ControlReadRequest, ControlRequest, ControlTransport,
    SubmitError, TransportError,
};
use crate::protocol::constants::{CYPRESS_VENDOR_ID, FX3_FIRMWARE_PID};
use crate::stream::StopSignal;

/// A control transfer captured by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    pub request: u8,
    pub value: u16,
    pub index: u16,
    /// Payload for writes, empty for reads.
    pub data: Vec<u8>,
    pub timeout: Option<Duration>,
    pub is_read: bool,
}

/// Outcome scripted for the next bulk completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockCompletion {
    /// Fill the whole buffer.
    Full,
    /// Complete with fewer bytes.
    Short(usize),
    /// Report a transfer error with zero bytes.
    Fail,
}

/// When the mock raises the stop signal on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopTrigger {
    /// After this many completions have been delivered.
    AfterCompletions(usize),
    /// After this many dispatch calls.
    AfterDispatches(usize),
}

/// Mock transport for unit testing the uploader and the streaming engine.
pub struct MockTransport {
    /// Captured control transfers.
    control_log: Arc<Mutex<Vec<ControlRecord>>>,
    /// Control transfer ordinals (0-based) that fail.
    control_failures: Arc<Mutex<HashSet<usize>>>,
    /// Request codes that always fail.
    failing_requests: Arc<Mutex<HashSet<u8>>>,
    /// Queued responses for control reads.
    read_responses: Arc<Mutex<VecDeque<Vec<u8>>>>,
    /// Simulated VID/PID.
    vid: u16,
    pid: u16,
    max_packet_size: usize,
    allocations: usize,
    allocation_failure: Option<usize>,
    submits: usize,
    submit_failures: HashSet<usize>,
    in_flight: VecDeque<(usize, Vec<u8>)>,
    max_in_flight: usize,
    script: VecDeque<MockCompletion>,
    reverse_order: bool,
    batch: usize,
    dispatches: usize,
    delivered: usize,
    stop: Option<(StopTrigger, StopSignal)>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            control_log: Arc::new(Mutex::new(Vec::new())),
            control_failures: Arc::new(Mutex::new(HashSet::new())),
            failing_requests: Arc::new(Mutex::new(HashSet::new())),
            read_responses: Arc::new(Mutex::new(VecDeque::new())),
            vid: CYPRESS_VENDOR_ID,
            pid: FX3_FIRMWARE_PID,
            max_packet_size: 1024,
            allocations: 0,
            allocation_failure: None,
            submits: 0,
            submit_failures: HashSet::new(),
            in_flight: VecDeque::new(),
            max_in_flight: 0,
            script: VecDeque::new(),
            reverse_order: false,
            batch: usize::MAX,
            dispatches: 0,
            delivered: 0,
            stop: None,
        }
    }

    /// Get all captured control transfers.
    pub fn control_records(&self) -> Vec<ControlRecord> {
        self.control_log.lock().unwrap().clone()
    }

    /// Captured control transfers with request code `request`.
    pub fn records_for(&self, request: u8) -> Vec<ControlRecord> {
        self.control_records()
            .into_iter()
            .filter(|r| r.request == request)
            .collect()
    }

    /// Clear captured control transfers.
    pub fn clear_records(&self) {
        self.control_log.lock().unwrap().clear();
    }

    /// Fail the `n`-th control transfer (0-based, counting reads and writes).
    pub fn fail_control_at(&self, n: usize) {
        self.control_failures.lock().unwrap().insert(n);
    }

    /// Fail every control transfer using `request`.
    pub fn fail_request(&self, request: u8) {
        self.failing_requests.lock().unwrap().insert(request);
    }

    /// Queue a response for the next control read.
    pub fn queue_read(&self, data: &[u8]) {
        self.read_responses.lock().unwrap().push_back(data.to_vec());
    }

    /// Set VID/PID for re-enumeration testing.
    pub fn set_ids(&mut self, vid: u16, pid: u16) {
        self.vid = vid;
        self.pid = pid;
    }

    pub fn set_max_packet_size(&mut self, size: usize) {
        self.max_packet_size = size;
    }

    /// Fail the `n`-th buffer allocation (0-based).
    pub fn fail_allocation_at(&mut self, n: usize) {
        self.allocation_failure = Some(n);
    }

    /// Reject the `n`-th bulk submission (0-based).
    pub fn fail_submit_at(&mut self, n: usize) {
        self.submit_failures.insert(n);
    }

    /// Script the outcomes of the next completions, in delivery order.
    pub fn script_completions(&mut self, outcomes: &[MockCompletion]) {
        self.script.extend(outcomes.iter().copied());
    }

    /// Deliver the most recently submitted transfer first.
    pub fn set_reverse_order(&mut self, reverse: bool) {
        self.reverse_order = reverse;
    }

    /// Limit completions returned per dispatch call.
    pub fn set_batch(&mut self, batch: usize) {
        self.batch = batch.max(1);
    }

    /// Raise `stop` once `trigger` is reached.
    pub fn stop_when(&mut self, trigger: StopTrigger, stop: StopSignal) {
        self.stop = Some((trigger, stop));
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn submit_count(&self) -> usize {
        self.submits
    }

    pub fn dispatch_count(&self) -> usize {
        self.dispatches
    }

    pub fn completions_delivered(&self) -> usize {
        self.delivered
    }

    fn record(&self, record: ControlRecord) -> Result<(), TransportError> {
        let request = record.request;
        let mut log = self.control_log.lock().unwrap();
        let ordinal = log.len();
        log.push(record);

        if self.control_failures.lock().unwrap().contains(&ordinal)
            || self.failing_requests.lock().unwrap().contains(&request)
        {
            return Err(TransportError::ControlFailed {
                request,
                message: "mock pipe error".into(),
            });
        }
        Ok(())
    }

    fn check_trigger(&self) {
        if let Some((trigger, stop)) = &self.stop {
            let reached = match *trigger {
                StopTrigger::AfterCompletions(n) => self.delivered >= n,
                StopTrigger::AfterDispatches(n) => self.dispatches >= n,
            };
            if reached {
                stop.request();
            }
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlTransport for MockTransport {
    fn control_out(&self, request: ControlRequest<'_>) -> Result<(), TransportError> {
        self.record(ControlRecord {
            request: request.request,
            value: request.value,
            index: request.index,
            data: request.data.to_vec(),
            timeout: request.timeout,
            is_read: false,
        })
    }

    fn control_in(&self, request: ControlReadRequest) -> Result<Vec<u8>, TransportError> {
        self.record(ControlRecord {
            request: request.request,
            value: request.value,
            index: request.index,
            data: Vec::new(),
            timeout: request.timeout,
            is_read: true,
        })?;
        let mut data = self
            .read_responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(TransportError::Timeout { timeout_ms: 1000 })?;
        data.truncate(request.length as usize);
        Ok(data)
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}

impl BulkTransport for MockTransport {
    type Buffer = Vec<u8>;

    fn max_packet_size(&mut self, _endpoint: u8) -> Result<usize, TransportError> {
        Ok(self.max_packet_size)
    }

    fn allocate(&mut self, _endpoint: u8, len: usize) -> Result<Vec<u8>, TransportError> {
        let n = self.allocations;
        self.allocations += 1;
        if self.allocation_failure == Some(n) {
            return Err(TransportError::AllocationFailed(format!(
                "mock refused allocation #{n}"
            )));
        }
        Ok(vec![0u8; len])
    }

    fn submit_bulk(
        &mut self,
        _endpoint: u8,
        slot: usize,
        buffer: Vec<u8>,
    ) -> Result<(), SubmitError<Vec<u8>>> {
        let n = self.submits;
        self.submits += 1;
        if self.submit_failures.contains(&n) {
            return Err(SubmitError {
                error: TransportError::BulkFailed("mock submit rejected".into()),
                buffer,
            });
        }
        self.in_flight.push_back((slot, buffer));
        self.max_in_flight = self.max_in_flight.max(self.in_flight.len());
        Ok(())
    }

    fn dispatch_events(
        &mut self,
        _timeout: Duration,
    ) -> Result<Vec<BulkCompletion<Vec<u8>>>, TransportError> {
        self.dispatches += 1;
        let mut completions = Vec::new();

        while completions.len() < self.batch {
            let next = if self.reverse_order {
                self.in_flight.pop_back()
            } else {
                self.in_flight.pop_front()
            };
            let Some((slot, buffer)) = next else {
                break;
            };

            let (actual_len, status) = match self.script.pop_front().unwrap_or(MockCompletion::Full)
            {
                MockCompletion::Full => (buffer.len(), Ok(())),
                MockCompletion::Short(n) => (n.min(buffer.len()), Ok(())),
                MockCompletion::Fail => (
                    0,
                    Err(TransportError::BulkFailed("mock endpoint stall".into())),
                ),
            };
            self.delivered += 1;
            completions.push(BulkCompletion {
                slot,
                buffer,
                actual_len,
                status,
            });
        }

        self.check_trigger();
        Ok(completions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_control_capture() {
        let mock = MockTransport::new();
        mock.control_out(ControlRequest {
            request: 0xAA,
            value: 1,
            index: 2,
            data: &[1, 2, 3, 4],
            timeout: None,
        })
        .unwrap();

        let records = mock.control_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].request, 0xAA);
        assert_eq!(records[0].value, 1);
        assert_eq!(records[0].index, 2);
        assert_eq!(records[0].data, vec![1, 2, 3, 4]);
        assert!(!records[0].is_read);
    }

    #[test]
    fn test_mock_ids_and_clear() {
        let mut mock = MockTransport::new();
        assert_eq!((mock.vendor_id(), mock.product_id()), (0x04B4, 0x00F1));
        mock.set_ids(0x04B4, 0x00F3);
        assert_eq!(mock.product_id(), 0x00F3);

        mock.queue_read(&[1, 2, 3, 4]);
        crate::control::query_self_test(&mock).unwrap();
        assert_eq!(mock.control_records().len(), 1);
        mock.clear_records();
        assert!(mock.control_records().is_empty());
    }

    #[test]
    fn test_mock_control_failure_injection() {
        let mock = MockTransport::new();
        mock.fail_control_at(1);
        let req = ControlRequest {
            request: 0xA0,
            value: 0,
            index: 0,
            data: &[],
            timeout: None,
        };
        assert!(mock.control_out(req).is_ok());
        assert!(mock.control_out(req).is_err());
        assert!(mock.control_out(req).is_ok());
        assert_eq!(mock.control_records().len(), 3);
    }

    #[test]
    fn test_mock_control_read_queue() {
        let mock = MockTransport::new();
        mock.queue_read(&[0xDE, 0xAD, 0xBE, 0xEF, 0x00]);
        let data = mock
            .control_in(ControlReadRequest {
                request: 0xAC,
                value: 0,
                index: 0,
                length: 4,
                timeout: None,
            })
            .unwrap();
        assert_eq!(data, vec![0xDE, 0xAD, 0xBE, 0xEF]);

        // Queue is empty now
        assert!(
            mock.control_in(ControlReadRequest {
                request: 0xAC,
                value: 0,
                index: 0,
                length: 4,
                timeout: None,
            })
            .is_err()
        );
    }

    #[test]
    fn test_mock_bulk_script_and_order() {
        let mut mock = MockTransport::new();
        mock.set_reverse_order(true);
        mock.script_completions(&[MockCompletion::Short(10), MockCompletion::Fail]);

        for slot in 0..3 {
            let buf = mock.allocate(0x81, 64).unwrap();
            mock.submit_bulk(0x81, slot, buf).unwrap();
        }
        assert_eq!(mock.max_in_flight(), 3);

        let done = mock.dispatch_events(Duration::ZERO).unwrap();
        let slots: Vec<_> = done.iter().map(|c| c.slot).collect();
        assert_eq!(slots, vec![2, 1, 0]);
        assert_eq!(done[0].actual_len, 10);
        assert!(done[1].status.is_err());
        assert_eq!(done[2].actual_len, 64);
        assert_eq!(mock.in_flight(), 0);
    }

    #[test]
    fn test_mock_stop_trigger() {
        let mut mock = MockTransport::new();
        let stop = StopSignal::new();
        mock.stop_when(StopTrigger::AfterDispatches(2), stop.clone());

        mock.dispatch_events(Duration::ZERO).unwrap();
        assert!(!stop.is_requested());
        mock.dispatch_events(Duration::ZERO).unwrap();
        assert!(stop.is_requested());
    }
}
