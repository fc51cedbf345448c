//! Bulk streaming engine.
//!
//! A fixed pool of transfer slots is kept in flight on one bulk IN endpoint.
//! Every completion is handled on the caller's thread, counted, and its slot
//! resubmitted until the stop signal is raised. After that the engine keeps
//! dispatching, without submitting, until nothing is in flight.

pub mod stats;
pub mod stop;

use std::fmt;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::control;
use crate::events::{Fx3Event, Fx3Observer};
use crate::protocol::command::Fx3Command;
use crate::protocol::constants::{
    DEFAULT_DISPATCH_TIMEOUT, DEFAULT_PACKETS_PER_REQUEST, DEFAULT_QUEUE_DEPTH,
    DEFAULT_SAMPLE_RATE, STREAM_ENDPOINT,
};
use crate::transport::{
    BulkCompletion, BulkTransport, ControlTransport, SubmitError, TransportError,
};

pub use stats::{SessionSummary, StreamingStatistics, WindowReport};
pub use stop::StopSignal;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Queue depth must be at least 1")]
    InvalidQueueDepth,
    #[error("Request size must be at least one packet")]
    InvalidRequestSize,
    #[error("Unable to query endpoint: {0}")]
    Endpoint(#[source] TransportError),
    #[error("Failed to allocate transfer buffer for slot {slot}: {source}")]
    Allocation {
        slot: usize,
        #[source]
        source: TransportError,
    },
    #[error("Event dispatch failed: {0}")]
    Dispatch(#[source] TransportError),
}

/// Lifecycle of a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Slots allocated, nothing submitted.
    Created,
    /// Every slot submitted once; completions are resubmitted.
    Running,
    /// Stop observed; waiting for in-flight transfers.
    Stopping,
    /// Nothing in flight, buffers released.
    Drained,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Created => write!(f, "Created"),
            SessionState::Running => write!(f, "Running"),
            SessionState::Stopping => write!(f, "Stopping"),
            SessionState::Drained => write!(f, "Drained"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Submitted,
}

/// One entry of the slot arena. `buffer` is `None` while the transport holds it.
#[derive(Debug)]
pub struct TransferSlot<B> {
    pub index: usize,
    pub buffer: Option<B>,
    pub state: SlotState,
}

/// Streaming parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Bulk IN endpoint address.
    pub endpoint: u8,
    /// Number of transfers kept in flight.
    pub queue_depth: usize,
    /// Request size as a multiple of the endpoint's max packet size.
    pub packets_per_request: usize,
    /// ADC sample rate sent with STARTADC.
    pub sample_rate: u32,
    /// Upper bound for one dispatch call.
    pub dispatch_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            endpoint: STREAM_ENDPOINT,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            packets_per_request: DEFAULT_PACKETS_PER_REQUEST,
            sample_rate: DEFAULT_SAMPLE_RATE,
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
        }
    }
}

/// Owns the slot arena and statistics for one run.
pub struct StreamingSession<B> {
    config: StreamConfig,
    slots: Vec<TransferSlot<B>>,
    stats: StreamingStatistics,
    state: SessionState,
    in_flight: usize,
    request_size: usize,
    slots_dropped: usize,
    stop: StopSignal,
}

impl<B> StreamingSession<B> {
    /// Allocate one buffer per slot. Nothing is submitted yet.
    ///
    /// On allocation failure the buffers allocated so far are dropped.
    #[instrument(level = "debug", skip(transport, stop))]
    pub fn new<T>(transport: &mut T, config: StreamConfig, stop: StopSignal) -> Result<Self, SessionError>
    where
        T: BulkTransport<Buffer = B> + ?Sized,
    {
        if config.queue_depth == 0 {
            return Err(SessionError::InvalidQueueDepth);
        }
        if config.packets_per_request == 0 {
            return Err(SessionError::InvalidRequestSize);
        }

        let packet_size = transport
            .max_packet_size(config.endpoint)
            .map_err(SessionError::Endpoint)?;
        let request_size = packet_size * config.packets_per_request;

        let mut slots = Vec::with_capacity(config.queue_depth);
        for index in 0..config.queue_depth {
            let buffer = transport
                .allocate(config.endpoint, request_size)
                .map_err(|source| SessionError::Allocation { slot: index, source })?;
            slots.push(TransferSlot {
                index,
                buffer: Some(buffer),
                state: SlotState::Idle,
            });
        }

        debug!(
            queue_depth = config.queue_depth,
            packet_size, request_size, "Transfer slots allocated"
        );

        Ok(Self {
            stats: StreamingStatistics::new(config.queue_depth, Instant::now()),
            config,
            slots,
            state: SessionState::Created,
            in_flight: 0,
            request_size,
            slots_dropped: 0,
            stop,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Bytes requested per transfer.
    pub fn request_size(&self) -> usize {
        self.request_size
    }

    pub fn statistics(&self) -> &StreamingStatistics {
        &self.stats
    }

    pub fn slots(&self) -> &[TransferSlot<B>] {
        &self.slots
    }

    /// Stream until stopped, drain, then send STOPFX3.
    #[instrument(level = "info", skip_all, fields(endpoint = %format!("0x{:02X}", self.config.endpoint), queue_depth = self.config.queue_depth))]
    pub fn run<T, O>(mut self, transport: &mut T, observer: &O) -> Result<SessionSummary, SessionError>
    where
        T: BulkTransport<Buffer = B> + ControlTransport + ?Sized,
        O: Fx3Observer + ?Sized,
    {
        let rate = self.config.sample_rate;
        report_command(observer, Fx3Command::StartAdc, control::start_adc(&*transport, rate));
        report_command(observer, Fx3Command::StartFx3, control::start_streaming(&*transport));

        let started = Instant::now();
        self.stats.restart_window(started);
        for index in 0..self.slots.len() {
            self.submit(transport, index);
        }
        self.set_state(SessionState::Running, observer);
        info!(
            in_flight = self.in_flight,
            request_size = self.request_size,
            "Streaming started"
        );

        while !self.stop.is_requested() {
            self.dispatch(transport, observer)?;
        }

        self.set_state(SessionState::Stopping, observer);
        observer.on_event(&Fx3Event::Draining {
            in_flight: self.in_flight,
        });
        while self.in_flight > 0 {
            self.dispatch(transport, observer)?;
        }

        for slot in &mut self.slots {
            slot.buffer = None;
        }
        self.set_state(SessionState::Drained, observer);

        report_command(observer, Fx3Command::StopFx3, control::stop_streaming(&*transport));

        let summary = SessionSummary {
            success_count: self.stats.success_count(),
            failure_count: self.stats.failure_count(),
            total_bytes: self.stats.total_bytes(),
            windows_reported: self.stats.windows_reported(),
            slots_dropped: self.slots_dropped,
            elapsed: started.elapsed(),
        };
        observer.on_event(&Fx3Event::SessionComplete(summary.clone()));
        Ok(summary)
    }

    fn set_state<O: Fx3Observer + ?Sized>(&mut self, to: SessionState, observer: &O) {
        let from = self.state;
        self.state = to;
        observer.on_event(&Fx3Event::SessionStateChanged { from, to });
    }

    /// Hand slot `index` to the transport. A rejected submission leaves the slot idle.
    fn submit<T>(&mut self, transport: &mut T, index: usize) -> bool
    where
        T: BulkTransport<Buffer = B> + ?Sized,
    {
        let slot = &mut self.slots[index];
        let Some(buffer) = slot.buffer.take() else {
            return false;
        };

        match transport.submit_bulk(self.config.endpoint, index, buffer) {
            Ok(()) => {
                slot.state = SlotState::Submitted;
                self.in_flight += 1;
                true
            }
            Err(SubmitError { error, buffer }) => {
                slot.buffer = Some(buffer);
                slot.state = SlotState::Idle;
                self.slots_dropped += 1;
                warn!(slot = index, "Failed to submit transfer: {}", error);
                false
            }
        }
    }

    fn dispatch<T, O>(&mut self, transport: &mut T, observer: &O) -> Result<(), SessionError>
    where
        T: BulkTransport<Buffer = B> + ?Sized,
        O: Fx3Observer + ?Sized,
    {
        let completions = transport
            .dispatch_events(self.config.dispatch_timeout)
            .map_err(SessionError::Dispatch)?;
        for completion in completions {
            self.complete(transport, completion, observer);
        }
        Ok(())
    }

    fn complete<T, O>(&mut self, transport: &mut T, completion: BulkCompletion<B>, observer: &O)
    where
        T: BulkTransport<Buffer = B> + ?Sized,
        O: Fx3Observer + ?Sized,
    {
        let BulkCompletion {
            slot: index,
            buffer,
            actual_len,
            status,
        } = completion;

        let Some(slot) = self.slots.get_mut(index) else {
            warn!(slot = index, "Completion for unknown slot");
            return;
        };
        slot.buffer = Some(buffer);
        slot.state = SlotState::Idle;
        self.in_flight = self.in_flight.saturating_sub(1);

        let now = Instant::now();
        let report = match status {
            Ok(()) => self.stats.record_success(actual_len, now),
            Err(e) => {
                debug!(slot = index, "Transfer failed: {}", e);
                self.stats.record_failure(now)
            }
        };
        if let Some(report) = report {
            observer.on_event(&Fx3Event::Window(report));
        }

        if !self.stop.is_requested() {
            self.submit(transport, index);
        }
    }
}

/// Failures are reported but never end the session.
fn report_command<O: Fx3Observer + ?Sized>(
    observer: &O,
    command: Fx3Command,
    result: Result<(), TransportError>,
) {
    if let Err(e) = result {
        warn!(command = %command, "Device command failed: {}", e);
        observer.on_event(&Fx3Event::CommandFailed {
            command: command.to_string(),
            message: e.to_string(),
        });
    }
}

/// Allocate, stream until `stop`, drain and report totals.
pub fn run_session<T, O>(
    transport: &mut T,
    config: StreamConfig,
    stop: StopSignal,
    observer: &O,
) -> Result<SessionSummary, SessionError>
where
    T: BulkTransport + ControlTransport + ?Sized,
    O: Fx3Observer + ?Sized,
{
    StreamingSession::new(transport, config, stop)?.run(transport, observer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::events::test_support::RecordingObserver;
    use crate::transport::{MockCompletion, MockTransport, StopTrigger};

    fn config(queue_depth: usize) -> StreamConfig {
        StreamConfig {
            queue_depth,
            ..Default::default()
        }
    }

    fn mock_with_stop(trigger: StopTrigger) -> (MockTransport, StopSignal) {
        let stop = StopSignal::new();
        let mut mock = MockTransport::new();
        mock.stop_when(trigger, stop.clone());
        (mock, stop)
    }

    #[test]
    fn test_alternating_completions_one_window() {
        let (mut mock, stop) = mock_with_stop(StopTrigger::AfterCompletions(4));
        mock.script_completions(&[
            MockCompletion::Full,
            MockCompletion::Fail,
            MockCompletion::Full,
            MockCompletion::Fail,
        ]);
        let observer = RecordingObserver::default();

        let summary = run_session(&mut mock, config(4), stop, &observer).unwrap();

        assert_eq!(summary.success_count, 2);
        assert_eq!(summary.failure_count, 2);
        assert_eq!(summary.windows_reported, 1);
        assert_eq!(summary.total_bytes, 2 * 1024 * 8);

        let windows = observer.windows();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].success_count, 2);
        assert_eq!(windows[0].failure_count, 2);
        assert_eq!(windows[0].window_bytes, 2 * 1024 * 8);
        assert_eq!(mock.in_flight(), 0);
    }

    #[test]
    fn test_in_flight_bounded_by_queue_depth() {
        let (mut mock, stop) = mock_with_stop(StopTrigger::AfterDispatches(10));
        mock.set_batch(1);

        let summary = run_session(&mut mock, config(3), stop, &NullObserver).unwrap();

        assert_eq!(mock.max_in_flight(), 3);
        assert_eq!(mock.in_flight(), 0);
        // The tenth completion raises stop and is not resubmitted, leaving two to drain.
        assert_eq!(summary.success_count, 10 + 2);
        assert_eq!(summary.windows_reported, 4);
    }

    #[test]
    fn test_drain_waits_for_every_transfer() {
        let (mut mock, stop) = mock_with_stop(StopTrigger::AfterCompletions(2));
        mock.set_batch(1);

        let summary = run_session(&mut mock, config(4), stop, &NullObserver).unwrap();

        // Slot 0 was resubmitted before stop; slot 1 was not.
        assert_eq!(mock.submit_count(), 5);
        assert_eq!(mock.dispatch_count(), 5);
        assert_eq!(mock.completions_delivered(), 5);
        assert_eq!(summary.success_count, 5);
        assert_eq!(summary.windows_reported, 1);
        assert_eq!(mock.in_flight(), 0);
    }

    #[test]
    fn test_out_of_order_completions() {
        let (mut mock, stop) = mock_with_stop(StopTrigger::AfterCompletions(8));
        mock.set_reverse_order(true);
        mock.script_completions(&[MockCompletion::Short(100); 8]);

        let summary = run_session(&mut mock, config(4), stop, &NullObserver).unwrap();

        assert_eq!(summary.success_count, 8);
        assert_eq!(summary.total_bytes, 800);
        assert_eq!(summary.windows_reported, 2);
        assert_eq!(mock.in_flight(), 0);
    }

    #[test]
    fn test_rejected_initial_submit_leaves_slot_idle() {
        let (mut mock, stop) = mock_with_stop(StopTrigger::AfterDispatches(1));
        mock.fail_submit_at(1);

        let summary = run_session(&mut mock, config(4), stop, &NullObserver).unwrap();

        assert_eq!(mock.max_in_flight(), 3);
        assert_eq!(summary.success_count, 3);
        assert_eq!(summary.slots_dropped, 1);
    }

    #[test]
    fn test_rejected_resubmit_drops_slot() {
        let (mut mock, stop) = mock_with_stop(StopTrigger::AfterDispatches(2));
        // Submissions 0-3 are the initial batch; 4 is the first resubmission.
        mock.fail_submit_at(4);

        let summary = run_session(&mut mock, config(4), stop, &NullObserver).unwrap();

        assert_eq!(summary.success_count, 4 + 3);
        assert_eq!(summary.slots_dropped, 1);
        assert_eq!(mock.in_flight(), 0);
    }

    #[test]
    fn test_request_size_from_packet_size() {
        let mut mock = MockTransport::new();
        mock.set_max_packet_size(512);
        let session = StreamingSession::new(&mut mock, config(2), StopSignal::new()).unwrap();

        assert_eq!(session.request_size(), 512 * 8);
        assert_eq!(session.state(), SessionState::Created);
        assert_eq!(session.in_flight(), 0);
        assert!(session.slots().iter().all(|s| s.state == SlotState::Idle
            && s.buffer.as_ref().map(Vec::len) == Some(4096)));
    }

    #[test]
    fn test_allocation_failure_aborts_startup() {
        let mut mock = MockTransport::new();
        mock.fail_allocation_at(2);

        let result = run_session(&mut mock, config(4), StopSignal::new(), &NullObserver);

        assert!(matches!(result, Err(SessionError::Allocation { slot: 2, .. })));
        assert!(mock.control_records().is_empty());
        assert_eq!(mock.submit_count(), 0);
    }

    #[test]
    fn test_zero_queue_depth_rejected() {
        let mut mock = MockTransport::new();
        let result = run_session(&mut mock, config(0), StopSignal::new(), &NullObserver);
        assert!(matches!(result, Err(SessionError::InvalidQueueDepth)));
    }

    #[test]
    fn test_command_order() {
        let (mut mock, stop) = mock_with_stop(StopTrigger::AfterDispatches(1));
        let config = StreamConfig {
            sample_rate: 64_000_000,
            ..config(2)
        };

        run_session(&mut mock, config, stop, &NullObserver).unwrap();

        let records = mock.control_records();
        let codes: Vec<_> = records.iter().map(|r| r.request).collect();
        assert_eq!(codes, vec![0xB2, 0xAA, 0xAB]);
        assert_eq!(records[0].data, 64_000_000u32.to_le_bytes().to_vec());
    }

    #[test]
    fn test_failed_start_command_is_reported() {
        let (mut mock, stop) = mock_with_stop(StopTrigger::AfterDispatches(1));
        mock.fail_request(Fx3Command::StartAdc.code());
        let observer = RecordingObserver::default();

        let summary = run_session(&mut mock, config(2), stop, &observer).unwrap();

        assert_eq!(summary.success_count, 2);
        assert!(observer.events().iter().any(|e| matches!(
            e,
            Fx3Event::CommandFailed { command, .. } if command.starts_with("STARTADC")
        )));
        assert_eq!(mock.records_for(Fx3Command::StopFx3.code()).len(), 1);
    }

    #[test]
    fn test_state_transitions() {
        let (mut mock, stop) = mock_with_stop(StopTrigger::AfterDispatches(1));
        let observer = RecordingObserver::default();

        run_session(&mut mock, config(2), stop, &observer).unwrap();

        let states: Vec<_> = observer
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Fx3Event::SessionStateChanged { from, to } => Some((from, to)),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                (SessionState::Created, SessionState::Running),
                (SessionState::Running, SessionState::Stopping),
                (SessionState::Stopping, SessionState::Drained),
            ]
        );
    }

    #[test]
    fn test_stop_before_run_still_drains() {
        let stop = StopSignal::new();
        stop.request();
        let mut mock = MockTransport::new();

        let summary = run_session(&mut mock, config(3), stop, &NullObserver).unwrap();

        assert_eq!(summary.success_count, 3);
        assert_eq!(mock.submit_count(), 3);
        assert_eq!(mock.in_flight(), 0);
    }
}
