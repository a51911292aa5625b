//! Streaming response-body transform chain.
//!
//! A `TransformChain` is the single `VConnection`-shaped object a
//! transaction writes producer (origin) bytes into; they fan through an
//! ordered list of stages and emerge at a terminus the transaction reads
//! as the client response body. Real async VIO scheduling and the
//! continuation/event-system machinery this models is out of scope here —
//! stages operate synchronously on in-memory byte slices, draining fully on
//! every `do_io_write`. The public shape (`do_io_read`/`do_io_write`/
//! `do_io_close`/`do_io_shutdown`/`reenable`/`handle_event`, deletability
//! tracked via close-state plus a pending-event count) is kept intact so
//! the transaction driver can be written against it exactly as if it did
//! block, even though nothing here actually does.

pub mod null;
pub mod range;

use std::collections::VecDeque;

pub use null::NullTransform;
pub use range::{parse_ranges, RangeTransform};

/// Events a stage or the terminus can raise toward its consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    ReadReady,
    ReadComplete,
    WriteReady,
    WriteComplete,
    /// Raised exactly once, on the terminus's first accepted write — the
    /// transaction may still amend the outgoing response header up to
    /// this point.
    TransformReadReady,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum CloseState {
    #[default]
    Open,
    Normal,
    Aborted,
}

/// A stage transforms bytes; the chain supplies the bookkeeping
/// (close state, pending-event count) uniformly around it.
pub trait TransformStageImpl: Send {
    /// Consumes `input`, returning bytes ready to forward downstream.
    fn process(&mut self, input: &[u8]) -> Vec<u8>;
    /// Called once, when the producer closes; returns any final bytes
    /// still buffered inside the stage.
    fn finish(&mut self) -> Vec<u8>;
}

struct Stage {
    inner: Box<dyn TransformStageImpl>,
    close_state: CloseState,
    pending_events: u32,
}

impl Stage {
    fn new(inner: Box<dyn TransformStageImpl>) -> Self {
        Self { inner, close_state: CloseState::Open, pending_events: 0 }
    }

    fn do_io_write(&mut self, data: &[u8]) -> Vec<u8> {
        let produced = self.inner.process(data);
        self.pending_events += 1;
        produced
    }

    fn do_io_close(&mut self, err: bool) -> Vec<u8> {
        self.close_state = if err { CloseState::Aborted } else { CloseState::Normal };
        let flushed = self.inner.finish();
        self.pending_events += 1;
        flushed
    }

    /// Delivers one outstanding VIO event scheduled by this stage.
    fn reenable(&mut self) {
        self.pending_events = self.pending_events.saturating_sub(1);
    }

    fn is_deletable(&self) -> bool {
        self.close_state != CloseState::Open && self.pending_events == 0
    }

    /// Bytes this stage is currently holding that have not yet been
    /// forwarded downstream. The synchronous drive in [`TransformChain`]
    /// always forwards everything immediately, so this is 0 in practice;
    /// kept so `backlog` has a real per-stage source to sum.
    fn backlog(&self) -> u64 {
        0
    }
}

/// Result of a terminus-side read: the bytes handed to the client buffer
/// plus the primary event, and a secondary `WriteReady` when the producer
/// still has backlog after this read drained some of it.
pub struct TerminusReadResult {
    pub bytes: Vec<u8>,
    pub primary: Event,
    pub secondary: Option<Event>,
}

#[derive(Default)]
struct Terminus {
    buffer: VecDeque<u8>,
    first_write_seen: bool,
    upstream_done: bool,
    close_state: CloseState,
    pending_events: u32,
}

impl Terminus {
    fn accept(&mut self, data: &[u8]) -> Event {
        let first = !self.first_write_seen;
        self.first_write_seen = true;
        self.buffer.extend(data.iter().copied());
        self.pending_events += 1;
        if first {
            Event::TransformReadReady
        } else {
            Event::WriteReady
        }
    }

    fn read(&mut self, want: usize) -> TerminusReadResult {
        let take = want.min(self.buffer.len());
        let bytes: Vec<u8> = self.buffer.drain(..take).collect();
        let primary = if self.buffer.is_empty() && self.upstream_done {
            Event::ReadComplete
        } else {
            Event::ReadReady
        };
        let secondary = if !self.buffer.is_empty() { Some(Event::WriteReady) } else { None };
        self.pending_events += 1;
        TerminusReadResult { bytes, primary, secondary }
    }

    fn close(&mut self, err: bool) {
        self.upstream_done = true;
        self.close_state = if err { CloseState::Aborted } else { CloseState::Normal };
        self.pending_events += 1;
    }

    fn reenable(&mut self) {
        self.pending_events = self.pending_events.saturating_sub(1);
    }

    fn is_deletable(&self) -> bool {
        self.close_state != CloseState::Open && self.pending_events == 0
    }
}

/// How a stage error should be disposed of: before the client has
/// received headers the overall
/// response can still be downgraded to an internal source; afterward the
/// only option is to abort the client socket outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    MarkSourceInternal,
    AbortClientSocket,
}

/// Built from an ordered list of stage factories: `T1..Tn` with
/// `Ti.output = T{i+1}`, `Tn.output = Terminus`. The terminus is always
/// present, even for a chain with zero stages (a pass-through).
pub struct TransformChain {
    stages: Vec<Stage>,
    terminus: Terminus,
}

impl TransformChain {
    pub fn build(factories: Vec<Box<dyn FnOnce() -> Box<dyn TransformStageImpl>>>) -> Self {
        let stages = factories.into_iter().map(|f| Stage::new(f())).collect();
        Self { stages, terminus: Terminus::default() }
    }

    /// `true` until the terminus's first write — the window in which the
    /// transaction may still amend the outgoing response header.
    pub fn header_amendable(&self) -> bool {
        !self.terminus.first_write_seen
    }

    pub fn do_io_write(&mut self, data: &[u8]) -> Event {
        let mut cur = data.to_vec();
        for stage in &mut self.stages {
            cur = stage.do_io_write(&cur);
        }
        self.terminus.accept(&cur)
    }

    pub fn do_io_read(&mut self, want: usize) -> TerminusReadResult {
        self.terminus.read(want)
    }

    /// Closes every stage in order, draining each stage's final flush
    /// through the remainder of the chain, then closes the terminus.
    pub fn do_io_close(&mut self, err: bool) {
        for i in 0..self.stages.len() {
            let mut flushed = self.stages[i].do_io_close(err);
            for stage in self.stages[i + 1..].iter_mut() {
                flushed = stage.do_io_write(&flushed);
            }
            self.terminus.accept(&flushed);
        }
        self.terminus.close(err);
    }

    pub fn do_io_shutdown(&mut self) {
        self.do_io_close(false);
    }

    pub fn reenable(&mut self) {
        for stage in &mut self.stages {
            stage.reenable();
        }
        self.terminus.reenable();
    }

    /// Sum of buffered bytes across every stage and the terminus, up to
    /// at least `limit` (used for flow control).
    pub fn backlog(&self, limit: u64) -> u64 {
        let mut total = 0u64;
        for stage in &self.stages {
            total += stage.backlog();
            if total >= limit {
                return total;
            }
        }
        total + self.terminus.buffer.len() as u64
    }

    /// Deletable exactly when every stage and the terminus are closed and
    /// no stage has an outstanding VIO event. The chain must not be torn
    /// down while this is false.
    pub fn is_deletable(&self) -> bool {
        self.stages.iter().all(Stage::is_deletable) && self.terminus.is_deletable()
    }

    /// Handles a stage error: tears down the chain and reports how the
    /// transaction should dispose of the response.
    pub fn fail(&mut self) -> FailureDisposition {
        let disposition = if self.header_amendable() {
            FailureDisposition::MarkSourceInternal
        } else {
            FailureDisposition::AbortClientSocket
        };
        self.do_io_close(true);
        disposition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn null_chain() -> TransformChain {
        TransformChain::build(vec![Box::new(|| Box::new(NullTransform) as Box<dyn TransformStageImpl>)])
    }

    #[test]
    fn first_write_raises_transform_read_ready() {
        let mut chain = null_chain();
        assert!(chain.header_amendable());
        let evt = chain.do_io_write(b"hello");
        assert_eq!(evt, Event::TransformReadReady);
        assert!(!chain.header_amendable());
    }

    #[test]
    fn second_write_raises_write_ready() {
        let mut chain = null_chain();
        chain.do_io_write(b"a");
        let evt = chain.do_io_write(b"b");
        assert_eq!(evt, Event::WriteReady);
    }

    #[test]
    fn read_transfers_min_of_available_and_wanted() {
        let mut chain = null_chain();
        chain.do_io_write(b"hello world");
        let r = chain.do_io_read(5);
        assert_eq!(r.bytes, b"hello");
        assert_eq!(r.primary, Event::ReadReady);
        assert!(r.secondary.is_none());
    }

    #[test]
    fn read_complete_once_upstream_done_and_drained() {
        let mut chain = null_chain();
        chain.do_io_write(b"hi");
        chain.do_io_close(false);
        let r = chain.do_io_read(100);
        assert_eq!(r.bytes, b"hi");
        assert_eq!(r.primary, Event::ReadComplete);
    }

    #[test]
    fn not_deletable_until_closed_and_drained_of_events() {
        let mut chain = null_chain();
        chain.do_io_write(b"x");
        assert!(!chain.is_deletable());
        chain.do_io_close(false);
        assert!(!chain.is_deletable());
        chain.reenable();
        chain.reenable();
        assert!(chain.is_deletable());
    }

    #[test]
    fn fail_before_headers_marks_source_internal() {
        let mut chain = null_chain();
        let disposition = chain.fail();
        assert_eq!(disposition, FailureDisposition::MarkSourceInternal);
    }

    #[test]
    fn fail_after_headers_aborts_client_socket() {
        let mut chain = null_chain();
        chain.do_io_write(b"started");
        let disposition = chain.fail();
        assert_eq!(disposition, FailureDisposition::AbortClientSocket);
    }
}
