//! The consumer side of the read path.

use std::time::{Duration, Instant};

use tracing::trace;

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::sync::WaitQueue;

/// Why the consumer is being hung up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HangupReason {
    /// Carrier detect dropped while carrier-dependent hangup was enabled.
    Carrier,
    /// The device left the bus.
    Disconnect,
}

/// Receives inbound bytes from the read ring.
///
/// Every method is called from completion context: implementations must not sleep
/// or block on anything a blocking-context caller may hold.
pub trait ReadSink: Send + Sync {
    /// Bytes from one completed read slot. Returns how many were accepted; the
    /// rest are counted as buffer overruns.
    fn deliver(&self, data: &[u8]) -> usize;

    fn hangup(&self, _reason: HangupReason) {}

    /// A write slot was released; there is room to write again.
    fn write_wakeup(&self) {}
}

struct SinkState {
    buffer: Buffer<Box<[u8]>>,
    overruns: u64,
    hangup: Option<HangupReason>,
}

/// A bounded inbound buffer with blocking reads, usable directly as the port's sink.
///
/// Bytes that do not fit are dropped and counted as overruns.
pub struct BufferedSink {
    state: spin::Mutex<SinkState>,
    readable: WaitQueue,
}

impl BufferedSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: spin::Mutex::new(SinkState {
                buffer: Buffer::new(vec![0u8; capacity].into_boxed_slice()),
                overruns: 0,
                hangup: None,
            }),
            readable: WaitQueue::new(),
        }
    }

    /// Read buffered bytes, blocking up to `timeout` (forever if `None`) for at least one.
    ///
    /// After a carrier hangup, reads drain what is left and then return `Ok(0)`.
    /// After a disconnect they drain and then fail with [`Error::Gone`].
    pub fn read(&self, data: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        self.readable
            .wait_until(deadline, || match self.take(data) {
                Err(Error::Busy) => None,
                other => Some(other),
            })
            .unwrap_or(Err(Error::Timeout))
    }

    /// Non-blocking read. Fails with [`Error::Busy`] when nothing is buffered.
    pub fn try_read(&self, data: &mut [u8]) -> Result<usize> {
        self.take(data)
    }

    fn take(&self, data: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock();
        if state.buffer.available_read() > 0 {
            let n = state.buffer.read(data.len(), |buffered| {
                data[..buffered.len()].copy_from_slice(buffered);
                buffered.len()
            });
            return Ok(n);
        }
        match state.hangup {
            Some(HangupReason::Disconnect) => Err(Error::Gone),
            Some(HangupReason::Carrier) => Ok(0),
            None => Err(Error::Busy),
        }
    }

    /// Bytes waiting to be read.
    pub fn available(&self) -> usize {
        self.state.lock().buffer.available_read()
    }

    /// Bytes that can still be delivered without overrunning.
    pub fn space(&self) -> usize {
        self.state.lock().buffer.available_write()
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().buffer.capacity()
    }

    /// Bytes dropped because the buffer was full.
    pub fn overruns(&self) -> u64 {
        self.state.lock().overruns
    }

    /// Clear a carrier hangup so the sink can serve a reopened port.
    pub fn rearm(&self) {
        let mut state = self.state.lock();
        if state.hangup == Some(HangupReason::Carrier) {
            state.hangup = None;
        }
    }
}

impl ReadSink for BufferedSink {
    fn deliver(&self, data: &[u8]) -> usize {
        let written = {
            let mut state = self.state.lock();
            let written = state.buffer.write(data);
            if written < data.len() {
                state.overruns = state.overruns.wrapping_add((data.len() - written) as u64);
                trace!(dropped = data.len() - written, "inbound buffer full");
            }
            written
        };
        self.readable.wake_all();
        written
    }

    fn hangup(&self, reason: HangupReason) {
        {
            let mut state = self.state.lock();
            // A disconnect outranks a carrier hangup.
            if state.hangup != Some(HangupReason::Disconnect) {
                state.hangup = Some(reason);
            }
        }
        self.readable.wake_all();
    }
}
