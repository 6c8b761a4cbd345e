//! Status monitor: the single recurring interrupt transfer that reports modem line
//! changes and line errors.

use std::sync::Arc;
use std::time::Instant;

use bitflags::bitflags;
use tracing::{debug, error, trace, warn};
use usb_device::endpoint::{EndpointAddress, EndpointType};

use crate::error::{Error, Result, TransportError};
use crate::session::Shared;
use crate::sink::HangupReason;
use crate::sync::{InterruptToken, WaitQueue};
use crate::transport::{Transfer, TransferId, TransferStatus};

bitflags! {
    /// Modem control and status lines.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ModemLines: u8 {
        /// Data terminal ready (output).
        const DTR = 0x01;
        /// Request to send (output).
        const RTS = 0x02;
        /// Clear to send (input).
        const CTS = 0x04;
        /// Data set ready (input).
        const DSR = 0x08;
        /// Ring indicator (input).
        const RI = 0x10;
        /// Data carrier detect (input).
        const DCD = 0x20;
    }
}

impl ModemLines {
    /// Lines driven by the host.
    pub const OUTPUTS: Self = Self::DTR.union(Self::RTS);
    /// Lines reported by the device.
    pub const INPUTS: Self = Self::CTS.union(Self::DSR).union(Self::RI).union(Self::DCD);
}

bitflags! {
    /// Selects which counters a [`wait_for_change`](crate::SerialPort::wait_for_change)
    /// call is interested in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ChangeMask: u8 {
        const CTS = 0x01;
        const DSR = 0x02;
        const RI = 0x04;
        const DCD = 0x08;
        const BREAK = 0x10;
        const OVERRUN = 0x20;
        const FRAME = 0x40;
        const PARITY = 0x80;
    }
}

/// Event counts. A snapshot of these is what waiters compare against.
///
/// Every counter wraps on overflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counters {
    pub cts: u32,
    pub dsr: u32,
    pub rng: u32,
    pub dcd: u32,
    pub brk: u32,
    pub overrun: u32,
    pub frame: u32,
    pub parity: u32,
    /// Inbound bytes dropped because the sink was full.
    pub buf_overrun: u32,
    /// Status frames the resolver could not decode.
    pub garbled: u32,
    pub rx: u64,
    pub tx: u64,
}

impl Counters {
    /// Whether any counter selected by `mask` differs between the two snapshots.
    pub fn differs(&self, other: &Counters, mask: ChangeMask) -> bool {
        (mask.contains(ChangeMask::CTS) && self.cts != other.cts)
            || (mask.contains(ChangeMask::DSR) && self.dsr != other.dsr)
            || (mask.contains(ChangeMask::RI) && self.rng != other.rng)
            || (mask.contains(ChangeMask::DCD) && self.dcd != other.dcd)
            || (mask.contains(ChangeMask::BREAK) && self.brk != other.brk)
            || (mask.contains(ChangeMask::OVERRUN) && self.overrun != other.overrun)
            || (mask.contains(ChangeMask::FRAME) && self.frame != other.frame)
            || (mask.contains(ChangeMask::PARITY) && self.parity != other.parity)
    }
}

/// One decoded status frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusReport {
    /// New state of the input lines, if the frame carried a line update.
    pub lines: Option<ModemLines>,
    pub brk: bool,
    pub overrun: bool,
    pub frame: bool,
    pub parity: bool,
}

struct MonitorState {
    /// Present while no transfer owns it.
    buffer: Option<Box<[u8]>>,
    running: bool,
    disconnected: bool,
    counters: Counters,
    previous: Counters,
    lines_in: ModemLines,
    lines_out: ModemLines,
    carrier_hangup: bool,
}

pub(crate) struct StatusMonitor {
    state: spin::Mutex<MonitorState>,
    endpoint: EndpointAddress,
    size: usize,
    pub(crate) changed: WaitQueue,
}

impl StatusMonitor {
    pub(crate) fn new(endpoint: EndpointAddress, size: usize, carrier_hangup: bool) -> Self {
        Self {
            state: spin::Mutex::new(MonitorState {
                buffer: Some(vec![0u8; size].into_boxed_slice()),
                running: false,
                disconnected: false,
                counters: Counters::default(),
                previous: Counters::default(),
                lines_in: ModemLines::empty(),
                lines_out: ModemLines::empty(),
                carrier_hangup,
            }),
            endpoint,
            size,
            changed: WaitQueue::new(),
        }
    }

    /// Submit the interrupt transfer. A no-op if it is already outstanding.
    pub(crate) fn start(&self, session: &Arc<Shared>) -> core::result::Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.disconnected {
            return Err(TransportError::NoDevice);
        }
        let buffer = match state.buffer.take() {
            Some(buffer) => buffer,
            None => {
                state.running = true;
                return Ok(());
            }
        };
        let transfer = Transfer::new(
            TransferId::Status,
            self.endpoint,
            EndpointType::Interrupt,
            buffer,
            self.size,
            session.clone(),
        );
        match session.transport.submit(transfer) {
            Ok(()) => {
                state.running = true;
                Ok(())
            }
            Err(e) => {
                state.buffer = Some(e.transfer.into_buffer());
                state.running = false;
                Err(e.error)
            }
        }
    }

    /// Kill the outstanding transfer and keep it parked.
    pub(crate) fn stop(&self, session: &Shared) {
        self.state.lock().running = false;
        session.transport.cancel(TransferId::Status);
    }

    pub(crate) fn disconnect(&self) {
        {
            let mut state = self.state.lock();
            state.disconnected = true;
            state.running = false;
        }
        self.changed.wake_all();
    }

    pub(crate) fn on_complete(
        &self,
        session: &Arc<Shared>,
        mut transfer: Transfer,
        status: TransferStatus,
    ) {
        match status {
            TransferStatus::Completed => {}
            TransferStatus::Cancelled | TransferStatus::Shutdown => {
                trace!(?status, "status transfer terminated");
                self.state.lock().buffer = Some(transfer.into_buffer());
                return;
            }
            TransferStatus::Failed(e) => {
                debug!(error = %e, "status transfer failed, resubmitting");
                transfer.rearm();
                self.resubmit(session, transfer);
                return;
            }
        }

        let report = session.resolver.decode_status(transfer.received());
        let mut changed = false;
        let mut hangup = false;
        {
            let mut state = self.state.lock();
            match report {
                Some(report) => {
                    let before = state.counters;
                    if let Some(lines) = report.lines {
                        let lines = lines & ModemLines::INPUTS;
                        if state.carrier_hangup
                            && state.lines_in.contains(ModemLines::DCD)
                            && !lines.contains(ModemLines::DCD)
                        {
                            hangup = true;
                        }
                        let difference = lines ^ state.lines_in;
                        state.lines_in = lines;
                        let counters = &mut state.counters;
                        if difference.contains(ModemLines::CTS) {
                            counters.cts = counters.cts.wrapping_add(1);
                        }
                        if difference.contains(ModemLines::DSR) {
                            counters.dsr = counters.dsr.wrapping_add(1);
                        }
                        if difference.contains(ModemLines::RI) {
                            counters.rng = counters.rng.wrapping_add(1);
                        }
                        if difference.contains(ModemLines::DCD) {
                            counters.dcd = counters.dcd.wrapping_add(1);
                        }
                    }
                    let counters = &mut state.counters;
                    if report.brk {
                        counters.brk = counters.brk.wrapping_add(1);
                    }
                    if report.overrun {
                        counters.overrun = counters.overrun.wrapping_add(1);
                    }
                    if report.frame {
                        counters.frame = counters.frame.wrapping_add(1);
                    }
                    if report.parity {
                        counters.parity = counters.parity.wrapping_add(1);
                    }
                    if state.counters != before {
                        state.previous = before;
                        changed = true;
                    }
                }
                None => {
                    let counters = &mut state.counters;
                    counters.garbled = counters.garbled.wrapping_add(1);
                }
            }
        }

        if report.is_none() {
            let data = transfer.received();
            warn!(
                len = data.len(),
                data0 = ?data.first(),
                data1 = ?data.get(1),
                "unknown status frame"
            );
        }
        if changed {
            self.changed.wake_all();
        }
        if hangup {
            debug!("carrier lost, hanging up");
            session.sink.hangup(HangupReason::Carrier);
        }

        transfer.rearm();
        self.resubmit(session, transfer);
    }

    fn resubmit(&self, session: &Arc<Shared>, transfer: Transfer) {
        let mut state = self.state.lock();
        if !state.running || state.disconnected {
            state.buffer = Some(transfer.into_buffer());
            return;
        }
        let e = match session.transport.submit(transfer) {
            Ok(()) => return,
            Err(e) => e,
        };
        match session.transport.submit(e.transfer) {
            Ok(()) => {}
            Err(e) => {
                error!(error = %e.error, "status transfer resubmission failed");
                state.buffer = Some(e.transfer.into_buffer());
            }
        }
    }

    /// Block until a counter selected by `mask` moves away from `baseline`.
    pub(crate) fn wait_for_change(
        &self,
        mask: ChangeMask,
        baseline: Counters,
        deadline: Option<Instant>,
        interrupt: &InterruptToken<'_>,
    ) -> Result<Counters> {
        self.changed
            .wait_until(deadline, || {
                let state = self.state.lock();
                if state.counters.differs(&baseline, mask) {
                    return Some(Ok(state.counters));
                }
                if state.disconnected {
                    // Losing the device is a carrier loss for anyone watching DCD.
                    return Some(if mask.contains(ChangeMask::DCD) {
                        Ok(state.counters)
                    } else {
                        Err(Error::Gone)
                    });
                }
                drop(state);
                interrupt.is_raised().then_some(Err(Error::Interrupted))
            })
            .unwrap_or(Err(Error::Timeout))
    }

    pub(crate) fn counters(&self) -> Counters {
        self.state.lock().counters
    }

    /// The current counters and the snapshot taken before the latest change.
    pub(crate) fn snapshot(&self) -> (Counters, Counters) {
        let state = self.state.lock();
        (state.counters, state.previous)
    }

    pub(crate) fn account_rx(&self, n: usize) {
        let mut state = self.state.lock();
        state.counters.rx = state.counters.rx.wrapping_add(n as u64);
    }

    pub(crate) fn account_tx(&self, n: usize) {
        let mut state = self.state.lock();
        state.counters.tx = state.counters.tx.wrapping_add(n as u64);
    }

    /// Count inbound bytes the sink had no room for.
    pub(crate) fn account_buf_overrun(&self, n: usize) {
        let mut state = self.state.lock();
        state.counters.buf_overrun = state.counters.buf_overrun.wrapping_add(n as u32);
    }

    pub(crate) fn lines(&self) -> ModemLines {
        let state = self.state.lock();
        state.lines_in | state.lines_out
    }

    pub(crate) fn lines_out(&self) -> ModemLines {
        self.state.lock().lines_out
    }

    pub(crate) fn set_lines_out(&self, lines: ModemLines) {
        self.state.lock().lines_out = lines & ModemLines::OUTPUTS;
    }

    /// Replace the cached input lines with a value read back from the device.
    pub(crate) fn set_lines_in(&self, lines: ModemLines) {
        self.state.lock().lines_in = lines & ModemLines::INPUTS;
    }

    pub(crate) fn set_carrier_hangup(&self, enabled: bool) {
        self.state.lock().carrier_hangup = enabled;
    }

    #[cfg(test)]
    pub(crate) fn is_parked(&self) -> bool {
        self.state.lock().buffer.is_some()
    }
}
