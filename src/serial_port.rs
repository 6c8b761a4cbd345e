use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;
use usb_device::control::Request;
use usb_device::UsbDirection;

use crate::config::{Endpoints, PortConfig};
use crate::error::{Error, Result};
use crate::lifecycle::PortState;
use crate::resolver::ConfigResolver;
use crate::session::Shared;
use crate::sink::ReadSink;
use crate::status::{ChangeMask, Counters, ModemLines};
use crate::sync::Interrupter;
use crate::transport::Transport;
use crate::write_pool::SlotState;

/// The bus-side handle of one attached serial function.
///
/// Created when the function is bound, dropped (or [`disconnect`](Self::disconnect)ed)
/// when it leaves the bus. Consumers reach the port through [`Device::open`].
pub struct Device {
    shared: Arc<Shared>,
}

impl Device {
    /// Bind a serial function. Allocates every slot up front; nothing is submitted
    /// until the first [`open`](Self::open).
    pub fn probe(
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn ConfigResolver>,
        sink: Arc<dyn ReadSink>,
        endpoints: Endpoints,
        config: PortConfig,
    ) -> Result<Device> {
        let shared = Shared::new(transport, resolver, sink, endpoints, config)?;
        debug!(
            write_slots = shared.config.write_slots,
            read_slots = shared.config.read_slots,
            capacity = shared.writes.capacity(),
            "serial function bound"
        );
        Ok(Device {
            shared: Arc::new(shared),
        })
    }

    /// Open the port. The first open starts status and read traffic; later opens
    /// only add a reference.
    pub fn open(&self) -> Result<SerialPort> {
        self.shared.open()?;
        Ok(SerialPort {
            shared: self.shared.clone(),
            interrupter: Interrupter::new(),
            last_seen: Mutex::new(self.shared.status.counters()),
            closed: false,
        })
    }

    /// The function left the bus. Every blocked caller is woken with
    /// [`Error::Gone`]; the session itself lives on until the last handle drops.
    pub fn disconnect(&self) {
        self.shared.disconnect();
    }

    /// Power-management suspend. Nested calls only count.
    ///
    /// An automatic suspend fails with [`Error::Busy`] while writes are in flight.
    pub fn suspend(&self, auto: bool) -> Result<()> {
        self.shared.suspend(auto)
    }

    /// Undo one [`suspend`](Self::suspend). The last one restarts traffic and
    /// flushes writes accepted while suspended, in order.
    pub fn resume(&self) -> Result<()> {
        self.shared.resume()
    }

    /// Resume after the device was reset while suspended.
    pub fn reset_resume(&self) -> Result<()> {
        self.shared.reset_resume()
    }

    pub fn state(&self) -> PortState {
        self.shared.state()
    }

    pub fn open_count(&self) -> usize {
        self.shared.open_count()
    }

    pub fn counters(&self) -> Counters {
        self.shared.status.counters()
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.shared.endpoints
    }

    pub fn config(&self) -> &PortConfig {
        &self.shared.config
    }

    /// Per-slot view of the write pool.
    pub fn write_slots(&self) -> Vec<SlotState> {
        self.shared.writes.slot_states()
    }

    #[cfg(test)]
    pub(crate) fn session(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.shared.disconnect();
    }
}

/// An open port. Closing (or dropping) the last one shuts the port down.
///
/// All methods take `&self`; share the handle across threads to have one thread
/// [`interrupt`](Self::interrupt) another that is blocked in it.
pub struct SerialPort {
    shared: Arc<Shared>,
    interrupter: Interrupter,
    /// Counters this handle last returned from a change wait.
    last_seen: Mutex<Counters>,
    closed: bool,
}

impl SerialPort {
    /// Writes up to one slot's worth of `data` and returns the number of bytes
    /// accepted. Blocks for a free slot until the configured write timeout.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        self.shared.ensure_connected()?;
        let interrupt = self.interrupter.arm();
        let deadline = Instant::now() + self.shared.config.write_timeout;
        let slot = self.shared.writes.acquire_slot(Some(deadline), &interrupt)?;
        self.shared.writes.submit(&self.shared, slot, data)
    }

    /// Like [`write`](Self::write), but fails with [`Error::Busy`] instead of
    /// waiting for a slot.
    pub fn try_write(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let slot = self.shared.writes.try_acquire_slot()?;
        self.shared.writes.submit(&self.shared, slot, data)
    }

    /// Wait until every accepted write has completed.
    pub fn flush(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.shared.writes.wait_idle(deadline)
    }

    /// Bytes a single write could accept right now.
    pub fn write_room(&self) -> usize {
        if self.shared.is_disconnected() {
            return 0;
        }
        self.shared.writes.write_room()
    }

    /// Upper bound on bytes accepted but not yet completed.
    pub fn chars_in_buffer(&self) -> usize {
        self.shared.writes.chars_in_buffer()
    }

    /// Largest number of bytes one write accepts.
    pub fn write_capacity(&self) -> usize {
        self.shared.writes.capacity()
    }

    /// Current modem lines: the outputs last driven plus the inputs last reported.
    pub fn modem_lines(&self) -> Result<ModemLines> {
        self.shared.ensure_connected()?;
        if let Some((query, len)) = self.shared.resolver.modem_status_query() {
            let _life = self.shared.lifecycle.lock();
            let mut reply = vec![0u8; len as usize];
            let n = self.shared.control(query.input(len), &mut reply)?;
            match self.shared.resolver.decode_modem_status(&reply[..n]) {
                Some(lines) => self.shared.status.set_lines_in(lines),
                None => debug!(len = n, "undecodable modem status reply"),
            }
        }
        Ok(self.shared.status.lines())
    }

    /// Raise the output lines in `set` and drop those in `clear`.
    pub fn set_modem_lines(&self, set: ModemLines, clear: ModemLines) -> Result<()> {
        let _life = self.shared.lifecycle.lock();
        self.shared.ensure_connected()?;
        let current = self.shared.status.lines_out();
        let lines = ((current - clear) | set) & ModemLines::OUTPUTS;
        if lines == current {
            return Ok(());
        }
        self.shared.apply_lines(lines)
    }

    /// Start or stop a break condition.
    pub fn send_break(&self, on: bool) -> Result<()> {
        let _life = self.shared.lifecycle.lock();
        self.shared.ensure_connected()?;
        let command = self
            .shared
            .resolver
            .break_control(on)
            .ok_or(Error::Invalid("break not supported"))?;
        self.shared.vendor_out(command)
    }

    /// Block until one of the counters selected by `mask` differs from the values
    /// this handle last observed.
    ///
    /// A disconnect counts as a carrier change when `mask` includes DCD and fails
    /// with [`Error::Gone`] otherwise.
    pub fn wait_for_change(&self, mask: ChangeMask, timeout: Option<Duration>) -> Result<Counters> {
        if mask.is_empty() {
            return Err(Error::Invalid("empty change mask"));
        }
        let interrupt = self.interrupter.arm();
        let baseline = *self.last_seen.lock();
        let deadline = timeout.map(|t| Instant::now() + t);
        let counters = self
            .shared
            .status
            .wait_for_change(mask, baseline, deadline, &interrupt)?;
        *self.last_seen.lock() = counters;
        Ok(counters)
    }

    /// Counters as of the latest status event, and as they were just before it.
    pub fn last_change(&self) -> (Counters, Counters) {
        self.shared.status.snapshot()
    }

    pub fn counters(&self) -> Counters {
        self.shared.status.counters()
    }

    /// Wake a thread blocked in [`write`](Self::write) or
    /// [`wait_for_change`](Self::wait_for_change) on this handle with
    /// [`Error::Interrupted`].
    ///
    /// Only waits already in progress are affected; later calls block as usual.
    pub fn interrupt(&self) {
        self.interrupter.raise();
        self.shared.writes.available.wake_all();
        self.shared.status.changed.wake_all();
    }

    /// Hang the consumer up when carrier detect drops.
    pub fn set_carrier_hangup(&self, enabled: bool) {
        self.shared.status.set_carrier_hangup(enabled);
    }

    /// How long the last close waits for in-flight writes before cancelling them.
    pub fn closing_wait(&self) -> Option<Duration> {
        self.shared.lifecycle.lock().closing_wait
    }

    pub fn set_closing_wait(&self, wait: Option<Duration>) {
        self.shared.lifecycle.lock().closing_wait = wait;
    }

    /// Pass a control request through to the device.
    ///
    /// `data` must be exactly `setup.length` bytes and no longer than the configured
    /// limit. Returns the bytes transferred; an OUT request moving fewer bytes than
    /// requested fails with [`Error::Invalid`].
    pub fn raw_control_transfer(&self, setup: Request, data: &mut [u8]) -> Result<usize> {
        let length = setup.length as usize;
        if length != data.len() {
            return Err(Error::Invalid("control buffer does not match setup length"));
        }
        if length > self.shared.config.max_control_len {
            return Err(Error::Invalid("control transfer too long"));
        }

        let _life = self.shared.lifecycle.lock();
        self.shared.ensure_connected()?;
        let n = self.shared.control(setup, data)?;
        if setup.direction == UsbDirection::Out && n != length {
            return Err(Error::Invalid("short control write"));
        }
        Ok(n)
    }

    pub fn state(&self) -> PortState {
        self.shared.state()
    }

    /// Close the port. Same as dropping it.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shared.close();
    }
}

impl Drop for SerialPort {
    fn drop(&mut self) {
        self.release();
    }
}
