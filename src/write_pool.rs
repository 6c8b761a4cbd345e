//! Transfer buffer pool: a fixed set of write slots turning variable-size writes into
//! bounded, back-pressured bulk-out transfers.
//!
//! A slot moves `Free → Claimed → Submitted → Free`. While the port is suspended a
//! claimed slot is `Parked` instead and submitted on resume, in claim order. Only
//! the transfer's completion returns a submitted slot to `Free`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, trace, warn};
use usb_device::endpoint::{EndpointAddress, EndpointType};

use crate::error::{Error, Result, TransportError};
use crate::session::Shared;
use crate::sync::{InterruptToken, WaitQueue};
use crate::transport::{PowerRef, Transfer, TransferId, TransferStatus};

/// Where a write slot is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Claimed,
    /// Filled while suspended; waits for resume.
    Parked,
    Submitted,
}

struct WriteSlot {
    state: SlotState,
    /// Present unless the transport owns it.
    buffer: Option<Box<[u8]>>,
    len: usize,
    /// Power reference held for the lifetime of the write.
    power: Option<PowerRef>,
}

struct PoolState {
    slots: Vec<WriteSlot>,
    /// Round-robin scan start: one past the last granted slot.
    next: usize,
    /// Slots handed to the transport and not yet completed.
    transmitting: usize,
    suspend_depth: usize,
    parked: VecDeque<usize>,
    disconnected: bool,
}

impl PoolState {
    fn claim(&mut self) -> Option<usize> {
        let n = self.slots.len();
        for attempt in 0..n {
            let index = (self.next + attempt) % n;
            let slot = &mut self.slots[index];
            if slot.state == SlotState::Free {
                slot.state = SlotState::Claimed;
                self.next = (index + 1) % n;
                return Some(index);
            }
        }
        None
    }

    /// Return a slot to the pool, handing back its power reference so the caller
    /// can drop it outside the lock.
    fn release(&mut self, index: usize, buffer: Option<Box<[u8]>>) -> Option<PowerRef> {
        let slot = &mut self.slots[index];
        if slot.state == SlotState::Submitted {
            debug_assert!(self.transmitting > 0);
            self.transmitting -= 1;
        }
        if let Some(buffer) = buffer {
            slot.buffer = Some(buffer);
        }
        slot.state = SlotState::Free;
        slot.len = 0;
        slot.power.take()
    }
}

pub(crate) struct WritePool {
    state: spin::Mutex<PoolState>,
    endpoint: EndpointAddress,
    capacity: usize,
    pub(crate) available: WaitQueue,
}

impl WritePool {
    pub(crate) fn new(endpoint: EndpointAddress, slots: usize, capacity: usize) -> Self {
        let slots = (0..slots)
            .map(|_| WriteSlot {
                state: SlotState::Free,
                buffer: Some(vec![0u8; capacity].into_boxed_slice()),
                len: 0,
                power: None,
            })
            .collect();
        Self {
            state: spin::Mutex::new(PoolState {
                slots,
                next: 0,
                transmitting: 0,
                suspend_depth: 0,
                parked: VecDeque::new(),
                disconnected: false,
            }),
            endpoint,
            capacity,
            available: WaitQueue::new(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Claim a free slot, waiting until `deadline` for one to be released.
    pub(crate) fn acquire_slot(
        &self,
        deadline: Option<Instant>,
        interrupt: &InterruptToken<'_>,
    ) -> Result<usize> {
        self.available
            .wait_until(deadline, || {
                let mut state = self.state.lock();
                if state.disconnected {
                    return Some(Err(Error::Gone));
                }
                if let Some(index) = state.claim() {
                    return Some(Ok(index));
                }
                drop(state);
                interrupt.is_raised().then_some(Err(Error::Interrupted))
            })
            .unwrap_or(Err(Error::Timeout))
    }

    /// Claim a free slot without waiting.
    pub(crate) fn try_acquire_slot(&self) -> Result<usize> {
        let mut state = self.state.lock();
        if state.disconnected {
            return Err(Error::Gone);
        }
        state.claim().ok_or(Error::Busy)
    }

    /// Block until every slot is free again.
    pub(crate) fn wait_idle(&self, deadline: Option<Instant>) -> Result<()> {
        self.available
            .wait_until(deadline, || {
                let state = self.state.lock();
                if state.disconnected {
                    Some(Err(Error::Gone))
                } else if state.slots.iter().all(|slot| slot.state == SlotState::Free) {
                    Some(Ok(()))
                } else {
                    None
                }
            })
            .unwrap_or(Err(Error::Timeout))
    }

    /// Give back a claimed slot that was never submitted.
    pub(crate) fn unclaim(&self, index: usize) {
        let power = self.state.lock().release(index, None);
        drop(power);
        self.available.wake_all();
    }

    /// Fill a claimed slot with up to `capacity` bytes of `data` and submit it, or
    /// park it while suspended. Returns the number of bytes accepted.
    pub(crate) fn submit(&self, session: &Arc<Shared>, index: usize, data: &[u8]) -> Result<usize> {
        let count = data.len().min(self.capacity);

        let power = match PowerRef::acquire_async(&session.transport) {
            Ok(power) => power,
            Err(e) => {
                self.unclaim(index);
                return Err(e.into());
            }
        };

        let mut state = self.state.lock();
        if state.disconnected {
            let stale = state.release(index, None);
            drop(state);
            drop(stale);
            drop(power);
            self.available.wake_all();
            return Err(Error::Gone);
        }

        let slot = &mut state.slots[index];
        let mut buffer = match (slot.state, slot.buffer.take()) {
            (SlotState::Claimed, Some(buffer)) => buffer,
            (_, buffer) => {
                slot.buffer = buffer;
                return Err(Error::Invalid("write slot is not claimed"));
            }
        };
        buffer[..count].copy_from_slice(&data[..count]);
        slot.len = count;
        slot.power = Some(power);

        if state.suspend_depth > 0 {
            let slot = &mut state.slots[index];
            slot.state = SlotState::Parked;
            slot.buffer = Some(buffer);
            state.parked.push_back(index);
            trace!(slot = index, len = count, "write parked while suspended");
            return Ok(count);
        }

        let result = self.start(&mut state, session, index, buffer, count);
        drop(state);
        match result {
            Ok(()) => Ok(count),
            Err((e, power)) => {
                drop(power);
                self.available.wake_all();
                Err(e.into())
            }
        }
    }

    /// Hand a filled slot to the transport. On failure the slot is already free again
    /// and its power reference is returned for dropping outside the lock.
    fn start(
        &self,
        state: &mut PoolState,
        session: &Arc<Shared>,
        index: usize,
        buffer: Box<[u8]>,
        len: usize,
    ) -> core::result::Result<(), (TransportError, Option<PowerRef>)> {
        state.transmitting += 1;
        state.slots[index].state = SlotState::Submitted;
        let transfer = Transfer::new(
            TransferId::Write(index),
            self.endpoint,
            EndpointType::Bulk,
            buffer,
            len,
            session.clone(),
        );
        match session.transport.submit(transfer) {
            Ok(()) => {
                trace!(slot = index, len, "write submitted");
                Ok(())
            }
            Err(e) => {
                error!(slot = index, error = %e.error, "write submission failed");
                let power = state.release(index, Some(e.transfer.into_buffer()));
                Err((e.error, power))
            }
        }
    }

    pub(crate) fn on_complete(&self, session: &Shared, transfer: Transfer, status: TransferStatus) {
        let index = match transfer.id() {
            TransferId::Write(index) => index,
            _ => return,
        };
        let actual = transfer.actual_length();
        if status != TransferStatus::Completed || actual != transfer.len() {
            debug!(slot = index, actual, len = transfer.len(), ?status, "short or failed write");
        }

        let power = self.state.lock().release(index, Some(transfer.into_buffer()));
        drop(power);

        // Whatever moved before a failure or cancel still went out on the wire.
        session.status.account_tx(actual);
        self.available.wake_all();
        session.sink.write_wakeup();
    }

    /// Kill every submitted write. Each completion frees its own slot.
    pub(crate) fn cancel_in_flight(&self, session: &Shared) {
        for index in 0..self.slot_count() {
            session.transport.cancel(TransferId::Write(index));
        }
    }

    /// Drop writes parked during suspension. They were never sent.
    pub(crate) fn discard_parked(&self) {
        let released: Vec<Option<PowerRef>> = {
            let mut state = self.state.lock();
            let parked: Vec<usize> = state.parked.drain(..).collect();
            parked.into_iter().map(|index| state.release(index, None)).collect()
        };
        if !released.is_empty() {
            debug!(count = released.len(), "discarded parked writes");
        }
        drop(released);
        self.available.wake_all();
    }

    /// Count a suspend. Returns the depth before this call.
    pub(crate) fn suspend(&self, auto: bool) -> Result<usize> {
        let mut state = self.state.lock();
        if auto && state.transmitting > 0 {
            return Err(Error::Busy);
        }
        let depth = state.suspend_depth;
        state.suspend_depth += 1;
        Ok(depth)
    }

    /// Count a resume. When the depth reaches zero and `flush` is set, parked writes
    /// are submitted in the order they were accepted, before any new write can slip
    /// in ahead of them. Returns the new depth.
    pub(crate) fn resume(&self, session: &Arc<Shared>, flush: bool) -> usize {
        let mut released = Vec::new();
        let depth = {
            let mut state = self.state.lock();
            if state.suspend_depth == 0 {
                warn!("resume without matching suspend");
                return 0;
            }
            state.suspend_depth -= 1;
            if state.suspend_depth == 0 && flush {
                while let Some(index) = state.parked.pop_front() {
                    let slot = &mut state.slots[index];
                    let len = slot.len;
                    let buffer = match slot.buffer.take() {
                        Some(buffer) => buffer,
                        None => continue,
                    };
                    if let Err((_, power)) = self.start(&mut state, session, index, buffer, len) {
                        released.push(power);
                    }
                }
            }
            state.suspend_depth
        };
        if !released.is_empty() {
            drop(released);
            self.available.wake_all();
        }
        depth
    }

    pub(crate) fn disconnect(&self) {
        self.state.lock().disconnected = true;
        self.available.wake_all();
    }

    pub(crate) fn suspend_depth(&self) -> usize {
        self.state.lock().suspend_depth
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.state.lock().transmitting
    }

    pub(crate) fn slot_count(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub(crate) fn slot_states(&self) -> Vec<SlotState> {
        self.state.lock().slots.iter().map(|slot| slot.state).collect()
    }

    /// Room for one more write: a full slot if any is free.
    pub(crate) fn write_room(&self) -> usize {
        let state = self.state.lock();
        if state.slots.iter().any(|slot| slot.state == SlotState::Free) {
            self.capacity
        } else {
            0
        }
    }

    /// Bytes the pool may still be holding, counted in whole slots.
    pub(crate) fn chars_in_buffer(&self) -> usize {
        let state = self.state.lock();
        if state.disconnected {
            return 0;
        }
        let busy = state
            .slots
            .iter()
            .filter(|slot| slot.state != SlotState::Free)
            .count();
        busy * self.capacity
    }
}
