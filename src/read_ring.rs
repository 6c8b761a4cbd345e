//! Read ring: a fixed set of bulk-in transfers kept perpetually in flight.
//!
//! Each slot is either free-for-resubmit (the ring holds its buffer) or owned by a
//! transfer. Bytes from one slot reach the sink in that slot's completion order.
//! Nothing orders completions of different slots against each other: if the
//! transport completes slot 1 before slot 0, the sink sees slot 1's bytes first.

use std::sync::Arc;

use tracing::{debug, error, trace};
use usb_device::endpoint::{EndpointAddress, EndpointType};

use crate::error::TransportError;
use crate::session::Shared;
use crate::transport::{Transfer, TransferId, TransferStatus};

struct RingState {
    /// `Some` while the slot is free for resubmission.
    slots: Vec<Option<Box<[u8]>>>,
    running: bool,
    disconnected: bool,
}

pub(crate) struct ReadRing {
    state: spin::Mutex<RingState>,
    endpoint: EndpointAddress,
    size: usize,
}

impl ReadRing {
    pub(crate) fn new(endpoint: EndpointAddress, slots: usize, size: usize) -> Self {
        Self {
            state: spin::Mutex::new(RingState {
                slots: (0..slots)
                    .map(|_| Some(vec![0u8; size].into_boxed_slice()))
                    .collect(),
                running: false,
                disconnected: false,
            }),
            endpoint,
            size,
        }
    }

    /// Submit every free slot. Stops at the first failure; slots already submitted
    /// stay in flight for the caller to cancel.
    pub(crate) fn start(&self, session: &Arc<Shared>) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.disconnected {
            return Err(TransportError::NoDevice);
        }
        state.running = true;
        for index in 0..state.slots.len() {
            let buffer = match state.slots[index].take() {
                Some(buffer) => buffer,
                None => continue,
            };
            let transfer = self.transfer(session, index, buffer);
            if let Err(e) = session.transport.submit(transfer) {
                error!(slot = index, error = %e.error, "read submission failed");
                state.slots[index] = Some(e.transfer.into_buffer());
                return Err(e.error);
            }
        }
        Ok(())
    }

    /// Stop resubmitting and kill every outstanding read.
    pub(crate) fn stop(&self, session: &Shared) {
        let count = {
            let mut state = self.state.lock();
            state.running = false;
            state.slots.len()
        };
        for index in 0..count {
            session.transport.cancel(TransferId::Read(index));
        }
    }

    pub(crate) fn disconnect(&self) {
        let mut state = self.state.lock();
        state.disconnected = true;
        state.running = false;
    }

    fn transfer(&self, session: &Arc<Shared>, index: usize, buffer: Box<[u8]>) -> Transfer {
        Transfer::new(
            TransferId::Read(index),
            self.endpoint,
            EndpointType::Bulk,
            buffer,
            self.size,
            session.clone(),
        )
    }

    pub(crate) fn on_complete(
        &self,
        session: &Arc<Shared>,
        mut transfer: Transfer,
        status: TransferStatus,
    ) {
        let index = match transfer.id() {
            TransferId::Read(index) => index,
            _ => return,
        };

        match status {
            TransferStatus::Completed if !session.is_disconnected() => {}
            TransferStatus::Completed => {
                debug!(slot = index, "read completed after disconnect");
                self.park(index, transfer);
                return;
            }
            TransferStatus::Cancelled | TransferStatus::Shutdown => {
                trace!(slot = index, ?status, "read terminated");
                self.park(index, transfer);
                return;
            }
            TransferStatus::Failed(e) => {
                debug!(slot = index, error = %e, "read failed, slot parked");
                self.park(index, transfer);
                return;
            }
        }

        let received = transfer.received();
        if !received.is_empty() {
            session.status.account_rx(received.len());
            let accepted = session.sink.deliver(received);
            if accepted < received.len() {
                session.status.account_buf_overrun(received.len() - accepted);
            }
        }

        transfer.rearm();
        self.resubmit(session, index, transfer);
    }

    fn park(&self, index: usize, transfer: Transfer) {
        self.state.lock().slots[index] = Some(transfer.into_buffer());
    }

    fn resubmit(&self, session: &Arc<Shared>, index: usize, transfer: Transfer) {
        let mut state = self.state.lock();
        if !state.running || state.disconnected {
            state.slots[index] = Some(transfer.into_buffer());
            return;
        }
        let e = match session.transport.submit(transfer) {
            Ok(()) => return,
            Err(e) => e,
        };
        if let Err(e) = session.transport.submit(e.transfer) {
            error!(slot = index, error = %e.error, "read resubmission failed, slot parked");
            state.slots[index] = Some(e.transfer.into_buffer());
        }
    }

    /// Slots currently free for resubmission.
    #[cfg(test)]
    pub(crate) fn parked(&self) -> usize {
        self.state.lock().slots.iter().filter(|slot| slot.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial_port::Device;
    use crate::sink::BufferedSink;
    use crate::testing::{config, endpoints, fixture, resolver, Kind, MockTransport};

    #[test]
    fn open_submits_every_slot() {
        let f = fixture(config().with_read_slots(3));
        let _port = f.device.open().unwrap();

        assert_eq!(f.transport.in_flight(Kind::Read), 3);
        assert_eq!(f.device.session().reads.parked(), 0);
    }

    #[test]
    fn completed_read_is_delivered_and_resubmitted() {
        let f = fixture(config());
        let _port = f.device.open().unwrap();

        assert!(f
            .transport
            .complete(TransferId::Read(0), TransferStatus::Completed, b"abc"));
        assert_eq!(f.sink.data(), b"abc");
        assert!(f.transport.is_in_flight(TransferId::Read(0)));
        assert_eq!(f.device.counters().rx, 3);
    }

    #[test]
    fn slots_deliver_in_completion_order() {
        let f = fixture(config());
        let _port = f.device.open().unwrap();

        f.transport
            .complete(TransferId::Read(1), TransferStatus::Completed, b"B");
        f.transport
            .complete(TransferId::Read(0), TransferStatus::Completed, b"A");
        assert_eq!(f.sink.data(), b"BA");
    }

    #[test]
    fn zero_length_read_delivers_nothing() {
        let f = fixture(config());
        let _port = f.device.open().unwrap();

        f.transport
            .complete(TransferId::Read(0), TransferStatus::Completed, &[]);
        assert_eq!(f.sink.chunks(), 0);
        assert!(f.transport.is_in_flight(TransferId::Read(0)));
    }

    #[test]
    fn failed_read_parks_its_slot() {
        let f = fixture(config());
        let _port = f.device.open().unwrap();

        f.transport.complete(
            TransferId::Read(0),
            TransferStatus::Failed(TransportError::Protocol(-71)),
            &[],
        );
        assert!(!f.transport.is_in_flight(TransferId::Read(0)));
        assert!(f.transport.is_in_flight(TransferId::Read(1)));
        assert_eq!(f.device.session().reads.parked(), 1);
    }

    #[test]
    fn resubmission_is_retried_once() {
        let f = fixture(config());
        let _port = f.device.open().unwrap();

        f.transport.fail_next(Kind::Read, TransportError::NoMemory);
        f.transport
            .complete(TransferId::Read(0), TransferStatus::Completed, b"x");
        assert!(f.transport.is_in_flight(TransferId::Read(0)));

        f.transport.fail_next(Kind::Read, TransportError::NoMemory);
        f.transport.fail_next(Kind::Read, TransportError::NoMemory);
        f.transport
            .complete(TransferId::Read(0), TransferStatus::Completed, b"y");
        assert!(!f.transport.is_in_flight(TransferId::Read(0)));
        assert_eq!(f.device.session().reads.parked(), 1);
        assert_eq!(f.sink.data(), b"xy");
    }

    #[test]
    fn disconnect_stops_the_ring() {
        let f = fixture(config());
        let _port = f.device.open().unwrap();

        f.device.disconnect();
        assert_eq!(f.transport.in_flight(Kind::Read), 0);
        assert_eq!(f.device.session().reads.parked(), 2);
    }

    #[test]
    fn bytes_the_sink_refuses_are_counted() {
        let transport = MockTransport::new();
        let sink = Arc::new(BufferedSink::new(4));
        let device = Device::probe(
            transport.clone(),
            Arc::new(resolver()),
            sink.clone(),
            endpoints(),
            config(),
        )
        .unwrap();
        let _port = device.open().unwrap();

        transport.complete(TransferId::Read(0), TransferStatus::Completed, b"abcdef");
        let counters = device.counters();
        assert_eq!(counters.rx, 6);
        assert_eq!(counters.buf_overrun, 2);
        assert_eq!(sink.available(), 4);
        assert!(transport.is_in_flight(TransferId::Read(0)));
    }
}
