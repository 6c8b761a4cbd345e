//! Device session: the state shared by the bus-side [`Device`](crate::Device), every
//! open [`SerialPort`](crate::SerialPort) and every in-flight [`Transfer`].
//!
//! The session lives as long as the longest of those holders. Completion callbacks
//! reach it through the `Arc` each transfer carries, so a transfer still owned by
//! the bus keeps the buffers it points into alive.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::{Endpoints, PortConfig};
use crate::error::{Error, Result};
use crate::lifecycle::{Lifecycle, Phase};
use crate::read_ring::ReadRing;
use crate::resolver::ConfigResolver;
use crate::sink::ReadSink;
use crate::status::StatusMonitor;
use crate::transport::{PowerRef, Transfer, TransferId, TransferStatus, Transport};
use crate::write_pool::WritePool;

pub(crate) struct Shared {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) resolver: Arc<dyn ConfigResolver>,
    pub(crate) sink: Arc<dyn ReadSink>,
    pub(crate) config: PortConfig,
    pub(crate) endpoints: Endpoints,

    pub(crate) writes: WritePool,
    pub(crate) reads: ReadRing,
    pub(crate) status: StatusMonitor,

    /// Serializes every state transition and every control request.
    pub(crate) lifecycle: Mutex<Lifecycle>,
    /// Mirror of the lifecycle phase, readable without the lock.
    phase: AtomicU8,
    disconnected: AtomicBool,
}

impl Shared {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn ConfigResolver>,
        sink: Arc<dyn ReadSink>,
        endpoints: Endpoints,
        config: PortConfig,
    ) -> Result<Self> {
        endpoints.validate()?;
        config.validate()?;

        let capacity = config.write_capacity(&endpoints);
        Ok(Self {
            writes: WritePool::new(endpoints.bulk_out, config.write_slots, capacity),
            reads: ReadRing::new(
                endpoints.bulk_in,
                config.read_slots,
                endpoints.bulk_in_size as usize,
            ),
            status: StatusMonitor::new(
                endpoints.interrupt_in,
                endpoints.interrupt_in_size as usize,
                config.carrier_hangup,
            ),
            transport,
            resolver,
            sink,
            config,
            endpoints,
            lifecycle: Mutex::new(Lifecycle::new(config.closing_wait)),
            phase: AtomicU8::new(Phase::Idle as u8),
            disconnected: AtomicBool::new(false),
        })
    }

    /// Completion entry point, called through [`Transfer::complete`].
    pub(crate) fn complete(self: &Arc<Self>, transfer: Transfer, status: TransferStatus) {
        match transfer.id() {
            TransferId::Write(_) => self.writes.on_complete(self, transfer, status),
            TransferId::Read(_) => self.reads.on_complete(self, transfer, status),
            TransferId::Status => self.status.on_complete(self, transfer, status),
        }
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Flip the disconnected flag. Returns `false` if it was already set.
    pub(crate) fn mark_disconnected(&self) -> bool {
        !self.disconnected.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn ensure_connected(&self) -> Result<()> {
        if self.is_disconnected() {
            Err(Error::Gone)
        } else {
            Ok(())
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Only called with the lifecycle lock held.
    pub(crate) fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Cancel every outstanding transfer and drop parked writes. Idempotent.
    pub(crate) fn stop_traffic(&self) {
        self.status.stop(self);
        self.writes.discard_parked();
        self.writes.cancel_in_flight(self);
        self.reads.stop(self);
    }

    /// Synchronous control request under a power reference.
    pub(crate) fn control(
        &self,
        setup: usb_device::control::Request,
        data: &mut [u8],
    ) -> Result<usize> {
        self.ensure_connected()?;
        let _power = PowerRef::acquire(&self.transport)?;
        let n = self
            .transport
            .control_transfer(setup, data, self.config.control_timeout)?;
        Ok(n)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        debug!("device session released");
    }
}
