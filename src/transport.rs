//! The bus-facing seam: asynchronous transfers, synchronous control requests and
//! power-management references.
//!
//! A [`Transfer`] owns its buffer for as long as the transport holds it. The core
//! moves a slot's buffer into a `Transfer` on submission and gets it back when the
//! transport calls [`Transfer::complete`], so a slot can never be touched by the
//! core while the bus is still using it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use usb_device::control::Request;
use usb_device::endpoint::{EndpointAddress, EndpointType};

use crate::error::TransportError;
use crate::session::Shared;

/// Identifies which core-owned transfer a [`Transfer`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferId {
    /// Write slot `n` of the transfer buffer pool.
    Write(usize),
    /// Read slot `n` of the read ring.
    Read(usize),
    /// The status monitor's interrupt transfer.
    Status,
}

/// Outcome of a transfer, reported by the transport on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// The transfer finished; `actual_length` bytes moved.
    Completed,
    /// Killed by [`Transport::cancel`].
    Cancelled,
    /// The endpoint or device is going away.
    Shutdown,
    /// Any other bus error.
    Failed(TransportError),
}

impl TransferStatus {
    /// The transfer was terminated and must not be resubmitted.
    pub fn is_terminated(&self) -> bool {
        matches!(self, TransferStatus::Cancelled | TransferStatus::Shutdown)
    }
}

/// One asynchronous bus operation.
pub struct Transfer {
    id: TransferId,
    endpoint: EndpointAddress,
    kind: EndpointType,
    buffer: Box<[u8]>,
    length: usize,
    actual: usize,
    session: Arc<Shared>,
}

impl Transfer {
    pub(crate) fn new(
        id: TransferId,
        endpoint: EndpointAddress,
        kind: EndpointType,
        buffer: Box<[u8]>,
        length: usize,
        session: Arc<Shared>,
    ) -> Self {
        debug_assert!(length <= buffer.len());
        Self {
            id,
            endpoint,
            kind,
            buffer,
            length,
            actual: 0,
            session,
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn endpoint(&self) -> EndpointAddress {
        self.endpoint
    }

    pub fn kind(&self) -> EndpointType {
        self.kind
    }

    /// Requested transfer length.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Payload of an OUT transfer.
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.length]
    }

    /// Receive area of an IN transfer.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[..self.length]
    }

    /// Record how many bytes actually moved. Clamped to the requested length.
    pub fn set_actual_length(&mut self, actual: usize) {
        self.actual = actual.min(self.length);
    }

    pub fn actual_length(&self) -> usize {
        self.actual
    }

    /// Bytes received by a completed IN transfer.
    pub fn received(&self) -> &[u8] {
        &self.buffer[..self.actual]
    }

    /// Hand the transfer back to the core. This is the completion callback; it runs
    /// on whatever thread the transport calls it from and never sleeps.
    pub fn complete(self, status: TransferStatus) {
        let session = self.session.clone();
        session.complete(self, status);
    }

    /// Prepare the same transfer for resubmission.
    pub(crate) fn rearm(&mut self) {
        self.actual = 0;
    }

    pub(crate) fn into_buffer(self) -> Box<[u8]> {
        self.buffer
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("kind", &self.kind)
            .field("length", &self.length)
            .field("actual", &self.actual)
            .finish()
    }
}

/// A rejected submission. The transfer comes back so its buffer is not lost.
#[derive(Debug)]
pub struct SubmitError {
    pub transfer: Transfer,
    pub error: TransportError,
}

/// A USB function as seen by the core.
///
/// Implementations must uphold two rules: `submit` never completes a transfer on
/// the calling thread, and `cancel` does not return until the cancelled transfer's
/// [`Transfer::complete`] has finished running. Neither may call back into the
/// port's power hooks.
pub trait Transport: Send + Sync {
    /// Queue an asynchronous transfer.
    fn submit(&self, transfer: Transfer) -> Result<(), SubmitError>;

    /// Kill the transfer with this id, if it is in flight.
    fn cancel(&self, id: TransferId);

    /// Synchronous control request on the default pipe. Returns the bytes moved.
    fn control_transfer(
        &self,
        setup: Request,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Take a power reference, resuming the function if needed. May sleep.
    fn autopm_get(&self) -> Result<(), TransportError>;

    /// Take a power reference without sleeping.
    fn autopm_get_async(&self) -> Result<(), TransportError> {
        self.autopm_get()
    }

    fn autopm_put(&self);

    /// Drop a power reference without sleeping.
    fn autopm_put_async(&self) {
        self.autopm_put()
    }
}

/// A held power reference. Dropping it releases the reference exactly once.
pub(crate) struct PowerRef {
    transport: Arc<dyn Transport>,
    deferred: bool,
}

impl PowerRef {
    pub(crate) fn acquire(
        transport: &Arc<dyn Transport>,
    ) -> Result<Self, TransportError> {
        transport.autopm_get()?;
        Ok(Self {
            transport: transport.clone(),
            deferred: false,
        })
    }

    /// Non-sleeping variant used on the write path.
    pub(crate) fn acquire_async(
        transport: &Arc<dyn Transport>,
    ) -> Result<Self, TransportError> {
        transport.autopm_get_async()?;
        Ok(Self {
            transport: transport.clone(),
            deferred: true,
        })
    }
}

impl Drop for PowerRef {
    fn drop(&mut self) {
        if self.deferred {
            self.transport.autopm_put_async();
        } else {
            self.transport.autopm_put();
        }
    }
}

/// Packs a setup packet's `bmRequestType`.
pub fn request_type_byte(setup: &Request) -> u8 {
    (setup.direction as u8) | ((setup.request_type as u8) << 5) | (setup.recipient as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use usb_device::control::{Recipient, RequestType};
    use usb_device::UsbDirection;

    #[test]
    fn vendor_in_request_type() {
        let setup = Request {
            direction: UsbDirection::In,
            request_type: RequestType::Vendor,
            recipient: Recipient::Device,
            request: 0x95,
            value: 0,
            index: 0,
            length: 2,
        };
        assert_eq!(request_type_byte(&setup), 0xc0);
    }

    #[test]
    fn class_out_interface_request_type() {
        let setup = Request {
            direction: UsbDirection::Out,
            request_type: RequestType::Class,
            recipient: Recipient::Interface,
            request: 0x22,
            value: 0,
            index: 0,
            length: 0,
        };
        assert_eq!(request_type_byte(&setup), 0x21);
    }

    #[test]
    fn terminated_statuses() {
        assert!(TransferStatus::Cancelled.is_terminated());
        assert!(TransferStatus::Shutdown.is_terminated());
        assert!(!TransferStatus::Completed.is_terminated());
        assert!(!TransferStatus::Failed(TransportError::Stall).is_terminated());
    }
}
