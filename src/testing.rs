//! Test doubles: an in-memory transport whose transfers complete only when a test
//! says so, and a sink that records everything it is handed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use usb_device::control::Request;
use usb_device::endpoint::EndpointAddress;
use usb_device::UsbDirection;

use crate::config::{Endpoints, PortConfig};
use crate::error::TransportError;
use crate::resolver::{event, FrameLayout, ModemControlTable, TableResolver, VendorCommand};
use crate::serial_port::Device;
use crate::sink::{HangupReason, ReadSink};
use crate::status::ModemLines;
use crate::transport::{SubmitError, Transfer, TransferId, TransferStatus, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Write,
    Read,
    Status,
}

fn kind_of(id: TransferId) -> Kind {
    match id {
        TransferId::Write(_) => Kind::Write,
        TransferId::Read(_) => Kind::Read,
        TransferId::Status => Kind::Status,
    }
}

#[derive(Default)]
struct MockState {
    in_flight: Vec<Transfer>,
    submissions: Vec<TransferId>,
    /// Payload of every accepted write, in submission order.
    written: Vec<Vec<u8>>,
    /// Refuse the next submission of a kind, once per entry.
    failures: Vec<(Kind, TransportError)>,
    controls: Vec<Request>,
    control_reply: Vec<u8>,
    control_error: Option<TransportError>,
    short_control_writes: bool,
}

#[derive(Default)]
pub(crate) struct MockTransport {
    state: Mutex<MockState>,
    power_gets: AtomicUsize,
    power_puts: AtomicUsize,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Complete the in-flight transfer `id`. IN transfers receive `payload`; OUT
    /// transfers report their full length on success. Returns `false` if no such
    /// transfer was in flight.
    pub(crate) fn complete(&self, id: TransferId, status: TransferStatus, payload: &[u8]) -> bool {
        let transfer = {
            let mut state = self.state.lock();
            match state.in_flight.iter().position(|t| t.id() == id) {
                Some(pos) => state.in_flight.remove(pos),
                None => return false,
            }
        };
        let mut transfer = transfer;
        match kind_of(id) {
            Kind::Write => {
                if status == TransferStatus::Completed {
                    let len = transfer.len();
                    transfer.set_actual_length(len);
                }
            }
            Kind::Read | Kind::Status => {
                let area = transfer.buffer_mut();
                let n = payload.len().min(area.len());
                area[..n].copy_from_slice(&payload[..n]);
                transfer.set_actual_length(n);
            }
        }
        transfer.complete(status);
        true
    }

    /// Complete the oldest in-flight write. Returns its payload.
    pub(crate) fn complete_write(&self) -> Option<Vec<u8>> {
        let (id, data) = {
            let state = self.state.lock();
            let transfer = state
                .in_flight
                .iter()
                .find(|t| kind_of(t.id()) == Kind::Write)?;
            (transfer.id(), transfer.data().to_vec())
        };
        self.complete(id, TransferStatus::Completed, &[]);
        Some(data)
    }

    /// Complete the oldest in-flight write with `status`, reporting `actual` bytes
    /// sent. Returns its payload.
    pub(crate) fn complete_write_with(
        &self,
        status: TransferStatus,
        actual: usize,
    ) -> Option<Vec<u8>> {
        let mut transfer = {
            let mut state = self.state.lock();
            let pos = state
                .in_flight
                .iter()
                .position(|t| kind_of(t.id()) == Kind::Write)?;
            state.in_flight.remove(pos)
        };
        let data = transfer.data().to_vec();
        transfer.set_actual_length(actual);
        transfer.complete(status);
        Some(data)
    }

    pub(crate) fn is_in_flight(&self, id: TransferId) -> bool {
        self.state.lock().in_flight.iter().any(|t| t.id() == id)
    }

    pub(crate) fn in_flight(&self, kind: Kind) -> usize {
        self.state
            .lock()
            .in_flight
            .iter()
            .filter(|t| kind_of(t.id()) == kind)
            .count()
    }

    pub(crate) fn submissions(&self, kind: Kind) -> usize {
        self.state
            .lock()
            .submissions
            .iter()
            .filter(|id| kind_of(**id) == kind)
            .count()
    }

    pub(crate) fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().written.clone()
    }

    pub(crate) fn fail_next(&self, kind: Kind, error: TransportError) {
        self.state.lock().failures.push((kind, error));
    }

    pub(crate) fn fail_controls(&self, error: Option<TransportError>) {
        self.state.lock().control_error = error;
    }

    pub(crate) fn set_control_reply(&self, reply: &[u8]) {
        self.state.lock().control_reply = reply.to_vec();
    }

    pub(crate) fn set_short_control_writes(&self, short: bool) {
        self.state.lock().short_control_writes = short;
    }

    pub(crate) fn controls(&self) -> Vec<Request> {
        self.state.lock().controls.clone()
    }

    /// Power references taken and not yet released.
    pub(crate) fn power_held(&self) -> isize {
        self.power_gets.load(Ordering::SeqCst) as isize
            - self.power_puts.load(Ordering::SeqCst) as isize
    }
}

impl Transport for MockTransport {
    fn submit(&self, transfer: Transfer) -> Result<(), SubmitError> {
        let mut state = self.state.lock();
        let kind = kind_of(transfer.id());
        if let Some(pos) = state.failures.iter().position(|(k, _)| *k == kind) {
            let (_, error) = state.failures.remove(pos);
            return Err(SubmitError { transfer, error });
        }
        state.submissions.push(transfer.id());
        if kind == Kind::Write {
            state.written.push(transfer.data().to_vec());
        }
        state.in_flight.push(transfer);
        Ok(())
    }

    fn cancel(&self, id: TransferId) {
        let transfer = {
            let mut state = self.state.lock();
            match state.in_flight.iter().position(|t| t.id() == id) {
                Some(pos) => state.in_flight.remove(pos),
                None => return,
            }
        };
        transfer.complete(TransferStatus::Cancelled);
    }

    fn control_transfer(
        &self,
        setup: Request,
        data: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        let mut state = self.state.lock();
        state.controls.push(setup);
        if let Some(error) = state.control_error {
            return Err(error);
        }
        if setup.direction == UsbDirection::In {
            let n = state.control_reply.len().min(data.len());
            data[..n].copy_from_slice(&state.control_reply[..n]);
            Ok(n)
        } else if state.short_control_writes {
            Ok(data.len().saturating_sub(1))
        } else {
            Ok(data.len())
        }
    }

    fn autopm_get(&self) -> Result<(), TransportError> {
        self.power_gets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn autopm_put(&self) {
        self.power_puts.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    chunks: Mutex<Vec<Vec<u8>>>,
    hangups: Mutex<Vec<HangupReason>>,
    wakeups: AtomicUsize,
}

impl RecordingSink {
    pub(crate) fn data(&self) -> Vec<u8> {
        self.chunks.lock().concat()
    }

    pub(crate) fn chunks(&self) -> usize {
        self.chunks.lock().len()
    }

    pub(crate) fn hangups(&self) -> Vec<HangupReason> {
        self.hangups.lock().clone()
    }

    pub(crate) fn wakeups(&self) -> usize {
        self.wakeups.load(Ordering::SeqCst)
    }
}

impl ReadSink for RecordingSink {
    fn deliver(&self, data: &[u8]) -> usize {
        self.chunks.lock().push(data.to_vec());
        data.len()
    }

    fn hangup(&self, reason: HangupReason) {
        self.hangups.lock().push(reason);
    }

    fn write_wakeup(&self) {
        self.wakeups.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) const MODEM_REQUEST: u8 = 0xa4;
pub(crate) const BREAK_ON: VendorCommand = VendorCommand::new(0xa5, 0x01, 0);
pub(crate) const BREAK_OFF: VendorCommand = VendorCommand::new(0xa5, 0x00, 0);
pub(crate) const FEATURE_ON: VendorCommand = VendorCommand::new(0xc8, 0x01, 0);
pub(crate) const FEATURE_OFF: VendorCommand = VendorCommand::new(0xc8, 0x00, 0);

pub(crate) fn endpoints() -> Endpoints {
    Endpoints {
        bulk_in: EndpointAddress::from_parts(2, UsbDirection::In),
        bulk_in_size: 32,
        bulk_out: EndpointAddress::from_parts(2, UsbDirection::Out),
        bulk_out_size: 32,
        interrupt_in: EndpointAddress::from_parts(1, UsbDirection::In),
        interrupt_in_size: 8,
    }
}

pub(crate) fn resolver() -> TableResolver {
    TableResolver::new(
        FrameLayout::LEADING,
        ModemControlTable {
            request: MODEM_REQUEST,
            dtr: 0x20,
            rts: 0x40,
            active_low: true,
        },
    )
}

/// Two 64-byte write slots, two read slots. Close cancels pending writes at once.
pub(crate) fn config() -> PortConfig {
    PortConfig::default()
        .with_write_packets(2)
        .with_write_timeout(Duration::from_secs(5))
        .with_closing_wait(None)
}

pub(crate) struct Fixture {
    pub(crate) device: Device,
    pub(crate) transport: Arc<MockTransport>,
    pub(crate) sink: Arc<RecordingSink>,
}

pub(crate) fn fixture(config: PortConfig) -> Fixture {
    fixture_with(resolver(), config)
}

pub(crate) fn fixture_with(resolver: TableResolver, config: PortConfig) -> Fixture {
    let transport = MockTransport::new();
    let sink = Arc::new(RecordingSink::default());
    let device = Device::probe(
        transport.clone(),
        Arc::new(resolver),
        sink.clone(),
        endpoints(),
        config,
    )
    .unwrap();
    Fixture {
        device,
        transport,
        sink,
    }
}

/// A modem-status frame reporting `lines` as asserted.
pub(crate) fn modem_frame(lines: ModemLines) -> [u8; 4] {
    let mut raw = 0u8;
    if lines.contains(ModemLines::CTS) {
        raw |= 0x01;
    }
    if lines.contains(ModemLines::DSR) {
        raw |= 0x02;
    }
    if lines.contains(ModemLines::RI) {
        raw |= 0x04;
    }
    if lines.contains(ModemLines::DCD) {
        raw |= 0x08;
    }
    [event::MODEM, 0, 0, !raw]
}

/// Poll `cond` for up to five seconds.
pub(crate) fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Value of the vendor request that drives `lines` with the default table.
pub(crate) fn modem_value(lines: ModemLines) -> u16 {
    let mut bits = 0u16;
    if lines.contains(ModemLines::DTR) {
        bits |= 0x20;
    }
    if lines.contains(ModemLines::RTS) {
        bits |= 0x40;
    }
    !bits
}
