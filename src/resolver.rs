//! The configuration resolver seam: chip-specific data the core consumes but never
//! interprets itself.
//!
//! The core asks a [`ConfigResolver`] how to decode a status frame and which vendor
//! commands drive the modem lines, the break condition and the optional feature
//! handshake. [`TableResolver`] covers the common case of chips that differ only in
//! table data.

use usb_device::control::{Recipient, Request, RequestType};
use usb_device::UsbDirection;

use crate::status::{ModemLines, StatusReport};

/// A vendor request addressed to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VendorCommand {
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl VendorCommand {
    pub const fn new(request: u8, value: u16, index: u16) -> Self {
        Self {
            request,
            value,
            index,
        }
    }

    /// Setup packet for a host-to-device request with `length` bytes of payload.
    pub fn out(&self, length: u16) -> Request {
        self.setup(UsbDirection::Out, length)
    }

    /// Setup packet for a device-to-host request reading up to `length` bytes.
    pub fn input(&self, length: u16) -> Request {
        self.setup(UsbDirection::In, length)
    }

    fn setup(&self, direction: UsbDirection, length: u16) -> Request {
        Request {
            direction,
            request_type: RequestType::Vendor,
            recipient: Recipient::Device,
            request: self.request,
            value: self.value,
            index: self.index,
            length,
        }
    }
}

/// Chip-specific knowledge consumed by the core.
///
/// Called from both contexts; implementations must be cheap and must not block.
/// [`decode_status`](Self::decode_status) in particular runs in completion context.
pub trait ConfigResolver: Send + Sync {
    /// Decode one interrupt status frame. `None` marks the frame as unknown.
    fn decode_status(&self, frame: &[u8]) -> Option<StatusReport>;

    /// Command that drives the output lines to `lines`.
    fn modem_control(&self, lines: ModemLines) -> Option<VendorCommand>;

    /// Request reading the input lines back, and the reply length.
    fn modem_status_query(&self) -> Option<(VendorCommand, u16)> {
        None
    }

    fn decode_modem_status(&self, _reply: &[u8]) -> Option<ModemLines> {
        None
    }

    /// Command that starts (`true`) or stops a break condition.
    fn break_control(&self, _on: bool) -> Option<VendorCommand> {
        None
    }

    /// One-time command issued on activation (`true`) and shutdown (`false`).
    /// `None` for `true` means the device needs no handshake.
    fn feature_control(&self, _enable: bool) -> Option<VendorCommand> {
        None
    }
}

/// Where a status frame keeps its fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    /// Frames shorter than this are unknown.
    pub min_len: usize,
    /// Offset of the event-type byte.
    pub type_offset: usize,
    /// The first byte must be zero for the frame to count.
    pub zero_lead: bool,
    /// Input lines this chip reports; others read as inactive.
    pub line_mask: ModemLines,
}

impl FrameLayout {
    /// Event type in the first byte.
    pub const LEADING: Self = Self {
        min_len: 4,
        type_offset: 0,
        zero_lead: false,
        line_mask: ModemLines::INPUTS,
    };

    /// Event type in the second byte.
    pub const SECOND: Self = Self {
        min_len: 4,
        type_offset: 1,
        zero_lead: false,
        line_mask: ModemLines::INPUTS,
    };
}

/// Event-type bits of a status frame.
pub mod event {
    pub const MODEM: u8 = 0x08;
    pub const BREAK: u8 = 0x10;
    pub const OVERRUN: u8 = 0x02;
    /// Frame errors set both of these bits; parity alone is `PARITY`.
    pub const FRAME: u8 = 0x44;
    pub const PARITY: u8 = 0x04;
}

// Input line bits in the last byte of a modem frame, active low.
const IN_CTS: u8 = 0x01;
const IN_DSR: u8 = 0x02;
const IN_RI: u8 = 0x04;
const IN_DCD: u8 = 0x08;

/// How output lines map onto a vendor request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModemControlTable {
    pub request: u8,
    pub dtr: u16,
    pub rts: u16,
    /// The device expects the inverted bit pattern.
    pub active_low: bool,
}

/// Break on/off commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakTable {
    pub on: VendorCommand,
    pub off: VendorCommand,
}

/// A resolver driven purely by table data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableResolver {
    pub layout: FrameLayout,
    pub modem: ModemControlTable,
    pub brk: Option<BreakTable>,
    pub feature: Option<(VendorCommand, VendorCommand)>,
}

impl TableResolver {
    pub fn new(layout: FrameLayout, modem: ModemControlTable) -> Self {
        Self {
            layout,
            modem,
            brk: None,
            feature: None,
        }
    }

    pub fn with_break(mut self, on: VendorCommand, off: VendorCommand) -> Self {
        self.brk = Some(BreakTable { on, off });
        self
    }

    pub fn with_feature_handshake(mut self, enable: VendorCommand, disable: VendorCommand) -> Self {
        self.feature = Some((enable, disable));
        self
    }
}

impl ConfigResolver for TableResolver {
    fn decode_status(&self, frame: &[u8]) -> Option<StatusReport> {
        let layout = &self.layout;
        if frame.len() < layout.min_len.max(layout.type_offset + 1) {
            return None;
        }
        if layout.zero_lead && frame[0] != 0 {
            return None;
        }
        let kind = frame[layout.type_offset];
        let mut report = StatusReport::default();
        let mut handled = false;

        if kind & event::MODEM != 0 {
            let raw = !frame[frame.len() - 1];
            let mut lines = ModemLines::empty();
            lines.set(ModemLines::CTS, raw & IN_CTS != 0);
            lines.set(ModemLines::DSR, raw & IN_DSR != 0);
            lines.set(ModemLines::RI, raw & IN_RI != 0);
            lines.set(ModemLines::DCD, raw & IN_DCD != 0);
            report.lines = Some(lines & layout.line_mask);
            handled = true;
        }
        if kind & event::BREAK != 0 {
            report.brk = true;
            handled = true;
        }
        if kind & event::OVERRUN != 0 {
            report.overrun = true;
            handled = true;
        }
        if kind & event::FRAME == event::FRAME {
            report.frame = true;
            handled = true;
        } else if kind & event::PARITY != 0 {
            report.parity = true;
            handled = true;
        }

        handled.then_some(report)
    }

    fn modem_control(&self, lines: ModemLines) -> Option<VendorCommand> {
        let mut bits = 0u16;
        if lines.contains(ModemLines::DTR) {
            bits |= self.modem.dtr;
        }
        if lines.contains(ModemLines::RTS) {
            bits |= self.modem.rts;
        }
        if self.modem.active_low {
            bits = !bits;
        }
        Some(VendorCommand::new(self.modem.request, bits, 0))
    }

    fn break_control(&self, on: bool) -> Option<VendorCommand> {
        self.brk.map(|table| if on { table.on } else { table.off })
    }

    fn feature_control(&self, enable: bool) -> Option<VendorCommand> {
        self.feature
            .map(|(enable_cmd, disable_cmd)| if enable { enable_cmd } else { disable_cmd })
    }
}
