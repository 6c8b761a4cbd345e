//! Host-side transport core for USB-to-serial bridges.
//!
//! A bridge chip exposes a bulk-in, a bulk-out and an interrupt-in endpoint. This
//! crate turns those into a byte-stream port: writes go through a small pool of
//! pre-allocated write slots with back-pressure, inbound bytes are pumped by a ring
//! of perpetually resubmitted reads, and an interrupt status transfer keeps modem
//! line and line-error counters that callers can block on.
//!
//! The bus itself is behind the [`Transport`] trait and all chip-specific knowledge
//! (status frame layout, vendor requests) behind [`ConfigResolver`]. Inbound bytes
//! go to a [`ReadSink`]; [`BufferedSink`] is a ready-made one with blocking reads.
//!
//! Example
//! =======
//!
//! ```no_run
//! # use std::sync::Arc;
//! # fn dummy(transport: Arc<dyn usbh_serial::Transport>, endpoints: usbh_serial::Endpoints) -> usbh_serial::Result<()> {
//! use usbh_serial::{
//!     BufferedSink, Device, FrameLayout, ModemControlTable, ModemLines, PortConfig, TableResolver,
//! };
//!
//! let resolver = TableResolver::new(
//!     FrameLayout::LEADING,
//!     ModemControlTable { request: 0xa4, dtr: 0x20, rts: 0x40, active_low: true },
//! );
//! let sink = Arc::new(BufferedSink::new(4096));
//! let device = Device::probe(
//!     transport,
//!     Arc::new(resolver),
//!     sink.clone(),
//!     endpoints,
//!     PortConfig::default(),
//! )?;
//!
//! let port = device.open()?;
//! port.write(b"AT\r")?;
//!
//! let mut buf = [0u8; 64];
//! let count = sink.read(&mut buf, Some(std::time::Duration::from_secs(1)))?;
//! // count bytes were read to &buf[..count]
//!
//! port.set_modem_lines(ModemLines::empty(), ModemLines::RTS)?;
//! port.close();
//! # Ok(())
//! # }
//! ```

mod buffer;
mod config;
mod error;
mod io;
mod lifecycle;
mod read_ring;
mod resolver;
mod serial_port;
mod session;
mod sink;
mod status;
mod sync;
mod transport;
mod write_pool;

#[cfg(test)]
mod testing;

pub use crate::config::{Endpoints, PortConfig, DEFAULT_CLOSING_WAIT, DEFAULT_TIMEOUT};
pub use crate::error::{Error, Result, TransportError};
pub use crate::lifecycle::PortState;
pub use crate::resolver::{
    event, BreakTable, ConfigResolver, FrameLayout, ModemControlTable, TableResolver,
    VendorCommand,
};
pub use crate::serial_port::*;
pub use crate::sink::{BufferedSink, HangupReason, ReadSink};
pub use crate::status::{ChangeMask, Counters, ModemLines, StatusReport};
pub use crate::transport::{
    request_type_byte, SubmitError, Transfer, TransferId, TransferStatus, Transport,
};
pub use crate::write_pool::SlotState;
pub use embedded_io;
pub use usb_device::control::Request;
