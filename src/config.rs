use std::time::Duration;

use usb_device::endpoint::EndpointAddress;
use usb_device::UsbDirection;

use crate::error::{Error, Result};

/// Default bound for a blocked writer and for synchronous control requests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);

/// How long the last close waits for accepted writes to drain by default.
pub const DEFAULT_CLOSING_WAIT: Duration = Duration::from_secs(30);

/// The bulk-in / bulk-out / interrupt-in endpoint triple claimed for one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub bulk_in: EndpointAddress,
    pub bulk_in_size: u16,
    pub bulk_out: EndpointAddress,
    pub bulk_out_size: u16,
    pub interrupt_in: EndpointAddress,
    pub interrupt_in_size: u16,
}

impl Endpoints {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.bulk_in.direction() != UsbDirection::In {
            return Err(Error::Invalid("bulk-in endpoint is not an IN endpoint"));
        }
        if self.bulk_out.direction() != UsbDirection::Out {
            return Err(Error::Invalid("bulk-out endpoint is not an OUT endpoint"));
        }
        if self.interrupt_in.direction() != UsbDirection::In {
            return Err(Error::Invalid("interrupt endpoint is not an IN endpoint"));
        }
        if self.bulk_in_size == 0 || self.bulk_out_size == 0 || self.interrupt_in_size == 0 {
            return Err(Error::Invalid("endpoint max packet size is zero"));
        }
        Ok(())
    }
}

/// Tunables for a port. Everything here is in-memory only.
#[derive(Debug, Clone, Copy)]
pub struct PortConfig {
    /// Number of write slots in the transfer buffer pool.
    pub write_slots: usize,
    /// Number of read slots in the read ring.
    pub read_slots: usize,
    /// Write slot capacity, in multiples of the bulk-out max packet size.
    pub write_packets: usize,
    /// How long a writer waits for a free slot.
    pub write_timeout: Duration,
    /// Timeout handed to the transport for synchronous control requests.
    pub control_timeout: Duration,
    /// Upper bound for `raw_control_transfer` payloads.
    pub max_control_len: usize,
    /// Raise DTR/RTS once the port is activated.
    pub raise_on_open: bool,
    /// Drop DTR/RTS when the last handle closes.
    pub drop_on_close: bool,
    /// Hang up the consumer when carrier detect drops.
    pub carrier_hangup: bool,
    /// How long the last close lets in-flight writes finish before cancelling
    /// them. `None` cancels at once.
    pub closing_wait: Option<Duration>,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            write_slots: 2,
            read_slots: 2,
            write_packets: 20,
            write_timeout: DEFAULT_TIMEOUT,
            control_timeout: DEFAULT_TIMEOUT,
            max_control_len: 4096,
            raise_on_open: true,
            drop_on_close: true,
            carrier_hangup: false,
            closing_wait: Some(DEFAULT_CLOSING_WAIT),
        }
    }
}

impl PortConfig {
    pub fn with_write_slots(mut self, n: usize) -> Self {
        self.write_slots = n;
        self
    }

    pub fn with_read_slots(mut self, n: usize) -> Self {
        self.read_slots = n;
        self
    }

    pub fn with_write_packets(mut self, n: usize) -> Self {
        self.write_packets = n;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_control_timeout(mut self, timeout: Duration) -> Self {
        self.control_timeout = timeout;
        self
    }

    pub fn with_modem_lines_on_open(mut self, raise: bool, drop: bool) -> Self {
        self.raise_on_open = raise;
        self.drop_on_close = drop;
        self
    }

    pub fn with_carrier_hangup(mut self, enabled: bool) -> Self {
        self.carrier_hangup = enabled;
        self
    }

    pub fn with_closing_wait(mut self, wait: Option<Duration>) -> Self {
        self.closing_wait = wait;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.write_slots == 0 || self.write_slots > 32 {
            return Err(Error::Invalid("write slot count must be 1..=32"));
        }
        if self.read_slots == 0 || self.read_slots > 32 {
            return Err(Error::Invalid("read slot count must be 1..=32"));
        }
        if self.write_packets == 0 {
            return Err(Error::Invalid("write slot capacity is zero"));
        }
        Ok(())
    }

    /// Capacity of one write slot for the given endpoints.
    pub fn write_capacity(&self, endpoints: &Endpoints) -> usize {
        endpoints.bulk_out_size as usize * self.write_packets
    }
}
