use core::slice;

use crate::error::{Error, TransportError};
use crate::serial_port::SerialPort;
use crate::sink::BufferedSink;

impl embedded_io::Error for Error {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            Error::Gone => embedded_io::ErrorKind::NotConnected,
            Error::Timeout => embedded_io::ErrorKind::TimedOut,
            Error::Interrupted => embedded_io::ErrorKind::Interrupted,
            Error::Invalid(_) => embedded_io::ErrorKind::InvalidInput,
            Error::Transport(TransportError::NoMemory) => embedded_io::ErrorKind::OutOfMemory,
            _ => embedded_io::ErrorKind::Other,
        }
    }
}

impl embedded_io::ErrorType for SerialPort {
    type Error = Error;
}

impl embedded_io::Write for SerialPort {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        // Blocks for a slot, so a successful write always moves at least one byte.
        SerialPort::write(self, buf)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        SerialPort::flush(self, None)
    }
}

impl embedded_io::WriteReady for SerialPort {
    fn write_ready(&mut self) -> Result<bool, Self::Error> {
        Ok(self.write_room() != 0)
    }
}

impl embedded_io::ErrorType for &BufferedSink {
    type Error = Error;
}

impl embedded_io::Read for &BufferedSink {
    /// Blocks until at least one byte is buffered. `Ok(0)` after a carrier hangup.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        BufferedSink::read(*self, buf, None)
    }
}

impl embedded_io::ReadReady for &BufferedSink {
    fn read_ready(&mut self) -> Result<bool, Self::Error> {
        Ok(self.available() != 0)
    }
}

impl embedded_hal::serial::Write<u8> for SerialPort {
    type Error = Error;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        match SerialPort::try_write(self, slice::from_ref(&word)) {
            Ok(0) | Err(Error::Busy) => Err(nb::Error::WouldBlock),
            Ok(_) => Ok(()),
            Err(err) => Err(nb::Error::Other(err)),
        }
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        match SerialPort::flush(self, Some(core::time::Duration::ZERO)) {
            Err(Error::Timeout) => Err(nb::Error::WouldBlock),
            Ok(()) => Ok(()),
            Err(err) => Err(nb::Error::Other(err)),
        }
    }
}

impl embedded_hal::serial::Read<u8> for &BufferedSink {
    type Error = Error;

    /// A hung-up line reads as [`Error::Gone`].
    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        let mut word: u8 = 0;

        match BufferedSink::try_read(*self, slice::from_mut(&mut word)) {
            Err(Error::Busy) => Err(nb::Error::WouldBlock),
            Ok(0) => Err(nb::Error::Other(Error::Gone)),
            Ok(_) => Ok(word),
            Err(err) => Err(nb::Error::Other(err)),
        }
    }
}
