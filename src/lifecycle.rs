//! Port state machine.
//!
//! Every transition runs under the session's lifecycle lock, so open, close,
//! suspend, resume and disconnect never interleave with each other or with a
//! control request. Completion callbacks never take this lock.
//!
//! ```text
//!   Idle --open--> Activating --ok--> Active --last close--> ShuttingDown --> Idle
//!                      |                |  ^
//!                      +--fail--> Idle  |  +-- resume (depth 1 -> 0)
//!                                       +----- suspend (depth 0 -> 1) --> Suspended
//!   any --disconnect--> Disconnected
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::resolver::VendorCommand;
use crate::session::Shared;
use crate::sink::HangupReason;
use crate::status::ModemLines;
use crate::transport::PowerRef;

/// Externally visible state of a port.
///
/// `Suspended` is only reported for a port that was active when it was
/// suspended; a suspended port nobody has opened is still `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Idle,
    Activating,
    Active,
    /// Suspended with the given depth.
    Suspended(usize),
    ShuttingDown,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Phase {
    Idle = 0,
    Activating = 1,
    Active = 2,
    ShuttingDown = 3,
    Disconnected = 4,
}

impl Phase {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Phase::Activating,
            2 => Phase::Active,
            3 => Phase::ShuttingDown,
            4 => Phase::Disconnected,
            _ => Phase::Idle,
        }
    }
}

pub(crate) struct Lifecycle {
    pub(crate) open_count: usize,
    /// Keeps the function powered while the port is active and not suspended.
    activity: Option<PowerRef>,
    /// Set when the enable half of the feature handshake went out.
    handshake: Option<VendorCommand>,
    pub(crate) closing_wait: Option<Duration>,
}

impl Lifecycle {
    pub(crate) fn new(closing_wait: Option<Duration>) -> Self {
        Self {
            open_count: 0,
            activity: None,
            handshake: None,
            closing_wait,
        }
    }
}

impl Shared {
    pub(crate) fn state(&self) -> PortState {
        match self.phase() {
            Phase::Activating => PortState::Activating,
            Phase::ShuttingDown => PortState::ShuttingDown,
            Phase::Disconnected => PortState::Disconnected,
            Phase::Idle => PortState::Idle,
            Phase::Active => match self.writes.suspend_depth() {
                0 => PortState::Active,
                depth => PortState::Suspended(depth),
            },
        }
    }

    /// Register one more opener. The first one activates the port.
    pub(crate) fn open(self: &Arc<Self>) -> Result<()> {
        let mut life = self.lifecycle.lock();
        self.ensure_connected()?;
        if life.open_count > 0 {
            life.open_count += 1;
            return Ok(());
        }

        self.set_phase(Phase::Activating);
        match self.activate(&mut life) {
            Ok(()) => {
                life.open_count = 1;
                self.set_phase(Phase::Active);
                info!("port activated");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "activation failed");
                if !self.is_disconnected() {
                    self.set_phase(Phase::Idle);
                }
                Err(e)
            }
        }
    }

    fn activate(self: &Arc<Self>, life: &mut Lifecycle) -> Result<()> {
        let activity = PowerRef::acquire(&self.transport)?;

        // A port opened while suspended starts its traffic on resume.
        if self.writes.suspend_depth() == 0 {
            if let Err(e) = self.status.start(self) {
                return Err(e.into());
            }
            if let Err(e) = self.reads.start(self) {
                self.reads.stop(self);
                self.status.stop(self);
                return Err(e.into());
            }
        }

        if let Some(enable) = self.resolver.feature_control(true) {
            if let Err(e) = self.vendor_out(enable) {
                self.reads.stop(self);
                self.status.stop(self);
                return Err(e);
            }
            life.handshake = Some(enable);
        }

        if self.config.raise_on_open {
            let lines = self.status.lines_out() | ModemLines::OUTPUTS;
            if let Err(e) = self.apply_lines(lines) {
                debug!(error = %e, "could not raise DTR/RTS");
            }
        }

        life.activity = Some(activity);
        Ok(())
    }

    /// Drop one opener. The last one shuts the port down. Returns the remaining
    /// open count.
    pub(crate) fn close(&self) -> usize {
        let mut life = self.lifecycle.lock();
        if life.open_count == 0 {
            return 0;
        }
        life.open_count -= 1;
        if life.open_count > 0 {
            return life.open_count;
        }
        if self.is_disconnected() {
            return 0;
        }

        self.set_phase(Phase::ShuttingDown);
        self.drain_writes(life.closing_wait);
        if self.is_disconnected() {
            return 0;
        }
        if self.config.drop_on_close {
            let lines = self.status.lines_out() - ModemLines::OUTPUTS;
            if let Err(e) = self.apply_lines(lines) {
                debug!(error = %e, "could not drop DTR/RTS");
            }
        }
        self.stop_traffic();
        if life.handshake.take().is_some() {
            if let Some(disable) = self.resolver.feature_control(false) {
                if let Err(e) = self.vendor_out(disable) {
                    debug!(error = %e, "feature handshake disable failed");
                }
            }
        }
        life.activity = None;
        self.set_phase(Phase::Idle);
        info!("port shut down");
        0
    }

    /// Give in-flight writes up to `bound` to complete. Parked writes cannot
    /// drain while suspended, so there is nothing to wait for then.
    fn drain_writes(&self, bound: Option<Duration>) {
        let bound = match bound {
            Some(bound) if self.writes.suspend_depth() == 0 => bound,
            _ => return,
        };
        match self.writes.wait_idle(Some(Instant::now() + bound)) {
            Ok(()) => {}
            Err(Error::Timeout) => {
                warn!(in_flight = self.writes.in_flight(), ?bound, "closing wait expired")
            }
            Err(e) => debug!(error = %e, "closing wait ended"),
        }
    }

    pub(crate) fn suspend(&self, auto: bool) -> Result<()> {
        let mut life = self.lifecycle.lock();
        self.ensure_connected()?;
        let previous = self.writes.suspend(auto)?;
        if previous > 0 {
            return Ok(());
        }
        debug!(auto, in_flight = self.writes.in_flight(), "suspending");
        self.status.stop(self);
        self.writes.cancel_in_flight(self);
        self.reads.stop(self);
        life.activity = None;
        Ok(())
    }

    pub(crate) fn resume(self: &Arc<Self>) -> Result<()> {
        let mut life = self.lifecycle.lock();
        self.ensure_connected()?;
        let active = self.phase() == Phase::Active;
        let last = self.writes.suspend_depth() == 1;

        let mut status = Ok(());
        if last && active {
            match PowerRef::acquire(&self.transport) {
                Ok(power) => life.activity = Some(power),
                Err(e) => warn!(error = %e, "no power reference on resume"),
            }
            status = self.status.start(self);
        }

        let depth = self.writes.resume(self, active);
        if depth > 0 || !active {
            return Ok(());
        }
        debug!("resumed");
        status?;
        self.reads.start(self)?;
        Ok(())
    }

    /// Resume after the device lost its state: the consumer is hung up first.
    pub(crate) fn reset_resume(self: &Arc<Self>) -> Result<()> {
        if self.phase() == Phase::Active {
            self.sink.hangup(HangupReason::Carrier);
        }
        self.resume()
    }

    /// The device left the bus. Safe to call more than once.
    pub(crate) fn disconnect(&self) {
        if !self.mark_disconnected() {
            return;
        }
        // Wake every waiter before taking the lifecycle lock; an activation in
        // progress will fail on its own.
        self.writes.disconnect();
        self.reads.disconnect();
        self.status.disconnect();
        self.sink.hangup(HangupReason::Disconnect);

        let mut life = self.lifecycle.lock();
        self.set_phase(Phase::Disconnected);
        self.stop_traffic();
        life.handshake = None;
        life.activity = None;
        info!("device disconnected");
    }

    pub(crate) fn open_count(&self) -> usize {
        self.lifecycle.lock().open_count
    }

    /// Drive the output lines. Caller holds the lifecycle lock.
    pub(crate) fn apply_lines(&self, lines: ModemLines) -> Result<()> {
        let lines = lines & ModemLines::OUTPUTS;
        let command = self
            .resolver
            .modem_control(lines)
            .ok_or(Error::Invalid("modem control not supported"))?;
        self.vendor_out(command)?;
        self.status.set_lines_out(lines);
        Ok(())
    }

    pub(crate) fn vendor_out(&self, command: VendorCommand) -> Result<()> {
        self.control(command.out(0), &mut [])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::testing::{
        config, fixture, fixture_with, modem_value, resolver, Kind, FEATURE_OFF, FEATURE_ON,
        MODEM_REQUEST,
    };
    use crate::transport::TransferId;
    use crate::write_pool::SlotState;
    use std::thread;

    #[test]
    fn first_open_activates_and_last_close_shuts_down() {
        let f = fixture(config());
        assert_eq!(f.device.state(), PortState::Idle);

        let first = f.device.open().unwrap();
        let second = f.device.open().unwrap();
        assert_eq!(f.device.state(), PortState::Active);
        assert_eq!(f.device.open_count(), 2);
        assert_eq!(f.transport.submissions(Kind::Status), 1);
        assert_eq!(f.transport.in_flight(Kind::Read), 2);
        assert_eq!(f.transport.power_held(), 1);

        first.close();
        assert_eq!(f.device.state(), PortState::Active);
        assert_eq!(f.transport.in_flight(Kind::Read), 2);

        drop(second);
        assert_eq!(f.device.state(), PortState::Idle);
        assert_eq!(f.transport.in_flight(Kind::Read), 0);
        assert!(!f.transport.is_in_flight(TransferId::Status));
        assert_eq!(f.transport.power_held(), 0);
    }

    #[test]
    fn modem_lines_follow_open_and_close() {
        let f = fixture(config());
        let port = f.device.open().unwrap();
        let controls = f.transport.controls();
        assert_eq!(controls.len(), 1);
        assert_eq!(controls[0].request, MODEM_REQUEST);
        assert_eq!(controls[0].value, modem_value(ModemLines::OUTPUTS));

        port.close();
        let controls = f.transport.controls();
        assert_eq!(controls.len(), 2);
        assert_eq!(controls[1].value, modem_value(ModemLines::empty()));
    }

    #[test]
    fn lines_left_alone_when_configured() {
        let f = fixture(config().with_modem_lines_on_open(false, false));
        f.device.open().unwrap().close();
        assert!(f.transport.controls().is_empty());
    }

    #[test]
    fn feature_handshake_on_activate_and_shutdown() {
        let f = fixture_with(
            resolver().with_feature_handshake(FEATURE_ON, FEATURE_OFF),
            config().with_modem_lines_on_open(false, false),
        );
        let port = f.device.open().unwrap();
        let _again = f.device.open().unwrap();
        assert_eq!(f.transport.controls(), vec![FEATURE_ON.out(0)]);

        drop(port);
        drop(_again);
        assert_eq!(
            f.transport.controls(),
            vec![FEATURE_ON.out(0), FEATURE_OFF.out(0)]
        );
    }

    #[test]
    fn failed_read_start_rolls_back_activation() {
        let f = fixture(config());
        f.transport.fail_next(Kind::Read, TransportError::NoMemory);

        assert_eq!(
            f.device.open().err(),
            Some(Error::Transport(TransportError::NoMemory))
        );
        assert_eq!(f.device.state(), PortState::Idle);
        assert_eq!(f.device.open_count(), 0);
        assert_eq!(f.transport.in_flight(Kind::Read), 0);
        assert!(!f.transport.is_in_flight(TransferId::Status));
        assert_eq!(f.transport.power_held(), 0);

        let _port = f.device.open().unwrap();
        assert_eq!(f.transport.in_flight(Kind::Read), 2);
    }

    #[test]
    fn failed_handshake_rolls_back_activation() {
        let f = fixture_with(
            resolver().with_feature_handshake(FEATURE_ON, FEATURE_OFF),
            config(),
        );
        f.transport.fail_controls(Some(TransportError::Stall));

        assert_eq!(
            f.device.open().err(),
            Some(Error::Transport(TransportError::Stall))
        );
        assert_eq!(f.device.state(), PortState::Idle);
        assert_eq!(f.transport.in_flight(Kind::Read), 0);
        assert!(!f.transport.is_in_flight(TransferId::Status));
        assert_eq!(f.transport.power_held(), 0);
    }

    #[test]
    fn writes_accepted_while_suspended_go_out_in_order() {
        let f = fixture(config().with_write_slots(3));
        let port = f.device.open().unwrap();

        f.device.suspend(false).unwrap();
        assert_eq!(f.device.state(), PortState::Suspended(1));
        assert_eq!(f.transport.in_flight(Kind::Read), 0);
        assert!(!f.transport.is_in_flight(TransferId::Status));

        assert_eq!(port.write(b"A"), Ok(1));
        assert_eq!(port.write(b"B"), Ok(1));
        assert_eq!(port.write(b"C"), Ok(1));
        assert!(f.transport.written().is_empty());
        assert_eq!(f.device.write_slots(), vec![SlotState::Parked; 3]);

        f.device.resume().unwrap();
        assert_eq!(
            f.transport.written(),
            vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec()]
        );
        assert_eq!(f.device.state(), PortState::Active);
        assert_eq!(f.transport.in_flight(Kind::Read), 2);
        assert!(f.transport.is_in_flight(TransferId::Status));
    }

    #[test]
    fn nested_suspend_needs_matching_resumes() {
        let f = fixture(config());
        let _port = f.device.open().unwrap();

        f.device.suspend(false).unwrap();
        f.device.suspend(false).unwrap();
        assert_eq!(f.device.state(), PortState::Suspended(2));

        f.device.resume().unwrap();
        assert_eq!(f.device.state(), PortState::Suspended(1));
        assert_eq!(f.transport.in_flight(Kind::Read), 0);

        f.device.resume().unwrap();
        assert_eq!(f.device.state(), PortState::Active);
        assert_eq!(f.transport.in_flight(Kind::Read), 2);
    }

    #[test]
    fn auto_suspend_refused_while_writing() {
        let f = fixture(config());
        let port = f.device.open().unwrap();
        port.write(b"busy").unwrap();

        assert_eq!(f.device.suspend(true), Err(Error::Busy));
        assert_eq!(f.device.state(), PortState::Active);

        f.transport.complete_write();
        assert_eq!(f.device.suspend(true), Ok(()));
        assert_eq!(f.device.state(), PortState::Suspended(1));
    }

    #[test]
    fn suspend_releases_activity_reference() {
        let f = fixture(config());
        let _port = f.device.open().unwrap();
        assert_eq!(f.transport.power_held(), 1);

        f.device.suspend(false).unwrap();
        assert_eq!(f.transport.power_held(), 0);
        f.device.resume().unwrap();
        assert_eq!(f.transport.power_held(), 1);
    }

    #[test]
    fn close_while_suspended_discards_parked_writes() {
        let f = fixture(config());
        let port = f.device.open().unwrap();
        f.device.suspend(false).unwrap();
        port.write(b"lost").unwrap();

        port.close();
        assert_eq!(f.device.write_slots(), vec![SlotState::Free; 2]);
        f.device.resume().unwrap();
        assert!(f.transport.written().is_empty());
        assert_eq!(f.device.state(), PortState::Idle);
        assert_eq!(f.transport.power_held(), 0);
    }

    #[test]
    fn open_while_suspended_starts_traffic_on_resume() {
        let f = fixture(config());
        f.device.suspend(false).unwrap();

        let _port = f.device.open().unwrap();
        assert_eq!(f.device.state(), PortState::Suspended(1));
        assert_eq!(f.transport.in_flight(Kind::Read), 0);

        f.device.resume().unwrap();
        assert_eq!(f.device.state(), PortState::Active);
        assert_eq!(f.transport.in_flight(Kind::Read), 2);
        assert!(f.transport.is_in_flight(TransferId::Status));
    }

    #[test]
    fn reset_resume_hangs_up_the_consumer() {
        let f = fixture(config());
        let _port = f.device.open().unwrap();
        f.device.suspend(false).unwrap();

        f.device.reset_resume().unwrap();
        assert_eq!(f.sink.hangups(), vec![HangupReason::Carrier]);
        assert_eq!(f.device.state(), PortState::Active);
    }

    #[test]
    fn disconnect_is_idempotent_and_balances_power() {
        let f = fixture(config());
        let port = f.device.open().unwrap();
        port.write(b"pending").unwrap();
        assert_eq!(f.transport.power_held(), 2);

        f.device.disconnect();
        f.device.disconnect();
        assert_eq!(f.device.state(), PortState::Disconnected);
        assert_eq!(f.transport.in_flight(Kind::Write), 0);
        assert_eq!(f.transport.in_flight(Kind::Read), 0);
        assert_eq!(f.transport.power_held(), 0);
        assert_eq!(f.sink.hangups(), vec![HangupReason::Disconnect]);

        assert_eq!(port.write(b"x"), Err(Error::Gone));
        assert_eq!(f.device.suspend(false), Err(Error::Gone));
        assert!(matches!(f.device.open(), Err(Error::Gone)));
        port.close();
        assert_eq!(f.device.state(), PortState::Disconnected);
        assert_eq!(f.transport.power_held(), 0);
    }

    #[test]
    fn disconnect_releases_blocked_writers_before_the_session_goes() {
        let f = fixture(config());
        let filler = f.device.open().unwrap();
        filler.write(b"a").unwrap();
        filler.write(b"b").unwrap();

        let writers: Vec<_> = (0..3)
            .map(|_| {
                let port = f.device.open().unwrap();
                thread::spawn(move || port.write(b"blocked"))
            })
            .collect();
        thread::sleep(Duration::from_millis(50));

        let session = Arc::downgrade(f.device.session());
        f.device.disconnect();
        for writer in writers {
            assert_eq!(writer.join().unwrap(), Err(Error::Gone));
        }
        assert!(session.upgrade().is_some());

        drop(filler);
        let crate::testing::Fixture {
            device, transport, ..
        } = f;
        drop(device);
        assert!(session.upgrade().is_none());
        assert_eq!(transport.power_held(), 0);
    }

    #[test]
    fn close_lets_pending_writes_finish() {
        let f = fixture(config().with_closing_wait(Some(Duration::from_secs(5))));
        let port = f.device.open().unwrap();
        port.write(b"AT\r").unwrap();

        let completer = {
            let transport = f.transport.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                transport.complete_write()
            })
        };
        port.close();

        assert_eq!(completer.join().unwrap(), Some(b"AT\r".to_vec()));
        assert_eq!(f.device.counters().tx, 3);
        assert_eq!(f.device.state(), PortState::Idle);
        assert_eq!(f.transport.power_held(), 0);
    }

    #[test]
    fn expired_closing_wait_cancels_writes() {
        let f = fixture(config());
        let port = f.device.open().unwrap();
        assert_eq!(port.closing_wait(), None);
        port.set_closing_wait(Some(Duration::from_millis(20)));
        port.write(b"slow").unwrap();

        port.close();
        assert_eq!(f.transport.in_flight(Kind::Write), 0);
        assert_eq!(f.device.write_slots(), vec![SlotState::Free; 2]);
        assert_eq!(f.device.counters().tx, 0);
        assert_eq!(f.device.state(), PortState::Idle);
    }

    #[test]
    fn disconnect_after_close_releases_nothing_twice() {
        let f = fixture(config().with_write_slots(1));
        let port = f.device.open().unwrap();
        port.write(b"one").unwrap();
        f.transport.complete_write();
        port.write(b"two").unwrap();
        f.transport.complete_write();

        port.close();
        assert_eq!(f.transport.power_held(), 0);
        f.device.disconnect();
        f.device.disconnect();

        assert_eq!(f.device.open_count(), 0);
        assert_eq!(f.device.state(), PortState::Disconnected);
        assert_eq!(f.transport.power_held(), 0);
        assert_eq!(f.transport.written(), vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(f.device.write_slots(), vec![SlotState::Free]);
    }

    #[test]
    fn suspended_port_nobody_opened_reports_idle() {
        let f = fixture(config());
        f.device.suspend(false).unwrap();
        assert_eq!(f.device.state(), PortState::Idle);

        f.device.resume().unwrap();
        assert_eq!(f.device.state(), PortState::Idle);
    }
}
