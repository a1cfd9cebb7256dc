//! Event-loop glue between a [`Connection`] and the bridge hardware.

use tracing::{debug, trace};

use super::connection::{Action, Connection, Event, LoadOutcome, LoadRequest, StartError};
use super::link::TargetLink;
use super::state::LoadState;

/// Hardware services of the bridge.
pub trait BridgeHal {
    fn set_pin(&mut self, pin: u8, high: bool);
    fn set_baud_rate(&mut self, baud_rate: u32);
    fn write(&mut self, data: &[u8]);
    /// Arm the single-shot timer, replacing any pending expiry.
    fn arm_timer(&mut self, ms: u32);
    fn disarm_timer(&mut self);
    /// Route target serial input to [`LoadDriver::on_receive`].
    fn attach_receiver(&mut self);
    fn detach_receiver(&mut self);
}

/// Runs a connection's actions against a [`BridgeHal`].
pub struct LoadDriver<H: BridgeHal, L: TargetLink> {
    hal: H,
    connection: Connection<L>,
}

impl<H: BridgeHal, L: TargetLink> LoadDriver<H, L> {
    pub fn new(hal: H, connection: Connection<L>) -> Self {
        Self { hal, connection }
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn connection(&self) -> &Connection<L> {
        &self.connection
    }

    pub fn state(&self) -> LoadState {
        self.connection.state()
    }

    /// Start a transfer. `Ok(Some(_))` when it finished immediately.
    pub fn start(&mut self, request: LoadRequest) -> Result<Option<LoadOutcome>, StartError> {
        let actions = self.connection.start(request)?;
        Ok(self.execute(actions))
    }

    pub fn on_timer(&mut self) -> Option<LoadOutcome> {
        let actions = self.connection.handle_event(Event::TimerExpired);
        self.execute(actions)
    }

    pub fn on_receive(&mut self, data: &[u8]) -> Option<LoadOutcome> {
        let actions = self.connection.handle_event(Event::Received(data));
        self.execute(actions)
    }

    /// Change the UART rate outside a transfer.
    pub fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), StartError> {
        if !self.connection.state().is_idle() {
            return Err(StartError::Busy(self.connection.state().name()));
        }
        self.hal.set_baud_rate(baud_rate);
        Ok(())
    }

    /// Perform `actions` in order, returning the outcome if one completed.
    pub fn execute(&mut self, actions: Vec<Action>) -> Option<LoadOutcome> {
        let mut outcome = None;
        for action in actions {
            trace!(?action, "Executing");
            match action {
                Action::SetPin { pin, high } => self.hal.set_pin(pin, high),
                Action::SetBaudRate(rate) => self.hal.set_baud_rate(rate),
                Action::Transmit(bytes) => {
                    if !bytes.is_empty() {
                        self.hal.write(&bytes);
                    }
                }
                Action::ArmTimer(ms) => self.hal.arm_timer(ms),
                Action::DisarmTimer => self.hal.disarm_timer(),
                Action::AttachReceiver => self.hal.attach_receiver(),
                Action::DetachReceiver => self.hal.detach_receiver(),
                Action::Complete(result) => {
                    debug!(status = result.status, "Transfer complete");
                    outcome = Some(result);
                }
            }
        }
        outcome
    }
}
