//! Service 0x11: ECUReset, in two stages.
//!
//! Stage one validates the request and schedules the reset through the
//! `power_down_ms` argument; the core sends the positive response and, after
//! the delay, fires `DoScheduledReset`, whose handler performs the actual
//! reset through the [`ResetHook`].

use std::cell::RefCell;
use std::rc::Rc;

use tracing::warn;

use crate::UdsServer;
use crate::nrc::Nrc;
use crate::server::dispatch::{Args, Event, Outcome, ServiceNode, priority};

/// Reset sub-functions accepted by this service.
pub mod reset_type {
    /// Simulated power cycle.
    pub const HARD: u8 = 0x01;
    /// Key-off/on reset.
    pub const KEY_OFF_ON: u8 = 0x02;
    /// Software reset.
    pub const SOFT: u8 = 0x03;
}

/// Collaborator performing the physical reset.
pub trait ResetHook {
    /// Called after the positive response went out and the delay elapsed.
    fn perform_reset(&mut self, reset_type: u8);
}

/// Default hook: logs instead of resetting (host demos have no CPU to reset).
pub struct LogReset;

impl ResetHook for LogReset {
    fn perform_reset(&mut self, reset_type: u8) {
        warn!(reset_type, "ECU reset requested; restarting diagnostic state");
    }
}

/// The 0x11 service.
pub struct EcuReset {
    delay_ms: u32,
    hook: Rc<RefCell<Box<dyn ResetHook>>>,
}

impl Default for EcuReset {
    fn default() -> Self {
        Self::new(50)
    }
}

impl EcuReset {
    /// Service with the given response-to-reset delay.
    pub fn new(delay_ms: u32) -> Self {
        Self {
            delay_ms,
            hook: Rc::new(RefCell::new(Box::new(LogReset))),
        }
    }

    /// Replace the reset hook.
    pub fn with_hook(mut self, hook: impl ResetHook + 'static) -> Self {
        self.hook = Rc::new(RefCell::new(Box::new(hook)));
        self
    }

    /// Register the request and execute nodes.
    pub fn mount(self, server: &mut UdsServer) {
        let delay_ms = self.delay_ms;
        server.register(ServiceNode::new(
            "reset_req",
            Event::EcuReset,
            priority::NORMAL,
            move |_, args| {
                let Args::EcuReset(args) = args else {
                    return Outcome::NotMine;
                };
                match args.reset_type {
                    reset_type::HARD | reset_type::KEY_OFF_ON | reset_type::SOFT => {
                        // The positive response must leave the wire before
                        // the reset happens.
                        args.power_down_ms = Some(delay_ms);
                        Outcome::Handled
                    }
                    _ => Outcome::Deny(Nrc::SubFunctionNotSupported),
                }
            },
        ));

        let hook = self.hook;
        server.register(ServiceNode::new(
            "reset_exec",
            Event::DoScheduledReset,
            priority::NORMAL,
            move |state, args| {
                let Args::DoScheduledReset { reset_type } = args else {
                    return Outcome::NotMine;
                };
                state.reset_to_default();
                hook.borrow_mut().perform_reset(*reset_type);
                Outcome::Handled
            },
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    #[test]
    fn rapid_power_shutdown_subfunctions_are_rejected() {
        let mut server = UdsServer::new();
        EcuReset::default().mount(&mut server);
        let mut tp = MockTransport::new();

        tp.push_payload(&[0x11, 0x04], false);
        server.poll(&mut tp);
        assert_eq!(tp.last_sent().unwrap().0, vec![0x7F, 0x11, 0x12]);
    }

    #[test]
    fn accepted_reset_answers_with_the_subfunction() {
        let mut server = UdsServer::new();
        EcuReset::new(5).mount(&mut server);
        let mut tp = MockTransport::new();

        tp.push_payload(&[0x11, 0x03], false);
        server.poll(&mut tp);
        assert_eq!(tp.last_sent().unwrap().0, vec![0x51, 0x03]);
    }
}
