//! Service 0x10: DiagnosticSessionControl.

use crate::UdsServer;
use crate::nrc::Nrc;
use crate::server::dispatch::{Args, Event, Outcome, ServiceNode, priority};

/// P2 / P2* timing pair in milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub p2_ms: u16,
    pub p2_star_ms: u16,
}

/// Session-control handler with configurable timing profiles.
///
/// Default sessions run the standard ISO 14229-2 timings; programming and
/// extended sessions get relaxed timings so long transfers (file upload,
/// console output) do not trip P2.
pub struct SessionControl {
    standard: Timing,
    relaxed: Timing,
}

impl Default for SessionControl {
    fn default() -> Self {
        Self {
            standard: Timing {
                p2_ms: 50,
                p2_star_ms: 2000,
            },
            relaxed: Timing {
                p2_ms: 5000,
                p2_star_ms: 5000,
            },
        }
    }
}

impl SessionControl {
    /// Override the timing profiles.
    pub fn with_timings(standard: Timing, relaxed: Timing) -> Self {
        Self { standard, relaxed }
    }

    /// Register the 0x10 handler.
    pub fn mount(self, server: &mut UdsServer) {
        let Self { standard, relaxed } = self;
        server.register(ServiceNode::new(
            "session_ctrl",
            Event::SessionControl,
            priority::NORMAL,
            move |_, args| {
                let Args::SessionControl(args) = args else {
                    return Outcome::NotMine;
                };
                match args.requested {
                    0x01 => {
                        args.p2_ms = standard.p2_ms;
                        args.p2_star_ms = standard.p2_star_ms;
                        Outcome::Handled
                    }
                    0x02 | 0x03 => {
                        args.p2_ms = relaxed.p2_ms;
                        args.p2_star_ms = relaxed.p2_star_ms;
                        Outcome::Handled
                    }
                    _ => Outcome::Deny(Nrc::SubFunctionNotSupportedInActiveSession),
                }
            },
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    #[test]
    fn default_session_gets_standard_timing() {
        let mut server = UdsServer::new();
        SessionControl::default().mount(&mut server);
        let mut tp = MockTransport::new();

        tp.push_payload(&[0x10, 0x01], false);
        server.poll(&mut tp);
        assert_eq!(
            tp.last_sent().unwrap().0,
            vec![0x50, 0x01, 0x00, 0x32, 0x07, 0xD0]
        );
    }

    #[test]
    fn reserved_session_is_rejected_with_0x7e() {
        let mut server = UdsServer::new();
        SessionControl::default().mount(&mut server);
        let mut tp = MockTransport::new();

        tp.push_payload(&[0x10, 0x55], false);
        server.poll(&mut tp);
        assert_eq!(tp.last_sent().unwrap().0, vec![0x7F, 0x10, 0x7E]);
    }
}
