//! Service 0x2F: InputOutputControlByIdentifier.
//!
//! Hardware points register as [`IoService`] nodes keyed by DID. The
//! framework tracks the override flag: ShortTermAdjustment and
//! FreezeCurrentState seize the signal, ReturnControlToECU and
//! ResetToDefault release it, and a session timeout releases every
//! overridden node with an implicit ReturnControl.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{info, warn};

use crate::UdsServer;
use crate::nrc::Nrc;
use crate::server::dispatch::{Args, Event, Outcome, ServiceNode, priority};
use crate::IoAction;

/// Per-DID hardware callback.
///
/// `response` receives the control status record for the positive response.
pub type IoHandler = Box<dyn FnMut(u16, IoAction, &[u8], &mut Vec<u8>) -> Result<(), Nrc>>;

struct IoNode {
    did: u16,
    handler: IoHandler,
    is_overridden: bool,
}

/// The 0x2F service: a registry of IO nodes.
#[derive(Clone)]
pub struct IoService {
    nodes: Rc<RefCell<Vec<IoNode>>>,
}

impl IoService {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            nodes: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Register a hardware point.
    pub fn add_node(
        &self,
        did: u16,
        handler: impl FnMut(u16, IoAction, &[u8], &mut Vec<u8>) -> Result<(), Nrc> + 'static,
    ) {
        self.nodes.borrow_mut().push(IoNode {
            did,
            handler: Box::new(handler),
            is_overridden: false,
        });
    }

    /// Whether the DID is currently seized by diagnostics; `None` when the
    /// DID is not registered.
    pub fn is_overridden(&self, did: u16) -> Option<bool> {
        self.nodes
            .borrow()
            .iter()
            .find(|node| node.did == did)
            .map(|node| node.is_overridden)
    }

    /// Register the control and timeout nodes.
    pub fn mount(&self, server: &mut UdsServer) {
        let nodes = self.nodes.clone();
        server.register(ServiceNode::new(
            "io_ctrl",
            Event::IoControl,
            priority::NORMAL,
            move |_, args| {
                let Args::IoControl(args) = args else {
                    return Outcome::NotMine;
                };
                let mut nodes = nodes.borrow_mut();
                let Some(node) = nodes.iter_mut().find(|node| node.did == args.did) else {
                    return Outcome::NotMine;
                };
                let Some(action) = IoAction::from_param(args.param) else {
                    return Outcome::Deny(Nrc::RequestOutOfRange);
                };

                info!(did = format_args!("0x{:04X}", args.did), ?action, "io control");
                match (node.handler)(args.did, action, args.state, &mut args.response) {
                    Ok(()) => {
                        if action.takes_override() {
                            node.is_overridden = true;
                        } else {
                            node.is_overridden = false;
                        }
                        Outcome::Handled
                    }
                    Err(nrc) => Outcome::Deny(nrc),
                }
            },
        ));

        let nodes = self.nodes.clone();
        server.register(ServiceNode::new(
            "io_timeout",
            Event::SessionTimeout,
            priority::HIGH,
            move |_, args| {
                let Args::SessionTimeout = args else {
                    return Outcome::NotMine;
                };
                let mut scratch = Vec::new();
                for node in nodes.borrow_mut().iter_mut() {
                    if !node.is_overridden {
                        continue;
                    }
                    warn!(did = format_args!("0x{:04X}", node.did), "auto-releasing io override");
                    scratch.clear();
                    if let Err(nrc) =
                        (node.handler)(node.did, IoAction::ReturnControl, &[], &mut scratch)
                    {
                        warn!(did = node.did, %nrc, "release callback failed");
                    }
                    // The flag clears regardless, to stay consistent with the
                    // session state.
                    node.is_overridden = false;
                }
                Outcome::Continue
            },
        ));
    }
}

impl Default for IoService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServerConfig;
    use crate::services::session::SessionControl;
    use crate::transport::mock::MockTransport;
    use std::time::Duration;

    fn io_server() -> (UdsServer, IoService, Rc<RefCell<Vec<u8>>>) {
        let mut server = UdsServer::with_config(ServerConfig {
            s3_timeout: Duration::from_millis(20),
        });
        SessionControl::default().mount(&mut server);
        let io = IoService::new();
        let signal: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(vec![0x00]));
        let hw = signal.clone();
        io.add_node(0x0100, move |_, action, input, response| {
            match action {
                IoAction::ShortTermAdjustment => {
                    *hw.borrow_mut() = input.to_vec();
                }
                IoAction::ReturnControl | IoAction::ResetToDefault => {
                    *hw.borrow_mut() = vec![0x00];
                }
                IoAction::FreezeCurrent => {}
            }
            response.extend_from_slice(&hw.borrow());
            Ok(())
        });
        io.mount(&mut server);
        (server, io, signal)
    }

    #[test]
    fn short_term_adjustment_sets_the_override_flag() {
        let (mut server, io, signal) = io_server();
        let mut tp = MockTransport::new();

        tp.push_payload(&[0x2F, 0x01, 0x00, 0x03, 0x01, 0x00, 0x00], false);
        server.poll(&mut tp);
        let (resp, _) = tp.last_sent().unwrap();
        assert_eq!(&resp[..4], &[0x6F, 0x01, 0x00, 0x03]);
        assert_eq!(*signal.borrow(), vec![0x01, 0x00, 0x00]);
        assert_eq!(io.is_overridden(0x0100), Some(true));
    }

    #[test]
    fn return_control_clears_the_override_flag() {
        let (mut server, io, _signal) = io_server();
        let mut tp = MockTransport::new();

        tp.push_payload(&[0x2F, 0x01, 0x00, 0x03, 0x01], false);
        server.poll(&mut tp);
        tp.push_payload(&[0x2F, 0x01, 0x00, 0x00], false);
        server.poll(&mut tp);
        assert_eq!(io.is_overridden(0x0100), Some(false));
    }

    #[test]
    fn unknown_did_falls_through_the_chain() {
        let (mut server, _io, _signal) = io_server();
        let mut tp = MockTransport::new();

        tp.push_payload(&[0x2F, 0xAB, 0xCD, 0x00], false);
        server.poll(&mut tp);
        assert_eq!(tp.last_sent().unwrap().0, vec![0x7F, 0x2F, 0x11]);
    }

    #[test]
    fn session_timeout_releases_every_override() {
        let (mut server, io, signal) = io_server();
        let mut tp = MockTransport::new();

        // Extended session, then seize the signal.
        tp.push_payload(&[0x10, 0x03], false);
        server.poll(&mut tp);
        tp.push_payload(&[0x2F, 0x01, 0x00, 0x03, 0x01], false);
        server.poll(&mut tp);
        assert_eq!(io.is_overridden(0x0100), Some(true));

        std::thread::sleep(Duration::from_millis(40));
        server.poll(&mut tp);

        assert_eq!(io.is_overridden(0x0100), Some(false));
        assert_eq!(*signal.borrow(), vec![0x00]);
    }
}
