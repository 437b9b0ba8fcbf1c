//! Service 0x28: CommunicationControl.
//!
//! Global sub-functions (0x00–0x03) are applied by the server core after a
//! positive outcome. The node-scoped variants (0x04/0x05, enhanced address
//! information) cannot be applied by the core because only this service
//! knows the local node id; they are mapped to the equivalent global state
//! here, and silently acknowledged when the node id does not match.

use std::cell::Cell;
use std::rc::Rc;

use tracing::{debug, info};

use crate::UdsServer;
use crate::nrc::Nrc;
use crate::server::CommState;
use crate::server::dispatch::{Args, Event, Outcome, ServiceNode, priority};

/// Control-type byte values.
pub mod ctrl {
    /// EnableRxAndTx.
    pub const ENABLE_RX_TX: u8 = 0x00;
    /// EnableRxAndDisableTx.
    pub const ENABLE_RX_DISABLE_TX: u8 = 0x01;
    /// DisableRxAndEnableTx.
    pub const DISABLE_RX_ENABLE_TX: u8 = 0x02;
    /// DisableRxAndTx.
    pub const DISABLE_RX_TX: u8 = 0x03;
    /// EnableRxAndDisableTxWithEnhancedAddressInformation.
    pub const ENABLE_RX_DISABLE_TX_EAI: u8 = 0x04;
    /// EnableRxAndTxWithEnhancedAddressInformation.
    pub const ENABLE_RX_TX_EAI: u8 = 0x05;
}

/// The 0x28 service.
pub struct CommControl {
    node_id: Rc<Cell<u16>>,
}

impl CommControl {
    /// Service bound to this server's node id.
    pub fn new(node_id: u16) -> Self {
        Self {
            node_id: Rc::new(Cell::new(node_id)),
        }
    }

    /// Update the node id at runtime.
    pub fn set_node_id(&self, node_id: u16) {
        self.node_id.set(node_id);
    }

    /// Register the 0x28 handler.
    pub fn mount(self, server: &mut UdsServer) {
        let node_id = self.node_id;
        server.register(ServiceNode::new(
            "comm_ctrl",
            Event::CommControl,
            priority::NORMAL,
            move |state, args| {
                let Args::CommControl(args) = args else {
                    return Outcome::NotMine;
                };

                // Global control: the core applies the state after the
                // positive outcome.
                if args.ctrl <= ctrl::DISABLE_RX_TX {
                    info!(ctrl = args.ctrl, comm = args.comm, "global communication control");
                    return Outcome::Handled;
                }

                let mapped = match args.ctrl {
                    ctrl::ENABLE_RX_DISABLE_TX_EAI => CommState::EnableRxDisableTx,
                    ctrl::ENABLE_RX_TX_EAI => CommState::EnableRxTx,
                    _ => return Outcome::Deny(Nrc::RequestOutOfRange),
                };

                match args.node_id {
                    Some(id) if id == node_id.get() => {
                        info!(node = id, state = ?mapped, "node-scoped communication control");
                        state.set_comm_state(mapped, args.comm);
                    }
                    Some(id) => {
                        debug!(node = id, own = node_id.get(), "node id mismatch, ignoring");
                    }
                    None => return Outcome::Deny(Nrc::IncorrectMessageLengthOrInvalidFormat),
                }
                Outcome::Handled
            },
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn server() -> UdsServer {
        let mut server = UdsServer::new();
        CommControl::new(0x0042).mount(&mut server);
        server
    }

    #[test]
    fn global_disable_tx_updates_the_selected_scope() {
        let mut server = server();
        let mut tp = MockTransport::new();

        tp.push_payload(&[0x28, 0x01, 0x01], false);
        server.poll(&mut tp);
        assert_eq!(tp.last_sent().unwrap().0, vec![0x68, 0x01]);
        assert!(!server.state().app_tx_enabled());
        assert!(server.state().nm_tx_enabled());
    }

    #[test]
    fn node_scoped_control_applies_only_to_matching_id() {
        let mut server = server();
        let mut tp = MockTransport::new();

        // Wrong node id: positive but ignored.
        tp.push_payload(&[0x28, 0x04, 0x03, 0x00, 0x99], false);
        server.poll(&mut tp);
        assert_eq!(tp.last_sent().unwrap().0, vec![0x68, 0x04]);
        assert!(server.state().app_tx_enabled());

        // Matching node id maps to the equivalent global state.
        tp.push_payload(&[0x28, 0x04, 0x03, 0x00, 0x42], false);
        server.poll(&mut tp);
        assert!(!server.state().app_tx_enabled());
        assert!(!server.state().nm_tx_enabled());
    }

    #[test]
    fn unknown_control_type_is_out_of_range() {
        let mut server = server();
        let mut tp = MockTransport::new();

        tp.push_payload(&[0x28, 0x06, 0x01], false);
        server.poll(&mut tp);
        assert_eq!(tp.last_sent().unwrap().0, vec![0x7F, 0x28, 0x31]);
    }
}
