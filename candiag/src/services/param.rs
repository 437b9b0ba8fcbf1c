//! Services 0x22 / 0x2E: parameter management (RDBI / WDBI).

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::UdsServer;
use crate::nrc::Nrc;
use crate::server::dispatch::{Args, Event, Outcome, ServiceNode, priority};

/// Parameter backend keyed by 16-bit data identifiers.
pub trait ParamStore {
    /// Read the datum for `did`.
    fn read(&mut self, did: u16) -> Result<Vec<u8>, Nrc>;
    /// Write the datum for `did`.
    fn write(&mut self, did: u16, data: &[u8]) -> Result<(), Nrc>;
}

/// Simple in-memory backend. Unknown identifiers answer `RequestOutOfRange`
/// for both reads and writes; known identifiers accept any new value.
pub struct MemoryStore {
    entries: HashMap<u16, Vec<u8>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Store pre-populated with `(did, value)` pairs.
    pub fn with_entries(entries: impl IntoIterator<Item = (u16, Vec<u8>)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ParamStore for MemoryStore {
    fn read(&mut self, did: u16) -> Result<Vec<u8>, Nrc> {
        self.entries
            .get(&did)
            .cloned()
            .ok_or(Nrc::RequestOutOfRange)
    }

    fn write(&mut self, did: u16, data: &[u8]) -> Result<(), Nrc> {
        match self.entries.get_mut(&did) {
            Some(slot) => {
                *slot = data.to_vec();
                Ok(())
            }
            None => Err(Nrc::RequestOutOfRange),
        }
    }
}

/// RDBI/WDBI service over two backends.
///
/// Lookups try the *extended* set first; a `RequestOutOfRange` answer falls
/// through to the *general* set.
pub struct ParamService {
    extended: Rc<RefCell<dyn ParamStore>>,
    general: Rc<RefCell<dyn ParamStore>>,
}

impl ParamService {
    /// Build the service over its two backends.
    pub fn new(
        extended: Rc<RefCell<dyn ParamStore>>,
        general: Rc<RefCell<dyn ParamStore>>,
    ) -> Self {
        Self { extended, general }
    }

    /// Register the RDBI and WDBI nodes.
    pub fn mount(self, server: &mut UdsServer) {
        let extended = self.extended.clone();
        let general = self.general.clone();
        server.register(ServiceNode::new(
            "param_rdbi",
            Event::ReadDataByIdent,
            priority::NORMAL,
            move |_, args| {
                let Args::ReadDataByIdent(args) = args else {
                    return Outcome::NotMine;
                };
                let result = match extended.borrow_mut().read(args.did) {
                    Err(Nrc::RequestOutOfRange) => general.borrow_mut().read(args.did),
                    other => other,
                };
                match result {
                    Ok(data) => {
                        args.data = data;
                        Outcome::Handled
                    }
                    Err(Nrc::RequestOutOfRange) => Outcome::NotMine,
                    Err(nrc) => Outcome::Deny(nrc),
                }
            },
        ));

        let extended = self.extended;
        let general = self.general;
        server.register(ServiceNode::new(
            "param_wdbi",
            Event::WriteDataByIdent,
            priority::NORMAL,
            move |_, args| {
                let Args::WriteDataByIdent(args) = args else {
                    return Outcome::NotMine;
                };
                let result = match extended.borrow_mut().write(args.did, args.data) {
                    Err(Nrc::RequestOutOfRange) => general.borrow_mut().write(args.did, args.data),
                    other => other,
                };
                match result {
                    Ok(()) => Outcome::Handled,
                    Err(Nrc::RequestOutOfRange) => Outcome::NotMine,
                    Err(nrc) => Outcome::Deny(nrc),
                }
            },
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn service() -> (UdsServer, MockTransport) {
        let extended = Rc::new(RefCell::new(MemoryStore::with_entries([(
            0xF190,
            b"VIN123".to_vec(),
        )])));
        let general = Rc::new(RefCell::new(MemoryStore::with_entries([(
            0x0001,
            vec![0x00],
        )])));
        let mut server = UdsServer::new();
        ParamService::new(extended, general).mount(&mut server);
        (server, MockTransport::new())
    }

    #[test]
    fn lookup_falls_back_to_the_general_store() {
        let (mut server, mut tp) = service();
        tp.push_payload(&[0x22, 0x00, 0x01], false);
        server.poll(&mut tp);
        assert_eq!(tp.last_sent().unwrap().0, vec![0x62, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn write_then_read_back_round_trips() {
        let (mut server, mut tp) = service();

        tp.push_payload(&[0x2E, 0x00, 0x01, 0x5A], false);
        server.poll(&mut tp);
        assert_eq!(tp.last_sent().unwrap().0, vec![0x6E, 0x00, 0x01]);

        // Writing the same value again must succeed identically.
        tp.push_payload(&[0x2E, 0x00, 0x01, 0x5A], false);
        server.poll(&mut tp);
        assert_eq!(tp.last_sent().unwrap().0, vec![0x6E, 0x00, 0x01]);

        tp.push_payload(&[0x22, 0x00, 0x01], false);
        server.poll(&mut tp);
        assert_eq!(tp.last_sent().unwrap().0, vec![0x62, 0x00, 0x01, 0x5A]);
    }

    #[test]
    fn unknown_did_ends_the_chain_unsupported() {
        let (mut server, mut tp) = service();
        tp.push_payload(&[0x22, 0xBE, 0xEF], false);
        server.poll(&mut tp);
        assert_eq!(tp.last_sent().unwrap().0, vec![0x7F, 0x22, 0x11]);
    }
}
