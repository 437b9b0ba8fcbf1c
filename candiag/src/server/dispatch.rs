//! The event dispatch table: a priority-ordered chain of service nodes per
//! event kind, with observer (`Continue`) semantics.

use tracing::debug;

use crate::nrc::Nrc;
use crate::server::ServerState;

/// Priority buckets for service nodes. Lower runs earlier; ties keep
/// registration order.
pub mod priority {
    /// Runs before everything else (logging, timeouts).
    pub const HIGHEST: u8 = 0;
    /// Early observers.
    pub const HIGH: u8 = 64;
    /// Regular service handlers.
    pub const NORMAL: u8 = 128;
    /// Late handlers.
    pub const LOW: u8 = 192;
    /// Fallbacks.
    pub const LOWEST: u8 = 255;
}

/// The closed set of dispatchable event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    SessionControl,
    EcuReset,
    DoScheduledReset,
    ReadDataByIdent,
    WriteDataByIdent,
    SecurityRequestSeed,
    SecurityValidateKey,
    CommControl,
    IoControl,
    RoutineControl,
    RequestFileTransfer,
    TransferData,
    RequestTransferExit,
    SessionTimeout,
}

impl Event {
    /// Number of event kinds (table size).
    pub const COUNT: usize = 14;

    fn index(self) -> usize {
        match self {
            Event::SessionControl => 0,
            Event::EcuReset => 1,
            Event::DoScheduledReset => 2,
            Event::ReadDataByIdent => 3,
            Event::WriteDataByIdent => 4,
            Event::SecurityRequestSeed => 5,
            Event::SecurityValidateKey => 6,
            Event::CommControl => 7,
            Event::IoControl => 8,
            Event::RoutineControl => 9,
            Event::RequestFileTransfer => 10,
            Event::TransferData => 11,
            Event::RequestTransferExit => 12,
            Event::SessionTimeout => 13,
        }
    }
}

/// Handler verdict, triaged by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Request recognised and served; stop the chain.
    Handled,
    /// Request recognised but needs more time: emit `0x78` and re-invoke on
    /// later polls.
    Pending,
    /// Observer: processed, but later handlers still run.
    Continue,
    /// Not this handler's request (wrong DID / sub-function); try the next.
    NotMine,
    /// Request recognised and rejected; stop the chain with this NRC.
    Deny(Nrc),
}

/// Result of running a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// Serve a positive response.
    Positive,
    /// Send `0x78` and re-dispatch later.
    Pending,
    /// Serve a negative response.
    Negative(Nrc),
}

/// Event payloads, exhaustive per event kind. Response bytes are written
/// into the `Vec` slots; negotiated values flow back through plain fields.
pub enum Args<'a> {
    SessionControl(SessionControlArgs),
    EcuReset(EcuResetArgs),
    DoScheduledReset {
        /// Sub-function of the accepted 0x11 request.
        reset_type: u8,
    },
    ReadDataByIdent(ReadDataArgs),
    WriteDataByIdent(WriteDataArgs<'a>),
    SecurityRequestSeed(RequestSeedArgs),
    SecurityValidateKey(ValidateKeyArgs<'a>),
    CommControl(CommControlArgs),
    IoControl(IoControlArgs<'a>),
    RoutineControl(RoutineControlArgs<'a>),
    RequestFileTransfer(FileTransferArgs<'a>),
    TransferData(TransferDataArgs<'a>),
    RequestTransferExit(TransferExitArgs<'a>),
    SessionTimeout,
}

/// 0x10 arguments; the handler writes the timing values back.
pub struct SessionControlArgs {
    pub requested: u8,
    pub p2_ms: u16,
    pub p2_star_ms: u16,
}

/// 0x11 arguments; the handler schedules the reset via `power_down_ms`.
pub struct EcuResetArgs {
    pub reset_type: u8,
    pub power_down_ms: Option<u32>,
}

/// One 0x22 lookup; the handler appends the datum to `data`.
pub struct ReadDataArgs {
    pub did: u16,
    pub data: Vec<u8>,
}

/// 0x2E arguments.
pub struct WriteDataArgs<'a> {
    pub did: u16,
    pub data: &'a [u8],
}

/// 0x27 odd sub-function; the handler writes the seed bytes.
pub struct RequestSeedArgs {
    pub level: u8,
    pub seed: Vec<u8>,
}

/// 0x27 even sub-function; `level` is the paired odd level.
pub struct ValidateKeyArgs<'a> {
    pub level: u8,
    pub key: &'a [u8],
}

/// 0x28 arguments; `node_id` only for sub-functions 0x04/0x05.
pub struct CommControlArgs {
    pub ctrl: u8,
    pub comm: u8,
    pub node_id: Option<u16>,
}

/// 0x2F arguments; the handler writes the control status record.
pub struct IoControlArgs<'a> {
    pub did: u16,
    pub param: u8,
    pub state: &'a [u8],
    pub response: Vec<u8>,
}

/// 0x31 arguments; the handler writes the routine status record.
pub struct RoutineControlArgs<'a> {
    pub sub_function: u8,
    pub rid: u16,
    pub option: &'a [u8],
    pub record: Vec<u8>,
}

/// 0x38 arguments. `file_size` is client-supplied for uploads;
/// `read_size` is filled by the handler for downloads, and `max_block_len`
/// carries the negotiated block length back to the core.
pub struct FileTransferArgs<'a> {
    pub mode: u8,
    pub path: &'a [u8],
    pub data_format: u8,
    pub file_size: u32,
    pub max_block_len: u16,
    pub read_size: Option<u32>,
}

/// 0x36 arguments; `max_resp_len` bounds what the handler may write into
/// `response` on downloads.
pub struct TransferDataArgs<'a> {
    pub sequence: u8,
    pub data: &'a [u8],
    pub max_resp_len: u16,
    pub response: Vec<u8>,
}

/// 0x37 arguments.
pub struct TransferExitArgs<'a> {
    pub data: &'a [u8],
    pub response: Vec<u8>,
}

/// Handler signature: service nodes own their state through the closure.
pub type Handler = Box<dyn FnMut(&mut ServerState, &mut Args<'_>) -> Outcome>;

/// One registered handler entry.
pub struct ServiceNode {
    /// Debug name, shown in the service dump.
    pub name: &'static str,
    /// Event kind this node binds.
    pub event: Event,
    /// Execution priority (ascending = earlier).
    pub priority: u8,
    handler: Handler,
}

impl ServiceNode {
    /// Build a node from a handler closure.
    pub fn new(
        name: &'static str,
        event: Event,
        priority: u8,
        handler: impl FnMut(&mut ServerState, &mut Args<'_>) -> Outcome + 'static,
    ) -> Self {
        Self {
            name,
            event,
            priority,
            handler: Box::new(handler),
        }
    }
}

/// Event kind → priority-ordered handler chain.
pub struct EventTable {
    chains: Vec<Vec<ServiceNode>>,
}

impl EventTable {
    /// Empty table.
    pub fn new() -> Self {
        Self {
            chains: (0..Event::COUNT).map(|_| Vec::new()).collect(),
        }
    }

    /// Insert a node into its event chain, ordered by ascending priority;
    /// equal priorities keep insertion order.
    pub fn register(&mut self, node: ServiceNode) {
        let chain = &mut self.chains[node.event.index()];
        let at = chain
            .iter()
            .position(|existing| node.priority < existing.priority)
            .unwrap_or(chain.len());
        debug!(name = node.name, event = ?node.event, priority = node.priority, "service registered");
        chain.insert(at, node);
    }

    /// Run the chain for `event`.
    pub fn dispatch(
        &mut self,
        state: &mut ServerState,
        event: Event,
        args: &mut Args<'_>,
    ) -> DispatchResult {
        let chain = &mut self.chains[event.index()];
        if chain.is_empty() {
            return DispatchResult::Negative(Nrc::ServiceNotSupported);
        }

        let mut observed = false;
        for node in chain.iter_mut() {
            match (node.handler)(state, args) {
                Outcome::Handled => return DispatchResult::Positive,
                Outcome::Pending => return DispatchResult::Pending,
                Outcome::Continue => {
                    observed = true;
                }
                Outcome::NotMine => {}
                Outcome::Deny(nrc) => return DispatchResult::Negative(nrc),
            }
        }

        if observed {
            DispatchResult::Positive
        } else {
            DispatchResult::Negative(Nrc::ServiceNotSupported)
        }
    }

    /// Registered handler names for an event, in execution order.
    pub fn handler_names(&self, event: Event) -> Vec<&'static str> {
        self.chains[event.index()]
            .iter()
            .map(|node| node.name)
            .collect()
    }
}

impl Default for EventTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServerState;

    fn run(table: &mut EventTable, event: Event) -> DispatchResult {
        let mut state = ServerState::new();
        let mut args = Args::SessionTimeout;
        table.dispatch(&mut state, event, &mut args)
    }

    #[test]
    fn empty_chain_yields_service_not_supported() {
        let mut table = EventTable::new();
        assert_eq!(
            run(&mut table, Event::SessionControl),
            DispatchResult::Negative(Nrc::ServiceNotSupported)
        );
    }

    #[test]
    fn observers_plus_terminal_handler_yield_one_positive() {
        let mut table = EventTable::new();
        for name in ["obs-a", "obs-b", "obs-c"] {
            table.register(ServiceNode::new(
                name,
                Event::SessionTimeout,
                priority::HIGH,
                |_, _| Outcome::Continue,
            ));
        }
        table.register(ServiceNode::new(
            "terminal",
            Event::SessionTimeout,
            priority::NORMAL,
            |_, _| Outcome::Handled,
        ));

        assert_eq!(
            run(&mut table, Event::SessionTimeout),
            DispatchResult::Positive
        );
    }

    #[test]
    fn all_observers_report_positive_at_end_of_chain() {
        let mut table = EventTable::new();
        table.register(ServiceNode::new(
            "obs",
            Event::SessionTimeout,
            priority::NORMAL,
            |_, _| Outcome::Continue,
        ));
        assert_eq!(
            run(&mut table, Event::SessionTimeout),
            DispatchResult::Positive
        );
    }

    #[test]
    fn not_mine_falls_through_and_ends_unsupported() {
        let mut table = EventTable::new();
        table.register(ServiceNode::new(
            "other",
            Event::IoControl,
            priority::NORMAL,
            |_, _| Outcome::NotMine,
        ));
        assert_eq!(
            run(&mut table, Event::IoControl),
            DispatchResult::Negative(Nrc::ServiceNotSupported)
        );
    }

    #[test]
    fn deny_stops_the_chain() {
        use std::cell::Cell;
        use std::rc::Rc;

        let later_ran = Rc::new(Cell::new(false));
        let flag = later_ran.clone();

        let mut table = EventTable::new();
        table.register(ServiceNode::new(
            "deny",
            Event::RoutineControl,
            priority::NORMAL,
            |_, _| Outcome::Deny(Nrc::SecurityAccessDenied),
        ));
        table.register(ServiceNode::new(
            "later",
            Event::RoutineControl,
            priority::LOW,
            move |_, _| {
                flag.set(true);
                Outcome::Handled
            },
        ));

        assert_eq!(
            run(&mut table, Event::RoutineControl),
            DispatchResult::Negative(Nrc::SecurityAccessDenied)
        );
        assert!(!later_ran.get());
    }

    #[test]
    fn priorities_execute_in_ascending_order_with_stable_ties() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
        let mut table = EventTable::new();

        for (name, prio) in [
            ("late", priority::LOW),
            ("first-normal", priority::NORMAL),
            ("early", priority::HIGHEST),
            ("second-normal", priority::NORMAL),
        ] {
            let order = order.clone();
            table.register(ServiceNode::new(
                name,
                Event::SessionTimeout,
                prio,
                move |_, _| {
                    order.borrow_mut().push(name);
                    Outcome::Continue
                },
            ));
        }

        run(&mut table, Event::SessionTimeout);
        assert_eq!(
            &*order.borrow(),
            &["early", "first-normal", "second-normal", "late"]
        );
    }
}
