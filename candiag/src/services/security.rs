//! Service 0x27: SecurityAccess (seed & key).
//!
//! One instance per supported odd level; multiple instances can share the
//! event chain, each filtering on its own level. Seeds are single-use: any
//! key attempt and every session timeout clears the outstanding seed.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::UdsServer;
use crate::nrc::Nrc;
use crate::server::dispatch::{Args, Event, Outcome, ServiceNode, priority};

/// Key derivation plug. The default XOR derivation matches the demo ECU and
/// has no pre-image resistance; production deployments supply their own
/// algorithm here. Replay defence comes from seed single-use.
pub type KeyDerive = fn(seed: u32, secret: u32) -> u32;

/// Default demo derivation.
pub fn xor_derive(seed: u32, secret: u32) -> u32 {
    seed ^ secret
}

struct SecurityState {
    level: u8,
    secret: u32,
    /// Outstanding seed; 0 means none.
    seed: u32,
    derive: KeyDerive,
    seed_source: Box<dyn FnMut() -> u32>,
}

/// One security level instance.
pub struct SecurityAccess {
    inner: Rc<RefCell<SecurityState>>,
}

impl SecurityAccess {
    /// Instance for an odd request-seed `level` with its secret.
    ///
    /// The default seed source is the process RNG; production servers should
    /// inject a TRNG-backed source via [`SecurityAccess::with_seed_source`].
    pub fn new(level: u8, secret: u32) -> Self {
        debug_assert!(level % 2 == 1, "request-seed levels are odd");
        Self {
            inner: Rc::new(RefCell::new(SecurityState {
                level,
                secret,
                seed: 0,
                derive: xor_derive,
                seed_source: Box::new(rand::random::<u32>),
            })),
        }
    }

    /// Replace the key-derivation algorithm.
    pub fn with_derive(self, derive: KeyDerive) -> Self {
        self.inner.borrow_mut().derive = derive;
        self
    }

    /// Replace the seed source.
    pub fn with_seed_source(self, source: impl FnMut() -> u32 + 'static) -> Self {
        self.inner.borrow_mut().seed_source = Box::new(source);
        self
    }

    /// Register the request-seed, validate-key and timeout nodes.
    pub fn mount(self, server: &mut UdsServer) {
        let state = self.inner.clone();
        server.register(ServiceNode::new(
            "sec_seed",
            Event::SecurityRequestSeed,
            priority::NORMAL,
            move |server_state, args| {
                let Args::SecurityRequestSeed(args) = args else {
                    return Outcome::NotMine;
                };
                let mut sec = state.borrow_mut();
                if args.level != sec.level {
                    return Outcome::NotMine;
                }

                // ISO 14229-1: an already-unlocked level answers with a
                // zero seed and no state change.
                if server_state.security_level == args.level {
                    debug!(level = args.level, "already unlocked, sending zero seed");
                    args.seed = vec![0; 4];
                    return Outcome::Handled;
                }

                let mut seed = (sec.seed_source)();
                while seed == 0 {
                    seed = (sec.seed_source)();
                }
                sec.seed = seed;
                info!(level = args.level, "seed issued");
                args.seed = seed.to_be_bytes().to_vec();
                Outcome::Handled
            },
        ));

        let state = self.inner.clone();
        server.register(ServiceNode::new(
            "sec_key",
            Event::SecurityValidateKey,
            priority::NORMAL,
            move |_, args| {
                let Args::SecurityValidateKey(args) = args else {
                    return Outcome::NotMine;
                };
                let mut sec = state.borrow_mut();
                if args.level != sec.level {
                    return Outcome::NotMine;
                }
                if sec.seed == 0 {
                    warn!("key received without an outstanding seed");
                    return Outcome::Deny(Nrc::RequestSequenceError);
                }
                if args.key.len() != 4 {
                    return Outcome::Deny(Nrc::IncorrectMessageLengthOrInvalidFormat);
                }

                let Ok(key) = <[u8; 4]>::try_from(args.key) else {
                    return Outcome::Deny(Nrc::IncorrectMessageLengthOrInvalidFormat);
                };
                let received = u32::from_be_bytes(key);
                let expected = (sec.derive)(sec.seed, sec.secret);
                // Single-use: the seed dies with this attempt either way.
                sec.seed = 0;

                if received == expected {
                    Outcome::Handled
                } else {
                    warn!(level = args.level, "invalid key");
                    Outcome::Deny(Nrc::InvalidKey)
                }
            },
        ));

        let state = self.inner;
        server.register(ServiceNode::new(
            "sec_timeout",
            Event::SessionTimeout,
            priority::HIGH,
            move |_, args| {
                let Args::SessionTimeout = args else {
                    return Outcome::NotMine;
                };
                let mut sec = state.borrow_mut();
                if sec.seed != 0 {
                    debug!(level = sec.level, "session timeout, clearing seed");
                    sec.seed = 0;
                }
                Outcome::Continue
            },
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    const SECRET: u32 = 0xA5A5_A5A5;

    fn server_with_fixed_seed(seed: u32) -> UdsServer {
        let mut server = UdsServer::new();
        SecurityAccess::new(0x01, SECRET)
            .with_seed_source(move || seed)
            .mount(&mut server);
        server
    }

    #[test]
    fn seed_then_valid_key_unlocks() {
        let mut server = server_with_fixed_seed(0x1122_3344);
        let mut tp = MockTransport::new();

        tp.push_payload(&[0x27, 0x01], false);
        server.poll(&mut tp);
        assert_eq!(
            tp.last_sent().unwrap().0,
            vec![0x67, 0x01, 0x11, 0x22, 0x33, 0x44]
        );

        let key = (0x1122_3344u32 ^ SECRET).to_be_bytes();
        tp.push_payload(&[0x27, 0x02, key[0], key[1], key[2], key[3]], false);
        server.poll(&mut tp);
        assert_eq!(tp.last_sent().unwrap().0, vec![0x67, 0x02]);
        assert_eq!(server.state().security_level, 0x01);
    }

    #[test]
    fn key_without_seed_is_a_sequence_error() {
        let mut server = server_with_fixed_seed(0x1);
        let mut tp = MockTransport::new();

        tp.push_payload(&[0x27, 0x02, 0, 0, 0, 0], false);
        server.poll(&mut tp);
        assert_eq!(tp.last_sent().unwrap().0, vec![0x7F, 0x27, 0x24]);
    }

    #[test]
    fn wrong_key_consumes_the_seed() {
        let mut server = server_with_fixed_seed(0xDEAD_BEEF);
        let mut tp = MockTransport::new();

        tp.push_payload(&[0x27, 0x01], false);
        server.poll(&mut tp);

        tp.push_payload(&[0x27, 0x02, 0, 0, 0, 0], false);
        server.poll(&mut tp);
        assert_eq!(tp.last_sent().unwrap().0, vec![0x7F, 0x27, 0x35]);

        // Seed was cleared by the failed attempt: a retry must re-request.
        tp.push_payload(&[0x27, 0x02, 0, 0, 0, 0], false);
        server.poll(&mut tp);
        assert_eq!(tp.last_sent().unwrap().0, vec![0x7F, 0x27, 0x24]);
    }

    #[test]
    fn unlocked_level_answers_with_zero_seed() {
        let mut server = server_with_fixed_seed(0xCAFE_F00D);
        let mut tp = MockTransport::new();

        tp.push_payload(&[0x27, 0x01], false);
        server.poll(&mut tp);
        let key = (0xCAFE_F00Du32 ^ SECRET).to_be_bytes();
        tp.push_payload(&[0x27, 0x02, key[0], key[1], key[2], key[3]], false);
        server.poll(&mut tp);
        assert_eq!(server.state().security_level, 0x01);

        tp.push_payload(&[0x27, 0x01], false);
        server.poll(&mut tp);
        assert_eq!(tp.last_sent().unwrap().0, vec![0x67, 0x01, 0, 0, 0, 0]);
    }

    #[test]
    fn wrong_key_length_is_rejected() {
        let mut server = server_with_fixed_seed(0x5555_5555);
        let mut tp = MockTransport::new();

        tp.push_payload(&[0x27, 0x01], false);
        server.poll(&mut tp);
        tp.push_payload(&[0x27, 0x02, 0x01, 0x02], false);
        server.poll(&mut tp);
        assert_eq!(tp.last_sent().unwrap().0, vec![0x7F, 0x27, 0x13]);
    }

    #[test]
    fn other_levels_fall_through_the_chain() {
        let mut server = server_with_fixed_seed(0x1);
        let mut tp = MockTransport::new();

        tp.push_payload(&[0x27, 0x03], false);
        server.poll(&mut tp);
        assert_eq!(tp.last_sent().unwrap().0, vec![0x7F, 0x27, 0x11]);
    }
}
