//! Response registry: response SID → handler.

/// Append-only mapping from response SID (first payload byte) to a single
/// handler; re-registering a SID overwrites the previous entry.
pub struct ResponseRegistry {
    entries: Vec<(u8, Box<dyn FnMut(&[u8])>)>,
}

impl ResponseRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register (or replace) the handler for `sid`.
    pub fn register(&mut self, sid: u8, handler: impl FnMut(&[u8]) + 'static) {
        if let Some(entry) = self.entries.iter_mut().find(|(s, _)| *s == sid) {
            entry.1 = Box::new(handler);
        } else {
            self.entries.push((sid, Box::new(handler)));
        }
    }

    /// Dispatch a received payload to the handler for its first byte.
    pub fn dispatch(&mut self, payload: &[u8]) {
        let Some(&sid) = payload.first() else {
            return;
        };
        if let Some((_, handler)) = self.entries.iter_mut().find(|(s, _)| *s == sid) {
            handler(payload);
        }
    }
}

impl Default for ResponseRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn re_registering_overwrites_the_handler() {
        let hits = Rc::new(RefCell::new(Vec::new()));

        let mut registry = ResponseRegistry::new();
        let first = hits.clone();
        registry.register(0x62, move |_| first.borrow_mut().push("first"));
        let second = hits.clone();
        registry.register(0x62, move |_| second.borrow_mut().push("second"));

        registry.dispatch(&[0x62, 0x00]);
        assert_eq!(&*hits.borrow(), &["second"]);
    }

    #[test]
    fn unmatched_sid_is_ignored() {
        let mut registry = ResponseRegistry::new();
        registry.register(0x71, |_| panic!("wrong handler"));
        registry.dispatch(&[0x62, 0x00]);
        registry.dispatch(&[]);
    }
}
