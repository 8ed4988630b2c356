use std::collections::HashSet;
use std::fmt;
use std::mem;

use parking_lot::Mutex;

use crate::key::MetricKey;
use crate::protocol::hash_set_value;
use crate::publisher::Publisher;

/// Counts the number of unique reported values.
///
/// Members are hashed into 32-bit values and deduplicated locally. Every flush reports the members
/// observed since the previous flush, the agent counts the distinct members over its aggregation
/// window.
#[derive(Debug)]
pub struct Set {
    members: Mutex<HashSet<u32>>,
    active: bool,
}

impl Set {
    pub(crate) fn new() -> Self {
        Self {
            members: Mutex::new(HashSet::new()),
            active: true,
        }
    }

    pub(crate) fn inert() -> Self {
        Self {
            active: false,
            ..Self::new()
        }
    }

    /// Records a member of the set.
    pub fn observe(&self, value: &str) {
        self.observe_hash(hash_set_value(value));
    }

    /// Records a member of the set using its `Display` representation.
    pub fn observe_display(&self, value: impl fmt::Display) {
        self.observe(&value.to_string());
    }

    /// Records an already hashed member.
    #[inline]
    pub fn observe_hash(&self, hash: u32) {
        if self.active {
            self.members.lock().insert(hash);
        }
    }

    fn take(&self) -> Vec<u32> {
        let members = mem::take(&mut *self.members.lock());
        let mut members: Vec<u32> = members.into_iter().collect();
        members.sort_unstable();
        members
    }

    pub(crate) fn publish(&self, key: &MetricKey, publisher: &mut dyn Publisher) {
        let members = self.take();
        if !members.is_empty() {
            publisher.set(key, &members);
        }
    }
}
