use std::collections::BTreeMap;

/// Tracks work items that complete out of order and reports the last
/// value before which everything is done.
///
/// Each added value gets a local tag. The checkpointed value only moves
/// past a tag once every earlier tag has been removed too, so a
/// checkpoint taken from it never skips unfinished work.
#[derive(Debug)]
pub struct SequenceMap<V> {
    next_tag: u64,
    /// Outstanding tags; `true` once removed but blocked by an older one.
    pending: BTreeMap<u64, (V, bool)>,
    checkpointed_tag: u64,
    checkpointed_value: V,
}

impl<V: Clone> SequenceMap<V> {
    /// Start with `initial` as the checkpointed value.
    pub fn new(initial: V) -> Self {
        Self {
            next_tag: 1,
            pending: BTreeMap::new(),
            checkpointed_tag: 0,
            checkpointed_value: initial,
        }
    }

    pub fn add(&mut self, value: V) -> u64 {
        let tag = self.next_tag;
        self.next_tag += 1;
        self.pending.insert(tag, (value, false));
        tag
    }

    /// Mark `tag` done. Unknown or repeated tags are ignored.
    pub fn remove(&mut self, tag: u64) {
        if let Some(entry) = self.pending.get_mut(&tag) {
            entry.1 = true;
        }
        while let Some(entry) = self.pending.first_entry() {
            if !entry.get().1 {
                break;
            }
            let (tag, (value, _)) = entry.remove_entry();
            self.checkpointed_tag = tag;
            self.checkpointed_value = value;
        }
    }

    /// Highest tag with everything up to it done.
    pub fn checkpointed_tag(&self) -> u64 {
        self.checkpointed_tag
    }

    pub fn checkpointed_value(&self) -> &V {
        &self.checkpointed_value
    }

    /// Tags added but not yet removed.
    pub fn outstanding(&self) -> usize {
        self.pending.values().filter(|(_, done)| !done).count()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
