use std::collections::{HashSet, VecDeque};

/// Bounded set of inspected signatures. Past capacity the oldest is evicted.
#[derive(Debug, Clone)]
pub struct ProcessedSignatureSet {
    capacity: usize,
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl ProcessedSignatureSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            members: HashSet::new(),
        }
    }

    /// Oldest first, as persisted.
    pub fn from_signatures<I>(capacity: usize, signatures: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut set = Self::new(capacity);
        for sig in signatures {
            set.insert(sig);
        }
        set
    }

    /// Returns false when already present (no-op).
    pub fn insert(&mut self, signature: String) -> bool {
        if self.members.contains(&signature) {
            return false;
        }
        while self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        self.members.insert(signature.clone());
        self.order.push_back(signature);
        true
    }

    pub fn contains(&self, signature: &str) -> bool {
        self.members.contains(signature)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.order.iter().cloned().collect()
    }
}
