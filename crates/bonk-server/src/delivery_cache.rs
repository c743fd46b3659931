use std::collections::{HashSet, VecDeque};

/// Bounded memory of webhook delivery ids; the oldest id is forgotten first.
#[derive(Debug)]
pub struct DeliveryCache {
    cap: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl DeliveryCache {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Records `delivery_id` and returns false when it was already seen.
    pub fn insert(&mut self, delivery_id: &str) -> bool {
        if self.seen.contains(delivery_id) {
            return false;
        }
        if self.order.len() >= self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(delivery_id.to_string());
        self.seen.insert(delivery_id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
