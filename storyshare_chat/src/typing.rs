use chat_api::UserId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Throttles repeated typing signals per (sender, receiver) pair.
pub struct TypingTracker {
    last: Mutex<HashMap<(UserId, UserId), Instant>>,
    debounce: Duration,
}

impl TypingTracker {
    pub fn new(debounce: Duration) -> Self {
        Self {
            last: Mutex::new(HashMap::new()),
            debounce,
        }
    }

    /// Register a typing action. Returns true if the event should be forwarded.
    pub fn typing(&self, from: UserId, to: UserId) -> bool {
        let mut guard = self.last.lock();
        let key = (from, to);
        let now = Instant::now();
        let should = match guard.get(&key) {
            Some(&prev) => now.duration_since(prev) >= self.debounce,
            None => true,
        };
        if should {
            guard.insert(key, now);
        }
        should
    }

    /// Clear the pair so the next typing action is forwarded immediately.
    pub fn stop(&self, from: UserId, to: UserId) {
        self.last.lock().remove(&(from, to));
    }

    /// Forget every pair started by `from`.
    pub fn forget(&self, from: UserId) {
        self.last.lock().retain(|(sender, _), _| *sender != from);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debounce_logic() {
        let tracker = TypingTracker::new(Duration::from_secs(2));
        assert!(tracker.typing(1, 2));
        assert!(!tracker.typing(1, 2));
        assert!(tracker.typing(1, 3));
        tracker.stop(1, 2);
        assert!(tracker.typing(1, 2));
        tracker.forget(1);
        assert!(tracker.typing(1, 3));
    }

    #[test]
    fn zero_debounce_forwards_everything() {
        let tracker = TypingTracker::new(Duration::ZERO);
        assert!(tracker.typing(1, 2));
        assert!(tracker.typing(1, 2));
    }
}
