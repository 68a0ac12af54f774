use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Opaque handle for a scheduled entry
///
/// Tokens are assigned from a monotonically increasing counter and are
/// unique for the lifetime of their entry; a value is never reissued while
/// its entry is still pending.
pub type TaskToken = u64;

/// An ordered collection of timed entries
///
/// The queue is kept sorted by ascending deadline; ties are broken by
/// scheduling order. Entries are removed when they fire or are cancelled,
/// never mutated in place.
pub struct DelayQueue<T> {
    entries: BTreeMap<(Instant, TaskToken), T>,
    deadlines: HashMap<TaskToken, Instant>,
    next_token: TaskToken,
}

impl<T> DelayQueue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            deadlines: HashMap::new(),
            next_token: 1,
        }
    }

    /// Number of pending entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Schedule `value` to become due `delay` from now
    ///
    /// A zero delay is due immediately but still only fires when the owner
    /// next drains the queue, never synchronously from this call.
    pub fn schedule(&mut self, delay: Duration, value: T) -> TaskToken {
        let token = self.next_token;
        self.next_token += 1;
        let deadline = Instant::now() + delay;
        self.entries.insert((deadline, token), value);
        self.deadlines.insert(token, deadline);
        token
    }

    /// Cancel a pending entry, returning its value
    ///
    /// Returns `None` when the token already fired or was never scheduled;
    /// after cancellation the entry can no longer fire.
    pub fn cancel(&mut self, token: TaskToken) -> Option<T> {
        let deadline = self.deadlines.remove(&token)?;
        self.entries.remove(&(deadline, token))
    }

    /// Whether a token still refers to a pending entry
    pub fn contains(&self, token: TaskToken) -> bool {
        self.deadlines.contains_key(&token)
    }

    /// Time until the earliest deadline, `Duration::ZERO` when overdue
    pub fn time_until_next(&self, now: Instant) -> Option<Duration> {
        self.entries
            .keys()
            .next()
            .map(|(deadline, _)| deadline.saturating_duration_since(now))
    }

    /// Remove and return every entry whose deadline has passed, in order
    pub fn pop_due(&mut self, now: Instant) -> Vec<(TaskToken, T)> {
        let mut due = Vec::new();
        while let Some((&(deadline, token), _)) = self.entries.iter().next() {
            if deadline > now {
                break;
            }
            let value = self.entries.remove(&(deadline, token)).unwrap();
            self.deadlines.remove(&token);
            due.push((token, value));
        }
        due
    }
}

impl<T> Default for DelayQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_due_in_deadline_order() {
        let mut queue = DelayQueue::new();
        queue.schedule(Duration::from_millis(10), "a");
        queue.schedule(Duration::from_millis(5), "b");
        queue.schedule(Duration::from_millis(0), "c");

        let later = Instant::now() + Duration::from_millis(50);
        let due: Vec<_> = queue.pop_due(later).into_iter().map(|(_, v)| v).collect();
        assert_eq!(due, vec!["c", "b", "a"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_not_due_yet() {
        let mut queue = DelayQueue::new();
        queue.schedule(Duration::from_secs(60), "later");
        assert!(queue.pop_due(Instant::now()).is_empty());
        assert_eq!(queue.len(), 1);

        let wait = queue.time_until_next(Instant::now()).unwrap();
        assert!(wait > Duration::from_secs(59));
    }

    #[test]
    fn test_cancel_prevents_firing() {
        let mut queue = DelayQueue::new();
        let a = queue.schedule(Duration::ZERO, "a");
        let b = queue.schedule(Duration::ZERO, "b");

        assert_eq!(queue.cancel(b), Some("b"));
        assert!(!queue.contains(b));
        // Cancelling again is a no-op
        assert_eq!(queue.cancel(b), None);

        let later = Instant::now() + Duration::from_millis(1);
        let due = queue.pop_due(later);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, a);
    }

    #[test]
    fn test_tokens_unique_across_identical_deadlines() {
        let mut queue = DelayQueue::new();
        let tokens: Vec<_> = (0..100)
            .map(|i| queue.schedule(Duration::ZERO, i))
            .collect();
        let mut unique = tokens.clone();
        unique.dedup();
        assert_eq!(unique.len(), tokens.len());
        assert_eq!(queue.len(), 100);
    }

    #[test]
    fn test_overdue_wait_is_zero() {
        let mut queue = DelayQueue::new();
        queue.schedule(Duration::ZERO, ());
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(queue.time_until_next(Instant::now()), Some(Duration::ZERO));
    }
}
