use parking_lot::Mutex;

use super::ResourceError;

/// Host-provided number generator. Shared across threads, so every
/// implementation synchronizes internally.
pub trait Sequence: Send + Sync {
    /// Advance and return the new value.
    fn next_value(&self) -> Result<i64, ResourceError>;

    /// Value last returned by `next_value`, or the start value before the
    /// first call.
    fn current_value(&self) -> Result<i64, ResourceError>;

    /// Rewind to the start value.
    fn reset(&self) -> Result<(), ResourceError>;
}

#[derive(Debug)]
struct SequenceState {
    current: i64,
    started: bool,
}

/// Counter from `start` by `step`.
#[derive(Debug)]
pub struct InMemorySequence {
    start: i64,
    step: i64,
    state: Mutex<SequenceState>,
}

impl InMemorySequence {
    pub fn new(start: i64, step: i64) -> Self {
        Self {
            start,
            step,
            state: Mutex::new(SequenceState {
                current: start,
                started: false,
            }),
        }
    }
}

impl Default for InMemorySequence {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

impl Sequence for InMemorySequence {
    fn next_value(&self) -> Result<i64, ResourceError> {
        let mut state = self.state.lock();
        if state.started {
            state.current =
                state.current.checked_add(self.step).ok_or(ResourceError::OutOfRange("long"))?;
        } else {
            state.started = true;
        }
        Ok(state.current)
    }

    fn current_value(&self) -> Result<i64, ResourceError> {
        Ok(self.state.lock().current)
    }

    fn reset(&self) -> Result<(), ResourceError> {
        let mut state = self.state.lock();
        state.current = self.start;
        state.started = false;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn first_next_returns_start() {
        let seq = InMemorySequence::new(10, 5);
        assert_eq!(seq.current_value().unwrap(), 10);
        assert_eq!(seq.next_value().unwrap(), 10);
        assert_eq!(seq.next_value().unwrap(), 15);
        assert_eq!(seq.current_value().unwrap(), 15);
        seq.reset().unwrap();
        assert_eq!(seq.next_value().unwrap(), 10);
    }

    #[test]
    fn shared_between_threads() {
        let seq = Arc::new(InMemorySequence::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let seq = Arc::clone(&seq);
                std::thread::spawn(move || (0..25).for_each(|_| drop(seq.next_value())))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(seq.current_value().unwrap(), 100);
    }

    #[test]
    fn overflow_is_reported() {
        let seq = InMemorySequence::new(i64::MAX, 1);
        seq.next_value().unwrap();
        assert_eq!(seq.next_value(), Err(ResourceError::OutOfRange("long")));
    }
}
