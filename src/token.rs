//! Generates unique 32-bit correlation tokens (§4.D).

use std::sync::atomic::{AtomicU32, Ordering};

/// The space tokens wrap around in: `2^31 - 1`, per spec.
const WRAP_AT: u32 = (1u32 << 31) - 1;

/// A monotone, atomically incrementing token counter. Wraps back to 0 once
/// it reaches [`WRAP_AT`]. The protocol treats tokens as opaque; distinct
/// ranges may be reserved by constructing multiple factories if desired.
pub struct TokenFactory {
    next: AtomicU32,
}

impl TokenFactory {
    /// Creates a factory starting at `seed` (default 0).
    pub fn new(seed: u32) -> Self {
        Self {
            next: AtomicU32::new(seed % (WRAP_AT + 1)),
        }
    }

    /// Atomically returns the next token and advances the counter.
    pub fn next_token(&self) -> u32 {
        self.next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(if current >= WRAP_AT { 0 } else { current + 1 })
            })
            .unwrap()
    }

    /// Like [`next_token`](Self::next_token), but retries (up to
    /// `max_attempts`) while `is_taken` reports a collision, failing if
    /// every attempt collides.
    pub fn next_unique_token(
        &self,
        max_attempts: usize,
        is_taken: impl Fn(u32) -> bool,
    ) -> Option<u32> {
        for _ in 0..max_attempts {
            let token = self.next_token();
            if !is_taken(token) {
                return Some(token);
            }
        }
        None
    }
}

impl Default for TokenFactory {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn tokens_increase_monotonically() {
        let factory = TokenFactory::default();
        let a = factory.next_token();
        let b = factory.next_token();
        assert_eq!(b, a + 1);
    }

    #[test]
    fn tokens_wrap_at_the_boundary() {
        let factory = TokenFactory::new(WRAP_AT);
        assert_eq!(factory.next_token(), WRAP_AT);
        assert_eq!(factory.next_token(), 0);
    }

    #[test]
    fn concurrent_callers_never_observe_a_duplicate() {
        let factory = Arc::new(TokenFactory::default());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let factory = Arc::clone(&factory);
            handles.push(std::thread::spawn(move || {
                (0..1000).map(move |_| factory.next_token()).collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            for token in handle.join().unwrap() {
                assert!(seen.insert(token), "duplicate token {}", token);
            }
        }
    }

    #[test]
    fn unique_token_retries_past_collisions() {
        let factory = TokenFactory::default();
        let taken = [0u32, 1, 2];
        let token = factory
            .next_unique_token(10, |t| taken.contains(&t))
            .unwrap();
        assert!(!taken.contains(&token));
    }

    #[test]
    fn unique_token_gives_up_after_max_attempts() {
        let factory = TokenFactory::default();
        let token = factory.next_unique_token(3, |_| true);
        assert!(token.is_none());
    }
}
