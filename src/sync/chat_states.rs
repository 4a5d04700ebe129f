// Typing indicator for the open conversation
// A debounced flag: every typing event pushes the deadline out by the quiet window.

use log::debug;
use tokio::time::{Duration, Instant};

#[derive(Debug)]
pub struct TypingSignal {
    window: Duration,
    conversation_id: Option<String>,
    typing_user: Option<String>,
    deadline: Option<Instant>,
    // Bumped on every refresh so a stale decay timer can tell it lost
    generation: u64,
}

impl TypingSignal {
    pub fn new(window: Duration) -> Self {
        TypingSignal {
            window,
            conversation_id: None,
            typing_user: None,
            deadline: None,
            generation: 0,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Track a new open conversation; any previous indicator is dropped
    pub fn set_conversation(&mut self, conversation_id: Option<&str>) {
        self.conversation_id = conversation_id.map(|c| c.to_string());
        self.clear();
    }

    /// Handle `receive_typing`. Returns the generation to hand to the decay
    /// timer, or `None` when the event is ignored.
    pub fn on_typing(&mut self, conversation_id: &str, from_user: &str, self_id: &str, now: Instant) -> Option<u64> {
        if self.conversation_id.as_deref() != Some(conversation_id) || from_user == self_id {
            return None;
        }
        self.generation += 1;
        self.typing_user = Some(from_user.to_string());
        self.deadline = Some(now + self.window);
        debug!("{} typing in {} (gen {})", from_user, conversation_id, self.generation);
        Some(self.generation)
    }

    /// Decay timer fired. Only the timer of the latest refresh may clear the flag.
    ///
    /// Returns true if the flag went from on to off.
    pub fn expire(&mut self, generation: u64, now: Instant) -> bool {
        if generation != self.generation {
            return false;
        }
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.clear();
                true
            }
            _ => false,
        }
    }

    pub fn is_typing(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(deadline) if now < deadline)
    }

    pub fn typing_user(&self) -> Option<&str> {
        self.typing_user.as_deref()
    }

    fn clear(&mut self) {
        self.generation += 1;
        self.typing_user = None;
        self.deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal() -> TypingSignal {
        let mut signal = TypingSignal::new(Duration::from_secs(3));
        signal.set_conversation(Some("u1_u2"));
        signal
    }

    #[test]
    fn test_ignores_self_and_other_conversations() {
        let mut signal = signal();
        let now = Instant::now();
        assert!(signal.on_typing("u1_u2", "u1", "u1", now).is_none());
        assert!(signal.on_typing("u1_u3", "u3", "u1", now).is_none());
        assert!(!signal.is_typing(now));
    }

    #[test]
    fn test_decays_after_window() {
        let mut signal = signal();
        let start = Instant::now();
        let generation = signal.on_typing("u1_u2", "u2", "u1", start).unwrap();
        assert!(signal.is_typing(start + Duration::from_secs(2)));
        assert_eq!(signal.typing_user(), Some("u2"));
        assert!(signal.expire(generation, start + Duration::from_secs(3)));
        assert!(!signal.is_typing(start + Duration::from_secs(3)));
        assert_eq!(signal.typing_user(), None);
    }

    #[test]
    fn test_refresh_invalidates_old_timer() {
        let mut signal = signal();
        let start = Instant::now();
        let first = signal.on_typing("u1_u2", "u2", "u1", start).unwrap();
        let second = signal.on_typing("u1_u2", "u2", "u1", start + Duration::from_secs(2)).unwrap();

        // First timer fires at 3s: stale, flag stays on
        assert!(!signal.expire(first, start + Duration::from_secs(3)));
        assert!(signal.is_typing(start + Duration::from_secs(4)));
        assert!(signal.expire(second, start + Duration::from_secs(5)));
    }

    #[test]
    fn test_switching_conversation_clears() {
        let mut signal = signal();
        let now = Instant::now();
        let generation = signal.on_typing("u1_u2", "u2", "u1", now).unwrap();
        signal.set_conversation(Some("u1_u3"));
        assert!(!signal.is_typing(now));
        assert!(!signal.expire(generation, now + Duration::from_secs(3)));
    }
}
