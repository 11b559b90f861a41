//! Text vs. voice cadence for one persona instance.

use crate::chatbot::messenger::ChatActivity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    Text,
    Voice,
}

impl ReplyMode {
    /// The signal shown to the chat while this kind of reply is prepared.
    pub fn activity(self) -> ChatActivity {
        match self {
            ReplyMode::Text => ChatActivity::Typing,
            ReplyMode::Voice => ChatActivity::RecordingVoice,
        }
    }
}

/// Counts replies and picks voice once every `cadence + 1` decisions.
#[derive(Debug)]
pub struct ReplyModePicker {
    cadence: u32,
    counter: u32,
}

impl ReplyModePicker {
    pub fn new(cadence: u32) -> Self {
        Self { cadence, counter: 0 }
    }

    pub fn pick(&mut self) -> ReplyMode {
        if self.cadence == 0 {
            return ReplyMode::Text;
        }
        self.counter += 1;
        if self.counter > self.cadence {
            self.counter = 0;
            ReplyMode::Voice
        } else {
            ReplyMode::Text
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_cadence_is_always_text() {
        let mut picker = ReplyModePicker::new(0);
        for _ in 0..10 {
            assert_eq!(picker.pick(), ReplyMode::Text);
        }
    }

    #[test]
    fn test_voice_after_cadence_exceeded() {
        let mut picker = ReplyModePicker::new(2);
        let modes: Vec<_> = (0..6).map(|_| picker.pick()).collect();
        assert_eq!(
            modes,
            vec![
                ReplyMode::Text,
                ReplyMode::Text,
                ReplyMode::Voice,
                ReplyMode::Text,
                ReplyMode::Text,
                ReplyMode::Voice,
            ]
        );
    }

    #[test]
    fn test_activity_matches_mode() {
        assert_eq!(ReplyMode::Text.activity(), ChatActivity::Typing);
        assert_eq!(ReplyMode::Voice.activity(), ChatActivity::RecordingVoice);
    }
}
