//! Per-persona reply decisions and context reduction.
//!
//! A strategy is owned by exactly one persona instance. It remembers the last
//! message it looked at and when it last fired on a keyword, and decides for
//! each new message whether the persona should answer and with what history.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::chatbot::message::{BotIdentity, ChatMessage, MessageKind};
use crate::chatbot::timing::Clock;
use crate::config::PersonaConfig;

pub struct ReplyStrategy {
    bot: BotIdentity,
    persona: Arc<PersonaConfig>,
    private_chat: bool,
    clock: Arc<dyn Clock>,
    last_processed_id: Option<String>,
    last_trigger_at: Option<DateTime<Utc>>,
}

impl ReplyStrategy {
    pub fn new(
        bot: BotIdentity,
        persona: Arc<PersonaConfig>,
        private_chat: bool,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            bot,
            persona,
            private_chat,
            clock,
            last_processed_id: None,
            last_trigger_at: None,
        }
    }

    pub fn last_processed_id(&self) -> Option<&str> {
        self.last_processed_id.as_deref()
    }

    /// Decide whether to answer `current`, given the chat history `snapshot`
    /// (ordered oldest first). Returns the reduced context to send to the
    /// completion service, or `None` to stay quiet.
    pub fn decide(&mut self, current: &ChatMessage, snapshot: &[ChatMessage]) -> Option<Vec<ChatMessage>> {
        if current.sender.name == self.persona.name {
            return None;
        }

        if self.private_chat || current.reply_to_id.as_deref() == Some(self.bot.id.as_str()) {
            self.mark_processed(snapshot);
            return Some(self.reduce(snapshot));
        }

        let window = self.unprocessed(snapshot);

        if window.iter().any(|m| self.is_mandatory(m)) {
            debug!("{} hit a mandatory trigger", self.persona.name);
            self.mark_processed(snapshot);
            return Some(self.reduce(snapshot));
        }

        let now = self.clock.now();
        if self.persona.cooldown_enabled
            && let Some(last) = self.last_trigger_at
            && now - last < self.persona.cooldown
        {
            debug!("{} is cooling down", self.persona.name);
            self.mark_processed(snapshot);
            return None;
        }

        if !window.iter().any(|m| self.is_trigger(m)) {
            return None;
        }

        self.mark_processed(snapshot);
        self.last_trigger_at = Some(now);
        Some(self.reduce(snapshot))
    }

    /// Bound `snapshot` to what this persona should see, newest messages
    /// first, and open it with the persona's directive.
    pub fn reduce(&self, snapshot: &[ChatMessage]) -> Vec<ChatMessage> {
        let size = self.persona.context_size;
        let half_chars = self.persona.context_chars / 2;
        let mut addressed = Bucket::new(size, half_chars);
        let mut background = Bucket::new(size / 2, half_chars);

        for message in snapshot.iter().rev() {
            if addressed.is_full() && background.is_full() {
                break;
            }
            let message = self.as_seen_by_persona(message);
            if self.is_trigger(&message) || self.is_own(&message) {
                addressed.offer(message);
            } else {
                background.offer(message);
            }
        }

        let mut seen = HashSet::new();
        let mut context: Vec<ChatMessage> = addressed
            .messages
            .into_iter()
            .chain(background.messages)
            .filter(|m| seen.insert(m.id.clone()))
            .collect();
        context.sort_by_key(|m| m.timestamp);
        if context.len() > size {
            context.drain(..context.len() - size);
        }

        context.insert(0, ChatMessage::directive(&self.persona.name, self.persona.directive.clone()));
        context
    }

    /// Messages after the last processed one, minus this persona's own.
    fn unprocessed<'a>(&self, snapshot: &'a [ChatMessage]) -> Vec<&'a ChatMessage> {
        let start = self
            .last_processed_id
            .as_ref()
            .and_then(|id| snapshot.iter().position(|m| &m.id == id))
            .map(|pos| pos + 1)
            .unwrap_or(0);
        snapshot[start..]
            .iter()
            .filter(|m| m.sender.name != self.persona.name)
            .collect()
    }

    fn mark_processed(&mut self, snapshot: &[ChatMessage]) {
        if let Some(newest) = snapshot.last() {
            self.last_processed_id = Some(newest.id.clone());
        }
    }

    fn is_own(&self, message: &ChatMessage) -> bool {
        message.kind == MessageKind::BotOwn && message.sender.name == self.persona.name
    }

    /// Another persona's answer is shown as a user turn, not as our own words.
    fn as_seen_by_persona(&self, message: &ChatMessage) -> ChatMessage {
        if message.kind == MessageKind::BotOwn && !self.is_own(message) {
            message.as_user_turn()
        } else {
            message.clone()
        }
    }

    fn is_mandatory(&self, message: &ChatMessage) -> bool {
        self.persona
            .mandatory_triggers
            .iter()
            .any(|t| t.is_match(&message.text))
    }

    fn is_trigger(&self, message: &ChatMessage) -> bool {
        if self.is_mandatory(message) {
            return true;
        }
        let text = message.text.to_lowercase();
        self.persona.triggers.iter().any(|k| text.contains(k.as_str()))
    }
}

/// Newest-first accumulator bounded by count and characters. Closes for good
/// once either bound would be crossed, so it always holds a contiguous run.
struct Bucket {
    max_count: usize,
    max_chars: usize,
    chars: usize,
    closed: bool,
    messages: Vec<ChatMessage>,
}

impl Bucket {
    fn new(max_count: usize, max_chars: usize) -> Self {
        Self {
            max_count,
            max_chars,
            chars: 0,
            closed: max_count == 0,
            messages: Vec::new(),
        }
    }

    fn is_full(&self) -> bool {
        self.closed
    }

    fn offer(&mut self, message: ChatMessage) {
        if self.closed {
            return;
        }
        let len = message.text.chars().count();
        if self.chars + len > self.max_chars {
            self.closed = true;
            return;
        }
        self.chars += len;
        self.messages.push(message);
        if self.messages.len() >= self.max_count {
            self.closed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chatbot::timing::ManualClock;
    use chrono::{TimeDelta, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn persona() -> PersonaConfig {
        PersonaConfig::new("Marvin", "You are Marvin.")
            .with_triggers(["robot"])
            .with_mandatory_triggers(["marvin"])
            .unwrap()
    }

    fn strategy(persona: PersonaConfig, private_chat: bool) -> (ReplyStrategy, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let strategy = ReplyStrategy::new(
            BotIdentity::new("bot-1", "Marvin"),
            Arc::new(persona),
            private_chat,
            clock.clone(),
        );
        (strategy, clock)
    }

    struct History {
        messages: Vec<ChatMessage>,
        clock: Arc<ManualClock>,
    }

    impl History {
        fn new(clock: Arc<ManualClock>) -> Self {
            Self { messages: Vec::new(), clock }
        }

        fn say(&mut self, sender: &str, text: &str) -> ChatMessage {
            let id = format!("m{}", self.messages.len());
            let msg = ChatMessage::user(id, sender, text, self.clock.now());
            self.messages.push(msg.clone());
            self.clock.advance(TimeDelta::seconds(1));
            msg
        }

        fn push(&mut self, msg: ChatMessage) -> ChatMessage {
            self.messages.push(msg.clone());
            self.clock.advance(TimeDelta::seconds(1));
            msg
        }
    }

    #[test]
    fn test_never_replies_to_self() {
        let (mut s, clock) = strategy(persona(), true);
        let mut h = History::new(clock);
        let msg = h.say("Marvin", "robot robot marvin");
        assert!(s.decide(&msg, &h.messages).is_none());
    }

    #[test]
    fn test_private_chat_always_replies() {
        let (mut s, clock) = strategy(persona(), true);
        let mut h = History::new(clock);
        let msg = h.say("Arthur", "nothing interesting");
        let context = s.decide(&msg, &h.messages).expect("private chat replies");
        assert_eq!(context.last().unwrap().id, msg.id);
        assert_eq!(s.last_processed_id(), Some(msg.id.as_str()));
    }

    #[test]
    fn test_reply_to_persona_always_replies() {
        let (mut s, clock) = strategy(persona(), false);
        let mut h = History::new(clock);
        let msg = h.push(ChatMessage::user("x", "Arthur", "what do you think", start()).replying_to("bot-1"));
        assert!(s.decide(&msg, &h.messages).is_some());

        let other = h.push(ChatMessage::user("y", "Arthur", "and you?", start()).replying_to("bot-2"));
        assert!(s.decide(&other, &h.messages).is_none());
    }

    #[test]
    fn test_no_trigger_stays_quiet() {
        let (mut s, clock) = strategy(persona(), false);
        let mut h = History::new(clock);
        let msg = h.say("Arthur", "lovely weather");
        assert!(s.decide(&msg, &h.messages).is_none());
    }

    #[test]
    fn test_keyword_is_case_insensitive_substring() {
        let (mut s, clock) = strategy(persona(), false);
        let mut h = History::new(clock);
        let msg = h.say("Arthur", "the ROBOTS are here");
        assert!(s.decide(&msg, &h.messages).is_some());
    }

    #[test]
    fn test_cooldown() {
        let (mut s, clock) = strategy(persona(), false);
        let mut h = History::new(clock.clone());

        let first = h.say("Arthur", "hey robot");
        assert!(s.decide(&first, &h.messages).is_some());

        clock.advance(TimeDelta::minutes(30));
        let second = h.say("Arthur", "robot again");
        assert!(s.decide(&second, &h.messages).is_none());

        // The first trigger fired at start+1s; land exactly one hour after it.
        clock.advance(TimeDelta::minutes(30) - TimeDelta::seconds(1));
        let third = ChatMessage::user("m-late", "Arthur", "robot, one more time", clock.now());
        h.messages.push(third.clone());
        assert!(s.decide(&third, &h.messages).is_some());
    }

    #[test]
    fn test_cooldown_disabled() {
        let mut config = persona();
        config.cooldown_enabled = false;
        let (mut s, clock) = strategy(config, false);
        let mut h = History::new(clock);
        let first = h.say("Arthur", "robot");
        assert!(s.decide(&first, &h.messages).is_some());
        let second = h.say("Arthur", "robot");
        assert!(s.decide(&second, &h.messages).is_some());
    }

    #[test]
    fn test_messages_during_cooldown_are_consumed() {
        let (mut s, clock) = strategy(persona(), false);
        let mut h = History::new(clock.clone());
        let first = h.say("Arthur", "robot");
        s.decide(&first, &h.messages);

        let during = h.say("Arthur", "robot during cooldown");
        assert!(s.decide(&during, &h.messages).is_none());

        clock.advance(TimeDelta::hours(2));
        let after = h.say("Arthur", "just chatting");
        assert!(s.decide(&after, &h.messages).is_none());
    }

    #[test]
    fn test_mandatory_trigger_bypasses_cooldown() {
        let (mut s, clock) = strategy(persona(), false);
        let mut h = History::new(clock);
        let first = h.say("Arthur", "robot");
        assert!(s.decide(&first, &h.messages).is_some());

        let urgent = h.say("Arthur", "Marvin, open the door");
        assert!(s.decide(&urgent, &h.messages).is_some());
        assert_eq!(s.last_processed_id(), Some(urgent.id.as_str()));

        // Already processed: the same mandatory message does not fire twice.
        let idle = h.say("Arthur", "ok");
        assert!(s.decide(&idle, &h.messages).is_none());
    }

    #[test]
    fn test_mandatory_trigger_does_not_start_cooldown() {
        let (mut s, clock) = strategy(persona(), false);
        let mut h = History::new(clock);
        let urgent = h.say("Arthur", "marvin?");
        assert!(s.decide(&urgent, &h.messages).is_some());
        let keyword = h.say("Arthur", "robot");
        assert!(s.decide(&keyword, &h.messages).is_some());
    }

    #[test]
    fn test_own_reply_does_not_retrigger() {
        let (mut s, clock) = strategy(persona(), false);
        let mut h = History::new(clock.clone());
        let me = BotIdentity::new("bot-1", "Marvin");

        let first = h.say("Arthur", "hey robot");
        assert!(s.decide(&first, &h.messages).is_some());

        // Written back after the decision, so it is still unprocessed.
        h.push(ChatMessage::bot_own(
            "bot-1:out",
            &me,
            "Marvin here, brain the size of a planet. Robot, yes.",
            clock.now(),
        ));
        clock.advance(TimeDelta::seconds(10));
        let idle = h.say("Arthur", "ok thanks");
        assert!(s.decide(&idle, &h.messages).is_none());
    }

    #[test]
    fn test_mandatory_trigger_needs_whole_word() {
        let (mut s, clock) = strategy(persona(), false);
        let mut h = History::new(clock);
        let msg = h.say("Arthur", "marvinous day");
        assert!(s.decide(&msg, &h.messages).is_none());
    }

    #[test]
    fn test_reduce_prepends_directive() {
        let (s, clock) = strategy(persona(), false);
        let mut h = History::new(clock);
        h.say("Arthur", "hello");
        let context = s.reduce(&h.messages);
        assert_eq!(context[0].kind, MessageKind::System);
        assert_eq!(context[0].text, "You are Marvin.");
        assert_eq!(context[0].timestamp, DateTime::<Utc>::MIN_UTC);
        assert_eq!(context.len(), 2);
    }

    #[test]
    fn test_reduce_relabels_other_personas() {
        let (s, clock) = strategy(persona(), false);
        let mut h = History::new(clock.clone());
        let other = BotIdentity::new("bot-2", "Eddie");
        let me = BotIdentity::new("bot-1", "Marvin");
        h.push(ChatMessage::bot_own("e1", &other, "Hi there!", clock.now()));
        h.push(ChatMessage::bot_own("m1", &me, "Life. Don't talk to me about life.", clock.now()));

        let context = s.reduce(&h.messages);
        let eddie = context.iter().find(|m| m.id == "e1").unwrap();
        let mine = context.iter().find(|m| m.id == "m1").unwrap();
        assert_eq!(eddie.kind, MessageKind::User);
        assert_eq!(mine.kind, MessageKind::BotOwn);
    }

    #[test]
    fn test_reduce_bounds_buckets() {
        let mut config = persona();
        config.context_size = 4;
        let (s, clock) = strategy(config, false);
        let mut h = History::new(clock);
        for i in 0..10 {
            h.say("Arthur", &format!("chatter {i}"));
        }
        h.say("Arthur", "robot question");

        let context = s.reduce(&h.messages);
        // directive + 1 addressed + size/2 background
        assert_eq!(context.len(), 1 + 1 + 2);
        let texts: Vec<_> = context[1..].iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["chatter 8", "chatter 9", "robot question"]);
    }

    #[test]
    fn test_reduce_respects_character_budget() {
        let mut config = persona();
        config.context_chars = 40;
        let (s, clock) = strategy(config, false);
        let mut h = History::new(clock);
        h.say("Arthur", "this message is far too long to fit in the budget");
        h.say("Arthur", "short");

        let context = s.reduce(&h.messages);
        let texts: Vec<_> = context[1..].iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["short"]);
    }

    #[test]
    fn test_reduce_keeps_newest_and_orders_by_time() {
        let mut config = persona();
        config.context_size = 3;
        let (s, clock) = strategy(config, false);
        let mut h = History::new(clock);
        for i in 0..6 {
            h.say("Arthur", &format!("robot {i}"));
        }
        let context = s.reduce(&h.messages);
        let texts: Vec<_> = context[1..].iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["robot 3", "robot 4", "robot 5"]);
    }
}
