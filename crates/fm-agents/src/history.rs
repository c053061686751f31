use std::collections::VecDeque;

use fm_harness::provider::Message;

/// Bounded conversation window for one agent instance.
///
/// Seed messages (system prompt plus the initial task briefing) are pinned;
/// everything after them is a rolling window. When the window overflows,
/// the oldest non-seed turns are dropped so the model always sees the
/// original assignment and the most recent exchange.
#[derive(Debug, Clone)]
pub struct Conversation {
    seed: Vec<Message>,
    turns: VecDeque<Message>,
    max_turns: usize,
}

impl Conversation {
    pub fn new(seed: Vec<Message>, max_turns: usize) -> Self {
        Self {
            seed,
            turns: VecDeque::new(),
            max_turns,
        }
    }

    pub fn push_assistant(&mut self, text: impl Into<String>) {
        self.turns.push_back(Message::assistant(text));
        self.trim();
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.turns.push_back(Message::user(text));
        self.trim();
    }

    /// Full message list for the next model call, seed first.
    pub fn messages(&self) -> Vec<Message> {
        self.seed
            .iter()
            .chain(self.turns.iter())
            .cloned()
            .collect()
    }

    /// Number of non-seed turns currently held.
    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }

    fn trim(&mut self) {
        while self.turns.len() > self.max_turns {
            self.turns.pop_front();
        }
    }
}
