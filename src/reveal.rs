//! Word-by-word reveal of a growing source text.
//!
//! The scheduler is a synchronous state machine; a timer (see
//! `view::drive_view`) calls [`RevealScheduler::tick`] at a fixed interval.
//! The displayed text is always a prefix of the source, and once the source is
//! finished and fully revealed the two are equal.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref TOKEN_RE: Regex = Regex::new(r"\S+\s*|\s+").expect("Invalid token regex");
}

/// Splits text into reveal units: a word with its trailing whitespace, or a
/// leading whitespace run. Concatenating the tokens yields the input exactly.
pub fn tokenize(text: &str) -> Vec<&str> {
    TOKEN_RE.find_iter(text).map(|m| m.as_str()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevealState {
    Idle,
    Revealing,
    Complete,
}

#[derive(Debug, Clone)]
pub struct RevealScheduler {
    state: RevealState,
    source: String,
    source_finished: bool,
    /// Byte length of the revealed prefix of `source`.
    cursor: usize,
    animate: bool,
    has_animated: bool,
    cancelled: bool,
}

impl RevealScheduler {
    /// `animate` is false for messages loaded from history; those render in
    /// full immediately.
    pub fn new(animate: bool) -> Self {
        Self {
            state: RevealState::Idle,
            source: String::new(),
            source_finished: false,
            cursor: 0,
            animate,
            has_animated: false,
            cancelled: false,
        }
    }

    pub fn state(&self) -> RevealState {
        self.state
    }

    pub fn display_text(&self) -> &str {
        &self.source[..self.cursor]
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn source_finished(&self) -> bool {
        self.source_finished
    }

    pub fn is_complete(&self) -> bool {
        self.state == RevealState::Complete
    }

    fn passthrough(&self) -> bool {
        !self.animate || self.has_animated
    }

    /// Replaces the observed source. A source that does not extend the
    /// previous one is treated as a new text and revealed from the start.
    pub fn observe(&mut self, source: &str, finished: bool) {
        if self.cancelled {
            return;
        }
        if !source.starts_with(self.source.as_str()) {
            self.cursor = 0;
            if self.state != RevealState::Idle {
                self.state = RevealState::Revealing;
            }
        }
        self.source.clear();
        self.source.push_str(source);
        self.source_finished = finished;
        self.advance_state();
    }

    /// Appends to the source.
    pub fn extend(&mut self, delta: &str) {
        if self.cancelled || self.source_finished {
            return;
        }
        self.source.push_str(delta);
        self.advance_state();
    }

    /// Marks the source as final. Pending tokens keep revealing.
    pub fn finish_source(&mut self) {
        if self.cancelled {
            return;
        }
        self.source_finished = true;
        self.advance_state();
    }

    fn advance_state(&mut self) {
        if self.state == RevealState::Idle && !self.source.is_empty() {
            self.state = RevealState::Revealing;
        }
        if self.passthrough() {
            self.cursor = self.source.len();
        }
        self.check_complete();
    }

    fn check_complete(&mut self) {
        if self.state != RevealState::Complete
            && self.source_finished
            && self.cursor == self.source.len()
        {
            self.state = RevealState::Complete;
            self.has_animated = true;
        }
    }

    /// Reveals the next token. Returns whether the display text changed.
    ///
    /// While the source is still growing, a trailing word with no whitespace
    /// after it is held back since more of it may arrive.
    pub fn tick(&mut self) -> bool {
        if self.cancelled || self.state != RevealState::Revealing {
            return false;
        }

        let rest = &self.source[self.cursor..];
        let mut changed = false;
        if let Some(m) = TOKEN_RE.find(rest) {
            let token = m.as_str();
            let open_word = m.end() == rest.len() && !token.ends_with(char::is_whitespace);
            if !open_word || self.source_finished {
                self.cursor += m.end();
                changed = true;
            }
        }

        self.check_complete();
        changed
    }

    /// Reveals everything observed so far at once.
    pub fn skip(&mut self) -> bool {
        if self.cancelled {
            return false;
        }
        let changed = self.cursor != self.source.len();
        self.cursor = self.source.len();
        self.has_animated = true;
        if self.state == RevealState::Idle && !self.source.is_empty() {
            self.state = RevealState::Revealing;
        }
        self.check_complete();
        changed
    }

    /// Stops revealing. The display text stays where it is.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn pending_bytes(&self) -> usize {
        self.source.len() - self.cursor
    }
}
