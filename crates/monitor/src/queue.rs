#![forbid(unsafe_code)]

use crate::domain::ClassificationToken;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

/// Token handoff from the poll thread to the analysis dispatcher.
///
/// Normal tokens go to the tail; `push_front` puts an urgent token ahead of
/// everything already queued. Pushing never blocks on the consumer.
#[derive(Debug, Default)]
pub struct EventQueue {
    tokens: Mutex<VecDeque<ClassificationToken>>,
    ready: Condvar,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&self, token: ClassificationToken) {
        self.tokens.lock().push_back(token);
        self.ready.notify_one();
    }

    pub fn push_front(&self, token: ClassificationToken) {
        self.tokens.lock().push_front(token);
        self.ready.notify_one();
    }

    /// Block until a token is available.
    pub fn pop(&self) -> ClassificationToken {
        let mut tokens = self.tokens.lock();
        loop {
            if let Some(token) = tokens.pop_front() {
                return token;
            }
            self.ready.wait(&mut tokens);
        }
    }

    pub fn try_pop(&self) -> Option<ClassificationToken> {
        self.tokens.lock().pop_front()
    }

    /// Remove tokens from the head while `keep_draining` accepts them.
    /// Returns how many were removed.
    pub fn drain_while(&self, mut keep_draining: impl FnMut(&ClassificationToken) -> bool) -> usize {
        let mut tokens = self.tokens.lock();
        let mut drained = 0;
        while tokens.front().is_some_and(&mut keep_draining) {
            tokens.pop_front();
            drained += 1;
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }
}
