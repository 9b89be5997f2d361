//! Mock runner for testing without a live model or network.
//!
//! [`MockRunner`] is a [`LocalRunner`] returning pre-configured responses in
//! order (cycling when exhausted), split into whitespace tokens so streaming
//! paths see a realistic multi-chunk sequence.

use std::sync::atomic::{AtomicUsize, Ordering};

use super::local::LocalRunner;
use crate::error::Result;
use crate::options::ChatOptions;
use crate::types::Message;

/// A test runner that replays canned responses in order.
#[derive(Debug)]
pub struct MockRunner {
    responses: Vec<String>,
    index: AtomicUsize,
}

impl MockRunner {
    /// Runner with the given canned responses. Cycles when exhausted.
    pub fn new(responses: Vec<String>) -> Self {
        assert!(
            !responses.is_empty(),
            "MockRunner requires at least one response"
        );
        Self {
            responses,
            index: AtomicUsize::new(0),
        }
    }

    /// Runner that always returns the same response.
    pub fn fixed(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }

    fn next_response(&self) -> String {
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % self.responses.len();
        self.responses[idx].clone()
    }
}

impl LocalRunner for MockRunner {
    fn generate(
        &self,
        _messages: &[Message],
        _options: &ChatOptions,
    ) -> Result<Box<dyn Iterator<Item = String> + Send>> {
        let response = self.next_response();
        // Split into word tokens, keeping the separating spaces so the
        // concatenation reproduces the original text.
        let mut tokens = Vec::new();
        for (i, word) in response.split(' ').enumerate() {
            if i > 0 {
                tokens.push(" ".to_string());
            }
            if !word.is_empty() {
                tokens.push(word.to_string());
            }
        }
        Ok(Box::new(tokens.into_iter()))
    }

    fn model_name(&self) -> String {
        "mock".to_string()
    }
}
