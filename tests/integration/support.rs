//! Shared test doubles
//!
//! Scripted generation providers and small helpers used across the
//! integration tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use story_pipeline::services::execution::{ExecutorPolicy, FallbackChain, GenerationTarget};
use story_pipeline_llm::{LlmError, LlmProvider, LlmRequestOptions, LlmResponse, LlmResult, Message};

/// Provider that replays scripted replies, then repeats a default reply.
pub struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<LlmResult<String>>>,
    default_reply: Option<String>,
    calls: AtomicUsize,
    conversations: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            default_reply: None,
            calls: AtomicUsize::new(0),
            conversations: Mutex::new(Vec::new()),
        }
    }

    pub fn reply(self, text: &str) -> Self {
        self.script.lock().unwrap().push_back(Ok(text.to_string()));
        self
    }

    pub fn replies(self, text: &str, times: usize) -> Self {
        (0..times).fold(self, |p, _| p.reply(text))
    }

    pub fn fail(self, err: LlmError) -> Self {
        self.script.lock().unwrap().push_back(Err(err));
        self
    }

    pub fn always(mut self, text: &str) -> Self {
        self.default_reply = Some(text.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn conversations(&self) -> Vec<Vec<Message>> {
        self.conversations.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        "scripted"
    }

    async fn send_message(
        &self,
        messages: Vec<Message>,
        _system: Option<String>,
        _options: LlmRequestOptions,
    ) -> LlmResult<LlmResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.conversations.lock().unwrap().push(messages);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(text)) => Ok(LlmResponse::text(text, "scripted")),
            Some(Err(err)) => Err(err),
            None => match &self.default_reply {
                Some(text) => Ok(LlmResponse::text(text.clone(), "scripted")),
                None => Ok(LlmResponse::text("", "scripted")),
            },
        }
    }
}

/// Chain of named providers in declared order (priority = position)
pub fn chain(providers: &[(&str, Arc<ScriptedProvider>)]) -> FallbackChain {
    let targets = providers
        .iter()
        .enumerate()
        .map(|(idx, (name, provider))| {
            GenerationTarget::new(*name, idx as i32, provider.clone() as Arc<dyn LlmProvider>)
        })
        .collect();
    FallbackChain::new(targets).unwrap()
}

/// Default budgets (3 primary, 2 per fallback) with no backoff delay
pub fn fast_policy() -> ExecutorPolicy {
    ExecutorPolicy {
        backoff_base_ms: 0,
        ..ExecutorPolicy::default()
    }
}

/// `count` words of filler text split into sentences of `per_sentence` words
pub fn filler(count: usize, per_sentence: usize) -> String {
    let mut text = String::new();
    for i in 0..count {
        if i > 0 {
            text.push(' ');
        }
        text.push_str(&format!("w{}", i));
        if (i + 1) % per_sentence == 0 {
            text.push('.');
        }
    }
    if !text.ends_with('.') {
        text.push('.');
    }
    text
}
