//! Test doubles for the generation service and helpers for draining flow events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::broadcast;

use weft_core::error::{Result, WeftError};
use weft_core::traits::GenerationService;
use weft_core::types::FlowEvent;

/// How the mock answers when no per-prompt script matches.
#[derive(Clone)]
enum Fallback {
    Echo,
    Constant(String),
    /// `"<system>(<input>)"` so tests can see which node produced what.
    Tagged,
}

#[derive(Clone, Default)]
struct Script {
    reply: Option<String>,
    error: Option<String>,
    delay: Option<Duration>,
    hang: bool,
}

/// Scripted [`GenerationService`] that records every call.
///
/// Scripts are keyed by system prompt, so tests give each node a distinct
/// system prompt and address it by that.
pub struct MockGenerator {
    fallback: Fallback,
    default_delay: Option<Duration>,
    scripts: HashMap<String, Script>,
    fail_first: Mutex<(usize, String)>,
    calls: Mutex<Vec<(String, String)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockGenerator {
    fn with_fallback(fallback: Fallback) -> Self {
        Self {
            fallback,
            default_delay: None,
            scripts: HashMap::new(),
            fail_first: Mutex::new((0, String::new())),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Returns the input unchanged.
    pub fn echo() -> Self {
        Self::with_fallback(Fallback::Echo)
    }

    /// Always returns `text`.
    pub fn constant(text: impl Into<String>) -> Self {
        Self::with_fallback(Fallback::Constant(text.into()))
    }

    /// Returns `"<system>(<input>)"`.
    pub fn tagged() -> Self {
        Self::with_fallback(Fallback::Tagged)
    }

    /// Delay every call by `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.default_delay = Some(delay);
        self
    }

    /// Reply `text` to calls under `system_prompt`.
    pub fn reply(mut self, system_prompt: &str, text: &str) -> Self {
        self.scripts.entry(system_prompt.to_string()).or_default().reply = Some(text.to_string());
        self
    }

    /// Fail calls under `system_prompt` with a request error carrying `message`.
    pub fn fail_on(mut self, system_prompt: &str, message: &str) -> Self {
        let script = self.scripts.entry(system_prompt.to_string()).or_default();
        script.error = Some(message.to_string());
        self
    }

    /// Delay calls under `system_prompt` by `delay`.
    pub fn delay_on(mut self, system_prompt: &str, delay: Duration) -> Self {
        self.scripts.entry(system_prompt.to_string()).or_default().delay = Some(delay);
        self
    }

    /// Calls under `system_prompt` never resolve.
    pub fn hang_on(mut self, system_prompt: &str) -> Self {
        self.scripts.entry(system_prompt.to_string()).or_default().hang = true;
        self
    }

    /// Fail the first `times` calls (any prompt) with a request error carrying `message`.
    pub fn fail_times(self, times: usize, message: &str) -> Self {
        if let Ok(mut guard) = self.fail_first.lock() {
            *guard = (times, message.to_string());
        }
        self
    }

    /// Every `(system_prompt, input)` pair received, in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Number of calls made under `system_prompt`.
    pub fn calls_for(&self, system_prompt: &str) -> usize {
        self.calls()
            .iter()
            .filter(|(sys, _)| sys == system_prompt)
            .count()
    }

    /// The input of the first call made under `system_prompt`.
    pub fn input_for(&self, system_prompt: &str) -> Option<String> {
        self.calls()
            .into_iter()
            .find(|(sys, _)| sys == system_prompt)
            .map(|(_, input)| input)
    }

    /// Highest number of calls that were in flight at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn respond(&self, system_prompt: &str, input: &str) -> Result<String> {
        if let Ok(mut guard) = self.fail_first.lock() {
            if guard.0 > 0 {
                guard.0 -= 1;
                return Err(WeftError::GenerationRequest(guard.1.clone()));
            }
        }

        let script = self.scripts.get(system_prompt);
        if let Some(message) = script.and_then(|s| s.error.clone()) {
            return Err(WeftError::GenerationRequest(message));
        }
        if let Some(reply) = script.and_then(|s| s.reply.clone()) {
            return Ok(reply);
        }

        Ok(match &self.fallback {
            Fallback::Echo => input.to_string(),
            Fallback::Constant(text) => text.clone(),
            Fallback::Tagged => format!("{}({})", system_prompt, input),
        })
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl GenerationService for MockGenerator {
    fn generate(&self, system_prompt: &str, input: &str) -> BoxFuture<'_, Result<String>> {
        let system_prompt = system_prompt.to_string();
        let input = input.to_string();

        Box::pin(async move {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push((system_prompt.clone(), input.clone()));
            }

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let _guard = InFlight(&self.in_flight);

            let script = self.scripts.get(&system_prompt).cloned().unwrap_or_default();
            if script.hang {
                futures::future::pending::<()>().await;
            }
            if let Some(delay) = script.delay.or(self.default_delay) {
                tokio::time::sleep(delay).await;
            }

            self.respond(&system_prompt, &input)
        })
    }
}

/// Drain every event currently buffered in `rx`.
pub fn drain_events(rx: &mut broadcast::Receiver<FlowEvent>) -> Vec<FlowEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}
