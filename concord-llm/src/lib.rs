//! Concord LLM - Language Model Abstraction
//!
//! Provider-agnostic `generate(model, prompt, options) -> text` capability.
//! This crate defines the interface language models must implement plus the
//! small utilities every caller needs around it: a registry, usage tracking,
//! token estimation and retry with backoff. Actual provider clients are
//! user-supplied.

use async_trait::async_trait;
use concord_core::{ConcordError, ConcordResult, LlmError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

mod retry;

pub use retry::{RetryPolicy, RetryingModel};

// ============================================================================
// LANGUAGE MODEL TRAIT
// ============================================================================

/// Options for a single generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 1024,
            system_prompt: None,
        }
    }
}

impl GenerateOptions {
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }
}

/// A text generation backend.
/// Implementations must be thread-safe (Send + Sync).
///
/// # Example
/// ```ignore
/// struct HostedModel { /* http client */ }
///
/// #[async_trait]
/// impl LanguageModel for HostedModel {
///     async fn generate(&self, model: &str, prompt: &str, options: &GenerateOptions)
///         -> ConcordResult<String> {
///         // Call the provider API
///     }
///     fn provider_id(&self) -> &str { "hosted" }
/// }
/// ```
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Generate a completion for `prompt` using the named model.
    ///
    /// # Arguments
    /// * `model` - Provider-specific model name
    /// * `prompt` - Full prompt text
    /// * `options` - Sampling and length options
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        options: &GenerateOptions,
    ) -> ConcordResult<String>;

    /// Stable identifier of the provider, used in logs and errors.
    fn provider_id(&self) -> &str;
}

#[async_trait]
impl<T: LanguageModel + ?Sized> LanguageModel for Arc<T> {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        options: &GenerateOptions,
    ) -> ConcordResult<String> {
        (**self).generate(model, prompt, options).await
    }

    fn provider_id(&self) -> &str {
        (**self).provider_id()
    }
}

/// Rough token estimate: four characters per token, at least one for
/// non-empty text.
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    if chars == 0 {
        0
    } else {
        chars.div_ceil(4)
    }
}

// ============================================================================
// MODEL REGISTRY
// ============================================================================

/// Registry for language models.
/// Models must be explicitly registered - no auto-discovery.
///
/// # Example
/// ```ignore
/// let mut registry = ModelRegistry::new();
/// registry.register_default(Arc::new(my_model));
/// registry.register("rewrite", Arc::new(cheap_model));
///
/// let model = registry.get("rewrite")?;
/// ```
#[derive(Clone, Default)]
pub struct ModelRegistry {
    default: Option<Arc<dyn LanguageModel>>,
    named: HashMap<String, Arc<dyn LanguageModel>>,
}

impl ModelRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the fallback model. Replaces any previous default.
    pub fn register_default(&mut self, model: Arc<dyn LanguageModel>) {
        self.default = Some(model);
    }

    /// Register a model under a name. Replaces any previous registration.
    ///
    /// # Arguments
    /// * `name` - Lookup key, typically the model name passed to `generate`
    /// * `model` - The model implementation
    pub fn register(&mut self, name: impl Into<String>, model: Arc<dyn LanguageModel>) {
        self.named.insert(name.into(), model);
    }

    /// Get the model registered under `name`, falling back to the default.
    ///
    /// # Returns
    /// * `Ok(Arc<dyn LanguageModel>)` - The resolved model
    /// * `Err(ConcordError::Llm(LlmError::ProviderNotConfigured))` - If nothing matches
    pub fn get(&self, name: &str) -> ConcordResult<Arc<dyn LanguageModel>> {
        self.named
            .get(name)
            .cloned()
            .or_else(|| self.default.clone())
            .ok_or(ConcordError::Llm(LlmError::ProviderNotConfigured))
    }

    /// Get the default model.
    pub fn default_model(&self) -> ConcordResult<Arc<dyn LanguageModel>> {
        self.default
            .clone()
            .ok_or(ConcordError::Llm(LlmError::ProviderNotConfigured))
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    pub fn len(&self) -> usize {
        self.named.len() + usize::from(self.default.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.named.keys().collect();
        names.sort();
        f.debug_struct("ModelRegistry")
            .field("default", &self.default.as_ref().map(|m| m.provider_id()))
            .field("named", &names)
            .finish()
    }
}

// ============================================================================
// USAGE TRACKER
// ============================================================================

/// Tracks calls and token usage for language model operations.
/// Thread-safe via atomic operations.
#[derive(Default)]
pub struct UsageTracker {
    calls: AtomicU64,
    failures: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful call.
    ///
    /// # Arguments
    /// * `prompt_tokens` - Tokens sent
    /// * `completion_tokens` - Tokens received
    pub fn record_call(&self, prompt_tokens: u64, completion_tokens: u64) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.prompt_tokens.fetch_add(prompt_tokens, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(completion_tokens, Ordering::Relaxed);
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn prompt_tokens(&self) -> u64 {
        self.prompt_tokens.load(Ordering::Relaxed)
    }

    pub fn completion_tokens(&self) -> u64 {
        self.completion_tokens.load(Ordering::Relaxed)
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens() + self.completion_tokens()
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.calls.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.prompt_tokens.store(0, Ordering::Relaxed);
        self.completion_tokens.store(0, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for UsageTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageTracker")
            .field("calls", &self.calls())
            .field("failures", &self.failures())
            .field("prompt_tokens", &self.prompt_tokens())
            .field("completion_tokens", &self.completion_tokens())
            .finish()
    }
}

/// Wraps a model and records every call into a shared [`UsageTracker`].
pub struct MeteredModel<M> {
    inner: M,
    tracker: Arc<UsageTracker>,
}

impl<M: LanguageModel> MeteredModel<M> {
    pub fn new(inner: M, tracker: Arc<UsageTracker>) -> Self {
        Self { inner, tracker }
    }

    pub fn tracker(&self) -> &Arc<UsageTracker> {
        &self.tracker
    }
}

#[async_trait]
impl<M: LanguageModel> LanguageModel for MeteredModel<M> {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        options: &GenerateOptions,
    ) -> ConcordResult<String> {
        match self.inner.generate(model, prompt, options).await {
            Ok(text) => {
                self.tracker
                    .record_call(estimate_tokens(prompt), estimate_tokens(&text));
                Ok(text)
            }
            Err(e) => {
                self.tracker.record_failure();
                Err(e)
            }
        }
    }

    fn provider_id(&self) -> &str {
        self.inner.provider_id()
    }
}

// ============================================================================
// MOCK MODEL FOR TESTING
// ============================================================================

/// Mock language model that echoes the last line of the prompt behind a
/// prefix. Deterministic, never fails.
#[derive(Debug, Clone)]
pub struct MockLanguageModel {
    prefix: String,
}

impl MockLanguageModel {
    pub fn new() -> Self {
        Self {
            prefix: "Mock: ".to_string(),
        }
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for MockLanguageModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LanguageModel for MockLanguageModel {
    async fn generate(
        &self,
        _model: &str,
        prompt: &str,
        options: &GenerateOptions,
    ) -> ConcordResult<String> {
        let last = prompt.lines().last().unwrap_or_default();
        let max_chars = options.max_tokens as usize * 4;
        let truncated: String = last.chars().take(max_chars).collect();
        Ok(format!("{}{}", self.prefix, truncated))
    }

    fn provider_id(&self) -> &str {
        "mock"
    }
}

// ============================================================================
// UNIT TESTS
// ============================================================================


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_estimate_tokens_bounds(text in ".{0,200}") {
            let chars = text.chars().count() as u64;
            let tokens = estimate_tokens(&text);
            prop_assert!(tokens <= chars);
            prop_assert!(tokens * 4 >= chars);
        }
    }
}
