//! Handler registration and payload validation.
//!
//! The registry is process-local and per-engine-instance: workers of other
//! processes sharing the same backend never consult it. Registration is
//! idempotent on name collision (last writer wins) and safe to call before
//! the first enqueue. Lookups clone the `Arc`ed entry out, so the lock is
//! never held across handler execution.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::error::QueueResult;

/// Boxed future returned by a handler invocation.
pub type HandlerFuture = Pin<Box<dyn Future<Output = QueueResult<Value>> + Send>>;

/// Type-erased handler callable.
pub type HandlerFn = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// Payload validator callable.
pub type ValidatorFn = Arc<dyn Fn(&Value) -> Validation + Send + Sync>;

/// Result of a payload validator.
#[derive(Debug, Clone)]
pub struct Validation {
    pub valid: bool,
    pub message: Option<String>,
}

impl Validation {
    pub fn ok() -> Self {
        Self {
            valid: true,
            message: None,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            message: Some(message.into()),
        }
    }
}

/// Per-handler policy overrides and validation hooks.
#[derive(Clone, Default)]
pub struct HandlerOptions {
    /// Retry cap for tasks of this handler, unless the task overrides it
    pub max_retries: Option<u32>,
    /// Processing budget for tasks of this handler, in milliseconds
    pub max_processing_time_ms: Option<u64>,
    /// Custom payload validator
    pub validator: Option<ValidatorFn>,
    /// Expected top-level payload keys; checked for presence when no
    /// validator is configured
    pub payload_keys: Vec<String>,
}

impl HandlerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn max_processing_time_ms(mut self, ms: u64) -> Self {
        self.max_processing_time_ms = Some(ms);
        self
    }

    pub fn validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value) -> Validation + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn payload_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.payload_keys = keys.into_iter().map(Into::into).collect();
        self
    }
}

impl std::fmt::Debug for HandlerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerOptions")
            .field("max_retries", &self.max_retries)
            .field("max_processing_time_ms", &self.max_processing_time_ms)
            .field("has_validator", &self.validator.is_some())
            .field("payload_keys", &self.payload_keys)
            .finish()
    }
}

/// A registered handler: the callable plus its options.
#[derive(Clone)]
pub struct HandlerEntry {
    pub func: HandlerFn,
    pub options: HandlerOptions,
}

impl std::fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Which mechanism produced a validation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationSource {
    /// The handler's custom validator ran
    Validator,
    /// Declared payload keys were checked for presence
    Auto,
    /// No validation is configured for this handler
    None,
}

/// Outcome of validating a payload against a handler's configuration.
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub message: Option<String>,
    pub source: ValidationSource,
}

impl ValidationOutcome {
    fn none() -> Self {
        Self {
            valid: true,
            message: None,
            source: ValidationSource::None,
        }
    }
}

/// Process-local mapping from handler name to entry.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, HandlerEntry>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a callable to a name. A second registration under the same name
    /// replaces the first.
    pub fn register<F, Fut>(&self, name: impl Into<String>, func: F, options: HandlerOptions)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = QueueResult<Value>> + Send + 'static,
    {
        let name = name.into();
        let entry = HandlerEntry {
            func: Arc::new(move |payload| Box::pin(func(payload)) as HandlerFuture),
            options,
        };

        let Ok(mut handlers) = self.handlers.write() else {
            tracing::error!(handler = %name, "registry lock poisoned, dropping registration");
            return;
        };
        if handlers.insert(name.clone(), entry).is_some() {
            tracing::debug!(handler = %name, "replaced existing handler registration");
        } else {
            tracing::debug!(handler = %name, "registered handler");
        }
    }

    /// Look up a handler entry by name.
    pub fn get(&self, name: &str) -> Option<HandlerEntry> {
        self.handlers.read().ok()?.get(name).cloned()
    }

    /// Whether a handler is registered under this name.
    pub fn is_registered(&self, name: &str) -> bool {
        self.handlers
            .read()
            .map(|h| h.contains_key(name))
            .unwrap_or(false)
    }

    /// All registered handler names, sorted.
    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Validate a payload against the handler's configuration.
    ///
    /// A custom validator wins; otherwise declared payload keys are checked
    /// for presence; otherwise the payload passes with `source = None`.
    /// An unregistered handler also yields `source = None`.
    pub fn validate(&self, name: &str, payload: &Value) -> ValidationOutcome {
        let Some(entry) = self.get(name) else {
            return ValidationOutcome::none();
        };

        if let Some(validator) = &entry.options.validator {
            let result = validator(payload);
            return ValidationOutcome {
                valid: result.valid,
                message: result.message,
                source: ValidationSource::Validator,
            };
        }

        if !entry.options.payload_keys.is_empty() {
            let missing: Vec<&str> = entry
                .options
                .payload_keys
                .iter()
                .filter(|key| payload.get(key.as_str()).is_none())
                .map(|key| key.as_str())
                .collect();

            return if missing.is_empty() {
                ValidationOutcome {
                    valid: true,
                    message: None,
                    source: ValidationSource::Auto,
                }
            } else {
                ValidationOutcome {
                    valid: false,
                    message: Some(format!("payload missing key(s): {}", missing.join(", "))),
                    source: ValidationSource::Auto,
                }
            };
        }

        ValidationOutcome::none()
    }
}
