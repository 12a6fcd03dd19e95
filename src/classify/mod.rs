//! 错误分类模块：将任意处理器错误映射为带标签的错误类别与重试画像。
//!
//! # Error Classification Module
//!
//! Every failure observed by the retry loop or the recovery manager is reduced to a
//! [`Classification`]: a typed [`ErrorCategory`] plus the retry profile that goes
//! with it (retryable flag, retry budget, backoff strategy, severity).
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`ErrorClassifier`] | Pluggable classifier interface |
//! | [`RuleBasedClassifier`] | Default classifier: typed downcasts first, then one rule per category |
//! | [`CategoryRule`] | A single category's matcher and retry profile |
//! | [`ClassifiedError`] | Error type processors return to pin a category explicitly |
//!
//! Typed errors always win over message patterns: a processor that returns a
//! [`ClassifiedError`] is never second-guessed by a regex.

mod rules;

pub use rules::{default_rules, CategoryRule, PatternRule};

use crate::resilience::BackoffStrategy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Tagged error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Timeout,
    RateLimit,
    Database,
    ExternalService,
    Resource,
    Validation,
    Orchestration,
    CircuitOpen,
    Configuration,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Database => "database",
            ErrorCategory::ExternalService => "external_service",
            ErrorCategory::Resource => "resource",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Orchestration => "orchestration",
            ErrorCategory::CircuitOpen => "circuit_open",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Business impact of a failure. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Result of classifying a single failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub category: ErrorCategory,
    pub retryable: bool,
    pub max_retries: u32,
    pub backoff: BackoffStrategy,
    pub severity: Severity,
}

impl Classification {
    pub fn new(category: ErrorCategory) -> Self {
        Self {
            category,
            retryable: false,
            max_retries: 0,
            backoff: BackoffStrategy::Exponential,
            severity: Severity::Medium,
        }
    }

    pub fn retryable(mut self, max_retries: u32) -> Self {
        self.retryable = true;
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }
}

/// Where a failure happened.
#[derive(Debug, Clone, Default)]
pub struct ClassifyContext {
    pub operation: String,
    /// 1-based attempt number that produced the failure.
    pub attempt: u32,
    pub batch_index: Option<usize>,
}

impl ClassifyContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            attempt: 0,
            batch_index: None,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_batch_index(mut self, index: usize) -> Self {
        self.batch_index = Some(index);
        self
    }
}

/// Pluggable error classifier.
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &anyhow::Error, ctx: &ClassifyContext) -> Classification;
}

/// Error a processor can return to state its category explicitly.
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub message: String,
    pub severity: Option<Severity>,
}

impl ClassifiedError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            severity: None,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.category, self.message)
    }
}

impl std::error::Error for ClassifiedError {}

/// Default classifier.
///
/// Resolution order: [`ClassifiedError`], then the runtime's own [`crate::Error`],
/// then `std::io::Error` and elapsed tokio timers, then the message rules in order.
pub struct RuleBasedClassifier {
    rules: Vec<Box<dyn CategoryRule>>,
}

impl RuleBasedClassifier {
    pub fn new() -> Self {
        Self {
            rules: default_rules(),
        }
    }

    /// Prepend a custom rule; it is consulted before the built-in ones.
    pub fn with_rule(mut self, rule: Box<dyn CategoryRule>) -> Self {
        self.rules.insert(0, rule);
        self
    }

    fn profile(&self, category: ErrorCategory) -> Classification {
        self.rules
            .iter()
            .find(|r| r.category() == category)
            .map(|r| r.classification())
            .unwrap_or_else(|| Classification::new(category))
    }

    fn typed_category(error: &anyhow::Error) -> Option<(ErrorCategory, Option<Severity>)> {
        if let Some(c) = error.downcast_ref::<ClassifiedError>() {
            return Some((c.category, c.severity));
        }
        if let Some(category) = error
            .downcast_ref::<crate::Error>()
            .and_then(|e| e.category_hint())
        {
            return Some((category, None));
        }
        if let Some(io) = error.downcast_ref::<std::io::Error>() {
            let category = match io.kind() {
                std::io::ErrorKind::TimedOut => ErrorCategory::Timeout,
                std::io::ErrorKind::InvalidData | std::io::ErrorKind::InvalidInput => {
                    ErrorCategory::Validation
                }
                _ => ErrorCategory::Network,
            };
            return Some((category, None));
        }
        if error.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return Some((ErrorCategory::Timeout, None));
        }
        None
    }
}

impl Default for RuleBasedClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier for RuleBasedClassifier {
    fn classify(&self, error: &anyhow::Error, ctx: &ClassifyContext) -> Classification {
        if let Some((category, severity)) = Self::typed_category(error) {
            let mut c = self.profile(category);
            if let Some(s) = severity {
                c.severity = s;
            }
            return c;
        }

        let message = format!("{:#}", error);
        for rule in &self.rules {
            if rule.matches(&message) {
                tracing::trace!(
                    operation = %ctx.operation,
                    category = %rule.category(),
                    "classified by message rule"
                );
                return rule.classification();
            }
        }
        self.profile(ErrorCategory::Unknown)
    }
}

/// Shared classifier handle.
pub type SharedClassifier = Arc<dyn ErrorClassifier>;
