//! Built-in category rules.

use super::{Classification, ErrorCategory, Severity};
use crate::resilience::BackoffStrategy;
use regex::Regex;

/// One category's message matcher and retry profile.
pub trait CategoryRule: Send + Sync {
    fn category(&self) -> ErrorCategory;

    /// Whether an untyped error message belongs to this category.
    fn matches(&self, message: &str) -> bool;

    /// Retry profile applied to every error of this category.
    fn classification(&self) -> Classification;
}

/// Regex-backed rule.
pub struct PatternRule {
    category: ErrorCategory,
    pattern: Option<Regex>,
    profile: Classification,
}

impl PatternRule {
    pub fn new(
        category: ErrorCategory,
        pattern: &str,
        profile: Classification,
    ) -> crate::Result<Self> {
        let pattern = Regex::new(pattern).map_err(|e| {
            crate::Error::configuration_with_context(
                format!("invalid classification pattern: {}", e),
                crate::ErrorContext::new()
                    .with_details(pattern.to_string())
                    .with_source("classifier"),
            )
        })?;
        Ok(Self {
            category,
            pattern: Some(pattern),
            profile,
        })
    }

    /// Rule that only carries a profile and never matches by message.
    pub fn profile_only(category: ErrorCategory, profile: Classification) -> Self {
        Self {
            category,
            pattern: None,
            profile,
        }
    }
}

impl CategoryRule for PatternRule {
    fn category(&self) -> ErrorCategory {
        self.category
    }

    fn matches(&self, message: &str) -> bool {
        self.pattern
            .as_ref()
            .map(|p| p.is_match(message))
            .unwrap_or(false)
    }

    fn classification(&self) -> Classification {
        self.profile.clone()
    }
}

/// The default rule set, one rule per category.
///
/// Order matters for message matching: more specific categories come first.
pub fn default_rules() -> Vec<Box<dyn CategoryRule>> {
    use ErrorCategory::*;

    let table: [(ErrorCategory, Option<&str>, Classification); 11] = [
        (
            CircuitOpen,
            Some(r"(?i)circuit (breaker )?open"),
            Classification::new(CircuitOpen),
        ),
        (
            RateLimit,
            Some(r"(?i)rate.?limit|too many requests|\b429\b|quota"),
            Classification::new(RateLimit)
                .retryable(6)
                .with_backoff(BackoffStrategy::Adaptive)
                .with_severity(Severity::Low),
        ),
        (
            Timeout,
            Some(r"(?i)timed? ?out|deadline exceeded|\b504\b"),
            Classification::new(Timeout).retryable(3),
        ),
        (
            Network,
            Some(r"(?i)connection (reset|refused|closed|aborted)|broken pipe|network|dns|\b50[23]\b"),
            Classification::new(Network).retryable(5),
        ),
        (
            Database,
            Some(r"(?i)deadlock|serializ(ation|able)|could not obtain lock|database|sqlstate|too many connections"),
            Classification::new(Database)
                .retryable(3)
                .with_backoff(BackoffStrategy::Fibonacci)
                .with_severity(Severity::High),
        ),
        (
            ExternalService,
            Some(r"(?i)model (is )?overloaded|upstream|provider|\b500\b|llm"),
            Classification::new(ExternalService).retryable(4),
        ),
        (
            Resource,
            Some(r"(?i)pool exhausted|out of memory|resource (busy|unavailable)"),
            Classification::new(Resource)
                .retryable(3)
                .with_backoff(BackoffStrategy::Linear),
        ),
        (
            Validation,
            Some(r"(?i)invalid|malformed|validation|missing required|parse error|constraint"),
            Classification::new(Validation).with_backoff(BackoffStrategy::Fixed),
        ),
        (
            Orchestration,
            Some(r"(?i)workflow|orchestrat|state transition|partially (written|applied)"),
            Classification::new(Orchestration)
                .with_backoff(BackoffStrategy::Fixed)
                .with_severity(Severity::High),
        ),
        (
            Configuration,
            None,
            Classification::new(Configuration)
                .with_backoff(BackoffStrategy::Fixed)
                .with_severity(Severity::Critical),
        ),
        (Unknown, None, Classification::new(Unknown).retryable(1)),
    ];

    let mut rules: Vec<Box<dyn CategoryRule>> = Vec::with_capacity(table.len());
    for (category, pattern, profile) in table {
        match pattern {
            Some(p) => match PatternRule::new(category, p, profile.clone()) {
                Ok(rule) => rules.push(Box::new(rule)),
                Err(e) => {
                    tracing::error!(category = %category, error = %e, "built-in rule rejected");
                    rules.push(Box::new(PatternRule::profile_only(category, profile)));
                }
            },
            None => rules.push(Box::new(PatternRule::profile_only(category, profile))),
        }
    }
    rules
}
