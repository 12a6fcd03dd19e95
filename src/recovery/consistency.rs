//! Read-only consistency checks over persisted state.
//!
//! Checks report [`ConsistencyIssue`]s and never modify anything; fixes only
//! happen through an explicit repair strategy.

use crate::classify::Severity;
use crate::events::now_ms;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueType {
    BalanceMismatch,
    WorkflowCountMismatch,
    MissingRequiredField,
    OrphanReference,
}

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueType::BalanceMismatch => "BALANCE_MISMATCH",
            IssueType::WorkflowCountMismatch => "WORKFLOW_COUNT_MISMATCH",
            IssueType::MissingRequiredField => "MISSING_REQUIRED_FIELD",
            IssueType::OrphanReference => "ORPHAN_REFERENCE",
        }
    }
}

impl std::fmt::Display for IssueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyIssue {
    #[serde(rename = "type")]
    pub issue_type: IssueType,
    pub severity: Severity,
    pub description: String,
    pub affected_count: usize,
}

/// Counters of one workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowCounters {
    pub workflow_id: String,
    pub processed: usize,
    pub failed: usize,
    pub total: usize,
}

/// Entries that must sum to an expected total, in minor currency units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceGroup {
    pub group_id: String,
    pub expected_total_minor: i64,
    pub entries_minor: Vec<i64>,
}

/// A persisted record's fields, by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSnapshot {
    pub record_id: String,
    pub fields: BTreeMap<String, serde_json::Value>,
}

/// A foreign reference and whether its target exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceLink {
    /// e.g. `"classification.gl_account"`
    pub relation: String,
    pub source_id: String,
    pub target_id: String,
    pub target_exists: bool,
}

/// What to check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsistencyScope {
    pub name: String,
    pub processing_id: Option<String>,
    pub required_fields: Vec<String>,
}

impl ConsistencyScope {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
    pub fn with_processing_id(mut self, id: impl Into<String>) -> Self {
        self.processing_id = Some(id.into());
        self
    }
    pub fn with_required_fields(mut self, fields: Vec<String>) -> Self {
        self.required_fields = fields;
        self
    }
}

/// Read access to the persisted state being checked.
///
/// Every method defaults to "nothing to check", so a source only implements
/// what it can provide.
#[async_trait]
pub trait ConsistencySource: Send + Sync {
    async fn workflow_counters(&self, _scope: &ConsistencyScope) -> anyhow::Result<Vec<WorkflowCounters>> {
        Ok(Vec::new())
    }

    async fn balance_groups(&self, _scope: &ConsistencyScope) -> anyhow::Result<Vec<BalanceGroup>> {
        Ok(Vec::new())
    }

    async fn records(&self, _scope: &ConsistencyScope) -> anyhow::Result<Vec<RecordSnapshot>> {
        Ok(Vec::new())
    }

    async fn references(&self, _scope: &ConsistencyScope) -> anyhow::Result<Vec<ReferenceLink>> {
        Ok(Vec::new())
    }
}

/// Source backed by plain vectors.
#[derive(Debug, Clone, Default)]
pub struct StaticConsistencySource {
    pub workflows: Vec<WorkflowCounters>,
    pub balances: Vec<BalanceGroup>,
    pub records: Vec<RecordSnapshot>,
    pub references: Vec<ReferenceLink>,
}

#[async_trait]
impl ConsistencySource for StaticConsistencySource {
    async fn workflow_counters(&self, _scope: &ConsistencyScope) -> anyhow::Result<Vec<WorkflowCounters>> {
        Ok(self.workflows.clone())
    }

    async fn balance_groups(&self, _scope: &ConsistencyScope) -> anyhow::Result<Vec<BalanceGroup>> {
        Ok(self.balances.clone())
    }

    async fn records(&self, _scope: &ConsistencyScope) -> anyhow::Result<Vec<RecordSnapshot>> {
        Ok(self.records.clone())
    }

    async fn references(&self, _scope: &ConsistencyScope) -> anyhow::Result<Vec<ReferenceLink>> {
        Ok(self.references.clone())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyReport {
    pub scope: String,
    pub checked_at_ms: u64,
    pub checks_run: usize,
    pub issues: Vec<ConsistencyIssue>,
    /// Checks that could not run because the source failed.
    pub source_errors: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn issues_of(&self, issue_type: IssueType) -> impl Iterator<Item = &ConsistencyIssue> {
        self.issues.iter().filter(move |i| i.issue_type == issue_type)
    }

    pub fn into_result(self) -> Result<Self> {
        if self.issues.is_empty() {
            Ok(self)
        } else {
            Err(Error::ConsistencyViolation {
                issues: self.issues,
            })
        }
    }
}

/// `processed + failed == total`.
pub fn check_workflow(c: &WorkflowCounters) -> Option<ConsistencyIssue> {
    let accounted = c.processed + c.failed;
    if accounted == c.total {
        return None;
    }
    Some(ConsistencyIssue {
        issue_type: IssueType::WorkflowCountMismatch,
        severity: Severity::High,
        description: format!(
            "workflow {}: processed ({}) + failed ({}) = {} but total is {}",
            c.workflow_id, c.processed, c.failed, accounted, c.total
        ),
        affected_count: accounted.abs_diff(c.total),
    })
}

pub fn check_balance(g: &BalanceGroup) -> Option<ConsistencyIssue> {
    let sum: i64 = g.entries_minor.iter().fold(0i64, |acc, v| acc.saturating_add(*v));
    if sum == g.expected_total_minor {
        return None;
    }
    Some(ConsistencyIssue {
        issue_type: IssueType::BalanceMismatch,
        severity: Severity::Critical,
        description: format!(
            "balance group {}: entries sum to {} but {} was expected",
            g.group_id, sum, g.expected_total_minor
        ),
        affected_count: g.entries_minor.len(),
    })
}

fn is_blank(v: Option<&serde_json::Value>) -> bool {
    match v {
        None | Some(serde_json::Value::Null) => true,
        Some(serde_json::Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

/// One issue per required field that is missing, null or blank somewhere.
pub fn check_required_fields(records: &[RecordSnapshot], required: &[String]) -> Vec<ConsistencyIssue> {
    required
        .iter()
        .filter_map(|field| {
            let missing = records
                .iter()
                .filter(|r| is_blank(r.fields.get(field)))
                .count();
            (missing > 0).then(|| ConsistencyIssue {
                issue_type: IssueType::MissingRequiredField,
                severity: Severity::Medium,
                description: format!("{} record(s) missing required field '{}'", missing, field),
                affected_count: missing,
            })
        })
        .collect()
}

/// One issue per relation with dangling targets.
pub fn check_references(links: &[ReferenceLink]) -> Vec<ConsistencyIssue> {
    let mut orphans: BTreeMap<&str, usize> = BTreeMap::new();
    for link in links.iter().filter(|l| !l.target_exists) {
        *orphans.entry(link.relation.as_str()).or_default() += 1;
    }
    orphans
        .into_iter()
        .map(|(relation, count)| ConsistencyIssue {
            issue_type: IssueType::OrphanReference,
            severity: Severity::High,
            description: format!("{} orphan reference(s) in {}", count, relation),
            affected_count: count,
        })
        .collect()
}

/// Run the full battery against `source`.
pub async fn run_checks(source: &dyn ConsistencySource, scope: &ConsistencyScope) -> ConsistencyReport {
    let mut report = ConsistencyReport {
        scope: scope.name.clone(),
        checked_at_ms: now_ms(),
        checks_run: 0,
        issues: Vec::new(),
        source_errors: Vec::new(),
    };

    match source.balance_groups(scope).await {
        Ok(groups) => {
            report.checks_run += 1;
            report.issues.extend(groups.iter().filter_map(check_balance));
        }
        Err(e) => report.source_errors.push(format!("balance: {:#}", e)),
    }
    match source.workflow_counters(scope).await {
        Ok(counters) => {
            report.checks_run += 1;
            report.issues.extend(counters.iter().filter_map(check_workflow));
        }
        Err(e) => report.source_errors.push(format!("workflow: {:#}", e)),
    }
    if !scope.required_fields.is_empty() {
        match source.records(scope).await {
            Ok(records) => {
                report.checks_run += 1;
                report
                    .issues
                    .extend(check_required_fields(&records, &scope.required_fields));
            }
            Err(e) => report.source_errors.push(format!("required fields: {:#}", e)),
        }
    }
    match source.references(scope).await {
        Ok(links) => {
            report.checks_run += 1;
            report.issues.extend(check_references(&links));
        }
        Err(e) => report.source_errors.push(format!("references: {:#}", e)),
    }
    report
}
