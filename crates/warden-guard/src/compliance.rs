//! Compliance evaluation over the audit stream.
//!
//! A [`ComplianceStandard`] is an ordered list of declarative rules applied to
//! events carrying the standard's tag. For each (standard, event) pair every
//! applicable rule counts as one control evaluation, and the first failing rule
//! is recorded as a [`ComplianceViolation`]. Events are never modified.
//!
//! # Report scoring
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `controls_passed` / `controls_failed` | rule evaluations in range |
//! | `score` | `passed / (passed + failed) * 100`, 100 when nothing was evaluated |
//! | `recommendations` | descriptions of failing rules, most severe first |

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSubscriber, Outcome};
use crate::error::GuardError;
use crate::risk::{ComplianceTag, RiskLevel};

/// A declarative rule check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum RuleCheck {
    /// Details must be encrypted at rest.
    RequireEncryption,
    /// The outcome must not be this status.
    DenyOutcome {
        /// Forbidden status.
        outcome: Outcome,
    },
    /// Risk must not exceed this level.
    MaxRisk {
        /// Highest acceptable risk.
        max: RiskLevel,
    },
    /// A session id must be present.
    RequireSessionId,
    /// A detail key must be present.
    RequireField {
        /// Required detail key.
        field: String,
    },
}

impl RuleCheck {
    /// Whether the event passes.
    pub fn passes(&self, event: &AuditEvent) -> bool {
        match self {
            RuleCheck::RequireEncryption => event.security.encrypted,
            RuleCheck::DenyOutcome { outcome } => event.result.status != *outcome,
            RuleCheck::MaxRisk { max } => event.security.risk <= *max,
            RuleCheck::RequireSessionId => event
                .context
                .session_id
                .as_deref()
                .is_some_and(|s| !s.is_empty()),
            RuleCheck::RequireField { field } => event.action.details.contains_key(field),
        }
    }
}

/// One rule of a standard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceRule {
    /// Stable identifier.
    pub id: String,
    /// What the rule requires; used as the recommendation text.
    pub description: String,
    /// Severity of a violation.
    pub severity: RiskLevel,
    /// Action type prefix the rule applies to; all tagged events when unset.
    #[serde(default)]
    pub applies_to: Option<String>,
    /// The check itself.
    #[serde(flatten)]
    pub check: RuleCheck,
}

impl ComplianceRule {
    fn applies(&self, event: &AuditEvent) -> bool {
        self.applies_to
            .as_deref()
            .map_or(true, |prefix| event.action.kind.starts_with(prefix))
    }
}

/// A named set of rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceStandard {
    /// Standard name, used in reports.
    pub name: String,
    /// Events carrying this tag are evaluated.
    pub tag: ComplianceTag,
    /// Rules in evaluation order.
    pub rules: Vec<ComplianceRule>,
}

fn rule(id: &str, description: &str, severity: RiskLevel, applies_to: Option<&str>, check: RuleCheck) -> ComplianceRule {
    ComplianceRule {
        id: id.into(),
        description: description.into(),
        severity,
        applies_to: applies_to.map(Into::into),
        check,
    }
}

impl ComplianceStandard {
    /// Personal data handling.
    pub fn gdpr() -> Self {
        Self {
            name: "gdpr".into(),
            tag: ComplianceTag::Gdpr,
            rules: vec![
                rule(
                    "gdpr-encrypt-personal-data",
                    "Enable audit encryption for events touching personal data",
                    RiskLevel::High,
                    None,
                    RuleCheck::RequireEncryption,
                ),
                rule(
                    "gdpr-lawful-basis",
                    "Record a lawful_basis for every personal data processing action",
                    RiskLevel::Medium,
                    Some("data."),
                    RuleCheck::RequireField {
                        field: "lawful_basis".into(),
                    },
                ),
                rule(
                    "gdpr-denied-access",
                    "Review agents repeatedly denied access to personal data",
                    RiskLevel::Medium,
                    None,
                    RuleCheck::DenyOutcome {
                        outcome: Outcome::Failure,
                    },
                ),
            ],
        }
    }

    /// Access control.
    pub fn soc2() -> Self {
        Self {
            name: "soc2".into(),
            tag: ComplianceTag::Soc2,
            rules: vec![
                rule(
                    "soc2-auth-failure",
                    "Investigate authentication failures",
                    RiskLevel::High,
                    Some("auth."),
                    RuleCheck::DenyOutcome {
                        outcome: Outcome::Failure,
                    },
                ),
                rule(
                    "soc2-critical-access",
                    "Review critical-risk access attempts and tighten agent permissions",
                    RiskLevel::High,
                    None,
                    RuleCheck::MaxRisk {
                        max: RiskLevel::High,
                    },
                ),
                rule(
                    "soc2-session-attribution",
                    "Attribute every permission check to a session",
                    RiskLevel::Low,
                    Some("permission.check"),
                    RuleCheck::RequireSessionId,
                ),
            ],
        }
    }

    /// Parse a standard from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, GuardError> {
        let standard: Self = serde_yaml::from_str(yaml)
            .map_err(|e| GuardError::Validation(format!("invalid compliance standard: {e}")))?;
        if standard.name.trim().is_empty() {
            return Err(GuardError::Validation("compliance standard has no name".into()));
        }
        let mut ids = HashSet::new();
        for rule in &standard.rules {
            if !ids.insert(rule.id.as_str()) {
                return Err(GuardError::Validation(format!(
                    "duplicate rule id '{}' in standard '{}'",
                    rule.id, standard.name
                )));
            }
        }
        Ok(standard)
    }
}

/// A failed rule for one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceViolation {
    /// Standard name.
    pub standard: String,
    /// Failing rule id.
    pub rule_id: String,
    /// Rule severity.
    pub severity: RiskLevel,
    /// Originating event id.
    pub event_id: Uuid,
    /// Originating event sequence.
    pub event_sequence: u64,
    /// Acting principal of the event.
    pub actor: String,
    /// Event timestamp.
    pub timestamp: DateTime<Utc>,
    /// Rule description.
    pub description: String,
}

/// Half-open time window `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Inclusive start.
    pub from: DateTime<Utc>,
    /// Exclusive end.
    pub to: DateTime<Utc>,
}

impl TimeRange {
    /// A window from `from` to `to`.
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self, GuardError> {
        if to < from {
            return Err(GuardError::Validation(format!(
                "time range ends ({to}) before it starts ({from})"
            )));
        }
        Ok(Self { from, to })
    }

    /// The window ending now and spanning `duration`.
    pub fn last(duration: Duration) -> Self {
        let to = Utc::now();
        Self {
            from: to - duration,
            to,
        }
    }

    /// Every representable instant.
    pub fn all() -> Self {
        Self {
            from: DateTime::<Utc>::MIN_UTC,
            to: DateTime::<Utc>::MAX_UTC,
        }
    }

    /// Whether `t` falls inside the window.
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.from && t < self.to
    }
}

/// Aggregated results for one standard over a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceReport {
    /// Standard name.
    pub standard: String,
    /// Window covered.
    pub range: TimeRange,
    /// Events evaluated against the standard.
    pub total_events: usize,
    /// Rule evaluations that passed.
    pub controls_passed: usize,
    /// Rule evaluations that failed.
    pub controls_failed: usize,
    /// Violation count per severity.
    pub violations_by_severity: BTreeMap<RiskLevel, usize>,
    /// Violations, oldest first.
    pub violations: Vec<ComplianceViolation>,
    /// 0-100.
    pub score: f64,
    /// Remediation steps, most severe first.
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone)]
struct Evaluation {
    event_id: Uuid,
    timestamp: DateTime<Utc>,
    passed: usize,
    failed: usize,
    violation: Option<ComplianceViolation>,
}

#[derive(Debug, Default)]
struct StandardState {
    seen: HashSet<Uuid>,
    evaluations: Vec<Evaluation>,
}

/// Evaluates events against configured standards and records violations.
#[derive(Debug)]
pub struct ComplianceEngine {
    standards: RwLock<Vec<ComplianceStandard>>,
    state: RwLock<HashMap<String, StandardState>>,
}

impl Default for ComplianceEngine {
    fn default() -> Self {
        Self::with_standards(vec![ComplianceStandard::gdpr(), ComplianceStandard::soc2()])
    }
}

impl ComplianceEngine {
    /// Engine with the built-in `gdpr` and `soc2` standards.
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine with the given standards.
    pub fn with_standards(standards: Vec<ComplianceStandard>) -> Self {
        Self {
            standards: RwLock::new(standards),
            state: RwLock::new(HashMap::new()),
        }
    }

    /// Add or replace a standard by name. Its recorded results are kept.
    pub fn add_standard(&self, standard: ComplianceStandard) {
        let mut standards = self.standards.write();
        standards.retain(|s| s.name != standard.name);
        standards.push(standard);
    }

    /// Names of configured standards.
    pub fn standards(&self) -> Vec<String> {
        self.standards.read().iter().map(|s| s.name.clone()).collect()
    }

    /// Evaluate one event against every standard whose tag it carries.
    ///
    /// An event already evaluated for a standard is skipped, so replaying a log
    /// never double counts.
    pub fn evaluate(&self, event: &AuditEvent) -> Vec<ComplianceViolation> {
        let standards = self.standards.read();
        let mut state = self.state.write();
        let mut violations = Vec::new();

        for standard in standards.iter() {
            if !event.security.tags.contains(&standard.tag) {
                continue;
            }
            let entry = state.entry(standard.name.clone()).or_default();
            if !entry.seen.insert(event.id) {
                continue;
            }

            let mut passed = 0;
            let mut failed = 0;
            let mut violation = None;
            for rule in standard.rules.iter().filter(|r| r.applies(event)) {
                if rule.check.passes(event) {
                    passed += 1;
                    continue;
                }
                failed += 1;
                if violation.is_none() {
                    violation = Some(ComplianceViolation {
                        standard: standard.name.clone(),
                        rule_id: rule.id.clone(),
                        severity: rule.severity,
                        event_id: event.id,
                        event_sequence: event.sequence,
                        actor: event.actor.id.clone(),
                        timestamp: event.timestamp,
                        description: rule.description.clone(),
                    });
                }
            }

            if let Some(v) = &violation {
                tracing::warn!(
                    standard = %v.standard,
                    rule = %v.rule_id,
                    severity = %v.severity,
                    sequence = v.event_sequence,
                    "compliance violation"
                );
                violations.push(v.clone());
            }
            entry.evaluations.push(Evaluation {
                event_id: event.id,
                timestamp: event.timestamp,
                passed,
                failed,
                violation,
            });
        }
        violations
    }

    /// Evaluate a batch of events, in order.
    pub fn evaluate_all<'a>(&self, events: impl IntoIterator<Item = &'a AuditEvent>) -> usize {
        events
            .into_iter()
            .map(|e| self.evaluate(e).len())
            .sum()
    }

    /// Forget evaluations of events stamped before `cutoff`, as audit
    /// retention does for the events themselves. Returns how many were dropped.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut state = self.state.write();
        let mut dropped = 0;
        for entry in state.values_mut() {
            let StandardState { seen, evaluations } = entry;
            let before = evaluations.len();
            evaluations.retain(|e| {
                let keep = e.timestamp >= cutoff;
                if !keep {
                    seen.remove(&e.event_id);
                }
                keep
            });
            dropped += before - evaluations.len();
        }
        dropped
    }

    /// All violations recorded for a standard.
    pub fn violations(&self, standard: &str) -> Vec<ComplianceViolation> {
        self.state
            .read()
            .get(standard)
            .map(|s| {
                s.evaluations
                    .iter()
                    .filter_map(|e| e.violation.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Aggregate a standard's results over a window.
    pub fn generate_report(&self, standard: &str, range: TimeRange) -> Result<ComplianceReport, GuardError> {
        let rule_order: HashMap<String, usize> = {
            let standards = self.standards.read();
            let found = standards
                .iter()
                .find(|s| s.name == standard)
                .ok_or_else(|| GuardError::Validation(format!("unknown compliance standard '{standard}'")))?;
            found
                .rules
                .iter()
                .enumerate()
                .map(|(i, r)| (r.id.clone(), i))
                .collect()
        };

        let state = self.state.read();
        let evaluations: Vec<&Evaluation> = state
            .get(standard)
            .map(|s| s.evaluations.iter().filter(|e| range.contains(e.timestamp)).collect())
            .unwrap_or_default();

        let controls_passed = evaluations.iter().map(|e| e.passed).sum::<usize>();
        let controls_failed = evaluations.iter().map(|e| e.failed).sum::<usize>();
        let violations: Vec<ComplianceViolation> = evaluations
            .iter()
            .filter_map(|e| e.violation.clone())
            .collect();

        let mut violations_by_severity = BTreeMap::new();
        for v in &violations {
            *violations_by_severity.entry(v.severity).or_insert(0) += 1;
        }

        let evaluated = controls_passed + controls_failed;
        let score = if evaluated == 0 {
            100.0
        } else {
            controls_passed as f64 / evaluated as f64 * 100.0
        };

        let mut failing: Vec<&ComplianceViolation> = Vec::new();
        for v in &violations {
            if !failing.iter().any(|f| f.rule_id == v.rule_id) {
                failing.push(v);
            }
        }
        failing.sort_by(|a, b| {
            b.severity.cmp(&a.severity).then_with(|| {
                let ia = rule_order.get(&a.rule_id).copied().unwrap_or(usize::MAX);
                let ib = rule_order.get(&b.rule_id).copied().unwrap_or(usize::MAX);
                ia.cmp(&ib)
            })
        });
        let recommendations = failing.into_iter().map(|v| v.description.clone()).collect();

        Ok(ComplianceReport {
            standard: standard.to_string(),
            range,
            total_events: evaluations.len(),
            controls_passed,
            controls_failed,
            violations_by_severity,
            violations,
            score,
            recommendations,
        })
    }
}

impl AuditSubscriber for ComplianceEngine {
    fn on_event(&self, event: &AuditEvent) {
        if event.action.kind == "audit.retention" {
            let cutoff = event.action.details.get("cutoff").and_then(|v| v.as_str());
            match cutoff.map(DateTime::parse_from_rfc3339) {
                Some(Ok(cutoff)) => {
                    let dropped = self.prune_before(cutoff.with_timezone(&Utc));
                    tracing::debug!(dropped, %cutoff, "compliance results expired");
                }
                _ => tracing::warn!(sequence = event.sequence, "retention event without a usable cutoff"),
            }
        }
        self.evaluate(event);
    }
}
