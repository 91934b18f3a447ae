//! Risk assessment and compliance tagging for audit events.
//!
//! Both are pure functions of the event contents, so the same event always
//! receives the same classification.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audit::{EventAction, EventContext, Outcome};

/// Assessed risk of an audit event.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Routine.
    #[default]
    Low,
    /// Worth reviewing.
    Medium,
    /// Triggers an alert.
    High,
    /// Triggers an alert; security boundary involved.
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        })
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "critical" => Ok(RiskLevel::Critical),
            other => Err(format!("unknown risk level '{other}'")),
        }
    }
}

/// Regulatory standard an event is relevant to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplianceTag {
    /// EU personal data.
    Gdpr,
    /// Access control and authentication.
    Soc2,
    /// Protected health information.
    Hipaa,
    /// Payment card data.
    Pci,
    /// Information security controls.
    Iso27001,
}

impl ComplianceTag {
    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            ComplianceTag::Gdpr => "gdpr",
            ComplianceTag::Soc2 => "soc2",
            ComplianceTag::Hipaa => "hipaa",
            ComplianceTag::Pci => "pci",
            ComplianceTag::Iso27001 => "iso27001",
        }
    }
}

impl fmt::Display for ComplianceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ComplianceTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gdpr" => Ok(ComplianceTag::Gdpr),
            "soc2" => Ok(ComplianceTag::Soc2),
            "hipaa" => Ok(ComplianceTag::Hipaa),
            "pci" => Ok(ComplianceTag::Pci),
            "iso27001" => Ok(ComplianceTag::Iso27001),
            other => Err(format!("unknown compliance tag '{other}'")),
        }
    }
}

const PERSONAL_KEYS: &[&str] = &["email", "phone", "ssn", "address", "name"];
const PERSONAL_DIRS: &[&str] = &["personal", "users"];

/// Risk from the rule table. First matching rule wins.
pub fn assess_risk(action: &EventAction, outcome: Outcome) -> RiskLevel {
    let kind = action.kind.as_str();
    let failed = outcome == Outcome::Failure;

    if failed && kind.starts_with("permission.") {
        RiskLevel::Critical
    } else if kind == "sandbox.violation.hard" {
        RiskLevel::Critical
    } else if kind == "auth.failure" {
        RiskLevel::High
    } else if kind == "sandbox.violation.soft" {
        RiskLevel::High
    } else if failed && kind.starts_with("sandbox.") {
        RiskLevel::Medium
    } else if ["delete", "modify", "write"].iter().any(|w| kind.contains(w)) {
        RiskLevel::Medium
    } else if outcome == Outcome::Warning {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

fn under_personal_dir(path: &str) -> bool {
    path.split('/').any(|seg| PERSONAL_DIRS.contains(&seg))
}

/// Compliance tags implied by the event contents.
pub fn derive_tags(action: &EventAction, context: &EventContext) -> BTreeSet<ComplianceTag> {
    let mut tags = BTreeSet::new();
    let kind = action.kind.as_str();
    let details = &action.details;

    let path_personal = under_personal_dir(&action.target)
        || details
            .get("path")
            .and_then(Value::as_str)
            .is_some_and(under_personal_dir);
    if context.pii || path_personal || PERSONAL_KEYS.iter().any(|k| details.contains_key(*k)) {
        tags.insert(ComplianceTag::Gdpr);
    }
    if kind.starts_with("auth.") || kind.starts_with("permission.") {
        tags.insert(ComplianceTag::Soc2);
    }
    if details.get("phi").and_then(Value::as_bool).unwrap_or(false) {
        tags.insert(ComplianceTag::Hipaa);
    }
    if details.contains_key("card_number") {
        tags.insert(ComplianceTag::Pci);
    }
    if kind.starts_with("sandbox.") {
        tags.insert(ComplianceTag::Iso27001);
    }
    tags
}
