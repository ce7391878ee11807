//! Declarative record validation
//!
//! Rules come from configuration as [`RuleConfig`] and are compiled once
//! (regexes included) into a [`Validator`]. Evaluation never mutates the
//! record and always runs every rule, so a report lists every failure in
//! declaration order.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ConfigError;
use crate::record::{FieldValue, Record, ValueKind};

/// Whether a failing rule rejects the record or only flags it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Required,
    Advisory,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Required => write!(f, "required"),
            Severity::Advisory => write!(f, "advisory"),
        }
    }
}

/// A rule as written in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Defaults to `<kind>:<field>`
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(flatten)]
    pub check: RuleCheck,
}

/// Predicate kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleCheck {
    Present {
        field: String,
    },
    Kind {
        field: String,
        value_kind: ValueKind,
    },
    Pattern {
        field: String,
        regex: String,
    },
    Url {
        field: String,
    },
    Length {
        field: String,
        #[serde(default)]
        min: Option<usize>,
        #[serde(default)]
        max: Option<usize>,
    },
    Range {
        field: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    Requires {
        field: String,
        then: Vec<String>,
    },
}

impl RuleCheck {
    fn kind_name(&self) -> &'static str {
        match self {
            RuleCheck::Present { .. } => "present",
            RuleCheck::Kind { .. } => "kind",
            RuleCheck::Pattern { .. } => "pattern",
            RuleCheck::Url { .. } => "url",
            RuleCheck::Length { .. } => "length",
            RuleCheck::Range { .. } => "range",
            RuleCheck::Requires { .. } => "requires",
        }
    }

    fn field(&self) -> &str {
        match self {
            RuleCheck::Present { field }
            | RuleCheck::Kind { field, .. }
            | RuleCheck::Pattern { field, .. }
            | RuleCheck::Url { field }
            | RuleCheck::Length { field, .. }
            | RuleCheck::Range { field, .. }
            | RuleCheck::Requires { field, .. } => field,
        }
    }
}

#[derive(Debug)]
enum Check {
    Present,
    Kind(ValueKind),
    Pattern(Regex),
    Url,
    Length { min: Option<usize>, max: Option<usize> },
    Range { min: Option<f64>, max: Option<f64> },
    Requires(Vec<String>),
}

/// Compiled rule
#[derive(Debug)]
pub struct Rule {
    name: String,
    field: String,
    severity: Severity,
    check: Check,
}

impl Rule {
    fn compile(config: &RuleConfig) -> Result<Self, ConfigError> {
        let field = config.check.field().to_string();
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| format!("{}:{}", config.check.kind_name(), field));

        let invalid = |message: String| ConfigError::InvalidRule {
            name: name.clone(),
            message,
        };

        let check = match &config.check {
            RuleCheck::Present { .. } => Check::Present,
            RuleCheck::Kind { value_kind, .. } => Check::Kind(*value_kind),
            RuleCheck::Pattern { regex, .. } => {
                Check::Pattern(Regex::new(regex).map_err(|e| invalid(e.to_string()))?)
            },
            RuleCheck::Url { .. } => Check::Url,
            RuleCheck::Length { min, max, .. } => {
                if let (Some(min), Some(max)) = (min, max) {
                    if min > max {
                        return Err(invalid(format!("min ({}) is greater than max ({})", min, max)));
                    }
                }
                Check::Length {
                    min: *min,
                    max: *max,
                }
            },
            RuleCheck::Range { min, max, .. } => {
                if let (Some(min), Some(max)) = (min, max) {
                    if min > max {
                        return Err(invalid(format!("min ({}) is greater than max ({})", min, max)));
                    }
                }
                Check::Range {
                    min: *min,
                    max: *max,
                }
            },
            RuleCheck::Requires { then, .. } => {
                if then.is_empty() {
                    return Err(invalid("`then` must name at least one field".to_string()));
                }
                Check::Requires(then.clone())
            },
        };

        Ok(Self {
            name,
            field,
            severity: config.severity,
            check,
        })
    }

    fn mandatory(field: &str) -> Self {
        Self {
            name: format!("present:{}", field),
            field: field.to_string(),
            severity: Severity::Required,
            check: Check::Present,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Failure message, or `None` if the record passes
    fn evaluate(&self, record: &Record) -> Option<String> {
        let value = record.get(&self.field);

        match (&self.check, value) {
            (Check::Present, None) => Some("field is missing".to_string()),
            (Check::Present, Some(FieldValue::Text(text))) if text.trim().is_empty() => {
                Some("field is blank".to_string())
            },
            (Check::Present, Some(_)) => None,

            // Every other check passes on an absent field
            (_, None) => None,

            (Check::Kind(expected), Some(value)) if value.kind() != *expected => {
                Some(format!("expected {}, found {}", expected, value.kind()))
            },
            (Check::Kind(_), Some(_)) => None,

            (Check::Pattern(regex), Some(value)) => match value.as_text() {
                Some(text) if regex.is_match(text) => None,
                Some(_) => Some(format!("does not match {}", regex.as_str())),
                None => Some(format!("expected text, found {}", value.kind())),
            },

            (Check::Url, Some(value)) => {
                let text = match value {
                    FieldValue::Text(text) => text.as_str(),
                    FieldValue::Asset(asset) => asset.locator(),
                    FieldValue::Number(_) => return Some("expected a URL, found number".to_string()),
                };
                match url::Url::parse(text.trim()) {
                    Ok(url) if matches!(url.scheme(), "http" | "https") => None,
                    Ok(url) => Some(format!("unsupported URL scheme {}", url.scheme())),
                    Err(e) => Some(format!("invalid URL: {}", e)),
                }
            },

            (Check::Length { min, max }, Some(value)) => {
                let Some(text) = value.as_text() else {
                    return Some(format!("expected text, found {}", value.kind()));
                };
                let len = text.chars().count();
                match (min, max) {
                    (Some(min), _) if len < *min => {
                        Some(format!("length {} is below minimum {}", len, min))
                    },
                    (_, Some(max)) if len > *max => {
                        Some(format!("length {} is above maximum {}", len, max))
                    },
                    _ => None,
                }
            },

            (Check::Range { min, max }, Some(value)) => {
                let Some(n) = value.as_number() else {
                    return Some(format!("expected number, found {}", value.kind()));
                };
                match (min, max) {
                    (Some(min), _) if n < *min => Some(format!("{} is below minimum {}", n, min)),
                    (_, Some(max)) if n > *max => Some(format!("{} is above maximum {}", n, max)),
                    _ => None,
                }
            },

            (Check::Requires(then), Some(_)) => {
                let missing: Vec<&str> = then
                    .iter()
                    .filter(|f| record.get(f).is_none())
                    .map(String::as_str)
                    .collect();
                if missing.is_empty() {
                    None
                } else {
                    Some(format!("requires missing field(s): {}", missing.join(", ")))
                }
            },
        }
    }
}

/// One failed rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleFailure {
    pub rule: String,
    pub field: String,
    pub severity: Severity,
    pub message: String,
}

impl fmt::Display for RuleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.rule, self.field, self.message)
    }
}

/// Every failed rule for one record, in declaration order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub failures: Vec<RuleFailure>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    /// True if any required rule failed
    pub fn is_rejected(&self) -> bool {
        self.failures.iter().any(|f| f.severity == Severity::Required)
    }

    pub fn required(&self) -> impl Iterator<Item = &RuleFailure> {
        self.failures
            .iter()
            .filter(|f| f.severity == Severity::Required)
    }

    pub fn advisory(&self) -> impl Iterator<Item = &RuleFailure> {
        self.failures
            .iter()
            .filter(|f| f.severity == Severity::Advisory)
    }
}

/// Ordered, compiled rule set
#[derive(Debug, Default)]
pub struct Validator {
    rules: Vec<Rule>,
}

impl Validator {
    /// Compile mandatory fields followed by the explicit rules
    pub fn compile(mandatory_fields: &[String], rules: &[RuleConfig]) -> Result<Self, ConfigError> {
        let mut compiled: Vec<Rule> = mandatory_fields.iter().map(|f| Rule::mandatory(f)).collect();
        for config in rules {
            compiled.push(Rule::compile(config)?);
        }
        Ok(Self { rules: compiled })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Evaluate every rule against the record
    pub fn validate(&self, record: &Record) -> ValidationReport {
        let failures = self
            .rules
            .iter()
            .filter_map(|rule| {
                rule.evaluate(record).map(|message| RuleFailure {
                    rule: rule.name.clone(),
                    field: rule.field.clone(),
                    severity: rule.severity,
                    message,
                })
            })
            .collect();

        ValidationReport { failures }
    }
}
