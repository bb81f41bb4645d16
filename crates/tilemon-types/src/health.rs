//! Declarative health rules and verdicts.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::DeviceId;
use crate::error::TileError;
use crate::value::AttributeValue;

/// Verdict for one attribute, one device, or the whole station.
///
/// The derived ordering is the roll-up precedence, so the worst verdict of
/// a set is its maximum: `Ok < Unknown < Degraded < Failed`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthVerdict {
    #[default]
    Ok,
    Unknown,
    Degraded,
    Failed,
}

impl HealthVerdict {
    /// Worst verdict of `verdicts`; `Ok` for an empty set.
    pub fn worst(verdicts: impl IntoIterator<Item = HealthVerdict>) -> HealthVerdict {
        verdicts.into_iter().max().unwrap_or(HealthVerdict::Ok)
    }
}

impl fmt::Display for HealthVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthVerdict::Ok => "OK",
            HealthVerdict::Unknown => "UNKNOWN",
            HealthVerdict::Degraded => "DEGRADED",
            HealthVerdict::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Verdict produced when a rule is violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Degraded,
    #[default]
    Failed,
}

impl Severity {
    pub fn verdict(self) -> HealthVerdict {
        match self {
            Severity::Degraded => HealthVerdict::Degraded,
            Severity::Failed => HealthVerdict::Failed,
        }
    }
}

/// The check a rule applies, resolved from its optional fields.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleBound<'a> {
    Range { min: Option<f64>, max: Option<f64> },
    Expected(&'a AttributeValue),
}

/// One row of the health-rule table.
///
/// In TOML a rule is either a range (`min` and/or `max`) or an expected
/// value (`expected`, boolean or exact):
///
/// ```toml
/// [[health_rules]]
/// attribute = "board_temperature"
/// min = 10.0
/// max = 95.0
///
/// [[health_rules]]
/// attribute = "pps_present"
/// expected = true
/// severity = "degraded"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRule {
    pub attribute: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<AttributeValue>,
    #[serde(default)]
    pub severity: Severity,
    /// Skip the rule on hardware variants that do not expose the attribute.
    #[serde(default)]
    pub ignore_if_absent: bool,
    /// Devices the rule applies to; empty means every device.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<DeviceId>,
}

impl HealthRule {
    pub fn range(attribute: impl Into<String>, min: Option<f64>, max: Option<f64>) -> Self {
        Self {
            attribute: attribute.into(),
            min,
            max,
            expected: None,
            severity: Severity::Failed,
            ignore_if_absent: false,
            devices: Vec::new(),
        }
    }

    pub fn expect(attribute: impl Into<String>, expected: impl Into<AttributeValue>) -> Self {
        Self {
            attribute: attribute.into(),
            min: None,
            max: None,
            expected: Some(expected.into()),
            severity: Severity::Failed,
            ignore_if_absent: false,
            devices: Vec::new(),
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn ignoring_absent(mut self) -> Self {
        self.ignore_if_absent = true;
        self
    }

    pub fn for_devices(mut self, devices: impl IntoIterator<Item = DeviceId>) -> Self {
        self.devices = devices.into_iter().collect();
        self
    }

    pub fn applies_to(&self, device: &DeviceId) -> bool {
        self.devices.is_empty() || self.devices.contains(device)
    }

    pub fn bound(&self) -> RuleBound<'_> {
        match &self.expected {
            Some(value) => RuleBound::Expected(value),
            None => RuleBound::Range {
                min: self.min,
                max: self.max,
            },
        }
    }

    /// Reject malformed rules.
    ///
    /// # Errors
    ///
    /// [`TileError::Configuration`] when the attribute is empty, no bound is
    /// given, a range is combined with an expected value, a bound is not
    /// finite, or `min > max`.
    pub fn validate(&self) -> Result<(), TileError> {
        let fail = |why: &str| -> Result<(), TileError> {
            Err(TileError::Configuration(format!(
                "health rule '{}': {why}",
                self.attribute
            )))
        };
        if self.attribute.trim().is_empty() {
            return fail("attribute name is empty");
        }
        let has_range = self.min.is_some() || self.max.is_some();
        match (&self.expected, has_range) {
            (None, false) => return fail("no bound given"),
            (Some(_), true) => return fail("expected value combined with min/max"),
            _ => {}
        }
        if self.min.is_some_and(|v| !v.is_finite()) || self.max.is_some_and(|v| !v.is_finite()) {
            return fail("bounds must be finite");
        }
        if let (Some(min), Some(max)) = (self.min, self.max) {
            if min > max {
                return fail("min exceeds max");
            }
        }
        Ok(())
    }
}

/// A contributing verdict worse than `Ok`, with a human-readable cause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub device: DeviceId,
    pub attribute: String,
    pub verdict: HealthVerdict,
    pub cause: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}.{}: {}",
            self.verdict, self.device, self.attribute, self.cause
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worst_follows_precedence() {
        use HealthVerdict::*;
        assert_eq!(HealthVerdict::worst([Ok, Unknown, Ok]), Unknown);
        assert_eq!(HealthVerdict::worst([Unknown, Degraded]), Degraded);
        assert_eq!(HealthVerdict::worst([Degraded, Failed, Unknown]), Failed);
        assert_eq!(HealthVerdict::worst([]), Ok);
    }

    #[test]
    fn rule_validation() {
        assert!(HealthRule::range("t", Some(10.0), Some(95.0)).validate().is_ok());
        assert!(HealthRule::range("t", Some(95.0), Some(10.0)).validate().is_err());
        assert!(HealthRule::range("t", None, None).validate().is_err());
        assert!(HealthRule::range("", Some(1.0), None).validate().is_err());
        assert!(HealthRule::range("t", Some(f64::NAN), None).validate().is_err());
        let mut mixed = HealthRule::expect("pps_present", true);
        mixed.max = Some(1.0);
        assert!(matches!(mixed.validate(), Err(TileError::Configuration(_))));
    }

    #[test]
    fn rules_parse_from_json_shape() {
        let rule: HealthRule = serde_json::from_value(serde_json::json!({
            "attribute": "pps_present",
            "expected": true,
            "severity": "degraded",
            "ignore_if_absent": true
        }))
        .unwrap();
        assert_eq!(rule.bound(), RuleBound::Expected(&AttributeValue::Bool(true)));
        assert_eq!(rule.severity, Severity::Degraded);
        assert!(rule.ignore_if_absent);
    }
}
