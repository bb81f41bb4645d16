//! [`HealthAggregator`] – rule engine over cached attribute values.
//!
//! The rule table is loaded once and never changes. Evaluation reads the
//! attribute cache only, so it is synchronous and never touches the network.
//!
//! Per rule the verdict is:
//!
//! | Cache entry | Verdict |
//! |---|---|
//! | fresh, within bound | `OK` |
//! | fresh, outside bound | the rule's severity (`DEGRADED` or `FAILED`) |
//! | stale, invalid, or not polled | `UNKNOWN`, skipped when the rule is `ignore_if_absent` |
//!
//! A device whose poller escalated a communication fault additionally
//! contributes `communication = FAILED`. Roll-ups take the worst verdict
//! (`FAILED > DEGRADED > UNKNOWN > OK`); nothing to evaluate is `OK`.

use std::collections::BTreeMap;

use tilemon_types::{
    AttributeValue, CacheEntry, DeviceId, DeviceSnapshot, HealthRule, HealthVerdict, Quality,
    RuleBound, TileError, Violation,
};
use tracing::debug;

/// Pseudo-attribute carrying the communication verdict of a device.
pub const COMMUNICATION: &str = "communication";

/// Read access to the attribute cache.
pub trait AttributeSource: Send + Sync {
    /// Annotated view of one device's cache, `None` for unknown devices.
    fn snapshot(&self, device: &DeviceId) -> Option<DeviceSnapshot>;
}

// ────────────────────────────────────────────────────────────────────────────
// Rule table
// ────────────────────────────────────────────────────────────────────────────

/// Validated, immutable rule table.
#[derive(Debug, Clone, Default)]
pub struct HealthRuleTable {
    rules: Vec<HealthRule>,
}

impl HealthRuleTable {
    /// Validate every rule; one invalid rule rejects the whole table.
    ///
    /// # Errors
    ///
    /// [`TileError::Configuration`] naming the first invalid rule.
    pub fn new(rules: Vec<HealthRule>) -> Result<Self, TileError> {
        for rule in &rules {
            rule.validate()?;
        }
        debug!(rules = rules.len(), "health rule table loaded");
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[HealthRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Outcome of one rule against one cache entry; `None` when skipped.
pub fn evaluate_rule(rule: &HealthRule, entry: Option<&CacheEntry>) -> Option<(HealthVerdict, String)> {
    let unknown = |why: String| {
        (!rule.ignore_if_absent).then_some((HealthVerdict::Unknown, why))
    };
    let Some(entry) = entry else {
        return unknown("not monitored".to_string());
    };
    let value = match (entry.quality, entry.value.as_ref()) {
        (Quality::Fresh, Some(value)) => value,
        (Quality::Stale, _) => return unknown("value is stale".to_string()),
        _ => return unknown("no valid reading".to_string()),
    };
    match check_bound(rule, value) {
        Ok(()) => Some((HealthVerdict::Ok, String::new())),
        Err(why) => Some((rule.severity.verdict(), why)),
    }
}

fn check_bound(rule: &HealthRule, value: &AttributeValue) -> Result<(), String> {
    match rule.bound() {
        RuleBound::Range { min, max } => {
            let numbers: Vec<f64> = match value {
                AttributeValue::List(items) => items.iter().filter_map(AttributeValue::as_f64).collect(),
                other => other.as_f64().into_iter().collect(),
            };
            if numbers.is_empty() {
                return Err(format!("{value} is not numeric"));
            }
            for v in numbers {
                if min.is_some_and(|m| v < m) {
                    return Err(format!("{v} below minimum {}", min.unwrap_or_default()));
                }
                if max.is_some_and(|m| v > m) {
                    return Err(format!("{v} above maximum {}", max.unwrap_or_default()));
                }
            }
            Ok(())
        }
        RuleBound::Expected(expected) => {
            let matches = match (expected, value) {
                (AttributeValue::Bool(want), got) => got.as_bool() == Some(*want),
                (want, got) if want.as_f64().is_some() => want.as_f64() == got.as_f64(),
                (want, got) => want == got,
            };
            if matches {
                Ok(())
            } else {
                Err(format!("expected {expected}, found {value}"))
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Aggregator
// ────────────────────────────────────────────────────────────────────────────

/// Verdicts of one device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceHealth {
    pub verdicts: BTreeMap<String, HealthVerdict>,
    pub violations: Vec<Violation>,
}

impl DeviceHealth {
    pub fn verdict(&self) -> HealthVerdict {
        HealthVerdict::worst(self.verdicts.values().copied())
    }
}

/// # Example
///
/// ```
/// use tilemon_kernel::health::{HealthAggregator, HealthRuleTable};
/// use tilemon_types::{HealthRule, HealthVerdict};
///
/// let table = HealthRuleTable::new(vec![
///     HealthRule::range("board_temperature", Some(10.0), Some(95.0)),
/// ])
/// .unwrap();
/// let aggregator = HealthAggregator::new(table);
/// assert_eq!(aggregator.table().len(), 1);
/// assert_eq!(HealthVerdict::worst([]), HealthVerdict::Ok);
/// ```
#[derive(Debug, Clone, Default)]
pub struct HealthAggregator {
    table: HealthRuleTable,
}

impl HealthAggregator {
    pub fn new(table: HealthRuleTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &HealthRuleTable {
        &self.table
    }

    /// Evaluate every applicable rule against one snapshot.
    pub fn assess(&self, snapshot: &DeviceSnapshot) -> DeviceHealth {
        let mut health = DeviceHealth::default();
        let mut record = |attribute: &str, verdict: HealthVerdict, cause: String| {
            let slot = health
                .verdicts
                .entry(attribute.to_string())
                .or_insert(HealthVerdict::Ok);
            *slot = (*slot).max(verdict);
            if verdict != HealthVerdict::Ok {
                health.violations.push(Violation {
                    device: snapshot.device.clone(),
                    attribute: attribute.to_string(),
                    verdict,
                    cause,
                });
            }
        };

        if let Some(details) = &snapshot.comm_fault {
            record(COMMUNICATION, HealthVerdict::Failed, details.clone());
        }
        for rule in self.table.rules().iter().filter(|r| r.applies_to(&snapshot.device)) {
            if let Some((verdict, cause)) = evaluate_rule(rule, snapshot.entry(&rule.attribute)) {
                record(&rule.attribute, verdict, cause);
            }
        }
        health
    }

    /// `{attribute: verdict}` for `device`.
    ///
    /// # Errors
    ///
    /// [`TileError::UnknownDevice`] when the source has no such device.
    pub fn evaluate(
        &self,
        source: &dyn AttributeSource,
        device: &DeviceId,
    ) -> Result<BTreeMap<String, HealthVerdict>, TileError> {
        let snapshot = source
            .snapshot(device)
            .ok_or_else(|| TileError::UnknownDevice(device.clone()))?;
        Ok(self.assess(&snapshot).verdicts)
    }

    /// Roll up `devices` into one verdict plus every non-OK contribution.
    /// Unknown devices contribute `UNKNOWN`.
    pub fn aggregate(
        &self,
        source: &dyn AttributeSource,
        devices: &[DeviceId],
    ) -> (HealthVerdict, Vec<Violation>) {
        let mut verdicts = Vec::new();
        let mut violations = Vec::new();
        for device in devices {
            match source.snapshot(device) {
                Some(snapshot) => {
                    let health = self.assess(&snapshot);
                    verdicts.push(health.verdict());
                    violations.extend(health.violations);
                }
                None => {
                    verdicts.push(HealthVerdict::Unknown);
                    violations.push(Violation {
                        device: device.clone(),
                        attribute: "device".to_string(),
                        verdict: HealthVerdict::Unknown,
                        cause: "device not registered".to_string(),
                    });
                }
            }
        }
        (HealthVerdict::worst(verdicts), violations)
    }
}
