//! Status condition machinery for Extension objects.
//!
//! The condition list on an Extension always carries exactly the canonical
//! set of condition types, in canonical order. `set_condition` preserves the
//! last-transition time across writes that don't change the status value, so
//! repeated reconciles of a converged object produce byte-identical
//! condition sets.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The Resolved condition: a bundle satisfying the spec was selected
pub const TYPE_RESOLVED: &str = "Resolved";
/// The Unpacked condition: the resolved bundle's content is available
pub const TYPE_UNPACKED: &str = "Unpacked";
/// The Installed condition: the unpacked content is applied to the cluster
pub const TYPE_INSTALLED: &str = "Installed";

/// Canonical condition types, in the order they appear in status
pub const CONDITION_TYPES: [&str; 3] = [TYPE_RESOLVED, TYPE_UNPACKED, TYPE_INSTALLED];

/// Reason: the phase completed successfully
pub const REASON_SUCCESS: &str = "Success";
/// Reason: no admissible bundle satisfies the current constraints
pub const REASON_RESOLUTION_FAILED: &str = "ResolutionFailed";
/// Reason: bundle content retrieval is still in progress
pub const REASON_UNPACK_PENDING: &str = "UnpackPending";
/// Reason: bundle content retrieval completed
pub const REASON_UNPACK_SUCCESS: &str = "UnpackSuccess";
/// Reason: bundle content retrieval failed
pub const REASON_UNPACK_FAILED: &str = "UnpackFailed";
/// Reason: applying bundle content to the cluster failed
pub const REASON_INSTALLATION_FAILED: &str = "InstallationFailed";
/// Reason: the phase has not been attempted yet
pub const REASON_PENDING: &str = "Pending";

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (Resolved, Unpacked, Installed)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// The spec generation this condition was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Last time the condition status changed
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            observed_generation: None,
            last_transition_time: Utc::now(),
        }
    }
}

/// Look up a condition by type. O(n) over the fixed, small condition set.
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Check whether a condition of the given type exists with status True
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == ConditionStatus::True)
        .unwrap_or(false)
}

/// Set a condition, updating the matching entry in place or appending it.
///
/// The last-transition time is bumped only when the status value actually
/// changes; reason and message updates alone keep the previous timestamp.
/// Canonical ordering is restored after every write.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) {
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status != status {
                existing.last_transition_time = Utc::now();
            }
            existing.status = status;
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = observed_generation;
        }
        None => {
            let mut condition = Condition::new(type_, status, reason, message);
            condition.observed_generation = observed_generation;
            conditions.push(condition);
        }
    }
    sort_canonical(conditions);
}

/// Fill any missing canonical condition type with Unknown/Pending.
///
/// Called before every status write so a partial condition list can never be
/// observed, regardless of which phase a reconcile pass stopped at.
pub fn ensure_complete(conditions: &mut Vec<Condition>, observed_generation: Option<i64>) {
    for type_ in CONDITION_TYPES {
        if find_condition(conditions, type_).is_none() {
            let mut condition = Condition::new(
                type_,
                ConditionStatus::Unknown,
                REASON_PENDING,
                "reconciliation has not reached this phase yet",
            );
            condition.observed_generation = observed_generation;
            conditions.push(condition);
        }
    }
    // Drop anything outside the canonical set: the fixed set is an invariant,
    // not a minimum.
    conditions.retain(|c| CONDITION_TYPES.contains(&c.type_.as_str()));
    sort_canonical(conditions);
}

fn sort_canonical(conditions: &mut [Condition]) {
    conditions.sort_by_key(|c| {
        CONDITION_TYPES
            .iter()
            .position(|t| *t == c.type_)
            .unwrap_or(CONDITION_TYPES.len())
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Transition Time Semantics
    // =========================================================================

    #[test]
    fn set_condition_appends_when_absent() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            TYPE_RESOLVED,
            ConditionStatus::True,
            REASON_SUCCESS,
            "resolved to \"quay.io/prometheus@sha256:abc\"",
            Some(1),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, TYPE_RESOLVED);
        assert_eq!(conditions[0].status, ConditionStatus::True);
        assert_eq!(conditions[0].observed_generation, Some(1));
    }

    #[test]
    fn unchanged_status_preserves_transition_time() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            TYPE_RESOLVED,
            ConditionStatus::True,
            REASON_SUCCESS,
            "resolved to \"a\"",
            Some(1),
        );
        let first = conditions[0].last_transition_time;

        set_condition(
            &mut conditions,
            TYPE_RESOLVED,
            ConditionStatus::True,
            REASON_SUCCESS,
            "resolved to \"b\"",
            Some(2),
        );
        assert_eq!(conditions[0].last_transition_time, first);
        assert_eq!(conditions[0].message, "resolved to \"b\"");
        assert_eq!(conditions[0].observed_generation, Some(2));
    }

    #[test]
    fn status_change_bumps_transition_time() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            TYPE_INSTALLED,
            ConditionStatus::False,
            REASON_INSTALLATION_FAILED,
            "apply failed",
            None,
        );
        let first = conditions[0].last_transition_time;

        set_condition(
            &mut conditions,
            TYPE_INSTALLED,
            ConditionStatus::True,
            REASON_SUCCESS,
            "Installed bundle prometheus-operator.1.2.0 successfully",
            None,
        );
        assert!(conditions[0].last_transition_time >= first);
        assert_eq!(conditions[0].status, ConditionStatus::True);
    }

    // =========================================================================
    // Canonical Set Invariant
    // =========================================================================

    #[test]
    fn ensure_complete_fills_missing_types_in_order() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            TYPE_INSTALLED,
            ConditionStatus::False,
            REASON_INSTALLATION_FAILED,
            "boom",
            None,
        );
        ensure_complete(&mut conditions, Some(3));

        assert_eq!(conditions.len(), CONDITION_TYPES.len());
        let types: Vec<&str> = conditions.iter().map(|c| c.type_.as_str()).collect();
        assert_eq!(types, CONDITION_TYPES);

        let resolved = find_condition(&conditions, TYPE_RESOLVED).unwrap();
        assert_eq!(resolved.status, ConditionStatus::Unknown);
        assert_eq!(resolved.reason, REASON_PENDING);
        // The pre-existing condition keeps its content
        let installed = find_condition(&conditions, TYPE_INSTALLED).unwrap();
        assert_eq!(installed.reason, REASON_INSTALLATION_FAILED);
    }

    #[test]
    fn ensure_complete_drops_unknown_types() {
        let mut conditions = vec![Condition::new(
            "Mystery",
            ConditionStatus::True,
            "Whatever",
            "",
        )];
        ensure_complete(&mut conditions, None);
        assert_eq!(conditions.len(), CONDITION_TYPES.len());
        assert!(find_condition(&conditions, "Mystery").is_none());
    }

    #[test]
    fn ensure_complete_is_idempotent() {
        let mut conditions = Vec::new();
        ensure_complete(&mut conditions, None);
        let snapshot = conditions.clone();
        ensure_complete(&mut conditions, None);
        assert_eq!(conditions, snapshot);
    }

    #[test]
    fn find_and_is_true_helpers() {
        let mut conditions = Vec::new();
        ensure_complete(&mut conditions, None);
        assert!(!is_condition_true(&conditions, TYPE_UNPACKED));

        set_condition(
            &mut conditions,
            TYPE_UNPACKED,
            ConditionStatus::True,
            REASON_UNPACK_SUCCESS,
            "unpack successful",
            None,
        );
        assert!(is_condition_true(&conditions, TYPE_UNPACKED));
        assert!(find_condition(&conditions, "NotAType").is_none());
    }
}
