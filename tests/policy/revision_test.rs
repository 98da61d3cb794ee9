//! Auto-revision.

use aegis::policy::revision::{auto_revise, auto_revise_with, RepairRule, RevisionOutcome};
use aegis::policy::{evaluate, DataRegion, Plan, Policy, Verdict, VerdictReason, Verifier};
use serde_json::json;

fn policy() -> Policy {
    Policy {
        budget_cap: 10_000.0,
        sla_min: 96.0,
        allow_cross_region: false,
        max_delay_minutes: 60,
    }
}

fn r7_plan() -> Plan {
    Plan {
        route: "R7".to_owned(),
        added_cost: 6_400.0,
        expected_delay_minutes: 75,
        data_region: DataRegion::Us,
        pii_used: true,
    }
}

#[test]
fn r7_converges_in_first_attempt() {
    let result = auto_revise(&policy(), r7_plan(), 6);

    assert_eq!(result.outcome, RevisionOutcome::Sat);
    assert_eq!(result.outcome.label(), "SAT");
    assert_eq!(result.attempts, 1);
    assert!(result.plan.expected_delay_minutes <= 60);
    assert_eq!(result.plan.data_region, DataRegion::Eu);
    assert!(!result.plan.pii_used);
    assert!(result.plan.added_cost <= 10_000.0);
    assert_eq!(result.plan.route, "R7");

    assert_eq!(result.history.len(), 1);
    assert_eq!(
        result.history[0].fixes,
        vec![
            RepairRule::ClampDelay,
            RepairRule::ForceEuRegion,
            RepairRule::DisablePii
        ]
    );
    assert!(evaluate(&policy(), &result.plan).sat());
}

#[test]
fn budget_violation_clamps_to_cap() {
    let plan = r7_plan()
        .with_added_cost(25_000.0)
        .with_expected_delay(10)
        .with_data_region(DataRegion::Eu)
        .with_pii_used(false);
    let result = auto_revise(&policy(), plan, 3);

    assert!(result.outcome.is_sat());
    assert!((result.plan.added_cost - 10_000.0).abs() < f64::EPSILON);
    assert_eq!(result.history[0].fixes, vec![RepairRule::ClampCost]);
}

#[test]
fn compliant_plan_needs_no_fixes() {
    let plan = r7_plan()
        .with_expected_delay(30)
        .with_data_region(DataRegion::Eu)
        .with_pii_used(false);
    let result = auto_revise(&policy(), plan.clone(), 6);
    assert!(result.outcome.is_sat());
    assert_eq!(result.attempts, 1);
    assert!(result.history[0].fixes.is_empty());
    assert_eq!(result.plan, plan);
}

#[test]
fn zero_attempts_only_verifies() {
    let unsat = auto_revise(&policy(), r7_plan(), 0);
    assert_eq!(unsat.attempts, 0);
    assert_eq!(unsat.plan, r7_plan());
    assert_eq!(
        unsat.outcome,
        RevisionOutcome::Unsat {
            counterexample: VerdictReason::DelayExceedsLimit
        }
    );

    let plan = r7_plan()
        .with_expected_delay(30)
        .with_data_region(DataRegion::Eu)
        .with_pii_used(false);
    let sat = auto_revise(&policy(), plan, 0);
    assert!(sat.outcome.is_sat());
    assert_eq!(sat.attempts, 0);
}

/// Reports a reason no repair rule knows.
struct CarbonVerifier;

impl Verifier for CarbonVerifier {
    fn verify(&self, _policy: &Policy, _plan: &Plan) -> Verdict {
        Verdict::violation(
            VerdictReason::Other("carbon_budget_exceeded".to_owned()),
            json!({}),
        )
    }
}

#[test]
fn unknown_reason_stops_without_looping() {
    let result = auto_revise_with(&CarbonVerifier, &policy(), r7_plan(), 6);

    assert_eq!(result.outcome.label(), "UNSAT");
    assert_eq!(
        result.outcome,
        RevisionOutcome::NoRule {
            reason: VerdictReason::Other("carbon_budget_exceeded".to_owned())
        }
    );
    assert_eq!(result.attempts, 1);
    assert!(result.attempts <= 6);
    assert_eq!(result.plan, r7_plan());
}

/// Each repair re-breaks the delay rule, so revision can never settle.
struct SeesawVerifier;

impl Verifier for SeesawVerifier {
    fn verify(&self, _policy: &Policy, plan: &Plan) -> Verdict {
        if plan.pii_used {
            Verdict::violation(VerdictReason::PiiUsedNotAllowed, json!({}))
        } else {
            Verdict::violation(VerdictReason::DelayExceedsLimit, json!({}))
        }
    }
}

#[test]
fn exhausted_attempts_report_counterexample() {
    let result = auto_revise_with(&SeesawVerifier, &policy(), r7_plan(), 3);
    assert_eq!(result.attempts, 3);
    assert_eq!(result.history.len(), 3);
    assert_eq!(
        result.outcome.counterexample(),
        Some(&VerdictReason::DelayExceedsLimit)
    );
}

#[test]
fn outcome_serializes_with_final_tag() {
    let result = auto_revise(&policy(), r7_plan(), 6);
    let value = serde_json::to_value(&result).expect("serialize");
    assert_eq!(value["outcome"]["final"], "SAT");
    assert_eq!(value["history"][0]["fixes"][0], "clamp_delay");
}
