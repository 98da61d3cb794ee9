//! Rule evaluation.

use aegis::policy::{evaluate, DataRegion, Plan, Policy, Verdict, VerdictReason};

fn policy() -> Policy {
    Policy {
        budget_cap: 10_000.0,
        sla_min: 96.0,
        allow_cross_region: false,
        max_delay_minutes: 60,
    }
}

fn compliant_plan() -> Plan {
    Plan {
        route: "R7".to_owned(),
        added_cost: 6_400.0,
        expected_delay_minutes: 45,
        data_region: DataRegion::Eu,
        pii_used: false,
    }
}

#[test]
fn compliant_plan_is_sat() {
    let verdict = evaluate(&policy(), &compliant_plan());
    assert!(verdict.sat());
    assert_eq!(verdict.reason(), &VerdictReason::Ok);
    assert_eq!(verdict.details()["plan"]["route"], "R7");
}

#[test]
fn evaluation_is_pure() {
    let plan = compliant_plan().with_pii_used(true);
    let first = evaluate(&policy(), &plan);
    let second = evaluate(&policy(), &plan);
    assert_eq!(first, second);
}

#[test]
fn budget_is_checked_before_delay() {
    let plan = compliant_plan()
        .with_added_cost(12_000.0)
        .with_expected_delay(90);
    let verdict = evaluate(&policy(), &plan);
    assert!(!verdict.sat());
    assert_eq!(verdict.reason(), &VerdictReason::BudgetExceeded);
    assert_eq!(verdict.details()["added_cost"], 12_000.0);
    assert_eq!(verdict.details()["cap"], 10_000.0);
}

#[test]
fn values_at_the_limit_comply() {
    let plan = compliant_plan()
        .with_added_cost(10_000.0)
        .with_expected_delay(60);
    assert!(evaluate(&policy(), &plan).sat());
}

#[test]
fn delay_over_limit_reports_both_values() {
    let verdict = evaluate(&policy(), &compliant_plan().with_expected_delay(75));
    assert_eq!(verdict.reason(), &VerdictReason::DelayExceedsLimit);
    assert_eq!(verdict.details()["delay"], 75);
    assert_eq!(verdict.details()["limit"], 60);
}

#[test]
fn non_eu_region_fails_without_cross_region() {
    let plan = compliant_plan().with_data_region(DataRegion::Us);
    let verdict = evaluate(&policy(), &plan);
    assert_eq!(verdict.reason(), &VerdictReason::DataEgressNonEu);
    assert_eq!(verdict.details()["region"], "US");

    let open = Policy {
        allow_cross_region: true,
        ..policy()
    };
    assert!(evaluate(&open, &plan).sat());
}

#[test]
fn pii_is_never_allowed() {
    let open = Policy {
        allow_cross_region: true,
        ..policy()
    };
    let verdict = evaluate(&open, &compliant_plan().with_pii_used(true));
    assert_eq!(verdict.reason(), &VerdictReason::PiiUsedNotAllowed);
}

#[test]
fn unknown_region_labels_survive_parsing() {
    let plan: Plan = serde_json::from_str(
        r#"{"route":"R1","added_cost":1,"expected_delay_minutes":0,"data_region":"APAC","pii_used":false}"#,
    )
    .expect("plan should parse");
    assert_eq!(plan.data_region, DataRegion::Other("APAC".to_owned()));
    assert_eq!(
        evaluate(&policy(), &plan).reason(),
        &VerdictReason::DataEgressNonEu
    );
}

#[test]
fn verdict_serializes_sat_from_reason() {
    let verdict = evaluate(&policy(), &compliant_plan().with_pii_used(true));
    let value = serde_json::to_value(&verdict).expect("serialize");
    assert_eq!(value["sat"], false);
    assert_eq!(value["reason"], "pii_used_not_allowed");

    let inconsistent = r#"{"sat":true,"reason":"budget_exceeded","details":{}}"#;
    assert!(serde_json::from_str::<Verdict>(inconsistent).is_err());
}

#[test]
fn invalid_inputs_are_rejected() {
    let bad_policy = Policy {
        budget_cap: f64::NAN,
        ..policy()
    };
    assert!(bad_policy.validate().is_err());

    let bad_sla = Policy {
        sla_min: 120.0,
        ..policy()
    };
    assert!(bad_sla.validate().is_err());

    let bad_plan = compliant_plan().with_added_cost(-1.0);
    assert!(bad_plan.validate().is_err());

    let mut empty_route = compliant_plan();
    empty_route.route = "  ".to_owned();
    assert!(empty_route.validate().is_err());
}
