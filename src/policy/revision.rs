//! Bounded auto-revision of non-compliant plans.
//!
//! Each violation reason maps to exactly one repair rule that moves a single
//! field to its limit. An attempt applies up to [`FIXES_PER_ATTEMPT`] rules,
//! re-verifying after each. Further attempts only matter when a verifier's
//! rules interact; `max_attempts` bounds that case. A reason with no rule
//! ends revision at once with [`RevisionOutcome::NoRule`].

use serde::Serialize;
use tracing::debug;

use super::{DataRegion, Plan, Policy, RuleVerifier, Verdict, VerdictReason, Verifier};

/// Upper bound on rule applications within one attempt (one per known reason).
pub const FIXES_PER_ATTEMPT: usize = 4;

/// A corrective rule applied to a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairRule {
    /// Lower `added_cost` to `budget_cap`.
    ClampCost,
    /// Lower `expected_delay_minutes` to `max_delay_minutes`.
    ClampDelay,
    /// Move data processing to the EU.
    ForceEuRegion,
    /// Stop using PII.
    DisablePii,
}

impl RepairRule {
    /// Rule for a violation reason, if one exists.
    pub fn for_reason(reason: &VerdictReason) -> Option<Self> {
        match reason {
            VerdictReason::BudgetExceeded => Some(Self::ClampCost),
            VerdictReason::DelayExceedsLimit => Some(Self::ClampDelay),
            VerdictReason::DataEgressNonEu => Some(Self::ForceEuRegion),
            VerdictReason::PiiUsedNotAllowed => Some(Self::DisablePii),
            VerdictReason::Ok | VerdictReason::Other(_) => None,
        }
    }

    /// Build the repaired plan. Applying a rule twice changes nothing more.
    pub fn apply(&self, policy: &Policy, plan: Plan) -> Plan {
        match self {
            Self::ClampCost => {
                let cost = plan.added_cost.min(policy.budget_cap);
                plan.with_added_cost(cost)
            }
            Self::ClampDelay => {
                let delay = plan.expected_delay_minutes.min(policy.max_delay_minutes);
                plan.with_expected_delay(delay)
            }
            Self::ForceEuRegion => plan.with_data_region(DataRegion::Eu),
            Self::DisablePii => plan.with_pii_used(false),
        }
    }
}

/// One attempt of the revision loop.
#[derive(Debug, Clone, Serialize)]
pub struct RevisionStep {
    /// 1-based attempt index.
    pub attempt: u32,
    /// Rules applied during the attempt, in order.
    pub fixes: Vec<RepairRule>,
    /// Verdict observed at the end of the attempt.
    pub verdict: Verdict,
}

/// How revision ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "final", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RevisionOutcome {
    /// The final plan complies.
    Sat,
    /// Attempts ran out; the last verdict's reason is the counterexample.
    Unsat {
        /// Reason of the last failing verdict.
        counterexample: VerdictReason,
    },
    /// A violation had no repair rule.
    NoRule {
        /// The unrepairable reason.
        reason: VerdictReason,
    },
}

impl RevisionOutcome {
    /// Whether revision reached a compliant plan.
    pub fn is_sat(&self) -> bool {
        matches!(self, Self::Sat)
    }

    /// `SAT` or `UNSAT`; an unrepairable reason counts as `UNSAT`.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Sat => "SAT",
            Self::Unsat { .. } | Self::NoRule { .. } => "UNSAT",
        }
    }

    /// Counterexample reason for unsatisfied outcomes.
    pub fn counterexample(&self) -> Option<&VerdictReason> {
        match self {
            Self::Sat => None,
            Self::Unsat { counterexample } => Some(counterexample),
            Self::NoRule { reason } => Some(reason),
        }
    }
}

/// Result of [`auto_revise`].
#[derive(Debug, Clone, Serialize)]
pub struct RevisionResult {
    /// How the loop ended.
    pub outcome: RevisionOutcome,
    /// Attempts taken (the attempt that reached SAT, or the budget).
    pub attempts: u32,
    /// Plan after the last applied rule.
    pub plan: Plan,
    /// Per-attempt trace.
    pub history: Vec<RevisionStep>,
}

/// Revise a plan with the built-in rule verifier.
pub fn auto_revise(policy: &Policy, plan: Plan, max_attempts: u32) -> RevisionResult {
    auto_revise_with(&RuleVerifier, policy, plan, max_attempts)
}

/// Revise a plan until `verifier` is satisfied or `max_attempts` runs out.
///
/// With `max_attempts == 0` no rule is applied; the initial plan is only
/// verified.
pub fn auto_revise_with(
    verifier: &dyn Verifier,
    policy: &Policy,
    plan: Plan,
    max_attempts: u32,
) -> RevisionResult {
    let mut current = plan;
    let mut history = Vec::new();

    for attempt in 1..=max_attempts {
        let mut fixes = Vec::new();

        for _ in 0..FIXES_PER_ATTEMPT {
            let verdict = verifier.verify(policy, &current);
            if verdict.sat() {
                history.push(RevisionStep {
                    attempt,
                    fixes,
                    verdict,
                });
                return finish(RevisionOutcome::Sat, attempt, current, history);
            }

            let Some(rule) = RepairRule::for_reason(verdict.reason()) else {
                debug!(attempt, reason = %verdict.reason(), "no repair rule for reason");
                let reason = verdict.reason().clone();
                history.push(RevisionStep {
                    attempt,
                    fixes,
                    verdict,
                });
                return finish(RevisionOutcome::NoRule { reason }, attempt, current, history);
            };

            debug!(attempt, reason = %verdict.reason(), rule = ?rule, "applying repair rule");
            current = rule.apply(policy, current);
            fixes.push(rule);
        }

        let verdict = verifier.verify(policy, &current);
        let sat = verdict.sat();
        history.push(RevisionStep {
            attempt,
            fixes,
            verdict,
        });
        if sat {
            return finish(RevisionOutcome::Sat, attempt, current, history);
        }
    }

    let last = verifier.verify(policy, &current);
    let outcome = if last.sat() {
        RevisionOutcome::Sat
    } else {
        RevisionOutcome::Unsat {
            counterexample: last.reason().clone(),
        }
    };
    finish(outcome, max_attempts, current, history)
}

fn finish(
    outcome: RevisionOutcome,
    attempts: u32,
    plan: Plan,
    history: Vec<RevisionStep>,
) -> RevisionResult {
    debug!(outcome = outcome.label(), attempts, "auto-revision finished");
    RevisionResult {
        outcome,
        attempts,
        plan,
        history,
    }
}
