use metrics::{counter, histogram};

use crate::accrual::{IncomeProgram, ReconcileOutcome};
use crate::amount::TokenAmount;

pub fn record_gateway_request(endpoint: &str, method: &str, result: &'static str) {
    counter!(
        "wallet.gateway.requests",
        "endpoint" => endpoint.to_string(),
        "method" => method.to_string(),
        "result" => result
    )
    .increment(1);
}

/// Counts reconciliations and, for adopted ones, how far the projection had
/// drifted from the authoritative read.
pub fn record_reconcile(program: IncomeProgram, outcome: &ReconcileOutcome, authoritative: TokenAmount) {
    counter!(
        "wallet.income.reconcile",
        "program" => program.label(),
        "outcome" => outcome.label()
    )
    .increment(1);
    if let ReconcileOutcome::Adopted { previous, .. } = outcome {
        histogram!("wallet.income.reconcile.drift_tokens", "program" => program.label())
            .record(previous.abs_diff(authoritative).as_f64());
    }
}

pub fn record_action(action: &'static str, result: &'static str) {
    counter!("wallet.income.actions", "action" => action, "result" => result).increment(1);
}

pub fn record_read_retry(target: &'static str) {
    counter!("wallet.income.read_retries", "target" => target).increment(1);
}
