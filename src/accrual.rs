//! Local projection of the claimable income balance.
//!
//! The chain only tells us the claimable amount when we ask for it, and reads
//! are slow. Between reads the wallet extrapolates from the last authoritative
//! value (the *baseline*) at the fixed accrual rate, and every fresh read is
//! reconciled against that projection with compare-and-adopt semantics.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::amount::{TokenAmount, WEI_PER_TOKEN};

/// One whole token accrues every 8640 seconds (2.4 hours).
pub const DEFAULT_SECONDS_PER_TOKEN: u64 = 8_640;

/// Independent income programs tracked by a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncomeProgram {
    Basic,
    Plus,
}

impl IncomeProgram {
    pub const ALL: [IncomeProgram; 2] = [IncomeProgram::Basic, IncomeProgram::Plus];

    pub fn label(self) -> &'static str {
        match self {
            IncomeProgram::Basic => "basic_income",
            IncomeProgram::Plus => "basic_income_plus",
        }
    }

    /// Feature namespace used for persisted mirror keys.
    pub fn storage_prefix(self) -> &'static str {
        match self {
            IncomeProgram::Basic => "basicIncome",
            IncomeProgram::Plus => "basicIncomePlus",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            IncomeProgram::Basic => 0,
            IncomeProgram::Plus => 1,
        }
    }
}

impl fmt::Display for IncomeProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Fixed accrual speed expressed as seconds needed to earn one token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccrualRate {
    seconds_per_token: u64,
}

impl AccrualRate {
    pub fn new(seconds_per_token: u64) -> Self {
        Self {
            seconds_per_token: seconds_per_token.max(1),
        }
    }

    pub fn seconds_per_token(&self) -> u64 {
        self.seconds_per_token
    }

    /// Amount accrued over `elapsed_ms`, rounded down to the nearest wei.
    pub fn accrued(&self, elapsed_ms: u64) -> TokenAmount {
        let denominator = self.seconds_per_token as u128 * 1_000;
        TokenAmount::from_wei(elapsed_ms as u128 * WEI_PER_TOKEN / denominator)
    }
}

impl Default for AccrualRate {
    fn default() -> Self {
        Self::new(DEFAULT_SECONDS_PER_TOKEN)
    }
}

/// Authoritative amount together with the instant it was observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Baseline {
    pub amount: TokenAmount,
    pub timestamp_ms: u64,
}

impl Baseline {
    pub fn new(amount: TokenAmount, timestamp_ms: u64) -> Self {
        Self {
            amount,
            timestamp_ms,
        }
    }
}

/// Accrual anchor for one program and one bound address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccrualState {
    baseline: Baseline,
    activated: bool,
}

impl AccrualState {
    pub fn new(now_ms: u64) -> Self {
        Self {
            baseline: Baseline::new(TokenAmount::ZERO, now_ms),
            activated: false,
        }
    }

    pub fn from_baseline(baseline: Baseline, activated: bool) -> Self {
        Self {
            baseline,
            activated,
        }
    }

    pub fn baseline(&self) -> Baseline {
        self.baseline
    }

    pub fn activated(&self) -> bool {
        self.activated
    }

    /// `baseline + rate * elapsed`. A clock that moved backwards counts as
    /// zero elapsed time.
    pub fn projected(&self, rate: &AccrualRate, now_ms: u64) -> TokenAmount {
        let elapsed = now_ms.saturating_sub(self.baseline.timestamp_ms);
        self.baseline.amount.saturating_add(rate.accrued(elapsed))
    }

    pub fn reconcile(
        &mut self,
        authoritative: TokenAmount,
        rate: &AccrualRate,
        tolerance: TokenAmount,
        now_ms: u64,
    ) -> ReconcileOutcome {
        let projection = self.projected(rate, now_ms);
        if authoritative.abs_diff(projection) <= tolerance {
            return ReconcileOutcome::Unchanged { projection };
        }
        let direction = if authoritative > projection {
            Divergence::ExternalAccrual
        } else {
            Divergence::ExternalClaim
        };
        // Amount and timestamp move together.
        self.baseline = Baseline::new(authoritative, now_ms);
        ReconcileOutcome::Adopted {
            previous: projection,
            direction,
        }
    }

    pub fn reset_after_claim(&mut self, now_ms: u64) {
        self.baseline = Baseline::new(TokenAmount::ZERO, now_ms);
    }

    pub fn set_activated(&mut self, activated: bool) -> bool {
        let changed = self.activated != activated;
        self.activated = activated;
        changed
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Divergence {
    /// The chain is ahead of the projection (missed ticks, suspended process).
    ExternalAccrual,
    /// The chain is behind the projection (claimed elsewhere).
    ExternalClaim,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Unchanged {
        projection: TokenAmount,
    },
    Adopted {
        previous: TokenAmount,
        direction: Divergence,
    },
}

impl ReconcileOutcome {
    pub fn adopted(&self) -> bool {
        matches!(self, ReconcileOutcome::Adopted { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::Unchanged { .. } => "unchanged",
            ReconcileOutcome::Adopted {
                direction: Divergence::ExternalAccrual,
                ..
            } => "adopted_higher",
            ReconcileOutcome::Adopted {
                direction: Divergence::ExternalClaim,
                ..
            } => "adopted_lower",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Unbound,
    Uninitialized,
    Tracking,
    AwaitingConfirmation,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Unbound => "unbound",
            Phase::Uninitialized => "uninitialized",
            Phase::Tracking => "tracking",
            Phase::AwaitingConfirmation => "awaiting_confirmation",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackerError {
    NotBound,
    ActionPending,
}

/// Phase bookkeeping around an [`AccrualState`] for one program.
#[derive(Clone, Debug)]
pub struct IncomeTracker {
    rate: AccrualRate,
    tolerance: TokenAmount,
    phase: Phase,
    state: Option<AccrualState>,
    frozen: Option<TokenAmount>,
    resume_phase: Phase,
    reconciled_once: bool,
}

impl IncomeTracker {
    pub fn new(rate: AccrualRate, tolerance: TokenAmount) -> Self {
        Self {
            rate,
            tolerance,
            phase: Phase::Unbound,
            state: None,
            frozen: None,
            resume_phase: Phase::Unbound,
            reconciled_once: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn rate(&self) -> &AccrualRate {
        &self.rate
    }

    pub fn state(&self) -> Option<&AccrualState> {
        self.state.as_ref()
    }

    pub fn activated(&self) -> bool {
        self.state.map(|state| state.activated()).unwrap_or(false)
    }

    /// Starts tracking a freshly bound address. A persisted baseline resumes
    /// extrapolation where the previous process stopped.
    pub fn bind(&mut self, now_ms: u64, persisted: Option<Baseline>, activated: bool) {
        let state = match persisted {
            Some(baseline) => AccrualState::from_baseline(baseline, activated),
            None => {
                let mut state = AccrualState::new(now_ms);
                state.set_activated(activated);
                state
            }
        };
        self.state = Some(state);
        self.phase = Phase::Uninitialized;
        self.frozen = None;
        self.reconciled_once = false;
    }

    pub fn unbind(&mut self) {
        *self = Self::new(self.rate, self.tolerance);
    }

    /// Current value for display. Frozen while an action awaits confirmation.
    pub fn displayed(&self, now_ms: u64) -> Option<TokenAmount> {
        if let Some(frozen) = self.frozen {
            return Some(frozen);
        }
        self.state.map(|state| state.projected(&self.rate, now_ms))
    }

    /// Pure projection for the periodic display refresh.
    pub fn tick(&self, now_ms: u64) -> Option<TokenAmount> {
        self.displayed(now_ms)
    }

    /// Returns `None` when nothing is bound. The boolean tells whether this
    /// was the first reconciliation since binding.
    pub fn reconcile(
        &mut self,
        authoritative: TokenAmount,
        now_ms: u64,
    ) -> Option<(ReconcileOutcome, bool)> {
        let state = self.state.as_mut()?;
        let outcome = state.reconcile(authoritative, &self.rate, self.tolerance, now_ms);
        let first = !self.reconciled_once;
        self.reconciled_once = true;
        match self.phase {
            Phase::Uninitialized => self.phase = Phase::Tracking,
            Phase::AwaitingConfirmation => {
                if self.resume_phase == Phase::Uninitialized {
                    self.resume_phase = Phase::Tracking;
                }
            }
            Phase::Tracking | Phase::Unbound => {}
        }
        Some((outcome, first))
    }

    pub fn set_activated(&mut self, activated: bool) -> bool {
        match self.state.as_mut() {
            Some(state) => state.set_activated(activated),
            None => false,
        }
    }

    /// Freezes the projection while an action is in flight.
    pub fn begin_action(&mut self, now_ms: u64) -> Result<(), TrackerError> {
        match self.phase {
            Phase::Unbound => Err(TrackerError::NotBound),
            Phase::AwaitingConfirmation => Err(TrackerError::ActionPending),
            Phase::Uninitialized | Phase::Tracking => {
                self.frozen = self.displayed(now_ms);
                self.resume_phase = self.phase;
                self.phase = Phase::AwaitingConfirmation;
                Ok(())
            }
        }
    }

    /// Failed action: back to the previous phase, projection untouched.
    pub fn abort_action(&mut self) {
        if self.phase == Phase::AwaitingConfirmation {
            self.phase = self.resume_phase;
        }
        self.frozen = None;
    }

    pub fn complete_claim(&mut self, now_ms: u64) -> Option<Baseline> {
        let state = self.state.as_mut()?;
        state.reset_after_claim(now_ms);
        self.frozen = None;
        self.phase = Phase::Tracking;
        Some(state.baseline())
    }

    pub fn complete_activation(&mut self) -> bool {
        let changed = self.set_activated(true);
        self.frozen = None;
        if self.phase == Phase::AwaitingConfirmation {
            self.phase = Phase::Tracking;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const T0: u64 = 1_700_000_000_000;

    fn tokens(value: &str) -> TokenAmount {
        value.parse().expect("amount")
    }

    fn tracker() -> IncomeTracker {
        IncomeTracker::new(AccrualRate::default(), TokenAmount::ZERO)
    }

    #[test]
    fn one_token_accrues_every_8640_seconds() {
        let rate = AccrualRate::default();
        assert_eq!(rate.accrued(8_640_000), TokenAmount::from_tokens(1));
        assert_eq!(rate.accrued(0), TokenAmount::ZERO);
        assert_eq!(rate.accrued(1_000).wei(), 115_740_740_740_740);
    }

    #[test]
    fn external_claim_resets_baseline_and_keeps_accruing() {
        let rate = AccrualRate::default();
        let mut state = AccrualState::from_baseline(Baseline::new(tokens("10"), T0), true);
        let later = T0 + 8_640_000;
        assert_eq!(state.projected(&rate, later), tokens("11"));

        let outcome = state.reconcile(tokens("9"), &rate, TokenAmount::ZERO, later);
        assert_eq!(
            outcome,
            ReconcileOutcome::Adopted {
                previous: tokens("11"),
                direction: Divergence::ExternalClaim,
            }
        );
        assert_eq!(state.baseline(), Baseline::new(tokens("9"), later));

        let next_tick = state.projected(&rate, later + 1_000);
        assert_eq!(next_tick.format_fixed(6), "9.000116");
    }

    #[test]
    fn higher_read_is_adopted_as_external_accrual() {
        let rate = AccrualRate::default();
        let mut state = AccrualState::new(T0);
        let outcome = state.reconcile(tokens("3"), &rate, TokenAmount::ZERO, T0 + 10);
        assert!(matches!(
            outcome,
            ReconcileOutcome::Adopted {
                direction: Divergence::ExternalAccrual,
                ..
            }
        ));
        assert_eq!(state.baseline(), Baseline::new(tokens("3"), T0 + 10));
    }

    #[test]
    fn matching_read_keeps_the_anchor() {
        let rate = AccrualRate::default();
        let mut state = AccrualState::from_baseline(Baseline::new(tokens("2"), T0), false);
        let now = T0 + 8_640_000;
        let outcome = state.reconcile(tokens("3"), &rate, TokenAmount::ZERO, now);
        assert_eq!(
            outcome,
            ReconcileOutcome::Unchanged {
                projection: tokens("3")
            }
        );
        assert_eq!(state.baseline().timestamp_ms, T0);
    }

    #[test]
    fn tolerance_absorbs_small_drift() {
        let rate = AccrualRate::default();
        let mut state = AccrualState::from_baseline(Baseline::new(tokens("5"), T0), false);
        let drift = TokenAmount::from_wei(1_000);
        let outcome = state.reconcile(
            TokenAmount::from_wei(tokens("5").wei() + 500),
            &rate,
            drift,
            T0,
        );
        assert!(!outcome.adopted());
    }

    #[test]
    fn reconcile_is_idempotent() {
        let rate = AccrualRate::default();
        let mut once = AccrualState::from_baseline(Baseline::new(tokens("4"), T0), true);
        let mut twice = once;
        let now = T0 + 60_000;
        once.reconcile(tokens("7"), &rate, TokenAmount::ZERO, now);
        twice.reconcile(tokens("7"), &rate, TokenAmount::ZERO, now);
        let second = twice.reconcile(tokens("7"), &rate, TokenAmount::ZERO, now);
        assert!(!second.adopted());
        assert_eq!(once, twice);
        assert_eq!(twice.projected(&rate, now), tokens("7"));
    }

    #[test]
    fn clock_moving_backwards_does_not_reduce_projection() {
        let rate = AccrualRate::default();
        let state = AccrualState::from_baseline(Baseline::new(tokens("1"), T0), false);
        assert_eq!(state.projected(&rate, T0 - 5_000), tokens("1"));
    }

    #[test]
    fn tracker_walks_through_phases() {
        let mut tracker = tracker();
        assert_eq!(tracker.phase(), Phase::Unbound);
        assert_eq!(tracker.displayed(T0), None);
        assert_eq!(tracker.begin_action(T0), Err(TrackerError::NotBound));

        tracker.bind(T0, None, false);
        assert_eq!(tracker.phase(), Phase::Uninitialized);
        assert_eq!(tracker.displayed(T0), Some(TokenAmount::ZERO));

        let (_, first) = tracker.reconcile(tokens("2"), T0).expect("bound");
        assert!(first);
        assert_eq!(tracker.phase(), Phase::Tracking);
        let (_, first) = tracker.reconcile(tokens("2"), T0).expect("bound");
        assert!(!first);

        tracker.unbind();
        assert_eq!(tracker.phase(), Phase::Unbound);
        assert!(tracker.state().is_none());
    }

    #[test]
    fn pending_action_freezes_projection() {
        let mut tracker = tracker();
        tracker.bind(T0, Some(Baseline::new(tokens("1"), T0)), true);
        tracker.reconcile(tokens("1"), T0);

        tracker.begin_action(T0 + 8_640_000).expect("begin");
        assert_eq!(tracker.phase(), Phase::AwaitingConfirmation);
        assert_eq!(tracker.begin_action(T0), Err(TrackerError::ActionPending));
        assert_eq!(tracker.displayed(T0 + 20_000_000), Some(tokens("2")));

        tracker.abort_action();
        assert_eq!(tracker.phase(), Phase::Tracking);
        assert_eq!(tracker.displayed(T0 + 8_640_000), Some(tokens("2")));
    }

    #[test]
    fn claim_zeroes_the_display_without_negative_jumps() {
        let mut tracker = tracker();
        tracker.bind(T0, Some(Baseline::new(tokens("6"), T0)), true);
        tracker.reconcile(tokens("6"), T0);
        let claim_at = T0 + 30_000;

        tracker.begin_action(claim_at).expect("begin");
        let baseline = tracker.complete_claim(claim_at).expect("bound");
        assert_eq!(baseline, Baseline::new(TokenAmount::ZERO, claim_at));
        assert_eq!(tracker.phase(), Phase::Tracking);
        assert_eq!(tracker.displayed(claim_at), Some(TokenAmount::ZERO));
        let mut last = TokenAmount::ZERO;
        for step in 1..10u64 {
            let value = tracker.tick(claim_at + step * 1_000).expect("bound");
            assert!(value >= last);
            last = value;
        }
    }

    #[test]
    fn activation_flips_the_flag_once() {
        let mut tracker = tracker();
        tracker.bind(T0, None, false);
        tracker.begin_action(T0).expect("begin");
        assert!(tracker.complete_activation());
        assert!(tracker.activated());
        assert_eq!(tracker.phase(), Phase::Tracking);
        assert!(!tracker.set_activated(true));
    }

    #[test]
    fn reconcile_during_pending_action_leaves_display_frozen() {
        let mut tracker = tracker();
        tracker.bind(T0, None, false);
        tracker.begin_action(T0).expect("begin");
        tracker.reconcile(tokens("5"), T0 + 1).expect("bound");
        assert_eq!(tracker.phase(), Phase::AwaitingConfirmation);
        assert_eq!(tracker.displayed(T0 + 1), Some(TokenAmount::ZERO));
        tracker.abort_action();
        assert_eq!(tracker.phase(), Phase::Tracking);
        assert_eq!(tracker.displayed(T0 + 1), Some(tokens("5")));
    }

    proptest! {
        #[test]
        fn projection_matches_formula_and_never_decreases(
            baseline_wei in 0u128..(1u128 << 100),
            seconds in 0u64..(10 * 365 * 24 * 3600),
            extra in 0u64..100_000,
        ) {
            let rate = AccrualRate::default();
            let state = AccrualState::from_baseline(
                Baseline::new(TokenAmount::from_wei(baseline_wei), T0),
                true,
            );
            let at = T0 + seconds * 1_000;
            let expected = baseline_wei + seconds as u128 * WEI_PER_TOKEN / DEFAULT_SECONDS_PER_TOKEN as u128;
            prop_assert_eq!(state.projected(&rate, at).wei(), expected);
            prop_assert!(state.projected(&rate, at + extra) >= state.projected(&rate, at));
        }

        #[test]
        fn reconcile_always_lands_on_the_authoritative_value(
            baseline_wei in 0u128..(1u128 << 90),
            authoritative_wei in 0u128..(1u128 << 90),
            elapsed_ms in 0u64..1_000_000_000,
        ) {
            let rate = AccrualRate::default();
            let mut state = AccrualState::from_baseline(
                Baseline::new(TokenAmount::from_wei(baseline_wei), T0),
                false,
            );
            let now = T0 + elapsed_ms;
            let authoritative = TokenAmount::from_wei(authoritative_wei);
            state.reconcile(authoritative, &rate, TokenAmount::ZERO, now);
            prop_assert_eq!(state.projected(&rate, now), authoritative);
        }
    }
}
