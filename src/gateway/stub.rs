use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::watch::Subscription;
use super::{
    Address, EventFilter, EventHandler, GatewayError, Ledger, LedgerEvent, StakeInfo,
    TransportError,
};
use crate::amount::TokenAmount;

#[derive(Default)]
struct StubState {
    stake_infos: HashMap<Address, StakeInfo>,
    balance: TokenAmount,
    can_reward: bool,
    reward_count: u64,
    pending_failures: usize,
    fail_watches: bool,
    watchers: Vec<(EventFilter, EventHandler, Arc<AtomicBool>)>,
}

#[derive(Default)]
struct ReadCounters {
    stake_info: AtomicUsize,
    balance: AtomicUsize,
    referral: AtomicUsize,
}

/// Scripted in-memory ledger.
#[derive(Clone, Default)]
pub struct StubLedger {
    state: Arc<Mutex<StubState>>,
    reads: Arc<ReadCounters>,
}

impl StubLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stake_info(self, program: Address, info: StakeInfo) -> Self {
        self.set_stake_info(program, info);
        self
    }

    pub fn with_balance(self, balance: TokenAmount) -> Self {
        self.set_balance(balance);
        self
    }

    pub fn with_referral(self, can_reward: bool, reward_count: u64) -> Self {
        {
            let mut state = self.state.lock();
            state.can_reward = can_reward;
            state.reward_count = reward_count;
        }
        self
    }

    /// Makes every `watch_event` call fail as if the endpoint refused it.
    pub fn with_failing_watches(self) -> Self {
        self.state.lock().fail_watches = true;
        self
    }

    pub fn set_stake_info(&self, program: Address, info: StakeInfo) {
        self.state.lock().stake_infos.insert(program, info);
    }

    pub fn set_balance(&self, balance: TokenAmount) {
        self.state.lock().balance = balance;
    }

    /// The next `count` reads of any kind fail with a retryable error.
    pub fn fail_next_reads(&self, count: usize) {
        self.state.lock().pending_failures = count;
    }

    pub fn stake_info_reads(&self) -> usize {
        self.reads.stake_info.load(Ordering::SeqCst)
    }

    pub fn balance_reads(&self) -> usize {
        self.reads.balance.load(Ordering::SeqCst)
    }

    pub fn referral_reads(&self) -> usize {
        self.reads.referral.load(Ordering::SeqCst)
    }

    pub fn active_watchers(&self) -> usize {
        self.state
            .lock()
            .watchers
            .iter()
            .filter(|(_, _, closed)| !closed.load(Ordering::SeqCst))
            .count()
    }

    /// Delivers `event` to every live watcher whose filter matches. Returns
    /// how many handlers ran.
    pub fn emit(&self, event: LedgerEvent) -> usize {
        let handlers: Vec<EventHandler> = {
            let mut state = self.state.lock();
            state
                .watchers
                .retain(|(_, _, closed)| !closed.load(Ordering::SeqCst));
            state
                .watchers
                .iter()
                .filter(|(filter, _, _)| filter.matches(&event))
                .map(|(_, handler, _)| handler.clone())
                .collect()
        };
        for handler in &handlers {
            handler(event.clone());
        }
        handlers.len()
    }

    fn take_failure(&self) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        if state.pending_failures > 0 {
            state.pending_failures -= 1;
            return Err(GatewayError::Transport(TransportError::Rpc {
                code: -32000,
                message: "scripted read failure".into(),
            }));
        }
        Ok(())
    }
}

#[async_trait]
impl Ledger for StubLedger {
    async fn read_stake_info(
        &self,
        program: Address,
        _account: Address,
    ) -> Result<StakeInfo, GatewayError> {
        self.reads.stake_info.fetch_add(1, Ordering::SeqCst);
        self.take_failure()?;
        Ok(self
            .state
            .lock()
            .stake_infos
            .get(&program)
            .copied()
            .unwrap_or_default())
    }

    async fn read_balance(
        &self,
        _token: Address,
        _account: Address,
    ) -> Result<TokenAmount, GatewayError> {
        self.reads.balance.fetch_add(1, Ordering::SeqCst);
        self.take_failure()?;
        Ok(self.state.lock().balance)
    }

    async fn read_can_reward(
        &self,
        _referral: Address,
        _account: Address,
    ) -> Result<bool, GatewayError> {
        self.reads.referral.fetch_add(1, Ordering::SeqCst);
        self.take_failure()?;
        Ok(self.state.lock().can_reward)
    }

    async fn read_reward_count(
        &self,
        _referral: Address,
        _account: Address,
    ) -> Result<u64, GatewayError> {
        self.take_failure()?;
        Ok(self.state.lock().reward_count)
    }

    async fn watch_event(
        &self,
        filter: EventFilter,
        handler: EventHandler,
    ) -> Result<Subscription, GatewayError> {
        let mut state = self.state.lock();
        if state.fail_watches {
            return Err(GatewayError::Transport(TransportError::Rpc {
                code: -32601,
                message: "filters not supported".into(),
            }));
        }
        let closed = Arc::new(AtomicBool::new(false));
        state.watchers.push((filter, handler, closed.clone()));
        Ok(Subscription::new(filter, closed, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::EventKind;

    fn address(last: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[19] = last;
        Address::new(bytes)
    }

    #[tokio::test]
    async fn dropped_subscription_stops_delivery() {
        let ledger = StubLedger::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let filter = EventFilter::rewards_claimed(address(1), address(2));
        let mut subscription = ledger
            .watch_event(
                filter,
                Arc::new(move |_: LedgerEvent| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .expect("watch");
        let event = LedgerEvent::new(EventKind::RewardsClaimed, address(1), &[address(2)]);
        assert_eq!(ledger.emit(event.clone()), 1);

        subscription.unsubscribe();
        subscription.unsubscribe();
        assert!(!subscription.is_active());
        assert_eq!(ledger.emit(event), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(ledger.active_watchers(), 0);
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let ledger = StubLedger::new().with_balance(TokenAmount::from_tokens(5));
        ledger.fail_next_reads(2);
        let (token, me) = (address(1), address(2));
        assert!(ledger.read_balance(token, me).await.is_err());
        assert!(ledger.read_balance(token, me).await.is_err());
        assert_eq!(
            ledger.read_balance(token, me).await.expect("balance"),
            TokenAmount::from_tokens(5)
        );
        assert_eq!(ledger.balance_reads(), 3);
    }
}
