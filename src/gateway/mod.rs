//! Read and subscribe access to the chain that hosts the income programs.
//!
//! [`RpcLedger`] speaks plain Ethereum JSON-RPC (`eth_call`, `eth_getLogs`)
//! through any [`LedgerTransport`], normally a [`FallbackTransport`] wrapping
//! one [`HttpTransport`] per configured endpoint.

pub mod abi;
pub mod fallback;
pub mod stub;
pub mod transport;
pub mod watch;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::amount::TokenAmount;

pub use abi::{AbiError, Address, Word};
pub use fallback::{FallbackTransport, RetryPolicy, DEFAULT_RETRY_COUNT, DEFAULT_RETRY_DELAY};
pub use stub::StubLedger;
pub use transport::{HttpTransport, LedgerTransport, TransportError};
pub use watch::Subscription;

pub const GET_STAKE_INFO: &str = "getStakeInfo(address)";
pub const BALANCE_OF: &str = "balanceOf(address)";
pub const CAN_REWARD: &str = "canReward(address)";
pub const GET_REWARD_COUNT: &str = "getRewardCount(address)";
pub const STAKE: &str = "stake()";
pub const CLAIM_REWARDS: &str = "claimRewards()";

pub const DEFAULT_LOG_POLL_INTERVAL: Duration = Duration::from_secs(4);

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("contract data error: {0}")]
    Abi(#[from] AbiError),
    #[error("unexpected RPC result for {method}: {detail}")]
    UnexpectedResult { method: &'static str, detail: String },
}

impl GatewayError {
    fn unexpected(method: &'static str, detail: impl Into<String>) -> Self {
        GatewayError::UnexpectedResult {
            method,
            detail: detail.into(),
        }
    }
}

/// `getStakeInfo` result for one account.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StakeInfo {
    pub stake: TokenAmount,
    pub claimable: TokenAmount,
}

impl StakeInfo {
    pub fn new(stake: TokenAmount, claimable: TokenAmount) -> Self {
        Self { stake, claimable }
    }

    /// Accrual only runs once something is staked.
    pub fn activated(&self) -> bool {
        !self.stake.is_zero()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    RewardsClaimed,
    Transfer,
    RewardSent,
}

impl EventKind {
    pub fn signature(self) -> &'static str {
        match self {
            EventKind::RewardsClaimed => "RewardsClaimed(address,uint256)",
            EventKind::Transfer => "Transfer(address,address,uint256)",
            EventKind::RewardSent => "RewardSent(address,address,uint256)",
        }
    }

    pub fn topic(self) -> Word {
        abi::event_topic(self.signature())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::RewardsClaimed => "rewards_claimed",
            EventKind::Transfer => "transfer",
            EventKind::RewardSent => "reward_sent",
        }
    }
}

/// Contract, event and indexed-argument constraints for one watcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventFilter {
    pub kind: EventKind,
    pub contract: Address,
    /// Constraints on the first and second indexed arguments.
    pub indexed: [Option<Address>; 2],
}

impl EventFilter {
    pub fn rewards_claimed(contract: Address, user: Address) -> Self {
        Self {
            kind: EventKind::RewardsClaimed,
            contract,
            indexed: [Some(user), None],
        }
    }

    pub fn transfer_from(token: Address, from: Address) -> Self {
        Self {
            kind: EventKind::Transfer,
            contract: token,
            indexed: [Some(from), None],
        }
    }

    pub fn transfer_to(token: Address, to: Address) -> Self {
        Self {
            kind: EventKind::Transfer,
            contract: token,
            indexed: [None, Some(to)],
        }
    }

    pub fn reward_sent_to(referral: Address, recipient: Address) -> Self {
        Self {
            kind: EventKind::RewardSent,
            contract: referral,
            indexed: [None, Some(recipient)],
        }
    }

    /// `topics` array for `eth_getLogs`, trailing wildcards trimmed.
    pub fn topics_param(&self) -> Value {
        let mut topics = vec![Value::String(abi::to_hex(&self.kind.topic()))];
        for constraint in self.indexed {
            topics.push(match constraint {
                Some(address) => Value::String(abi::to_hex(&address.to_word())),
                None => Value::Null,
            });
        }
        while topics.last() == Some(&Value::Null) {
            topics.pop();
        }
        Value::Array(topics)
    }

    pub fn matches(&self, event: &LedgerEvent) -> bool {
        if event.kind != self.kind || event.contract != self.contract {
            return false;
        }
        self.indexed
            .iter()
            .enumerate()
            .all(|(position, constraint)| match constraint {
                None => true,
                Some(address) => event.topics.get(position + 1) == Some(&address.to_word()),
            })
    }
}

/// A decoded log delivered to a watcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerEvent {
    pub kind: EventKind,
    pub contract: Address,
    pub topics: Vec<Word>,
    pub block_number: Option<u64>,
}

impl LedgerEvent {
    /// Builds an event with the indexed arguments laid out as on chain.
    pub fn new(kind: EventKind, contract: Address, indexed: &[Address]) -> Self {
        let mut topics = vec![kind.topic()];
        topics.extend(indexed.iter().map(Address::to_word));
        Self {
            kind,
            contract,
            topics,
            block_number: None,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(LedgerEvent) + Send + Sync>;

/// Logical view of the remote ledger used by the income session.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn read_stake_info(
        &self,
        program: Address,
        account: Address,
    ) -> Result<StakeInfo, GatewayError>;

    async fn read_balance(
        &self,
        token: Address,
        account: Address,
    ) -> Result<TokenAmount, GatewayError>;

    async fn read_can_reward(
        &self,
        referral: Address,
        account: Address,
    ) -> Result<bool, GatewayError>;

    async fn read_reward_count(
        &self,
        referral: Address,
        account: Address,
    ) -> Result<u64, GatewayError>;

    /// Starts delivering matching events to `handler` until the returned
    /// subscription is dropped or unsubscribed.
    async fn watch_event(
        &self,
        filter: EventFilter,
        handler: EventHandler,
    ) -> Result<Subscription, GatewayError>;
}

/// [`Ledger`] backed by Ethereum JSON-RPC.
#[derive(Clone)]
pub struct RpcLedger {
    transport: Arc<dyn LedgerTransport>,
    log_poll_interval: Duration,
}

impl RpcLedger {
    pub fn new(transport: Arc<dyn LedgerTransport>) -> Self {
        Self {
            transport,
            log_poll_interval: DEFAULT_LOG_POLL_INTERVAL,
        }
    }

    pub fn with_log_poll_interval(mut self, interval: Duration) -> Self {
        self.log_poll_interval = interval;
        self
    }

    async fn call(
        &self,
        contract: Address,
        signature: &'static str,
        account: Address,
        words: usize,
    ) -> Result<Vec<Word>, GatewayError> {
        let data = abi::encode_call(signature, &[account]);
        let params = json!([
            { "to": contract.to_string(), "data": abi::to_hex(&data) },
            "latest"
        ]);
        let result = self.transport.request("eth_call", params).await?;
        let encoded = result
            .as_str()
            .ok_or_else(|| GatewayError::unexpected("eth_call", result.to_string()))?;
        Ok(abi::expect_words(&abi::from_hex(encoded)?, words)?)
    }
}

#[async_trait]
impl Ledger for RpcLedger {
    async fn read_stake_info(
        &self,
        program: Address,
        account: Address,
    ) -> Result<StakeInfo, GatewayError> {
        let words = self.call(program, GET_STAKE_INFO, account, 2).await?;
        Ok(StakeInfo {
            stake: TokenAmount::from_wei(abi::word_to_u128(&words[0])?),
            claimable: TokenAmount::from_wei(abi::word_to_u128(&words[1])?),
        })
    }

    async fn read_balance(
        &self,
        token: Address,
        account: Address,
    ) -> Result<TokenAmount, GatewayError> {
        let words = self.call(token, BALANCE_OF, account, 1).await?;
        Ok(TokenAmount::from_wei(abi::word_to_u128(&words[0])?))
    }

    async fn read_can_reward(
        &self,
        referral: Address,
        account: Address,
    ) -> Result<bool, GatewayError> {
        let words = self.call(referral, CAN_REWARD, account, 1).await?;
        Ok(abi::word_to_bool(&words[0])?)
    }

    async fn read_reward_count(
        &self,
        referral: Address,
        account: Address,
    ) -> Result<u64, GatewayError> {
        let words = self.call(referral, GET_REWARD_COUNT, account, 1).await?;
        let count = abi::word_to_u128(&words[0])?;
        u64::try_from(count).map_err(|_| GatewayError::Abi(AbiError::Overflow))
    }

    async fn watch_event(
        &self,
        filter: EventFilter,
        handler: EventHandler,
    ) -> Result<Subscription, GatewayError> {
        watch::spawn_log_poller(
            self.transport.clone(),
            filter,
            handler,
            self.log_poll_interval,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(last: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[19] = last;
        Address::new(bytes)
    }

    #[test]
    fn transfer_to_filter_leaves_sender_wildcard() {
        let filter = EventFilter::transfer_to(address(1), address(2));
        let topics = filter.topics_param();
        let topics = topics.as_array().expect("array");
        assert_eq!(topics.len(), 3);
        assert_eq!(topics[1], Value::Null);
        assert_eq!(
            topics[2],
            Value::String(abi::to_hex(&address(2).to_word()))
        );

        let rewards = EventFilter::rewards_claimed(address(1), address(2)).topics_param();
        assert_eq!(rewards.as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn filters_match_on_indexed_arguments() {
        let token = address(9);
        let me = address(2);
        let incoming = LedgerEvent::new(EventKind::Transfer, token, &[address(3), me]);
        assert!(EventFilter::transfer_to(token, me).matches(&incoming));
        assert!(!EventFilter::transfer_from(token, me).matches(&incoming));
        assert!(!EventFilter::transfer_to(address(8), me).matches(&incoming));
        assert!(!EventFilter::rewards_claimed(token, me).matches(&incoming));
    }

    #[test]
    fn stake_marks_activation() {
        assert!(!StakeInfo::default().activated());
        assert!(StakeInfo::new(TokenAmount::from_wei(1), TokenAmount::ZERO).activated());
    }
}
