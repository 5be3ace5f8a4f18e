use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use super::abi::{self, Address};
use super::transport::LedgerTransport;
use super::{EventFilter, EventHandler, GatewayError, LedgerEvent};

/// Handle to a live event watcher.
///
/// Dropping the handle tears the watcher down; `unsubscribe` may be called
/// any number of times.
pub struct Subscription {
    filter: EventFilter,
    closed: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(filter: EventFilter, closed: Arc<AtomicBool>, task: Option<JoinHandle<()>>) -> Self {
        Self {
            filter,
            closed,
            task,
        }
    }

    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }

    pub fn is_active(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    pub fn unsubscribe(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        debug!(
            event = self.filter.kind.as_str(),
            contract = %self.filter.contract,
            "event watcher torn down"
        );
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("filter", &self.filter)
            .field("active", &self.is_active())
            .finish()
    }
}

async fn block_number(transport: &dyn LedgerTransport) -> Result<u64, GatewayError> {
    let value = transport
        .request("eth_blockNumber", Value::Array(Vec::new()))
        .await?;
    let encoded = value.as_str().ok_or_else(|| GatewayError::UnexpectedResult {
        method: "eth_blockNumber",
        detail: value.to_string(),
    })?;
    Ok(abi::parse_quantity(encoded)?)
}

fn decode_log(filter: &EventFilter, log: &Value) -> Result<LedgerEvent, GatewayError> {
    let malformed = || GatewayError::UnexpectedResult {
        method: "eth_getLogs",
        detail: log.to_string(),
    };
    let contract = log
        .get("address")
        .and_then(Value::as_str)
        .ok_or_else(malformed)?
        .parse::<Address>()?;
    let topics = log
        .get("topics")
        .and_then(Value::as_array)
        .ok_or_else(malformed)?
        .iter()
        .map(|topic| {
            topic
                .as_str()
                .ok_or_else(malformed)
                .and_then(|topic| abi::parse_word(topic).map_err(GatewayError::from))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let block_number = match log.get("blockNumber").and_then(Value::as_str) {
        Some(encoded) => Some(abi::parse_quantity(encoded)?),
        None => None,
    };
    Ok(LedgerEvent {
        kind: filter.kind,
        contract,
        topics,
        block_number,
    })
}

async fn poll_once(
    transport: &dyn LedgerTransport,
    filter: &EventFilter,
    from_block: u64,
    to_block: u64,
) -> Result<Vec<LedgerEvent>, GatewayError> {
    let params = json!([{
        "address": filter.contract.to_string(),
        "fromBlock": abi::quantity(from_block),
        "toBlock": abi::quantity(to_block),
        "topics": filter.topics_param(),
    }]);
    let logs = transport.request("eth_getLogs", params).await?;
    let logs = logs.as_array().ok_or_else(|| GatewayError::UnexpectedResult {
        method: "eth_getLogs",
        detail: logs.to_string(),
    })?;
    let mut events = Vec::with_capacity(logs.len());
    for log in logs {
        let event = match decode_log(filter, log) {
            Ok(event) => event,
            Err(err) => {
                warn!(event = filter.kind.as_str(), error = %err, "skipping undecodable log");
                continue;
            }
        };
        if filter.matches(&event) {
            events.push(event);
        }
    }
    Ok(events)
}

/// Emulates a push subscription by polling `eth_getLogs` for new blocks.
///
/// The initial block-number read doubles as the setup check: if it fails the
/// watcher is never started and the caller is told so.
pub(crate) async fn spawn_log_poller(
    transport: Arc<dyn LedgerTransport>,
    filter: EventFilter,
    handler: EventHandler,
    poll_interval: Duration,
) -> Result<Subscription, GatewayError> {
    let mut last_seen = block_number(transport.as_ref()).await?;
    let closed = Arc::new(AtomicBool::new(false));
    let task_closed = closed.clone();

    let task = tokio::spawn(async move {
        let mut ticker = interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if task_closed.load(Ordering::SeqCst) {
                break;
            }
            let head = match block_number(transport.as_ref()).await {
                Ok(head) => head,
                Err(err) => {
                    warn!(event = filter.kind.as_str(), error = %err, "failed to poll chain head");
                    continue;
                }
            };
            if head <= last_seen {
                continue;
            }
            match poll_once(transport.as_ref(), &filter, last_seen + 1, head).await {
                Ok(events) => {
                    last_seen = head;
                    for event in events {
                        if task_closed.load(Ordering::SeqCst) {
                            return;
                        }
                        handler(event);
                    }
                }
                Err(err) => {
                    warn!(event = filter.kind.as_str(), error = %err, "failed to poll event logs");
                }
            }
        }
    });

    Ok(Subscription::new(filter, closed, Some(task)))
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::gateway::transport::TransportError;
    use crate::gateway::EventKind;

    struct CannedLogs(Value);

    #[async_trait]
    impl LedgerTransport for CannedLogs {
        fn label(&self) -> &str {
            "canned"
        }

        async fn request(&self, _method: &str, _params: Value) -> Result<Value, TransportError> {
            Ok(self.0.clone())
        }
    }

    fn address(last: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[19] = last;
        Address::new(bytes)
    }

    #[tokio::test]
    async fn malformed_log_does_not_hide_the_rest_of_the_batch() {
        let contract = address(7);
        let user = address(2);
        let topics = json!([
            abi::to_hex(&EventKind::RewardsClaimed.topic()),
            abi::to_hex(&user.to_word()),
        ]);
        let transport = CannedLogs(json!([
            { "address": "0xnot-an-address", "topics": topics.clone() },
            { "address": contract.to_string(), "topics": topics, "blockNumber": "0x5" },
        ]));
        let filter = EventFilter::rewards_claimed(contract, user);

        let events = poll_once(&transport, &filter, 1, 5)
            .await
            .expect("batch with one bad log");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].contract, contract);
        assert_eq!(events[0].block_number, Some(5));
    }

    #[tokio::test]
    async fn non_array_result_still_fails_the_poll() {
        let transport = CannedLogs(json!({ "unexpected": true }));
        let filter = EventFilter::rewards_claimed(address(7), address(2));
        let result = poll_once(&transport, &filter, 1, 5).await;
        assert!(matches!(
            result,
            Err(GatewayError::UnexpectedResult { method: "eth_getLogs", .. })
        ));
    }
}
