//! The income session: one event loop per application that keeps the
//! projected claimable amounts in step with the chain.
//!
//! Everything that can change the accrual state arrives as a command on a
//! single channel: bind/unbind requests, refresh triggers from the periodic
//! timer and from chain events, the results of ledger reads and the watchers
//! installed by background tasks. The loop itself never waits on the
//! network. Actions run on the caller's task but mutate the same state under
//! the same lock.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::accrual::{AccrualRate, Baseline, IncomeProgram, IncomeTracker, Phase, ReconcileOutcome};
use crate::actions::{ActionError, ActionSubmitter, IncomeAction};
use crate::amount::TokenAmount;
use crate::clock::Clock;
use crate::config::{ContractsConfig, WalletConfig};
use crate::gateway::{
    Address, EventFilter, EventHandler, GatewayError, Ledger, LedgerEvent, StakeInfo,
    Subscription,
};
use crate::host::{ActionHandle, HostSigner, ReceiptSource};
use crate::storage::{AccrualMirror, KeyValueStore};
use crate::telemetry;

const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);

#[derive(Clone, Debug, thiserror::Error)]
pub enum SessionError {
    #[error("income session stopped")]
    Stopped,
}

/// Timing and addressing knobs for a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSettings {
    pub contracts: ContractsConfig,
    pub rate: AccrualRate,
    pub tolerance: TokenAmount,
    pub tick_interval: Duration,
    pub reconcile_interval: Duration,
    pub read_retry_delay: Duration,
    pub namespace_by_address: bool,
    pub confirmation_poll_interval: Duration,
    pub confirmation_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        WalletConfig::default().session_settings()
    }
}

/// Capabilities the session is built from.
#[derive(Clone)]
pub struct SessionDeps {
    pub ledger: Arc<dyn Ledger>,
    pub signer: Arc<dyn HostSigner>,
    pub receipts: Arc<dyn ReceiptSource>,
    pub store: Arc<dyn KeyValueStore>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshTarget {
    Income(IncomeProgram),
    Balance,
    Referral,
}

impl RefreshTarget {
    pub const ALL: [RefreshTarget; 4] = [
        RefreshTarget::Income(IncomeProgram::Basic),
        RefreshTarget::Income(IncomeProgram::Plus),
        RefreshTarget::Balance,
        RefreshTarget::Referral,
    ];

    fn as_str(self) -> &'static str {
        match self {
            RefreshTarget::Income(_) => "stake_info",
            RefreshTarget::Balance => "balance",
            RefreshTarget::Referral => "referral",
        }
    }
}

enum SessionCommand {
    Bind(Address),
    Unbind,
    /// `generation: None` targets whatever is currently bound.
    Refresh {
        generation: Option<u64>,
        targets: Vec<RefreshTarget>,
    },
    StakeInfoRead {
        generation: u64,
        program: IncomeProgram,
        epoch: u64,
        info: StakeInfo,
    },
    BalanceRead {
        generation: u64,
        balance: TokenAmount,
    },
    ReferralRead {
        generation: u64,
        can_reward: bool,
        reward_count: u64,
    },
    Subscribed {
        generation: u64,
        subscriptions: Vec<Subscription>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProgramSnapshot {
    pub program: IncomeProgram,
    pub phase: Phase,
    pub displayed: Option<TokenAmount>,
    pub baseline: Option<Baseline>,
    pub activated: bool,
}

/// Point-in-time view handed to renderers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub address: Option<Address>,
    pub basic: ProgramSnapshot,
    pub plus: ProgramSnapshot,
    pub token_balance: Option<TokenAmount>,
    pub can_reward: Option<bool>,
    pub reward_count: Option<u64>,
    pub action_in_flight: bool,
    pub host_available: bool,
    pub taken_at_ms: u64,
}

impl SessionSnapshot {
    pub fn program(&self, program: IncomeProgram) -> &ProgramSnapshot {
        match program {
            IncomeProgram::Basic => &self.basic,
            IncomeProgram::Plus => &self.plus,
        }
    }
}

#[derive(Default)]
struct ReadSlot {
    task: Option<JoinHandle<()>>,
    requeue: bool,
}

impl ReadSlot {
    fn in_flight(&self) -> bool {
        self.task.is_some()
    }

    fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.requeue = false;
    }
}

struct ProgramSlot {
    tracker: IncomeTracker,
    /// Bumped whenever a local claim invalidates reads already in flight.
    epoch: u64,
    read: ReadSlot,
    /// Epoch the tracked read was issued in.
    read_epoch: u64,
}

struct SessionState {
    generation: u64,
    address: Option<Address>,
    mirror: Option<AccrualMirror>,
    programs: [ProgramSlot; 2],
    token_balance: Option<TokenAmount>,
    can_reward: Option<bool>,
    reward_count: Option<u64>,
    balance_read: ReadSlot,
    referral_read: ReadSlot,
    subscriptions: Vec<Subscription>,
    subscription_setup: Option<JoinHandle<()>>,
    confirmations: Vec<JoinHandle<()>>,
    action_in_flight: bool,
}

impl SessionState {
    fn new(settings: &SessionSettings) -> Self {
        let slot = || ProgramSlot {
            tracker: IncomeTracker::new(settings.rate, settings.tolerance),
            epoch: 0,
            read: ReadSlot::default(),
            read_epoch: 0,
        };
        Self {
            generation: 0,
            address: None,
            mirror: None,
            programs: [slot(), slot()],
            token_balance: None,
            can_reward: None,
            reward_count: None,
            balance_read: ReadSlot::default(),
            referral_read: ReadSlot::default(),
            subscriptions: Vec::new(),
            subscription_setup: None,
            confirmations: Vec::new(),
            action_in_flight: false,
        }
    }

    fn program(&mut self, program: IncomeProgram) -> &mut ProgramSlot {
        &mut self.programs[program.index()]
    }

    /// Stops everything tied to the current binding.
    fn release_binding(&mut self) {
        for slot in &mut self.programs {
            slot.read.cancel();
            slot.tracker.unbind();
        }
        self.balance_read.cancel();
        self.referral_read.cancel();
        if let Some(setup) = self.subscription_setup.take() {
            setup.abort();
        }
        for mut subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        for task in self.confirmations.drain(..) {
            task.abort();
        }
        self.address = None;
        self.mirror = None;
        self.token_balance = None;
        self.can_reward = None;
        self.reward_count = None;
        self.generation += 1;
    }
}

struct SessionCore {
    settings: SessionSettings,
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    submitter: ActionSubmitter,
    state: Mutex<SessionState>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    updates: watch::Sender<SessionSnapshot>,
}

fn lock_state(state: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    state
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Dependency-injected reconciliation engine for one application instance.
pub struct IncomeSession {
    core: Arc<SessionCore>,
    shutdown_tx: watch::Sender<bool>,
    task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl IncomeSession {
    /// Spawns the session loop. Must be called from within a tokio runtime.
    pub fn start(settings: SessionSettings, deps: SessionDeps) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let submitter = ActionSubmitter::new(deps.signer, deps.receipts).with_confirmation_polling(
            settings.confirmation_poll_interval,
            settings.confirmation_timeout,
        );
        let state = SessionState::new(&settings);
        let initial = build_snapshot(&state, &submitter, deps.clock.now_ms());
        let (updates, _) = watch::channel(initial);

        let core = Arc::new(SessionCore {
            settings,
            ledger: deps.ledger,
            store: deps.store,
            clock: deps.clock,
            submitter,
            state: Mutex::new(state),
            commands: command_tx,
            updates,
        });
        let task_core = Arc::clone(&core);
        let mut task_shutdown_rx = shutdown_rx;
        let task = tokio::spawn(async move {
            run_loop(task_core, command_rx, &mut task_shutdown_rx).await;
        });

        Self {
            core,
            shutdown_tx,
            task: AsyncMutex::new(Some(task)),
        }
    }

    /// Binds `address`, replacing any previous binding. Persisted baselines
    /// are restored and fresh reads are started.
    pub fn bind_address(&self, address: Address) -> Result<(), SessionError> {
        self.send(SessionCommand::Bind(address))
    }

    pub fn unbind(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Unbind)
    }

    /// Asks for fresh authoritative reads of everything tracked.
    pub fn request_refresh(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Refresh {
            generation: None,
            targets: RefreshTarget::ALL.to_vec(),
        })
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = lock_state(&self.core.state);
        build_snapshot(&state, &self.core.submitter, self.core.clock.now_ms())
    }

    /// Receives a new snapshot on every tick and after every state change.
    pub fn updates(&self) -> watch::Receiver<SessionSnapshot> {
        self.core.updates.subscribe()
    }

    pub fn displayed(&self, program: IncomeProgram) -> Option<TokenAmount> {
        let mut state = lock_state(&self.core.state);
        let now = self.core.clock.now_ms();
        state.program(program).tracker.displayed(now)
    }

    /// Claims everything accrued in `program`. On success the displayed
    /// amount restarts from zero right away; the chain is re-read afterwards.
    pub async fn submit_claim(&self, program: IncomeProgram) -> Result<ActionHandle, ActionError> {
        self.run_action(program, IncomeAction::Claim).await
    }

    /// Stakes into `program` so accrual starts.
    pub async fn submit_activation(
        &self,
        program: IncomeProgram,
    ) -> Result<ActionHandle, ActionError> {
        self.run_action(program, IncomeAction::Activate).await
    }

    pub async fn shutdown(&self) -> Result<(), SessionError> {
        let _ = self.shutdown_tx.send(true);
        let mut task = self.task.lock().await;
        if let Some(handle) = task.take() {
            handle.await.map_err(|_| SessionError::Stopped)?;
        }
        Ok(())
    }

    fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        if *self.shutdown_tx.borrow() {
            return Err(SessionError::Stopped);
        }
        self.core
            .commands
            .send(command)
            .map_err(|_| SessionError::Stopped)
    }

    async fn run_action(
        &self,
        program: IncomeProgram,
        action: IncomeAction,
    ) -> Result<ActionHandle, ActionError> {
        if *self.shutdown_tx.borrow() || self.core.commands.is_closed() {
            return Err(ActionError::SessionStopped);
        }
        let core = &self.core;
        let permit = core.submitter.try_acquire()?;
        let (generation, target) = {
            let mut state = lock_state(&core.state);
            if state.address.is_none() {
                return Err(ActionError::NotBound);
            }
            let now = core.clock.now_ms();
            state.program(program).tracker.begin_action(now)?;
            state.action_in_flight = true;
            (
                state.generation,
                core.settings.contracts.income_program(program),
            )
        };
        core.publish();

        let result = core.submitter.submit(&permit, action, target).await;

        {
            let mut state = lock_state(&core.state);
            state.action_in_flight = false;
            if state.generation == generation {
                match &result {
                    Ok(_) => core.complete_action(&mut state, program, action),
                    Err(_) => state.program(program).tracker.abort_action(),
                }
            }
        }

        if let Ok(handle) = &result {
            // An activation is re-read once, after the stake is mined.
            if action == IncomeAction::Claim {
                core.refresh(
                    Some(generation),
                    &[RefreshTarget::Income(program), RefreshTarget::Balance],
                );
            }
            core.spawn_confirmation(generation, program, handle.clone());
        }
        core.publish();
        drop(permit);
        result
    }
}

impl Drop for IncomeSession {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl SessionCore {
    fn publish(&self) {
        let snapshot = {
            let state = lock_state(&self.state);
            build_snapshot(&state, &self.submitter, self.clock.now_ms())
        };
        self.updates.send_replace(snapshot);
    }

    fn complete_action(&self, state: &mut SessionState, program: IncomeProgram, action: IncomeAction) {
        let now = self.clock.now_ms();
        let mirror = state.mirror.clone();
        let slot = state.program(program);
        match action {
            IncomeAction::Claim => {
                // Reads issued before the claim would resurrect the old amount.
                slot.epoch += 1;
                if let Some(baseline) = slot.tracker.complete_claim(now) {
                    if let Some(mirror) = &mirror {
                        if let Err(err) = mirror.store_baseline(program, &baseline) {
                            warn!(program = program.label(), error = %err, "failed to persist baseline");
                        }
                    }
                }
                info!(program = program.label(), "claim completed, projection restarted from zero");
            }
            IncomeAction::Activate => {
                slot.tracker.complete_activation();
                if let Some(mirror) = &mirror {
                    if let Err(err) = mirror.store_activated(program, true) {
                        warn!(program = program.label(), error = %err, "failed to persist activation");
                    }
                }
                info!(program = program.label(), "activation completed");
            }
        }
    }

    fn refresh(&self, generation: Option<u64>, targets: &[RefreshTarget]) {
        let mut state = lock_state(&self.state);
        if generation.is_some_and(|generation| generation != state.generation) {
            return;
        }
        let Some(address) = state.address else {
            return;
        };
        let generation = state.generation;
        for target in targets {
            match *target {
                RefreshTarget::Income(program) => {
                    let slot = state.program(program);
                    if slot.read.in_flight() {
                        slot.read.requeue = true;
                        continue;
                    }
                    slot.read_epoch = slot.epoch;
                    slot.read.task =
                        Some(self.spawn_stake_read(generation, program, slot.epoch, address));
                }
                RefreshTarget::Balance => {
                    if state.balance_read.in_flight() {
                        state.balance_read.requeue = true;
                        continue;
                    }
                    state.balance_read.task = Some(self.spawn_balance_read(generation, address));
                }
                RefreshTarget::Referral => {
                    if state.referral_read.in_flight() {
                        state.referral_read.requeue = true;
                        continue;
                    }
                    state.referral_read.task = Some(self.spawn_referral_read(generation, address));
                }
            }
        }
    }

    fn spawn_stake_read(
        &self,
        generation: u64,
        program: IncomeProgram,
        epoch: u64,
        account: Address,
    ) -> JoinHandle<()> {
        let ledger = Arc::clone(&self.ledger);
        let commands = self.commands.clone();
        let contract = self.settings.contracts.income_program(program);
        let delay = self.settings.read_retry_delay;
        tokio::spawn(async move {
            let info = read_until_ok(RefreshTarget::Income(program), delay, || {
                ledger.read_stake_info(contract, account)
            })
            .await;
            let _ = commands.send(SessionCommand::StakeInfoRead {
                generation,
                program,
                epoch,
                info,
            });
        })
    }

    fn spawn_balance_read(&self, generation: u64, account: Address) -> JoinHandle<()> {
        let ledger = Arc::clone(&self.ledger);
        let commands = self.commands.clone();
        let token = self.settings.contracts.token;
        let delay = self.settings.read_retry_delay;
        tokio::spawn(async move {
            let balance =
                read_until_ok(RefreshTarget::Balance, delay, || ledger.read_balance(token, account))
                    .await;
            let _ = commands.send(SessionCommand::BalanceRead {
                generation,
                balance,
            });
        })
    }

    fn spawn_referral_read(&self, generation: u64, account: Address) -> JoinHandle<()> {
        let ledger = Arc::clone(&self.ledger);
        let commands = self.commands.clone();
        let referral = self.settings.contracts.referral;
        let delay = self.settings.read_retry_delay;
        tokio::spawn(async move {
            let can_reward = read_until_ok(RefreshTarget::Referral, delay, || {
                ledger.read_can_reward(referral, account)
            })
            .await;
            let reward_count = read_until_ok(RefreshTarget::Referral, delay, || {
                ledger.read_reward_count(referral, account)
            })
            .await;
            let _ = commands.send(SessionCommand::ReferralRead {
                generation,
                can_reward,
                reward_count,
            });
        })
    }

    /// Waits for the host to confirm an action, then re-reads the program
    /// and the token balance it moved. Without a confirmation the program is
    /// still re-read so the chain gets the last word.
    fn spawn_confirmation(&self, generation: u64, program: IncomeProgram, handle: ActionHandle) {
        let submitter = self.submitter.clone();
        let commands = self.commands.clone();
        let task = tokio::spawn(async move {
            let targets = match submitter.track_confirmation(&handle).await {
                Ok(true) => vec![RefreshTarget::Income(program), RefreshTarget::Balance],
                Ok(false) => vec![RefreshTarget::Income(program)],
                Err(err) => {
                    warn!(%handle, error = %err, "confirmation tracking failed");
                    vec![RefreshTarget::Income(program)]
                }
            };
            let _ = commands.send(SessionCommand::Refresh {
                generation: Some(generation),
                targets,
            });
        });
        let mut state = lock_state(&self.state);
        state.confirmations.retain(|task| !task.is_finished());
        if state.generation == generation {
            state.confirmations.push(task);
        }
    }

    fn bind(&self, address: Address) {
        let generation = {
            let mut state = lock_state(&self.state);
            state.release_binding();
            let mirror = if self.settings.namespace_by_address {
                AccrualMirror::scoped(Arc::clone(&self.store), &address)
            } else {
                AccrualMirror::new(Arc::clone(&self.store))
            };
            let now = self.clock.now_ms();
            for program in IncomeProgram::ALL {
                let persisted = mirror.load_baseline(program).unwrap_or_else(|err| {
                    warn!(program = program.label(), error = %err, "failed to read persisted baseline");
                    None
                });
                let activated = mirror
                    .load_activated(program)
                    .unwrap_or_else(|err| {
                        warn!(program = program.label(), error = %err, "failed to read activation flag");
                        None
                    })
                    .unwrap_or(false);
                state
                    .program(program)
                    .tracker
                    .bind(now, persisted, activated);
            }
            state.token_balance = mirror.load_token_balance().unwrap_or_else(|err| {
                warn!(error = %err, "failed to read persisted token balance");
                None
            });
            state.address = Some(address);
            state.mirror = Some(mirror);
            state.subscription_setup = Some(self.spawn_subscriptions(state.generation, address));
            state.generation
        };
        info!(%address, generation, "address bound");

        self.refresh(Some(generation), &RefreshTarget::ALL);
        self.publish();
    }

    /// Installs the chain watchers for a binding concurrently, off the loop,
    /// and hands the live ones back as a command.
    fn spawn_subscriptions(&self, generation: u64, address: Address) -> JoinHandle<()> {
        let contracts = self.settings.contracts;
        let watches = [
            (
                EventFilter::rewards_claimed(contracts.basic_income, address),
                vec![RefreshTarget::Income(IncomeProgram::Basic)],
            ),
            (
                EventFilter::rewards_claimed(contracts.basic_income_plus, address),
                vec![RefreshTarget::Income(IncomeProgram::Plus)],
            ),
            (
                EventFilter::transfer_from(contracts.token, address),
                vec![RefreshTarget::Balance],
            ),
            (
                EventFilter::transfer_to(contracts.token, address),
                vec![RefreshTarget::Balance],
            ),
            (
                EventFilter::reward_sent_to(contracts.referral, address),
                vec![RefreshTarget::Referral, RefreshTarget::Balance],
            ),
        ];
        let ledger = Arc::clone(&self.ledger);
        let commands = self.commands.clone();

        tokio::spawn(async move {
            let mut pending = JoinSet::new();
            for (filter, targets) in watches {
                let ledger = Arc::clone(&ledger);
                let events = commands.clone();
                let handler: EventHandler = Arc::new(move |event: LedgerEvent| {
                    debug!(event = event.kind.as_str(), block = ?event.block_number, "chain event received");
                    let _ = events.send(SessionCommand::Refresh {
                        generation: Some(generation),
                        targets: targets.clone(),
                    });
                });
                pending.spawn(async move { (filter, ledger.watch_event(filter, handler).await) });
            }

            let mut subscriptions = Vec::with_capacity(pending.len());
            while let Some(joined) = pending.join_next().await {
                match joined {
                    Ok((_, Ok(subscription))) => subscriptions.push(subscription),
                    Ok((filter, Err(err))) => warn!(
                        event = filter.kind.as_str(),
                        contract = %filter.contract,
                        error = %err,
                        "event subscription failed, relying on periodic reconciliation"
                    ),
                    Err(err) => warn!(error = %err, "event subscription task failed"),
                }
            }
            let _ = commands.send(SessionCommand::Subscribed {
                generation,
                subscriptions,
            });
        })
    }

    fn adopt_subscriptions(&self, generation: u64, subscriptions: Vec<Subscription>) {
        let stale = {
            let mut state = lock_state(&self.state);
            if state.generation == generation {
                state.subscription_setup = None;
                debug!(generation, watchers = subscriptions.len(), "event watchers installed");
                state.subscriptions.extend(subscriptions);
                Vec::new()
            } else {
                subscriptions
            }
        };
        for mut subscription in stale {
            subscription.unsubscribe();
        }
    }

    fn unbind(&self) {
        let was_bound = {
            let mut state = lock_state(&self.state);
            let was_bound = state.address.is_some();
            state.release_binding();
            was_bound
        };
        if was_bound {
            info!("address unbound");
        }
        self.publish();
    }

    fn apply_stake_info(
        &self,
        generation: u64,
        program: IncomeProgram,
        epoch: u64,
        info: StakeInfo,
    ) {
        let mut state = lock_state(&self.state);
        if state.generation != generation {
            return;
        }
        let mirror = state.mirror.clone();
        let slot = state.program(program);
        // Only the tracked read releases the slot; an older read's result
        // must not clear the marker of the one that replaced it.
        let requeue = if slot.read_epoch == epoch {
            slot.read.task = None;
            std::mem::take(&mut slot.read.requeue)
        } else {
            false
        };
        if slot.epoch != epoch {
            debug!(program = program.label(), "discarding read issued before a local claim");
        } else {
            let now = self.clock.now_ms();
            let activation_changed = slot.tracker.set_activated(info.activated());
            if let Some((outcome, first)) = slot.tracker.reconcile(info.claimable, now) {
                telemetry::record_reconcile(program, &outcome, info.claimable);
                match outcome {
                    ReconcileOutcome::Adopted { previous, direction } => info!(
                        program = program.label(),
                        authoritative = %info.claimable,
                        projected = %previous,
                        ?direction,
                        "adopted authoritative claimable amount"
                    ),
                    ReconcileOutcome::Unchanged { projection } => debug!(
                        program = program.label(),
                        %projection,
                        "projection agrees with chain"
                    ),
                }
                if let Some(mirror) = &mirror {
                    let persisted = if outcome.adopted() || first {
                        slot.tracker
                            .state()
                            .map(|accrual| mirror.store_baseline(program, &accrual.baseline()))
                            .transpose()
                            .map(|_| ())
                    } else {
                        Ok(())
                    };
                    let flagged = if activation_changed || first {
                        mirror.store_activated(program, info.activated())
                    } else {
                        Ok(())
                    };
                    if let Err(err) = persisted.and(flagged) {
                        warn!(program = program.label(), error = %err, "failed to persist accrual state");
                    }
                }
            }
        }
        drop(state);
        if requeue {
            self.refresh(Some(generation), &[RefreshTarget::Income(program)]);
        }
    }

    fn apply_balance(&self, generation: u64, balance: TokenAmount) {
        let requeue = {
            let mut state = lock_state(&self.state);
            if state.generation != generation {
                return;
            }
            state.balance_read.task = None;
            state.token_balance = Some(balance);
            if let Some(mirror) = &state.mirror {
                if let Err(err) = mirror.store_token_balance(balance) {
                    warn!(error = %err, "failed to persist token balance");
                }
            }
            std::mem::take(&mut state.balance_read.requeue)
        };
        debug!(%balance, "token balance refreshed");
        if requeue {
            self.refresh(Some(generation), &[RefreshTarget::Balance]);
        }
    }

    fn apply_referral(&self, generation: u64, can_reward: bool, reward_count: u64) {
        let requeue = {
            let mut state = lock_state(&self.state);
            if state.generation != generation {
                return;
            }
            state.referral_read.task = None;
            state.can_reward = Some(can_reward);
            state.reward_count = Some(reward_count);
            std::mem::take(&mut state.referral_read.requeue)
        };
        if requeue {
            self.refresh(Some(generation), &[RefreshTarget::Referral]);
        }
    }

    fn handle(&self, command: SessionCommand) {
        match command {
            SessionCommand::Bind(address) => self.bind(address),
            SessionCommand::Unbind => self.unbind(),
            SessionCommand::Refresh {
                generation,
                targets,
            } => self.refresh(generation, &targets),
            SessionCommand::StakeInfoRead {
                generation,
                program,
                epoch,
                info,
            } => self.apply_stake_info(generation, program, epoch, info),
            SessionCommand::BalanceRead {
                generation,
                balance,
            } => self.apply_balance(generation, balance),
            SessionCommand::ReferralRead {
                generation,
                can_reward,
                reward_count,
            } => self.apply_referral(generation, can_reward, reward_count),
            SessionCommand::Subscribed {
                generation,
                subscriptions,
            } => self.adopt_subscriptions(generation, subscriptions),
        }
        self.publish();
    }
}

/// Retries a ledger read on a fixed delay until it succeeds.
async fn read_until_ok<T, F, Fut>(target: RefreshTarget, delay: Duration, mut read: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut attempt: u64 = 0;
    loop {
        match read().await {
            Ok(value) => return value,
            Err(err) => {
                attempt += 1;
                telemetry::record_read_retry(target.as_str());
                warn!(
                    target = target.as_str(),
                    attempt,
                    error = %err,
                    "ledger read failed, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}

fn build_snapshot(state: &SessionState, submitter: &ActionSubmitter, now_ms: u64) -> SessionSnapshot {
    let program = |program: IncomeProgram| {
        let tracker = &state.programs[program.index()].tracker;
        ProgramSnapshot {
            program,
            phase: tracker.phase(),
            displayed: tracker.tick(now_ms),
            baseline: tracker.state().map(|state| state.baseline()),
            activated: tracker.activated(),
        }
    };
    SessionSnapshot {
        address: state.address,
        basic: program(IncomeProgram::Basic),
        plus: program(IncomeProgram::Plus),
        token_balance: state.token_balance,
        can_reward: state.can_reward,
        reward_count: state.reward_count,
        action_in_flight: state.action_in_flight,
        host_available: submitter.host_available(),
        taken_at_ms: now_ms,
    }
}

async fn run_loop(
    core: Arc<SessionCore>,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let start = Instant::now();
    let tick_every = core.settings.tick_interval.max(MIN_TIMER_PERIOD);
    let reconcile_every = core.settings.reconcile_interval.max(MIN_TIMER_PERIOD);
    let mut ticker = interval_at(start + tick_every, tick_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut reconciler = interval_at(start + reconcile_every, reconcile_every);
    reconciler.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            command = commands.recv() => match command {
                Some(command) => core.handle(command),
                None => break,
            },
            _ = reconciler.tick() => {
                core.refresh(
                    None,
                    &[
                        RefreshTarget::Income(IncomeProgram::Basic),
                        RefreshTarget::Income(IncomeProgram::Plus),
                    ],
                );
            }
            _ = ticker.tick() => core.publish(),
        }
    }

    {
        let mut state = lock_state(&core.state);
        state.release_binding();
    }
    core.publish();
    debug!("income session loop stopped");
}
