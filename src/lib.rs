//! Client-side reconciliation engine for the basic income programs.
//!
//! A wallet shows the claimable income ticking upwards every second even
//! though the chain only reports it when asked. The crate keeps that local
//! projection honest: [`accrual`] extrapolates from the last authoritative
//! read and adopts every fresh read, [`gateway`] fetches those reads through
//! redundant RPC endpoints, [`storage`] mirrors the baseline so a restart
//! resumes where it stopped, and [`actions`] submits claims and activations
//! through the host wallet. [`sync::IncomeSession`] ties them together in one
//! event loop.
//!
//! Applications typically load a [`config::WalletConfig`], build the
//! [`sync::SessionDeps`] from real or stub capabilities, and hold an
//! [`sync::IncomeSession`] for as long as the wallet is open.

pub mod accrual;
pub mod actions;
pub mod amount;
pub mod clock;
pub mod config;
pub mod gateway;
pub mod host;
pub mod storage;
pub mod sync;
pub mod telemetry;

pub use accrual::{IncomeProgram, Phase};
pub use amount::TokenAmount;
pub use config::WalletConfig;
pub use sync::{IncomeSession, SessionDeps, SessionSettings, SessionSnapshot};
