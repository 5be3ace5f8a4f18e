//! Persistent mirror of the accrual anchors.
//!
//! The host runtime only offers a flat string-keyed store, so every value is
//! written as a string: amounts as decimal strings, timestamps as epoch
//! milliseconds, flags as `true`/`false`.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::warn;

use crate::accrual::{Baseline, IncomeProgram};
use crate::amount::TokenAmount;
use crate::gateway::abi::Address;

const BASE_SUFFIX: &str = "Base";
const START_TIME_SUFFIX: &str = "StartTime";
const ACTIVATED_SUFFIX: &str = "Activated";
const TOKEN_BALANCE_KEY: &str = "tokenBalance";

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("mirror io error: {0}")]
    Io(#[from] io::Error),
    #[error("mirror encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Flat string key/value store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, MirrorError>;
    fn set(&self, key: &str, value: &str) -> Result<(), MirrorError>;

    /// Writes several entries as one unit where the backend allows it.
    fn set_many(&self, entries: &[(&str, String)]) -> Result<(), MirrorError> {
        for (key, value) in entries {
            self.set(key, value)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> BTreeMap<String, String> {
        self.entries.lock().clone()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, MirrorError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), MirrorError> {
        self.entries
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn set_many(&self, entries: &[(&str, String)]) -> Result<(), MirrorError> {
        let mut guard = self.entries.lock();
        for (key, value) in entries {
            guard.insert((*key).to_string(), value.clone());
        }
        Ok(())
    }
}

/// JSON file holding the whole map, rewritten through a temporary file on
/// every update.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    pub fn open(path: &Path) -> Result<Self, MirrorError> {
        let entries = match fs::read_to_string(path) {
            Ok(contents) if contents.trim().is_empty() => BTreeMap::new(),
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(error) if error.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(error) => return Err(error.into()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<(), MirrorError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let encoded = serde_json::to_string_pretty(entries)?;
        let staging = self.path.with_extension("tmp");
        fs::write(&staging, encoded)?;
        fs::rename(&staging, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, MirrorError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), MirrorError> {
        self.set_many(&[(key, value.to_string())])
    }

    fn set_many(&self, entries: &[(&str, String)]) -> Result<(), MirrorError> {
        let mut guard = self.entries.lock();
        let mut next = guard.clone();
        for (key, value) in entries {
            next.insert((*key).to_string(), value.clone());
        }
        self.flush(&next)?;
        *guard = next;
        Ok(())
    }
}

/// Typed view over a [`KeyValueStore`] holding the accrual mirror.
///
/// Keys are namespaced by feature only unless a scope is set, in which case
/// they are additionally prefixed with the bound address.
#[derive(Clone)]
pub struct AccrualMirror {
    store: Arc<dyn KeyValueStore>,
    scope: Option<String>,
}

impl AccrualMirror {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store, scope: None }
    }

    pub fn scoped(store: Arc<dyn KeyValueStore>, address: &Address) -> Self {
        Self {
            store,
            scope: Some(address.to_string()),
        }
    }

    fn key(&self, name: &str) -> String {
        match &self.scope {
            Some(scope) => format!("{scope}:{name}"),
            None => name.to_string(),
        }
    }

    fn program_key(&self, program: IncomeProgram, suffix: &str) -> String {
        self.key(&format!("{}{suffix}", program.storage_prefix()))
    }

    /// Loads the persisted baseline. Missing or unreadable halves yield
    /// `None` so accrual restarts from a fresh read.
    pub fn load_baseline(&self, program: IncomeProgram) -> Result<Option<Baseline>, MirrorError> {
        let amount = self.store.get(&self.program_key(program, BASE_SUFFIX))?;
        let started = self
            .store
            .get(&self.program_key(program, START_TIME_SUFFIX))?;
        let (Some(amount), Some(started)) = (amount, started) else {
            return Ok(None);
        };
        let parsed_amount = amount.parse::<TokenAmount>();
        let parsed_started = started.trim().parse::<u64>();
        match (parsed_amount, parsed_started) {
            (Ok(amount), Ok(timestamp_ms)) => Ok(Some(Baseline::new(amount, timestamp_ms))),
            _ => {
                warn!(
                    program = program.label(),
                    %amount,
                    %started,
                    "ignoring unreadable persisted baseline"
                );
                Ok(None)
            }
        }
    }

    pub fn store_baseline(
        &self,
        program: IncomeProgram,
        baseline: &Baseline,
    ) -> Result<(), MirrorError> {
        let base_key = self.program_key(program, BASE_SUFFIX);
        let start_key = self.program_key(program, START_TIME_SUFFIX);
        self.store.set_many(&[
            (base_key.as_str(), baseline.amount.to_string()),
            (start_key.as_str(), baseline.timestamp_ms.to_string()),
        ])
    }

    pub fn load_activated(&self, program: IncomeProgram) -> Result<Option<bool>, MirrorError> {
        let value = self
            .store
            .get(&self.program_key(program, ACTIVATED_SUFFIX))?;
        Ok(value.map(|value| value.trim() == "true"))
    }

    pub fn store_activated(&self, program: IncomeProgram, activated: bool) -> Result<(), MirrorError> {
        self.store.set(
            &self.program_key(program, ACTIVATED_SUFFIX),
            if activated { "true" } else { "false" },
        )
    }

    pub fn load_token_balance(&self) -> Result<Option<TokenAmount>, MirrorError> {
        let Some(value) = self.store.get(&self.key(TOKEN_BALANCE_KEY))? else {
            return Ok(None);
        };
        match value.parse() {
            Ok(amount) => Ok(Some(amount)),
            Err(error) => {
                warn!(%value, %error, "ignoring unreadable persisted token balance");
                Ok(None)
            }
        }
    }

    pub fn store_token_balance(&self, balance: TokenAmount) -> Result<(), MirrorError> {
        self.store
            .set(&self.key(TOKEN_BALANCE_KEY), &balance.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const T0: u64 = 1_700_000_000_000;

    #[test]
    fn baseline_uses_feature_keys() {
        let store = Arc::new(MemoryStore::new());
        let mirror = AccrualMirror::new(store.clone());
        let baseline = Baseline::new("10.5".parse().expect("amount"), T0);
        mirror
            .store_baseline(IncomeProgram::Basic, &baseline)
            .expect("store");
        mirror
            .store_activated(IncomeProgram::Plus, true)
            .expect("store");

        let entries = store.entries();
        assert_eq!(entries.get("basicIncomeBase").map(String::as_str), Some("10.5"));
        assert_eq!(
            entries.get("basicIncomeStartTime").map(String::as_str),
            Some("1700000000000")
        );
        assert_eq!(
            entries.get("basicIncomePlusActivated").map(String::as_str),
            Some("true")
        );
        assert_eq!(
            mirror.load_baseline(IncomeProgram::Basic).expect("load"),
            Some(baseline)
        );
        assert_eq!(mirror.load_baseline(IncomeProgram::Plus).expect("load"), None);
    }

    #[test]
    fn scoped_mirror_prefixes_keys_with_address() {
        let store = Arc::new(MemoryStore::new());
        let address: Address = "0x00000000000000000000000000000000000000aa"
            .parse()
            .expect("address");
        let mirror = AccrualMirror::scoped(store.clone(), &address);
        mirror
            .store_token_balance(TokenAmount::from_tokens(3))
            .expect("store");
        assert_eq!(
            store
                .entries()
                .get("0x00000000000000000000000000000000000000aa:tokenBalance")
                .map(String::as_str),
            Some("3")
        );
        assert_eq!(
            AccrualMirror::new(store).load_token_balance().expect("load"),
            None
        );
    }

    #[test]
    fn half_written_or_corrupt_baseline_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        store.set("basicIncomeBase", "4").expect("set");
        let mirror = AccrualMirror::new(store.clone());
        assert_eq!(mirror.load_baseline(IncomeProgram::Basic).expect("load"), None);

        store.set("basicIncomeStartTime", "yesterday").expect("set");
        assert_eq!(mirror.load_baseline(IncomeProgram::Basic).expect("load"), None);
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("mirror/state.json");
        let baseline = Baseline::new(TokenAmount::from_tokens(7), T0);
        {
            let store = Arc::new(FileStore::open(&path).expect("open"));
            let mirror = AccrualMirror::new(store);
            mirror
                .store_baseline(IncomeProgram::Plus, &baseline)
                .expect("store");
            mirror
                .store_activated(IncomeProgram::Plus, true)
                .expect("store");
        }
        let reopened = AccrualMirror::new(Arc::new(FileStore::open(&path).expect("reopen")));
        assert_eq!(
            reopened.load_baseline(IncomeProgram::Plus).expect("load"),
            Some(baseline)
        );
        assert_eq!(
            reopened.load_activated(IncomeProgram::Plus).expect("load"),
            Some(true)
        );
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn file_store_rejects_corrupt_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").expect("write");
        assert!(matches!(FileStore::open(&path), Err(MirrorError::Encoding(_))));
    }
}
