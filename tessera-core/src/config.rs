//! Engine configuration.

use rustc_hash::FxHashMap;
use tessera_error::TesseraResult;

/// Key bounding the bytes of fixed tile data a query keeps in flight.
pub const MEMORY_BUDGET_KEY: &str = "sm.memory_budget";
/// Key bounding the bytes of var tile data a query keeps in flight.
pub const MEMORY_BUDGET_VAR_KEY: &str = "sm.memory_budget_var";

const DEFAULT_MEMORY_BUDGET: u64 = 5 * 1024 * 1024 * 1024;
const DEFAULT_MEMORY_BUDGET_VAR: u64 = 10 * 1024 * 1024 * 1024;

/// A flat string key-value configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    values: FxHashMap<String, String>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn get_u64(&self, key: &str, default: u64) -> TesseraResult<u64> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(
                |e| tessera_error::tessera_err!(InvalidConfig: "'{key}' = '{raw}': {e}"),
            ),
        }
    }
}

/// The memory budgets a read query runs under, parsed once at init.
#[derive(Debug, Clone, Copy)]
pub struct MemoryBudget {
    pub fixed: u64,
    pub var: u64,
}

impl MemoryBudget {
    pub fn from_config(config: &Config) -> TesseraResult<Self> {
        Ok(Self {
            fixed: config.get_u64(MEMORY_BUDGET_KEY, DEFAULT_MEMORY_BUDGET)?,
            var: config.get_u64(MEMORY_BUDGET_VAR_KEY, DEFAULT_MEMORY_BUDGET_VAR)?,
        })
    }
}
