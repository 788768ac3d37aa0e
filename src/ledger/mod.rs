//! Credit ledger with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory balances (non-persistent, for testing)
//! - `file`: JSON file-based balances
//!
//! # Invariants
//! - A balance never goes below zero.
//! - `held <= balance` for every account; holds are never persisted.
//! - Accounts are never removed, not even at zero balance.

mod file;
mod hold;
mod memory;

pub use file::FileLedger;
pub use hold::CreditHold;
pub use memory::InMemoryLedger;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type SharedLedger = Arc<dyn CreditLedger>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("unknown credential")]
    NotFound,

    #[error("credit amount must be greater than zero (got {0})")]
    InvalidAmount(u64),

    #[error("no outstanding hold to settle")]
    NoHold,

    #[error("ledger storage failure: {0}")]
    Storage(String),
}

/// Balance and outstanding holds for one credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AccountSnapshot {
    pub balance: u64,
    pub held: u64,
}

impl AccountSnapshot {
    /// Credits not reserved by in-flight work.
    pub fn available(&self) -> u64 {
        self.balance.saturating_sub(self.held)
    }
}

/// Credit ledger trait - implemented by all storage backends.
///
/// Every mutation is atomic with respect to concurrent callers on the same
/// credential.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    /// Whether this ledger persists balances across restarts.
    fn is_persistent(&self) -> bool;

    /// Open an account if missing. Returns `true` when a new account was created;
    /// an existing balance is never touched.
    async fn open_account(&self, credential: &str, initial: u64) -> Result<bool, LedgerError>;

    async fn has_account(&self, credential: &str) -> bool;

    async fn get_balance(&self, credential: &str) -> Result<u64, LedgerError>;

    async fn snapshot(&self, credential: &str) -> Result<AccountSnapshot, LedgerError>;

    /// Add credits, returning the new balance.
    async fn add_credits(&self, credential: &str, amount: u64) -> Result<u64, LedgerError>;

    /// Decrement by one if unreserved credit is left. `false` means no effect.
    async fn charge_one(&self, credential: &str) -> Result<bool, LedgerError>;

    /// Reserve `count` credits for in-flight work. `false` means no effect.
    async fn hold(&self, credential: &str, count: u64) -> Result<bool, LedgerError>;

    /// Turn one hold into a charge.
    async fn capture_one(&self, credential: &str) -> Result<(), LedgerError>;

    /// Drop up to `count` holds without charging.
    async fn release(&self, credential: &str, count: u64) -> Result<(), LedgerError>;
}

/// A persisted account record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub balance: u64,
    #[serde(skip)]
    pub held: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Account table shared by the backends. Pure data: no locking, no IO.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct LedgerBook {
    accounts: BTreeMap<String, Account>,
}

impl LedgerBook {
    pub(crate) fn open(&mut self, credential: &str, initial: u64) -> bool {
        if self.accounts.contains_key(credential) {
            return false;
        }
        let now = Utc::now();
        self.accounts.insert(
            credential.to_string(),
            Account {
                balance: initial,
                held: 0,
                created_at: now,
                updated_at: now,
            },
        );
        true
    }

    pub(crate) fn contains(&self, credential: &str) -> bool {
        self.accounts.contains_key(credential)
    }

    pub(crate) fn snapshot(&self, credential: &str) -> Result<AccountSnapshot, LedgerError> {
        let account = self.accounts.get(credential).ok_or(LedgerError::NotFound)?;
        Ok(AccountSnapshot {
            balance: account.balance,
            held: account.held,
        })
    }

    fn account_mut(&mut self, credential: &str) -> Result<&mut Account, LedgerError> {
        self.accounts
            .get_mut(credential)
            .ok_or(LedgerError::NotFound)
    }

    pub(crate) fn add(&mut self, credential: &str, amount: u64) -> Result<u64, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let account = self.account_mut(credential)?;
        account.balance = account.balance.saturating_add(amount);
        account.updated_at = Utc::now();
        Ok(account.balance)
    }

    pub(crate) fn charge_one(&mut self, credential: &str) -> Result<bool, LedgerError> {
        let account = self.account_mut(credential)?;
        if account.balance.saturating_sub(account.held) == 0 {
            return Ok(false);
        }
        account.balance -= 1;
        account.updated_at = Utc::now();
        Ok(true)
    }

    pub(crate) fn hold(&mut self, credential: &str, count: u64) -> Result<bool, LedgerError> {
        let account = self.account_mut(credential)?;
        if account.balance.saturating_sub(account.held) < count {
            return Ok(false);
        }
        account.held += count;
        Ok(true)
    }

    pub(crate) fn capture_one(&mut self, credential: &str) -> Result<(), LedgerError> {
        let account = self.account_mut(credential)?;
        if account.held == 0 {
            return Err(LedgerError::NoHold);
        }
        // held <= balance, so balance >= 1 here
        account.held -= 1;
        account.balance -= 1;
        account.updated_at = Utc::now();
        Ok(())
    }

    pub(crate) fn release(&mut self, credential: &str, count: u64) -> Result<(), LedgerError> {
        let account = self.account_mut(credential)?;
        account.held = account.held.saturating_sub(count);
        Ok(())
    }
}
