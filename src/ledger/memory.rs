//! In-memory credit ledger (non-persistent).

use super::{AccountSnapshot, CreditLedger, LedgerBook, LedgerError};
use async_trait::async_trait;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct InMemoryLedger {
    book: RwLock<LedgerBook>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CreditLedger for InMemoryLedger {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn open_account(&self, credential: &str, initial: u64) -> Result<bool, LedgerError> {
        Ok(self.book.write().await.open(credential, initial))
    }

    async fn has_account(&self, credential: &str) -> bool {
        self.book.read().await.contains(credential)
    }

    async fn get_balance(&self, credential: &str) -> Result<u64, LedgerError> {
        Ok(self.book.read().await.snapshot(credential)?.balance)
    }

    async fn snapshot(&self, credential: &str) -> Result<AccountSnapshot, LedgerError> {
        self.book.read().await.snapshot(credential)
    }

    async fn add_credits(&self, credential: &str, amount: u64) -> Result<u64, LedgerError> {
        self.book.write().await.add(credential, amount)
    }

    async fn charge_one(&self, credential: &str) -> Result<bool, LedgerError> {
        self.book.write().await.charge_one(credential)
    }

    async fn hold(&self, credential: &str, count: u64) -> Result<bool, LedgerError> {
        self.book.write().await.hold(credential, count)
    }

    async fn capture_one(&self, credential: &str) -> Result<(), LedgerError> {
        self.book.write().await.capture_one(credential)
    }

    async fn release(&self, credential: &str, count: u64) -> Result<(), LedgerError> {
        self.book.write().await.release(credential, count)
    }
}
