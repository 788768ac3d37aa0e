//! JSON file-based credit ledger.
//!
//! Balances are written to disk after every balance mutation (temp file +
//! rename). A mutation whose write fails is not applied in memory either.
//! Holds live in memory only.

use std::path::PathBuf;

use super::{AccountSnapshot, CreditLedger, LedgerBook, LedgerError};
use async_trait::async_trait;
use tokio::sync::RwLock;

pub struct FileLedger {
    path: PathBuf,
    book: RwLock<LedgerBook>,
}

impl FileLedger {
    /// Load the ledger at `path`, starting empty if the file does not exist.
    pub async fn open(path: PathBuf) -> Result<Self, LedgerError> {
        let book = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str::<LedgerBook>(&content).map_err(|e| {
                LedgerError::Storage(format!("failed to parse {}: {}", path.display(), e))
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => LedgerBook::default(),
            Err(err) => {
                return Err(LedgerError::Storage(format!(
                    "failed to read {}: {}",
                    path.display(),
                    err
                )))
            }
        };
        Ok(Self {
            path,
            book: RwLock::new(book),
        })
    }

    /// Apply `f` to a copy of the book, persist the copy, then publish it.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut LedgerBook) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut guard = self.book.write().await;
        let mut next = guard.clone();
        let out = f(&mut next)?;
        self.save_to_disk(&next).await?;
        *guard = next;
        Ok(out)
    }

    async fn save_to_disk(&self, book: &LedgerBook) -> Result<(), LedgerError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| LedgerError::Storage(e.to_string()))?;
        }
        let contents =
            serde_json::to_vec_pretty(book).map_err(|e| LedgerError::Storage(e.to_string()))?;
        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &contents)
            .await
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to persist ledger");
                LedgerError::Storage(e.to_string())
            })
    }
}

#[async_trait]
impl CreditLedger for FileLedger {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn open_account(&self, credential: &str, initial: u64) -> Result<bool, LedgerError> {
        if self.book.read().await.contains(credential) {
            return Ok(false);
        }
        self.mutate(|book| Ok(book.open(credential, initial))).await
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
        self.mutate(|book| book.add(credential, amount)).await
    }

    async fn charge_one(&self, credential: &str) -> Result<bool, LedgerError> {
        self.mutate(|book| book.charge_one(credential)).await
    }

    async fn hold(&self, credential: &str, count: u64) -> Result<bool, LedgerError> {
        self.book.write().await.hold(credential, count)
    }

    async fn capture_one(&self, credential: &str) -> Result<(), LedgerError> {
        self.mutate(|book| book.capture_one(credential)).await
    }

    async fn release(&self, credential: &str, count: u64) -> Result<(), LedgerError> {
        self.book.write().await.release(credential, count)
    }
}
