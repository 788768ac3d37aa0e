//! RAII guard over reserved credits.
//!
//! A hold is taken when work is admitted and must end in exactly one of
//! `capture` (charge) or `release` (no charge) per reserved credit. A guard
//! dropped with credits still reserved releases them in the background.

use super::{LedgerError, SharedLedger};
use std::sync::Arc;

pub struct CreditHold {
    ledger: SharedLedger,
    credential: String,
    remaining: u64,
}

impl CreditHold {
    /// Reserve `count` credits. `Ok(None)` means the unreserved balance is too low.
    pub async fn acquire(
        ledger: &SharedLedger,
        credential: &str,
        count: u64,
    ) -> Result<Option<Self>, LedgerError> {
        if !ledger.hold(credential, count).await? {
            return Ok(None);
        }
        Ok(Some(Self {
            ledger: Arc::clone(ledger),
            credential: credential.to_string(),
            remaining: count,
        }))
    }

    /// Move one reserved credit into its own guard.
    pub fn split_one(&mut self) -> Option<CreditHold> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(CreditHold {
            ledger: Arc::clone(&self.ledger),
            credential: self.credential.clone(),
            remaining: 1,
        })
    }

    /// Charge one reserved credit.
    pub async fn capture_one(&mut self) -> Result<(), LedgerError> {
        if self.remaining == 0 {
            return Err(LedgerError::NoHold);
        }
        self.ledger.capture_one(&self.credential).await?;
        self.remaining -= 1;
        Ok(())
    }

    /// Give back every reserved credit without charging.
    pub async fn release(mut self) {
        let count = std::mem::take(&mut self.remaining);
        if count == 0 {
            return;
        }
        if let Err(err) = self.ledger.release(&self.credential, count).await {
            tracing::error!(count, error = %err, "Failed to release credit hold");
        }
    }
}

impl Drop for CreditHold {
    fn drop(&mut self) {
        if self.remaining == 0 {
            return;
        }
        let ledger = Arc::clone(&self.ledger);
        let credential = std::mem::take(&mut self.credential);
        let count = std::mem::take(&mut self.remaining);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = ledger.release(&credential, count).await {
                        tracing::error!(count, error = %err, "Failed to release dropped credit hold");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(count, "Credit hold dropped outside a runtime; reservation leaked");
            }
        }
    }
}
