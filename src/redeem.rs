//! Single-use redemption codes that top up a credential's credit balance.
//!
//! Codes are case-insensitive (stored upper-cased) and move from unused to
//! used exactly once. When a storage path is configured the code table is
//! persisted to JSON after every change.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::ledger::{CreditLedger, LedgerError};

/// Most codes minted per admin request.
pub const MAX_MINT_COUNT: usize = 500;

const CODE_GROUPS: usize = 4;
const CODE_GROUP_LEN: usize = 4;
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RedeemError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("redemption code not found")]
    NotFound,

    #[error("redemption code has already been used")]
    AlreadyRedeemed,

    #[error("code storage failure: {0}")]
    Storage(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

// ─────────────────────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedemptionCode {
    pub code: String,
    pub credits: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redeemed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redeemed_at: Option<DateTime<Utc>>,
}

impl RedemptionCode {
    pub fn is_used(&self) -> bool {
        self.redeemed_at.is_some()
    }
}

/// Outcome of a successful redemption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redemption {
    pub code: String,
    pub credits_added: u64,
    pub credits_total: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CodeStoreFile {
    codes: Vec<RedemptionCode>,
}

pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    let groups: Vec<String> = (0..CODE_GROUPS)
        .map(|_| {
            (0..CODE_GROUP_LEN)
                .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
                .collect()
        })
        .collect();
    groups.join("-")
}

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

pub struct RedemptionCodeStore {
    codes: RwLock<HashMap<String, RedemptionCode>>,
    storage_path: Option<PathBuf>,
}

impl RedemptionCodeStore {
    pub fn in_memory() -> Self {
        Self {
            codes: RwLock::new(HashMap::new()),
            storage_path: None,
        }
    }

    /// Load codes from `storage_path`, starting empty if the file does not exist.
    pub async fn open(storage_path: PathBuf) -> Result<Self, RedeemError> {
        let file = match tokio::fs::read_to_string(&storage_path).await {
            Ok(content) => serde_json::from_str::<CodeStoreFile>(&content).map_err(|e| {
                RedeemError::Storage(format!("failed to parse {}: {}", storage_path.display(), e))
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => CodeStoreFile::default(),
            Err(err) => return Err(RedeemError::Storage(err.to_string())),
        };
        let codes = file
            .codes
            .into_iter()
            .map(|c| (normalize_code(&c.code), c))
            .collect();
        Ok(Self {
            codes: RwLock::new(codes),
            storage_path: Some(storage_path),
        })
    }

    async fn save_to_disk(&self, codes: &HashMap<String, RedemptionCode>) -> Result<(), RedeemError> {
        let Some(path) = &self.storage_path else {
            return Ok(());
        };
        let mut list: Vec<RedemptionCode> = codes.values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.code.cmp(&b.code)));
        let contents = serde_json::to_vec_pretty(&CodeStoreFile { codes: list })
            .map_err(|e| RedeemError::Storage(e.to_string()))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RedeemError::Storage(e.to_string()))?;
        }
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &contents)
            .await
            .map_err(|e| RedeemError::Storage(e.to_string()))?;
        tokio::fs::rename(&tmp_path, path)
            .await
            .map_err(|e| RedeemError::Storage(e.to_string()))
    }

    /// Insert a code with a caller-chosen value (seeding, tests).
    pub async fn insert(&self, code: &str, credits: u64) -> Result<RedemptionCode, RedeemError> {
        let key = normalize_code(code);
        if key.is_empty() {
            return Err(RedeemError::InvalidInput("code must not be empty".to_string()));
        }
        if credits == 0 {
            return Err(RedeemError::InvalidInput(
                "credits must be greater than zero".to_string(),
            ));
        }
        let record = RedemptionCode {
            code: key.clone(),
            credits,
            created_at: Utc::now(),
            redeemed_by: None,
            redeemed_at: None,
        };
        let mut codes = self.codes.write().await;
        if codes.contains_key(&key) {
            return Err(RedeemError::InvalidInput(format!("code {} already exists", key)));
        }
        codes.insert(key.clone(), record.clone());
        if let Err(e) = self.save_to_disk(&codes).await {
            codes.remove(&key);
            return Err(e);
        }
        Ok(record)
    }

    /// Mint `count` fresh codes worth `credits` each.
    pub async fn mint(&self, count: usize, credits: u64) -> Result<Vec<RedemptionCode>, RedeemError> {
        if count == 0 || count > MAX_MINT_COUNT {
            return Err(RedeemError::InvalidInput(format!(
                "count must be between 1 and {}",
                MAX_MINT_COUNT
            )));
        }
        if credits == 0 {
            return Err(RedeemError::InvalidInput(
                "credits must be greater than zero".to_string(),
            ));
        }

        let mut codes = self.codes.write().await;
        let now = Utc::now();
        let mut minted = Vec::with_capacity(count);
        while minted.len() < count {
            let code = generate_code();
            if codes.contains_key(&code) {
                continue;
            }
            let record = RedemptionCode {
                code: code.clone(),
                credits,
                created_at: now,
                redeemed_by: None,
                redeemed_at: None,
            };
            codes.insert(code, record.clone());
            minted.push(record);
        }
        if let Err(e) = self.save_to_disk(&codes).await {
            for record in &minted {
                codes.remove(&record.code);
            }
            return Err(e);
        }
        tracing::info!(count, credits, "Minted redemption codes");
        Ok(minted)
    }

    pub async fn get(&self, code: &str) -> Option<RedemptionCode> {
        self.codes.read().await.get(&normalize_code(code)).cloned()
    }

    /// Mark a code used by `credential`. Serialised by the store's write lock,
    /// so of several concurrent claims exactly one succeeds.
    pub async fn claim(&self, code: &str, credential: &str) -> Result<RedemptionCode, RedeemError> {
        let key = normalize_code(code);
        if key.is_empty() {
            return Err(RedeemError::InvalidInput("code is required".to_string()));
        }
        let mut codes = self.codes.write().await;
        let record = codes.get_mut(&key).ok_or(RedeemError::NotFound)?;
        if record.is_used() {
            return Err(RedeemError::AlreadyRedeemed);
        }
        record.redeemed_by = Some(credential.to_string());
        record.redeemed_at = Some(Utc::now());
        let claimed = record.clone();

        if let Err(e) = self.save_to_disk(&codes).await {
            if let Some(record) = codes.get_mut(&key) {
                record.redeemed_by = None;
                record.redeemed_at = None;
            }
            return Err(e);
        }
        Ok(claimed)
    }

    /// Return a claimed code to the unused state.
    pub async fn unclaim(&self, code: &str) -> Result<(), RedeemError> {
        let key = normalize_code(code);
        let mut codes = self.codes.write().await;
        let record = codes.get_mut(&key).ok_or(RedeemError::NotFound)?;
        record.redeemed_by = None;
        record.redeemed_at = None;
        self.save_to_disk(&codes).await
    }
}

/// Redeem `code` for `credential`: claim the code, then credit the ledger.
///
/// If crediting fails the claim is rolled back so the code stays usable.
pub async fn redeem(
    codes: &RedemptionCodeStore,
    ledger: &dyn CreditLedger,
    credential: &str,
    code: &str,
) -> Result<Redemption, RedeemError> {
    let claimed = codes.claim(code, credential).await?;

    match ledger.add_credits(credential, claimed.credits).await {
        Ok(total) => {
            tracing::info!(
                code = %claimed.code,
                credits_added = claimed.credits,
                credits_total = total,
                "Redeemed code"
            );
            Ok(Redemption {
                code: claimed.code,
                credits_added: claimed.credits,
                credits_total: total,
            })
        }
        Err(err) => {
            tracing::error!(code = %claimed.code, error = %err, "Crediting failed, rolling back redemption");
            if let Err(rollback) = codes.unclaim(&claimed.code).await {
                tracing::error!(code = %claimed.code, error = %rollback, "Failed to roll back redemption");
            }
            Err(err.into())
        }
    }
}
