use serde::{Deserialize, Serialize};

use crate::ledger::{AccountId, Amount, LedgerError};

/// A single movement of funds between two accounts.
///
/// Built per call and discarded once the ledger has answered it; only the
/// resulting journal entry is kept.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferRequest {
    pub from: AccountId,
    pub to: AccountId,
    pub amount: Amount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

impl TransferRequest {
    pub fn new(from: impl Into<AccountId>, to: impl Into<AccountId>, amount: Amount) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            amount,
            memo: None,
        }
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    /// Checks that only need the request itself. Account existence and
    /// funds are checked by the ledger under its locks.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.amount <= 0 {
            return Err(LedgerError::InvalidAmount {
                amount: self.amount,
            });
        }
        if self.from == self.to {
            return Err(LedgerError::SameAccount {
                account: self.from.clone(),
            });
        }
        Ok(())
    }
}

/// Balances of both accounts right after a transfer was applied.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferReceipt {
    pub seq: u64,
    pub from: AccountId,
    pub from_balance: Amount,
    pub to: AccountId,
    pub to_balance: Amount,
    pub amount: Amount,
}

pub type TransferResult = Result<TransferReceipt, LedgerError>;
