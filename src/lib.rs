//! Account ledger with atomic, balance-preserving transfers.
//!
//! [`ledger::Ledger`] holds the accounts and applies transfers,
//! [`store::SnapshotStore`] persists it as a digest-checked JSON snapshot.

pub mod ledger;
pub mod logging;
pub mod store;
pub mod transfer;

pub use ledger::{AccountId, Amount, Ledger, LedgerError, LedgerEvent, LedgerSnapshot};
pub use store::{SnapshotStore, StoreError};
pub use transfer::{TransferReceipt, TransferRequest, TransferResult};
