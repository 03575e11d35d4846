use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::transfer::{TransferReceipt, TransferRequest, TransferResult};

pub type AccountId = String;
/// Integer minor units. Balances never go below zero.
pub type Amount = i64;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("account {account} not found")]
    AccountNotFound { account: AccountId },
    #[error("source and destination are the same account ({account})")]
    SameAccount { account: AccountId },
    #[error("invalid amount {amount}: must be positive")]
    InvalidAmount { amount: Amount },
    #[error(
        "insufficient funds in account {account}: available {available}, requested {requested}"
    )]
    InsufficientFunds {
        account: AccountId,
        available: Amount,
        requested: Amount,
    },
    #[error("account {account} already exists")]
    DuplicateAccount { account: AccountId },
    #[error("account id must not be empty")]
    InvalidAccountId,
    #[error("crediting {amount} would overflow the balance of account {account}")]
    BalanceOverflow { account: AccountId, amount: Amount },
    #[error("balance {balance} of account {account} must not be negative")]
    NegativeBalance { account: AccountId, balance: Amount },
    #[error("journal entry #{seq} is inconsistent: {reason}")]
    InconsistentJournal { seq: u64, reason: String },
}

impl LedgerError {
    /// Stable label used in logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::AccountNotFound { .. } => "account_not_found",
            LedgerError::SameAccount { .. } => "same_account",
            LedgerError::InvalidAmount { .. } => "invalid_amount",
            LedgerError::InsufficientFunds { .. } => "insufficient_funds",
            LedgerError::DuplicateAccount { .. } => "duplicate_account",
            LedgerError::InvalidAccountId => "invalid_account_id",
            LedgerError::BalanceOverflow { .. } => "balance_overflow",
            LedgerError::NegativeBalance { .. } => "negative_balance",
            LedgerError::InconsistentJournal { .. } => "inconsistent_journal",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    AccountOpened {
        seq: u64,
        account: AccountId,
        opening_balance: Amount,
    },
    Transfer {
        seq: u64,
        from: AccountId,
        to: AccountId,
        amount: Amount,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        memo: Option<String>,
    },
}

impl LedgerEvent {
    pub fn seq(&self) -> u64 {
        match self {
            LedgerEvent::AccountOpened { seq, .. } | LedgerEvent::Transfer { seq, .. } => *seq,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SnapshotMetadata {
    /// Sequence number of the last journal entry, 0 for a fresh ledger.
    pub height: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub meta: SnapshotMetadata,
    pub accounts: BTreeMap<AccountId, Amount>,
    pub events: Vec<LedgerEvent>,
    #[serde(with = "crate::store::serde_digest")]
    pub merkle_root: [u8; 32],
}

impl LedgerSnapshot {
    /// Builds a snapshot and seals it with its merkle root.
    pub fn new(
        meta: SnapshotMetadata,
        accounts: BTreeMap<AccountId, Amount>,
        events: Vec<LedgerEvent>,
    ) -> Self {
        let merkle_root = compute_merkle_root(&meta, &accounts, &events);
        Self {
            meta,
            accounts,
            events,
            merkle_root,
        }
    }

    /// Recomputes the root over metadata, balances and journal and compares
    /// it to the stored one.
    pub fn verify(&self) -> bool {
        compute_merkle_root(&self.meta, &self.accounts, &self.events) == self.merkle_root
    }

    /// Checks the ledger invariants independently of the digest: ids are
    /// non-empty, balances are non-negative, and replaying the journal from
    /// an empty ledger yields exactly `accounts` at `meta.height`.
    pub fn validate(&self) -> Result<(), LedgerError> {
        for (account, balance) in &self.accounts {
            if account.is_empty() {
                return Err(LedgerError::InvalidAccountId);
            }
            if *balance < 0 {
                return Err(LedgerError::NegativeBalance {
                    account: account.clone(),
                    balance: *balance,
                });
            }
        }

        let mut replayed: BTreeMap<&str, Amount> = BTreeMap::new();
        let mut expected_seq = 0u64;
        for event in &self.events {
            expected_seq += 1;
            let seq = event.seq();
            let inconsistent = |reason: String| LedgerError::InconsistentJournal { seq, reason };
            if seq != expected_seq {
                return Err(inconsistent(format!("expected sequence {expected_seq}")));
            }
            match event {
                LedgerEvent::AccountOpened {
                    account,
                    opening_balance,
                    ..
                } => {
                    if account.is_empty() || *opening_balance < 0 {
                        return Err(inconsistent(format!("invalid opening of {account:?}")));
                    }
                    if replayed.insert(account, *opening_balance).is_some() {
                        return Err(inconsistent(format!("{account} opened twice")));
                    }
                }
                LedgerEvent::Transfer {
                    from, to, amount, ..
                } => {
                    if *amount <= 0 || from == to {
                        return Err(inconsistent(format!("invalid transfer {from} → {to}")));
                    }
                    let source = replayed.get(from.as_str()).copied();
                    let destination = replayed.get(to.as_str()).copied();
                    let (Some(source), Some(destination)) = (source, destination) else {
                        return Err(inconsistent(format!("unknown account in {from} → {to}")));
                    };
                    let (Some(debited), Some(credited)) = (
                        source.checked_sub(*amount).filter(|b| *b >= 0),
                        destination.checked_add(*amount),
                    ) else {
                        let reason = format!("{from} → {to} {amount} not applicable");
                        return Err(inconsistent(reason));
                    };
                    replayed.insert(from, debited);
                    replayed.insert(to, credited);
                }
            }
        }

        if expected_seq != self.meta.height {
            return Err(LedgerError::InconsistentJournal {
                seq: self.meta.height,
                reason: format!("height does not match last entry #{expected_seq}"),
            });
        }
        let matches = replayed.len() == self.accounts.len()
            && replayed
                .iter()
                .all(|(id, balance)| self.accounts.get(*id) == Some(balance));
        if !matches {
            return Err(LedgerError::InconsistentJournal {
                seq: self.meta.height,
                reason: "replayed balances differ from stored balances".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
struct Journal {
    height: u64,
    events: Vec<LedgerEvent>,
}

impl Journal {
    fn next_seq(&mut self) -> u64 {
        self.height += 1;
        self.height
    }
}

/// Named accounts and their balances.
///
/// Lock order is always: account map, then account balances in ascending
/// id order, then the journal. Transfers hold the map's read lock for
/// their whole duration, so anything holding the write lock sees no
/// transfer in flight.
#[derive(Default)]
pub struct Ledger {
    accounts: RwLock<BTreeMap<AccountId, Arc<Mutex<Amount>>>>,
    journal: Mutex<Journal>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_account(
        &self,
        account: impl Into<AccountId>,
        opening_balance: Amount,
    ) -> Result<(), LedgerError> {
        let account = account.into();
        if account.is_empty() {
            return Err(LedgerError::InvalidAccountId);
        }
        if opening_balance < 0 {
            return Err(LedgerError::NegativeBalance {
                account,
                balance: opening_balance,
            });
        }
        let mut accounts = write(&self.accounts);
        if accounts.contains_key(&account) {
            return Err(LedgerError::DuplicateAccount { account });
        }
        accounts.insert(account.clone(), Arc::new(Mutex::new(opening_balance)));
        let mut journal = lock(&self.journal);
        let seq = journal.next_seq();
        journal.events.push(LedgerEvent::AccountOpened {
            seq,
            account: account.clone(),
            opening_balance,
        });
        info!(%account, opening_balance, seq, "account opened");
        Ok(())
    }

    pub fn balance(&self, account: &str) -> Result<Amount, LedgerError> {
        let accounts = read(&self.accounts);
        let slot = lookup(&accounts, account)?;
        let balance = *lock(slot);
        Ok(balance)
    }

    /// All accounts with their balances, sorted by id.
    pub fn accounts(&self) -> Vec<(AccountId, Amount)> {
        let accounts = write(&self.accounts);
        accounts
            .iter()
            .map(|(id, slot)| (id.clone(), *lock(slot)))
            .collect()
    }

    pub fn total(&self) -> i128 {
        self.accounts()
            .into_iter()
            .map(|(_, balance)| i128::from(balance))
            .sum()
    }

    pub fn history(&self) -> Vec<LedgerEvent> {
        lock(&self.journal).events.clone()
    }

    pub fn height(&self) -> u64 {
        lock(&self.journal).height
    }

    /// Moves `request.amount` from `request.from` to `request.to`.
    ///
    /// Every precondition is checked before either balance changes; on
    /// error nothing is mutated and nothing is journaled.
    pub fn transfer(&self, request: &TransferRequest) -> TransferResult {
        let outcome = self.apply_transfer(request);
        match &outcome {
            Ok(receipt) => debug!(
                from = %receipt.from,
                to = %receipt.to,
                amount = receipt.amount,
                seq = receipt.seq,
                "transfer applied"
            ),
            Err(err) => debug!(
                from = %request.from,
                to = %request.to,
                amount = request.amount,
                kind = err.kind(),
                "transfer rejected: {err}"
            ),
        }
        outcome
    }

    fn apply_transfer(&self, request: &TransferRequest) -> TransferResult {
        request.validate()?;
        let TransferRequest {
            from,
            to,
            amount,
            memo,
        } = request;
        let amount = *amount;

        let accounts = read(&self.accounts);
        let source = lookup(&accounts, from)?;
        let destination = lookup(&accounts, to)?;

        let (mut source_balance, mut destination_balance) = if from < to {
            let s = lock(source);
            let d = lock(destination);
            (s, d)
        } else {
            let d = lock(destination);
            let s = lock(source);
            (s, d)
        };

        if *source_balance < amount {
            return Err(LedgerError::InsufficientFunds {
                account: from.clone(),
                available: *source_balance,
                requested: amount,
            });
        }
        let credited =
            destination_balance
                .checked_add(amount)
                .ok_or_else(|| LedgerError::BalanceOverflow {
                    account: to.clone(),
                    amount,
                })?;

        *source_balance -= amount;
        *destination_balance = credited;

        let mut journal = lock(&self.journal);
        let seq = journal.next_seq();
        journal.events.push(LedgerEvent::Transfer {
            seq,
            from: from.clone(),
            to: to.clone(),
            amount,
            memo: memo.clone(),
        });

        Ok(TransferReceipt {
            seq,
            from: from.clone(),
            from_balance: *source_balance,
            to: to.clone(),
            to_balance: *destination_balance,
            amount,
        })
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let accounts = write(&self.accounts);
        let balances: BTreeMap<AccountId, Amount> = accounts
            .iter()
            .map(|(id, slot)| (id.clone(), *lock(slot)))
            .collect();
        let journal = lock(&self.journal);
        LedgerSnapshot::new(
            SnapshotMetadata {
                height: journal.height,
            },
            balances,
            journal.events.clone(),
        )
    }

    /// Rebuilds a ledger from a snapshot after [`LedgerSnapshot::validate`].
    /// The digest is not checked here; see [`LedgerSnapshot::verify`].
    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Result<Self, LedgerError> {
        snapshot.validate()?;
        let accounts = snapshot
            .accounts
            .into_iter()
            .map(|(account, balance)| (account, Arc::new(Mutex::new(balance))))
            .collect();
        Ok(Self {
            accounts: RwLock::new(accounts),
            journal: Mutex::new(Journal {
                height: snapshot.meta.height,
                events: snapshot.events,
            }),
        })
    }
}

fn lookup<'a>(
    accounts: &'a BTreeMap<AccountId, Arc<Mutex<Amount>>>,
    account: &str,
) -> Result<&'a Mutex<Amount>, LedgerError> {
    accounts
        .get(account)
        .map(|slot| &**slot)
        .ok_or_else(|| LedgerError::AccountNotFound {
            account: account.to_string(),
        })
}

// A panic can never leave a balance half-written, so poisoned locks are
// still safe to use.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(rw: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rw.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(rw: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rw.write().unwrap_or_else(PoisonError::into_inner)
}

/// Root over one leaf for the metadata, one per account and one per
/// journal entry.
pub fn compute_merkle_root(
    meta: &SnapshotMetadata,
    accounts: &BTreeMap<AccountId, Amount>,
    events: &[LedgerEvent],
) -> [u8; 32] {
    let mut leaves: Vec<[u8; 32]> = Vec::with_capacity(1 + accounts.len() + events.len());
    let mut hasher = Sha256::new();
    hasher.update(b"meta");
    hasher.update(meta.height.to_le_bytes());
    leaves.push(hasher.finalize().into());
    for (account, balance) in accounts {
        let mut hasher = Sha256::new();
        hasher.update(b"acct");
        update_str(&mut hasher, account);
        hasher.update(balance.to_le_bytes());
        leaves.push(hasher.finalize().into());
    }
    for event in events {
        leaves.push(event_leaf(event));
    }
    build_merkle(leaves)
}

fn event_leaf(event: &LedgerEvent) -> [u8; 32] {
    let mut hasher = Sha256::new();
    match event {
        LedgerEvent::AccountOpened {
            seq,
            account,
            opening_balance,
        } => {
            hasher.update(b"open");
            hasher.update(seq.to_le_bytes());
            update_str(&mut hasher, account);
            hasher.update(opening_balance.to_le_bytes());
        }
        LedgerEvent::Transfer {
            seq,
            from,
            to,
            amount,
            memo,
        } => {
            hasher.update(b"xfer");
            hasher.update(seq.to_le_bytes());
            update_str(&mut hasher, from);
            update_str(&mut hasher, to);
            hasher.update(amount.to_le_bytes());
            match memo {
                Some(memo) => {
                    hasher.update([1u8]);
                    update_str(&mut hasher, memo);
                }
                None => hasher.update([0u8]),
            }
        }
    }
    hasher.finalize().into()
}

// length-prefixed so adjacent strings cannot collide
fn update_str(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}

fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"ledger-empty").into();
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity((leaves.len() + 1) / 2);
        for pair in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            match pair {
                [left, right] => {
                    hasher.update(left);
                    hasher.update(right);
                }
                [single] => {
                    hasher.update(single);
                    hasher.update(single);
                }
                _ => {}
            }
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves.pop().unwrap_or_default()
}
