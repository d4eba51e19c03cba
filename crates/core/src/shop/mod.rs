//! Named shop operations over the snapshot store.
//!
//! Every mutating operation runs as a single [`SnapshotStore::update`]
//! transaction: the document is re-read under the store's writer lock,
//! validated and changed, then written back. A [`ShopError`] aborts the
//! operation before anything reaches disk.

mod catalog;
mod payments;
mod purchase;
mod reports;
mod tickets;
mod users;

use std::{collections::BTreeMap, sync::Arc};

use rand::Rng;

use crate::{
    config::AppConfig,
    document::{Document, UserId, UserRecord},
    error::ShopError,
    ranges::NetworkRanges,
    store::SnapshotStore,
};

pub use catalog::FileEdit;
pub use payments::PaymentTicket;
pub use purchase::{Quote, Receipt};
pub use reports::{ExpiringAllocation, PurchaseHistory, Summary};

const ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const ID_LEN: usize = 8;

/// Entry point for every state-changing shop action.
#[derive(Clone)]
pub struct Shop {
    store: Arc<SnapshotStore>,
    ranges: NetworkRanges,
}

impl Shop {
    /// Wrap an existing store and range table.
    pub fn new(store: Arc<SnapshotStore>, ranges: NetworkRanges) -> Self {
        Self { store, ranges }
    }

    /// Build the store and range table described by `config`.
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            Arc::new(SnapshotStore::from_config(config)),
            NetworkRanges::new(&config.ranges_file),
        )
    }

    /// Underlying store, for read-only consumers such as menu rendering.
    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    /// Network range table used for allocations.
    pub fn ranges(&self) -> &NetworkRanges {
        &self.ranges
    }

    /// Current document, possibly served from cache.
    pub fn snapshot(&self) -> Document {
        self.store.read(false)
    }
}

/// Random identifier not yet used as a key of `existing`.
pub(crate) fn fresh_id<V, R: Rng + ?Sized>(existing: &BTreeMap<String, V>, rng: &mut R) -> String {
    loop {
        let id = short_id(rng);
        if !existing.contains_key(&id) {
            return id;
        }
    }
}

pub(crate) fn short_id<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..ID_LEN)
        .map(|_| char::from(ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())]))
        .collect()
}

/// Canonical form of a discount code as typed by a user or operator.
pub(crate) fn discount_key(code: &str) -> String {
    code.trim().to_uppercase()
}

pub(crate) fn user_mut(document: &mut Document, id: UserId) -> Result<&mut UserRecord, ShopError> {
    document
        .user_mut(id)
        .ok_or_else(|| ShopError::UnknownUser(id.to_string()))
}

pub(crate) fn ensure_not_blocked(document: &Document, id: UserId) -> Result<(), ShopError> {
    if document.is_blocked(id) {
        return Err(ShopError::Blocked(id));
    }
    Ok(())
}

pub(crate) fn ensure_positive(amount: i64) -> Result<(), ShopError> {
    if amount <= 0 {
        return Err(ShopError::InvalidAmount(amount));
    }
    Ok(())
}

/// Add `amount` to `balance`, refusing results that do not fit.
pub(crate) fn add_to_balance(balance: &mut i64, amount: i64) -> Result<i64, ShopError> {
    *balance = balance.checked_add(amount).ok_or(ShopError::Overflow)?;
    Ok(*balance)
}
