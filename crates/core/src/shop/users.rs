use chrono::Utc;
use tracing::info;

use super::{add_to_balance, ensure_positive, user_mut, Shop};
use crate::{
    document::{referral_code, UserId, UserRecord},
    error::ShopError,
};

impl Shop {
    /// Register a user on first contact. Existing users are returned as-is.
    pub fn register_user(
        &self,
        id: UserId,
        username: Option<&str>,
        first_name: Option<&str>,
    ) -> Result<UserRecord, ShopError> {
        if let Some(existing) = self.store.read(false).user(id) {
            return Ok(existing.clone());
        }

        self.store.update(|document| {
            let record = document
                .users
                .entry(id.to_string())
                .or_insert_with(|| {
                    info!(user = id, "user registered");
                    UserRecord {
                        username: username.map(str::to_string),
                        first_name: first_name.map(str::to_string),
                        referral_code: referral_code(id),
                        join_date: Utc::now(),
                        ..UserRecord::default()
                    }
                });
            Ok(record.clone())
        })
    }

    /// Look up a user.
    pub fn user(&self, id: UserId) -> Option<UserRecord> {
        self.store.read(false).user(id).cloned()
    }

    /// Add `amount` to a user's balance, returning the new balance.
    pub fn credit(&self, id: UserId, amount: i64) -> Result<i64, ShopError> {
        ensure_positive(amount)?;
        self.store.update(|document| {
            let balance = add_to_balance(&mut user_mut(document, id)?.balance, amount)?;
            info!(user = id, amount, balance, "balance credited");
            Ok(balance)
        })
    }

    /// Take `amount` from a user's balance, refusing to go below zero.
    pub fn debit(&self, id: UserId, amount: i64) -> Result<i64, ShopError> {
        ensure_positive(amount)?;
        self.store.update(|document| {
            let user = user_mut(document, id)?;
            if user.balance < amount {
                return Err(ShopError::InsufficientBalance {
                    needed: amount,
                    available: user.balance,
                });
            }
            user.balance -= amount;
            info!(user = id, amount, balance = user.balance, "balance debited");
            Ok(user.balance)
        })
    }

    /// Whether `id` may use the admin panel.
    pub fn is_admin(&self, id: UserId) -> bool {
        self.store.read(false).is_admin(id)
    }

    /// Grant admin rights. Returns `false` if `id` already had them.
    pub fn add_admin(&self, id: UserId) -> Result<bool, ShopError> {
        if self.is_admin(id) {
            return Ok(false);
        }
        self.store.update(|document| {
            if document.admins.contains(&id) {
                return Ok(false);
            }
            document.admins.push(id);
            info!(user = id, "admin added");
            Ok(true)
        })
    }

    /// Revoke admin rights. Returns `false` if `id` was not an admin.
    pub fn remove_admin(&self, id: UserId) -> Result<bool, ShopError> {
        if !self.is_admin(id) {
            return Ok(false);
        }
        self.store.update(|document| {
            let before = document.admins.len();
            document.admins.retain(|admin| *admin != id);
            Ok(document.admins.len() != before)
        })
    }

    /// Whether `id` has been blocked.
    pub fn is_blocked(&self, id: UserId) -> bool {
        self.store.read(false).is_blocked(id)
    }

    /// Block a user. Returns `false` if they were already blocked.
    pub fn block_user(&self, id: UserId) -> Result<bool, ShopError> {
        if self.is_blocked(id) {
            return Ok(false);
        }
        self.store.update(|document| {
            if document.blocked_users.contains(&id) {
                return Ok(false);
            }
            document.blocked_users.push(id);
            info!(user = id, "user blocked");
            Ok(true)
        })
    }

    /// Lift a block. Returns `false` if the user was not blocked.
    pub fn unblock_user(&self, id: UserId) -> Result<bool, ShopError> {
        if !self.is_blocked(id) {
            return Ok(false);
        }
        self.store.update(|document| {
            let before = document.blocked_users.len();
            document.blocked_users.retain(|blocked| *blocked != id);
            Ok(document.blocked_users.len() != before)
        })
    }

    /// Record that `id` joined through `code` and reward the referrer.
    /// A user can be referred once, never by themselves. Returns the
    /// referrer's id.
    pub fn apply_referral(&self, id: UserId, code: &str) -> Result<String, ShopError> {
        let invalid = || ShopError::InvalidReferral(code.to_string());
        if !code.starts_with("REF") {
            return Err(invalid());
        }

        self.store.update(|document| {
            let invitee = user_mut(document, id)?;
            if invitee.invited_by.is_some() {
                return Err(ShopError::AlreadyReferred(id));
            }
            if invitee.referral_code == code {
                return Err(invalid());
            }

            let invitee_key = id.to_string();
            let reward = document.settings.referral_reward;
            let (referrer_key, referrer) = document
                .users
                .iter_mut()
                .find(|(key, user)| user.referral_code == code && **key != invitee_key)
                .ok_or_else(invalid)?;
            let referrer_key = referrer_key.clone();
            add_to_balance(&mut referrer.balance, reward)?;
            referrer.referrals.push(invitee_key);

            user_mut(document, id)?.invited_by = Some(referrer_key.clone());
            info!(user = id, referrer = %referrer_key, reward, "referral applied");
            Ok(referrer_key)
        })
    }
}
