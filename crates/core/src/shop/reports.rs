use chrono::{DateTime, Utc};

use super::Shop;
use crate::{
    document::{
        DnsAllocation, Item, Status, TicketStatus, Transaction, UserId, VpnAllocation,
    },
    error::ShopError,
};

/// Everything a user has bought, plus their ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct PurchaseHistory {
    /// DNS allocations in purchase order.
    pub dns: Vec<DnsAllocation>,
    /// WireGuard peers in purchase order.
    pub vpn: Vec<VpnAllocation>,
    /// Newest first.
    pub transactions: Vec<(String, Transaction)>,
}

/// Allocation whose service period ends soon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiringAllocation {
    /// Owner of the allocation.
    pub user_id: String,
    /// DNS or WireGuard.
    pub item: Item,
    /// Location key.
    pub location: String,
    /// Id of the allocation within the user record.
    pub allocation_id: String,
    /// End of the service period.
    pub expires_at: DateTime<Utc>,
    /// Whole days left, rounded down.
    pub days_left: i64,
}

/// Counters for the admin dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    /// Registered users.
    pub users: usize,
    /// Sum of all balances, saturating at `i64::MAX`.
    pub total_balance: i64,
    /// Receipts awaiting review.
    pub pending_payments: usize,
    /// Tickets waiting on an admin.
    pub open_tickets: usize,
    /// Locations currently on sale.
    pub enabled_locations: usize,
    /// Revision of the document the counters were taken from.
    pub revision: u64,
}

impl Shop {
    /// Allocations and ledger entries of one user.
    pub fn purchase_history(&self, user: UserId) -> Result<PurchaseHistory, ShopError> {
        let document = self.store.read(false);
        let record = document
            .user(user)
            .ok_or_else(|| ShopError::UnknownUser(user.to_string()))?;

        let mut transactions: Vec<_> = document
            .transactions
            .iter()
            .filter(|(_, transaction)| transaction.user_id == user)
            .map(|(id, transaction)| (id.clone(), transaction.clone()))
            .collect();
        transactions.sort_by(|(_, a), (_, b)| b.timestamp.cmp(&a.timestamp));

        Ok(PurchaseHistory {
            dns: record.dns_configs.clone(),
            vpn: record.wireguard_configs.clone(),
            transactions,
        })
    }

    /// Allocations expiring within `days` of `now`, soonest first. Already
    /// expired allocations are left out.
    pub fn expiring_allocations(&self, now: DateTime<Utc>, days: i64) -> Vec<ExpiringAllocation> {
        let document = self.store.read(false);
        let mut expiring = Vec::new();

        for (user_id, record) in &document.users {
            let dns = record.dns_configs.iter().map(|allocation| {
                (Item::Dns, &allocation.id, &allocation.location, allocation.expiry_date)
            });
            let vpn = record.wireguard_configs.iter().map(|allocation| {
                (Item::Vpn, &allocation.id, &allocation.location, allocation.expiry_date)
            });

            for (item, id, location, expiry) in dns.chain(vpn) {
                let Some(expires_at) = expiry else { continue };
                if expires_at < now {
                    continue;
                }
                let days_left = (expires_at - now).num_days();
                if days_left <= days {
                    expiring.push(ExpiringAllocation {
                        user_id: user_id.clone(),
                        item,
                        location: location.clone(),
                        allocation_id: id.clone(),
                        expires_at,
                        days_left,
                    });
                }
            }
        }

        expiring.sort_by_key(|allocation| allocation.expires_at);
        expiring
    }

    /// Dashboard counters from the current document.
    pub fn summary(&self) -> Summary {
        let document = self.store.read(false);
        Summary {
            users: document.users.len(),
            total_balance: document
                .users
                .values()
                .fold(0i64, |total, user| total.saturating_add(user.balance)),
            pending_payments: document
                .payment_requests
                .values()
                .filter(|request| request.status == Status::Pending)
                .count(),
            open_tickets: document
                .tickets
                .values()
                .filter(|ticket| ticket.status == TicketStatus::Open)
                .count(),
            enabled_locations: document
                .locations
                .values()
                .filter(|location| location.enabled)
                .count(),
            revision: document.revision,
        }
    }
}
