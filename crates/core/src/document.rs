//! Schema of the root document persisted by the store.
//!
//! Every piece of shop state lives in a single [`Document`]. Missing keys are
//! filled from the default skeleton during deserialisation, and documents
//! written by older schema versions are upgraded once by [`Document::migrate`].

#![allow(missing_docs)]

use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Schema version stamped into freshly created and migrated documents.
pub const SCHEMA_VERSION: u32 = 2;

/// Telegram user identifier.
pub type UserId = i64;

/// Referral code handed out to a user.
pub fn referral_code(user: impl std::fmt::Display) -> String {
    format!("REF{user}")
}

/// Root document holding all persistent shop state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Document {
    /// Version of the layout this document was written with.
    #[serde(default = "legacy_schema")]
    pub schema_version: u32,
    /// Counter bumped on every serialised update.
    pub revision: u64,
    /// Registered users keyed by their stringified id.
    pub users: BTreeMap<String, UserRecord>,
    /// Ids allowed to use the admin panel.
    pub admins: Vec<UserId>,
    /// Top-up receipts awaiting or past review.
    pub payment_requests: BTreeMap<String, PaymentRequest>,
    /// Global shop settings.
    pub settings: Settings,
    /// Sellable locations keyed by slug.
    pub locations: BTreeMap<String, Location>,
    /// Files uploaded through the admin panel.
    pub uploaded_files: BTreeMap<String, UploadedFile>,
    /// Tutorial categories referencing uploaded files.
    pub tutorials: BTreeMap<String, TutorialCategory>,
    /// Discount codes keyed by code.
    pub discount_codes: BTreeMap<String, DiscountCode>,
    /// Support tickets.
    pub tickets: BTreeMap<String, Ticket>,
    /// Ledger of deposits and purchases.
    pub transactions: BTreeMap<String, Transaction>,
    /// Broadcasts sent to all users.
    pub broadcast_messages: Vec<Broadcast>,
    /// Users barred from interacting with the shop.
    pub blocked_users: Vec<UserId>,
}

fn legacy_schema() -> u32 {
    1
}

impl Default for Document {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            revision: 0,
            users: BTreeMap::new(),
            admins: Vec::new(),
            payment_requests: BTreeMap::new(),
            settings: Settings::default(),
            locations: default_locations(),
            uploaded_files: BTreeMap::new(),
            tutorials: default_tutorials(),
            discount_codes: BTreeMap::new(),
            tickets: BTreeMap::new(),
            transactions: BTreeMap::new(),
            broadcast_messages: Vec::new(),
            blocked_users: Vec::new(),
        }
    }
}

impl Document {
    /// Default skeleton seeded with the given admin ids.
    pub fn with_admins(admins: impl IntoIterator<Item = UserId>) -> Self {
        let mut document = Self::default();
        for admin in admins {
            if !document.admins.contains(&admin) {
                document.admins.push(admin);
            }
        }
        document
    }

    /// Upgrade a document written by an older schema. Returns `true` when
    /// anything changed and the document should be persisted again.
    pub fn migrate(&mut self) -> bool {
        if self.schema_version >= SCHEMA_VERSION {
            return false;
        }

        for (key, category) in default_tutorials() {
            self.tutorials.entry(key).or_insert(category);
        }
        for (id, user) in self.users.iter_mut() {
            if user.referral_code.is_empty() {
                user.referral_code = referral_code(id);
            }
        }
        self.schema_version = SCHEMA_VERSION;
        true
    }

    /// Look up a user by id.
    pub fn user(&self, id: UserId) -> Option<&UserRecord> {
        self.users.get(&id.to_string())
    }

    /// Mutable lookup of a user by id.
    pub fn user_mut(&mut self, id: UserId) -> Option<&mut UserRecord> {
        self.users.get_mut(&id.to_string())
    }

    /// Whether the id belongs to an admin.
    pub fn is_admin(&self, id: UserId) -> bool {
        self.admins.contains(&id)
    }

    /// Whether the id has been blocked.
    pub fn is_blocked(&self, id: UserId) -> bool {
        self.blocked_users.contains(&id)
    }
}

fn default_locations() -> BTreeMap<String, Location> {
    [
        ("germany", "🇩🇪 Germany"),
        ("uae", "🇦🇪 UAE"),
        ("russia", "🇷🇺 Russia"),
        ("france", "🇫🇷 France"),
    ]
    .into_iter()
    .map(|(key, name)| {
        (
            key.to_string(),
            Location {
                name: name.to_string(),
                price: 70_000,
                enabled: true,
            },
        )
    })
    .collect()
}

fn default_tutorials() -> BTreeMap<String, TutorialCategory> {
    [
        ("dns_usage", "📘 DNS tutorial"),
        ("vpn_usage", "📗 WireGuard tutorial"),
        ("panel_usage", "🖥️ Panel tutorial"),
        ("general", "📚 General tutorial"),
    ]
    .into_iter()
    .map(|(key, title)| {
        (
            key.to_string(),
            TutorialCategory {
                title: title.to_string(),
                files: Vec::new(),
            },
        )
    })
    .collect()
}

/// Account state for a single user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserRecord {
    /// Telegram username, if any.
    pub username: Option<String>,
    /// Telegram first name, if any.
    pub first_name: Option<String>,
    /// Spendable balance in tomans.
    pub balance: i64,
    /// Purchased DNS allocations in purchase order.
    pub dns_configs: Vec<DnsAllocation>,
    /// Purchased WireGuard allocations in purchase order.
    pub wireguard_configs: Vec<VpnAllocation>,
    /// Code other users redeem to credit this user.
    pub referral_code: String,
    /// Ids of users invited by this user.
    pub referrals: Vec<String>,
    /// Id of the user who invited this one.
    pub invited_by: Option<String>,
    /// Registration time.
    pub join_date: DateTime<Utc>,
}

/// Dedicated DNS endpoint sold to a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsAllocation {
    pub id: String,
    pub location: String,
    pub ipv4: Ipv4Addr,
    pub ipv6_1: Ipv6Addr,
    pub ipv6_2: Ipv6Addr,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<DateTime<Utc>>,
}

/// WireGuard peer parameters sold to a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VpnAllocation {
    pub id: String,
    pub location: String,
    pub location_name: String,
    pub endpoint: Ipv4Addr,
    pub client_ipv4: String,
    pub client_ipv6: String,
    pub dns_servers: Vec<IpAddr>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<DateTime<Utc>>,
}

/// A sellable location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Display name including flag.
    pub name: String,
    /// Price in tomans.
    pub price: i64,
    /// Whether the location is offered.
    pub enabled: bool,
}

/// Global shop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Card number shown to users topping up.
    pub payment_card: String,
    /// Master switch for purchases.
    pub servers_enabled: bool,
    /// Amount credited to a referrer per invited user.
    pub referral_reward: i64,
    /// Validity of purchased allocations; `None` never expires.
    pub service_days: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            payment_card: "0000-0000-0000-0000".to_string(),
            servers_enabled: true,
            referral_reward: 2_000,
            service_days: Some(30),
        }
    }
}

/// Lifecycle of payment requests and ledger entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Approved,
    Rejected,
    Completed,
}

/// What a ledger entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Deposit,
    Purchase,
}

/// Product line of a purchase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Item {
    Dns,
    Vpn,
}

/// Discount applied to a payment or purchase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscountLink {
    pub code: String,
    pub discount_amount: i64,
    pub original_amount: i64,
}

/// Ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub user_id: UserId,
    pub amount: i64,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<Item>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount: Option<DiscountLink>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Receipt submitted by a user to top up their balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub user_id: UserId,
    /// Amount the user actually paid.
    pub amount: i64,
    /// Amount credited on approval.
    pub original_amount: i64,
    /// Telegram file id of the receipt photo.
    pub photo_id: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount: Option<DiscountLink>,
    pub transaction_id: String,
    pub timestamp: DateTime<Utc>,
}

/// How a discount code reduces a price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscountKind {
    Percentage,
    Fixed,
}

/// Discount code definition and usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscountCode {
    #[serde(rename = "type")]
    pub kind: DiscountKind,
    pub value: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub uses: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_uses: Option<u32>,
}

impl DiscountCode {
    /// Amount taken off `price`, never more than the price itself.
    pub fn discount_for(&self, price: i64) -> i64 {
        let cap = price.max(0);
        let amount = match self.kind {
            DiscountKind::Percentage => i128::from(price) * i128::from(self.value) / 100,
            DiscountKind::Fixed => i128::from(self.value),
        };
        i64::try_from(amount.clamp(0, i128::from(cap))).unwrap_or(cap)
    }

    /// Whether the expiry has passed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| now > expiry)
    }

    /// Whether the usage limit has been reached.
    pub fn is_exhausted(&self) -> bool {
        self.max_uses.is_some_and(|max| self.uses >= max)
    }
}

/// State of a support ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    Open,
    Answered,
    Closed,
}

/// Author of a ticket message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Admin,
}

/// Message within a ticket thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketMessage {
    pub sender: Sender,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Support ticket opened by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub user_id: UserId,
    pub subject: String,
    pub status: TicketStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<TicketMessage>,
}

/// Tutorial category shown to users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TutorialCategory {
    pub title: String,
    #[serde(default)]
    pub files: Vec<String>,
}

/// Media type of an uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Photo,
    Video,
    Document,
    ExternalUrl,
}

/// File uploaded by an admin, referenced by Telegram file id or URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub title: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub file_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaced_at: Option<DateTime<Utc>>,
}

/// Broadcast sent to every user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Broadcast {
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_skeleton_has_catalog_and_no_users() {
        let document = Document::default();
        assert!(document.users.is_empty());
        assert_eq!(document.locations.len(), 4);
        assert!(document.locations.values().all(|l| l.enabled && l.price == 70_000));
        assert_eq!(document.tutorials.len(), 4);
        assert_eq!(document.settings.referral_reward, 2_000);
        assert_eq!(document.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn legacy_document_is_filled_and_migrated() -> anyhow::Result<()> {
        let raw = json!({
            "users": {
                "42": { "balance": 500 }
            },
            "tutorials": {
                "general": { "title": "Custom", "files": ["abc"] }
            }
        });
        let mut document: Document = serde_json::from_value(raw)?;
        assert_eq!(document.schema_version, 1);
        assert!(document.migrate());

        assert_eq!(document.schema_version, SCHEMA_VERSION);
        assert_eq!(document.tutorials.len(), 4);
        assert_eq!(document.tutorials["general"].title, "Custom");
        let user = document.user(42).expect("user present");
        assert_eq!(user.balance, 500);
        assert_eq!(user.referral_code, referral_code(42));
        assert_eq!(user.referral_code, "REF42");
        assert!(!document.migrate());
        Ok(())
    }

    #[test]
    fn percentage_discount_floors_and_caps() {
        let code = DiscountCode {
            kind: DiscountKind::Percentage,
            value: 15,
            expires_at: None,
            uses: 0,
            max_uses: Some(1),
        };
        assert_eq!(code.discount_for(70_001), 10_500);
        assert!(!code.is_exhausted());

        let fixed = DiscountCode {
            kind: DiscountKind::Fixed,
            value: 90_000,
            ..code
        };
        assert_eq!(fixed.discount_for(70_000), 70_000);
    }

    #[test]
    fn huge_prices_and_values_stay_in_range() {
        let half = DiscountCode {
            kind: DiscountKind::Percentage,
            value: 50,
            expires_at: None,
            uses: 0,
            max_uses: None,
        };
        assert_eq!(half.discount_for(i64::MAX), i64::MAX / 2);

        let absurd = DiscountCode {
            value: i64::MAX,
            ..half
        };
        assert_eq!(absurd.discount_for(1_000), 1_000);
        assert_eq!(absurd.discount_for(-5), 0);
    }
}
