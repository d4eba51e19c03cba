use std::net::{IpAddr, Ipv4Addr};

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tracing::info;

use super::{discount_key, ensure_not_blocked, fresh_id, short_id, user_mut, Shop};
use crate::{
    document::{
        DiscountCode, DiscountLink, DnsAllocation, Document, Item, Status, Transaction,
        TransactionKind, UserId, VpnAllocation,
    },
    error::ShopError,
    ranges::LocationRanges,
};

/// Resolver handed to every WireGuard client ahead of the location's own.
const PRIMARY_DNS: Ipv4Addr = Ipv4Addr::new(78, 157, 42, 100);
/// Prefix of the extra client address added to WireGuard peers.
const CLIENT_IPV4_PREFIX: &str = "10.202.10.";

/// Price of a location after an optional discount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    /// Location key.
    pub location: String,
    /// Applied code in its stored form.
    pub discount_code: Option<String>,
    /// List price.
    pub original: i64,
    /// Amount taken off by the code.
    pub discount: i64,
    /// Amount charged.
    pub total: i64,
}

impl Quote {
    fn link(&self) -> Option<DiscountLink> {
        self.discount_code.as_ref().map(|code| DiscountLink {
            code: code.clone(),
            discount_amount: self.discount,
            original_amount: self.original,
        })
    }
}

/// Outcome of a completed purchase.
#[derive(Debug, Clone, PartialEq)]
pub struct Receipt<A> {
    /// Ledger entry of the purchase.
    pub transaction_id: String,
    /// What was bought.
    pub allocation: A,
    /// Price that was charged.
    pub quote: Quote,
    /// Balance left after the purchase.
    pub balance: i64,
}

impl Shop {
    /// Price `location` with an optional discount code without buying.
    pub fn quote(&self, location: &str, code: Option<&str>) -> Result<Quote, ShopError> {
        let code = code.map(discount_key);
        price(&self.store.read(false), location, code.as_deref(), Utc::now())
    }

    /// Buy a dedicated DNS allocation.
    pub fn purchase_dns(
        &self,
        user: UserId,
        location: &str,
        code: Option<&str>,
    ) -> Result<Receipt<DnsAllocation>, ShopError> {
        let code = code.map(discount_key);
        let ranges = self.ranges.for_location(location);
        self.store.update(|document| {
            let now = Utc::now();
            let quote = prepare(document, user, location, code.as_deref(), now)?;
            let ranges = ranges.ok_or_else(|| ShopError::NoRanges(location.to_string()))?;
            let expiry = expiry_from(document, now)?;
            let allocation = dns_allocation(&ranges, location, now, expiry, &mut rand::thread_rng())?;

            let (transaction_id, balance) = settle(document, user, &quote, Item::Dns, now)?;
            user_mut(document, user)?.dns_configs.push(allocation.clone());
            info!(user, location, total = quote.total, transaction = %transaction_id, "dns purchased");
            Ok(Receipt {
                transaction_id,
                allocation,
                quote,
                balance,
            })
        })
    }

    /// Buy a WireGuard allocation.
    pub fn purchase_vpn(
        &self,
        user: UserId,
        location: &str,
        code: Option<&str>,
    ) -> Result<Receipt<VpnAllocation>, ShopError> {
        let code = code.map(discount_key);
        let ranges = self.ranges.for_location(location);
        self.store.update(|document| {
            let now = Utc::now();
            let quote = prepare(document, user, location, code.as_deref(), now)?;
            let ranges = ranges.ok_or_else(|| ShopError::NoRanges(location.to_string()))?;
            let location_name = document
                .locations
                .get(location)
                .map(|entry| entry.name.clone())
                .unwrap_or_else(|| location.to_string());
            let expiry = expiry_from(document, now)?;
            let allocation = vpn_allocation(
                &ranges,
                location,
                location_name,
                now,
                expiry,
                &mut rand::thread_rng(),
            )?;

            let (transaction_id, balance) = settle(document, user, &quote, Item::Vpn, now)?;
            user_mut(document, user)?
                .wireguard_configs
                .push(allocation.clone());
            info!(user, location, total = quote.total, transaction = %transaction_id, "vpn purchased");
            Ok(Receipt {
                transaction_id,
                allocation,
                quote,
                balance,
            })
        })
    }
}

/// Look up a discount code that is still usable at `now`.
pub(crate) fn usable_discount<'a>(
    document: &'a Document,
    code: &str,
    now: DateTime<Utc>,
) -> Result<&'a DiscountCode, ShopError> {
    let discount = document
        .discount_codes
        .get(code)
        .ok_or_else(|| ShopError::UnknownDiscount(code.to_string()))?;
    if discount.is_expired(now) {
        return Err(ShopError::DiscountExpired(code.to_string()));
    }
    if discount.is_exhausted() {
        return Err(ShopError::DiscountExhausted(code.to_string()));
    }
    Ok(discount)
}

/// Count one use of `code`, if it is set.
pub(crate) fn consume_discount(document: &mut Document, code: Option<&str>) {
    if let Some(discount) = code.and_then(|code| document.discount_codes.get_mut(code)) {
        discount.uses += 1;
    }
}

fn price(
    document: &Document,
    location: &str,
    code: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Quote, ShopError> {
    let entry = document
        .locations
        .get(location)
        .ok_or_else(|| ShopError::UnknownLocation(location.to_string()))?;
    if !entry.enabled {
        return Err(ShopError::LocationDisabled(location.to_string()));
    }

    let discount = match code {
        Some(code) => usable_discount(document, code, now)?.discount_for(entry.price),
        None => 0,
    };
    Ok(Quote {
        location: location.to_string(),
        discount_code: code.map(str::to_string),
        original: entry.price,
        discount,
        total: (entry.price - discount).max(0),
    })
}

fn prepare(
    document: &Document,
    user: UserId,
    location: &str,
    code: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Quote, ShopError> {
    ensure_not_blocked(document, user)?;
    if !document.settings.servers_enabled {
        return Err(ShopError::ServersDisabled);
    }
    price(document, location, code, now)
}

fn expiry_from(
    document: &Document,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ShopError> {
    document
        .settings
        .service_days
        .map(|days| {
            Duration::try_days(i64::from(days))
                .and_then(|period| now.checked_add_signed(period))
                .ok_or(ShopError::Overflow)
        })
        .transpose()
}

/// Charge the user and record the purchase. Returns the transaction id and
/// the remaining balance.
fn settle(
    document: &mut Document,
    user: UserId,
    quote: &Quote,
    item: Item,
    now: DateTime<Utc>,
) -> Result<(String, i64), ShopError> {
    let record = user_mut(document, user)?;
    if record.balance < quote.total {
        return Err(ShopError::InsufficientBalance {
            needed: quote.total,
            available: record.balance,
        });
    }
    record.balance -= quote.total;
    let balance = record.balance;

    consume_discount(document, quote.discount_code.as_deref());
    let transaction_id = fresh_id(&document.transactions, &mut rand::thread_rng());
    document.transactions.insert(
        transaction_id.clone(),
        Transaction {
            user_id: user,
            amount: quote.total,
            kind: TransactionKind::Purchase,
            item: Some(item),
            location: Some(quote.location.clone()),
            status: Status::Completed,
            discount: quote.link(),
            request_id: None,
            timestamp: now,
        },
    );
    Ok((transaction_id, balance))
}

fn dns_allocation<R: Rng + ?Sized>(
    ranges: &LocationRanges,
    location: &str,
    now: DateTime<Utc>,
    expiry: Option<DateTime<Utc>>,
    rng: &mut R,
) -> Result<DnsAllocation, ShopError> {
    let missing = || ShopError::NoRanges(location.to_string());
    Ok(DnsAllocation {
        id: short_id(rng),
        location: location.to_string(),
        ipv4: ranges.random_ipv4(rng).ok_or_else(missing)?,
        ipv6_1: ranges.random_ipv6(rng).ok_or_else(missing)?,
        ipv6_2: ranges.random_ipv6(rng).ok_or_else(missing)?,
        created_at: now,
        expiry_date: expiry,
    })
}

fn vpn_allocation<R: Rng + ?Sized>(
    ranges: &LocationRanges,
    location: &str,
    location_name: String,
    now: DateTime<Utc>,
    expiry: Option<DateTime<Utc>>,
    rng: &mut R,
) -> Result<VpnAllocation, ShopError> {
    let missing = || ShopError::NoRanges(location.to_string());
    let endpoint = ranges.random_ipv4(rng).ok_or_else(missing)?;
    let secondary_v4 = ranges.random_ipv4(rng).ok_or_else(missing)?;
    let secondary_v6 = ranges.random_ipv6(rng).ok_or_else(missing)?;
    let client_v6 = ranges.random_ipv6(rng).ok_or_else(missing)?;

    Ok(VpnAllocation {
        id: short_id(rng),
        location: location.to_string(),
        location_name,
        endpoint,
        client_ipv4: format!("{CLIENT_IPV4_PREFIX}{}/32", rng.gen_range(2..=254)),
        client_ipv6: format!("{client_v6}/64"),
        dns_servers: vec![
            IpAddr::V4(PRIMARY_DNS),
            IpAddr::V4(secondary_v4),
            IpAddr::V6(secondary_v6),
        ],
        created_at: now,
        expiry_date: expiry,
    })
}

#[cfg(test)]
mod tests {
    use super::super::testing::shop_with_user;
    use super::*;
    use crate::{
        document::{DiscountKind, TransactionKind},
        ranges::default_ranges,
    };
    use anyhow::Result;

    #[test]
    fn dns_purchase_debits_and_records() -> Result<()> {
        let (_dir, shop) = shop_with_user(1, 100_000)?;
        let receipt = shop.purchase_dns(1, "germany", None)?;

        assert_eq!(receipt.balance, 30_000);
        assert_eq!(receipt.quote.total, 70_000);
        let table = default_ranges();
        let ranges = &table["germany"];
        assert!(ranges.ipv4[0].contains(receipt.allocation.ipv4));
        assert!(ranges.ipv6[0].contains(receipt.allocation.ipv6_1));
        assert!(receipt.allocation.expiry_date.is_some());

        let document = shop.snapshot();
        let user = document.user(1).expect("user");
        assert_eq!(user.dns_configs, vec![receipt.allocation.clone()]);
        let transaction = &document.transactions[&receipt.transaction_id];
        assert_eq!(transaction.kind, TransactionKind::Purchase);
        assert_eq!(transaction.item, Some(Item::Dns));
        assert_eq!(transaction.status, Status::Completed);
        assert_eq!(transaction.amount, 70_000);
        Ok(())
    }

    #[test]
    fn vpn_purchase_builds_peer() -> Result<()> {
        let (_dir, shop) = shop_with_user(1, 70_000)?;
        let receipt = shop.purchase_vpn(1, "france", None)?;
        let peer = &receipt.allocation;

        assert_eq!(receipt.balance, 0);
        assert!(peer.location_name.contains("France"));
        assert!(peer.client_ipv4.starts_with(CLIENT_IPV4_PREFIX));
        assert!(peer.client_ipv4.ends_with("/32"));
        assert!(peer.client_ipv6.ends_with("/64"));
        assert_eq!(peer.dns_servers[0], IpAddr::V4(PRIMARY_DNS));
        assert_eq!(peer.dns_servers.len(), 3);
        assert_eq!(shop.snapshot().user(1).map(|u| u.wireguard_configs.len()), Some(1));
        Ok(())
    }

    #[test]
    fn insufficient_balance_changes_nothing() -> Result<()> {
        let (_dir, shop) = shop_with_user(1, 69_999)?;
        let before = shop.snapshot();
        let err = shop.purchase_dns(1, "uae", None).unwrap_err();
        assert!(matches!(err, ShopError::InsufficientBalance { needed: 70_000, .. }));

        let after = shop.store().read(true);
        assert_eq!(after, before);
        Ok(())
    }

    #[test]
    fn discount_is_applied_and_counted() -> Result<()> {
        let (_dir, shop) = shop_with_user(1, 70_000)?;
        shop.create_discount("HALF", DiscountKind::Percentage, 50, None, Some(1))?;

        let quote = shop.quote("russia", Some("HALF"))?;
        assert_eq!((quote.original, quote.discount, quote.total), (70_000, 35_000, 35_000));

        let receipt = shop.purchase_dns(1, "russia", Some("HALF"))?;
        assert_eq!(receipt.balance, 35_000);
        let document = shop.snapshot();
        assert_eq!(document.discount_codes["HALF"].uses, 1);
        let link = document.transactions[&receipt.transaction_id]
            .discount
            .clone()
            .expect("discount recorded");
        assert_eq!(link.discount_amount, 35_000);

        assert!(matches!(
            shop.purchase_dns(1, "russia", Some("HALF")),
            Err(ShopError::DiscountExhausted(_))
        ));
        Ok(())
    }

    #[test]
    fn codes_match_regardless_of_case() -> Result<()> {
        let (_dir, shop) = shop_with_user(1, 70_000)?;
        shop.create_discount("spring", DiscountKind::Percentage, 10, None, None)?;

        let quote = shop.quote("germany", Some("spring"))?;
        assert_eq!(quote.discount, 7_000);
        assert_eq!(quote.discount_code.as_deref(), Some("SPRING"));

        let receipt = shop.purchase_dns(1, "germany", Some(" Spring "))?;
        assert_eq!(receipt.balance, 7_000);
        let document = shop.snapshot();
        assert_eq!(document.discount_codes["SPRING"].uses, 1);
        let link = document.transactions[&receipt.transaction_id]
            .discount
            .clone()
            .expect("discount recorded");
        assert_eq!(link.code, "SPRING");

        shop.delete_discount("spring")?;
        assert!(shop.snapshot().discount_codes.is_empty());
        Ok(())
    }

    #[test]
    fn oversized_service_period_is_refused() -> Result<()> {
        let (_dir, shop) = shop_with_user(1, 70_000)?;
        shop.set_service_days(Some(u32::MAX))?;
        assert!(matches!(
            shop.purchase_dns(1, "germany", None),
            Err(ShopError::Overflow)
        ));
        assert_eq!(shop.user(1).map(|user| user.balance), Some(70_000));
        Ok(())
    }

    #[test]
    fn expired_and_unknown_codes_are_refused() -> Result<()> {
        let (_dir, shop) = shop_with_user(1, 70_000)?;
        let yesterday = Utc::now() - Duration::days(1);
        shop.create_discount("OLD", DiscountKind::Fixed, 1_000, Some(yesterday), None)?;

        assert!(matches!(
            shop.quote("germany", Some("OLD")),
            Err(ShopError::DiscountExpired(_))
        ));
        assert!(matches!(
            shop.purchase_vpn(1, "germany", Some("NOPE")),
            Err(ShopError::UnknownDiscount(_))
        ));
        Ok(())
    }

    #[test]
    fn closed_shop_and_locations_refuse_sales() -> Result<()> {
        let (_dir, shop) = shop_with_user(1, 500_000)?;
        assert!(matches!(
            shop.purchase_dns(1, "mars", None),
            Err(ShopError::UnknownLocation(_))
        ));

        shop.set_location_enabled("uae", false)?;
        assert!(matches!(
            shop.purchase_dns(1, "uae", None),
            Err(ShopError::LocationDisabled(_))
        ));

        shop.upsert_location("Japan", "🇯🇵 Japan", 50_000)?;
        assert!(matches!(
            shop.purchase_dns(1, "japan", None),
            Err(ShopError::NoRanges(_))
        ));

        shop.set_servers_enabled(false)?;
        assert!(matches!(
            shop.purchase_vpn(1, "germany", None),
            Err(ShopError::ServersDisabled)
        ));

        shop.set_servers_enabled(true)?;
        shop.block_user(1)?;
        assert!(matches!(
            shop.purchase_vpn(1, "germany", None),
            Err(ShopError::Blocked(1))
        ));
        Ok(())
    }
}
