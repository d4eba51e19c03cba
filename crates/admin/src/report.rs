//! Plain-text rendering of shop reports.

use vpnshop_core::{
    document::PaymentRequest,
    ranges::RangeTable,
    shop::{ExpiringAllocation, PurchaseHistory, Summary},
};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M";

pub fn summary(summary: &Summary) {
    println!("users:             {}", summary.users);
    println!("total balance:     {}", summary.total_balance);
    println!("pending payments:  {}", summary.pending_payments);
    println!("open tickets:      {}", summary.open_tickets);
    println!("enabled locations: {}", summary.enabled_locations);
    println!("revision:          {}", summary.revision);
}

pub fn pending(requests: &[(String, PaymentRequest)]) {
    if requests.is_empty() {
        println!("no pending payments");
        return;
    }
    for (id, request) in requests {
        let discount = request
            .discount
            .as_ref()
            .map(|link| format!(" (code {}, -{})", link.code, link.discount_amount))
            .unwrap_or_default();
        println!(
            "{id}  user {:<12} paid {:<8} credit {:<8} {}{discount}",
            request.user_id,
            request.amount,
            request.original_amount,
            request.timestamp.format(TIME_FORMAT),
        );
    }
}

pub fn history(history: &PurchaseHistory) {
    println!("DNS allocations:");
    for dns in &history.dns {
        println!(
            "  {} {:<8} {} {} {}  expires {}",
            dns.id,
            dns.location,
            dns.ipv4,
            dns.ipv6_1,
            dns.ipv6_2,
            expiry(dns.expiry_date),
        );
    }
    println!("WireGuard peers:");
    for vpn in &history.vpn {
        println!(
            "  {} {:<8} endpoint {} client {} {}  expires {}",
            vpn.id,
            vpn.location,
            vpn.endpoint,
            vpn.client_ipv4,
            vpn.client_ipv6,
            expiry(vpn.expiry_date),
        );
    }
    println!("Transactions:");
    for (id, transaction) in &history.transactions {
        println!(
            "  {id} {:?} {:?} {} {}",
            transaction.kind,
            transaction.status,
            transaction.amount,
            transaction.timestamp.format(TIME_FORMAT),
        );
    }
}

pub fn expiring(allocations: &[ExpiringAllocation]) {
    if allocations.is_empty() {
        println!("nothing expires in the window");
        return;
    }
    for allocation in allocations {
        println!(
            "user {:<12} {:?} {} {:<8} {} day(s) left ({})",
            allocation.user_id,
            allocation.item,
            allocation.allocation_id,
            allocation.location,
            allocation.days_left,
            allocation.expires_at.format(TIME_FORMAT),
        );
    }
}

pub fn ranges(table: &RangeTable) {
    for (location, ranges) in table {
        println!("{location}:");
        for cidr in &ranges.ipv4 {
            println!("  {cidr}");
        }
        for cidr in &ranges.ipv6 {
            println!("  {cidr}");
        }
    }
}

fn expiry(date: Option<chrono::DateTime<chrono::Utc>>) -> String {
    date.map(|date| date.format(TIME_FORMAT).to_string())
        .unwrap_or_else(|| "never".to_string())
}
