use std::{sync::Arc, thread};

use anyhow::Result;
use tempfile::tempdir;
use vpnshop_core::{document::Status, AppConfig, Shop, ShopError};

fn config_in(dir: &std::path::Path) -> AppConfig {
    AppConfig {
        data_file: dir.join("bot_data.json"),
        ranges_file: dir.join("dns_ranges.json"),
        freshness_secs: 30,
        log_dir: dir.join("logs"),
        admins: vec![99],
    }
}

#[test]
fn top_up_then_buy_then_reload() -> Result<()> {
    let dir = tempdir()?;
    let config = config_in(dir.path());
    let shop = Shop::from_config(&config);
    assert!(shop.is_admin(99));

    shop.register_user(1, Some("buyer"), None)?;
    let ticket = shop.submit_payment(1, 70_000, "receipt", None)?;
    assert_eq!(shop.approve_payment(&ticket.request_id)?, 70_000);
    let receipt = shop.purchase_vpn(1, "germany", None)?;
    assert_eq!(receipt.balance, 0);
    assert!(matches!(
        shop.purchase_dns(1, "germany", None),
        Err(ShopError::InsufficientBalance { .. })
    ));

    // A second process sees the same state through the files alone.
    let reopened = Shop::from_config(&config);
    let history = reopened.purchase_history(1)?;
    assert_eq!(history.vpn, vec![receipt.allocation]);
    assert_eq!(history.transactions.len(), 2);
    assert!(history
        .transactions
        .iter()
        .any(|(_, transaction)| transaction.status == Status::Approved));
    assert!(dir.path().join("dns_ranges.json").exists());
    Ok(())
}

#[test]
fn concurrent_credits_all_land() -> Result<()> {
    let dir = tempdir()?;
    let shop = Arc::new(Shop::from_config(&config_in(dir.path())));
    shop.register_user(1, None, None)?;

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let shop = Arc::clone(&shop);
            thread::spawn(move || -> Result<(), ShopError> {
                for _ in 0..5 {
                    shop.credit(1, 10)?;
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("credit thread")?;
    }

    assert_eq!(shop.user(1).map(|user| user.balance), Some(500));
    assert_eq!(shop.store().read(true).revision, 51);
    Ok(())
}
