use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use super::{discount_key, ensure_positive, Shop};
use crate::{
    document::{
        Broadcast, DiscountCode, DiscountKind, Document, FileKind, Location, UploadedFile, UserId,
    },
    error::ShopError,
};

const FILE_ID_LEN: usize = 8;

/// Metadata changes for an uploaded file. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileEdit {
    /// New title.
    pub title: Option<String>,
    /// `Some("")` clears the caption.
    pub caption: Option<String>,
}

/// Locations and settings.
impl Shop {
    /// Add a location or update an existing one. The key is derived from
    /// `key_source`: lowercased, with spaces turned into underscores.
    pub fn upsert_location(
        &self,
        key_source: &str,
        name: &str,
        price: i64,
    ) -> Result<String, ShopError> {
        if price < 0 {
            return Err(ShopError::InvalidAmount(price));
        }
        let key = location_key(key_source);
        self.store.update(|document| {
            document
                .locations
                .entry(key.clone())
                .and_modify(|location| {
                    location.name = name.to_string();
                    location.price = price;
                })
                .or_insert_with(|| Location {
                    name: name.to_string(),
                    price,
                    enabled: true,
                });
            info!(location = %key, price, "location saved");
            Ok(key.clone())
        })
    }

    /// Enable or disable sales in a location.
    pub fn set_location_enabled(&self, key: &str, enabled: bool) -> Result<(), ShopError> {
        self.store.update(|document| {
            location_mut(document, key)?.enabled = enabled;
            info!(location = key, enabled, "location toggled");
            Ok(())
        })
    }

    /// Flip a location's enabled flag, returning the new state.
    pub fn toggle_location(&self, key: &str) -> Result<bool, ShopError> {
        self.store.update(|document| {
            let location = location_mut(document, key)?;
            location.enabled = !location.enabled;
            info!(location = key, enabled = location.enabled, "location toggled");
            Ok(location.enabled)
        })
    }

    /// Change the price of a location.
    pub fn set_location_price(&self, key: &str, price: i64) -> Result<(), ShopError> {
        ensure_positive(price)?;
        self.store.update(|document| {
            location_mut(document, key)?.price = price;
            info!(location = key, price, "location repriced");
            Ok(())
        })
    }

    /// Open or close the whole shop.
    pub fn set_servers_enabled(&self, enabled: bool) -> Result<(), ShopError> {
        self.store.update(|document| {
            document.settings.servers_enabled = enabled;
            info!(enabled, "sales switched");
            Ok(())
        })
    }

    /// Balance credited to a referrer for each invited user.
    pub fn set_referral_reward(&self, reward: i64) -> Result<(), ShopError> {
        if reward < 0 {
            return Err(ShopError::InvalidAmount(reward));
        }
        self.store.update(|document| {
            document.settings.referral_reward = reward;
            Ok(())
        })
    }

    /// Card number shown on top-up instructions.
    pub fn set_payment_card(&self, card: &str) -> Result<(), ShopError> {
        self.store.update(|document| {
            document.settings.payment_card = card.trim().to_string();
            Ok(())
        })
    }

    /// Lifetime of new allocations in days; `None` sells them without expiry.
    pub fn set_service_days(&self, days: Option<u32>) -> Result<(), ShopError> {
        self.store.update(|document| {
            document.settings.service_days = days;
            Ok(())
        })
    }
}

/// Discount codes.
impl Shop {
    /// Create a discount code and return it in its stored, upper-case form.
    /// Percentages must lie in `1..=100`, fixed amounts must be positive.
    pub fn create_discount(
        &self,
        code: &str,
        kind: DiscountKind,
        value: i64,
        expires_at: Option<DateTime<Utc>>,
        max_uses: Option<u32>,
    ) -> Result<String, ShopError> {
        let valid = match kind {
            DiscountKind::Percentage => (1..=100).contains(&value),
            DiscountKind::Fixed => value > 0,
        };
        if !valid {
            return Err(ShopError::InvalidDiscount(value));
        }

        let code = discount_key(code);
        if code.is_empty() {
            return Err(ShopError::UnknownDiscount(code));
        }
        self.store.update(|document| {
            if document.discount_codes.contains_key(&code) {
                return Err(ShopError::DuplicateDiscount(code.clone()));
            }
            document.discount_codes.insert(
                code.clone(),
                DiscountCode {
                    kind,
                    value,
                    expires_at,
                    uses: 0,
                    max_uses,
                },
            );
            info!(code = %code, ?kind, value, "discount created");
            Ok(code.clone())
        })
    }

    /// Remove a discount code, returning its definition.
    pub fn delete_discount(&self, code: &str) -> Result<DiscountCode, ShopError> {
        let code = discount_key(code);
        self.store.update(|document| {
            let removed = document
                .discount_codes
                .remove(&code)
                .ok_or_else(|| ShopError::UnknownDiscount(code.clone()))?;
            info!(code = %code, "discount deleted");
            Ok(removed)
        })
    }
}

/// Uploaded files and tutorials.
impl Shop {
    /// Register an uploaded file and return its id.
    pub fn register_file(
        &self,
        title: &str,
        kind: FileKind,
        file_ref: &str,
        caption: Option<&str>,
    ) -> Result<String, ShopError> {
        self.store.update(|document| {
            let id = loop {
                let candidate: String = Uuid::new_v4()
                    .simple()
                    .to_string()
                    .chars()
                    .take(FILE_ID_LEN)
                    .collect();
                if !document.uploaded_files.contains_key(&candidate) {
                    break candidate;
                }
            };
            document.uploaded_files.insert(
                id.clone(),
                UploadedFile {
                    title: title.to_string(),
                    kind,
                    file_ref: file_ref.to_string(),
                    caption: caption.map(str::to_string),
                    uploaded_at: Utc::now(),
                    replaced_at: None,
                },
            );
            info!(file = %id, ?kind, "file registered");
            Ok(id)
        })
    }

    /// Change the title or caption of an uploaded file.
    pub fn edit_file(&self, id: &str, edit: FileEdit) -> Result<(), ShopError> {
        self.store.update(|document| {
            let file = file_mut(document, id)?;
            if let Some(title) = edit.title {
                file.title = title;
            }
            if let Some(caption) = edit.caption {
                file.caption = Some(caption).filter(|caption| !caption.is_empty());
            }
            Ok(())
        })
    }

    /// Point a file at new content, keeping its id and tutorial links.
    pub fn replace_file(&self, id: &str, file_ref: &str) -> Result<(), ShopError> {
        self.store.update(|document| {
            let file = file_mut(document, id)?;
            file.file_ref = file_ref.to_string();
            file.replaced_at = Some(Utc::now());
            info!(file = id, "file replaced");
            Ok(())
        })
    }

    /// Delete a file and unlink it from every tutorial.
    pub fn delete_file(&self, id: &str) -> Result<(), ShopError> {
        self.store.update(|document| {
            document
                .uploaded_files
                .remove(id)
                .ok_or_else(|| ShopError::UnknownFile(id.to_string()))?;
            for category in document.tutorials.values_mut() {
                category.files.retain(|file| file != id);
            }
            info!(file = id, "file deleted");
            Ok(())
        })
    }

    /// Add a file to a tutorial category. Attaching twice is a no-op.
    pub fn attach_tutorial_file(&self, category: &str, id: &str) -> Result<(), ShopError> {
        self.store.update(|document| {
            if !document.uploaded_files.contains_key(id) {
                return Err(ShopError::UnknownFile(id.to_string()));
            }
            let files = &mut document
                .tutorials
                .get_mut(category)
                .ok_or_else(|| ShopError::UnknownTutorial(category.to_string()))?
                .files;
            if !files.iter().any(|file| file == id) {
                files.push(id.to_string());
            }
            Ok(())
        })
    }

    /// Remove a file from a tutorial category. Returns `false` if it was
    /// not attached.
    pub fn detach_tutorial_file(&self, category: &str, id: &str) -> Result<bool, ShopError> {
        self.store.update(|document| {
            let files = &mut document
                .tutorials
                .get_mut(category)
                .ok_or_else(|| ShopError::UnknownTutorial(category.to_string()))?
                .files;
            let before = files.len();
            files.retain(|file| file != id);
            Ok(files.len() != before)
        })
    }
}

impl Shop {
    /// Log a broadcast and return the users it should be delivered to.
    pub fn record_broadcast(&self, text: &str) -> Result<Vec<UserId>, ShopError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ShopError::EmptyMessage);
        }
        self.store.update(|document| {
            document.broadcast_messages.push(Broadcast {
                text: text.to_string(),
                sent_at: Utc::now(),
            });
            let recipients: Vec<UserId> = document
                .users
                .keys()
                .filter_map(|key| match key.parse::<UserId>() {
                    Ok(id) => Some(id),
                    Err(_) => {
                        warn!(user = %key, "skipping malformed user id");
                        None
                    }
                })
                .filter(|id| !document.is_blocked(*id))
                .collect();
            info!(recipients = recipients.len(), "broadcast recorded");
            Ok(recipients)
        })
    }
}

fn location_key(source: &str) -> String {
    source.trim().to_lowercase().replace(' ', "_")
}

fn location_mut<'a>(document: &'a mut Document, key: &str) -> Result<&'a mut Location, ShopError> {
    document
        .locations
        .get_mut(key)
        .ok_or_else(|| ShopError::UnknownLocation(key.to_string()))
}

fn file_mut<'a>(document: &'a mut Document, id: &str) -> Result<&'a mut UploadedFile, ShopError> {
    document
        .uploaded_files
        .get_mut(id)
        .ok_or_else(|| ShopError::UnknownFile(id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::super::testing::{shop, shop_with_user};
    use super::*;
    use anyhow::Result;

    #[test]
    fn locations_are_keyed_and_updated() -> Result<()> {
        let (_dir, shop) = shop()?;
        assert_eq!(shop.upsert_location("South Korea", "🇰🇷 Korea", 90_000)?, "south_korea");
        assert_eq!(shop.upsert_location("south korea", "🇰🇷 South Korea", 95_000)?, "south_korea");

        let location = shop.snapshot().locations["south_korea"].clone();
        assert_eq!(location.name, "🇰🇷 South Korea");
        assert_eq!(location.price, 95_000);
        assert!(location.enabled);

        assert!(!shop.toggle_location("south_korea")?);
        assert!(shop.toggle_location("south_korea")?);
        shop.set_location_price("germany", 80_000)?;
        assert_eq!(shop.quote("germany", None)?.total, 80_000);
        assert!(matches!(
            shop.set_location_enabled("atlantis", true),
            Err(ShopError::UnknownLocation(_))
        ));
        assert!(matches!(
            shop.upsert_location("x", "x", -1),
            Err(ShopError::InvalidAmount(-1))
        ));
        Ok(())
    }

    #[test]
    fn settings_are_persisted() -> Result<()> {
        let (_dir, shop) = shop()?;
        shop.set_referral_reward(5_000)?;
        shop.set_payment_card(" 6037-0000-1111-2222 ")?;
        shop.set_service_days(None)?;

        let settings = shop.store().read(true).settings;
        assert_eq!(settings.referral_reward, 5_000);
        assert_eq!(settings.payment_card, "6037-0000-1111-2222");
        assert_eq!(settings.service_days, None);
        Ok(())
    }

    #[test]
    fn discount_codes_validate_and_delete() -> Result<()> {
        let (_dir, shop) = shop()?;
        assert_eq!(
            shop.create_discount(" spring", DiscountKind::Percentage, 20, None, None)?,
            "SPRING"
        );
        assert!(shop.snapshot().discount_codes.contains_key("SPRING"));
        assert!(matches!(
            shop.create_discount("Spring", DiscountKind::Fixed, 10, None, None),
            Err(ShopError::DuplicateDiscount(_))
        ));
        assert!(matches!(
            shop.create_discount("BIG", DiscountKind::Percentage, 150, None, None),
            Err(ShopError::InvalidDiscount(150))
        ));
        assert!(matches!(
            shop.create_discount("ZERO", DiscountKind::Fixed, 0, None, None),
            Err(ShopError::InvalidDiscount(0))
        ));

        assert_eq!(shop.delete_discount("spring")?.value, 20);
        assert!(matches!(
            shop.delete_discount("SPRING"),
            Err(ShopError::UnknownDiscount(_))
        ));
        Ok(())
    }

    #[test]
    fn files_link_into_tutorials() -> Result<()> {
        let (_dir, shop) = shop()?;
        let id = shop.register_file("Setup", FileKind::Video, "file-abc", Some("watch me"))?;
        assert_eq!(id.len(), FILE_ID_LEN);

        shop.attach_tutorial_file("vpn_usage", &id)?;
        shop.attach_tutorial_file("vpn_usage", &id)?;
        shop.attach_tutorial_file("general", &id)?;
        assert_eq!(shop.snapshot().tutorials["vpn_usage"].files, vec![id.clone()]);

        shop.edit_file(
            &id,
            FileEdit {
                title: Some("Setup guide".into()),
                caption: Some(String::new()),
            },
        )?;
        shop.replace_file(&id, "file-def")?;
        let file = shop.snapshot().uploaded_files[&id].clone();
        assert_eq!(file.title, "Setup guide");
        assert_eq!(file.caption, None);
        assert_eq!(file.file_ref, "file-def");
        assert!(file.replaced_at.is_some());

        assert!(shop.detach_tutorial_file("general", &id)?);
        shop.delete_file(&id)?;
        let document = shop.snapshot();
        assert!(document.uploaded_files.is_empty());
        assert!(document.tutorials.values().all(|category| category.files.is_empty()));
        assert!(matches!(
            shop.attach_tutorial_file("nowhere", "missing"),
            Err(ShopError::UnknownFile(_))
        ));
        Ok(())
    }

    #[test]
    fn broadcast_skips_blocked_users() -> Result<()> {
        let (_dir, shop) = shop_with_user(1, 0)?;
        shop.register_user(2, None, None)?;
        shop.register_user(3, None, None)?;
        shop.block_user(2)?;

        assert_eq!(shop.record_broadcast("maintenance tonight")?, vec![1, 3]);
        assert_eq!(shop.snapshot().broadcast_messages.len(), 1);
        assert!(matches!(
            shop.record_broadcast("   "),
            Err(ShopError::EmptyMessage)
        ));
        Ok(())
    }
}
