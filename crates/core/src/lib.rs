#![warn(clippy::all, missing_docs)]

//! Core domain logic for the VPN/DNS storefront bot.
//!
//! This crate hosts the persisted document model, configuration handling,
//! the cached snapshot store and the shop operations built on top of it,
//! used by the admin CLI and any future frontends.

pub mod config;
pub mod document;
pub mod error;
pub mod ranges;
pub mod shop;
pub mod snapshot;
pub mod store;

pub use config::AppConfig;
pub use document::Document;
pub use error::{ShopError, StoreError};
pub use ranges::NetworkRanges;
pub use shop::Shop;
pub use store::SnapshotStore;
