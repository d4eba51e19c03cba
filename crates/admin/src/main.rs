mod report;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::{
    fs::{self, OpenOptions},
    path::Path,
    sync::Mutex,
};

use tracing_subscriber::{prelude::*, EnvFilter};
use vpnshop_core::{
    config::{self, AppConfig},
    document::DiscountKind,
    Shop,
};

#[derive(Parser)]
#[command(name = "vpnshop-admin")]
#[command(about = "Operator tools for the VPN/DNS shop data", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the config file and the data snapshots if missing
    Init,
    /// Print shop counters
    Show,
    /// Print a user record
    User { id: i64 },
    /// Add balance to a user
    Credit { id: i64, amount: i64 },
    /// List payment receipts awaiting review
    Pending,
    /// Approve a payment request
    Approve { id: String },
    /// Reject a payment request
    Reject { id: String },
    /// Manage sale locations
    Location {
        #[command(subcommand)]
        subcommand: LocationCommands,
    },
    /// Manage discount codes
    Discount {
        #[command(subcommand)]
        subcommand: DiscountCommands,
    },
    /// Print a user's allocations and ledger
    History { id: i64 },
    /// List allocations that expire soon
    Expiring {
        #[arg(long, default_value_t = 3)]
        days: i64,
    },
    /// Print the network range table
    Ranges,
}

#[derive(Subcommand)]
enum LocationCommands {
    /// Add a location or update its name and price
    Add {
        /// Key source, e.g. "South Korea" becomes south_korea
        key: String,
        /// Display name shown to users
        name: String,
        price: i64,
    },
    /// Enable or disable sales in a location
    Toggle { key: String },
}

#[derive(Subcommand)]
enum DiscountCommands {
    /// Create a discount code
    Add {
        code: String,
        #[arg(value_enum)]
        kind: KindArg,
        value: i64,
        /// Days until the code expires
        #[arg(long)]
        expires_in: Option<i64>,
        #[arg(long)]
        max_uses: Option<u32>,
    },
    /// Delete a discount code
    Rm { code: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Percentage,
    Fixed,
}

impl From<KindArg> for DiscountKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Percentage => DiscountKind::Percentage,
            KindArg::Fixed => DiscountKind::Fixed,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = config::ensure_default_config()?;
    let config = AppConfig::load().context("loading configuration")?;
    init_logging(&config.log_dir)?;
    tracing::debug!(config = %config_path.display(), "configuration loaded");

    let shop = Shop::from_config(&config);
    run(&shop, cli.command)
}

fn run(shop: &Shop, command: Commands) -> Result<()> {
    match command {
        Commands::Init => {
            let document = shop.store().read(true);
            let table = shop.ranges().load();
            println!("data:   {}", shop.store().path().display());
            println!("ranges: {} locations", table.len());
            println!("revision {}", document.revision);
        }
        Commands::Show => report::summary(&shop.summary()),
        Commands::User { id } => {
            let user = shop
                .user(id)
                .with_context(|| format!("user {id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&user)?);
        }
        Commands::Credit { id, amount } => {
            let balance = shop.credit(id, amount)?;
            println!("user {id} balance: {balance}");
        }
        Commands::Pending => report::pending(&shop.pending_payments()),
        Commands::Approve { id } => {
            let balance = shop.approve_payment(&id)?;
            println!("approved {id}, balance now {balance}");
        }
        Commands::Reject { id } => {
            shop.reject_payment(&id)?;
            println!("rejected {id}");
        }
        Commands::Location { subcommand } => match subcommand {
            LocationCommands::Add { key, name, price } => {
                let key = shop.upsert_location(&key, &name, price)?;
                println!("saved location {key}");
            }
            LocationCommands::Toggle { key } => {
                let enabled = shop.toggle_location(&key)?;
                println!("{key}: {}", if enabled { "enabled" } else { "disabled" });
            }
        },
        Commands::Discount { subcommand } => match subcommand {
            DiscountCommands::Add {
                code,
                kind,
                value,
                expires_in,
                max_uses,
            } => {
                let expires_at = expires_in
                    .map(|days| expiry_after(Utc::now(), days))
                    .transpose()?;
                let code = shop.create_discount(&code, kind.into(), value, expires_at, max_uses)?;
                println!("created discount {code}");
            }
            DiscountCommands::Rm { code } => {
                shop.delete_discount(&code)?;
                println!("deleted discount {code}");
            }
        },
        Commands::History { id } => report::history(&shop.purchase_history(id)?),
        Commands::Expiring { days } => {
            report::expiring(&shop.expiring_allocations(Utc::now(), days));
        }
        Commands::Ranges => report::ranges(&shop.ranges().load()),
    }
    Ok(())
}

fn expiry_after(now: DateTime<Utc>, days: i64) -> Result<DateTime<Utc>> {
    Duration::try_days(days)
        .and_then(|period| now.checked_add_signed(period))
        .with_context(|| format!("expiry of {days} days is out of range"))
}

fn init_logging(log_dir: &Path) -> Result<()> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;
    let log_path = log_dir.join("vpnshop.log");
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("opening {}", log_path.display()))?;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .compact()
        .with_writer(Mutex::new(log_file));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn discount_add_parses_options() -> Result<()> {
        let cli = Cli::try_parse_from([
            "vpnshop-admin",
            "discount",
            "add",
            "spring",
            "percentage",
            "20",
            "--max-uses",
            "5",
        ])?;
        let Commands::Discount {
            subcommand:
                DiscountCommands::Add {
                    code,
                    kind,
                    value,
                    expires_in,
                    max_uses,
                },
        } = cli.command
        else {
            anyhow::bail!("parsed the wrong command");
        };
        assert_eq!(code, "spring");
        assert_eq!(DiscountKind::from(kind), DiscountKind::Percentage);
        assert_eq!((value, expires_in, max_uses), (20, None, Some(5)));
        Ok(())
    }

    #[test]
    fn expiry_must_fit_the_calendar() -> Result<()> {
        let now = Utc::now();
        assert_eq!(expiry_after(now, 7)?, now + Duration::days(7));
        assert_eq!(expiry_after(now, -1)?, now - Duration::days(1));
        assert!(expiry_after(now, i64::MAX).is_err());
        assert!(expiry_after(now, 200_000_000).is_err());
        Ok(())
    }
}
