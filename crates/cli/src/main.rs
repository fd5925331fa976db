//! CouponHub CLI - Link repair, migrations, and lookups.
//!
//! Every command runs against a JSON store snapshot, given by `--snapshot` or
//! the `COUPONHUB_SNAPSHOT` environment variable. Commands that change data
//! write the snapshot back unless `--dry-run` is set.
//!
//! # Usage
//!
//! ```bash
//! # Report broken customer/user links without changing anything
//! ch-cli --snapshot store.json repair-links --dry-run
//!
//! # Backfill customers.phone_normalized
//! ch-cli --snapshot store.json migrate phones
//!
//! # Find customers by phone, in any stored format
//! ch-cli --snapshot store.json lookup phone "083 209 1122"
//!
//! # List businesses connected to a customer
//! ch-cli --snapshot store.json discover --customer-id c1 --phone 0832091122
//!
//! # Check (and optionally create) a customer/user link
//! ch-cli --snapshot store.json verify-link -c c1 -u u1 --link
//! ```

#![cfg_attr(not(test), forbid(unsafe_code))]

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::CliError;

#[derive(Parser)]
#[command(name = "ch-cli")]
#[command(author, version, about = "CouponHub maintenance tools")]
struct Cli {
    /// Store snapshot file (JSON)
    #[arg(long, global = true, env = "COUPONHUB_SNAPSHOT")]
    snapshot: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Find and fix half-linked and duplicate customer/user links
    RepairLinks {
        /// Report what would change without writing
        #[arg(long)]
        dry_run: bool,
    },
    /// Run data migrations
    Migrate {
        #[command(subcommand)]
        target: MigrateTarget,
    },
    /// Look up customers
    Lookup {
        #[command(subcommand)]
        by: LookupBy,
    },
    /// List businesses connected to a customer
    Discover {
        #[arg(long)]
        customer_id: Option<String>,

        #[arg(long)]
        user_id: Option<String>,

        #[arg(long)]
        phone: Option<String>,

        /// Also include every active business
        #[arg(long)]
        include_active: bool,
    },
    /// Check the link between a customer and a user
    VerifyLink {
        #[arg(short, long)]
        customer_id: String,

        #[arg(short, long)]
        user_id: String,

        /// Link both sides if they are not already linked
        #[arg(long)]
        link: bool,
    },
}

#[derive(Subcommand)]
enum MigrateTarget {
    /// Backfill `phone_normalized` on customers
    Phones {
        /// Report what would change without writing
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum LookupBy {
    /// Customers whose phone matches, in any stored format
    Phone { phone: String },
    /// Customer with this email address
    Email { email: String },
    /// Customer linked to (or matching) a user account
    User { user_id: String },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("couponhub_data=info,ch_cli=info")),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        tracing::error!("Command failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let snapshot = cli.snapshot.ok_or(CliError::MissingSnapshot)?;

    match cli.command {
        Commands::RepairLinks { dry_run } => {
            commands::links::repair(&snapshot, dry_run).await?;
        }
        Commands::Migrate { target } => match target {
            MigrateTarget::Phones { dry_run } => {
                commands::migrate::phones(&snapshot, dry_run).await?;
            }
        },
        Commands::Lookup { by } => match by {
            LookupBy::Phone { phone } => commands::lookup::by_phone(&snapshot, &phone).await?,
            LookupBy::Email { email } => commands::lookup::by_email(&snapshot, &email).await?,
            LookupBy::User { user_id } => commands::lookup::by_user(&snapshot, &user_id).await?,
        },
        Commands::Discover {
            customer_id,
            user_id,
            phone,
            include_active,
        } => {
            commands::discover::run(&snapshot, customer_id, user_id, phone, include_active).await?;
        }
        Commands::VerifyLink {
            customer_id,
            user_id,
            link,
        } => {
            commands::links::verify(&snapshot, &customer_id, &user_id, link).await?;
        }
    }
    Ok(())
}
