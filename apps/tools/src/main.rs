use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use push_relay::MemoryRelay;
use relay_api::{auth, ledger, ApiContext};
use shared::domain::MessageStatus;
use storage::{MessageFilter, Storage, StoredUser};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/relay.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Applies pending schema migrations and exits.
    Migrate,
    CreateUser {
        email: String,
        #[arg(long)]
        verified: bool,
    },
    VerifyUser {
        email: String,
    },
    IssueToken {
        email: String,
        /// Token lifetime; omitted means the token never expires.
        #[arg(long)]
        ttl_hours: Option<i64>,
    },
    CountMessages {
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        status: Option<MessageStatus>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url)
        .await
        .with_context(|| format!("failed to open {}", cli.database_url))?;
    let output = run(storage, cli.command).await?;
    println!("{output}");
    Ok(())
}

async fn run(storage: Storage, command: Command) -> Result<String> {
    // Admin commands never talk to the push relay.
    let ctx = ApiContext::new(storage, Arc::new(MemoryRelay::unrecorded()));

    match command {
        Command::Migrate => Ok("migrations applied".to_string()),
        Command::CreateUser { email, verified } => {
            let user = ctx.storage.create_user(&email, None, verified).await?;
            info!(user_id = user.id.0, %email, "created user");
            Ok(format!("created user uuid={} verified={}", user.uuid, user.verified))
        }
        Command::VerifyUser { email } => {
            let user = user_by_email(&ctx, &email).await?;
            ctx.storage.set_user_verified(user.id, true).await?;
            Ok(format!("verified user uuid={}", user.uuid))
        }
        Command::IssueToken { email, ttl_hours } => {
            let user = user_by_email(&ctx, &email).await?;
            let expires_at = match ttl_hours {
                Some(hours) => Some(
                    Duration::try_hours(hours)
                        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
                        .ok_or_else(|| anyhow!("ttl of {hours} hours is out of range"))?,
                ),
                None => None,
            };
            let token = auth::issue_token(&ctx, user.id, expires_at)
                .await
                .map_err(|err| anyhow!("failed to issue token: {err}"))?;
            Ok(format!("user_id={} token={}", user.uuid, token.token))
        }
        Command::CountMessages { email, status } => {
            let user_id = match email {
                Some(email) => Some(user_by_email(&ctx, &email).await?.id),
                None => None,
            };
            let count = ledger::count(&ctx, &MessageFilter { user_id, status })
                .await
                .map_err(|err| anyhow!("failed to count messages: {err}"))?;
            Ok(format!("messages={count}"))
        }
    }
}

async fn user_by_email(ctx: &ApiContext, email: &str) -> Result<StoredUser> {
    ctx.storage
        .find_user_by_email(email)
        .await?
        .ok_or_else(|| anyhow!("no user with email '{email}'"))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
