use anyhow::Result;
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "mip", version, about = "Mail Ingestion Pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output structured JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage linked mail accounts
    Accounts {
        #[command(subcommand)]
        command: AccountCommands,
    },
    /// Run one sync pass over enabled accounts
    Sync(SyncArgs),
    /// Serve the webhook endpoint and background sync loops
    Serve(ServeArgs),
    /// Run one subscription renewal check
    Renew,
    /// Re-run enrichment for one stored message
    Analyze { message_id: String },
    /// Show one stored message with its analysis
    Show { message_id: String },
    /// Show the enrichment attempts recorded for one message
    History { message_id: String },
    /// Show pipeline stats
    Stats,
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// Restrict the pass to one account id or email address
    #[arg(long)]
    account: Option<String>,
    /// Keep syncing on a fixed interval
    #[arg(long, default_value_t = false)]
    watch: bool,
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[arg(long, env = "MIP_BIND", default_value = "127.0.0.1:8475")]
    bind: String,
    /// Publicly reachable base URL the provider calls back on; without
    /// it, push subscriptions are not created
    #[arg(long, env = "MIP_BASE_URL")]
    base_url: Option<String>,
    #[arg(long, env = "MIP_POLL_INTERVAL_SECS", default_value_t = 300)]
    poll_interval_secs: u64,
    #[arg(long, env = "MIP_RENEWAL_INTERVAL_SECS", default_value_t = 1800)]
    renewal_interval_secs: u64,
}

#[derive(Debug, Subcommand)]
enum AccountCommands {
    /// Link an Outlook account from an existing OAuth grant
    AddOutlook {
        email: String,
        #[arg(long, env = "MIP_ACCESS_TOKEN", hide_env_values = true)]
        access_token: String,
        #[arg(long, env = "MIP_REFRESH_TOKEN", hide_env_values = true)]
        refresh_token: String,
        /// OAuth app client id, stored on the account for refresh grants
        #[arg(long, env = "MIP_CLIENT_ID")]
        client_id: Option<String>,
        /// OAuth app client secret; public clients leave this unset
        #[arg(long, env = "MIP_CLIENT_SECRET", hide_env_values = true)]
        client_secret: Option<String>,
        #[arg(long)]
        display_name: Option<String>,
        /// Owning user id for multi-mailbox setups
        #[arg(long, default_value = "local")]
        user: String,
    },
    /// Link an IMAP account with password credentials
    AddImap {
        email: String,
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = 993)]
        port: u16,
        /// Login name; defaults to the email address
        #[arg(long)]
        username: Option<String>,
        #[arg(long, env = "MIP_IMAP_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long)]
        display_name: Option<String>,
        /// Owning user id for multi-mailbox setups
        #[arg(long, default_value = "local")]
        user: String,
    },
    /// List configured accounts
    List,
    /// Remove an account and its locally stored data
    Remove { account_id: String },
    /// Re-enable a disabled account
    Enable { account_id: String },
    /// Disable an account without removing its data
    Disable { account_id: String },
    /// Show per-account sync status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::dispatch(cli).await
}

mod commands {
    use std::sync::Arc;

    use anyhow::{anyhow, Context, Result};

    use mip::db::models::{
        Credentials, EmailAccount, EnrichedAnalysis, ImapCredentials, NormalizedMessage,
        OAuthTokens, ProviderKind,
    };
    use mip::db::Database;
    use mip::enrich::{self, CompletionBackend, HttpCompletion};
    use mip::providers::clear_refresh_gate;
    use mip::server::{self, ServerConfig};
    use mip::subscriptions;
    use mip::sync;

    use super::{AccountCommands, Cli, Commands};

    pub async fn dispatch(cli: Cli) -> Result<()> {
        match cli.command {
            Commands::Accounts { command } => handle_accounts(command).await,
            Commands::Sync(args) => handle_sync(args, cli.json).await,
            Commands::Serve(args) => handle_serve(args).await,
            Commands::Renew => handle_renew(cli.json).await,
            Commands::Analyze { message_id } => handle_analyze(&message_id, cli.json).await,
            Commands::Show { message_id } => handle_show(&message_id, cli.json).await,
            Commands::History { message_id } => handle_history(&message_id, cli.json).await,
            Commands::Stats => handle_stats(cli.json).await,
        }
    }

    async fn handle_sync(args: super::SyncArgs, json: bool) -> Result<()> {
        let db_path = Database::default_db_path().context("resolve default MIP database path")?;
        let db = Database::open(&db_path)
            .with_context(|| format!("open MIP database at {}", db_path.display()))?;
        let backend: Arc<dyn CompletionBackend> = Arc::new(HttpCompletion::from_env()?);

        if args.watch {
            loop {
                let report =
                    sync::sweep_accounts(&db, backend.clone(), None, args.account.as_deref())
                        .await?;
                print_sweep_report(&report, json)?;
                tokio::time::sleep(std::time::Duration::from_secs(300)).await;
            }
        } else {
            let report =
                sync::sweep_accounts(&db, backend.clone(), None, args.account.as_deref()).await?;
            if args.account.is_some() && report.accounts == 0 {
                return Err(anyhow!(
                    "no enabled account matches '{}'",
                    args.account.unwrap_or_default()
                ));
            }
            print_sweep_report(&report, json)
        }
    }

    async fn handle_serve(args: super::ServeArgs) -> Result<()> {
        let db_path = Database::default_db_path().context("resolve default MIP database path")?;
        let backend: Arc<dyn CompletionBackend> = Arc::new(HttpCompletion::from_env()?);

        let config = ServerConfig {
            bind: args.bind,
            base_url: args.base_url,
            db_path,
            poll_interval: std::time::Duration::from_secs(args.poll_interval_secs.max(1)),
            renewal_interval: std::time::Duration::from_secs(args.renewal_interval_secs.max(1)),
        };
        server::run_server(config, backend).await
    }

    async fn handle_renew(json: bool) -> Result<()> {
        let db_path = Database::default_db_path().context("resolve default MIP database path")?;
        let db = Database::open(&db_path)
            .with_context(|| format!("open MIP database at {}", db_path.display()))?;

        let report = subscriptions::run_renewal_check(&db).await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            println!(
                "renewal check: {} renewed, {} replaced, {} failed",
                report.renewed, report.replaced, report.failed
            );
        }
        Ok(())
    }

    async fn handle_analyze(message_id: &str, json: bool) -> Result<()> {
        let db_path = Database::default_db_path().context("resolve default MIP database path")?;
        let db = Database::open(&db_path)
            .with_context(|| format!("open MIP database at {}", db_path.display()))?;
        let backend: Arc<dyn CompletionBackend> = Arc::new(HttpCompletion::from_env()?);

        let message = db
            .get_message(message_id)?
            .ok_or_else(|| anyhow!("message not found for id '{message_id}'"))?;

        let summary = enrich::enrich_batch(&db, backend, std::slice::from_ref(&message)).await?;
        if summary.enriched == 0 {
            return Err(anyhow!(
                "enrichment failed for '{message_id}'; see 'mip history {message_id}'"
            ));
        }

        let analysis = db
            .get_analysis(message_id)?
            .ok_or_else(|| anyhow!("analysis missing after enrichment of '{message_id}'"))?;
        if json {
            println!("{}", serde_json::to_string_pretty(&analysis)?);
        } else {
            print_analysis(&analysis);
        }
        Ok(())
    }

    async fn handle_show(message_id: &str, json: bool) -> Result<()> {
        let db_path = Database::default_db_path().context("resolve default MIP database path")?;
        let db = Database::open(&db_path)
            .with_context(|| format!("open MIP database at {}", db_path.display()))?;

        let message = db
            .get_message(message_id)?
            .ok_or_else(|| anyhow!("message not found for id '{message_id}'"))?;
        let analysis = db.get_analysis(message_id)?;

        if json {
            let payload = serde_json::json!({
                "message": message,
                "analysis": analysis,
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
        } else {
            print_message(&message);
            match analysis {
                Some(analysis) => {
                    println!();
                    print_analysis(&analysis);
                }
                None => println!("\n(no analysis yet; run 'mip analyze {message_id}')"),
            }
        }
        Ok(())
    }

    async fn handle_history(message_id: &str, json: bool) -> Result<()> {
        let db_path = Database::default_db_path().context("resolve default MIP database path")?;
        let db = Database::open(&db_path)
            .with_context(|| format!("open MIP database at {}", db_path.display()))?;

        let records = db.list_enrichment_records(message_id)?;
        if json {
            println!("{}", serde_json::to_string_pretty(&records)?);
        } else if records.is_empty() {
            println!("No enrichment attempts recorded for '{message_id}'.");
        } else {
            for record in records {
                println!(
                    "{}  success={}  duration_ms={}  error={}",
                    record.created_at.as_deref().unwrap_or("-"),
                    record.success,
                    record.duration_ms,
                    record.error.as_deref().unwrap_or("-")
                );
            }
        }
        Ok(())
    }

    async fn handle_stats(json: bool) -> Result<()> {
        let db_path = Database::default_db_path().context("resolve default MIP database path")?;
        let db = Database::open(&db_path)
            .with_context(|| format!("open MIP database at {}", db_path.display()))?;

        let stats = db.get_stats()?;
        if json {
            println!("{}", serde_json::to_string_pretty(&stats)?);
        } else {
            println!("Accounts: {}", stats.total_accounts);
            println!("Messages: {}", stats.total_messages);
            println!("Analyses: {}", stats.total_analyses);
            println!("Subscriptions: {}", stats.total_subscriptions);
            if !stats.messages_by_account.is_empty() {
                println!("Messages by account:");
                for entry in &stats.messages_by_account {
                    println!("  {}  {}", entry.account_id, entry.count);
                }
            }
        }
        Ok(())
    }

    async fn handle_accounts(command: AccountCommands) -> Result<()> {
        let db_path = Database::default_db_path().context("resolve default MIP database path")?;
        let db = Database::open(&db_path)
            .with_context(|| format!("open MIP database at {}", db_path.display()))?;

        match command {
            AccountCommands::AddOutlook {
                email,
                access_token,
                refresh_token,
                client_id,
                client_secret,
                display_name,
                user,
            } => {
                let mut account = account_record(&email, display_name, user, ProviderKind::Outlook);
                account.config = oauth_app_config(client_id, client_secret);
                db.insert_account(&account)?;
                db.store_credentials(
                    &account.account_id,
                    &Credentials::Oauth(OAuthTokens {
                        access_token,
                        refresh_token,
                        expires_at: None,
                    }),
                )?;
                // A re-link may race a refresh gate taken under the old
                // grant; drop it so the new tokens are used immediately.
                clear_refresh_gate(&account.account_id);
                println!("Linked Outlook account: {}", account.account_id);
            }
            AccountCommands::AddImap {
                email,
                host,
                port,
                username,
                password,
                display_name,
                user,
            } => {
                let account = account_record(&email, display_name, user, ProviderKind::Imap);
                db.insert_account(&account)?;
                db.store_credentials(
                    &account.account_id,
                    &Credentials::Imap(ImapCredentials {
                        host,
                        port,
                        username: username.unwrap_or_else(|| email.clone()),
                        password,
                    }),
                )?;
                clear_refresh_gate(&account.account_id);
                println!("Linked IMAP account: {}", account.account_id);
            }
            AccountCommands::List => {
                let accounts = db.list_accounts()?;
                if accounts.is_empty() {
                    println!("No accounts configured.");
                } else {
                    println!("Accounts");
                    println!("========");
                    for account in accounts {
                        println!(
                            "{}  {}  {}  {}",
                            account.account_id,
                            account.email_address,
                            account.provider,
                            if account.enabled { "enabled" } else { "disabled" }
                        );
                    }
                }
            }
            AccountCommands::Remove { account_id } => {
                match db.get_account(&account_id)? {
                    None => println!("No account found: {account_id}"),
                    Some(account) => {
                        // Best-effort provider-side cleanup; local rows go
                        // regardless.
                        subscriptions::delete_subscription(&db, &account).await?;
                        db.remove_account(&account_id)?;
                        clear_refresh_gate(&account_id);
                        println!("Removed account: {account_id}");
                    }
                }
            }
            AccountCommands::Enable { account_id } => {
                if db.set_account_enabled(&account_id, true)? == 0 {
                    println!("No account found: {account_id}");
                } else {
                    println!("Enabled account: {account_id}");
                }
            }
            AccountCommands::Disable { account_id } => {
                if db.set_account_enabled(&account_id, false)? == 0 {
                    println!("No account found: {account_id}");
                } else {
                    println!("Disabled account: {account_id}");
                }
            }
            AccountCommands::Status => {
                let accounts = db.list_accounts()?;
                if accounts.is_empty() {
                    println!("No accounts configured.");
                } else {
                    println!("Account Sync Status");
                    println!("===================");
                    for account in accounts {
                        println!(
                            "{}  phase={}  enabled={}  last_sync={}  error={}",
                            account.account_id,
                            account.sync_phase(),
                            account.enabled,
                            account.last_sync_at.as_deref().unwrap_or("never"),
                            account.last_sync_error.as_deref().unwrap_or("-")
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Snapshot the OAuth app registration into account config so refresh
    /// grants work without `MIP_CLIENT_ID` exported on every run.
    fn oauth_app_config(
        client_id: Option<String>,
        client_secret: Option<String>,
    ) -> Option<serde_json::Value> {
        let mut config = serde_json::Map::new();
        if let Some(id) = client_id {
            config.insert("client_id".to_string(), id.into());
        }
        if let Some(secret) = client_secret {
            config.insert("client_secret".to_string(), secret.into());
        }
        if config.is_empty() {
            None
        } else {
            Some(config.into())
        }
    }

    fn account_record(
        email: &str,
        display_name: Option<String>,
        user: String,
        provider: ProviderKind,
    ) -> EmailAccount {
        EmailAccount {
            account_id: email.trim().to_ascii_lowercase(),
            user_id: user,
            email_address: email.trim().to_string(),
            display_name,
            provider,
            enabled: true,
            initial_sync_complete: false,
            last_sync_at: None,
            last_sync_error: None,
            subscription_id: None,
            config: None,
        }
    }

    fn print_sweep_report(report: &sync::SweepReport, json: bool) -> Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(report)?);
        } else {
            println!(
                "sync complete: {} account(s), {} new message(s), {} enriched, {} skipped, {} failed",
                report.accounts, report.new_messages, report.enriched, report.skipped, report.failed
            );
        }
        Ok(())
    }

    fn print_message(message: &NormalizedMessage) {
        let from = match (&message.from_name, &message.from_address) {
            (Some(name), Some(address)) => format!("{name} <{address}>"),
            (None, Some(address)) => address.clone(),
            _ => "(unknown sender)".to_string(),
        };
        println!("ID: {}", message.id);
        println!("Account: {}", message.account_id);
        println!("From: {from}");
        println!("To: {}", message.to_addresses.join(", "));
        println!("Subject: {}", message.subject.as_deref().unwrap_or("-"));
        println!("Received: {}", message.received_at);
        println!("Read: {}", message.is_read.unwrap_or(false));
        println!("Attachments: {}", message.has_attachments.unwrap_or(false));
        if let Some(url) = &message.unsubscribe_url {
            println!("Unsubscribe: {url}");
        }
        if let Some(body) = &message.body_text {
            println!("\n{body}");
        }
    }

    fn print_analysis(analysis: &EnrichedAnalysis) {
        println!("Summary: {}", analysis.summary);
        println!("Importance: {:.2}", analysis.importance_score);
        if !analysis.badges.is_empty() {
            let badges = analysis
                .badges
                .iter()
                .map(|badge| format!("{} ({:.2})", badge.name, badge.importance))
                .collect::<Vec<_>>()
                .join(", ");
            println!("Badges: {badges}");
        }
        let scores = &analysis.scores;
        println!(
            "Scores: work={:.2} personal={:.2} urgency={:.2} financial={:.2} social={:.2} promo={:.2} action={:.2}",
            scores.work_related,
            scores.personal,
            scores.urgency,
            scores.financial,
            scores.social,
            scores.promotional,
            scores.requires_action
        );
        if let Some(model) = &analysis.model {
            println!("Model: {model}");
        }
    }
}
