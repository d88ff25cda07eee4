use chrono::{Local, NaiveDate, Timelike, Utc};
use clap::Parser;
use tracing::info;

use costline::app::{AppConfig, ProviderConfig};
use costline::cli::{Cli, Commands};
use costline::error::{Error, Result};
use costline::platform::AppPaths;
use costline::projection::ProjectionEngine;
use costline::providers::{AnthropicUsageProvider, OpenAIUsageProvider, UsageProvider};
use costline::storage::{Database, IdentityRepository, SyncStateRepository, UsageRepository};
use costline::sync::SyncEngine;

struct App {
    config: AppConfig,
    engine: SyncEngine,
    usage: UsageRepository,
    providers: Vec<Box<dyn UsageProvider>>,
}

async fn init_app(cli: &Cli) -> Result<App> {
    let paths = match &cli.data_dir {
        Some(dir) => AppPaths::with_data_dir(dir)?,
        None => AppPaths::new()?,
    };
    paths.ensure_dirs_exist()?;

    let config = AppConfig::load(&paths).await?;
    let db = Database::new(&paths).await?;

    let engine = SyncEngine::new(
        UsageRepository::new(db.pool().clone()),
        IdentityRepository::new(db.pool().clone()),
        SyncStateRepository::new(db.pool().clone()),
        config.sync.clone(),
    );
    let usage = UsageRepository::new(db.pool().clone());

    let mut providers: Vec<Box<dyn UsageProvider>> = Vec::new();
    for name in config.enabled_providers() {
        let provider_config = &config.providers[name];
        providers.push(build_provider(name, provider_config)?);
    }

    Ok(App {
        config,
        engine,
        usage,
        providers,
    })
}

fn build_provider(name: &str, config: &ProviderConfig) -> Result<Box<dyn UsageProvider>> {
    let timeout = config.timeout_seconds.unwrap_or(60);
    match name {
        "anthropic" => Ok(Box::new(AnthropicUsageProvider::new(
            config.api_endpoint.clone(),
            timeout,
        )?)),
        "openai" => Ok(Box::new(OpenAIUsageProvider::new(
            config.api_endpoint.clone(),
            timeout,
        )?)),
        other => Err(Error::config(format!("Unknown provider '{}'", other))),
    }
}

fn selected<'a>(
    providers: &'a [Box<dyn UsageProvider>],
    filter: &Option<String>,
) -> Vec<&'a dyn UsageProvider> {
    providers
        .iter()
        .map(|p| p.as_ref())
        .filter(|p| filter.as_deref().map_or(true, |name| p.name() == name))
        .collect()
}

async fn run(cli: Cli) -> Result<()> {
    let app = init_app(&cli).await?;

    match &cli.command {
        Commands::Sync { provider } => {
            for p in selected(&app.providers, provider) {
                let credentials = match app.config.credentials_for(p.name()) {
                    Ok(creds) => creds,
                    Err(e) => {
                        println!("{}: {}", p.name(), e);
                        continue;
                    }
                };
                let outcome = app.engine.sync_forward(p, credentials, Utc::now()).await;
                print_counts(p.name(), outcome.imported, outcome.skipped, &outcome.errors);
                if outcome.rate_limited {
                    println!("{}: rate limited, will continue on next run", p.name());
                }
            }
        }

        Commands::Backfill { provider, target } => {
            let target = parse_date(target)?;
            for p in selected(&app.providers, provider) {
                let credentials = match app.config.credentials_for(p.name()) {
                    Ok(creds) => creds,
                    Err(e) => {
                        println!("{}: {}", p.name(), e);
                        continue;
                    }
                };
                let outcome = app.engine.backfill(p, credentials, target, Utc::now()).await;
                print_counts(p.name(), outcome.imported, outcome.skipped, &outcome.errors);
                if outcome.rate_limited {
                    println!("{}: rate limited, will continue on next run", p.name());
                } else if outcome.backfill_complete {
                    println!("{}: history exhausted, backfill complete", p.name());
                } else if let Some(date) = outcome.last_processed_date {
                    println!("{}: backfilled down to {}", p.name(), date);
                }
            }
        }

        Commands::Status => {
            for p in app.providers.iter().map(|p| p.as_ref()) {
                let status = app.engine.get_sync_state(p).await?;
                println!("{}:", p.name());
                println!("  forward cursor:   {:?}", status.last_forward_cursor);
                println!(
                    "  last synced:      {}",
                    status.last_sync_at.as_deref().unwrap_or("never")
                );
                println!(
                    "  oldest data:      {}",
                    status
                        .backfill
                        .oldest_date
                        .map(|d| d.to_string())
                        .unwrap_or_else(|| "none".to_string())
                );
                println!("  backfill done:    {}", status.backfill.complete);
            }
        }

        Commands::SyncIdentities { provider } => {
            for p in selected(&app.providers, provider) {
                let credentials = match app.config.credentials_for(p.name()) {
                    Ok(creds) => creds,
                    Err(e) => {
                        println!("{}: {}", p.name(), e);
                        continue;
                    }
                };
                let outcome = app.engine.refresh_identity_mappings(p, credentials).await?;
                println!(
                    "{}: mapped {}, unresolved {}",
                    p.name(),
                    outcome.mapped,
                    outcome.unresolved
                );
            }
        }

        Commands::MapIdentity {
            tool,
            external_id,
            identity,
        } => {
            let rewritten = app
                .engine
                .set_identity_mapping(tool, external_id, identity)
                .await?;
            println!("Mapped {}:{} -> {} ({} rows rewritten)", tool, external_id, identity, rewritten);
        }

        Commands::UnmapIdentity { tool, external_id } => {
            if app.engine.remove_identity_mapping(tool, external_id).await? {
                println!("Unmapped {}:{}", tool, external_id);
            } else {
                println!("No mapping found for {}:{}", tool, external_id);
            }
        }

        Commands::ResetBackfill { provider } => {
            app.engine.reset_backfill(provider).await?;
            println!("Backfill state reset for {}", provider);
        }

        Commands::Report { days } => {
            let now = Local::now();
            let today = now.date_naive();
            let local_hour = now.hour() as f64 + now.minute() as f64 / 60.0;

            let start = today - chrono::Duration::days(*days as i64);
            let series = app.usage.daily_series(start, today).await?;

            let provider_refs: Vec<&dyn UsageProvider> =
                app.providers.iter().map(|p| p.as_ref()).collect();
            let completeness = app.engine.completeness_map(&provider_refs).await?;

            let projection = ProjectionEngine::new(app.config.projection.clone());
            for point in projection.project(&series, &completeness, today, local_hour) {
                let marker = if point.projected_tokens.is_some() {
                    "~"
                } else if point.is_incomplete {
                    "?"
                } else {
                    " "
                };
                println!(
                    "{} {:12} {}{:>12.0} tokens  (actual {}, cost {})",
                    point.date,
                    point.tool,
                    marker,
                    point.displayed_tokens(),
                    point.actual_tokens,
                    point.cost
                );
            }
        }
    }

    Ok(())
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| Error::config(format!("Invalid date '{}': {}", s, e)))
}

fn print_counts(provider: &str, imported: usize, skipped: usize, errors: &[String]) {
    println!("{}: imported {}, skipped {}", provider, imported, skipped);
    for error in errors.iter().take(5) {
        println!("{}: error: {}", provider, error);
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let directive = if cli.debug { "costline=debug" } else { "costline=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(directive.parse().unwrap()),
        )
        .init();

    info!("Starting costline");

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
