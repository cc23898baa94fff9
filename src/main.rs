use affiliation_sync::{
    load_affiliations, load_alias_rules, load_projects, run_sync, Config, ProfileStore,
    SqlSearchClient, SyncInputs, VERSION,
};
use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::backtrace::Backtrace;
use std::path::Path;
use std::process;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "affiliation_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::parse();

    if let Err(err) = run(config).await {
        eprintln!(
            "Error(time={}):\nError: {:?}\nStacktrace:\n{}",
            Utc::now(),
            err,
            Backtrace::force_capture()
        );
        process::exit(1);
    }
}

async fn run(config: Config) -> Result<()> {
    config.validate()?;
    tracing::info!(version = VERSION, "affiliation sync starting");

    let db_path = config.db.as_deref().context("profile store path is required")?;
    let store = ProfileStore::open(db_path)?;

    let options = config.sync_options();
    let (inputs, search_url) = if config.test_connect {
        (SyncInputs::default(), String::new())
    } else {
        (read_inputs(&config)?, config.es_url.clone().unwrap_or_default())
    };

    let backend = SqlSearchClient::new(&search_url, config.request_timeout())?;
    let summary = run_sync(&store, &backend, inputs, &options).await?;

    print!("{}", summary);
    if !summary.test_connect && !summary.dry_run {
        println!("All finished OK");
    }
    Ok(())
}

fn read_inputs(config: &Config) -> Result<SyncInputs> {
    let records = load_affiliations(&config.affiliations)?;
    tracing::info!(records = records.len(), path = %config.affiliations.display(), "affiliation feed read");

    let rules = load_alias_rules(&config.companies)?;
    tracing::info!(rules = rules.len(), path = %config.companies.display(), "alias rules read");

    let projects_path: &Path = config
        .projects
        .as_deref()
        .context("project registry path is required")?;
    let projects = load_projects(projects_path)?;
    tracing::info!(projects = projects.len(), "project registry read");

    Ok(SyncInputs {
        records,
        rules,
        projects,
    })
}
