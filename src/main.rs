use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod catalog;
mod cli;
mod config;
mod context;
mod embeddings;
mod index;
mod indexer;
mod preprocess;
mod search;
#[cfg(test)]
mod tests;
mod web;

use cli::Command;
use config::Config;
use context::{collect_status, open_catalog, open_indexes, AppContext};
use search::Query;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();
    init_logging();

    let config = Config::load()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?
        .block_on(run(args.command, config))
}

async fn run(command: Command, config: Config) -> anyhow::Result<()> {
    match command {
        Command::Build { only } => {
            let ctx = AppContext::open(config).await?;
            let report = ctx.indexer().rebuild(only).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Command::Search { mode, query, top_k } => {
            let query = match mode.query_modality() {
                index::Modality::Text => Query::Text(query),
                index::Modality::Image => {
                    let path = PathBuf::from(query);
                    if !path.is_file() {
                        anyhow::bail!("{} is not a file", path.display());
                    }
                    Query::Image(path)
                }
            };

            let ctx = AppContext::open(config).await?;
            let results = ctx.router().search(mode, query, top_k).await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }

        Command::Status {} => {
            let store = open_catalog(&config).await?;
            let indexes = open_indexes(&config)?;
            let status = collect_status(&store, &indexes).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Command::Daemon {} => {
            let ctx = AppContext::open(config).await?;
            web::start_daemon(ctx).await?;
        }
    }

    Ok(())
}
