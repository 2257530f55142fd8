mod cli;
mod commands;
mod observability;
mod output;

use anyhow::{Context, Result};
use clap::Parser;

use cli::{Cli, Commands};
use kvgate_cache::CacheContext;
use kvgate_cache::config::loader::load_settings;
use output::print_error;

#[tokio::main]
async fn main() {
    // .env is optional
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    observability::init_tracing_with_level("warn");

    if let Err(e) = run().await {
        print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    if std::env::var_os("RUST_LOG").is_none() {
        observability::apply_logging_level(&cli.log_level);
    }

    let settings = load_settings(cli.config.as_deref()).context("Failed to load settings")?;
    let ctx = CacheContext::from_settings(settings);
    let identity = cli.identity.as_deref();

    match &cli.command {
        Commands::Health => commands::status::health(&ctx, identity, cli.json).await?,
        Commands::Get(args) => commands::store::get(&ctx, identity, &args.key, cli.json).await?,
        Commands::Set(args) => commands::store::set(&ctx, identity, args).await?,
        Commands::Del(args) => commands::store::del(&ctx, identity, &args.key).await?,
        Commands::Purge(args) => {
            commands::store::purge(&ctx, identity, &args.pattern, cli.json).await?
        }
        Commands::Ttl(args) => commands::store::ttl(&ctx, identity, &args.key, cli.json).await?,
        Commands::Flags => commands::status::flags(&ctx, identity, cli.json)?,
    }

    Ok(())
}
