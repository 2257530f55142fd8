use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kvgate")]
#[command(about = "kvgate CLI: inspect and operate the cache, rate-limit and session store")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Settings file (overrides KVGATE_CONFIG env var)
    #[arg(short, long, global = true, env = "KVGATE_CONFIG")]
    pub config: Option<String>,

    /// Log filter, e.g. "debug" or "kvgate_cache=trace" (RUST_LOG wins when set)
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    /// Route as this identity (feature-flag targeting)
    #[arg(short, long, global = true)]
    pub identity: Option<String>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check backend health and show diagnostics
    Health,
    /// Read a key
    Get(KeyArgs),
    /// Write a JSON value
    Set(SetArgs),
    /// Delete a key
    Del(KeyArgs),
    /// Delete every key matching a glob pattern
    Purge(PurgeArgs),
    /// Show a key's remaining lifetime
    Ttl(KeyArgs),
    /// List feature flags and how they evaluate
    Flags,
}

#[derive(clap::Args)]
pub struct KeyArgs {
    /// Cache key (e.g. cache:bounty:42)
    pub key: String,
}

#[derive(clap::Args)]
pub struct SetArgs {
    /// Cache key
    pub key: String,
    /// JSON value (e.g. '{"id": 42}' or '"text"')
    pub value: String,
    /// Lifetime in seconds; omitted or 0 means no expiry
    #[arg(long)]
    pub ttl: Option<u64>,
    /// Tags for group invalidation (repeatable)
    #[arg(long = "tag")]
    pub tags: Vec<String>,
}

#[derive(clap::Args)]
pub struct PurgeArgs {
    /// Glob pattern (e.g. "cache:bounty:*")
    pub pattern: String,
}
