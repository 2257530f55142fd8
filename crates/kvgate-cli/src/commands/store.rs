use anyhow::{Context, Result};
use colored::Colorize;
use kvgate_cache::store::{TTL_MISSING, TTL_PERSISTENT};
use kvgate_cache::{CacheContext, CacheEnvelope, KeyValueStore};
use serde_json::{Value, json};

use crate::cli::SetArgs;
use crate::output::{print_json, print_miss, print_payload, print_success};

pub async fn get(ctx: &CacheContext, identity: Option<&str>, key: &str, as_json: bool) -> Result<()> {
    let backend = ctx.selector().select(identity);
    let payload = backend.get_raw(key).await;

    if as_json {
        let value = payload
            .as_deref()
            .map(|raw| serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())));
        print_json(&json!({ "key": key, "backend": backend.backend_name(), "value": value }));
        return Ok(());
    }

    match payload {
        Some(raw) => print_payload(&raw),
        None => print_miss(&format!("{} not found ({})", key.cyan(), backend.backend_name())),
    }
    Ok(())
}

pub async fn set(ctx: &CacheContext, identity: Option<&str>, args: &SetArgs) -> Result<()> {
    let value: Value = serde_json::from_str(&args.value)
        .with_context(|| format!("Invalid JSON value for {}", args.key))?;
    let backend = ctx.selector().select(identity);

    let stored = if args.tags.is_empty() {
        backend.set(&args.key, &value, args.ttl).await
    } else {
        let envelope = CacheEnvelope {
            value,
            tags: args.tags.clone(),
        };
        let payload = serde_json::to_string(&envelope)?;
        backend
            .set_with_tags(&args.key, &payload, args.ttl, &args.tags)
            .await
    };

    if !stored {
        anyhow::bail!(
            "{} backend did not store {} (see logs with --log-level warn)",
            backend.backend_name(),
            args.key
        );
    }
    let ttl = match args.ttl {
        Some(secs) if secs > 0 => format!(" (ttl {secs}s)"),
        _ => String::new(),
    };
    print_success(&format!("Stored {}{ttl}", args.key.cyan()));
    Ok(())
}

pub async fn del(ctx: &CacheContext, identity: Option<&str>, key: &str) -> Result<()> {
    if ctx.selector().select(identity).delete(key).await {
        print_success(&format!("Deleted {}", key.cyan()));
    } else {
        print_miss(&format!("{} not found", key.cyan()));
    }
    Ok(())
}

pub async fn purge(
    ctx: &CacheContext,
    identity: Option<&str>,
    pattern: &str,
    as_json: bool,
) -> Result<()> {
    let removed = ctx.selector().select(identity).delete_by_pattern(pattern).await;
    if as_json {
        print_json(&json!({ "pattern": pattern, "deleted": removed }));
    } else {
        print_success(&format!("Deleted {removed} key(s) matching {}", pattern.cyan()));
    }
    Ok(())
}

pub async fn ttl(ctx: &CacheContext, identity: Option<&str>, key: &str, as_json: bool) -> Result<()> {
    let ttl = ctx.selector().select(identity).ttl(key).await;
    if as_json {
        print_json(&json!({ "key": key, "ttl": ttl }));
        return Ok(());
    }

    match ttl {
        TTL_MISSING => print_miss(&format!("{} not found", key.cyan())),
        TTL_PERSISTENT => println!("{}: {}", key.cyan(), "no expiry".yellow()),
        secs => println!("{}: {secs}s", key.cyan()),
    }
    Ok(())
}
