use anyhow::Result;
use colored::Colorize;
use kvgate_cache::{BackendKind, CacheContext, CacheStats, KeyValueStore};
use kvgate_config::{FeatureContext, FeatureFlagType};
use serde_json::json;

use crate::output::print_json;

pub async fn health(ctx: &CacheContext, identity: Option<&str>, as_json: bool) -> Result<()> {
    let mut diagnostics = ctx.diagnostics().await;
    if identity.is_some() {
        let backend = ctx.selector().select(identity);
        diagnostics.mode = backend.kind();
        diagnostics.health = backend.health_check().await;
    }

    if as_json {
        print_json(&serde_json::to_value(&diagnostics)?);
    } else {
        let mode = match diagnostics.mode {
            BackendKind::Remote => diagnostics.mode.as_str().green(),
            BackendKind::Fallback => diagnostics.mode.as_str().yellow(),
            BackendKind::Disabled => diagnostics.mode.as_str().red(),
        };
        println!("{}: {}", "Mode".cyan(), mode);
        println!(
            "{}: {}",
            "Remote configured".cyan(),
            if diagnostics.remote_configured { "yes" } else { "no" }
        );

        let health = &diagnostics.health;
        if health.connected {
            println!(
                "{} {} is {} ({}ms)",
                "✓".green(),
                health.backend.cyan(),
                "healthy".green(),
                health.latency_ms
            );
        } else {
            println!(
                "{} {} is {}: {}",
                "✗".red(),
                health.backend.cyan(),
                "unavailable".red(),
                health.error.as_deref().unwrap_or("unknown error")
            );
        }

        if let Some(ref stats) = diagnostics.fallback {
            println!("{}: {}", "Fallback store".cyan(), fallback_summary(stats));
        }
        println!(
            "{}: {}",
            "Local rate windows".cyan(),
            diagnostics.local_rate_windows
        );
    }

    if !diagnostics.health.connected {
        anyhow::bail!("{} backend is not healthy", diagnostics.health.backend);
    }
    Ok(())
}

fn fallback_summary(stats: &CacheStats) -> String {
    format!(
        "{} entries, {} tags, hit rate {:.1}%, {} evicted",
        stats.size,
        stats.tags,
        stats.hit_rate(),
        stats.evictions
    )
}

pub fn flags(ctx: &CacheContext, identity: Option<&str>, as_json: bool) -> Result<()> {
    let snapshot = ctx.flags().load();
    let context = identity.map(FeatureContext::for_identity).unwrap_or_default();

    let mut flags: Vec<_> = snapshot.list().collect();
    flags.sort_by(|a, b| a.name.cmp(&b.name));

    if as_json {
        let rows: Vec<_> = flags
            .iter()
            .map(|flag| {
                json!({
                    "name": flag.name,
                    "active": flag.evaluate(&context),
                    "flag": flag,
                })
            })
            .collect();
        print_json(&json!(rows));
        return Ok(());
    }

    if flags.is_empty() {
        println!("No feature flags defined.");
        return Ok(());
    }
    for flag in flags {
        let state = if flag.evaluate(&context) {
            "on".green()
        } else {
            "off".red()
        };
        let kind = match &flag.flag_type {
            FeatureFlagType::Boolean => "boolean".to_string(),
            FeatureFlagType::Percentage { value } => format!("percentage {value}%"),
            FeatureFlagType::Allowlist { identities } => {
                format!("allowlist ({} identities)", identities.len())
            }
            FeatureFlagType::TimeWindow { .. } => "time window".to_string(),
        };
        println!("{} [{}] {}", flag.name.cyan(), state, kind);
        if let Some(ref description) = flag.description {
            println!("  {description}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_summary_hit_rate() {
        let stats = CacheStats {
            size: 10,
            tags: 2,
            hits: 3,
            misses: 1,
            evictions: 5,
        };
        assert_eq!(
            fallback_summary(&stats),
            "10 entries, 2 tags, hit rate 75.0%, 5 evicted"
        );
    }
}
