//! Shared helpers for the CLI: tracing, configuration, small formatting
//! utilities.

use std::io::{self, BufRead, Write as _};
use std::path::Path;

use anyhow::{Context, Result, bail};
use rago_agent::RagoConfig;
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;

use crate::cli::GlobalArgs;

/// Initialize the tracing subscriber. `RUST_LOG` wins over `--verbose`.
pub fn init_tracing(verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

/// Load `.env`, then the configuration file.
pub fn load_config(global: &GlobalArgs) -> Result<RagoConfig> {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();
    let config = RagoConfig::load(global.config.as_deref()).context("failed to load configuration")?;
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data directory {}", config.data_dir.display()))?;
    Ok(config)
}

/// Parse `key=value` pairs. Values that parse as JSON keep their type.
pub fn parse_metadata(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut map = Map::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("metadata must be KEY=VALUE, got `{pair}`");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("metadata key is empty in `{pair}`");
        }
        let value = serde_json::from_str(value.trim()).unwrap_or_else(|_| Value::String(value.trim().to_owned()));
        map.insert(key.to_owned(), value);
    }
    Ok(map)
}

/// Cut `s` to at most `max` characters, marking the cut.
pub fn truncate(s: &str, max: usize) -> String {
    let flat = s.replace('\n', " ");
    if flat.chars().count() <= max {
        return flat;
    }
    let mut out: String = flat.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

/// Ask a yes/no question on stdin. Anything but `y`/`yes` is a no.
pub fn confirm(question: &str) -> Result<bool> {
    print!("{question} [y/N] ");
    io::stdout().flush().context("failed to flush stdout")?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer).context("failed to read answer")?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

pub fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_keeps_json_types() {
        let map = parse_metadata(&["lang=rust".into(), "year=2024".into(), "draft=true".into()]).unwrap();
        assert_eq!(map["lang"], Value::String("rust".into()));
        assert_eq!(map["year"], Value::from(2024));
        assert_eq!(map["draft"], Value::Bool(true));
    }

    #[test]
    fn metadata_rejects_bad_pairs() {
        assert!(parse_metadata(&["novalue".into()]).is_err());
        assert!(parse_metadata(&["=x".into()]).is_err());
    }

    #[test]
    fn truncate_flattens_and_cuts() {
        assert_eq!(truncate("a\nb", 10), "a b");
        assert_eq!(truncate("abcdefghij", 6), "abc...");
        assert_eq!(truncate("héllo wörld", 8), "héllo...");
    }
}
