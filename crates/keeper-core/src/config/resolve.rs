use std::fmt;
use std::path::{Path, PathBuf};

use super::types::KeeperConfig;
use crate::error::{KeeperError, Result};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "KEEPER_CONFIG";

/// Expand `${VAR}` and `${VAR:-default}` placeholders in raw config text.
fn expand_env_placeholders(input: &str, origin: &str) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut cursor = 0usize;

    while let Some(offset) = input[cursor..].find("${") {
        let start = cursor + offset;
        out.push_str(&input[cursor..start]);

        let token_start = start + 2;
        let Some(token_end_rel) = input[token_start..].find('}') else {
            return Err(expand_error(origin, input, start, "unterminated environment placeholder"));
        };
        let token_end = token_start + token_end_rel;
        let token = &input[token_start..token_end];
        out.push_str(&resolve_env_token(token, origin, input, start)?);
        cursor = token_end + 1;
    }

    out.push_str(&input[cursor..]);
    Ok(out)
}

fn resolve_env_token(token: &str, origin: &str, input: &str, start: usize) -> Result<String> {
    let (name, default) = match token.split_once(":-") {
        Some((name, default)) => (name, Some(default)),
        None => (token, None),
    };
    if !is_valid_env_var_name(name) {
        return Err(expand_error(
            origin,
            input,
            start,
            format!("invalid environment variable name '{name}'"),
        ));
    }

    match std::env::var(name) {
        Ok(value) if !value.is_empty() || default.is_none() => Ok(value),
        Ok(_) | Err(std::env::VarError::NotPresent) if default.is_some() => {
            Ok(default.unwrap_or_default().to_string())
        }
        Err(std::env::VarError::NotUnicode(_)) => Err(expand_error(
            origin,
            input,
            start,
            format!("environment variable '{name}' is not valid UTF-8"),
        )),
        _ => Err(expand_error(
            origin,
            input,
            start,
            format!("environment variable '{name}' is not set"),
        )),
    }
}

fn is_valid_env_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first == '_' || first.is_ascii_alphabetic()) && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn expand_error(origin: &str, input: &str, start: usize, message: impl fmt::Display) -> KeeperError {
    let (line, column) = byte_offset_to_line_col(input, start);
    KeeperError::Config(format!(
        "invalid config '{origin}': {message} at line {line}, column {column}"
    ))
}

fn byte_offset_to_line_col(input: &str, byte_offset: usize) -> (usize, usize) {
    let before = &input[..byte_offset];
    let line = before.matches('\n').count() + 1;
    let column = before.rsplit('\n').next().map_or(0, |l| l.chars().count()) + 1;
    (line, column)
}

/// Parse config text. `origin` is only used in error messages.
pub fn parse_config(contents: &str, origin: &str) -> Result<KeeperConfig> {
    let expanded = expand_env_placeholders(contents, origin)?;
    let config: KeeperConfig = serde_yaml::from_str(&expanded)
        .map_err(|e| KeeperError::Config(format!("invalid config '{origin}': {e}")))?;
    config.validate()?;
    Ok(config)
}

/// Read, expand and validate a config file.
pub fn load_config(path: &Path) -> Result<KeeperConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| KeeperError::Config(format!("cannot read '{}': {e}", path.display())))?;
    parse_config(&contents, &path.display().to_string())
}

/// Tracks where the config file was found.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// Explicitly passed via `--config`.
    CliArg(PathBuf),
    /// Set via the `KEEPER_CONFIG` env var.
    EnvVar(PathBuf),
    /// Found by searching standard locations.
    SearchOrder { path: PathBuf, level: &'static str },
}

impl ConfigSource {
    pub fn path(&self) -> &Path {
        match self {
            ConfigSource::CliArg(p) | ConfigSource::EnvVar(p) => p,
            ConfigSource::SearchOrder { path, .. } => path,
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::CliArg(p) => write!(f, "{} (--config)", p.display()),
            ConfigSource::EnvVar(p) => write!(f, "{} ({CONFIG_ENV_VAR})", p.display()),
            ConfigSource::SearchOrder { path, level } => write!(f, "{} ({level})", path.display()),
        }
    }
}

/// Search locations in priority order: project, user, system.
pub fn default_config_search_paths() -> Vec<(PathBuf, &'static str)> {
    let mut paths = vec![(PathBuf::from("keeper.yaml"), "project")];
    if let Some(base) = dirs::config_dir() {
        paths.push((base.join("keeper").join("config.yaml"), "user"));
    }
    paths.push((PathBuf::from("/etc/keeper/config.yaml"), "system"));
    paths
}

/// Resolve which config file to use.
///
/// Priority: CLI arg > `KEEPER_CONFIG` > first existing file from the search paths.
pub fn resolve_config_path(cli_config: Option<&str>) -> Option<ConfigSource> {
    if let Some(path) = cli_config {
        return Some(ConfigSource::CliArg(PathBuf::from(path)));
    }

    if let Ok(val) = std::env::var(CONFIG_ENV_VAR) {
        if !val.is_empty() {
            return Some(ConfigSource::EnvVar(PathBuf::from(val)));
        }
    }

    default_config_search_paths()
        .into_iter()
        .find(|(path, _)| path.exists())
        .map(|(path, level)| ConfigSource::SearchOrder { path, level })
}

/// A commented starter config that parses as-is.
pub fn minimal_config_template() -> &'static str {
    r#"# keeper configuration file

storage:
  local:
    base_path: /var/backups/keeper
  # remote:
  #   - name: offsite
  #     bucket: my-backups
  #     region: eu-west-1
  #     prefix: prod
  #     access_key_id: ${AWS_ACCESS_KEY_ID}
  #     secret_access_key: ${AWS_SECRET_ACCESS_KEY}

source:
  target: ${DATABASE_URL:-mongodb://localhost:27017/shop}
  ping_command: "mongosh {target} --quiet --eval 'db.runCommand({ping: 1})'"
  archive_command: "mongodump --uri={target} --out={output}"
  # The command above always dumps everything. For incremental and
  # differential runs, filter on {since} (empty for full backups), e.g.:
  # archive_command: "mongodump --uri={target} --out={output} --query='{\"updatedAt\": {\"$gte\": {\"$date\": \"{since}\"}}}'"
  # Structured exports also receive --query as {query}.
  export_command: "mongoexport --uri={target} --collection={collection} --out={output}"
  list_collections_command: "mongosh {target} --quiet --eval 'db.getCollectionNames().join(\"\\n\")'"

compression:
  algorithm: gzip
  level: 6

# encryption:
#   enabled: true
#   key_path: /etc/keeper/keys

retention:
  full:
    max_age_days: 30
    max_count: 10
    min_count: 3

schedule:
  full:
    daily_at: "01:00"
  # incremental:
  #   every: 6h
  cleanup:
    daily_at: "02:00"
  job_timeout: 30m

# notifications:
#   webhook_url: https://hooks.example.com/keeper
"#
}
