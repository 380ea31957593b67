//! Producing the raw backup payload.
//!
//! The engine never talks to the database itself; it asks a [`DumpSource`]
//! to fill an output directory and inspects what comes back.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};

use keeper_types::{BackupFormat, BackupKind, JobOptions};

use crate::config::SourceConfig;
use crate::error::{KeeperError, Result};

/// What to dump and where to put it.
#[derive(Debug, Clone)]
pub struct DumpRequest {
    pub kind: BackupKind,
    pub format: BackupFormat,
    pub since: Option<DateTime<Utc>>,
    pub options: JobOptions,
    /// Empty directory the dump must write into.
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpOutput {
    pub path: PathBuf,
    pub files: usize,
    pub bytes: u64,
}

#[async_trait]
pub trait DumpSource: Send + Sync {
    /// Check that the target is reachable.
    async fn ping(&self) -> Result<()>;

    async fn dump(&self, request: &DumpRequest) -> Result<DumpOutput>;
}

/// Runs configured shell command templates.
pub struct CommandDumpSource {
    config: SourceConfig,
    timeout: Duration,
}

impl CommandDumpSource {
    pub fn new(config: SourceConfig) -> Result<Self> {
        let timeout = config.timeout_duration()?;
        Ok(Self { config, timeout })
    }

    async fn run(&self, template: &str, vars: &BTreeMap<&str, String>) -> Result<Vec<u8>> {
        let script = render_template(template, vars);
        tracing::debug!(command = %script, "running dump command");
        run_script_with_timeout(&script, self.timeout).await
    }

    fn base_vars(&self, request: &DumpRequest) -> BTreeMap<&'static str, String> {
        let mut vars = BTreeMap::new();
        vars.insert("target", self.config.target.clone());
        vars.insert("kind", request.kind.as_str().to_string());
        vars.insert(
            "since",
            request
                .since
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_default(),
        );
        vars.insert("query", request.options.query.clone().unwrap_or_default());
        vars.insert("fields", request.options.fields.join(","));
        vars
    }

    async fn dump_archive(&self, request: &DumpRequest) -> Result<()> {
        let template = self.config.archive_command.as_deref().ok_or_else(|| {
            KeeperError::Config("source.archive_command is required for archive backups".into())
        })?;
        let mut vars = self.base_vars(request);
        vars.insert("output", request.output_dir.display().to_string());
        // Archive dumps take a single collection filter; more than one means
        // the whole database.
        vars.insert(
            "collection",
            match request.options.collections.as_slice() {
                [one] => one.clone(),
                _ => String::new(),
            },
        );
        self.run(template, &vars).await?;
        Ok(())
    }

    async fn collections(&self, request: &DumpRequest) -> Result<Vec<String>> {
        let names = if !request.options.collections.is_empty() {
            request.options.collections.clone()
        } else if !self.config.collections.is_empty() {
            self.config.collections.clone()
        } else {
            let template = self.config.list_collections_command.as_deref().ok_or_else(|| {
                KeeperError::Config(
                    "structured exports need source.collections or source.list_collections_command"
                        .into(),
                )
            })?;
            let stdout = self.run(template, &self.base_vars(request)).await?;
            String::from_utf8_lossy(&stdout)
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()
        };
        Ok(filter_collections(names, self.config.include_system_collections))
    }

    async fn dump_export(&self, request: &DumpRequest) -> Result<()> {
        let template = self.config.export_command.as_deref().ok_or_else(|| {
            KeeperError::Config("source.export_command is required for structured exports".into())
        })?;
        let collections = self.collections(request).await?;
        if collections.is_empty() {
            return Err(KeeperError::Acquisition("no collections to export".into()));
        }
        for collection in collections {
            let file = request.output_dir.join(format!("{collection}.jsonl"));
            let mut vars = self.base_vars(request);
            vars.insert("output", file.display().to_string());
            vars.insert("collection", collection.clone());
            self.run(template, &vars).await.map_err(|e| match e {
                KeeperError::Acquisition(msg) => {
                    KeeperError::Acquisition(format!("collection '{collection}': {msg}"))
                }
                other => other,
            })?;
            tracing::info!(collection = %collection, "collection exported");
        }
        Ok(())
    }
}

#[async_trait]
impl DumpSource for CommandDumpSource {
    async fn ping(&self) -> Result<()> {
        let Some(template) = self.config.ping_command.as_deref() else {
            return Ok(());
        };
        let mut vars = BTreeMap::new();
        vars.insert("target", self.config.target.clone());
        self.run(template, &vars)
            .await
            .map(|_| ())
            .map_err(|e| KeeperError::Acquisition(format!("target unreachable: {e}")))
    }

    async fn dump(&self, request: &DumpRequest) -> Result<DumpOutput> {
        tokio::fs::create_dir_all(&request.output_dir).await?;
        match request.format {
            BackupFormat::Archive => self.dump_archive(request).await?,
            BackupFormat::StructuredExport => self.dump_export(request).await?,
        }
        inspect_output(&request.output_dir).await
    }
}

/// Count what a dump produced. An empty result is an acquisition failure.
pub async fn inspect_output(dir: &Path) -> Result<DumpOutput> {
    let root = dir.to_path_buf();
    let (files, bytes) = tokio::task::spawn_blocking(move || -> Result<(usize, u64)> {
        let mut files = 0;
        let mut bytes = 0;
        for entry in walkdir::WalkDir::new(&root) {
            let entry = entry.map_err(|e| KeeperError::Acquisition(e.to_string()))?;
            if entry.file_type().is_file() {
                files += 1;
                bytes += entry
                    .metadata()
                    .map_err(|e| KeeperError::Acquisition(e.to_string()))?
                    .len();
            }
        }
        Ok((files, bytes))
    })
    .await
    .map_err(|e| KeeperError::Other(format!("dump inspection panicked: {e}")))??;

    if files == 0 || bytes == 0 {
        return Err(KeeperError::Acquisition(format!(
            "dump produced no data in '{}'",
            dir.display()
        )));
    }
    Ok(DumpOutput {
        path: dir.to_path_buf(),
        files,
        bytes,
    })
}

fn filter_collections(names: Vec<String>, include_system: bool) -> Vec<String> {
    let mut names: Vec<String> = names
        .into_iter()
        .filter(|n| include_system || !n.starts_with("system."))
        .filter(|n| {
            let usable = !n.contains('/') && !n.starts_with('.');
            if !usable {
                tracing::warn!(collection = %n, "skipping collection with unusable name");
            }
            usable
        })
        .collect();
    names.sort();
    names.dedup();
    names
}

/// Replace `{name}` placeholders with shell-quoted values. Unknown
/// placeholders are left alone.
pub fn render_template(template: &str, vars: &BTreeMap<&str, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        let value = tail
            .find('}')
            .and_then(|close| vars.get(&tail[1..close]).map(|v| (close, v)));
        match value {
            Some((close, v)) => {
                out.push_str(&shell_escape(v));
                rest = &tail[close + 1..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Quote `value` for POSIX `sh`. Plain words pass through unchanged.
pub fn shell_escape(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./:=@,+%".contains(&b));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Run `script` with `sh -c`, killing it after `timeout`. A non-zero exit is
/// an acquisition error carrying the tail of stderr.
pub async fn run_script_with_timeout(script: &str, timeout: Duration) -> Result<Vec<u8>> {
    let child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| KeeperError::Acquisition(format!("failed to spawn dump command: {e}")))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| KeeperError::Acquisition(e.to_string()))?,
        Err(_) => {
            return Err(KeeperError::Acquisition(format!(
                "command timed out after {} seconds",
                timeout.as_secs()
            )))
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let lines: Vec<&str> = stderr.trim().lines().collect();
        let tail = lines[lines.len().saturating_sub(5)..].join("; ");
        return Err(KeeperError::Acquisition(format!(
            "command exited with {}: {}",
            output.status,
            if tail.is_empty() { "no output" } else { &tail }
        )));
    }
    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(dir: &Path) -> SourceConfig {
        let mut config: SourceConfig = serde_yaml::from_str("target: mongodb://db/shop").unwrap();
        config.archive_command = Some(format!(
            "mkdir -p {{output}}/shop && printf 'x' > {{output}}/shop/orders.bson && echo {{kind}} > {}/kind",
            dir.display()
        ));
        config.export_command = Some("echo '{\"c\":\"'{collection}'\"}' > {output}".into());
        config.timeout = "5s".into();
        config
    }

    fn request(dir: &Path, format: BackupFormat) -> DumpRequest {
        DumpRequest {
            kind: BackupKind::Full,
            format,
            since: None,
            options: JobOptions::default(),
            output_dir: dir.join("out"),
        }
    }

    #[test]
    fn escaping() {
        assert_eq!(shell_escape("mongodb://h:27017/db"), "mongodb://h:27017/db");
        assert_eq!(shell_escape(""), "''");
        assert_eq!(shell_escape("a b"), "'a b'");
        assert_eq!(shell_escape("it's"), r"'it'\''s'");
        assert_eq!(shell_escape("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn template_rendering() {
        let mut vars = BTreeMap::new();
        vars.insert("target", "mongodb://db".to_string());
        vars.insert("query", "{\"a\": 1}".to_string());
        let out = render_template("dump --uri={target} -q {query} {unknown}", &vars);
        assert_eq!(out, "dump --uri=mongodb://db -q '{\"a\": 1}' {unknown}");
    }

    #[test]
    fn system_collections_are_skipped() {
        let names = vec!["orders".into(), "system.views".into(), "customers".into(), "orders".into()];
        assert_eq!(filter_collections(names.clone(), false), vec!["customers", "orders"]);
        assert_eq!(filter_collections(names, true).len(), 3);
    }

    #[tokio::test]
    async fn archive_command_fills_output() {
        let tmp = tempfile::tempdir().unwrap();
        let src = CommandDumpSource::new(source(tmp.path())).unwrap();
        let out = src.dump(&request(tmp.path(), BackupFormat::Archive)).await.unwrap();
        assert_eq!(out.files, 1);
        assert_eq!(out.bytes, 1);
        assert_eq!(std::fs::read_to_string(tmp.path().join("kind")).unwrap().trim(), "full");
    }

    #[tokio::test]
    async fn export_writes_one_file_per_collection() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = source(tmp.path());
        config.collections = vec!["orders".into(), "system.users".into(), "products".into()];
        let src = CommandDumpSource::new(config).unwrap();
        let out = src
            .dump(&request(tmp.path(), BackupFormat::StructuredExport))
            .await
            .unwrap();
        assert_eq!(out.files, 2);
        let orders = std::fs::read_to_string(out.path.join("orders.jsonl")).unwrap();
        assert_eq!(orders.trim(), r#"{"c":"orders"}"#);
        assert!(!out.path.join("system.users.jsonl").exists());
    }

    #[tokio::test]
    async fn empty_output_is_acquisition_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = source(tmp.path());
        config.archive_command = Some("true".into());
        let src = CommandDumpSource::new(config).unwrap();
        let err = src
            .dump(&request(tmp.path(), BackupFormat::Archive))
            .await
            .unwrap_err();
        assert!(matches!(err, KeeperError::Acquisition(_)), "{err}");
    }

    #[tokio::test]
    async fn failing_command_reports_stderr() {
        let err = run_script_with_timeout("echo boom >&2; exit 3", Duration::from_secs(5))
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("boom"), "{err}");
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let err = run_script_with_timeout("sleep 5", Duration::from_millis(100))
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("timed out"), "{err}");
    }

    #[tokio::test]
    async fn missing_ping_command_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let src = CommandDumpSource::new(source(tmp.path())).unwrap();
        src.ping().await.unwrap();
    }
}
