//! Engine configuration loaded from environment variables.
//!
//! | Env var                   | Default                    |
//! |---------------------------|----------------------------|
//! | `MP3IFY_DATA_DIR`         | `dbs`                      |
//! | `MP3IFY_RESULT_DIR`       | `converted`                |
//! | `MP3IFY_WORK_DIR`         | `<tmp>/mp3ify-working-dir` |
//! | `MP3IFY_WORKERS`          | `4`                        |
//! | `MP3IFY_KEEP_ALIVE_SECS`  | `5`                        |
//! | `MP3IFY_REAP_INTERVAL_MS` | `100`                      |
//! | `MP3IFY_CONVERTER`        | `youtube-dl`               |
//!
//! Unparseable numeric values fall back to their defaults.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use mp3ify_events::DEFAULT_KEEP_ALIVE_INTERVAL;

use crate::process::DEFAULT_REAP_INTERVAL;

/// Placeholder in converter arguments replaced by the source reference.
pub const SOURCE_PLACEHOLDER: &str = "{source}";

/// Default worker pool size.
pub const DEFAULT_WORKERS: usize = 4;

/// Default converter program.
pub const DEFAULT_CONVERTER: &str = "youtube-dl";

/// Argument template for [`DEFAULT_CONVERTER`].
pub const DEFAULT_CONVERTER_ARGS: &[&str] = &[
    "--prefer-ffmpeg",
    "--no-mtime",
    "--extract-audio",
    "--audio-format",
    "mp3",
    "--add-metadata",
    "--embed-thumbnail",
    "--output",
    "%(title)s.%(ext)s",
    SOURCE_PLACEHOLDER,
];

// ---------------------------------------------------------------------------
// ConverterConfig
// ---------------------------------------------------------------------------

/// The external program that performs a conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConverterConfig {
    /// Program name or path. Bare names are resolved on the search path at
    /// engine start.
    pub program: String,
    /// Argument template; every [`SOURCE_PLACEHOLDER`] occurrence is
    /// replaced with the source reference.
    pub args: Vec<String>,
}

impl ConverterConfig {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn render_args(&self, source: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace(SOURCE_PLACEHOLDER, source))
            .collect()
    }

    /// Build the converter invocation for `source`, running in `work_dir`
    /// with both output pipes captured.
    pub fn command(&self, source: &str, work_dir: &Path) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(self.render_args(source))
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CONVERTER, DEFAULT_CONVERTER_ARGS.iter().copied())
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Everything the job engine needs to start.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding the durable stores.
    pub data_dir: PathBuf,
    /// Content-addressed result directory.
    pub result_dir: PathBuf,
    /// Parent of the per-job scratch directories.
    pub work_dir: PathBuf,
    pub workers: usize,
    pub keep_alive_interval: Duration,
    pub reap_interval: Duration,
    pub converter: ConverterConfig,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            data_dir: env_path("MP3IFY_DATA_DIR").unwrap_or(defaults.data_dir),
            result_dir: env_path("MP3IFY_RESULT_DIR").unwrap_or(defaults.result_dir),
            work_dir: env_path("MP3IFY_WORK_DIR").unwrap_or(defaults.work_dir),
            workers: env_parse::<usize>("MP3IFY_WORKERS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.workers),
            keep_alive_interval: env_parse::<u64>("MP3IFY_KEEP_ALIVE_SECS")
                .filter(|n| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.keep_alive_interval),
            reap_interval: env_parse::<u64>("MP3IFY_REAP_INTERVAL_MS")
                .filter(|n| *n > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.reap_interval),
            converter: match std::env::var("MP3IFY_CONVERTER") {
                Ok(program) if !program.trim().is_empty() => ConverterConfig {
                    program,
                    ..defaults.converter
                },
                _ => defaults.converter,
            },
        }
    }

    /// Config rooted entirely under `root`, for tests and embedding.
    pub fn rooted_at(root: &Path, converter: ConverterConfig) -> Self {
        Self {
            data_dir: root.join("dbs"),
            result_dir: root.join("converted"),
            work_dir: root.join("work"),
            converter,
            ..Self::default()
        }
    }

    pub fn jobs_store_path(&self) -> PathBuf {
        self.data_dir.join("jobs.json")
    }

    pub fn resubmit_store_path(&self) -> PathBuf {
        self.data_dir.join("resubmit.json")
    }

    pub fn result_names_path(&self) -> PathBuf {
        self.data_dir.join("result-names.json")
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("dbs"),
            result_dir: PathBuf::from("converted"),
            work_dir: std::env::temp_dir().join("mp3ify-working-dir"),
            workers: DEFAULT_WORKERS,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            reap_interval: DEFAULT_REAP_INTERVAL,
            converter: ConverterConfig::default(),
        }
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_args_end_with_source() {
        let converter = ConverterConfig::default();
        let args = converter.render_args("https://youtu.be/abc");

        assert_eq!(converter.program, "youtube-dl");
        assert_eq!(args.first().map(String::as_str), Some("--prefer-ffmpeg"));
        assert_eq!(args.last().map(String::as_str), Some("https://youtu.be/abc"));
        assert!(args.contains(&"%(title)s.%(ext)s".to_string()));
    }

    #[test]
    fn placeholder_is_replaced_inside_arguments() {
        let converter = ConverterConfig::new("sh", ["-c", "echo {source}", "x-{source}-y"]);
        assert_eq!(
            converter.render_args("A"),
            vec!["-c".to_string(), "echo A".to_string(), "x-A-y".to_string()]
        );
    }

    #[test]
    fn rooted_config_keeps_everything_under_root() {
        let root = Path::new("/srv/mp3ify");
        let config = EngineConfig::rooted_at(root, ConverterConfig::default());

        assert!(config.data_dir.starts_with(root));
        assert!(config.result_dir.starts_with(root));
        assert!(config.work_dir.starts_with(root));
        assert_eq!(config.jobs_store_path(), root.join("dbs/jobs.json"));
        assert_eq!(config.workers, DEFAULT_WORKERS);
    }
}
