//! Configuration for pipewatch.
//!
//! The [`Config`] struct is not constructable, use [`ConfigBuilder`].
//!
//! # Examples
//!
//! ```
//! # use pipewatch::config::ConfigBuilder;
//! ConfigBuilder::default()
//!     .sequential(vec!["cargo build".to_string(), "cargo test".to_string()])
//!     .background(vec!["cargo run".to_string()])
//!     .build()
//!     .expect("mission failed");
//! ```

use std::{path::PathBuf, time::Duration};

use crate::command::{StageKind, StageSpec};
use crate::error::Result;
use crate::pipeline::DEFAULT_KILL_TIMEOUT;

/// Arguments to the watcher
#[derive(Builder, Clone, Debug)]
#[builder(setter(into))]
#[builder(build_fn(validate = "Self::validate"))]
pub struct Config {
    /// Commands run one after another on every change; a failure stops the chain.
    pub sequential: Vec<String>,
    /// Commands started once the sequential chain has passed, not waited on.
    #[builder(default)]
    pub background: Vec<String>,
    /// Exclusion patterns, relative to the watched directory. Gitignore format.
    #[builder(default)]
    pub ignores: Vec<String>,
    /// Report captured output for passing stages too.
    #[builder(default)]
    pub verbose: bool,
    /// Directory to watch.
    #[builder(default = "PathBuf::from(\".\")")]
    pub path: PathBuf,
    /// Run the pipeline right after starting, if there is anything to watch.
    #[builder(default = "true")]
    pub run_initially: bool,
    /// Force using the polling backend.
    #[builder(default)]
    pub poll: bool,
    /// Interval for polling.
    #[builder(default = "Duration::from_secs(1)")]
    pub poll_interval: Duration,
    /// Grace period between asking a stage to terminate and killing it.
    #[builder(default = "DEFAULT_KILL_TIMEOUT")]
    pub kill_timeout: Duration,
}

impl ConfigBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.sequential.as_ref().map_or(true, Vec::is_empty) {
            return Err("at least one sequential command is required".into());
        }

        Ok(())
    }
}

impl Config {
    /// Tokenizes every command, sequential ones first.
    pub fn stage_specs(&self) -> Result<Vec<StageSpec>> {
        let sequential = self
            .sequential
            .iter()
            .map(|cmd| StageSpec::parse(cmd, StageKind::Sequential));
        let background = self
            .background
            .iter()
            .map(|cmd| StageSpec::parse(cmd, StageKind::Background));

        sequential.chain(background).collect()
    }

    pub fn polling(&self) -> Option<Duration> {
        if self.poll {
            Some(self.poll_interval)
        } else {
            None
        }
    }
}
