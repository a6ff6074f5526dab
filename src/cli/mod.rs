pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::cli::config::CrawlerConfig;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to the per-user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to a file (the per-user data directory when no path is given)
    #[arg(long, global = true, num_args = 0..=1)]
    pub log_file: Option<Option<PathBuf>>,

    #[command(subcommand)]
    command: Commands,
}

/// Settings that can be overridden per run
#[derive(Args, Debug, Default, Clone)]
pub struct PipelineOverrides {
    /// Number of simultaneous browser instances
    #[arg(short = 'n', long)]
    crawlers: Option<usize>,

    /// Number of storage workers
    #[arg(short = 's', long)]
    storers: Option<usize>,

    /// Enable the Prometheus monitoring endpoint
    #[arg(short, long)]
    monitor: bool,

    /// Port for the Prometheus monitoring endpoint
    #[arg(long)]
    prom_port: Option<u16>,
}

impl PipelineOverrides {
    /// Apply the overrides on top of file configuration
    pub fn apply(&self, config: &mut CrawlerConfig) {
        if let Some(crawlers) = self.crawlers {
            config.pipeline.crawlers = crawlers;
        }
        if let Some(storers) = self.storers {
            config.pipeline.storers = storers;
        }
        if self.monitor {
            config.monitoring.enabled = true;
        }
        if let Some(port) = self.prom_port {
            config.monitoring.port = port;
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl the tasks of a task file
    File {
        /// Task file: a task, an array of tasks, or a compressed task
        #[arg(short, long, required = true)]
        taskfile: PathBuf,

        #[command(flatten)]
        overrides: PipelineOverrides,
    },

    /// Crawl tasks consumed from a Redis queue
    Client {
        /// Redis URL, overriding the configuration
        #[arg(long)]
        redis_url: Option<String>,

        /// Queue name, overriding the configuration
        #[arg(short, long)]
        queue: Option<String>,

        /// Stop once the queue is empty
        #[arg(long)]
        exit_when_empty: bool,

        #[command(flatten)]
        overrides: PipelineOverrides,
    },

    /// Push the tasks of a task file into the Redis queue
    Enqueue {
        #[arg(short, long, required = true)]
        taskfile: PathBuf,

        #[arg(long)]
        redis_url: Option<String>,

        #[arg(short, long)]
        queue: Option<String>,
    },

    /// Show the effective configuration
    Config {
        /// Write the default configuration file
        #[arg(long)]
        init: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

impl Cli {
    /// Where to write the log file, if anywhere
    pub fn log_file(&self) -> Option<PathBuf> {
        self.log_file.as_ref().map(|path| path.clone().unwrap_or_else(crate::utils::default_log_file))
    }
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::File { taskfile, overrides } => {
            info!("Crawling tasks from {}", taskfile.display());
            commands::run_file(config_path, &taskfile, &overrides).await
        },
        Commands::Client { redis_url, queue, exit_when_empty, overrides } => {
            commands::run_client(config_path, redis_url, queue, exit_when_empty, &overrides).await
        },
        Commands::Enqueue { taskfile, redis_url, queue } => {
            commands::enqueue(config_path, &taskfile, redis_url, queue).await
        },
        Commands::Config { init } => {
            if init {
                commands::init_config(config_path)
            } else {
                commands::show_config(config_path)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }

    #[test]
    fn test_overrides_applied() {
        let cli = Cli::parse_from(["crawler", "file", "-t", "tasks.json", "-n", "4", "--monitor", "--prom-port", "9100"]);
        let Commands::File { overrides, .. } = cli.command else {
            panic!("expected the file command");
        };

        let mut config = CrawlerConfig::default();
        overrides.apply(&mut config);
        assert_eq!(config.pipeline.crawlers, 4);
        assert_eq!(config.pipeline.storers, 1);
        assert!(config.monitoring.enabled);
        assert_eq!(config.monitoring.port, 9100);
    }

    #[test]
    fn test_log_file_flag() {
        let cli = Cli::parse_from(["crawler", "config"]);
        assert_eq!(cli.log_file(), None);

        let cli = Cli::parse_from(["crawler", "--log-file", "run.log", "config"]);
        assert_eq!(cli.log_file(), Some(PathBuf::from("run.log")));

        let cli = Cli::parse_from(["crawler", "config", "--log-file"]);
        assert!(cli.log_file().unwrap().ends_with("crawler.log"));
    }
}
