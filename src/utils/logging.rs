use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use std::path::{Path, PathBuf};
use std::fs;

/// Filter directives: the crate at `info` (or `debug` when verbose), others at `warn`
fn filter(verbose: bool) -> Result<EnvFilter> {
    let crate_level = if verbose { "debug" } else { "info" };
    Ok(EnvFilter::from_default_env()
        .add_directive(format!("crawler={}", crate_level).parse()?)
        .add_directive("warn".parse()?))
}

/// Initialize the logging system
pub fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let env_filter = filter(verbose)?;

    let fmt_layer = fmt::layer().with_target(true);

    if let Some(log_file) = log_file {
        if let Some(parent) = log_file.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = fs::File::create(log_file)?;
        let file_layer = fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_writer(file);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    }

    Ok(())
}

/// Default log file path
pub fn default_log_file() -> PathBuf {
    let mut path = if let Some(proj_dirs) = directories::ProjectDirs::from("org", "measure-crawler", "measure-crawler") {
        proj_dirs.data_dir().to_path_buf()
    } else {
        PathBuf::from("./logs")
    };

    path.push("crawler.log");
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directives_parse() {
        let quiet = filter(false).unwrap().to_string();
        assert!(quiet.contains("crawler=info"));

        let verbose = filter(true).unwrap().to_string();
        assert!(verbose.contains("crawler=debug"));
    }

    #[test]
    fn test_default_log_file_name() {
        assert!(default_log_file().ends_with("crawler.log"));
    }
}
