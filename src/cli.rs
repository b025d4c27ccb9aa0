//! Command-line interface definitions for News Relay.
//!
//! All options can be provided via command-line flags or environment variables.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Command-line arguments for the News Relay orchestrator.
///
/// # Examples
///
/// ```sh
/// # Resume from the last snapshot and process every configured source
/// news_relay run -c news_relay.yaml
///
/// # Only two sources, ignoring any snapshot
/// news_relay run -c news_relay.yaml --sources golf.com,mygolfspy.com --fresh
///
/// # Print the progress feed of a running instance
/// news_relay status -c news_relay.yaml
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Discover and process articles until the queues drain
    Run(RunArgs),
    /// Print the progress feed written by a running orchestrator
    Status(StatusArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Optional path to the YAML configuration file
    #[arg(short, long, env = "NEWS_RELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Comma-separated source names to run (default: all configured sources)
    #[arg(short, long, value_delimiter = ',')]
    pub sources: Vec<String>,

    /// Ignore any existing snapshot and start cold
    #[arg(long)]
    pub fresh: bool,

    /// Override the discovery worker cap
    #[arg(long, env = "NEWS_RELAY_MAX_CONCURRENT_SOURCES")]
    pub max_concurrent_sources: Option<usize>,

    /// Override the article worker cap
    #[arg(long, env = "NEWS_RELAY_MAX_CONCURRENT_ARTICLES")]
    pub max_concurrent_articles: Option<usize>,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Optional path to the YAML configuration file
    #[arg(short, long, env = "NEWS_RELAY_CONFIG")]
    pub config: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_parsing() {
        let cli = Cli::parse_from([
            "news_relay",
            "run",
            "--config",
            "./relay.yaml",
            "--sources",
            "golf.com,mygolfspy.com",
            "--fresh",
            "--max-concurrent-articles",
            "5",
        ]);

        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.config, Some(PathBuf::from("./relay.yaml")));
        assert_eq!(args.sources, vec!["golf.com", "mygolfspy.com"]);
        assert!(args.fresh);
        assert_eq!(args.max_concurrent_articles, Some(5));
    }

    #[test]
    fn test_run_short_flags() {
        let cli = Cli::parse_from(["news_relay", "run", "-c", "/etc/relay.yaml", "-s", "golf.com"]);

        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.config, Some(PathBuf::from("/etc/relay.yaml")));
        assert_eq!(args.sources, vec!["golf.com"]);
        assert!(!args.fresh);
    }

    #[test]
    fn test_status_parsing() {
        let cli = Cli::parse_from(["news_relay", "status", "-c", "relay.yaml"]);
        assert!(matches!(cli.command, Command::Status(_)));
    }
}
