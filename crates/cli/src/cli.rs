use std::path::PathBuf;
use std::time::Duration;

use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "pixcache", about = "HTTP-aware image cache", version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Override the cache directory
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load an image through the cache and report where it came from
    Fetch {
        /// Image URL
        url: String,

        /// Copy the image to this file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Treat the disk cache as authoritative and ignore caching headers
        #[arg(long)]
        no_server_policy: bool,
    },

    /// Delete cached files by age
    Purge(PurgeArgs),

    /// Print the effective configuration as JSON
    Config,
}

#[derive(ClapArgs, Debug)]
#[group(required = true, multiple = false)]
pub struct PurgeArgs {
    /// Remove files older than this many days
    #[arg(long)]
    pub days: Option<u64>,

    /// Remove files older than this many hours
    #[arg(long)]
    pub hours: Option<u64>,

    /// Remove files older than one week
    #[arg(long)]
    pub week: bool,
}

impl PurgeArgs {
    pub fn max_age(&self) -> Duration {
        const HOUR: u64 = 60 * 60;
        match (self.days, self.hours) {
            (Some(days), _) => Duration::from_secs(days.saturating_mul(24 * HOUR)),
            (None, Some(hours)) => Duration::from_secs(hours.saturating_mul(HOUR)),
            (None, None) => Duration::from_secs(7 * 24 * HOUR),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fetch() {
        let args = Args::parse_from(["pixcache", "fetch", "https://x/img.png", "--no-server-policy"]);
        match args.command {
            Commands::Fetch { url, output, no_server_policy } => {
                assert_eq!(url, "https://x/img.png");
                assert!(output.is_none());
                assert!(no_server_policy);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_purge_age() {
        let args = Args::parse_from(["pixcache", "purge", "--hours", "3"]);
        let Commands::Purge(purge) = args.command else { panic!("expected purge") };
        assert_eq!(purge.max_age(), Duration::from_secs(3 * 3600));

        let args = Args::parse_from(["pixcache", "purge", "--week"]);
        let Commands::Purge(purge) = args.command else { panic!("expected purge") };
        assert_eq!(purge.max_age(), Duration::from_secs(7 * 24 * 3600));
    }

    #[test]
    fn test_purge_age_saturates() {
        let args = Args::parse_from(["pixcache", "purge", "--days", &u64::MAX.to_string()]);
        let Commands::Purge(purge) = args.command else { panic!("expected purge") };
        assert_eq!(purge.max_age(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_purge_requires_one_age() {
        assert!(Args::try_parse_from(["pixcache", "purge"]).is_err());
        assert!(Args::try_parse_from(["pixcache", "purge", "--days", "1", "--week"]).is_err());
    }
}
