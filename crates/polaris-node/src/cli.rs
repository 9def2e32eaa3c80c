//! CLI argument parsing for polaris-node

use clap::Parser;
use std::path::PathBuf;

/// Polaris ledger node
#[derive(Parser, Debug, Clone)]
#[command(name = "polaris")]
#[command(about = "Polaris DAG ledger node")]
#[command(version)]
pub struct Cli {
    /// Data directory for ledger storage
    #[arg(long, default_value = "./data")]
    pub datadir: PathBuf,

    /// Configuration file (JSON); defaults apply when omitted
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Roll back from the external store before starting:
    /// "highest" or "<height>:<hash>"
    #[arg(long)]
    pub rollback: Option<String>,

    /// Log filter (overrides RUST_LOG)
    #[arg(long, default_value = "info")]
    pub log: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["polaris"]);
        assert_eq!(cli.datadir, PathBuf::from("./data"));
        assert!(cli.config.is_none());
        assert!(cli.rollback.is_none());
        assert_eq!(cli.log, "info");
    }

    #[test]
    fn test_rollback_flag() {
        let cli = Cli::parse_from(["polaris", "--rollback", "highest"]);
        assert_eq!(cli.rollback.as_deref(), Some("highest"));
    }
}
