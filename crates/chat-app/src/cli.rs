use std::path::PathBuf;

use clap::Parser;

/// Terminal chat client that streams replies and keeps the conversation on disk.
#[derive(Parser, Debug)]
#[command(name = "murmur", version, about)]
pub struct Cli {
    /// Settings file to read instead of the default location
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// SQLite history file (overrides settings)
    #[arg(long, value_name = "PATH", conflicts_with = "ephemeral")]
    pub database: Option<PathBuf>,

    /// Keep history in memory only
    #[arg(long)]
    pub ephemeral: bool,

    /// Backend provider id: openai, http or scripted (overrides settings)
    #[arg(short, long, value_name = "ID")]
    pub provider: Option<String>,

    /// Model id passed to the backend (overrides settings)
    #[arg(short, long, value_name = "MODEL")]
    pub model: Option<String>,

    /// Verbosity level (-v = debug, -vv = trace); RUST_LOG takes precedence
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_parse() {
        let cli = Cli::parse_from([
            "murmur",
            "--provider",
            "scripted",
            "--database",
            "/tmp/h.sqlite3",
            "-vv",
        ]);
        assert_eq!(cli.provider.as_deref(), Some("scripted"));
        assert_eq!(cli.database, Some(PathBuf::from("/tmp/h.sqlite3")));
        assert_eq!(cli.verbose, 2);
        assert!(!cli.ephemeral);
    }

    #[test]
    fn ephemeral_conflicts_with_database() {
        let result = Cli::try_parse_from(["murmur", "--ephemeral", "--database", "x.sqlite3"]);
        assert!(result.is_err());
    }
}
