//! Command-line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "marionette",
    about = "Supervised desktop automation with safety and dialog watchdogs",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run an automation profile under supervision
    Run {
        /// Profile name (profiles/<name>.yaml)
        profile: String,

        /// Safety level: disabled, low, medium, high
        #[arg(long, default_value = "medium")]
        safety_level: String,

        /// Use inert backends: log decisions without driving the desktop
        #[arg(long)]
        dry_run: bool,

        #[arg(long, default_value = "profiles")]
        profiles_dir: PathBuf,

        #[arg(long, default_value = "logs")]
        logs_dir: PathBuf,
    },

    /// Create a starter profile to edit
    Init {
        profile: String,

        #[arg(long, default_value = "profiles")]
        profiles_dir: PathBuf,
    },

    /// List available profiles
    List {
        #[arg(long, default_value = "profiles")]
        profiles_dir: PathBuf,
    },

    /// Classify dialog text the way the watchdog would
    Classify {
        #[arg(long)]
        title: String,

        #[arg(long, default_value = "")]
        content: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_flags() {
        let cli = Cli::parse_from([
            "marionette",
            "run",
            "raid",
            "--safety-level",
            "high",
            "--dry-run",
            "-vv",
        ]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Run {
                profile,
                safety_level,
                dry_run,
                ..
            } => {
                assert_eq!(profile, "raid");
                assert_eq!(safety_level, "high");
                assert!(dry_run);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_classify() {
        let cli = Cli::parse_from(["marionette", "classify", "--title", "确认删除"]);
        match cli.command {
            Command::Classify { title, content } => {
                assert_eq!(title, "确认删除");
                assert_eq!(content, "");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
