//! Command-line interface definitions.

use crate::output::OutputFormat;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "verdict")]
#[command(about = "Offline malware scanner for source packages")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Verbose logging (RUST_LOG overrides this)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress status output; only the report goes to stdout
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Scan a file or directory
    Scan {
        /// Path to a source file or package directory
        path: String,

        /// Maliciousness threshold in [0, 1]
        #[arg(long, value_name = "F")]
        threshold: Option<f32>,

        /// Comma-separated extensions to accept (default: py,js,mjs,cjs)
        #[arg(long, value_name = "EXT,...")]
        extensions: Option<String>,

        /// Output format
        #[arg(long, value_enum, default_value = "tree")]
        format: OutputFormat,

        /// Write the report to a file instead of stdout
        #[arg(long, value_name = "FILE")]
        save: Option<String>,
    },

    /// Scan a PyPI package staged in a local folder
    Pypi {
        /// Package name (informational; fetching is not done here)
        name: String,

        /// Package version
        version: Option<String>,

        /// Folder holding the downloaded archive or unpacked package
        #[arg(long, value_name = "DIR")]
        folder: Option<String>,

        /// Maliciousness threshold in [0, 1]
        #[arg(long, value_name = "F")]
        threshold: Option<f32>,

        /// Output format
        #[arg(long, value_enum, default_value = "tree")]
        format: OutputFormat,

        /// Write the report to a file instead of stdout
        #[arg(long, value_name = "FILE")]
        save: Option<String>,
    },
}

/// Split a `--extensions` value into the accepted-extension list.
pub fn parse_extensions(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_parse_with_dots_and_spaces() {
        assert_eq!(parse_extensions("py, .js ,MJS"), vec!["py", "js", "mjs"]);
        assert_eq!(parse_extensions(""), Vec::<String>::new());
    }

    #[test]
    fn cli_parses_scan_command() {
        let args = Args::try_parse_from([
            "verdict", "scan", "/tmp/pkg", "--threshold", "0.8", "--format", "json",
        ])
        .unwrap();
        match args.command {
            Command::Scan { threshold, format, .. } => {
                assert_eq!(threshold, Some(0.8));
                assert_eq!(format, OutputFormat::Json);
            }
            _ => panic!("expected scan command"),
        }
    }

    #[test]
    fn cli_parses_pypi_command() {
        let args = Args::try_parse_from([
            "verdict", "pypi", "requests", "2.32.0", "--folder", "/tmp/dl",
        ])
        .unwrap();
        match args.command {
            Command::Pypi { name, version, folder, .. } => {
                assert_eq!(name, "requests");
                assert_eq!(version.as_deref(), Some("2.32.0"));
                assert_eq!(folder.as_deref(), Some("/tmp/dl"));
            }
            _ => panic!("expected pypi command"),
        }
    }
}
