use anyhow::Result;
use clap::Parser;
use std::path::Path;
use std::process::ExitCode;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;
use verdict::cli::{parse_extensions, Args, Command};
use verdict::config::ScanConfig;
use verdict::error::ScanError;
use verdict::mappings::CategoryMapper;
use verdict::model::ClassifierDriver;
use verdict::output::{render, OutputFormat};
use verdict::report::ScanReport;
use verdict::scanner::scan_path;
use verdict::tokens::TokenProjector;

fn main() -> ExitCode {
    let args = Args::parse();

    let env_filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if args.verbose {
        EnvFilter::new("verdict=debug")
    } else if args.quiet {
        EnvFilter::new("verdict=error")
    } else {
        EnvFilter::new("verdict=info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if !args.quiet {
        eprintln!("verdict v{}\n", env!("CARGO_PKG_VERSION"));
    }

    match run(args) {
        Ok(report) => {
            if report.is_malicious() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(2)
        }
    }
}

fn run(args: Args) -> Result<ScanReport> {
    let mapper = CategoryMapper::load()?;

    // A missing model cache is not fatal to the scan itself: the report
    // is produced with an inconclusive verdict instead.
    let driver = match ClassifierDriver::from_env() {
        Ok(driver) => Some(driver),
        Err(error) => {
            warn!(%error, "scanning without a classifier; verdict will be inconclusive");
            None
        }
    };

    match args.command {
        Command::Scan { path, threshold, extensions, format, save } => {
            let mut config = ScanConfig::default();
            if let Some(threshold) = threshold {
                config.threshold = threshold;
            }
            if let Some(extensions) = extensions {
                config.extensions = parse_extensions(&extensions);
            }
            let report =
                scan_path(Path::new(&path), &config, &mapper, driver.as_ref())?;
            emit(&report, format, save.as_deref(), &mapper, &config)?;
            Ok(report)
        }
        Command::Pypi { name, version, folder, threshold, format, save } => {
            let Some(folder) = folder else {
                return Err(ScanError::config_invalid(format!(
                    "downloading {name}{} from the registry is handled by the fetch \
                     tooling; pass --folder with the downloaded archive or unpacked tree",
                    version.map(|v| format!(" {v}")).unwrap_or_default()
                ))
                .into());
            };
            let staged = verdict::registry::stage_folder(Path::new(&folder))?;
            debug!(staged = %staged.display(), "scanning staged package");

            let mut config = ScanConfig::default();
            if let Some(threshold) = threshold {
                config.threshold = threshold;
            }
            let report = scan_path(&staged, &config, &mapper, driver.as_ref())?;
            emit(&report, format, save.as_deref(), &mapper, &config)?;
            Ok(report)
        }
    }
}

fn emit(
    report: &ScanReport,
    format: OutputFormat,
    save: Option<&str>,
    mapper: &CategoryMapper,
    config: &ScanConfig,
) -> Result<()> {
    let projector = TokenProjector::new(mapper, config.short_string_threshold);
    let rendered = render(report, format, &projector);
    match save {
        Some(path) => std::fs::write(path, rendered)?,
        None => print!("{rendered}"),
    }
    Ok(())
}
