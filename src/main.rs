use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use updates::{verify_export, Manifest, Platform, VerificationReport};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that every exported asset is embedded or shipped for a platform
    #[command(name = "assets-verify")]
    AssetsVerify {
        /// Directory produced by the export step
        #[arg(long)]
        export_dir: PathBuf,
        /// Native build directory holding the embedded manifest
        #[arg(long)]
        build_dir: PathBuf,
        /// Target platform (ios or android)
        #[arg(long)]
        platform: Platform,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Parse a manifest and print its normalized form
    Inspect {
        /// Path to a manifest file
        manifest: PathBuf,
        /// Runtime version to check compatibility against
        #[arg(long)]
        runtime_version: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    run(Cli::parse())
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::AssetsVerify {
            export_dir,
            build_dir,
            platform,
            json,
        } => {
            let report = verify_export(&export_dir, &build_dir, platform)
                .with_context(|| format!("verifying export in {}", export_dir.display()))?;
            print_report(&report, json)?;
            // Missing assets are reported, not fatal.
            if !report.is_complete() {
                warn!(missing = report.missing.len(), "export is incomplete");
            }
        }
        Commands::Inspect {
            manifest,
            runtime_version,
        } => {
            let raw = fs::read(&manifest)
                .with_context(|| format!("reading {}", manifest.display()))?;
            let parsed = Manifest::parse(&raw)?;
            println!("{}", serde_json::to_string_pretty(&parsed.to_value())?);
            if let Some(version) = runtime_version {
                let compatible = parsed.is_compatible(&version);
                info!(update_id = %parsed.id(), runtime_version = %version, compatible, "compatibility");
                println!("compatible with {version}: {compatible}");
            }
        }
    }

    Ok(())
}

fn print_report(report: &VerificationReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    if report.is_complete() {
        println!(
            "All {} assets for {} are present.",
            report.checked, report.platform
        );
        return Ok(());
    }

    println!(
        "{} of {} assets for {} are missing:",
        report.missing.len(),
        report.checked,
        report.platform
    );
    for missing in &report.missing {
        match &missing.path {
            Some(path) => println!("  {} ({path})", missing.hash),
            None => println!("  {}", missing.hash),
        }
    }
    Ok(())
}
