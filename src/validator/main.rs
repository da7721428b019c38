//! Standalone validator for worker records files.
//!
//! Checks a workers JSON file before deployment: credential problems,
//! duplicate channel requirements (after normalization), and delivery
//! timestamps that have already passed.

use std::collections::HashSet;
use std::process::ExitCode;

use chrono::Utc;
use clap::Parser;

// Import from the main crate
use subgate_bot::gate::ChannelRef;
use subgate_bot::storage::RecordsFile;

/// Worker records validator.
#[derive(Parser, Debug)]
#[command(name = "validate_workers")]
#[command(about = "Validates worker records files for the subscription gate")]
#[command(version)]
struct Args {
    /// Path to the JSON records file to validate.
    #[arg(short, long, default_value = "workers.json")]
    file: String,

    /// Generate an example records file at the specified path.
    #[arg(long)]
    generate_example: Option<String>,

    /// Show detailed information for each worker.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Handle example generation
    if let Some(output_path) = args.generate_example {
        return generate_example(&output_path);
    }

    validate_records(&args.file, args.verbose)
}

fn generate_example(output_path: &str) -> ExitCode {
    let example = RecordsFile::example();

    match example.save(output_path) {
        Ok(()) => {
            println!("✓ Example worker records written to: {output_path}");
            println!("\nThe file contains {} example worker(s).", example.workers.len());
            println!("Fill in real bot tokens and channel requirements before use.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("✗ Failed to write example file: {e}");
            ExitCode::FAILURE
        }
    }
}

fn validate_records(path: &str, verbose: bool) -> ExitCode {
    println!("Validating: {path}\n");

    let records = match RecordsFile::load(path) {
        Ok(records) => records,
        Err(e) => {
            eprintln!("✗ Failed to load records: {e}");
            return ExitCode::FAILURE;
        }
    };

    let now = Utc::now();
    let mut errors = 0;
    let mut warnings = 0;
    let mut seen_tokens: HashSet<&str> = HashSet::new();
    let mut seen_ids: HashSet<i64> = HashSet::new();

    for worker in &records.workers {
        let mut worker_errors = 0;
        let requirements: Vec<_> = records
            .requirements
            .iter()
            .filter(|r| r.worker_id == worker.id)
            .collect();
        let active = requirements.iter().filter(|r| r.is_active).count();

        if verbose {
            println!(
                "[{}] @{} ({}, {} requirement(s), {} active)",
                worker.id,
                worker.username,
                if worker.enabled { "enabled" } else { "disabled" },
                requirements.len(),
                active
            );
        }

        if !seen_ids.insert(worker.id) {
            worker_errors += 1;
            println!("  ✗ Error: duplicate worker id {}", worker.id);
        }

        if worker.token.trim().is_empty() {
            worker_errors += 1;
            println!("  ✗ Error: worker {} has an empty credential token", worker.id);
        } else if !seen_tokens.insert(worker.token.as_str()) {
            worker_errors += 1;
            println!("  ✗ Error: worker {} reuses another worker's token", worker.id);
        }

        // Requirement identifiers must be unique after normalization.
        let mut seen_channels: HashSet<ChannelRef> = HashSet::new();
        for requirement in &requirements {
            let normalized = ChannelRef::normalize(requirement.channel.as_str());
            if !seen_channels.insert(normalized.clone()) {
                worker_errors += 1;
                println!(
                    "  ✗ Error: worker {} requires channel {normalized} more than once",
                    worker.id
                );
            }
        }

        if worker.enabled && active == 0 {
            warnings += 1;
            if verbose {
                println!("  ⚠ Warning: enabled but gates nothing (no active requirements)");
            }
        }

        if let Some(deliver_at) = worker.deliver_at
            && deliver_at <= now {
                warnings += 1;
                if verbose {
                    println!("  ⚠ Warning: delivery time {deliver_at} has already passed");
                }
            }

        if verbose && worker_errors == 0 {
            println!("  ✓ OK");
        }
        errors += worker_errors;
    }

    println!();

    let total = records.workers.len();
    if errors == 0 {
        println!("✓ All {total} workers are valid!");
        if warnings > 0 {
            println!("  ({warnings} warning(s) - run with --verbose for details)");
        }
        ExitCode::SUCCESS
    } else {
        println!("✗ Validation failed: {errors} error(s) in {total} workers");
        ExitCode::FAILURE
    }
}
