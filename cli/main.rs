#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{CommandFactory, Parser, Subcommand};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process;

use chordfit::analysis::run_analysis;
use chordfit::chords::all_chords;
use chordfit::config::AnalysisConfig;
use chordfit::data::TsvDirectory;
use chordfit::normalize::summarize;
use chordfit::predict::ModelKind;
use chordfit::report::{write_records, write_summary};

#[derive(Parser)]
#[command(
    name = "chordfit",
    about = "Cross-validated encoding models for finger-chord activity patterns",
    long_about = "Fits a family of finger-chord encoding models with a Bayesian ridge \
                 estimator, cross-validates them across measurement runs, and normalizes \
                 the fits between a null model and the noise ceiling."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Cross-validate every configured model for every participant and region
    Fit {
        /// Analysis configuration (TOML)
        #[arg(long, value_name = "TOML")]
        config: PathBuf,

        /// Directory holding <participant>/<region>.tsv observation tables
        #[arg(long, value_name = "DIR")]
        data_dir: PathBuf,

        /// Output TSV with one row per participant, region and model
        #[arg(long, value_name = "TSV")]
        output: PathBuf,

        /// Optional TSV with per region/model means and standard errors
        #[arg(long, value_name = "TSV")]
        summary: Option<PathBuf>,

        /// Log progress per unit and fold instead of showing a progress bar
        #[arg(long)]
        verbose: bool,
    },

    /// Print the chord design matrix of a model
    Designs {
        /// Model name; all models with a design when omitted
        #[arg(long, value_name = "NAME")]
        model: Option<String>,
    },
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp(None)
        .init();
}

fn run_fit(
    config_path: PathBuf,
    data_dir: PathBuf,
    output: PathBuf,
    summary: Option<PathBuf>,
    verbose: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AnalysisConfig::load(&config_path)?;
    config.verbose |= verbose;
    init_logging(config.verbose);

    println!(
        "Fitting {} models for {} participants in {} regions",
        config.models.len(),
        config.participants.len(),
        config.regions.len()
    );
    let source = TsvDirectory::new(data_dir);
    let report = run_analysis(&config, &source)?;

    for failure in &report.failures {
        eprintln!("Skipped {}: {}", failure.unit, failure.reason);
    }

    write_records(BufWriter::new(File::create(&output)?), &report.fits)?;
    println!("Wrote {} fit records to {}", report.fits.len(), output.display());

    if let Some(path) = summary {
        let groups = summarize(&report.fits);
        write_summary(BufWriter::new(File::create(&path)?), &groups)?;
        println!("Wrote {} group summaries to {}", groups.len(), path.display());
    }
    Ok(())
}

fn run_designs(model: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let models = match model {
        Some(name) => vec![name.parse::<ModelKind>()?],
        None => ModelKind::ALL.to_vec(),
    };
    for model in models {
        let Some(design) = model.design() else {
            println!("# {model}: digit-count averages of training patterns, no design\n");
            continue;
        };
        println!("# {model} ({} features)", design.num_features());
        println!("chord\t{}", design.feature_labels.join("\t"));
        for (chord, row) in all_chords().iter().zip(design.matrix.rows()) {
            let cells: Vec<String> = row.iter().map(|v| format!("{v}")).collect();
            println!("{chord}\t{}", cells.join("\t"));
        }
        println!();
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Fit {
            config,
            data_dir,
            output,
            summary,
            verbose,
        }) => run_fit(config, data_dir, output, summary, verbose),
        Some(Commands::Designs { model }) => run_designs(model),
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
