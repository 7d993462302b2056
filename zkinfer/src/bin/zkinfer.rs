//! `zkinfer` CLI binary.
//!
//! Runs the artifact pipeline for a model file or the built-in benchmark MLP.
//!
//! ```text
//! # whole pipeline for the built-in MLP at depth 2^3
//! zkinfer run --exp 3
//!
//! # a model file with explicit input and calibration data
//! zkinfer run --model model.json --input input.json --calibration calib.json
//!
//! # parallel depth sweep over depths 2, 4, 8
//! zkinfer sweep --exps 1,2,3
//!
//! # circuit summary only
//! zkinfer inspect --exp 2
//! ```
//!
//! Logging goes to stderr and is controlled with `RUST_LOG` (default `info`).

use std::error::Error;
use std::path::PathBuf;
use std::process;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use zkinfer::compiler::import::{load_calibration_json, load_input_json};
use zkinfer::compiler::inspect::summarize_circuit;
use zkinfer::pipeline::sweep::depth_sweep;
use zkinfer::prelude::*;

/// zkinfer: proving artifacts for feed-forward network inference.
#[derive(Parser, Debug)]
#[command(name = "zkinfer", version, about)]
struct Cli {
    /// JSON pipeline config. Flags override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Artifact cache directory.
    #[arg(long, global = true)]
    artifact_dir: Option<PathBuf>,

    /// Reference-string directory.
    #[arg(long, global = true)]
    srs_dir: Option<PathBuf>,

    /// Output tolerance for settings generation.
    #[arg(long, global = true)]
    tolerance: Option<f64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the whole pipeline once.
    Run {
        #[command(flatten)]
        model: ModelArgs,

        /// JSON input file (`{"input_data": [[...]]}`); defaults to all ones.
        #[arg(long)]
        input: Option<PathBuf>,

        /// JSON calibration file (`{"input_data": [[...]], "output_data": [[...]]}`).
        #[arg(long)]
        calibration: Option<PathBuf>,

        /// Stop after witness generation.
        #[arg(long)]
        no_setup: bool,

        /// Print the run report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Run the built-in MLP at depths 2^exp in parallel.
    Sweep {
        /// Comma-separated depth exponents.
        #[arg(long, value_delimiter = ',', default_value = "1,2,3")]
        exps: Vec<u32>,

        #[arg(long, default_value_t = 5)]
        width: usize,

        #[arg(long, default_value_t = 0.2)]
        weight: f64,

        #[arg(long, default_value_t = 0.1)]
        bias: f64,
    },
    /// Print a compiled circuit summary.
    Inspect {
        #[command(flatten)]
        model: ModelArgs,
    },
}

#[derive(Args, Debug)]
struct ModelArgs {
    /// JSON model file. Without it the built-in MLP is used.
    #[arg(long)]
    model: Option<PathBuf>,

    /// Built-in MLP depth is 2^exp.
    #[arg(long, default_value_t = 1)]
    exp: u32,

    #[arg(long, default_value_t = 5)]
    width: usize,

    #[arg(long, default_value_t = 0.2)]
    weight: f64,

    #[arg(long, default_value_t = 0.1)]
    bias: f64,
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {message}");
    process::exit(1);
}

fn load_config(cli: &Cli) -> PipelineConfig {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path).unwrap_or_else(|e| fail(e)),
        None => PipelineConfig::default(),
    };
    if let Some(dir) = &cli.artifact_dir {
        config.artifact_dir = Some(dir.clone());
    }
    if let Some(dir) = &cli.srs_dir {
        config.srs.dir = dir.clone();
    }
    if let Some(tolerance) = cli.tolerance {
        config.settings.tolerance = tolerance;
    }
    config
}

fn load_descriptor(args: &ModelArgs) -> ModelDescriptor {
    match &args.model {
        Some(path) => {
            eprintln!("Loading model: {}", path.display());
            load_model_json(path).unwrap_or_else(|e| fail(e))
        }
        None => {
            let depth = 1usize << args.exp;
            eprintln!(
                "Building MLP: depth {depth}, width {}, weight {}, bias {}",
                args.width, args.weight, args.bias
            );
            build_mlp(depth, args.width, args.weight, args.bias)
        }
    }
}

fn report_pipeline_error(err: &PipelineError) -> ! {
    eprintln!("Error: {err}");
    let mut source = err.source();
    while let Some(cause) = source {
        eprintln!("  caused by: {cause}");
        source = cause.source();
    }
    if let Some(bits) = err.retry_hint() {
        eprintln!("  hint: regenerate settings with at least {bits} bits");
    }
    process::exit(1);
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli);

    match &cli.command {
        Command::Run {
            model,
            input,
            calibration,
            no_setup,
            json,
        } => {
            if *no_setup {
                config.run_setup = false;
            }
            let descriptor = load_descriptor(model);
            let input = match input {
                Some(path) => load_input_json(path).unwrap_or_else(|e| fail(e)),
                None => InputData::new(vec![1.0; descriptor.input_dim]),
            };
            let calibration = calibration
                .as_ref()
                .map(|path| load_calibration_json(path).unwrap_or_else(|e| fail(e)));

            let pipeline = Pipeline::new(config);
            match pipeline.run(&descriptor, calibration.as_ref(), &input) {
                Ok(report) if *json => match serde_json::to_string_pretty(&report) {
                    Ok(text) => println!("{text}"),
                    Err(e) => fail(e),
                },
                Ok(report) => println!("{report}"),
                Err(e) => report_pipeline_error(&e),
            }
        }
        Command::Sweep {
            exps,
            width,
            weight,
            bias,
        } => {
            let depths: Vec<usize> = exps.iter().map(|e| 1usize << e).collect();
            eprintln!("Sweeping depths {depths:?}");
            let pipeline = Pipeline::new(config);
            let report = depth_sweep(
                &pipeline,
                &depths,
                |depth| build_mlp(depth, *width, *weight, *bias),
                |desc| InputData::new(vec![1.0; desc.input_dim]),
            );
            println!("{report}");
            if !report.all_ok() {
                process::exit(1);
            }
        }
        Command::Inspect { model } => {
            let descriptor = load_descriptor(model);
            let settings = generate_settings(&descriptor, None, &config.settings)
                .unwrap_or_else(|e| fail(e));
            let circuit = compile(&descriptor, &settings, &CancellationToken::new())
                .unwrap_or_else(|e| fail(e));
            println!("{}", summarize_circuit(&circuit));
        }
    }
}
