// ========================================================================================
//
//                      The run orchestrator: voxlmm
//
// ========================================================================================
//
// Parses the command line, loads the run configuration and drives one block of the
// voxel-wise analysis to completion. All numerical work lives in the library; this
// binary only owns the lifecycle: argument parsing, logging, the run itself and the
// process exit status.

use clap::Parser;
use std::error::Error;
use std::path::PathBuf;
use std::process;
use std::time::Instant;
use voxlmm::config::RunConfig;
use voxlmm::pipeline::{self, PipelineError};

// ========================================================================================
//                         Command-line interface definition
// ========================================================================================

#[derive(Parser, Debug)]
#[clap(
    name = "voxlmm",
    version,
    about = "Voxel-wise linear mixed model inference over precomputed product matrices."
)]
struct Args {
    /// Path to the TOML run configuration.
    config: PathBuf,

    /// Block to process. Zero or a negative value processes the whole analysis mask;
    /// a positive value b processes block b of `voxel_blocks`.
    #[clap(default_value_t = 0, allow_negative_numbers = true)]
    block: i64,

    /// Log filter, overriding RUST_LOG.
    #[clap(long)]
    log_level: Option<log::LevelFilter>,
}

// ========================================================================================
//                           The main orchestration logic
// ========================================================================================

fn main() {
    let args = Args::parse();

    let mut logger = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(level) = args.log_level {
        logger.filter_level(level);
    }
    logger.init();

    if let Err(e) = run(&args) {
        eprintln!("Error: {e}");
        let mut source = e.source();
        while let Some(cause) = source {
            eprintln!("  caused by: {cause}");
            source = cause.source();
        }
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), PipelineError> {
    let start_time = Instant::now();

    // --- Phase 1: Configuration ---
    let config = RunConfig::load(&args.config)?;
    log::info!(
        "Loaded {}: n = {}, p = {}, q = {}, {} contrasts",
        args.config.display(),
        config.n,
        config.p,
        config.layout.q(),
        config.contrasts.slots().len()
    );

    // --- Phase 2: The Voxel-wise Run ---
    let summary = pipeline::run(&config, args.block)?;

    // --- Phase 3: Final Report ---
    eprintln!(
        "> Finished {} groups ({} inner, {} ring voxels) in {:.2?}. Outputs written to {}",
        summary.groups,
        summary.inner_voxels,
        summary.ring_voxels,
        start_time.elapsed(),
        config.outdir.display()
    );
    Ok(())
}
