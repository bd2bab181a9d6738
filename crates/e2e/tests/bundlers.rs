//! Cross-bundler harness entry point
//!
//! Runs every built-in scenario against every implementation.
//! Run with: RSC_E2E=1 cargo test --package rsc-e2e --test bundlers -- [ARGS]

use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};

use rsc_e2e::playwright::PlaywrightBrowser;
use rsc_e2e::runner::filter_scenarios;
use rsc_e2e::scenario::rsc_scenarios;
use rsc_e2e::{implementations, E2eResult, HarnessConfig, ServeMode, TestRunner};

const OPT_IN: &str = "RSC_E2E";

#[derive(Parser, Debug)]
#[command(name = "rsc-e2e")]
#[command(about = "Cross-bundler E2E runner for the RSC framework")]
struct Args {
    /// Harness configuration file
    #[arg(short, long, default_value = "rsc-e2e.toml")]
    config: PathBuf,

    /// Directory holding the rsc-vite and rsc-parcel templates
    #[arg(long)]
    templates_dir: Option<PathBuf>,

    /// Run only this implementation (repeatable)
    #[arg(short, long = "implementation")]
    implementations: Vec<String>,

    /// Run only this scenario (repeatable)
    #[arg(short, long = "scenario")]
    scenarios: Vec<String>,

    /// Run only one serve mode (production, development)
    #[arg(short, long)]
    mode: Option<ServeMode>,

    /// Leave scaffolded projects on disk for inspection
    #[arg(long)]
    keep_projects: bool,

    /// Cases run at the same time
    #[arg(long)]
    concurrency: Option<usize>,

    /// Output directory for results
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Log child process output
    #[arg(long)]
    debug: bool,
}

fn main() {
    if std::env::var(OPT_IN).map_or(true, |v| v != "1") {
        eprintln!("skipping bundler e2e suite; set {}=1 to run it", OPT_IN);
        return;
    }

    let args = Args::parse();

    rsc_e2e::logging::init(args.debug);

    let rt = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");
    let result = rt.block_on(async_main(args));

    match result {
        Ok(true) => std::process::exit(0),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    }
}

async fn async_main(args: Args) -> E2eResult<bool> {
    let mut config = HarnessConfig::load(&args.config)?;
    config.apply_env()?;

    if let Some(dir) = args.templates_dir {
        config.templates_dir = dir;
    }
    if let Some(n) = args.concurrency {
        config.concurrency = n;
    }
    if let Some(dir) = args.output {
        config.output_dir = dir;
    }
    config.keep_projects |= args.keep_projects;
    config.validate()?;

    let browser = PlaywrightBrowser::new(config.browser.clone());
    browser.check_installed().await?;

    let mut runner = TestRunner::new(&config, implementations(&config), browser)?;
    runner.retain_implementations(&args.implementations);
    if runner.implementations().is_empty() {
        warn!("No implementation matches {:?}", args.implementations);
    }

    let scenarios = filter_scenarios(rsc_scenarios(), &args.scenarios, args.mode);
    info!(
        "Templates: {} ({} scenario(s) selected)",
        config.templates_dir.display(),
        scenarios.len()
    );

    let results = runner.run_all(&scenarios).await;
    runner.write_results(&results)?;

    for failure in results.failures() {
        info!("  {}: {}", failure.id(), failure.error.as_deref().unwrap_or_default());
    }

    Ok(results.failed == 0)
}
