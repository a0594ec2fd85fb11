use crate::error::Result;
use crate::generator::{KeyGeneratorRegistry, ValueGeneratorRegistry};
use crate::phase::PhaseSynchronizer;
use clap::ValueHint::FilePath;
use clap::{Args, Parser, Subcommand};
use log::{debug, error, info};
use std::fs::read_to_string;
use std::sync::Arc;

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(short = 's')]
    #[arg(value_hint = FilePath)]
    #[arg(help = "Path to the key-value store's TOML config file")]
    store_config: String,

    #[arg(short = 'b')]
    #[arg(value_hint = FilePath)]
    #[arg(help = "Path to the stress test's TOML config file")]
    stress_config: String,
}

#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Run a stress test")]
    Run(RunArgs),
    #[command(about = "List all registered key-value stores and generators")]
    List,
}

fn run_cli(args: &RunArgs) -> Result<()> {
    let opt = read_to_string(&args.store_config)? + "\n" + &read_to_string(&args.stress_config)?;
    let (map, stages) = crate::stress::init(&opt)?;

    let sync = Arc::new(PhaseSynchronizer::new());
    let interrupter = sync.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        debug!("SIGINT received, interrupting the stress test");
        interrupter.interrupt();
    }) {
        error!("Error setting Ctrl-C handler: {}", e);
    }

    for (i, stage) in stages.iter().enumerate() {
        info!("Running stage {}", i);
        let results = stage.run(&map, &sync)?;
        for (key, value) in results.iter() {
            println!("stage {} {} {}", i, key, value);
        }
    }
    info!("Store holds {} entries", map.total_size());
    Ok(())
}

fn list_cli() {
    for name in crate::stores::names() {
        println!("Registered map: {}", name);
    }
    for r in inventory::iter::<KeyGeneratorRegistry> {
        println!("Registered key generator: {}", r.name);
    }
    for r in inventory::iter::<ValueGeneratorRegistry> {
        println!("Registered value generator: {}", r.name);
    }
}

/// The default command line interface.
///
/// This function is public and can be called in a different crate. For example, one can stress
/// their own key-value store by registering its constructor function. Then, calling this
/// function will produce a binary that has the same usage as the one in this crate.
///
/// ## Usage
///
/// To get the usage of the command line interface, users can run:
///
/// ```bash
/// kvstress -h
/// ```
///
/// The interface supports two modes, `run` and `list`.
///
/// ### Run mode
///
/// Usage:
///
/// ```bash
/// kvstress run -s <STORE_CONFIG> -b <STRESS_CONFIG>
/// ```
///
/// Where `STORE_CONFIG` and `STRESS_CONFIG` are the paths to the key-value store and stress test
/// configuration files, respectively. For their format, you can refer to the documentations of
/// [`crate::stores`] and [`crate::stress`]. The results of every stage are printed to stdout.
/// Ctrl-C aborts the stage in progress.
///
/// ### List mode
///
/// Usage:
/// ``` bash
/// kvstress list
/// ```
///
/// This command lists the names of all registered key-value stores and generators.
pub fn cmdline() {
    env_logger::init();
    let cli = Cli::parse();
    debug!("Starting kvstress with args: {:?}", cli);
    match cli.command {
        Commands::Run(args) => {
            if let Err(e) = run_cli(&args) {
                error!("Stress test failed: {}", e);
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::List => list_cli(),
    }
}
