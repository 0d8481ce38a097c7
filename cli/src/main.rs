//! rehook - inspect modules and exercise the interception engine in-process.

mod selftest;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rehook_intercept::module::{enumerate_exports, enumerate_modules, find_module, load_module};
use rehook_intercept::{EngineConfig, InterceptionEngine, Selector};

#[derive(Parser)]
#[command(name = "rehook")]
#[command(version, about = "Runtime function interception diagnostics", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List modules loaded in this process
    Modules,

    /// List the exported symbols of a module
    Exports {
        module: String,

        /// Only show names containing this text
        #[arg(short, long)]
        filter: Option<String>,
    },

    /// Resolve a module offset (0x-prefixed or decimal) or export name
    Resolve { module: String, selector: String },

    /// Hook built-in fixtures and check the 42 -> 99 -> 42 round trip
    Selftest {
        /// Park other threads while patching
        #[arg(long)]
        quiesce: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    rehook_intercept::init();

    match cli.command {
        Commands::Modules => {
            for m in enumerate_modules() {
                println!("{:#018x} {:>10} {}", m.base_address, m.size, m.path);
            }
        }
        Commands::Exports { module, filter } => {
            let info = match find_module(&module) {
                Some(info) => info,
                None if load_module(&module) => find_module(&module).context("module vanished after loading")?,
                None => anyhow::bail!("module not found: {module}"),
            };
            let mut exports = enumerate_exports(&info);
            exports.sort_by(|a, b| a.name.cmp(&b.name));
            for export in exports
                .iter()
                .filter(|e| filter.as_deref().map_or(true, |f| e.name.contains(f)))
            {
                println!("{:#018x} {}", export.address, export.name);
            }
        }
        Commands::Resolve { module, selector } => {
            let engine = InterceptionEngine::from_env();
            let selector: Selector = selector.parse()?;
            let address = engine
                .resolve(&module, &selector)
                .with_context(|| format!("resolving {module} {selector}"))?;
            let base = engine.module_base(&module)?;
            println!("{address} ({module}+{:#x})", address.as_usize() - base.as_usize());
        }
        Commands::Selftest { quiesce } => {
            let config = EngineConfig::from_env();
            let config = if quiesce { config.with_quiesce_threads(true) } else { config };
            selftest::run(config)?;
            println!("selftest passed");
        }
    }

    Ok(())
}
