//! Command-line front end for the protection-removal engine.
//!
//! Loads a module from the JSON interchange format, runs the configured
//! passes and writes the cleaned module back out. On-disk container parsing
//! is deliberately out of scope; the interchange format is the serialized
//! [`Module`] model itself, which is enough to drive the engine end to end.

use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};

use cilstrip::{
    EngineConfig, Logger, Module, PassKind, PassStatus, ProtectionEngine, ProtectionFlags,
    RunSummary,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Preset {
    /// The standard pass set.
    Default,
    /// Only reference-safe passes, no renaming or member removal.
    Minimal,
    /// Everything, including extension passes.
    Aggressive,
}

/// Remove obfuscator protections from a managed bytecode module.
///
/// Input and output are the serialized module model as JSON; container
/// formats are not parsed here.
#[derive(Debug, Parser)]
#[command(name = "cilstrip", version, about)]
struct Args {
    /// Module to clean (JSON interchange format).
    input: PathBuf,

    /// Where to write the cleaned module.
    output: PathBuf,

    /// Pass preset to start from.
    #[arg(long, value_enum, default_value_t = Preset::Default)]
    preset: Preset,

    /// Comma-separated pass names to run, replacing the preset set.
    #[arg(long, value_delimiter = ',')]
    passes: Vec<String>,

    /// Comma-separated pass names to leave out.
    #[arg(long, value_delimiter = ',')]
    skip: Vec<String>,

    /// Write a JSON report of the run to this path.
    #[arg(long)]
    report: Option<PathBuf>,

    /// Only report errors.
    #[arg(long, conflicts_with = "verbose")]
    quiet: bool,

    /// Also print every recorded transformation event.
    #[arg(long)]
    verbose: bool,
}

/// Console logger honoring the quiet flag. Errors always reach stderr.
struct ConsoleLogger {
    quiet: bool,
}

impl Logger for ConsoleLogger {
    fn info(&self, message: &str) {
        if !self.quiet {
            println!("  {message}");
        }
    }

    fn warning(&self, message: &str) {
        if !self.quiet {
            eprintln!("warning: {message}");
        }
    }

    fn error(&self, message: &str) {
        eprintln!("error: {message}");
    }

    fn success(&self, message: &str) {
        if !self.quiet {
            println!("{message}");
        }
    }
}

fn parse_pass_list(names: &[String]) -> Result<ProtectionFlags> {
    let mut flags = ProtectionFlags::empty();
    for name in names {
        let kind = PassKind::from_str(name.trim())
            .map_err(|_| anyhow::anyhow!("unknown pass name '{}'", name.trim()))?;
        flags |= kind.flag();
    }
    Ok(flags)
}

fn build_config(args: &Args) -> Result<EngineConfig> {
    let base = match args.preset {
        Preset::Default => EngineConfig::default(),
        Preset::Minimal => EngineConfig::minimal(),
        Preset::Aggressive => EngineConfig::aggressive(),
    };

    let mut flags = if args.passes.is_empty() {
        base.passes
    } else {
        parse_pass_list(&args.passes)?
    };
    flags &= !parse_pass_list(&args.skip)?;

    Ok(base.with_passes(flags))
}

fn report_json(summary: &RunSummary) -> serde_json::Value {
    let passes: Vec<serde_json::Value> = summary
        .outcomes
        .iter()
        .map(|outcome| {
            serde_json::json!({
                "name": outcome.name,
                "status": match outcome.status {
                    PassStatus::Applied => "applied",
                    PassStatus::Clean => "clean",
                    PassStatus::Failed => "failed",
                },
                "error": outcome.error,
            })
        })
        .collect();

    serde_json::json!({
        "passes": passes,
        "applied": summary.applied,
        "clean": summary.clean,
        "failed": summary.failed,
        "skipped": summary.skipped,
        "elapsed_ms": summary.elapsed.as_millis() as u64,
        "stats": {
            "methods_transformed": summary.stats.methods_transformed,
            "instructions_removed": summary.stats.instructions_removed,
            "dead_code_removed": summary.stats.dead_code_removed,
            "branches_simplified": summary.stats.branches_simplified,
            "constants_folded": summary.stats.constants_folded,
            "strings_decrypted": summary.stats.strings_decrypted,
            "proxies_inlined": summary.stats.proxies_inlined,
            "calls_restored": summary.stats.calls_restored,
            "watermarks_removed": summary.stats.watermarks_removed,
            "resources_decrypted": summary.stats.resources_decrypted,
            "resources_restored": summary.stats.resources_restored,
            "symbols_renamed": summary.stats.symbols_renamed,
            "types_removed": summary.stats.types_removed,
            "methods_removed": summary.stats.methods_removed,
            "fields_removed": summary.stats.fields_removed,
            "handlers_dropped": summary.stats.handlers_dropped,
            "locals_compacted": summary.stats.locals_compacted,
            "stubs_restored": summary.stats.stubs_restored,
            "targets_repaired": summary.stats.targets_repaired,
            "warnings": summary.stats.warnings,
            "errors": summary.stats.errors,
        },
    })
}

fn run(args: &Args) -> Result<()> {
    let config = build_config(args)?;
    config
        .validate()
        .context("configuration rejected")?;

    let raw = fs::read_to_string(&args.input)
        .with_context(|| format!("cannot read '{}'", args.input.display()))?;
    let mut module: Module = serde_json::from_str(&raw).with_context(|| {
        format!(
            "'{}' is not a module in the JSON interchange format",
            args.input.display()
        )
    })?;

    if !args.quiet {
        println!(
            "Processing '{}' ({} type(s), {} method(s))",
            module.name,
            module.types.len(),
            module.method_count()
        );
    }

    let logger = ConsoleLogger { quiet: args.quiet };
    let mut engine = ProtectionEngine::new(config);
    let summary = engine.process(&mut module, &logger)?;

    if !args.quiet {
        for outcome in &summary.outcomes {
            let status = match outcome.status {
                PassStatus::Applied => "applied",
                PassStatus::Clean => "clean",
                PassStatus::Failed => "FAILED",
            };
            println!("  {:<28} {status}", outcome.name);
        }
    }
    if args.verbose {
        for event in summary.events.transformations() {
            println!("    {event}");
        }
    }
    if summary.failed > 0 {
        bail!("{} pass(es) failed", summary.failed);
    }

    let serialized =
        serde_json::to_string_pretty(&module).context("cannot serialize cleaned module")?;
    fs::write(&args.output, serialized)
        .with_context(|| format!("cannot write '{}'", args.output.display()))?;

    if let Some(path) = &args.report {
        let report = serde_json::to_string_pretty(&report_json(&summary))
            .context("cannot serialize report")?;
        fs::write(path, report).with_context(|| format!("cannot write '{}'", path.display()))?;
    }
    Ok(())
}

fn main() {
    let args = Args::parse();
    if let Err(error) = run(&args) {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}
