//! # Cascade CLI
//!
//! A fluid command line for stochastic reaction-network simulation.
//!
//! ## Quick Start
//!
//! ```bash
//! # Interactive mode (recommended)
//! cascade
//!
//! # Run a CMDL model file for 100 time units
//! cascade run model.cmdl --duration 100
//!
//! # Run a built-in example with a fixed seed
//! cascade example dimerization --seed 42
//!
//! # Echo the compiled form of a model
//! cascade parse model.cmdl
//!
//! # List all built-in examples
//! cascade list
//! ```

use anyhow::{bail, Context, Result};
use cascade_core::Time;
use cascade_sim::{
    DelayedReaction, Filesystem, LoggerTask, MemoryLogger, PropensityReaction, RateLaw, Reactant,
    RemovalPolicy, Simulation, State, StateLogger, StateSet, StateKey,
};
use clap::{Parser, Subcommand};
use colored::Colorize;
use console::{style, Emoji};
use dialoguer::{theme::ColorfulTheme, FuzzySelect, Input};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};

// Emoji for visual feedback
static FLASK: Emoji<'_, '_> = Emoji("🧪 ", "");
static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "");
static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK] ");
static CHART: Emoji<'_, '_> = Emoji("📈 ", "");

/// Cascade - Stochastic Chemical Reaction Networks
#[derive(Parser)]
#[command(name = "cascade")]
#[command(author = "Yatrogenesis")]
#[command(version = "0.1.0")]
#[command(about = "Simulate stochastic chemical reaction networks", long_about = LONG_ABOUT)]
#[command(after_help = AFTER_HELP)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

const LONG_ABOUT: &str = r#"
Cascade simulates chemical reaction networks with Gillespie's direct
method, extended with fixed-delay reactions. Models are described in
CMDL, a small textual language for variables and reactions, and every
run writes its sampled time series into a timestamped folder.

Use 'cascade' without arguments for interactive mode.
"#;

const AFTER_HELP: &str = r#"
EXAMPLES:
    cascade                              Interactive mode
    cascade run model.cmdl -d 50         Simulate a CMDL file to t = 50
    cascade example decay --seed 1       Reproducible example run
    cascade example predator-prey        Stochastic Lotka-Volterra
    cascade parse model.cmdl             Echo the compiled model
    cascade list                         List built-in examples

CMDL IN ONE BREATH:
    k = 0.01;  M = 100;  D = 0;         // parameters, initial amounts
    2 M -> D, k;  D -> 2 M, 0.1;        // reactions with rate constants
    M -> 0, [0.001 * M * D];            // late-bound propensity
"#;

#[derive(Subcommand)]
enum Commands {
    /// Run a CMDL model file
    Run {
        /// Model file (.cmdl)
        model: PathBuf,

        /// Simulated duration
        #[arg(short, long, default_value = "100")]
        duration: f64,

        /// Sampling period of the loggers
        #[arg(short = 'p', long, default_value = "0.1")]
        log_period: f64,

        /// Folder in which results are saved
        #[arg(short, long, default_value = "simulations")]
        output: PathBuf,

        /// Fixed random seed; entropy-seeded when omitted
        #[arg(short, long)]
        seed: Option<u64>,

        /// Also export the sampled series as JSON
        #[arg(long)]
        json: bool,

        /// Suppress the progress display
        #[arg(short, long)]
        quiet: bool,
    },

    /// Run a built-in example model
    Example {
        /// Example name (see `cascade list`)
        name: String,

        /// Simulated duration; each example has its own default
        #[arg(short, long)]
        duration: Option<f64>,

        /// Sampling period of the loggers
        #[arg(short = 'p', long, default_value = "0.1")]
        log_period: f64,

        /// Folder in which results are saved
        #[arg(short, long, default_value = "simulations")]
        output: PathBuf,

        /// Fixed random seed; entropy-seeded when omitted
        #[arg(short, long)]
        seed: Option<u64>,

        /// Also export the sampled series as JSON
        #[arg(long)]
        json: bool,

        /// Suppress the progress display
        #[arg(short, long)]
        quiet: bool,
    },

    /// Print the compiled form of a CMDL model
    Parse {
        /// Model file (.cmdl)
        model: PathBuf,
    },

    /// List all built-in example models
    List {
        /// Show detailed information
        #[arg(short, long)]
        detailed: bool,
    },

    /// Interactive mode (default)
    Interactive,
}

// =============================================================================
// EXAMPLE REGISTRY
// =============================================================================

/// Example model information
#[derive(Debug, Clone)]
struct ExampleInfo {
    id: &'static str,
    description: &'static str,
    duration: f64,
    icon: &'static str,
}

const EXAMPLES: &[ExampleInfo] = &[
    ExampleInfo {
        id: "decay",
        description: "Exponential decay of a single species",
        duration: 100.0,
        icon: "🧪",
    },
    ExampleInfo {
        id: "dimerization",
        description: "Reversible dimerization, conserving M + 2 D",
        duration: 50.0,
        icon: "🧬",
    },
    ExampleInfo {
        id: "delayed",
        description: "Birth process with fixed-delay maturation",
        duration: 10.0,
        icon: "⏲️",
    },
    ExampleInfo {
        id: "predator-prey",
        description: "Stochastic Lotka-Volterra oscillations",
        duration: 5.0,
        icon: "🦊",
    },
];

const DECAY_CMDL: &str = "\
k = 0.1;
A = 1000;
A -> 0, k;
";

const DIMERIZATION_CMDL: &str = "\
M = 100;
D = 0;
2 M -> D, 0.01;
D -> 2 M, 0.1;
";

const PREDATOR_PREY_CMDL: &str = "\
prey = 1000;
predator = 1000;
prey -> 2 prey, 10;
prey + predator -> 2 predator, 0.01;
predator -> 0, 10;
";

fn example_info(name: &str) -> Result<&'static ExampleInfo> {
    match EXAMPLES.iter().find(|example| example.id == name) {
        Some(info) => Ok(info),
        None => bail!(
            "unknown example {}; `cascade list` shows the available ones",
            name
        ),
    }
}

fn build_example(name: &str) -> Result<Simulation> {
    match name {
        "decay" => Ok(cascade_cmdl::compile(DECAY_CMDL)?),
        "dimerization" => Ok(cascade_cmdl::compile(DIMERIZATION_CMDL)?),
        "predator-prey" => Ok(cascade_cmdl::compile(PREDATOR_PREY_CMDL)?),
        "delayed" => build_delayed_example(),
        _ => bail!("unknown example {}", name),
    }
}

/// Molecules of A appear at rate 1 and each turns into B exactly two time
/// units after its creation. Delayed reactions need a queued state, so
/// this example is built through the API rather than CMDL.
fn build_delayed_example() -> Result<Simulation> {
    let mut sim = Simulation::new();
    let a = sim.add_state(State::new_complex("A", 0, RemovalPolicy::Oldest))?;
    let b = sim.add_state(State::new_simple("B", 0))?;

    let mut birth = PropensityReaction::new("0 -> A", RateLaw::MassAction(1.0));
    birth.add_product(Reactant::once(a));
    sim.add_reaction(birth);

    let mut mature = DelayedReaction::new("A -> B after 2", a, 2.0);
    mature.add_product(Reactant::once(b));
    sim.add_delayed_reaction(mature);
    Ok(sim)
}

// =============================================================================
// PROGRESS DISPLAY
// =============================================================================

/// Progress-bar logger task backed by indicatif; a drop-in replacement
/// for the plain-console progress logger.
struct BarProgress {
    bar: Option<ProgressBar>,
    run_time: Time,
}

impl BarProgress {
    fn new() -> Self {
        Self {
            bar: None,
            run_time: 1.0,
        }
    }
}

impl LoggerTask for BarProgress {
    fn initialize(
        &mut self,
        _filesystem: &dyn Filesystem,
        _folder: Option<&Path>,
        _states: &StateSet,
        run_time: Time,
    ) -> cascade_core::Result<()> {
        self.run_time = run_time;
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}% {msg}")
                .unwrap()
                .progress_chars("█▓░"),
        );
        self.bar = Some(bar);
        Ok(())
    }

    fn write_log(&mut self, time: Time, _states: &StateSet) -> cascade_core::Result<()> {
        if let Some(bar) = &self.bar {
            bar.set_position((time / self.run_time * 100.0) as u64);
            bar.set_message(format!("t = {:.2}", time));
        }
        Ok(())
    }

    fn uninitialize(&mut self) -> cascade_core::Result<()> {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message("Complete!");
        }
        Ok(())
    }

    fn writes_to_disk(&self) -> bool {
        false
    }
}

// =============================================================================
// COMMANDS
// =============================================================================

fn main() -> Result<()> {
    let cli = Cli::parse();

    // If no command, run interactive mode
    let command = cli.command.unwrap_or(Commands::Interactive);

    match command {
        Commands::Interactive => run_interactive()?,
        Commands::Run {
            model,
            duration,
            log_period,
            output,
            seed,
            json,
            quiet,
        } => {
            let text = std::fs::read_to_string(&model)
                .with_context(|| format!("could not read model file {}", model.display()))?;
            let sim = cascade_cmdl::compile(&text)?;
            let title = model.display().to_string();
            run_simulation(sim, &title, duration, log_period, &output, seed, json, quiet)?;
        }
        Commands::Example {
            name,
            duration,
            log_period,
            output,
            seed,
            json,
            quiet,
        } => {
            let info = example_info(&name)?;
            let sim = build_example(&name)?;
            let duration = duration.unwrap_or(info.duration);
            run_simulation(sim, info.id, duration, log_period, &output, seed, json, quiet)?;
        }
        Commands::Parse { model } => run_parse(&model)?,
        Commands::List { detailed } => show_list(detailed),
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_simulation(
    mut sim: Simulation,
    title: &str,
    duration: f64,
    log_period: f64,
    output: &Path,
    seed: Option<u64>,
    json: bool,
    quiet: bool,
) -> Result<()> {
    if let Some(seed) = seed {
        sim.reseed(seed);
    }

    println!("\n{}Cascade Simulation", FLASK);
    println!("  Model: {}", style(title).cyan());
    println!("  Duration: {}", duration);
    println!("  Log period: {}", log_period);
    if let Some(seed) = seed {
        println!("  Seed: {}", style(seed).yellow());
    }

    let keys: Vec<StateKey> = sim.states().keys().collect();

    let mut table = StateLogger::new("states.csv");
    for key in &keys {
        table.add_state(*key);
    }

    let mut memory = MemoryLogger::new();
    for key in &keys {
        memory.add_state(*key);
    }
    let records = memory.records();

    let logger = sim.logger_mut();
    logger.set_base_folder(output);
    logger.set_log_period(log_period)?;
    logger.add_task(Box::new(table));
    logger.add_task(Box::new(memory));
    if !quiet {
        logger.add_task(Box::new(BarProgress::new()));
    }

    sim.run(duration)?;

    println!("\n{}Simulation complete!", CHECK);
    for series in records.snapshot() {
        if let Some((_, count)) = series.last() {
            println!("  {} = {}", series.name.cyan(), count);
        }
    }
    if let Some(folder) = sim.logger().save_folder() {
        println!(
            "{}Time series: {}",
            CHART,
            style(folder.join("states.csv").display()).green()
        );
        if json {
            let path = folder.join("series.json");
            let data = serde_json::to_string_pretty(&records.snapshot())?;
            std::fs::write(&path, data)
                .with_context(|| format!("could not write {}", path.display()))?;
            println!("{}JSON export: {}", CHART, style(path.display()).green());
        }
    }
    Ok(())
}

fn run_parse(model: &Path) -> Result<()> {
    let text = std::fs::read_to_string(model)
        .with_context(|| format!("could not read model file {}", model.display()))?;
    let parsed = cascade_cmdl::parse_model(&text)?;
    let sim = cascade_cmdl::instantiate(&parsed)?;

    println!("\n{}", style("── Species ──").bold());
    for key in sim.states().keys() {
        let state = sim.states().get(key);
        println!(
            "  {} = {}",
            state.name().cyan(),
            state.initial_condition()
        );
    }

    println!("\n{}", style("── Reactions ──").bold());
    for definition in &parsed.reactions {
        let rate = match &definition.rate {
            cascade_cmdl::RateDefinition::Constant(k) => format!("{}", k),
            cascade_cmdl::RateDefinition::Expression(expr) => format!("[{}]", expr),
        };
        println!("  {}, {};", definition, style(rate).yellow());
    }

    let matrix = sim.stoichiometry_matrix();
    println!(
        "\n{}Stoichiometry: {} species x {} reactions",
        SPARKLE,
        style(matrix.nrows()).yellow(),
        style(matrix.ncols()).yellow()
    );
    Ok(())
}

fn show_list(detailed: bool) {
    println!();
    println!(
        "{}",
        style("══════════════════════════════════════════════════════════════").cyan()
    );
    println!(
        "{}",
        style("                 BUILT-IN EXAMPLE MODELS                       ")
            .cyan()
            .bold()
    );
    println!(
        "{}",
        style("══════════════════════════════════════════════════════════════").cyan()
    );
    println!();

    for example in EXAMPLES {
        if detailed {
            println!(
                "  {} {} (t = {})",
                example.icon,
                style(example.id).cyan().bold(),
                style(example.duration).yellow()
            );
            println!("     {}", style(example.description).dim());
            println!();
        } else {
            println!(
                "  {} {:14} {}",
                example.icon,
                style(example.id).cyan(),
                style(example.description).dim()
            );
        }
    }
}

fn run_interactive() -> Result<()> {
    println!();
    println!(
        "{}",
        style("╔══════════════════════════════════════════════════════════════╗").cyan()
    );
    println!(
        "{}",
        style("║        CASCADE - Stochastic Reaction Network Simulator       ║").cyan()
    );
    println!(
        "{}",
        style("╚══════════════════════════════════════════════════════════════╝").cyan()
    );
    println!();

    let theme = ColorfulTheme::default();

    loop {
        let mut options: Vec<String> = EXAMPLES
            .iter()
            .map(|example| format!("{} {} - {}", example.icon, example.id, example.description))
            .collect();
        options.push("📄 Run a CMDL model file".to_string());
        options.push("📋 List examples".to_string());
        options.push("🚪 Exit".to_string());

        let selection = FuzzySelect::with_theme(&theme)
            .with_prompt("Select a model or action")
            .items(&options)
            .default(0)
            .interact()?;

        if selection < EXAMPLES.len() {
            interactive_example(&theme, &EXAMPLES[selection])?;
        } else if selection == EXAMPLES.len() {
            interactive_file(&theme)?;
        } else if selection == EXAMPLES.len() + 1 {
            show_list(true);
        } else {
            println!("\n{}Goodbye! Keep simulating! {}", SPARKLE, FLASK);
            break;
        }

        println!();
    }

    Ok(())
}

fn interactive_example(theme: &ColorfulTheme, info: &ExampleInfo) -> Result<()> {
    println!("\n{}", style(format!("── {} ──", info.id)).bold());

    let duration: f64 = Input::with_theme(theme)
        .with_prompt("Simulated duration")
        .default(info.duration)
        .interact_text()?;

    let sim = build_example(info.id)?;
    run_simulation(
        sim,
        info.id,
        duration,
        0.1,
        Path::new("simulations"),
        None,
        false,
        false,
    )
}

fn interactive_file(theme: &ColorfulTheme) -> Result<()> {
    println!("\n{}", style("── CMDL Model ──").bold());

    let model: String = Input::with_theme(theme)
        .with_prompt("Model file")
        .interact_text()?;

    let duration: f64 = Input::with_theme(theme)
        .with_prompt("Simulated duration")
        .default(100.0)
        .interact_text()?;

    let text = std::fs::read_to_string(&model)
        .with_context(|| format!("could not read model file {}", model))?;
    let sim = cascade_cmdl::compile(&text)?;
    run_simulation(
        sim,
        &model,
        duration,
        0.1,
        Path::new("simulations"),
        None,
        false,
        false,
    )
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_example_builds() {
        for example in EXAMPLES {
            build_example(example.id).unwrap();
        }
    }

    #[test]
    fn test_unknown_example_is_an_error() {
        assert!(example_info("no-such-model").is_err());
        assert!(build_example("no-such-model").is_err());
    }

    #[test]
    fn test_decay_example_runs() {
        let mut sim = build_example("decay").unwrap();
        sim.reseed(1);
        sim.run(1.0).unwrap();
        assert_eq!(sim.time(), 1.0);
    }
}
