//! # Cascade Simulation Kernel
//!
//! Discrete-event stochastic simulation of chemical reaction networks.
//!
//! ## Algorithm
//!
//! The kernel runs Gillespie's direct method as outlined in
//! Gillespie, "Exact stochastic simulation of coupled chemical reactions",
//! J. Phys. Chem. 81.25 (1977), extended with reactions that fire at a
//! specific time instead of having a continuous propensity. Such delayed
//! reactions model fixed time delays, e.g. a molecule maturing a constant
//! interval after its creation.
//!
//! ## Components
//!
//! 1. **States**: species populations, either plain counts or ordered
//!    queues of timestamped molecules
//! 2. **Reactions**: propensity-driven (mass action or symbolic rate
//!    expression) and time-scheduled (fixed delay on a queued state)
//! 3. **Logger**: a periodic scheduler driving CSV, console-progress and
//!    in-memory recording tasks
//! 4. **Collaborators**: random source, wall clock, filesystem and console,
//!    each behind a trait so drivers and tests can substitute them
//!
//! ## Determinism
//!
//! A simulation owns a single seedable random engine. Given identical
//! initial state, identical registration order and an identical seed, two
//! runs produce identical trajectories and identical log files.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use cascade_core::{CascadeError, Result, Time, TimeSeries, INF};
use cascade_expr::{Expression, VariableLookup};
use chrono::{Datelike, Local, Timelike};
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

// =============================================================================
// RANDOM SOURCE
// =============================================================================

/// Source of randomness handed to the kernel and to firing reactions.
pub trait RandomSource {
    /// Uniformly distributed value in the half-open interval `[0, 1)`.
    fn uniform(&mut self) -> f64;

    /// Uniformly distributed integer in the inclusive range `[lower, upper]`.
    fn uniform_int(&mut self, lower: u64, upper: u64) -> u64;
}

/// The default engine: ChaCha, seeded from entropy unless a fixed seed is
/// supplied. One engine per simulation instance.
#[derive(Debug, Clone)]
pub struct SimulationRng {
    engine: ChaCha8Rng,
}

impl SimulationRng {
    pub fn new() -> Self {
        Self {
            engine: ChaCha8Rng::from_entropy(),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            engine: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl Default for SimulationRng {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomSource for SimulationRng {
    fn uniform(&mut self) -> f64 {
        self.engine.gen::<f64>()
    }

    fn uniform_int(&mut self, lower: u64, upper: u64) -> u64 {
        self.engine.gen_range(lower..=upper)
    }
}

// =============================================================================
// COLLABORATORS: CLOCK, FILESYSTEM, CONSOLE
// =============================================================================

/// Wall clock, used only to derive output directory names.
pub trait Clock {
    /// A `YYYY-M-D_H-M-S` stamp of the current local time.
    fn timestamp(&self) -> String;
}

/// The real local clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn timestamp(&self) -> String {
        let now = Local::now();
        format!(
            "{}-{}-{}_{}-{}-{}",
            now.year(),
            now.month(),
            now.day(),
            now.hour(),
            now.minute(),
            now.second()
        )
    }
}

/// Filesystem access for logger tasks.
pub trait Filesystem {
    fn create_dir_recursive(&self, path: &Path) -> Result<()>;
    fn open_write(&self, path: &Path) -> Result<Box<dyn Write>>;
}

/// The real filesystem.
#[derive(Debug, Default)]
pub struct StdFilesystem;

impl Filesystem for StdFilesystem {
    fn create_dir_recursive(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    fn open_write(&self, path: &Path) -> Result<Box<dyn Write>> {
        let file = File::create(path)?;
        Ok(Box::new(BufWriter::new(file)))
    }
}

/// Write-only sink for progress text.
pub trait Console {
    fn write_text(&mut self, text: &str);
}

/// Progress text goes to stdout.
#[derive(Debug, Default)]
pub struct StdConsole;

impl Console for StdConsole {
    fn write_text(&mut self, text: &str) {
        print!("{}", text);
        let _ = io::stdout().flush();
    }
}

// =============================================================================
// MOLECULES AND STATES
// =============================================================================

/// One molecule of a queued state, carrying its creation time and
/// optional custom properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Molecule {
    pub creation_time: Time,
    pub properties: HashMap<String, f64>,
}

impl Molecule {
    pub fn new(creation_time: Time) -> Self {
        Self {
            creation_time,
            properties: HashMap::new(),
        }
    }
}

/// Which end of a molecule queue `remove` takes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemovalPolicy {
    /// Dequeue the oldest molecule (the head).
    Oldest,
    /// Dequeue the most recently added molecule.
    Newest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum StateKind {
    /// Indistinguishable molecules, represented by a bare count.
    Simple { count: u64 },
    /// Distinguishable molecules in creation order.
    Complex {
        molecules: VecDeque<Molecule>,
        removal: RemovalPolicy,
    },
}

/// The population of one chemical species.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    name: String,
    initial_condition: u64,
    kind: StateKind,
}

impl State {
    /// A state whose molecules cannot be distinguished.
    pub fn new_simple(name: &str, initial_condition: u64) -> Self {
        Self {
            name: name.to_string(),
            initial_condition,
            kind: StateKind::Simple { count: 0 },
        }
    }

    /// A state keeping one record per molecule, in creation order.
    /// Required by delayed reactions.
    pub fn new_complex(name: &str, initial_condition: u64, removal: RemovalPolicy) -> Self {
        Self {
            name: name.to_string(),
            initial_condition,
            kind: StateKind::Complex {
                molecules: VecDeque::new(),
                removal,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn initial_condition(&self) -> u64 {
        self.initial_condition
    }

    pub fn set_initial_condition(&mut self, initial_condition: u64) {
        self.initial_condition = initial_condition;
    }

    /// Current number of molecules.
    pub fn num(&self) -> u64 {
        match &self.kind {
            StateKind::Simple { count } => *count,
            StateKind::Complex { molecules, .. } => molecules.len() as u64,
        }
    }

    /// Adds one molecule, created at `time`.
    pub fn add(&mut self, time: Time) {
        match &mut self.kind {
            StateKind::Simple { count } => *count += 1,
            StateKind::Complex { molecules, .. } => molecules.push_back(Molecule::new(time)),
        }
    }

    /// Removes one molecule. Removing from an empty state is fatal.
    pub fn remove(&mut self, time: Time) -> Result<Option<Molecule>> {
        let underflow = || CascadeError::StateUnderflow {
            state: self.name.clone(),
            time,
        };
        match &mut self.kind {
            StateKind::Simple { count } => {
                if *count == 0 {
                    return Err(underflow());
                }
                *count -= 1;
                Ok(None)
            }
            StateKind::Complex { molecules, removal } => {
                let molecule = match removal {
                    RemovalPolicy::Oldest => molecules.pop_front(),
                    RemovalPolicy::Newest => molecules.pop_back(),
                };
                molecule.map(Some).ok_or_else(underflow)
            }
        }
    }

    /// The oldest molecule, without removing it. `None` for simple states
    /// and for empty queues.
    pub fn peek(&self) -> Option<&Molecule> {
        match &self.kind {
            StateKind::Simple { .. } => None,
            StateKind::Complex { molecules, .. } => molecules.front(),
        }
    }

    /// Sets the population to the initial condition; queued states receive
    /// molecules created at `time`.
    pub fn initialize(&mut self, time: Time) {
        match &mut self.kind {
            StateKind::Simple { count } => *count = self.initial_condition,
            StateKind::Complex { molecules, .. } => {
                molecules.clear();
                for _ in 0..self.initial_condition {
                    molecules.push_back(Molecule::new(time));
                }
            }
        }
    }

    /// Resets the population to zero.
    pub fn uninitialize(&mut self) {
        match &mut self.kind {
            StateKind::Simple { count } => *count = 0,
            StateKind::Complex { molecules, .. } => molecules.clear(),
        }
    }
}

/// Handle to a state registered with a simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateKey(usize);

impl StateKey {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Arena owning every state of a simulation. Reactions refer to states
/// through [`StateKey`] handles.
#[derive(Debug, Default)]
pub struct StateSet {
    states: Vec<State>,
    index: HashMap<String, StateKey>,
}

impl StateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a state; duplicate names are rejected.
    pub fn add(&mut self, state: State) -> Result<StateKey> {
        if self.index.contains_key(state.name()) {
            return Err(CascadeError::RedefinedIdentifier(state.name().to_string()));
        }
        let key = StateKey(self.states.len());
        self.index.insert(state.name().to_string(), key);
        self.states.push(state);
        Ok(key)
    }

    pub fn get(&self, key: StateKey) -> &State {
        &self.states[key.0]
    }

    pub fn get_mut(&mut self, key: StateKey) -> &mut State {
        &mut self.states[key.0]
    }

    pub fn key_of(&self, name: &str) -> Option<StateKey> {
        self.index.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = StateKey> {
        (0..self.states.len()).map(StateKey)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, State> {
        self.states.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, State> {
        self.states.iter_mut()
    }
}

/// Rate expressions resolve species names to live molecule counts.
impl VariableLookup for StateSet {
    fn value_of(&self, name: &str) -> Option<f64> {
        self.key_of(name).map(|key| self.get(key).num() as f64)
    }
}

// =============================================================================
// SIMINFO
// =============================================================================

/// Ambient context handed to reactions and logger tasks during a run.
pub struct SimInfo<'a> {
    /// Current simulation time.
    pub time: Time,
    /// Total run time of the simulation.
    pub run_time: Time,
    /// Folder this run saves into, when some task writes to disk.
    pub save_folder: Option<&'a Path>,
    /// The simulation's random engine.
    pub random: &'a mut dyn RandomSource,
}

// =============================================================================
// REACTIONS
// =============================================================================

/// A species taking part in a reaction with an integer multiplicity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reactant {
    pub state: StateKey,
    pub multiplicity: u64,
}

impl Reactant {
    pub fn new(state: StateKey, multiplicity: u64) -> Self {
        Self {
            state,
            multiplicity,
        }
    }

    pub fn once(state: StateKey) -> Self {
        Self::new(state, 1)
    }
}

/// How a propensity reaction computes its instantaneous rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RateLaw {
    /// Rate constant k; the propensity is k multiplied by the number of
    /// distinct reactant combinations, n(n-1)...(n-m+1) per reactant.
    MassAction(f64),
    /// A symbolic expression evaluated against live species counts at
    /// every propensity computation; the result is the propensity.
    Expression(Expression),
}

/// A reaction drawn from its instantaneous propensity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropensityReaction {
    name: String,
    rate: RateLaw,
    reactants: Vec<Reactant>,
    products: Vec<Reactant>,
}

impl PropensityReaction {
    pub fn new(name: &str, rate: RateLaw) -> Self {
        Self {
            name: name.to_string(),
            rate,
            reactants: Vec::new(),
            products: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rate(&self) -> &RateLaw {
        &self.rate
    }

    pub fn add_reactant(&mut self, reactant: Reactant) {
        self.reactants.push(reactant);
    }

    pub fn add_product(&mut self, product: Reactant) {
        self.products.push(product);
    }

    pub fn reactants(&self) -> &[Reactant] {
        &self.reactants
    }

    pub fn products(&self) -> &[Reactant] {
        &self.products
    }

    /// The instantaneous propensity given current populations.
    pub fn compute_rate(&self, states: &StateSet) -> Result<f64> {
        match &self.rate {
            RateLaw::MassAction(k) => {
                let mut rate = *k;
                for reactant in &self.reactants {
                    let n = states.get(reactant.state).num();
                    if n < reactant.multiplicity {
                        return Ok(0.0);
                    }
                    for i in 0..reactant.multiplicity {
                        rate *= (n - i) as f64;
                    }
                }
                Ok(rate)
            }
            RateLaw::Expression(expr) => expr.eval(states),
        }
    }

    /// Consumes the reactants and creates the products.
    pub fn fire(&self, states: &mut StateSet, info: &mut SimInfo<'_>) -> Result<()> {
        for reactant in &self.reactants {
            for _ in 0..reactant.multiplicity {
                states.get_mut(reactant.state).remove(info.time)?;
            }
        }
        for product in &self.products {
            for _ in 0..product.multiplicity {
                states.get_mut(product.state).add(info.time);
            }
        }
        Ok(())
    }
}

/// A reaction which fires at a specific time instead of having a
/// propensity. The next firing time is the creation time of the oldest
/// molecule of a queued state plus a fixed delay, so each molecule is
/// consumed exactly `delay` after it was created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayedReaction {
    name: String,
    state: StateKey,
    delay: Time,
    products: Vec<Reactant>,
}

impl DelayedReaction {
    pub fn new(name: &str, state: StateKey, delay: Time) -> Self {
        Self {
            name: name.to_string(),
            state,
            delay,
            products: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> StateKey {
        self.state
    }

    pub fn delay(&self) -> Time {
        self.delay
    }

    pub fn add_product(&mut self, product: Reactant) {
        self.products.push(product);
    }

    pub fn products(&self) -> &[Reactant] {
        &self.products
    }

    /// Absolute time of the next firing, or `INF` when the queue is empty.
    pub fn next_reaction_time(&self, states: &StateSet) -> Time {
        match states.get(self.state).peek() {
            Some(molecule) => molecule.creation_time + self.delay,
            None => INF,
        }
    }

    /// Consumes the oldest molecule and creates the products.
    pub fn fire(&self, states: &mut StateSet, info: &mut SimInfo<'_>) -> Result<()> {
        states.get_mut(self.state).remove(info.time)?;
        for product in &self.products {
            for _ in 0..product.multiplicity {
                states.get_mut(product.state).add(info.time);
            }
        }
        Ok(())
    }
}

// =============================================================================
// LOGGER TASKS
// =============================================================================

/// One consumer of periodic log records.
pub trait LoggerTask {
    /// Called once per run, before the first record. `folder` is the run's
    /// output directory; it is present whenever some task writes to disk.
    fn initialize(
        &mut self,
        filesystem: &dyn Filesystem,
        folder: Option<&Path>,
        states: &StateSet,
        run_time: Time,
    ) -> Result<()>;

    /// Writes one record at simulation time `time`.
    fn write_log(&mut self, time: Time, states: &StateSet) -> Result<()>;

    /// Called once per run after the final record.
    fn uninitialize(&mut self) -> Result<()>;

    /// Whether this task needs the run's output directory.
    fn writes_to_disk(&self) -> bool;
}

/// Writes the populations of selected states to a comma-separated table,
/// one row per record: `Time,name1,name2,...`.
pub struct StateLogger {
    file_name: String,
    states: Vec<StateKey>,
    file: Option<Box<dyn Write>>,
    enabled: bool,
}

impl StateLogger {
    pub fn new(file_name: &str) -> Self {
        Self {
            file_name: file_name.to_string(),
            states: Vec::new(),
            file: None,
            enabled: true,
        }
    }

    pub fn add_state(&mut self, state: StateKey) {
        self.states.push(state);
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }
}

impl LoggerTask for StateLogger {
    fn initialize(
        &mut self,
        filesystem: &dyn Filesystem,
        folder: Option<&Path>,
        states: &StateSet,
        _run_time: Time,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let folder = folder.ok_or_else(|| {
            CascadeError::SemanticError(format!(
                "no output folder available for log file {}",
                self.file_name
            ))
        })?;
        let mut file = filesystem.open_write(&folder.join(&self.file_name))?;
        write!(file, "Time")?;
        for key in &self.states {
            write!(file, ",{}", states.get(*key).name())?;
        }
        writeln!(file)?;
        self.file = Some(file);
        Ok(())
    }

    fn write_log(&mut self, time: Time, states: &StateSet) -> Result<()> {
        if let Some(file) = &mut self.file {
            write!(file, "{}", time)?;
            for key in &self.states {
                write!(file, ",{}", states.get(*key).num())?;
            }
            writeln!(file)?;
        }
        Ok(())
    }

    fn uninitialize(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }

    fn writes_to_disk(&self) -> bool {
        self.enabled
    }
}

/// Displays the finished fraction of the run on the console.
/// Writes nothing to disk.
pub struct ProgressLogger {
    console: Box<dyn Console>,
    run_time: Time,
}

impl ProgressLogger {
    pub fn new() -> Self {
        Self::with_console(Box::new(StdConsole))
    }

    pub fn with_console(console: Box<dyn Console>) -> Self {
        Self {
            console,
            run_time: 1.0,
        }
    }
}

impl Default for ProgressLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggerTask for ProgressLogger {
    fn initialize(
        &mut self,
        _filesystem: &dyn Filesystem,
        _folder: Option<&Path>,
        _states: &StateSet,
        run_time: Time,
    ) -> Result<()> {
        self.run_time = run_time;
        self.console.write_text("Simulating model:   0.0%");
        Ok(())
    }

    fn write_log(&mut self, time: Time, _states: &StateSet) -> Result<()> {
        let percent = time / self.run_time * 100.0;
        self.console
            .write_text(&format!("\rSimulating model: {:5.1}%", percent));
        Ok(())
    }

    fn uninitialize(&mut self) -> Result<()> {
        self.console.write_text("\rSimulating model: finished\n");
        Ok(())
    }

    fn writes_to_disk(&self) -> bool {
        false
    }
}

/// Shared view of the series recorded by a [`MemoryLogger`].
#[derive(Clone, Default)]
pub struct MemoryRecords {
    inner: Rc<RefCell<Vec<TimeSeries>>>,
}

impl MemoryRecords {
    /// A copy of the recorded series.
    pub fn snapshot(&self) -> Vec<TimeSeries> {
        self.inner.borrow().clone()
    }
}

/// Records selected states into in-memory time series, one per state.
/// Writes nothing to disk; feeds tests and data exports.
#[derive(Default)]
pub struct MemoryLogger {
    states: Vec<StateKey>,
    records: MemoryRecords,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_state(&mut self, state: StateKey) {
        self.states.push(state);
    }

    /// A handle that stays valid after the logger is handed to the scheduler.
    pub fn records(&self) -> MemoryRecords {
        self.records.clone()
    }
}

impl LoggerTask for MemoryLogger {
    fn initialize(
        &mut self,
        _filesystem: &dyn Filesystem,
        _folder: Option<&Path>,
        states: &StateSet,
        _run_time: Time,
    ) -> Result<()> {
        let mut series = self.records.inner.borrow_mut();
        series.clear();
        for key in &self.states {
            series.push(TimeSeries::new(states.get(*key).name()));
        }
        Ok(())
    }

    fn write_log(&mut self, time: Time, states: &StateSet) -> Result<()> {
        let mut series = self.records.inner.borrow_mut();
        for (i, key) in self.states.iter().enumerate() {
            series[i].push(time, states.get(*key).num() as f64);
        }
        Ok(())
    }

    fn uninitialize(&mut self) -> Result<()> {
        Ok(())
    }

    fn writes_to_disk(&self) -> bool {
        false
    }
}

// =============================================================================
// LOGGER SCHEDULER
// =============================================================================

/// Drives all logger tasks on a fixed period. Records exist at
/// `t0, t0+p, t0+2p, ...` up to the latest notification, in monotonic
/// order, plus one final record when the run ends.
pub struct SimulationLogger {
    tasks: Vec<Box<dyn LoggerTask>>,
    log_period: Time,
    base_folder: PathBuf,
    last_log_time: Time,
    save_folder: Option<PathBuf>,
    clock: Box<dyn Clock>,
    filesystem: Box<dyn Filesystem>,
}

impl SimulationLogger {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            log_period: 0.1,
            base_folder: PathBuf::from("simulations"),
            last_log_time: 0.0,
            save_folder: None,
            clock: Box::new(SystemClock),
            filesystem: Box::new(StdFilesystem),
        }
    }

    pub fn add_task(&mut self, task: Box<dyn LoggerTask>) {
        self.tasks.push(task);
    }

    /// Sets the sampling period; fails with `InvalidPeriod` unless positive.
    pub fn set_log_period(&mut self, log_period: Time) -> Result<()> {
        if !(log_period > 0.0) {
            return Err(CascadeError::InvalidPeriod(log_period));
        }
        self.log_period = log_period;
        Ok(())
    }

    pub fn log_period(&self) -> Time {
        self.log_period
    }

    pub fn set_base_folder(&mut self, base_folder: impl Into<PathBuf>) {
        self.base_folder = base_folder.into();
    }

    pub fn set_clock(&mut self, clock: Box<dyn Clock>) {
        self.clock = clock;
    }

    pub fn set_filesystem(&mut self, filesystem: Box<dyn Filesystem>) {
        self.filesystem = filesystem;
    }

    /// The directory this run writes into, once initialized.
    pub fn save_folder(&self) -> Option<&Path> {
        self.save_folder.as_deref()
    }

    /// Opens a timestamped output directory (when some task writes to
    /// disk), initializes every task and writes the record at `time`.
    pub fn initialize(&mut self, time: Time, states: &StateSet, run_time: Time) -> Result<()> {
        if self.tasks.iter().any(|task| task.writes_to_disk()) {
            let folder = self.base_folder.join(self.clock.timestamp());
            self.filesystem.create_dir_recursive(&folder)?;
            self.save_folder = Some(folder);
        } else {
            self.save_folder = None;
        }
        for task in &mut self.tasks {
            task.initialize(
                self.filesystem.as_ref(),
                self.save_folder.as_deref(),
                states,
                run_time,
            )?;
        }
        self.write_record(time, states)?;
        self.last_log_time = time;
        Ok(())
    }

    /// Emits every snapshot strictly between the previous notification and
    /// the impending event at `time`, so that records reflect pre-event
    /// state.
    pub fn notify_next_change(&mut self, time: Time, states: &StateSet) -> Result<()> {
        while self.last_log_time + self.log_period < time {
            self.last_log_time += self.log_period;
            let record_time = self.last_log_time;
            self.write_record(record_time, states)?;
        }
        Ok(())
    }

    /// Emits the outstanding snapshots up to `time`, one final record at
    /// `time` (unless a record at exactly `time` exists already) and tears
    /// the tasks down in reverse registration order.
    pub fn uninitialize(&mut self, time: Time, states: &StateSet) -> Result<()> {
        self.notify_next_change(time, states)?;
        if time != self.last_log_time {
            self.write_record(time, states)?;
            self.last_log_time = time;
        }
        for task in self.tasks.iter_mut().rev() {
            task.uninitialize()?;
        }
        Ok(())
    }

    fn write_record(&mut self, time: Time, states: &StateSet) -> Result<()> {
        for task in &mut self.tasks {
            task.write_log(time, states)?;
        }
        Ok(())
    }
}

impl Default for SimulationLogger {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// SIMULATION
// =============================================================================

/// A stochastic simulation: the states, the reactions, the logger and one
/// random engine. Independent runs require independent instances; states
/// are never shared across simulations.
pub struct Simulation {
    states: StateSet,
    propensity_reactions: Vec<PropensityReaction>,
    delayed_reactions: Vec<DelayedReaction>,
    time: Time,
    logger: SimulationLogger,
    rng: SimulationRng,
}

impl Simulation {
    pub fn new() -> Self {
        Self::with_rng(SimulationRng::new())
    }

    /// A simulation with a fixed random seed, reproducing the same
    /// trajectory on every run.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(SimulationRng::with_seed(seed))
    }

    fn with_rng(rng: SimulationRng) -> Self {
        Self {
            states: StateSet::new(),
            propensity_reactions: Vec::new(),
            delayed_reactions: Vec::new(),
            time: 0.0,
            logger: SimulationLogger::new(),
            rng,
        }
    }

    pub fn reseed(&mut self, seed: u64) {
        self.rng = SimulationRng::with_seed(seed);
    }

    pub fn add_state(&mut self, state: State) -> Result<StateKey> {
        self.states.add(state)
    }

    pub fn add_reaction(&mut self, reaction: PropensityReaction) {
        self.propensity_reactions.push(reaction);
    }

    pub fn add_delayed_reaction(&mut self, reaction: DelayedReaction) {
        self.delayed_reactions.push(reaction);
    }

    pub fn states(&self) -> &StateSet {
        &self.states
    }

    pub fn state_key(&self, name: &str) -> Option<StateKey> {
        self.states.key_of(name)
    }

    pub fn count(&self, key: StateKey) -> u64 {
        self.states.get(key).num()
    }

    pub fn time(&self) -> Time {
        self.time
    }

    pub fn logger(&self) -> &SimulationLogger {
        &self.logger
    }

    pub fn logger_mut(&mut self) -> &mut SimulationLogger {
        &mut self.logger
    }

    pub fn propensity_reactions(&self) -> &[PropensityReaction] {
        &self.propensity_reactions
    }

    pub fn delayed_reactions(&self) -> &[DelayedReaction] {
        &self.delayed_reactions
    }

    /// Species-by-reaction stoichiometry matrix: reactants negative,
    /// products positive. Propensity reactions first, delayed after.
    pub fn stoichiometry_matrix(&self) -> Array2<f64> {
        let n_states = self.states.len();
        let n_reactions = self.propensity_reactions.len() + self.delayed_reactions.len();
        let mut matrix = Array2::zeros((n_states, n_reactions));

        for (j, reaction) in self.propensity_reactions.iter().enumerate() {
            for reactant in reaction.reactants() {
                matrix[[reactant.state.index(), j]] -= reactant.multiplicity as f64;
            }
            for product in reaction.products() {
                matrix[[product.state.index(), j]] += product.multiplicity as f64;
            }
        }
        for (j, reaction) in self.delayed_reactions.iter().enumerate() {
            let column = self.propensity_reactions.len() + j;
            matrix[[reaction.state().index(), column]] -= 1.0;
            for product in reaction.products() {
                matrix[[product.state.index(), column]] += product.multiplicity as f64;
            }
        }
        matrix
    }

    /// Executes one trajectory from t = 0 to at most `max_time`.
    ///
    /// On an error mid-run the logger tasks and states are still torn down,
    /// in reverse registration order, before the error surfaces.
    pub fn run(&mut self, max_time: Time) -> Result<()> {
        self.time = 0.0;
        for state in self.states.iter_mut() {
            state.initialize(0.0);
        }
        if let Err(error) = self.logger.initialize(self.time, &self.states, max_time) {
            for state in self.states.iter_mut().rev() {
                state.uninitialize();
            }
            return Err(error);
        }

        let result = self.run_loop(max_time);

        let teardown = self.logger.uninitialize(self.time, &self.states);
        for state in self.states.iter_mut().rev() {
            state.uninitialize();
        }
        result.and(teardown)
    }

    fn run_loop(&mut self, max_time: Time) -> Result<()> {
        // propensities of reactions
        let mut ai = vec![0.0; self.propensity_reactions.len()];

        while self.time <= max_time {
            // Aggregated reaction probability
            let mut a0 = 0.0;
            for (i, reaction) in self.propensity_reactions.iter().enumerate() {
                let rate = reaction.compute_rate(&self.states)?;
                if rate < 0.0 {
                    return Err(CascadeError::NegativeRate {
                        reaction: reaction.name().to_string(),
                        rate,
                        time: self.time,
                    });
                }
                ai[i] = rate;
                a0 += rate;
            }

            // Time span to the next propensity reaction event
            let tau = if a0 > 0.0 {
                let r1 = self.rng.uniform();
                1.0 / a0 * (1.0 / r1).ln()
            } else {
                INF
            };

            // Time of the next delayed reaction; the scan order is stable,
            // so the earlier registration wins a tie.
            let mut next_delayed_index = 0;
            let mut next_delayed_time = INF;
            for (i, reaction) in self.delayed_reactions.iter().enumerate() {
                let t = reaction.next_reaction_time(&self.states);
                if t < next_delayed_time {
                    next_delayed_time = t;
                    next_delayed_index = i;
                }
            }

            // Fire whichever comes first. The comparison is strict, so a
            // delayed reaction fires at its exact scheduled instant even
            // when a propensity draw coincides.
            if next_delayed_time > self.time + tau {
                self.time += tau;
                if self.time > max_time {
                    self.time = max_time;
                    break;
                }
                self.logger.notify_next_change(self.time, &self.states)?;

                // Decide the identity of the event and fire it
                let r2 = self.rng.uniform();
                let afraction = r2 * a0;
                let mut asum = 0.0;
                for (i, reaction) in self.propensity_reactions.iter().enumerate() {
                    asum += ai[i];
                    if asum >= afraction {
                        let mut info = SimInfo {
                            time: self.time,
                            run_time: max_time,
                            save_folder: self.logger.save_folder(),
                            random: &mut self.rng,
                        };
                        reaction.fire(&mut self.states, &mut info)?;
                        break;
                    }
                }
            } else {
                self.time = next_delayed_time;
                if self.time > max_time {
                    self.time = max_time;
                    break;
                }
                self.logger.notify_next_change(self.time, &self.states)?;

                let reaction = &self.delayed_reactions[next_delayed_index];
                let mut info = SimInfo {
                    time: self.time,
                    run_time: max_time,
                    save_folder: self.logger.save_folder(),
                    random: &mut self.rng,
                };
                reaction.fire(&mut self.states, &mut info)?;
            }
        }
        Ok(())
    }
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedClock;

    impl Clock for FixedClock {
        fn timestamp(&self) -> String {
            "test-run".to_string()
        }
    }

    fn decay_simulation(seed: u64, initial: u64, k: f64) -> (Simulation, MemoryRecords) {
        let mut sim = Simulation::with_seed(seed);
        let a = sim.add_state(State::new_simple("A", initial)).unwrap();
        let mut decay = PropensityReaction::new("decay", RateLaw::MassAction(k));
        decay.add_reactant(Reactant::once(a));
        sim.add_reaction(decay);

        let mut recorder = MemoryLogger::new();
        recorder.add_state(a);
        let records = recorder.records();
        sim.logger_mut().add_task(Box::new(recorder));
        sim.logger_mut().set_log_period(1.0).unwrap();
        (sim, records)
    }

    #[test]
    fn test_uniform_is_half_open() {
        let mut rng = SimulationRng::with_seed(7);
        for _ in 0..1000 {
            let r = rng.uniform();
            assert!((0.0..1.0).contains(&r));
        }
    }

    #[test]
    fn test_uniform_int_is_inclusive() {
        let mut rng = SimulationRng::with_seed(7);
        let mut seen = [false; 3];
        for _ in 0..200 {
            let r = rng.uniform_int(3, 5);
            assert!((3..=5).contains(&r));
            seen[(r - 3) as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_state_lifecycle() {
        let mut state = State::new_simple("A", 10);
        assert_eq!(state.num(), 0);
        state.initialize(0.0);
        assert_eq!(state.num(), 10);
        state.add(0.5);
        state.remove(0.6).unwrap();
        state.remove(0.7).unwrap();
        assert_eq!(state.num(), 9);
        state.uninitialize();
        assert_eq!(state.num(), 0);
    }

    #[test]
    fn test_state_underflow_is_fatal() {
        let mut state = State::new_simple("A", 0);
        state.initialize(0.0);
        match state.remove(1.5) {
            Err(CascadeError::StateUnderflow { state, time }) => {
                assert_eq!(state, "A");
                assert_eq!(time, 1.5);
            }
            other => panic!("expected underflow, got {:?}", other),
        }
    }

    #[test]
    fn test_complex_state_queue_order() {
        let mut state = State::new_complex("Q", 0, RemovalPolicy::Oldest);
        state.initialize(0.0);
        state.add(1.0);
        state.add(2.0);
        assert_eq!(state.peek().unwrap().creation_time, 1.0);
        let molecule = state.remove(3.0).unwrap().unwrap();
        assert_eq!(molecule.creation_time, 1.0);
        assert_eq!(state.peek().unwrap().creation_time, 2.0);

        let mut lifo = State::new_complex("S", 0, RemovalPolicy::Newest);
        lifo.initialize(0.0);
        lifo.add(1.0);
        lifo.add(2.0);
        let molecule = lifo.remove(3.0).unwrap().unwrap();
        assert_eq!(molecule.creation_time, 2.0);
    }

    #[test]
    fn test_state_set_rejects_duplicate_names() {
        let mut states = StateSet::new();
        states.add(State::new_simple("A", 1)).unwrap();
        assert!(matches!(
            states.add(State::new_simple("A", 2)),
            Err(CascadeError::RedefinedIdentifier(_))
        ));
    }

    #[test]
    fn test_mass_action_combinatorics() {
        let mut states = StateSet::new();
        let a = states.add(State::new_simple("A", 3)).unwrap();
        let b = states.add(State::new_simple("B", 2)).unwrap();
        for state in states.iter_mut() {
            state.initialize(0.0);
        }

        let mut reaction = PropensityReaction::new("bind", RateLaw::MassAction(2.0));
        reaction.add_reactant(Reactant::once(a));
        reaction.add_reactant(Reactant::once(b));
        assert_eq!(reaction.compute_rate(&states).unwrap(), 12.0);

        let mut dimerize = PropensityReaction::new("dimerize", RateLaw::MassAction(1.0));
        dimerize.add_reactant(Reactant::new(a, 2));
        // 3 * 2 ordered pairs
        assert_eq!(dimerize.compute_rate(&states).unwrap(), 6.0);

        let mut starved = PropensityReaction::new("starved", RateLaw::MassAction(1.0));
        starved.add_reactant(Reactant::new(b, 3));
        assert_eq!(starved.compute_rate(&states).unwrap(), 0.0);
    }

    #[test]
    fn test_expression_rate_sees_live_counts() {
        let mut states = StateSet::new();
        let a = states.add(State::new_simple("A", 4)).unwrap();
        states.get_mut(a).initialize(0.0);

        let expr = Expression::Product(vec![
            cascade_expr::Factor::multiply(Expression::number(0.5)),
            cascade_expr::Factor::multiply(Expression::variable("A")),
        ]);
        let reaction = PropensityReaction::new("custom", RateLaw::Expression(expr));
        assert_eq!(reaction.compute_rate(&states).unwrap(), 2.0);

        states.get_mut(a).add(0.1);
        assert_eq!(reaction.compute_rate(&states).unwrap(), 2.5);
    }

    #[test]
    fn test_decay_reaches_low_count() {
        // A = 1000, A -> 0 at rate 0.1, run to t = 10: the expectation is
        // 1000 * exp(-1) with a standard deviation around 15.
        let (mut sim, records) = decay_simulation(42, 1000, 0.1);
        sim.run(10.0).unwrap();

        let series = records.snapshot();
        let (_, final_count) = series[0].last().unwrap();
        assert!(
            (250.0..=500.0).contains(&final_count),
            "final count {} outside plausible range",
            final_count
        );
        // Counts never increase in a pure decay.
        for pair in series[0].values.windows(2) {
            assert!(pair[1] <= pair[0]);
        }
    }

    #[test]
    fn test_logger_regularity() {
        let (mut sim, records) = decay_simulation(1, 100, 0.05);
        sim.run(10.0).unwrap();

        let series = records.snapshot();
        let times = &series[0].time;
        assert_eq!(times.len(), 11);
        for (i, t) in times.iter().enumerate() {
            assert!((t - i as f64).abs() < 1e-9);
        }
        // Strictly monotonic record times.
        for pair in times.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[test]
    fn test_runs_are_deterministic_per_seed() {
        let (mut first, first_records) = decay_simulation(99, 500, 0.2);
        first.run(8.0).unwrap();
        let (mut second, second_records) = decay_simulation(99, 500, 0.2);
        second.run(8.0).unwrap();

        assert_eq!(first_records.snapshot(), second_records.snapshot());

        let (mut third, third_records) = decay_simulation(100, 500, 0.2);
        third.run(8.0).unwrap();
        assert_ne!(first_records.snapshot(), third_records.snapshot());
    }

    #[test]
    fn test_dimerization_conserves_monomers() {
        // 2 M -> D and D -> 2 M conserve M + 2 D at every sample.
        let mut sim = Simulation::with_seed(7);
        let m = sim.add_state(State::new_simple("M", 100)).unwrap();
        let d = sim.add_state(State::new_simple("D", 0)).unwrap();

        let mut forward = PropensityReaction::new("dimerize", RateLaw::MassAction(0.01));
        forward.add_reactant(Reactant::new(m, 2));
        forward.add_product(Reactant::once(d));
        sim.add_reaction(forward);

        let mut backward = PropensityReaction::new("dissociate", RateLaw::MassAction(0.1));
        backward.add_reactant(Reactant::once(d));
        backward.add_product(Reactant::new(m, 2));
        sim.add_reaction(backward);

        let mut recorder = MemoryLogger::new();
        recorder.add_state(m);
        recorder.add_state(d);
        let records = recorder.records();
        sim.logger_mut().add_task(Box::new(recorder));
        sim.logger_mut().set_log_period(1.0).unwrap();

        sim.run(50.0).unwrap();

        let series = records.snapshot();
        assert!(!series[0].is_empty());
        for i in 0..series[0].len() {
            let total = series[0].values[i] + 2.0 * series[1].values[i];
            assert_eq!(total, 100.0);
        }
    }

    #[test]
    fn test_delayed_reaction_fires_at_exact_time() {
        // Five molecules created at t = 0 all convert exactly at t = 2.
        let mut sim = Simulation::with_seed(5);
        let a = sim
            .add_state(State::new_complex("A", 5, RemovalPolicy::Oldest))
            .unwrap();
        let b = sim.add_state(State::new_simple("B", 0)).unwrap();

        let mut convert = DelayedReaction::new("mature", a, 2.0);
        convert.add_product(Reactant::once(b));
        sim.add_delayed_reaction(convert);

        let mut recorder = MemoryLogger::new();
        recorder.add_state(a);
        recorder.add_state(b);
        let records = recorder.records();
        sim.logger_mut().add_task(Box::new(recorder));
        sim.logger_mut().set_log_period(1.0).unwrap();

        sim.run(10.0).unwrap();

        let series = records.snapshot();
        let at = |t: f64, s: usize| {
            let i = series[s].time.iter().position(|&x| x == t).unwrap();
            series[s].values[i]
        };
        assert_eq!(at(1.0, 0), 5.0);
        assert_eq!(at(1.0, 1), 0.0);
        assert_eq!(at(2.0, 1), 5.0);
        assert_eq!(at(10.0, 0), 0.0);
        assert_eq!(at(10.0, 1), 5.0);
        // Total is conserved at every sample.
        for i in 0..series[0].len() {
            assert_eq!(series[0].values[i] + series[1].values[i], 5.0);
        }
    }

    #[test]
    fn test_empty_model_advances_to_max_time() {
        let mut sim = Simulation::with_seed(3);
        sim.add_state(State::new_simple("A", 1)).unwrap();
        sim.run(5.0).unwrap();
        assert_eq!(sim.time(), 5.0);
    }

    #[test]
    fn test_negative_rate_is_fatal() {
        let mut sim = Simulation::with_seed(1);
        let a = sim.add_state(State::new_simple("A", 1)).unwrap();
        let mut bad = PropensityReaction::new("bad", RateLaw::Expression(Expression::number(-1.0)));
        bad.add_reactant(Reactant::once(a));
        sim.add_reaction(bad);

        match sim.run(1.0) {
            Err(CascadeError::NegativeRate { reaction, rate, .. }) => {
                assert_eq!(reaction, "bad");
                assert_eq!(rate, -1.0);
            }
            other => panic!("expected negative rate error, got {:?}", other),
        }
    }

    #[test]
    fn test_underflow_mid_run_is_fatal() {
        // The rate ignores the reactant count, so the reaction keeps firing
        // on an empty state.
        let mut sim = Simulation::with_seed(1);
        let a = sim.add_state(State::new_simple("A", 0)).unwrap();
        let mut drain =
            PropensityReaction::new("drain", RateLaw::Expression(Expression::number(1.0)));
        drain.add_reactant(Reactant::once(a));
        sim.add_reaction(drain);

        assert!(matches!(
            sim.run(10.0),
            Err(CascadeError::StateUnderflow { .. })
        ));
        // States were still torn down.
        assert_eq!(sim.count(a), 0);
    }

    #[test]
    fn test_invalid_log_period() {
        let mut logger = SimulationLogger::new();
        assert!(matches!(
            logger.set_log_period(0.0),
            Err(CascadeError::InvalidPeriod(_))
        ));
        assert!(matches!(
            logger.set_log_period(-1.0),
            Err(CascadeError::InvalidPeriod(_))
        ));
        logger.set_log_period(0.5).unwrap();
        assert_eq!(logger.log_period(), 0.5);
    }

    #[test]
    fn test_state_logger_writes_table() {
        let dir = tempfile::tempdir().unwrap();

        let mut sim = Simulation::with_seed(11);
        let a = sim.add_state(State::new_simple("A", 10)).unwrap();
        let mut decay = PropensityReaction::new("decay", RateLaw::MassAction(1.0));
        decay.add_reactant(Reactant::once(a));
        sim.add_reaction(decay);

        let mut table = StateLogger::new("states.csv");
        table.add_state(a);
        let logger = sim.logger_mut();
        logger.add_task(Box::new(table));
        logger.set_log_period(1.0).unwrap();
        logger.set_base_folder(dir.path());
        logger.set_clock(Box::new(FixedClock));

        sim.run(5.0).unwrap();

        let contents =
            std::fs::read_to_string(dir.path().join("test-run").join("states.csv")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "Time,A");
        assert_eq!(lines.len(), 7);
        let mut previous = u64::MAX;
        for line in &lines[1..] {
            let count: u64 = line.split(',').nth(1).unwrap().parse().unwrap();
            assert!(count <= previous);
            previous = count;
        }
    }

    #[test]
    fn test_disabled_state_logger_skips_disk() {
        let mut sim = Simulation::with_seed(11);
        let a = sim.add_state(State::new_simple("A", 1)).unwrap();
        let mut table = StateLogger::new("states.csv");
        table.add_state(a);
        table.set_enabled(false);
        sim.logger_mut().add_task(Box::new(table));

        sim.run(1.0).unwrap();
        // No disk writer, no output folder.
        assert!(sim.logger().save_folder().is_none());
    }

    #[test]
    fn test_stoichiometry_matrix() {
        let mut sim = Simulation::with_seed(1);
        let m = sim.add_state(State::new_simple("M", 100)).unwrap();
        let d = sim.add_state(State::new_simple("D", 0)).unwrap();

        let mut forward = PropensityReaction::new("dimerize", RateLaw::MassAction(0.01));
        forward.add_reactant(Reactant::new(m, 2));
        forward.add_product(Reactant::once(d));
        sim.add_reaction(forward);

        let matrix = sim.stoichiometry_matrix();
        assert_eq!(matrix.nrows(), 2);
        assert_eq!(matrix.ncols(), 1);
        assert_eq!(matrix[[0, 0]], -2.0);
        assert_eq!(matrix[[1, 0]], 1.0);
    }
}
