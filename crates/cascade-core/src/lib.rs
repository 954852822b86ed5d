//! # Cascade Core
//!
//! Shared types for the Cascade stochastic reaction-network simulator.
//!
//! ## Subsystems built on top of this crate
//!
//! | Crate | Role |
//! |-------|------|
//! | cascade-expr | Symbolic rate-law expressions |
//! | cascade-cmdl | CMDL model-description language |
//! | cascade-sim | Gillespie-style simulation kernel |
//! | cascade-cli | Command-line driver |
//!
//! ## Design Philosophy
//!
//! 1. One shared error enum; every failure names the offending entity
//! 2. Simulation time is a plain `f64`, with `INF` marking "no next event"
//! 3. All model state lives inside a simulator instance; no globals

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Simulation time
pub type Time = f64;

/// Marks "no next event": no reaction is scheduled and no propensity is positive.
pub const INF: Time = f64::INFINITY;

/// Common errors
#[derive(Debug, Error)]
pub enum CascadeError {
    #[error("Unbound variable: {0}")]
    UnboundVariable(String),

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Unrecognized character '{found}' in line {line}")]
    LexError { line: usize, found: char },

    #[error("Syntax error in line {line}: {message}")]
    SyntaxError { line: usize, message: String },

    #[error("Expression nested too deeply")]
    StackOverflow,

    #[error("Identifier already defined: {0}")]
    RedefinedIdentifier(String),

    #[error("Semantic error: {0}")]
    SemanticError(String),

    #[error("Log period must be positive, got {0}")]
    InvalidPeriod(f64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("State {state} is empty at t={time}, cannot remove a molecule")]
    StateUnderflow { state: String, time: Time },

    #[error("Reaction {reaction} computed negative rate {rate} at t={time}")]
    NegativeRate {
        reaction: String,
        rate: f64,
        time: Time,
    },
}

pub type Result<T> = std::result::Result<T, CascadeError>;

/// Time series data recorded during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Time points
    pub time: Vec<Time>,
    /// Values at each time point
    pub values: Vec<f64>,
    /// Variable name
    pub name: String,
}

impl TimeSeries {
    pub fn new(name: &str) -> Self {
        Self {
            time: Vec::new(),
            values: Vec::new(),
            name: name.to_string(),
        }
    }

    pub fn push(&mut self, t: Time, v: f64) {
        self.time.push(t);
        self.values.push(v);
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Value recorded last, if any.
    pub fn last(&self) -> Option<(Time, f64)> {
        match (self.time.last(), self.values.last()) {
            (Some(&t), Some(&v)) => Some((t, v)),
            _ => None,
        }
    }
}
