//! # Cascade Expressions
//!
//! Symbolic arithmetic expressions for rate laws and propensities.
//!
//! ## Capabilities
//!
//! 1. **Evaluation**: against a variable environment, with errors for
//!    unbound names and division by zero
//! 2. **Simplification**: constant folding against a variable register,
//!    preserving variables the register does not know
//! 3. **Printing**: round-trippable CMDL text
//! 4. **Binding**: variables resolve to live values (e.g. species counts)
//!    through a lookup environment supplied at evaluation time
//!
//! ## Expression Forms
//!
//! Numbers, named variables, signed sums, products with division,
//! unary minus and logical not, comparisons (producing 1.0 or 0.0),
//! logical conjunction/disjunction, exponentiation, and the ternary
//! conditional `condition ? ifTrue : ifFalse` (a condition is true
//! when it evaluates to anything but zero).
//!
//! Every subtree is exclusively owned by its parent; `Clone` is a deep,
//! independent copy. There is no sharing and there are no cycles.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use cascade_core::{CascadeError, Result};
use serde::{Deserialize, Serialize};

/// Substitution chains through a register are cut off at this depth.
const MAX_SIMPLIFY_DEPTH: usize = 512;

// =============================================================================
// EXPRESSION TREE
// =============================================================================

/// Sign of a term in a sum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sign {
    Plus,
    Minus,
}

/// One term of a sum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Term {
    pub sign: Sign,
    pub expr: Expression,
}

impl Term {
    pub fn plus(expr: Expression) -> Self {
        Self {
            sign: Sign::Plus,
            expr,
        }
    }

    pub fn minus(expr: Expression) -> Self {
        Self {
            sign: Sign::Minus,
            expr,
        }
    }
}

/// One factor of a product; `inverse` factors divide instead of multiply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Factor {
    pub inverse: bool,
    pub expr: Expression,
}

impl Factor {
    pub fn multiply(expr: Expression) -> Self {
        Self {
            inverse: false,
            expr,
        }
    }

    pub fn divide(expr: Expression) -> Self {
        Self {
            inverse: true,
            expr,
        }
    }
}

/// Comparison operators, evaluating to 1.0 or 0.0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

impl CompareOp {
    fn holds(self, left: f64, right: f64) -> bool {
        match self {
            Self::Equal => left == right,
            Self::NotEqual => left != right,
            Self::Less => left < right,
            Self::LessEqual => left <= right,
            Self::Greater => left > right,
            Self::GreaterEqual => left >= right,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::Less => "<",
            Self::LessEqual => "<=",
            Self::Greater => ">",
            Self::GreaterEqual => ">=",
        }
    }
}

/// Logical connectives; operands are true when nonzero
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalOp {
    And,
    Or,
}

impl LogicalOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::And => "&&",
            Self::Or => "||",
        }
    }
}

/// An arithmetic expression over numbers and named variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    /// A literal value
    Number(f64),
    /// A named reference, resolved through a [`VariableLookup`] at evaluation
    Variable(String),
    /// Ordered list of signed terms
    Sum(Vec<Term>),
    /// Ordered list of factors; inverse factors divide
    Product(Vec<Factor>),
    /// Unary negation
    Minus(Box<Expression>),
    /// Logical negation: nonzero becomes 0.0, zero becomes 1.0
    Not(Box<Expression>),
    /// Exponentiation
    Power {
        base: Box<Expression>,
        exponent: Box<Expression>,
    },
    /// Comparison, evaluating to 1.0 or 0.0
    Compare {
        op: CompareOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    /// Conjunction or disjunction, evaluating to 1.0 or 0.0
    Logical {
        op: LogicalOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    /// `condition ? if_true : if_false`; only the taken branch is evaluated
    Conditional {
        condition: Box<Expression>,
        if_true: Box<Expression>,
        if_false: Box<Expression>,
    },
}

impl Expression {
    /// Shorthand for a literal.
    pub fn number(value: f64) -> Self {
        Self::Number(value)
    }

    /// Shorthand for a named variable.
    pub fn variable(name: &str) -> Self {
        Self::Variable(name.to_string())
    }

    /// Evaluates the expression against `env`.
    ///
    /// Fails with `UnboundVariable` when a referenced name has no binding and
    /// with `DivisionByZero` when a divisor evaluates to exactly zero.
    pub fn eval(&self, env: &dyn VariableLookup) -> Result<f64> {
        match self {
            Self::Number(value) => Ok(*value),
            Self::Variable(name) => env
                .value_of(name)
                .ok_or_else(|| CascadeError::UnboundVariable(name.clone())),
            Self::Sum(terms) => {
                let mut sum = 0.0;
                for term in terms {
                    let value = term.expr.eval(env)?;
                    match term.sign {
                        Sign::Plus => sum += value,
                        Sign::Minus => sum -= value,
                    }
                }
                Ok(sum)
            }
            Self::Product(factors) => {
                let mut product = 1.0;
                for factor in factors {
                    let value = factor.expr.eval(env)?;
                    if factor.inverse {
                        if value == 0.0 {
                            return Err(CascadeError::DivisionByZero);
                        }
                        product /= value;
                    } else {
                        product *= value;
                    }
                }
                Ok(product)
            }
            Self::Minus(inner) => Ok(-inner.eval(env)?),
            Self::Not(inner) => Ok(if inner.eval(env)? != 0.0 { 0.0 } else { 1.0 }),
            Self::Power { base, exponent } => Ok(base.eval(env)?.powf(exponent.eval(env)?)),
            Self::Compare { op, left, right } => {
                let left = left.eval(env)?;
                let right = right.eval(env)?;
                Ok(if op.holds(left, right) { 1.0 } else { 0.0 })
            }
            Self::Logical { op, left, right } => {
                let left = left.eval(env)? != 0.0;
                let right = right.eval(env)? != 0.0;
                let result = match op {
                    LogicalOp::And => left && right,
                    LogicalOp::Or => left || right,
                };
                Ok(if result { 1.0 } else { 0.0 })
            }
            Self::Conditional {
                condition,
                if_true,
                if_false,
            } => {
                if condition.eval(env)? != 0.0 {
                    if_true.eval(env)
                } else {
                    if_false.eval(env)
                }
            }
        }
    }

    /// Returns a new tree with every subtree that depends only on registered
    /// variables collapsed to a `Number`. Variables absent from the register
    /// are preserved.
    ///
    /// Fails only where evaluation of a folded constant subtree would fail,
    /// i.e. on division by a literal zero.
    pub fn simplify(&self, vars: &VariableRegister) -> Result<Expression> {
        self.simplify_at(vars, 0)
    }

    fn simplify_at(&self, vars: &VariableRegister, depth: usize) -> Result<Expression> {
        if depth > MAX_SIMPLIFY_DEPTH {
            return Err(CascadeError::StackOverflow);
        }
        Ok(match self {
            Self::Number(value) => Self::Number(*value),
            Self::Variable(name) => match vars.lookup(name) {
                Some(expr) => expr.simplify_at(vars, depth + 1)?,
                None => Self::Variable(name.clone()),
            },
            Self::Sum(terms) => {
                let mut constant = 0.0;
                let mut rest = Vec::new();
                for term in terms {
                    let simplified = term.expr.simplify_at(vars, depth + 1)?;
                    match simplified {
                        Self::Number(value) => match term.sign {
                            Sign::Plus => constant += value,
                            Sign::Minus => constant -= value,
                        },
                        other => rest.push(Term {
                            sign: term.sign,
                            expr: other,
                        }),
                    }
                }
                if rest.is_empty() {
                    Self::Number(constant)
                } else if constant == 0.0 && rest.len() == 1 && rest[0].sign == Sign::Plus {
                    rest.remove(0).expr
                } else {
                    let mut terms = Vec::with_capacity(rest.len() + 1);
                    if constant != 0.0 {
                        terms.push(Term::plus(Self::Number(constant)));
                    }
                    terms.extend(rest);
                    Self::Sum(terms)
                }
            }
            Self::Product(factors) => {
                let mut constant = 1.0;
                let mut rest = Vec::new();
                for factor in factors {
                    let simplified = factor.expr.simplify_at(vars, depth + 1)?;
                    match simplified {
                        Self::Number(value) => {
                            if factor.inverse {
                                if value == 0.0 {
                                    return Err(CascadeError::DivisionByZero);
                                }
                                constant /= value;
                            } else {
                                constant *= value;
                            }
                        }
                        other => rest.push(Factor {
                            inverse: factor.inverse,
                            expr: other,
                        }),
                    }
                }
                if rest.is_empty() {
                    Self::Number(constant)
                } else if constant == 1.0 && rest.len() == 1 && !rest[0].inverse {
                    rest.remove(0).expr
                } else {
                    let mut factors = Vec::with_capacity(rest.len() + 1);
                    if constant != 1.0 {
                        factors.push(Factor::multiply(Self::Number(constant)));
                    }
                    factors.extend(rest);
                    Self::Product(factors)
                }
            }
            Self::Minus(inner) => match inner.simplify_at(vars, depth + 1)? {
                Self::Number(value) => Self::Number(-value),
                other => Self::Minus(Box::new(other)),
            },
            Self::Not(inner) => match inner.simplify_at(vars, depth + 1)? {
                Self::Number(value) => Self::Number(if value != 0.0 { 0.0 } else { 1.0 }),
                other => Self::Not(Box::new(other)),
            },
            Self::Power { base, exponent } => {
                let base = base.simplify_at(vars, depth + 1)?;
                let exponent = exponent.simplify_at(vars, depth + 1)?;
                match (&base, &exponent) {
                    (Self::Number(b), Self::Number(e)) => Self::Number(b.powf(*e)),
                    _ => Self::Power {
                        base: Box::new(base),
                        exponent: Box::new(exponent),
                    },
                }
            }
            Self::Compare { op, left, right } => {
                let left = left.simplify_at(vars, depth + 1)?;
                let right = right.simplify_at(vars, depth + 1)?;
                match (&left, &right) {
                    (Self::Number(l), Self::Number(r)) => {
                        Self::Number(if op.holds(*l, *r) { 1.0 } else { 0.0 })
                    }
                    _ => Self::Compare {
                        op: *op,
                        left: Box::new(left),
                        right: Box::new(right),
                    },
                }
            }
            Self::Logical { op, left, right } => {
                let left = left.simplify_at(vars, depth + 1)?;
                let right = right.simplify_at(vars, depth + 1)?;
                match (op, &left, &right) {
                    (_, Self::Number(l), Self::Number(r)) => {
                        let l = *l != 0.0;
                        let r = *r != 0.0;
                        let result = match op {
                            LogicalOp::And => l && r,
                            LogicalOp::Or => l || r,
                        };
                        Self::Number(if result { 1.0 } else { 0.0 })
                    }
                    // A controlling constant decides the result on its own.
                    (LogicalOp::And, Self::Number(v), _) | (LogicalOp::And, _, Self::Number(v))
                        if *v == 0.0 =>
                    {
                        Self::Number(0.0)
                    }
                    (LogicalOp::Or, Self::Number(v), _) | (LogicalOp::Or, _, Self::Number(v))
                        if *v != 0.0 =>
                    {
                        Self::Number(1.0)
                    }
                    _ => Self::Logical {
                        op: *op,
                        left: Box::new(left),
                        right: Box::new(right),
                    },
                }
            }
            Self::Conditional {
                condition,
                if_true,
                if_false,
            } => {
                let condition = condition.simplify_at(vars, depth + 1)?;
                if let Self::Number(value) = condition {
                    if value != 0.0 {
                        if_true.simplify_at(vars, depth + 1)?
                    } else {
                        if_false.simplify_at(vars, depth + 1)?
                    }
                } else {
                    Self::Conditional {
                        condition: Box::new(condition),
                        if_true: Box::new(if_true.simplify_at(vars, depth + 1)?),
                        if_false: Box::new(if_false.simplify_at(vars, depth + 1)?),
                    }
                }
            }
        })
    }

    /// True for nodes that never need parentheses.
    fn is_atomic(&self) -> bool {
        matches!(self, Self::Number(_) | Self::Variable(_))
    }

    /// Writes the expression in CMDL syntax. When `sub_expression` is true,
    /// non-atomic nodes wrap themselves in parentheses.
    pub fn print_cmdl(&self, out: &mut dyn fmt::Write, sub_expression: bool) -> fmt::Result {
        let wrap = sub_expression && !self.is_atomic();
        if wrap {
            out.write_str("(")?;
        }
        match self {
            Self::Number(value) => write!(out, "{}", value)?,
            Self::Variable(name) => out.write_str(name)?,
            Self::Sum(terms) => {
                for (i, term) in terms.iter().enumerate() {
                    if i == 0 {
                        if term.sign == Sign::Minus {
                            out.write_str("-")?;
                        }
                    } else {
                        out.write_str(match term.sign {
                            Sign::Plus => " + ",
                            Sign::Minus => " - ",
                        })?;
                    }
                    term.expr.print_cmdl(out, true)?;
                }
            }
            Self::Product(factors) => {
                for (i, factor) in factors.iter().enumerate() {
                    if i == 0 {
                        if factor.inverse {
                            out.write_str("1 / ")?;
                        }
                    } else {
                        out.write_str(if factor.inverse { " / " } else { " * " })?;
                    }
                    factor.expr.print_cmdl(out, true)?;
                }
            }
            Self::Minus(inner) => {
                out.write_str("-")?;
                inner.print_cmdl(out, true)?;
            }
            Self::Not(inner) => {
                out.write_str("!")?;
                inner.print_cmdl(out, true)?;
            }
            Self::Power { base, exponent } => {
                base.print_cmdl(out, true)?;
                out.write_str(" ^ ")?;
                exponent.print_cmdl(out, true)?;
            }
            Self::Compare { op, left, right } => {
                left.print_cmdl(out, true)?;
                write!(out, " {} ", op.symbol())?;
                right.print_cmdl(out, true)?;
            }
            Self::Logical { op, left, right } => {
                left.print_cmdl(out, true)?;
                write!(out, " {} ", op.symbol())?;
                right.print_cmdl(out, true)?;
            }
            Self::Conditional {
                condition,
                if_true,
                if_false,
            } => {
                condition.print_cmdl(out, true)?;
                out.write_str(" ? ")?;
                if_true.print_cmdl(out, true)?;
                out.write_str(" : ")?;
                if_false.print_cmdl(out, true)?;
            }
        }
        if wrap {
            out.write_str(")")?;
        }
        Ok(())
    }

    /// Collects every variable name referenced anywhere in the tree.
    pub fn variables(&self, out: &mut BTreeSet<String>) {
        match self {
            Self::Number(_) => {}
            Self::Variable(name) => {
                out.insert(name.clone());
            }
            Self::Sum(terms) => {
                for term in terms {
                    term.expr.variables(out);
                }
            }
            Self::Product(factors) => {
                for factor in factors {
                    factor.expr.variables(out);
                }
            }
            Self::Minus(inner) | Self::Not(inner) => inner.variables(out),
            Self::Power { base, exponent } => {
                base.variables(out);
                exponent.variables(out);
            }
            Self::Compare { left, right, .. } | Self::Logical { left, right, .. } => {
                left.variables(out);
                right.variables(out);
            }
            Self::Conditional {
                condition,
                if_true,
                if_false,
            } => {
                condition.variables(out);
                if_true.variables(out);
                if_false.variables(out);
            }
        }
    }

}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.print_cmdl(f, false)
    }
}

// =============================================================================
// VARIABLE REGISTER
// =============================================================================

/// A mapping from identifier to expression, used during simplification.
/// Constants are stored as `Expression::Number`.
#[derive(Debug, Clone, Default)]
pub struct VariableRegister {
    entries: HashMap<String, Expression>,
}

impl VariableRegister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `expr` under `name`; a second definition of the same name
    /// fails with `RedefinedIdentifier`.
    pub fn define(&mut self, name: &str, expr: Expression) -> Result<()> {
        if self.entries.contains_key(name) {
            return Err(CascadeError::RedefinedIdentifier(name.to_string()));
        }
        self.entries.insert(name.to_string(), expr);
        Ok(())
    }

    pub fn define_constant(&mut self, name: &str, value: f64) -> Result<()> {
        self.define(name, Expression::Number(value))
    }

    pub fn lookup(&self, name: &str) -> Option<&Expression> {
        self.entries.get(name)
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// The registered value if it is a plain number.
    pub fn constant(&self, name: &str) -> Option<f64> {
        match self.entries.get(name) {
            Some(Expression::Number(value)) => Some(*value),
            _ => None,
        }
    }

    /// A copy of the register with the given names removed. Used to keep
    /// species identifiers live while folding parameters.
    pub fn without(&self, names: &BTreeSet<String>) -> VariableRegister {
        let entries = self
            .entries
            .iter()
            .filter(|(name, _)| !names.contains(*name))
            .map(|(name, expr)| (name.clone(), expr.clone()))
            .collect();
        Self { entries }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// EVALUATION ENVIRONMENTS
// =============================================================================

/// Resolves variable names to current numeric values at evaluation time.
pub trait VariableLookup {
    fn value_of(&self, name: &str) -> Option<f64>;
}

/// An environment that binds nothing; every variable reference fails.
pub struct EmptyLookup;

impl VariableLookup for EmptyLookup {
    fn value_of(&self, _name: &str) -> Option<f64> {
        None
    }
}

impl VariableLookup for HashMap<String, f64> {
    fn value_of(&self, name: &str) -> Option<f64> {
        self.get(name).copied()
    }
}

impl VariableLookup for VariableRegister {
    fn value_of(&self, name: &str) -> Option<f64> {
        self.constant(name)
    }
}

/// A mapping from identifier to a callable returning the current value,
/// connecting variables to live quantities such as species counts.
#[derive(Default)]
pub struct BindingRegister {
    bindings: HashMap<String, Box<dyn Fn() -> f64>>,
}

impl BindingRegister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `name` to `binding`. Re-binding a name replaces the prior binding.
    pub fn register(&mut self, name: &str, binding: Box<dyn Fn() -> f64>) {
        self.bindings.insert(name.to_string(), binding);
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }
}

impl VariableLookup for BindingRegister {
    fn value_of(&self, name: &str) -> Option<f64> {
        self.bindings.get(name).map(|binding| binding())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn sum(terms: Vec<Term>) -> Expression {
        Expression::Sum(terms)
    }

    fn product(factors: Vec<Factor>) -> Expression {
        Expression::Product(factors)
    }

    #[test]
    fn test_eval_arithmetic() {
        // 1 + 2 * 3 - 4 / 2 == 5
        let expr = sum(vec![
            Term::plus(Expression::number(1.0)),
            Term::plus(product(vec![
                Factor::multiply(Expression::number(2.0)),
                Factor::multiply(Expression::number(3.0)),
            ])),
            Term::minus(product(vec![
                Factor::multiply(Expression::number(4.0)),
                Factor::divide(Expression::number(2.0)),
            ])),
        ]);
        assert_eq!(expr.eval(&EmptyLookup).unwrap(), 5.0);
    }

    #[test]
    fn test_eval_unbound_variable() {
        let expr = Expression::variable("missing");
        match expr.eval(&EmptyLookup) {
            Err(CascadeError::UnboundVariable(name)) => assert_eq!(name, "missing"),
            other => panic!("expected unbound variable error, got {:?}", other),
        }
    }

    #[test]
    fn test_eval_division_by_zero() {
        let expr = product(vec![
            Factor::multiply(Expression::number(1.0)),
            Factor::divide(Expression::number(0.0)),
        ]);
        assert!(matches!(
            expr.eval(&EmptyLookup),
            Err(CascadeError::DivisionByZero)
        ));
    }

    #[test]
    fn test_eval_against_bindings() {
        let count = Rc::new(Cell::new(7.0));
        let mut bindings = BindingRegister::new();
        let handle = Rc::clone(&count);
        bindings.register("A", Box::new(move || handle.get()));

        let expr = product(vec![
            Factor::multiply(Expression::number(0.5)),
            Factor::multiply(Expression::variable("A")),
        ]);
        assert_eq!(expr.eval(&bindings).unwrap(), 3.5);

        // The binding reflects the live value.
        count.set(10.0);
        assert_eq!(expr.eval(&bindings).unwrap(), 5.0);
    }

    #[test]
    fn test_rebinding_replaces() {
        let mut bindings = BindingRegister::new();
        bindings.register("x", Box::new(|| 1.0));
        bindings.register("x", Box::new(|| 2.0));
        assert_eq!(bindings.value_of("x"), Some(2.0));
    }

    #[test]
    fn test_clone_independence() {
        let original = sum(vec![
            Term::plus(Expression::variable("a")),
            Term::plus(Expression::number(1.0)),
        ]);
        let mut clone = original.clone();
        if let Expression::Sum(terms) = &mut clone {
            terms.push(Term::minus(Expression::number(5.0)));
        }
        if let Expression::Sum(terms) = &original {
            assert_eq!(terms.len(), 2);
        } else {
            panic!("original changed shape");
        }
    }

    #[test]
    fn test_simplify_folds_registered_variables() {
        let mut vars = VariableRegister::new();
        vars.define_constant("a", 3.0).unwrap();

        // 1 + a * 2, with a = 3, folds to 7
        let expr = sum(vec![
            Term::plus(Expression::number(1.0)),
            Term::plus(product(vec![
                Factor::multiply(Expression::variable("a")),
                Factor::multiply(Expression::number(2.0)),
            ])),
        ]);
        assert_eq!(expr.simplify(&vars).unwrap(), Expression::Number(7.0));
    }

    #[test]
    fn test_simplify_preserves_unknown_variables() {
        let mut vars = VariableRegister::new();
        vars.define_constant("k", 2.0).unwrap();

        // k * A with only k registered leaves A in place
        let expr = product(vec![
            Factor::multiply(Expression::variable("k")),
            Factor::multiply(Expression::variable("A")),
        ]);
        let simplified = expr.simplify(&vars).unwrap();
        let mut names = BTreeSet::new();
        simplified.variables(&mut names);
        assert!(names.contains("A"));
        assert!(!names.contains("k"));

        let mut env = HashMap::new();
        env.insert("A".to_string(), 5.0);
        assert_eq!(simplified.eval(&env).unwrap(), 10.0);
    }

    #[test]
    fn test_simplify_is_sound() {
        let mut vars = VariableRegister::new();
        vars.define_constant("x", -4.0).unwrap();
        vars.define_constant("y", 2.5).unwrap();

        let expr = Expression::Conditional {
            condition: Box::new(Expression::Compare {
                op: CompareOp::Greater,
                left: Box::new(Expression::variable("x")),
                right: Box::new(Expression::number(0.0)),
            }),
            if_true: Box::new(Expression::variable("x")),
            if_false: Box::new(Expression::Minus(Box::new(Expression::variable("x")))),
        };
        let simplified = expr.simplify(&vars).unwrap();
        assert_eq!(simplified, Expression::Number(4.0));
        assert_eq!(expr.eval(&vars).unwrap(), 4.0);

        let expr = Expression::Power {
            base: Box::new(Expression::variable("y")),
            exponent: Box::new(Expression::number(2.0)),
        };
        let simplified = expr.simplify(&vars).unwrap();
        let direct = expr.eval(&vars).unwrap();
        assert!((simplified.eval(&EmptyLookup).unwrap() - direct).abs() < 1e-12);
    }

    #[test]
    fn test_simplify_conditional_keeps_symbolic_condition() {
        let vars = VariableRegister::new();
        let expr = Expression::Conditional {
            condition: Box::new(Expression::variable("x")),
            if_true: Box::new(Expression::number(1.0)),
            if_false: Box::new(Expression::number(2.0)),
        };
        match expr.simplify(&vars).unwrap() {
            Expression::Conditional { .. } => {}
            other => panic!("expected conditional, got {:?}", other),
        }
    }

    #[test]
    fn test_simplify_substitutes_register_expressions() {
        let mut vars = VariableRegister::new();
        // b is registered as a late-bound expression over an unknown name
        vars.define(
            "b",
            sum(vec![
                Term::plus(Expression::variable("A")),
                Term::plus(Expression::number(1.0)),
            ]),
        )
        .unwrap();

        let expr = product(vec![
            Factor::multiply(Expression::number(2.0)),
            Factor::multiply(Expression::variable("b")),
        ]);
        let simplified = expr.simplify(&vars).unwrap();
        let mut env = HashMap::new();
        env.insert("A".to_string(), 4.0);
        assert_eq!(simplified.eval(&env).unwrap(), 10.0);
    }

    #[test]
    fn test_register_rejects_redefinition() {
        let mut vars = VariableRegister::new();
        vars.define_constant("k", 1.0).unwrap();
        assert!(matches!(
            vars.define_constant("k", 2.0),
            Err(CascadeError::RedefinedIdentifier(_))
        ));
    }

    #[test]
    fn test_print_cmdl() {
        let expr = sum(vec![
            Term::plus(Expression::variable("a")),
            Term::minus(product(vec![
                Factor::multiply(Expression::number(2.0)),
                Factor::multiply(Expression::variable("b")),
            ])),
        ]);
        assert_eq!(expr.to_string(), "a - (2 * b)");

        let cond = Expression::Conditional {
            condition: Box::new(Expression::Compare {
                op: CompareOp::GreaterEqual,
                left: Box::new(Expression::variable("x")),
                right: Box::new(Expression::number(0.0)),
            }),
            if_true: Box::new(Expression::variable("x")),
            if_false: Box::new(Expression::Minus(Box::new(Expression::variable("x")))),
        };
        assert_eq!(cond.to_string(), "(x >= 0) ? x : (-x)");
    }

    #[test]
    fn test_comparisons_produce_indicator_values() {
        let expr = Expression::Compare {
            op: CompareOp::Less,
            left: Box::new(Expression::number(1.0)),
            right: Box::new(Expression::number(2.0)),
        };
        assert_eq!(expr.eval(&EmptyLookup).unwrap(), 1.0);

        let expr = Expression::Not(Box::new(Expression::number(3.0)));
        assert_eq!(expr.eval(&EmptyLookup).unwrap(), 0.0);
    }
}
