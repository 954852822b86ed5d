//! # Cascade CMDL
//!
//! Parser for CMDL, the chemical-model description language.
//!
//! ## The Language
//!
//! A CMDL model is a sequence of `;`-terminated statements: variable
//! assignments and reactions.
//!
//! ```text
//! // parameters and initial amounts
//! k = 0.01;
//! M = 100;
//! D = 0;
//!
//! // reactions: reactants -> products, rate
//! 2 M -> D, k;
//! D -> 2 M, 0.1;
//!
//! // a late-bound rate in square brackets is re-evaluated against the
//! // live species counts at every propensity computation
//! M -> 0, [0.001 * M * D];
//! ```
//!
//! `name = expr;` evaluates the expression immediately and stores a
//! constant; `name = [expr];` stores the expression itself. A reaction
//! side is a `+`-separated list of species with optional positive integer
//! coefficients (`2 M` or `2*M`); the empty side is written `0`.
//!
//! ## Pipeline
//!
//! CMDL text -> token stream -> parse tree -> variable register plus
//! reaction definitions -> simulation. Parsing aborts on the first error;
//! no partially built model is ever observable.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use cascade_core::{CascadeError, Result};
use cascade_expr::{
    CompareOp, Expression, Factor, LogicalOp, Sign, Term, VariableRegister,
};
use cascade_sim::{PropensityReaction, RateLaw, Reactant, Simulation, State};
use pest::error::LineColLocation;
use pest::iterators::Pair;
use pest::Parser as _;
use pest_derive::Parser;
use serde::{Deserialize, Serialize};

/// Grammar recursion deeper than this aborts the parse.
const MAX_EXPRESSION_DEPTH: usize = 1000;

/// CMDL parser
#[derive(Parser)]
#[grammar_inline = r#"
WHITESPACE = _{ " " | "\t" | "\r" | "\n" }
COMMENT = _{ "//" ~ (!NEWLINE ~ ANY)* }

value = @{ ASCII_DIGIT+ ~ ("." ~ ASCII_DIGIT*)? ~ (("e" | "E") ~ ("+" | "-")? ~ ASCII_DIGIT+)? }
identifier = @{ (ASCII_ALPHA | "_") ~ (ASCII_ALPHANUMERIC | "_")* }

minus = { "-" }
bang = { "!" }
sum_op = { "+" | "-" }
product_op = { "*" | "/" }
compare_op = { "<=" | ">=" | "==" | "!=" | "<" | ">" }

primary = { value | identifier | "(" ~ expression ~ ")" }
power = { primary ~ ("^" ~ unary)? }
unary = { minus ~ unary | bang ~ unary | power }
product = { unary ~ (product_op ~ unary)* }
sum = { product ~ (sum_op ~ product)* }
comparison = { sum ~ (compare_op ~ sum)? }
conjunction = { comparison ~ ("&&" ~ comparison)* }
disjunction = { conjunction ~ ("||" ~ conjunction)* }
expression = { disjunction ~ ("?" ~ expression ~ ":" ~ expression)? }

delayed_expression = { "[" ~ expression ~ "]" }

empty_side = { "0" }
reactant = { (value ~ "*"?)? ~ identifier }
reaction_side = { empty_side | reactant ~ ("+" ~ reactant)* }

assignment = { identifier ~ "=" ~ (delayed_expression | expression) ~ ";" }
reaction = { reaction_side ~ "->" ~ reaction_side ~ "," ~ (delayed_expression | expression) ~ ";" }
statement = { assignment | reaction }

model = { SOI ~ statement* ~ EOI }
single_expression = { SOI ~ expression ~ EOI }
"#]
pub struct CmdlParser;

// =============================================================================
// PARSE TREE
// =============================================================================

/// How a reaction's rate was declared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RateDefinition {
    /// `lhs -> rhs, expr;` - the expression was evaluated at parse time
    /// and acts as a mass-action rate constant.
    Constant(f64),
    /// `lhs -> rhs, [expr];` - the expression is the propensity,
    /// re-evaluated against live counts at every computation.
    Expression(Expression),
}

/// One reaction statement: `(coefficient, species)` pairs per side plus
/// the rate definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionDefinition {
    pub reactants: Vec<(u64, String)>,
    pub products: Vec<(u64, String)>,
    pub rate: RateDefinition,
    /// Source line of the statement.
    pub line: usize,
}

fn write_side(f: &mut fmt::Formatter<'_>, side: &[(u64, String)]) -> fmt::Result {
    if side.is_empty() {
        return f.write_str("0");
    }
    for (i, (multiplicity, name)) in side.iter().enumerate() {
        if i > 0 {
            f.write_str(" + ")?;
        }
        if *multiplicity > 1 {
            write!(f, "{} ", multiplicity)?;
        }
        f.write_str(name)?;
    }
    Ok(())
}

impl fmt::Display for ReactionDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_side(f, &self.reactants)?;
        f.write_str(" -> ")?;
        write_side(f, &self.products)
    }
}

/// The result of parsing a CMDL model: the variable register built from
/// the assignments and the reaction statements in source order.
#[derive(Debug, Default)]
pub struct ParsedModel {
    pub variables: VariableRegister,
    pub reactions: Vec<ReactionDefinition>,
}

impl ParsedModel {
    /// The species of the model: every identifier appearing on a reaction
    /// side, in order of first appearance.
    pub fn species(&self) -> Vec<String> {
        let mut species = Vec::new();
        let mut seen = BTreeSet::new();
        for reaction in &self.reactions {
            for (_, name) in reaction.reactants.iter().chain(&reaction.products) {
                if seen.insert(name.clone()) {
                    species.push(name.clone());
                }
            }
        }
        species
    }
}

// =============================================================================
// LEXICAL PRE-SCAN
// =============================================================================

// Everything CMDL can contain outside comments.
fn lex_check(text: &str) -> Result<()> {
    for (i, line) in text.lines().enumerate() {
        let code = line.split("//").next().unwrap_or(line);
        for c in code.chars() {
            let recognized = c.is_ascii_alphanumeric()
                || c.is_ascii_whitespace()
                || "_+-*/()[]=,;<>!&|?:^.".contains(c);
            if !recognized {
                return Err(CascadeError::LexError {
                    line: i + 1,
                    found: c,
                });
            }
        }
    }
    Ok(())
}

fn syntax_error(error: pest::error::Error<Rule>) -> CascadeError {
    let line = match error.line_col {
        LineColLocation::Pos((line, _)) => line,
        LineColLocation::Span((line, _), _) => line,
    };
    CascadeError::SyntaxError {
        line,
        message: error.variant.message().to_string(),
    }
}

// =============================================================================
// EXPRESSION BUILDING
// =============================================================================

fn line_of(pair: &Pair<Rule>) -> usize {
    pair.as_span().start_pos().line_col().0
}

fn parse_number(pair: &Pair<Rule>) -> Result<f64> {
    pair.as_str()
        .parse::<f64>()
        .map_err(|_| CascadeError::SyntaxError {
            line: line_of(pair),
            message: format!("invalid numeric literal {}", pair.as_str()),
        })
}

fn compare_op(symbol: &str) -> CompareOp {
    match symbol {
        "==" => CompareOp::Equal,
        "!=" => CompareOp::NotEqual,
        "<" => CompareOp::Less,
        "<=" => CompareOp::LessEqual,
        ">" => CompareOp::Greater,
        ">=" => CompareOp::GreaterEqual,
        _ => unreachable!(),
    }
}

fn build_expression(pair: Pair<Rule>, depth: usize) -> Result<Expression> {
    if depth > MAX_EXPRESSION_DEPTH {
        return Err(CascadeError::StackOverflow);
    }
    Ok(match pair.as_rule() {
        Rule::expression => {
            let mut inner = pair.into_inner();
            let head = build_expression(inner.next().unwrap(), depth + 1)?;
            match inner.next() {
                None => head,
                Some(if_true) => Expression::Conditional {
                    condition: Box::new(head),
                    if_true: Box::new(build_expression(if_true, depth + 1)?),
                    if_false: Box::new(build_expression(inner.next().unwrap(), depth + 1)?),
                },
            }
        }
        Rule::disjunction | Rule::conjunction => {
            let op = if pair.as_rule() == Rule::disjunction {
                LogicalOp::Or
            } else {
                LogicalOp::And
            };
            let mut inner = pair.into_inner();
            let mut expr = build_expression(inner.next().unwrap(), depth + 1)?;
            for operand in inner {
                expr = Expression::Logical {
                    op,
                    left: Box::new(expr),
                    right: Box::new(build_expression(operand, depth + 1)?),
                };
            }
            expr
        }
        Rule::comparison => {
            let mut inner = pair.into_inner();
            let left = build_expression(inner.next().unwrap(), depth + 1)?;
            match inner.next() {
                None => left,
                Some(op) => Expression::Compare {
                    op: compare_op(op.as_str()),
                    left: Box::new(left),
                    right: Box::new(build_expression(inner.next().unwrap(), depth + 1)?),
                },
            }
        }
        Rule::sum => {
            let mut inner = pair.into_inner();
            let mut terms = vec![Term::plus(build_expression(inner.next().unwrap(), depth + 1)?)];
            while let Some(op) = inner.next() {
                let sign = if op.as_str() == "+" {
                    Sign::Plus
                } else {
                    Sign::Minus
                };
                terms.push(Term {
                    sign,
                    expr: build_expression(inner.next().unwrap(), depth + 1)?,
                });
            }
            if terms.len() == 1 {
                terms.remove(0).expr
            } else {
                Expression::Sum(terms)
            }
        }
        Rule::product => {
            let mut inner = pair.into_inner();
            let mut factors = vec![Factor::multiply(build_expression(
                inner.next().unwrap(),
                depth + 1,
            )?)];
            while let Some(op) = inner.next() {
                let inverse = op.as_str() == "/";
                factors.push(Factor {
                    inverse,
                    expr: build_expression(inner.next().unwrap(), depth + 1)?,
                });
            }
            if factors.len() == 1 {
                factors.remove(0).expr
            } else {
                Expression::Product(factors)
            }
        }
        Rule::unary => {
            let mut inner = pair.into_inner();
            let first = inner.next().unwrap();
            match first.as_rule() {
                Rule::minus => Expression::Minus(Box::new(build_expression(
                    inner.next().unwrap(),
                    depth + 1,
                )?)),
                Rule::bang => Expression::Not(Box::new(build_expression(
                    inner.next().unwrap(),
                    depth + 1,
                )?)),
                _ => build_expression(first, depth + 1)?,
            }
        }
        Rule::power => {
            let mut inner = pair.into_inner();
            let base = build_expression(inner.next().unwrap(), depth + 1)?;
            match inner.next() {
                None => base,
                Some(exponent) => Expression::Power {
                    base: Box::new(base),
                    exponent: Box::new(build_expression(exponent, depth + 1)?),
                },
            }
        }
        Rule::primary => {
            let inner = pair.into_inner().next().unwrap();
            match inner.as_rule() {
                Rule::value => Expression::Number(parse_number(&inner)?),
                Rule::identifier => Expression::Variable(inner.as_str().to_string()),
                Rule::expression => build_expression(inner, depth + 1)?,
                _ => unreachable!(),
            }
        }
        _ => unreachable!(),
    })
}

/// Simplifies against the register and demands a numeric result.
fn fold_to_number(expr: &Expression, vars: &VariableRegister) -> Result<f64> {
    match expr.simplify(vars)? {
        Expression::Number(value) => Ok(value),
        other => {
            let mut names = BTreeSet::new();
            other.variables(&mut names);
            Err(CascadeError::UnboundVariable(
                names.into_iter().next().unwrap_or_default(),
            ))
        }
    }
}

// =============================================================================
// STATEMENT PROCESSING
// =============================================================================

fn process_assignment(pair: Pair<Rule>, variables: &mut VariableRegister) -> Result<()> {
    let mut inner = pair.into_inner();
    let name = inner.next().unwrap().as_str().to_string();
    let value_pair = inner.next().unwrap();
    match value_pair.as_rule() {
        Rule::delayed_expression => {
            let expr = build_expression(value_pair.into_inner().next().unwrap(), 0)?;
            variables.define(&name, expr)?;
        }
        Rule::expression => {
            let expr = build_expression(value_pair, 0)?;
            let value = fold_to_number(&expr, variables)?;
            variables.define_constant(&name, value)?;
        }
        _ => unreachable!(),
    }
    Ok(())
}

fn build_side(pair: Pair<Rule>) -> Result<Vec<(u64, String)>> {
    let mut entries = Vec::new();
    for part in pair.into_inner() {
        match part.as_rule() {
            Rule::empty_side => {}
            Rule::reactant => {
                let line = line_of(&part);
                let mut inner = part.into_inner();
                let first = inner.next().unwrap();
                let entry = match first.as_rule() {
                    Rule::value => {
                        let raw = parse_number(&first)?;
                        if raw <= 0.0 || raw.fract() != 0.0 {
                            return Err(CascadeError::SemanticError(format!(
                                "stoichiometric coefficient must be a positive integer, got {} in line {}",
                                raw, line
                            )));
                        }
                        (raw as u64, inner.next().unwrap().as_str().to_string())
                    }
                    Rule::identifier => (1, first.as_str().to_string()),
                    _ => unreachable!(),
                };
                entries.push(entry);
            }
            _ => unreachable!(),
        }
    }
    Ok(entries)
}

fn process_reaction(pair: Pair<Rule>, variables: &VariableRegister) -> Result<ReactionDefinition> {
    let line = line_of(&pair);
    let mut inner = pair.into_inner();
    let reactants = build_side(inner.next().unwrap())?;
    let products = build_side(inner.next().unwrap())?;
    let rate_pair = inner.next().unwrap();
    let rate = match rate_pair.as_rule() {
        Rule::delayed_expression => RateDefinition::Expression(build_expression(
            rate_pair.into_inner().next().unwrap(),
            0,
        )?),
        Rule::expression => {
            RateDefinition::Constant(fold_to_number(&build_expression(rate_pair, 0)?, variables)?)
        }
        _ => unreachable!(),
    };
    Ok(ReactionDefinition {
        reactants,
        products,
        rate,
        line,
    })
}

// =============================================================================
// PUBLIC ENTRY POINTS
// =============================================================================

/// Parses a complete CMDL model into its parse tree.
pub fn parse_model(text: &str) -> Result<ParsedModel> {
    lex_check(text)?;
    let mut pairs = CmdlParser::parse(Rule::model, text).map_err(syntax_error)?;
    let model_pair = pairs.next().unwrap();

    let mut variables = VariableRegister::new();
    let mut reactions = Vec::new();
    for statement in model_pair.into_inner() {
        match statement.as_rule() {
            Rule::statement => {
                let inner = statement.into_inner().next().unwrap();
                match inner.as_rule() {
                    Rule::assignment => process_assignment(inner, &mut variables)?,
                    Rule::reaction => reactions.push(process_reaction(inner, &variables)?),
                    _ => unreachable!(),
                }
            }
            Rule::EOI => {}
            _ => unreachable!(),
        }
    }
    Ok(ParsedModel {
        variables,
        reactions,
    })
}

/// Parses a single CMDL expression.
pub fn parse_expression(text: &str) -> Result<Expression> {
    lex_check(text)?;
    let mut pairs = CmdlParser::parse(Rule::single_expression, text).map_err(syntax_error)?;
    let expression = pairs.next().unwrap().into_inner().next().unwrap();
    build_expression(expression, 0)
}

/// Materializes a parse tree into a ready-to-run [`Simulation`].
///
/// Species are created in order of first appearance on a reaction side;
/// the initial amount of a species is its register constant (a
/// non-negative integer) or zero. Variables that are not species fold
/// into the rates; a late-bound rate may only reference species beyond
/// that.
pub fn instantiate(model: &ParsedModel) -> Result<Simulation> {
    let species = model.species();
    let species_set: BTreeSet<String> = species.iter().cloned().collect();

    let mut simulation = Simulation::new();
    let mut keys = HashMap::new();
    for name in &species {
        let initial = match model.variables.lookup(name) {
            Some(Expression::Number(value)) => {
                if *value < 0.0 || value.fract() != 0.0 {
                    return Err(CascadeError::SemanticError(format!(
                        "species {} requires a non-negative integer initial amount, got {}",
                        name, value
                    )));
                }
                *value as u64
            }
            Some(_) => {
                return Err(CascadeError::SemanticError(format!(
                    "species {} is defined as an expression; species need numeric initial amounts",
                    name
                )))
            }
            None => 0,
        };
        let key = simulation.add_state(State::new_simple(name, initial))?;
        keys.insert(name.clone(), key);
    }

    let parameters = model.variables.without(&species_set);
    for definition in &model.reactions {
        let rate = match &definition.rate {
            RateDefinition::Constant(k) => RateLaw::MassAction(*k),
            RateDefinition::Expression(expr) => {
                let folded = expr.simplify(&parameters)?;
                let mut names = BTreeSet::new();
                folded.variables(&mut names);
                if let Some(unknown) = names.difference(&species_set).next() {
                    return Err(CascadeError::UnboundVariable(unknown.clone()));
                }
                RateLaw::Expression(folded)
            }
        };

        let mut reaction = PropensityReaction::new(&definition.to_string(), rate);
        for (multiplicity, name) in &definition.reactants {
            reaction.add_reactant(Reactant::new(keys[name], *multiplicity));
        }
        for (multiplicity, name) in &definition.products {
            reaction.add_product(Reactant::new(keys[name], *multiplicity));
        }
        simulation.add_reaction(reaction);
    }
    Ok(simulation)
}

/// Parses CMDL text and materializes it in one step.
pub fn compile(text: &str) -> Result<Simulation> {
    let model = parse_model(text)?;
    instantiate(&model)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_expr::EmptyLookup;

    #[test]
    fn test_precedence() {
        // 1 + 2 * 3 - 4 / 2 == 5
        let model = parse_model("k = 1 + 2 * 3 - 4 / 2 ;").unwrap();
        assert_eq!(model.variables.constant("k"), Some(5.0));
    }

    #[test]
    fn test_late_bound_assignment_keeps_expression() {
        let model = parse_model("k = [1 + a*2];").unwrap();
        let expr = model.variables.lookup("k").unwrap();
        let mut env = HashMap::new();
        env.insert("a".to_string(), 3.0);
        assert_eq!(expr.eval(&env).unwrap(), 7.0);
    }

    #[test]
    fn test_conditional_expression() {
        let expr = parse_expression("x > 0 ? x : -x").unwrap();

        let mut vars = VariableRegister::new();
        vars.define_constant("x", -4.0).unwrap();
        assert_eq!(expr.simplify(&vars).unwrap(), Expression::Number(4.0));

        let mut vars = VariableRegister::new();
        vars.define_constant("x", 3.0).unwrap();
        assert_eq!(expr.simplify(&vars).unwrap(), Expression::Number(3.0));
    }

    #[test]
    fn test_expression_round_trip() {
        let sources = [
            "1 + 2 * 3",
            "a - (2 * b)",
            "k * A / (1 + A)",
            "x > 0 ? x : -x",
            "2 ^ n",
            "!(a && b) || c",
            "(a + b) * (c - d)",
        ];
        for source in sources {
            let parsed = parse_expression(source).unwrap();
            let printed = parsed.to_string();
            let reparsed = parse_expression(&printed).unwrap();
            assert_eq!(parsed, reparsed, "round trip failed for {}", source);
        }
    }

    #[test]
    fn test_numeric_literals() {
        assert_eq!(
            parse_expression("2.5e3").unwrap().eval(&EmptyLookup).unwrap(),
            2500.0
        );
        assert_eq!(
            parse_expression("1e-2").unwrap().eval(&EmptyLookup).unwrap(),
            0.01
        );
    }

    #[test]
    fn test_redefined_identifier() {
        assert!(matches!(
            parse_model("k = 1; k = 2;"),
            Err(CascadeError::RedefinedIdentifier(_))
        ));
    }

    #[test]
    fn test_missing_product_is_a_syntax_error() {
        match parse_model("A -> , 0.1 ;") {
            Err(CascadeError::SyntaxError { line, .. }) => assert_eq!(line, 1),
            other => panic!("expected syntax error, got {:?}", other),
        }
    }

    #[test]
    fn test_lex_error_reports_line() {
        match parse_model("k = 1;\nj = 2 $ 3;") {
            Err(CascadeError::LexError { line, found }) => {
                assert_eq!(line, 2);
                assert_eq!(found, '$');
            }
            other => panic!("expected lex error, got {:?}", other),
        }
    }

    #[test]
    fn test_comments_are_ignored() {
        let model = parse_model("// a parameter\nk = 2; // trailing\n").unwrap();
        assert_eq!(model.variables.constant("k"), Some(2.0));
    }

    #[test]
    fn test_deep_nesting_overflows() {
        let mut text = String::from("k = ");
        for _ in 0..150 {
            text.push('(');
        }
        text.push('1');
        for _ in 0..150 {
            text.push(')');
        }
        text.push(';');
        assert!(matches!(
            parse_model(&text),
            Err(CascadeError::StackOverflow)
        ));
    }

    #[test]
    fn test_unbound_variable_in_immediate_rate() {
        assert!(matches!(
            parse_model("A -> 0, missing * 2;"),
            Err(CascadeError::UnboundVariable(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_reaction_sides() {
        let model = parse_model("A = 10; B = 5;\n2 A + B -> C, 1.0;\n0 -> A, 0.5;\nC -> 0, 2;").unwrap();
        assert_eq!(model.reactions.len(), 3);

        let first = &model.reactions[0];
        assert_eq!(first.reactants, vec![(2, "A".to_string()), (1, "B".to_string())]);
        assert_eq!(first.products, vec![(1, "C".to_string())]);
        assert_eq!(first.to_string(), "2 A + B -> C");

        let birth = &model.reactions[1];
        assert!(birth.reactants.is_empty());
        assert_eq!(birth.to_string(), "0 -> A");

        let death = &model.reactions[2];
        assert!(death.products.is_empty());
        assert_eq!(death.to_string(), "C -> 0");
    }

    #[test]
    fn test_star_coefficient_form() {
        let model = parse_model("2*M -> D, 0.01;").unwrap();
        assert_eq!(model.reactions[0].reactants, vec![(2, "M".to_string())]);
    }

    #[test]
    fn test_fractional_coefficient_is_rejected() {
        assert!(matches!(
            parse_model("1.5 A -> B, 1;"),
            Err(CascadeError::SemanticError(_))
        ));
    }

    #[test]
    fn test_compile_decay_model() {
        let sim = compile("k = 0.1;\nA = 1000;\nA -> 0, k;").unwrap();
        let a = sim.state_key("A").unwrap();
        assert_eq!(sim.states().get(a).initial_condition(), 1000);
        assert_eq!(sim.propensity_reactions().len(), 1);
        let reaction = &sim.propensity_reactions()[0];
        assert_eq!(reaction.name(), "A -> 0");
        assert_eq!(reaction.rate(), &RateLaw::MassAction(0.1));
    }

    #[test]
    fn test_compile_immediate_rate_folds_parameters() {
        let sim = compile("k = 2; j = 3;\nA -> 0, k * j;").unwrap();
        assert_eq!(
            sim.propensity_reactions()[0].rate(),
            &RateLaw::MassAction(6.0)
        );
    }

    #[test]
    fn test_compile_late_bound_rate_keeps_species_live() {
        let sim = compile("k = 0.5;\nA = 10;\nA -> 0, [k * A];").unwrap();
        match sim.propensity_reactions()[0].rate() {
            RateLaw::Expression(expr) => {
                // k folded, A survives as a live species reference
                let mut names = BTreeSet::new();
                expr.variables(&mut names);
                assert!(names.contains("A"));
                assert!(!names.contains("k"));
            }
            other => panic!("expected expression rate, got {:?}", other),
        }
    }

    #[test]
    fn test_compile_rejects_unknown_name_in_late_bound_rate() {
        assert!(matches!(
            compile("A -> 0, [k2 * A];"),
            Err(CascadeError::UnboundVariable(name)) if name == "k2"
        ));
    }

    #[test]
    fn test_compile_rejects_expression_species() {
        assert!(matches!(
            compile("A = [1 + 1];\nA -> 0, 1;"),
            Err(CascadeError::SemanticError(_))
        ));
    }

    #[test]
    fn test_compile_rejects_fractional_initial_amount() {
        assert!(matches!(
            compile("A = 1.5;\nA -> 0, 1;"),
            Err(CascadeError::SemanticError(_))
        ));
    }

    #[test]
    fn test_unassigned_species_starts_at_zero() {
        let sim = compile("0 -> A, 1.0;").unwrap();
        let a = sim.state_key("A").unwrap();
        assert_eq!(sim.states().get(a).initial_condition(), 0);
    }

    #[test]
    fn test_compiled_model_runs_and_conserves() {
        let mut sim = compile(
            "M = 100;\nD = 0;\n2 M -> D, 0.01;\nD -> 2 M, 0.1;",
        )
        .unwrap();
        sim.reseed(17);

        let m = sim.state_key("M").unwrap();
        let d = sim.state_key("D").unwrap();
        let mut recorder = cascade_sim::MemoryLogger::new();
        recorder.add_state(m);
        recorder.add_state(d);
        let records = recorder.records();
        sim.logger_mut().add_task(Box::new(recorder));
        sim.logger_mut().set_log_period(5.0).unwrap();

        sim.run(50.0).unwrap();

        let series = records.snapshot();
        for i in 0..series[0].len() {
            assert_eq!(series[0].values[i] + 2.0 * series[1].values[i], 100.0);
        }
    }
}
