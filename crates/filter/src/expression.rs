//! Expression evaluation over reading data-points.
//!
//! A trigger or untrigger expression is compiled once against a sample
//! reading, which fixes the variable set: every numeric data-point name is
//! registered twice, bare and asset-qualified (`asset.name`), up to a
//! capacity of [`MAX_EXPRESSION_VARIABLES`] slots. Evaluation overwrites
//! the slots matched by the current reading and computes the expression
//! with C-style truthiness (zero is false, anything else is true).
//!
//! Variables not present in the current reading keep the value they were
//! last bound with. All variables are bound as floats; equality against
//! integer literals is strict in `evalexpr`, so expressions should compare
//! with float literals (`mode == 1.0`).

use evalexpr::{build_operator_tree, ContextWithMutableVariables, HashMapContext, Node, Value};
use tracing::warn;

use taper_core::{Reading, Result, TaperError};

/// Maximum number of variable slots an evaluator will bind.
pub const MAX_EXPRESSION_VARIABLES: usize = 20;

/// A compiled boolean/arithmetic expression plus its variable bindings.
#[derive(Debug)]
pub struct Evaluator {
    node: Node,
    /// Registered (name, current value) slots, in registration order.
    variables: Vec<(String, f64)>,
}

impl Evaluator {
    /// Compile `expression` against the variable set discovered from
    /// `sample`.
    ///
    /// Syntax errors, unknown identifiers, and expressions that cannot
    /// evaluate over numeric variables are fatal: the filter must never
    /// fall back to an always-true or always-false trigger.
    pub fn compile(expression: &str, sample: &Reading) -> Result<Self> {
        let mut variables: Vec<(String, f64)> = Vec::new();
        for dp in &sample.datapoints {
            if dp.value.as_number().is_none() {
                continue;
            }
            variables.push((dp.name.clone(), 0.0));
            variables.push((format!("{}.{}", sample.asset, dp.name), 0.0));
            if variables.len() >= MAX_EXPRESSION_VARIABLES {
                warn!(
                    asset = %sample.asset,
                    datapoints = sample.datapoints.len(),
                    "too many datapoints in reading; remaining variables will not be bound"
                );
                variables.truncate(MAX_EXPRESSION_VARIABLES);
                break;
            }
        }

        let node = build_operator_tree(expression).map_err(|e| TaperError::Expression {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;

        let evaluator = Self {
            node,
            variables,
        };

        let context = evaluator.context();
        for identifier in evaluator.node.iter_variable_identifiers() {
            if !evaluator.is_bound(identifier) {
                return Err(TaperError::Expression {
                    expression: expression.to_string(),
                    reason: format!("unknown variable `{}`", identifier),
                });
            }
        }
        match evaluator.node.eval_with_context(&context) {
            Ok(Value::Boolean(_)) | Ok(Value::Int(_)) | Ok(Value::Float(_)) => Ok(evaluator),
            Ok(other) => Err(TaperError::Expression {
                expression: expression.to_string(),
                reason: format!("expression yields {:?}, not a numeric or boolean value", other),
            }),
            Err(e) => Err(TaperError::Expression {
                expression: expression.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Bind the reading's numeric data-points into matching slots and
    /// evaluate.
    ///
    /// An evaluation failure cannot occur for an expression that passed
    /// [`compile`](Self::compile); if one does it is logged and counts as
    /// false.
    pub fn evaluate(&mut self, reading: &Reading) -> bool {
        for dp in &reading.datapoints {
            let value = match dp.value.as_number() {
                Some(v) => v,
                None => continue,
            };
            let qualified = format!("{}.{}", reading.asset, dp.name);
            for (name, slot) in &mut self.variables {
                if *name == dp.name || *name == qualified {
                    *slot = value;
                }
            }
        }

        match self.node.eval_with_context(&self.context()) {
            Ok(value) => truthy(&value),
            Err(e) => {
                warn!(error = %e, "expression evaluation failed; treating as false");
                false
            }
        }
    }

    /// Names this evaluator has bound, in registration order.
    pub fn bound_variables(&self) -> impl Iterator<Item = &str> + '_ {
        self.variables.iter().map(|(name, _)| name.as_str())
    }

    fn is_bound(&self, identifier: &str) -> bool {
        identifier == "pi"
            || identifier == "e"
            || self.variables.iter().any(|(name, _)| name == identifier)
    }

    /// Materialize the slot values plus built-in constants as an
    /// evaluation context.
    fn context(&self) -> HashMapContext {
        let mut context = HashMapContext::new();
        for (name, value) in &self.variables {
            let _ = context.set_value(name.clone(), Value::Float(*value));
        }
        let _ = context.set_value("pi".to_string(), Value::Float(std::f64::consts::PI));
        let _ = context.set_value("e".to_string(), Value::Float(std::f64::consts::E));
        context
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Boolean(b) => *b,
        Value::Int(i) => *i != 0,
        Value::Float(f) => *f != 0.0,
        _ => false,
    }
}
