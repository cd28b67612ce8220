use evalexpr::{ContextWithMutableVariables, HashMapContext, Value};

use super::formulas::{CompiledExpression, FormulaDefinition, FormulaRule};
use super::resolver::ResolvedField;
use super::types::{FieldValues, Reading, ResultPoint};

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Missing fields count as zero inside formulas.
fn field_or_zero(fields: &FieldValues, name: &str) -> f64 {
    fields.get(name).copied().map(finite_or_zero).unwrap_or(0.0)
}

fn sum_fields(fields: &FieldValues, names: &[String]) -> f64 {
    names.iter().map(|name| field_or_zero(fields, name)).sum()
}

fn percent_of(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        finite_or_zero(numerator / denominator * 100.0)
    } else {
        0.0
    }
}

/// Evaluates a formula against one reading. Never fails: absent inputs are zero and any
/// non-finite or failed evaluation yields 0.
pub fn evaluate(formula: &FormulaDefinition, fields: &FieldValues) -> f64 {
    FormulaEvaluator::new(formula).evaluate(fields)
}

/// Per-series evaluator; reuses the expression context across readings.
pub struct FormulaEvaluator<'a> {
    formula: &'a FormulaDefinition,
    ctx: Option<HashMapContext>,
}

impl<'a> FormulaEvaluator<'a> {
    pub fn new(formula: &'a FormulaDefinition) -> Self {
        Self { formula, ctx: None }
    }

    pub fn evaluate(&mut self, fields: &FieldValues) -> f64 {
        match self.formula.rule() {
            FormulaRule::Ratio {
                numerator,
                denominator,
            } => percent_of(sum_fields(fields, numerator), sum_fields(fields, denominator)),
            FormulaRule::Expression(compiled) => {
                let ctx = self.ctx.get_or_insert_with(|| compiled.context());
                eval_expression(
                    self.formula.tag(),
                    compiled,
                    ctx,
                    self.formula.required_fields(),
                    fields,
                )
            }
        }
    }
}

fn eval_expression(
    tag: &str,
    compiled: &CompiledExpression,
    ctx: &mut HashMapContext,
    required: &[String],
    fields: &FieldValues,
) -> f64 {
    for name in required {
        if let Err(err) = ctx.set_value(name.clone(), Value::from(field_or_zero(fields, name))) {
            tracing::debug!(formula = %tag, field = %name, error = %err, "formula variable rejected");
            return 0.0;
        }
    }
    match compiled.tree().eval_with_context(ctx) {
        Ok(Value::Float(v)) => finite_or_zero(v),
        Ok(Value::Int(v)) => v as f64,
        Ok(other) => {
            tracing::debug!(formula = %tag, value = ?other, "formula produced a non-numeric value");
            0.0
        }
        Err(err) => {
            tracing::debug!(formula = %tag, error = %err, "formula evaluation failed");
            0.0
        }
    }
}

/// Raw fields keep absence: a reading without the field yields no point.
pub fn raw_value(fields: &FieldValues, name: &str) -> Option<f64> {
    fields.get(name).copied().filter(|value| value.is_finite())
}

/// Turns ordered readings into result points for one resolved variable.
pub fn series_points(field: &ResolvedField, readings: &[Reading]) -> Vec<ResultPoint> {
    match field {
        ResolvedField::Raw(name) => readings
            .iter()
            .filter_map(|reading| {
                raw_value(&reading.fields, name).map(|value| ResultPoint {
                    timestamp: reading.timestamp,
                    serial_number: reading.serial_number.clone(),
                    value,
                })
            })
            .collect(),
        ResolvedField::Computed(formula) => {
            let mut evaluator = FormulaEvaluator::new(formula);
            readings
                .iter()
                .map(|reading| ResultPoint {
                    timestamp: reading.timestamp,
                    serial_number: reading.serial_number.clone(),
                    value: evaluator.evaluate(&reading.fields),
                })
                .collect()
        }
    }
}
