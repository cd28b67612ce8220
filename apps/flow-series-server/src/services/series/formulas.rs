//! Derived metric definitions keyed by tag.
//!
//! The registry is filled once at startup (built-ins plus an optional formulas file) and
//! then shared read-only behind an `Arc`; there is no way to register after that point.

use anyhow::{Context, Result};
use evalexpr::{
    build_operator_tree, ContextWithMutableFunctions, ContextWithMutableVariables, EvalexprError,
    HashMapContext, Node, Value,
};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

pub const TAG_GVF: &str = "GVF";
pub const TAG_WLR: &str = "WLR";

pub const FIELD_GAS_FLOW_RATE: &str = "GFR";
pub const FIELD_OIL_FLOW_RATE: &str = "OFR";
pub const FIELD_WATER_FLOW_RATE: &str = "WFR";

const MAX_FIELD_NAME_LEN: usize = 64;
const MAX_EXPRESSION_LEN: usize = 4096;
const MAX_FORMULA_FIELDS: usize = 16;

/// Field names double as expression variables, so both must be plain identifiers.
pub fn is_valid_field_name(raw: &str) -> bool {
    if raw.is_empty() || raw.len() > MAX_FIELD_NAME_LEN {
        return false;
    }
    let mut chars = raw.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Clone)]
pub enum FormulaRule {
    /// `sum(numerator) / sum(denominator) * 100`, or 0 when the denominator is not positive.
    Ratio {
        numerator: Vec<String>,
        denominator: Vec<String>,
    },
    Expression(CompiledExpression),
}

#[derive(Debug, Clone)]
pub struct CompiledExpression {
    source: String,
    tree: Node,
    base_ctx: HashMapContext,
}

impl CompiledExpression {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub(crate) fn tree(&self) -> &Node {
        &self.tree
    }

    /// Fresh evaluation context with the helper functions registered.
    pub(crate) fn context(&self) -> HashMapContext {
        self.base_ctx.clone()
    }
}

#[derive(Debug, Clone)]
pub struct FormulaDefinition {
    tag: String,
    required_fields: Vec<String>,
    rule: FormulaRule,
}

impl FormulaDefinition {
    pub fn ratio(tag: &str, numerator: &[&str], denominator: &[&str]) -> Result<Self, String> {
        let numerator: Vec<String> = numerator.iter().map(|f| f.trim().to_string()).collect();
        let denominator: Vec<String> = denominator.iter().map(|f| f.trim().to_string()).collect();
        if denominator.is_empty() {
            return Err(format!("Formula {tag} needs at least one denominator field"));
        }
        let required_fields = collect_fields(tag, numerator.iter().chain(denominator.iter()))?;
        Ok(Self {
            tag: validate_tag(tag)?,
            required_fields,
            rule: FormulaRule::Ratio {
                numerator,
                denominator,
            },
        })
    }

    pub fn expression(tag: &str, fields: &[&str], expression: &str) -> Result<Self, String> {
        let tag = validate_tag(tag)?;
        let required_fields = collect_fields(&tag, fields.iter().copied())?;
        if required_fields.is_empty() {
            return Err(format!("Formula {tag} must use at least one field"));
        }
        let compiled = compile_expression(&tag, &required_fields, expression)?;
        Ok(Self {
            tag,
            required_fields,
            rule: FormulaRule::Expression(compiled),
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Raw fields the formula reads, sorted and deduplicated.
    pub fn required_fields(&self) -> &[String] {
        &self.required_fields
    }

    pub fn rule(&self) -> &FormulaRule {
        &self.rule
    }

    pub fn kind(&self) -> &'static str {
        match self.rule {
            FormulaRule::Ratio { .. } => "ratio",
            FormulaRule::Expression(_) => "expression",
        }
    }
}

fn validate_tag(tag: &str) -> Result<String, String> {
    let trimmed = tag.trim();
    if !is_valid_field_name(trimmed) {
        return Err(format!(
            "Formula tag \"{trimmed}\" is invalid (use letters/numbers/underscore; must start with a letter/underscore)"
        ));
    }
    Ok(trimmed.to_string())
}

fn collect_fields<I, S>(tag: &str, fields: I) -> Result<Vec<String>, String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: BTreeSet<String> = BTreeSet::new();
    for field in fields {
        let field = field.as_ref().trim();
        if !is_valid_field_name(field) {
            return Err(format!("Formula {tag} uses invalid field name \"{field}\""));
        }
        out.insert(field.to_string());
    }
    if out.len() > MAX_FORMULA_FIELDS {
        return Err(format!(
            "Formula {tag} uses too many fields (max {MAX_FORMULA_FIELDS})"
        ));
    }
    Ok(out.into_iter().collect())
}

fn numeric_args(args: &Value) -> Result<Vec<f64>, EvalexprError> {
    let to_float = |value: &Value| match value {
        Value::Float(v) => Ok(*v),
        Value::Int(v) => Ok(*v as f64),
        other => Err(EvalexprError::CustomMessage(format!(
            "Expected numeric value, got {other:?}"
        ))),
    };
    match args {
        Value::Tuple(items) => items.iter().map(to_float).collect(),
        other => Ok(vec![to_float(other)?]),
    }
}

fn register_function(
    ctx: &mut HashMapContext,
    name: &'static str,
    apply: fn(&[f64]) -> Option<f64>,
) -> Result<(), EvalexprError> {
    ctx.set_function(
        name.to_string(),
        evalexpr::Function::new(move |args| {
            let floats = numeric_args(args)?;
            apply(&floats).map(Value::from).ok_or_else(|| {
                EvalexprError::CustomMessage(format!("{name}() called with invalid arguments"))
            })
        }),
    )
}

fn register_helper_functions(ctx: &mut HashMapContext) -> Result<(), EvalexprError> {
    register_function(ctx, "min", |xs| xs.iter().copied().reduce(f64::min))?;
    register_function(ctx, "max", |xs| xs.iter().copied().reduce(f64::max))?;
    register_function(ctx, "sum", |xs| Some(xs.iter().sum()))?;
    register_function(ctx, "abs", |xs| match xs {
        [x] => Some(x.abs()),
        _ => None,
    })?;
    register_function(ctx, "clamp", |xs| match xs {
        [x, lo, hi] if lo <= hi => Some(x.max(*lo).min(*hi)),
        _ => None,
    })?;
    Ok(())
}

fn compile_expression(
    tag: &str,
    fields: &[String],
    expression: &str,
) -> Result<CompiledExpression, String> {
    let source = expression.trim();
    if source.is_empty() {
        return Err(format!("Formula {tag} has an empty expression"));
    }
    if source.len() > MAX_EXPRESSION_LEN {
        return Err(format!("Formula {tag} expression is too long"));
    }

    let mut ctx = HashMapContext::new();
    register_helper_functions(&mut ctx)
        .map_err(|err| format!("Formula {tag} function registry failed: {err}"))?;

    let tree =
        build_operator_tree(source).map_err(|err| format!("Formula {tag} is invalid: {err}"))?;

    // Probe with every field set to 1 so unknown identifiers and non-numeric results
    // surface at startup instead of silently evaluating to 0 per reading.
    let mut probe = ctx.clone();
    for field in fields {
        probe
            .set_value(field.clone(), Value::from(1.0))
            .map_err(|err| format!("Formula {tag} variable init failed: {err}"))?;
    }
    match tree.eval_with_context(&probe) {
        Ok(Value::Float(_)) | Ok(Value::Int(_)) => {}
        Ok(other) => {
            return Err(format!(
                "Formula {tag} must evaluate to a number, got {other:?}"
            ))
        }
        Err(err) => return Err(format!("Formula {tag} is invalid: {err}")),
    }

    Ok(CompiledExpression {
        source: source.to_string(),
        tree,
        base_ctx: ctx,
    })
}

#[derive(Debug, Deserialize)]
struct FormulaFile {
    #[serde(default)]
    formulas: Vec<FormulaFileEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum FormulaFileEntry {
    Ratio {
        tag: String,
        numerator: Vec<String>,
        denominator: Vec<String>,
    },
    Expression {
        tag: String,
        fields: Vec<String>,
        expression: String,
    },
}

impl FormulaFileEntry {
    fn into_definition(self) -> Result<FormulaDefinition, String> {
        match self {
            FormulaFileEntry::Ratio {
                tag,
                numerator,
                denominator,
            } => {
                let numerator: Vec<&str> = numerator.iter().map(String::as_str).collect();
                let denominator: Vec<&str> = denominator.iter().map(String::as_str).collect();
                FormulaDefinition::ratio(&tag, &numerator, &denominator)
            }
            FormulaFileEntry::Expression {
                tag,
                fields,
                expression,
            } => {
                let fields: Vec<&str> = fields.iter().map(String::as_str).collect();
                FormulaDefinition::expression(&tag, &fields, &expression)
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FormulaRegistry {
    formulas: HashMap<String, Arc<FormulaDefinition>>,
}

impl FormulaRegistry {
    /// Registry holding the GVF and WLR ratios.
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        let builtins = [
            FormulaDefinition::ratio(
                TAG_GVF,
                &[FIELD_GAS_FLOW_RATE],
                &[
                    FIELD_GAS_FLOW_RATE,
                    FIELD_OIL_FLOW_RATE,
                    FIELD_WATER_FLOW_RATE,
                ],
            ),
            FormulaDefinition::ratio(
                TAG_WLR,
                &[FIELD_WATER_FLOW_RATE],
                &[FIELD_WATER_FLOW_RATE, FIELD_OIL_FLOW_RATE],
            ),
        ];
        for definition in builtins {
            debug_assert!(
                definition.is_ok(),
                "built-in formula failed to build: {definition:?}"
            );
            match definition {
                Ok(definition) => {
                    registry
                        .formulas
                        .insert(definition.tag().to_string(), Arc::new(definition));
                }
                Err(err) => {
                    tracing::error!(error = %err, "built-in formula failed to build");
                }
            }
        }
        registry
    }

    /// Adds a definition. Tags are never replaced, including built-ins.
    pub fn register(&mut self, definition: FormulaDefinition) -> Result<(), String> {
        if self.formulas.contains_key(definition.tag()) {
            return Err(format!(
                "Formula {} is already registered",
                definition.tag()
            ));
        }
        self.formulas
            .insert(definition.tag().to_string(), Arc::new(definition));
        Ok(())
    }

    /// Registers every formula from a JSON formulas file; returns how many were added.
    pub fn load_file(&mut self, path: &Path) -> Result<usize> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read formulas file {}", path.display()))?;
        let file: FormulaFile = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse formulas file {}", path.display()))?;

        let mut added = 0;
        for entry in file.formulas {
            let definition = entry.into_definition().map_err(anyhow::Error::msg)?;
            let tag = definition.tag().to_string();
            self.register(definition).map_err(anyhow::Error::msg)?;
            tracing::info!(tag = %tag, path = %path.display(), "registered formula");
            added += 1;
        }
        Ok(added)
    }

    pub fn lookup(&self, tag: &str) -> Option<Arc<FormulaDefinition>> {
        self.formulas.get(tag).cloned()
    }

    pub fn len(&self) -> usize {
        self.formulas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formulas.is_empty()
    }

    /// All definitions, sorted by tag.
    pub fn definitions(&self) -> Vec<Arc<FormulaDefinition>> {
        let mut out: Vec<Arc<FormulaDefinition>> = self.formulas.values().cloned().collect();
        out.sort_by(|a, b| a.tag().cmp(b.tag()));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn builtins_are_registered() {
        let registry = FormulaRegistry::builtin();
        assert_eq!(registry.len(), 2);

        let gvf = registry.lookup(TAG_GVF).expect("gvf");
        assert_eq!(gvf.required_fields(), ["GFR", "OFR", "WFR"]);
        assert_eq!(gvf.kind(), "ratio");

        let wlr = registry.lookup(TAG_WLR).expect("wlr");
        assert_eq!(wlr.required_fields(), ["OFR", "WFR"]);

        assert!(registry.lookup("GFR").is_none());
        assert!(registry.lookup("gvf").is_none());
    }

    #[test]
    fn register_is_append_only() {
        let mut registry = FormulaRegistry::builtin();
        let clash = FormulaDefinition::ratio(TAG_GVF, &["OFR"], &["OFR"]).expect("definition");
        assert!(registry.register(clash).is_err());

        let oil_cut =
            FormulaDefinition::ratio("OIL_CUT", &["OFR"], &["OFR", "WFR"]).expect("definition");
        registry.register(oil_cut).expect("register");
        assert_eq!(registry.len(), 3);
        let tags: Vec<String> = registry
            .definitions()
            .iter()
            .map(|d| d.tag().to_string())
            .collect();
        assert_eq!(tags, ["GVF", "OIL_CUT", "WLR"]);
    }

    #[test]
    fn rejects_invalid_definitions() {
        assert!(FormulaDefinition::ratio("bad tag", &["GFR"], &["GFR"]).is_err());
        assert!(FormulaDefinition::ratio("X", &["GFR"], &[]).is_err());
        assert!(FormulaDefinition::ratio("X", &["1GFR"], &["GFR"]).is_err());
        assert!(FormulaDefinition::expression("X", &[], "1 + 1").is_err());
        assert!(FormulaDefinition::expression("X", &["OFR"], "OFR +").is_err());
        // Unknown identifier only shows up when evaluating.
        assert!(FormulaDefinition::expression("X", &["OFR"], "OFR + WFR").is_err());
        assert!(FormulaDefinition::expression("X", &["OFR"], "OFR > 1").is_err());
    }

    #[test]
    fn expression_formulas_compile_with_helpers() {
        let definition =
            FormulaDefinition::expression("LIQ", &["WFR", "OFR", "WFR"], "clamp(sum(OFR, WFR), 0, 1000)")
                .expect("compile");
        assert_eq!(definition.required_fields(), ["OFR", "WFR"]);
        assert_eq!(definition.kind(), "expression");
        match definition.rule() {
            FormulaRule::Expression(compiled) => {
                assert_eq!(compiled.source(), "clamp(sum(OFR, WFR), 0, 1000)")
            }
            other => panic!("unexpected rule {other:?}"),
        }
    }

    #[test]
    fn loads_formulas_file() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(
            file,
            "{}",
            serde_json::json!({
                "formulas": [
                    { "kind": "ratio", "tag": "OIL_CUT", "numerator": ["OFR"], "denominator": ["OFR", "WFR"] },
                    { "kind": "expression", "tag": "LIQ", "fields": ["OFR", "WFR"], "expression": "OFR + WFR" }
                ]
            })
        )?;

        let mut registry = FormulaRegistry::builtin();
        let added = registry.load_file(file.path())?;
        assert_eq!(added, 2);
        assert!(registry.lookup("OIL_CUT").is_some());
        assert_eq!(registry.lookup("LIQ").expect("liq").kind(), "expression");
        Ok(())
    }

    #[test]
    fn formulas_file_cannot_shadow_builtins() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(
            file,
            "{}",
            serde_json::json!({
                "formulas": [
                    { "kind": "expression", "tag": "WLR", "fields": ["WFR"], "expression": "WFR" }
                ]
            })
        )?;

        let mut registry = FormulaRegistry::builtin();
        assert!(registry.load_file(file.path()).is_err());
        Ok(())
    }

    #[test]
    fn field_name_pattern() {
        assert!(is_valid_field_name("GFR"));
        assert!(is_valid_field_name("_line_pressure2"));
        assert!(!is_valid_field_name(""));
        assert!(!is_valid_field_name("2GFR"));
        assert!(!is_valid_field_name("GFR; DROP TABLE"));
        assert!(!is_valid_field_name(&"a".repeat(65)));
    }
}
