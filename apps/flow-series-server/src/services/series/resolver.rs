use std::collections::HashSet;
use std::sync::Arc;

use super::formulas::{is_valid_field_name, FormulaDefinition, FormulaRegistry};
use crate::error::SeriesError;

#[derive(Debug, Clone)]
pub enum ResolvedField {
    Raw(String),
    Computed(Arc<FormulaDefinition>),
}

impl ResolvedField {
    /// Fields used for the presence filter when fetching.
    pub fn required_fields(&self) -> Vec<String> {
        match self {
            ResolvedField::Raw(name) => vec![name.clone()],
            ResolvedField::Computed(formula) => formula.required_fields().to_vec(),
        }
    }

    pub fn is_computed(&self) -> bool {
        matches!(self, ResolvedField::Computed(_))
    }
}

/// Classifies variable tags. Registered formula tags always win over raw field names.
#[derive(Debug, Clone, Copy)]
pub struct FieldResolver<'a> {
    formulas: &'a FormulaRegistry,
    raw_fields: Option<&'a HashSet<String>>,
}

impl<'a> FieldResolver<'a> {
    pub fn new(formulas: &'a FormulaRegistry, raw_fields: Option<&'a HashSet<String>>) -> Self {
        Self {
            formulas,
            raw_fields,
        }
    }

    pub fn resolve(&self, variable_tag: &str) -> Result<ResolvedField, SeriesError> {
        let tag = variable_tag.trim();
        if let Some(formula) = self.formulas.lookup(tag) {
            return Ok(ResolvedField::Computed(formula));
        }

        if !is_valid_field_name(tag) {
            return Err(SeriesError::validation(format!(
                "Unknown variableTag \"{tag}\": not a registered formula or a valid field name"
            )));
        }
        if let Some(allowed) = self.raw_fields {
            if !allowed.contains(tag) {
                return Err(SeriesError::validation(format!(
                    "Unknown variableTag \"{tag}\": not a registered formula or known raw field"
                )));
            }
        }
        Ok(ResolvedField::Raw(tag.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formula_tags_resolve_as_computed() {
        let registry = FormulaRegistry::builtin();
        let resolver = FieldResolver::new(&registry, None);

        let gvf = resolver.resolve("GVF").expect("gvf");
        assert!(gvf.is_computed());
        assert_eq!(gvf.required_fields(), ["GFR", "OFR", "WFR"]);

        let trimmed = resolver.resolve("  WLR ").expect("wlr");
        assert!(trimmed.is_computed());
    }

    #[test]
    fn other_tags_resolve_as_raw_fields() {
        let registry = FormulaRegistry::builtin();
        let resolver = FieldResolver::new(&registry, None);

        match resolver.resolve("GFR").expect("raw") {
            ResolvedField::Raw(name) => assert_eq!(name, "GFR"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            resolver.resolve("line_pressure").expect("raw").required_fields(),
            ["line_pressure"]
        );
    }

    #[test]
    fn formulas_take_precedence_over_raw_fields() {
        let registry = FormulaRegistry::builtin();
        let allow: HashSet<String> = ["GVF", "GFR"].iter().map(|s| s.to_string()).collect();
        let resolver = FieldResolver::new(&registry, Some(&allow));
        assert!(resolver.resolve("GVF").expect("gvf").is_computed());
    }

    #[test]
    fn unknown_tags_are_validation_errors() {
        let registry = FormulaRegistry::builtin();
        let resolver = FieldResolver::new(&registry, None);
        for tag in ["", "   ", "9lives", "GFR OR 1=1", "gfr-rate"] {
            assert!(
                matches!(resolver.resolve(tag), Err(SeriesError::Validation(_))),
                "expected validation error for {tag:?}"
            );
        }

        let allow: HashSet<String> = ["GFR", "OFR", "WFR"].iter().map(|s| s.to_string()).collect();
        let strict = FieldResolver::new(&registry, Some(&allow));
        assert!(strict.resolve("WFR").is_ok());
        assert!(matches!(
            strict.resolve("XYZ"),
            Err(SeriesError::Validation(_))
        ));
    }
}
