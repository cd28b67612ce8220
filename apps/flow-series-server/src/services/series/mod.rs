//! Raw and derived flow metric series for dashboard widgets.
//!
//! A request is validated and every variable tag resolved before any I/O. The hierarchy
//! selector is expanded once per request; each variable then fetches, evaluates and
//! assembles independently and concurrently. A variable whose fetch fails is reported
//! with an error marker while the rest of the response is still returned.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub mod assembler;
pub mod evaluator;
pub mod fetcher;
pub mod formulas;
pub mod hierarchy;
pub mod resolver;
pub mod store;
pub mod types;

use crate::error::SeriesError;
use crate::time::resolve_time_range;
use assembler::VariableOutcome;
use formulas::FormulaRegistry;
use resolver::{FieldResolver, ResolvedField};
use store::{DeviceDirectory, ReadingStore};
use types::{
    DeviceFilter, ReadingQuery, RequestScope, SeriesRequest, SeriesResponse, TimeRange,
    VariableRequest,
};

#[derive(Debug, Clone)]
pub struct QueryLimits {
    pub max_limit: usize,
    pub max_variables: usize,
    pub max_window: ChronoDuration,
    pub timeout: Duration,
    /// Allowlist of raw field names; `None` accepts any identifier.
    pub raw_fields: Option<HashSet<String>>,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            max_limit: 100_000,
            max_variables: 32,
            max_window: ChronoDuration::hours(24 * 365),
            timeout: Duration::from_secs(30),
            raw_fields: None,
        }
    }
}

/// A validated request: every variable resolved, window and limit fixed.
#[derive(Debug, Clone)]
struct QueryPlan {
    variables: Vec<(VariableRequest, ResolvedField)>,
    hierarchy_id: Option<String>,
    range: TimeRange,
    limit: usize,
}

#[derive(Clone)]
pub struct SeriesEngine {
    formulas: Arc<FormulaRegistry>,
    directory: Arc<dyn DeviceDirectory>,
    readings: Arc<dyn ReadingStore>,
    limits: QueryLimits,
}

impl SeriesEngine {
    pub fn new(
        formulas: Arc<FormulaRegistry>,
        directory: Arc<dyn DeviceDirectory>,
        readings: Arc<dyn ReadingStore>,
        limits: QueryLimits,
    ) -> Self {
        Self {
            formulas,
            directory,
            readings,
            limits,
        }
    }

    pub fn formulas(&self) -> &FormulaRegistry {
        &self.formulas
    }

    pub async fn query(
        &self,
        scope: &RequestScope,
        request: &SeriesRequest,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<SeriesResponse, SeriesError> {
        let plan = match self.plan(request, now) {
            Ok(plan) => plan,
            Err(err) => {
                tracing::debug!(widget_id = %request.widget_id, error = %err, "rejected series request");
                return Err(err);
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SeriesError::Cancelled),
            result = tokio::time::timeout(self.limits.timeout, self.execute(scope, &plan)) => {
                match result {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!(
                            widget_id = %request.widget_id,
                            timeout_ms = self.limits.timeout.as_millis() as u64,
                            "series request timed out"
                        );
                        Err(SeriesError::TimedOut)
                    }
                }
            }
        }
    }

    fn plan(&self, request: &SeriesRequest, now: DateTime<Utc>) -> Result<QueryPlan, SeriesError> {
        if request.variables.is_empty() {
            return Err(SeriesError::validation("At least one variable is required"));
        }
        if request.variables.len() > self.limits.max_variables {
            return Err(SeriesError::validation(format!(
                "Too many variables (max {})",
                self.limits.max_variables
            )));
        }
        if request.limit <= 0 {
            return Err(SeriesError::validation("limit must be a positive integer"));
        }
        let limit = usize::try_from(request.limit).unwrap_or(usize::MAX);
        if limit > self.limits.max_limit {
            return Err(SeriesError::validation(format!(
                "limit too large (max {})",
                self.limits.max_limit
            )));
        }

        let range = resolve_time_range(&request.time_range, now, self.limits.max_window)?;

        let resolver = FieldResolver::new(&self.formulas, self.limits.raw_fields.as_ref());
        let mut seen_names: HashSet<&str> = HashSet::new();
        let mut variables = Vec::with_capacity(request.variables.len());
        for variable in &request.variables {
            // Trimmed only for checks; the result key is the name as sent.
            let name = variable.variable_name.trim();
            if name.is_empty() {
                return Err(SeriesError::validation("variableName cannot be empty"));
            }
            if !seen_names.insert(name) {
                return Err(SeriesError::validation(format!(
                    "Duplicate variableName \"{name}\""
                )));
            }
            let field = resolver.resolve(&variable.variable_tag)?;
            variables.push((
                VariableRequest {
                    variable_name: variable.variable_name.clone(),
                    variable_tag: variable.variable_tag.trim().to_string(),
                    unit: variable.unit.clone(),
                },
                field,
            ));
        }

        Ok(QueryPlan {
            variables,
            hierarchy_id: request.hierarchy_id.clone(),
            range,
            limit,
        })
    }

    async fn execute(
        &self,
        scope: &RequestScope,
        plan: &QueryPlan,
    ) -> Result<SeriesResponse, SeriesError> {
        let devices = hierarchy::resolve_device_filter(
            self.directory.as_ref(),
            &scope.company_id,
            plan.hierarchy_id.as_deref(),
        )
        .await?;

        let outcomes = join_all(
            plan.variables
                .iter()
                .map(|(variable, field)| self.run_variable(scope, plan, &devices, variable, field)),
        )
        .await;

        let requests: Vec<VariableRequest> = plan
            .variables
            .iter()
            .map(|(variable, _)| variable.clone())
            .collect();
        Ok(SeriesResponse {
            series_data: assembler::assemble(&requests, outcomes),
        })
    }

    async fn run_variable(
        &self,
        scope: &RequestScope,
        plan: &QueryPlan,
        devices: &DeviceFilter,
        variable: &VariableRequest,
        field: &ResolvedField,
    ) -> VariableOutcome {
        let query = ReadingQuery {
            company_id: scope.company_id.clone(),
            device_type_id: scope.device_type_id.clone(),
            devices: devices.clone(),
            required_fields: field.required_fields(),
            range: plan.range,
            limit: plan.limit,
        };

        match fetcher::fetch(self.readings.as_ref(), &query).await {
            Ok(readings) => {
                let points = evaluator::series_points(field, &readings);
                tracing::debug!(
                    variable = %variable.variable_name,
                    tag = %variable.variable_tag,
                    computed = field.is_computed(),
                    rows = readings.len(),
                    points = points.len(),
                    "variable series ready"
                );
                VariableOutcome::Points(points)
            }
            Err(err) => {
                tracing::warn!(
                    variable = %variable.variable_name,
                    tag = %variable.variable_tag,
                    error = %err,
                    "variable fetch failed"
                );
                VariableOutcome::Failed(err.to_string())
            }
        }
    }
}
