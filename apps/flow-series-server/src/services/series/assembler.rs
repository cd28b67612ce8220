use super::types::{ResultPoint, SeriesData, SeriesResult, VariableRequest};

/// Result of one variable's pipeline; failures carry a client-visible message.
#[derive(Debug, Clone, PartialEq)]
pub enum VariableOutcome {
    Points(Vec<ResultPoint>),
    Failed(String),
}

/// Keys results by `variable_name`, in the order the variables were requested.
pub fn assemble(requests: &[VariableRequest], outcomes: Vec<VariableOutcome>) -> SeriesData {
    let entries = requests
        .iter()
        .zip(outcomes)
        .map(|(request, outcome)| {
            let (data, error) = match outcome {
                VariableOutcome::Points(points) => (points, None),
                VariableOutcome::Failed(message) => (Vec::new(), Some(message)),
            };
            (
                request.variable_name.clone(),
                SeriesResult {
                    data,
                    unit: request.unit.clone(),
                    property_name: request.variable_name.clone(),
                    error,
                },
            )
        })
        .collect();
    SeriesData(entries)
}
