//! Request scope handed down by the authenticating gateway.
//!
//! Authentication happens upstream; this service only trusts the company and device type
//! headers the gateway attaches and uses them to isolate every query.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use std::future::Future;

use crate::error::AppError;
use crate::services::series::types::RequestScope;

pub const HEADER_COMPANY_ID: &str = "x-company-id";
pub const HEADER_DEVICE_TYPE_ID: &str = "x-device-type-id";

const MAX_SCOPE_ID_LEN: usize = 128;

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty() && value.len() <= MAX_SCOPE_ID_LEN)
        .map(str::to_string)
}

pub fn scope_from_headers(headers: &HeaderMap) -> Result<RequestScope, AppError> {
    let company_id = header_value(headers, HEADER_COMPANY_ID)
        .ok_or_else(|| AppError::unauthorized("Missing company scope"))?;
    let device_type_id = header_value(headers, HEADER_DEVICE_TYPE_ID)
        .ok_or_else(|| AppError::unauthorized("Missing device type scope"))?;
    Ok(RequestScope {
        company_id,
        device_type_id,
    })
}

#[derive(Debug, Clone)]
pub struct Scope(pub RequestScope);

impl<S> FromRequestParts<S> for Scope
where
    S: Send + Sync,
{
    type Rejection = AppError;

    fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> impl Future<Output = Result<Self, Self::Rejection>> + Send {
        let scope = scope_from_headers(&parts.headers).map(Scope);
        async move { scope }
    }
}
