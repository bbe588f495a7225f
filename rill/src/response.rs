//! Parsed responses as handed to request callers.

use std::collections::HashMap;

use bytes::Bytes;
use rill_cql::frame::response::result::{self, Row, Rows};
use rill_cql::frame::response::Response;
use uuid::Uuid;

use crate::errors::RequestError;

/// A fully decoded response to a single request, together with the envelope
/// extensions (trace id, warnings, custom payload).
#[derive(Debug)]
pub struct QueryResponse {
    pub response: Response,
    pub tracing_id: Option<Uuid>,
    pub warnings: Vec<String>,
    pub custom_payload: Option<HashMap<String, Bytes>>,
}

impl QueryResponse {
    /// Splits off server errors into `Err`, so callers only ever see
    /// non-error responses.
    pub fn into_non_error(self) -> Result<QueryResponse, RequestError> {
        match self.response {
            Response::Error(err) => Err(RequestError::DbError {
                error: err.error,
                reason: err.reason,
            }),
            _ => Ok(self),
        }
    }

    /// Interprets this response as a query result.
    pub fn into_query_result(self) -> Result<QueryResult, RequestError> {
        let this = self.into_non_error()?;
        let rows = match this.response {
            Response::Result(result::Result::Rows(rows)) => Some(rows),
            Response::Result(_) => None,
            other => return Err(RequestError::UnexpectedResponse(other.to_response_kind())),
        };

        Ok(QueryResult {
            rows,
            tracing_id: this.tracing_id,
            warnings: this.warnings,
        })
    }
}

/// The result of a query: raw rows for row-bearing results, nothing for the
/// void-ish ones.
#[derive(Debug)]
pub struct QueryResult {
    rows: Option<Rows>,
    pub tracing_id: Option<Uuid>,
    pub warnings: Vec<String>,
}

impl QueryResult {
    pub fn rows(&self) -> &[Row] {
        self.rows.as_ref().map(|r| r.rows.as_slice()).unwrap_or(&[])
    }

    pub fn into_rows(self) -> Option<Rows> {
        self.rows
    }

    /// Name of the column at the given position, if metadata was sent.
    pub fn column_name(&self, index: usize) -> Option<&str> {
        self.rows
            .as_ref()?
            .metadata
            .col_specs
            .get(index)
            .map(|spec| spec.name.as_str())
    }
}
