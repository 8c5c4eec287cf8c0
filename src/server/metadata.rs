//! Stream-open metadata checks.

use tonic::{Request, Status};

use crate::messages::BACKEND_NAME_METADATA;

/// Extract the mandatory `backend-name` value. Missing, empty or non-ASCII
/// values refuse the stream with `InvalidArgument`.
pub fn backend_name<T>(request: &Request<T>) -> Result<String, Status> {
    let value = request
        .metadata()
        .get(BACKEND_NAME_METADATA)
        .ok_or_else(|| Status::invalid_argument("missing backend-name metadata"))?;
    let name = value
        .to_str()
        .map_err(|_| Status::invalid_argument("backend-name metadata is not valid ASCII"))?
        .trim();
    if name.is_empty() {
        return Err(Status::invalid_argument("backend-name metadata is empty"));
    }
    Ok(name.to_string())
}

/// Read an optional ASCII header value.
pub fn header_value<T>(request: &Request<T>, header: &str) -> Option<String> {
    request
        .metadata()
        .get(header)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
