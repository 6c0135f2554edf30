//! Kubernetes API error predicates
//!
//! Mirrors the apimachinery status reasons. Predicates take a bare
//! `kube::Error`; the `_in` variants look for one inside an `anyhow` chain.

use super::find_cause;
use kube::error::ErrorResponse;

fn response(err: &kube::Error) -> Option<&ErrorResponse> {
    match err {
        kube::Error::Api(response) => Some(response),
        _ => None,
    }
}

fn has_reason(err: &kube::Error, reason: &str, code: u16) -> bool {
    response(err)
        .is_some_and(|r| r.reason == reason || (r.reason.is_empty() && r.code == code))
}

pub fn is_not_found(err: &kube::Error) -> bool {
    has_reason(err, "NotFound", 404)
}

pub fn is_already_exists(err: &kube::Error) -> bool {
    response(err).is_some_and(|r| r.reason == "AlreadyExists")
}

pub fn is_conflict(err: &kube::Error) -> bool {
    response(err)
        .is_some_and(|r| r.reason == "Conflict" || (r.code == 409 && r.reason.is_empty()))
}

pub fn is_gone(err: &kube::Error) -> bool {
    has_reason(err, "Gone", 410)
}

pub fn is_resource_expired(err: &kube::Error) -> bool {
    response(err).is_some_and(|r| r.reason == "Expired")
}

pub fn is_invalid(err: &kube::Error) -> bool {
    has_reason(err, "Invalid", 422)
}

pub fn is_timeout(err: &kube::Error) -> bool {
    has_reason(err, "Timeout", 504)
}

pub fn is_server_timeout(err: &kube::Error) -> bool {
    response(err).is_some_and(|r| r.reason == "ServerTimeout")
}

pub fn is_service_unavailable(err: &kube::Error) -> bool {
    has_reason(err, "ServiceUnavailable", 503)
}

pub fn is_too_many_requests(err: &kube::Error) -> bool {
    has_reason(err, "TooManyRequests", 429)
}

pub fn is_internal_error(err: &kube::Error) -> bool {
    has_reason(err, "InternalError", 500)
}

/// Failures below the API level (connection resets, TLS, broken responses)
pub fn is_unexpected_server_error(err: &kube::Error) -> bool {
    matches!(err, kube::Error::HyperError(_) | kube::Error::Service(_))
}

/// Errors worth retrying when reading from the cluster
pub fn is_transient(err: &kube::Error) -> bool {
    is_timeout(err)
        || is_server_timeout(err)
        || is_service_unavailable(err)
        || is_too_many_requests(err)
        || is_internal_error(err)
        || is_unexpected_server_error(err)
}

pub fn is_not_found_in(err: &anyhow::Error) -> bool {
    find_cause::<kube::Error>(err).is_some_and(is_not_found)
}

pub fn is_already_exists_in(err: &anyhow::Error) -> bool {
    find_cause::<kube::Error>(err).is_some_and(is_already_exists)
}

/// Builds an API error response the way the API server reports it
pub fn api_error(code: u16, reason: &str, message: impl Into<String>) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: message.into(),
        reason: reason.to_string(),
        code,
    })
}

pub fn not_found(kind: &str, name: &str) -> kube::Error {
    api_error(404, "NotFound", format!("{kind} \"{name}\" not found"))
}

pub fn already_exists(kind: &str, name: &str) -> kube::Error {
    api_error(
        409,
        "AlreadyExists",
        format!("{kind} \"{name}\" already exists"),
    )
}

pub fn conflict(kind: &str, name: &str) -> kube::Error {
    api_error(
        409,
        "Conflict",
        format!("Operation cannot be fulfilled on {kind} \"{name}\": the object has been modified"),
    )
}
