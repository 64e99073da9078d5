//! Pre-spawn checks on an execution request.
//!
//! The worker process is the isolation boundary; these checks only reject
//! requests that could never run, before a process is spent on them.

use crate::error::SandboxError;
use crate::request::ExecutionRequest;

/// Reject empty or oversized code.
pub fn validate_code(code: &str, max_size: usize) -> Result<(), SandboxError> {
    if code.len() > max_size {
        return Err(SandboxError::CodeTooLarge {
            max: max_size,
            actual: code.len(),
        });
    }

    if code.trim().is_empty() {
        return Err(SandboxError::ValidationFailed {
            reason: "code is empty".into(),
        });
    }

    Ok(())
}

/// Validate the code and the request's limits.
///
/// `max_tool_calls = 0` is allowed: every call is rejected.
pub fn validate_request(
    request: &ExecutionRequest,
    max_code_size: usize,
) -> Result<(), SandboxError> {
    validate_code(&request.code, max_code_size)?;

    let zero = [
        ("timeout_ms", request.timeout_ms == 0),
        ("max_worker_memory_mb", request.max_worker_memory_mb == 0),
    ];
    if let Some((field, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
        return Err(SandboxError::InvalidRequest {
            reason: format!("{field} must be greater than zero"),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_script() {
        assert!(validate_code("console.log(await tools.read_file({path: 'a'}))", 1024).is_ok());
    }

    #[test]
    fn rejects_empty_code() {
        let err = validate_code("   \n\t", 1024).unwrap_err();
        assert!(matches!(err, SandboxError::ValidationFailed { .. }));
    }

    #[test]
    fn rejects_oversized_code() {
        let err = validate_code(&"x".repeat(11), 10).unwrap_err();
        match err {
            SandboxError::CodeTooLarge { max, actual } => {
                assert_eq!(max, 10);
                assert_eq!(actual, 11);
            }
            other => panic!("expected CodeTooLarge, got: {other:?}"),
        }
    }

    #[test]
    fn rejects_zero_timeout() {
        let request = ExecutionRequest {
            timeout_ms: 0,
            ..ExecutionRequest::new("1")
        };
        let err = validate_request(&request, 1024).unwrap_err();
        assert!(err.to_string().contains("timeout_ms"), "error: {err}");
    }

    #[test]
    fn zero_tool_budget_is_allowed() {
        let request = ExecutionRequest {
            max_tool_calls: 0,
            ..ExecutionRequest::new("1")
        };
        assert!(validate_request(&request, 1024).is_ok());
    }
}
