//! Boundary validation for caller-supplied identifiers.
//!
//! Every endpoint and repository operation that consumes a job or pipeline
//! identifier validates it here before touching any state.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref JOB_ID: Regex = Regex::new(r"^[A-Za-z0-9_-]{1,100}$").unwrap();
    static ref PIPELINE_ID: Regex = Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap();
}

/// Check a job identifier against `^[A-Za-z0-9_-]{1,100}$`.
pub fn is_valid_job_id(id: &str) -> bool {
    JOB_ID.is_match(id)
}

/// Check a pipeline identifier against `^[A-Za-z0-9_-]{1,64}$`.
pub fn is_valid_pipeline_id(id: &str) -> bool {
    PIPELINE_ID.is_match(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_uuid_style_job_ids() {
        assert!(is_valid_job_id("550e8400-e29b-41d4-a716-446655440000"));
        assert!(is_valid_job_id("job_1"));
        assert!(is_valid_job_id("A"));
    }

    #[test]
    fn rejects_empty_and_oversized_job_ids() {
        assert!(!is_valid_job_id(""));
        assert!(!is_valid_job_id(&"a".repeat(101)));
        assert!(is_valid_job_id(&"a".repeat(100)));
    }

    #[test]
    fn rejects_shell_metacharacters() {
        assert!(!is_valid_job_id("job;rm -rf /"));
        assert!(!is_valid_job_id("job id"));
        assert!(!is_valid_pipeline_id("p$(reboot)"));
        assert!(!is_valid_pipeline_id("p`x`"));
    }

    #[test]
    fn pipeline_ids_cap_at_64() {
        assert!(is_valid_pipeline_id(&"p".repeat(64)));
        assert!(!is_valid_pipeline_id(&"p".repeat(65)));
    }
}
