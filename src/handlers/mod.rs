//! HTTP handlers

pub mod agent;
pub mod commands;
pub mod devices;
pub mod events;
pub mod health;

use crate::error::{AppError, AppResult};

pub(crate) const DEFAULT_LIMIT: i64 = 50;
pub(crate) const MAX_LIMIT: i64 = 500;

/// Resolve an optional `limit` query parameter, rejecting values outside
/// 1..=500 so callers cannot request unbounded result sets.
pub(crate) fn validate_limit(limit: Option<i64>) -> AppResult<i64> {
    match limit {
        None => Ok(DEFAULT_LIMIT),
        Some(n) if (1..=MAX_LIMIT).contains(&n) => Ok(n),
        Some(n) => Err(AppError::ValidationError(format!(
            "limit must be between 1 and {}, got {}",
            MAX_LIMIT, n
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_defaults_when_absent() {
        assert_eq!(validate_limit(None).unwrap(), DEFAULT_LIMIT);
    }

    #[test]
    fn test_limit_in_range_is_accepted() {
        assert_eq!(validate_limit(Some(1)).unwrap(), 1);
        assert_eq!(validate_limit(Some(500)).unwrap(), 500);
    }

    #[test]
    fn test_limit_out_of_range_is_rejected() {
        assert!(matches!(
            validate_limit(Some(0)),
            Err(AppError::ValidationError(_))
        ));
        assert!(matches!(
            validate_limit(Some(-5)),
            Err(AppError::ValidationError(_))
        ));
        assert!(matches!(
            validate_limit(Some(501)),
            Err(AppError::ValidationError(_))
        ));
    }
}
