use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SsfError {
    #[error("invalid state-space system: {0}")]
    InvalidSystem(String),

    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("singular system: {0}")]
    SingularSystem(String),

    #[error("negative prediction-error variance at t={t}: {value}")]
    NegativeVariance { t: usize, value: f64 },

    #[error("data error: {0}")]
    DataError(String),
}

impl SsfError {
    /// True for the numerical failures an optimizer should read as
    /// "infeasible parameter point" rather than as a configuration bug.
    pub fn is_singular(&self) -> bool {
        matches!(
            self,
            SsfError::SingularSystem(_) | SsfError::NegativeVariance { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SsfError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err = SsfError::DimensionMismatch { expected: 3, got: 2 };
        assert_eq!(err.to_string(), "dimension mismatch: expected 3, got 2");

        let err = SsfError::NegativeVariance { t: 7, value: -0.5 };
        assert_eq!(
            err.to_string(),
            "negative prediction-error variance at t=7: -0.5"
        );
    }

    #[test]
    fn test_singular_classification() {
        assert!(SsfError::SingularSystem("lyapunov".into()).is_singular());
        assert!(SsfError::NegativeVariance { t: 0, value: -1.0 }.is_singular());
        assert!(!SsfError::InvalidSystem("d > n".into()).is_singular());
        assert!(!SsfError::DataError("inf".into()).is_singular());
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_impl<T: Send + Sync + std::error::Error>() {}
        assert_impl::<SsfError>();
    }
}
