//! Error types shared across the fleet crates.

use std::fmt;

use thiserror::Error;

/// Result type alias for core validation and parsing.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors produced while validating or parsing declared state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("parse error: {0}")]
    Parse(String),
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Collects independent failures from a multi-step operation.
///
/// Each step keeps going after a failure; the caller gets every error at once.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<BoxError>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<E: Into<BoxError>>(&mut self, err: E) {
        self.errors.push(err.into());
    }

    /// Record the error side of a result, passing the success value through.
    pub fn collect<T, E: Into<BoxError>>(&mut self, result: Result<T, E>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                self.push(e);
                None
            }
        }
    }

    /// Absorb every error of another aggregate.
    pub fn extend(&mut self, other: MultiError) {
        self.errors.extend(other.errors);
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(dyn std::error::Error + Send + Sync + 'static)> {
        self.errors.iter().map(|e| e.as_ref())
    }

    /// `Ok(())` when nothing was recorded.
    pub fn into_result(self) -> Result<(), MultiError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_multi_error_is_ok() {
        assert!(MultiError::new().into_result().is_ok());
    }

    #[test]
    fn multi_error_joins_messages() {
        let mut errs = MultiError::new();
        errs.push(CoreError::Parse("line 1".into()));
        let kept: Option<u32> = errs.collect(Err::<u32, _>(CoreError::Validation("bad".into())));
        assert!(kept.is_none());
        assert_eq!(errs.collect(Ok::<_, CoreError>(7)), Some(7));

        let err = errs.into_result().unwrap_err();
        assert_eq!(err.len(), 2);
        assert_eq!(err.to_string(), "parse error: line 1; validation failed: bad");
    }
}
