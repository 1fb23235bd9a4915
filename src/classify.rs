//! Result classification
//!
//! Maps a driver outcome to one of three classifications. Absence is an
//! expected outcome for point lookups, so it gets its own class instead of
//! being folded into failure.

use crate::error::DriverError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tri-state outcome of a command's execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    /// The driver reported no error
    Success,
    /// Any driver error other than not-found
    Fail,
    /// The driver reported a not-found condition
    Miss,
}

impl Classification {
    pub fn is_success(self) -> bool {
        self == Classification::Success
    }

    pub fn is_miss(self) -> bool {
        self == Classification::Miss
    }

    pub fn is_fail(self) -> bool {
        self == Classification::Fail
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Classification::Success => "SUCCESS",
            Classification::Fail => "FAIL",
            Classification::Miss => "MISS",
        };
        f.write_str(name)
    }
}

/// Classify a driver outcome.
pub fn classify(err: Option<&DriverError>) -> Classification {
    match err {
        None => Classification::Success,
        Some(DriverError::NotFound) => Classification::Miss,
        Some(_) => Classification::Fail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_none_is_success() {
        assert_eq!(classify(None), Classification::Success);
    }

    #[test]
    fn test_classify_not_found_is_miss() {
        assert_eq!(classify(Some(&DriverError::NotFound)), Classification::Miss);
    }

    #[test]
    fn test_classify_other_errors_fail() {
        let errors = vec![
            DriverError::WrongType { key: "k".to_string() },
            DriverError::InvalidArgument("bad".to_string()),
            DriverError::Connection("reset by peer".to_string()),
            DriverError::Execution("boom".to_string()),
            DriverError::Decode("eof".to_string()),
            DriverError::Panicked("oops".to_string()),
        ];
        for err in &errors {
            assert_eq!(classify(Some(err)), Classification::Fail, "{err}");
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(Classification::Miss.to_string(), "MISS");
        assert!(Classification::Success.is_success());
        assert!(Classification::Fail.is_fail());
    }
}
