//! Unified error handling for the run-coverage library.
//!
//! All fallible operations return [`Result`], with one error type shared
//! across the network builder, the router and the accounting store.
//! Conflicts that callers are expected to handle as ordinary outcomes
//! (e.g. a duplicate run on a date) are typed outcome enums on the relevant
//! operation instead of error variants; the variants here are the ones that
//! terminate the current operation.

use std::fmt;

/// Unified error type for run-coverage operations.
#[derive(Debug, Clone)]
pub enum CoverageError {
    /// A requested entity does not exist. Callers typically degrade to an
    /// empty result rather than failing the request.
    NotFound {
        entity: &'static str,
        key: String,
    },
    /// Username cannot be registered twice.
    UsernameExists { username: String },
    /// A run area with this name already exists for the user.
    RunAreaExists {
        username: String,
        area_name: String,
    },
    /// A sub run area with this name already exists within the area.
    SubRunAreaExists {
        username: String,
        area_name: String,
        sub_area_name: String,
    },
    /// A sub run area requires a polygon in WKT format.
    MissingPolygon {
        username: String,
        area_name: String,
        sub_area_name: String,
    },
    /// A date string did not parse as YYYY-MM-DD.
    MalformedDate { value: String },
    /// Geometry input could not be interpreted (degenerate polygon,
    /// unparsable linestring).
    MalformedGeometry { message: String },
    /// SQLite/storage error.
    Persistence { message: String },
    /// JSON (de)serialization error for persisted snapshots.
    Serialization { message: String },
    /// Generic internal error.
    Internal { message: String },
}

impl fmt::Display for CoverageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoverageError::NotFound { entity, key } => {
                write!(f, "{} not found for {}", entity, key)
            }
            CoverageError::UsernameExists { username } => {
                write!(f, "username '{}' already exists", username)
            }
            CoverageError::RunAreaExists {
                username,
                area_name,
            } => {
                write!(
                    f,
                    "run area '{}' for user '{}' already exists",
                    area_name, username
                )
            }
            CoverageError::SubRunAreaExists {
                username,
                area_name,
                sub_area_name,
            } => {
                write!(
                    f,
                    "sub run area '{}' in area '{}' for user '{}' already exists",
                    sub_area_name, area_name, username
                )
            }
            CoverageError::MissingPolygon {
                username,
                area_name,
                sub_area_name,
            } => {
                write!(
                    f,
                    "sub run area '{}' in area '{}' for user '{}' has no WKT polygon",
                    sub_area_name, area_name, username
                )
            }
            CoverageError::MalformedDate { value } => {
                write!(f, "date '{}' is not in YYYY-MM-DD format", value)
            }
            CoverageError::MalformedGeometry { message } => {
                write!(f, "malformed geometry: {}", message)
            }
            CoverageError::Persistence { message } => {
                write!(f, "persistence error: {}", message)
            }
            CoverageError::Serialization { message } => {
                write!(f, "serialization error: {}", message)
            }
            CoverageError::Internal { message } => {
                write!(f, "internal error: {}", message)
            }
        }
    }
}

impl std::error::Error for CoverageError {}

impl From<rusqlite::Error> for CoverageError {
    fn from(err: rusqlite::Error) -> Self {
        CoverageError::Persistence {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoverageError {
    fn from(err: serde_json::Error) -> Self {
        CoverageError::Serialization {
            message: err.to_string(),
        }
    }
}

/// Result type alias for run-coverage operations.
pub type Result<T> = std::result::Result<T, CoverageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoverageError::RunAreaExists {
            username: "ada".to_string(),
            area_name: "york".to_string(),
        };
        assert!(err.to_string().contains("ada"));
        assert!(err.to_string().contains("york"));
    }

    #[test]
    fn test_not_found_display() {
        let err = CoverageError::NotFound {
            entity: "graph",
            key: "ada/york".to_string(),
        };
        assert_eq!(err.to_string(), "graph not found for ada/york");
    }

    #[test]
    fn test_from_serde_json() {
        let parse_err = serde_json::from_str::<Vec<i32>>("not json").unwrap_err();
        let err: CoverageError = parse_err.into();
        assert!(matches!(err, CoverageError::Serialization { .. }));
    }
}
