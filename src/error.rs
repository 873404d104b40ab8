#[cfg(feature = "python")]
use pyo3::exceptions::PyRuntimeError;
#[cfg(feature = "python")]
use pyo3::PyErr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, QcError>;

#[derive(Error, Debug)]
pub enum QcError {
    #[error("Missing column: {0}")]
    MissingColumn(String),

    #[error("Polars error: {0}")]
    Polars(#[from] polars::error::PolarsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Shape mismatch: expected {expected} rows, got {got}")]
    ShapeMismatch { expected: usize, got: usize },

    #[error("Argument error: {0}")]
    Argument(String),

    #[error("Routine '{routine}' requires threshold '{field}'")]
    MissingThreshold { routine: String, field: &'static str },

    #[error("No area found for position lat={lat}, lon={lon}")]
    NoAreaFound { lat: f64, lon: f64 },

    #[error("Catalog: {0}")]
    Catalog(String),

    #[error("InvalidData: {0}")]
    InvalidData(String),
}

#[cfg(feature = "python")]
impl From<QcError> for PyErr {
    fn from(err: QcError) -> PyErr {
        PyRuntimeError::new_err(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = QcError::ShapeMismatch {
            expected: 5,
            got: 4,
        };
        assert_eq!(err.to_string(), "Shape mismatch: expected 5 rows, got 4");

        let err = QcError::MissingThreshold {
            routine: "range_check".to_string(),
            field: "max_range_value",
        };
        assert_eq!(
            err.to_string(),
            "Routine 'range_check' requires threshold 'max_range_value'"
        );

        let err = QcError::NoAreaFound { lat: 1.5, lon: 2.0 };
        assert_eq!(err.to_string(), "No area found for position lat=1.5, lon=2");
    }
}
