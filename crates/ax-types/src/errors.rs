use thiserror::Error;

/// Main error type for the Arbitrex system
#[derive(Error, Debug)]
pub enum AxError {
    #[error("Invalid parameter '{parameter}': {message}")]
    InvalidParameter { parameter: String, message: String },

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Strategy error: {0}")]
    Strategy(#[from] StrategyError),

    #[error("Backtest error: {0}")]
    Backtest(#[from] BacktestError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AxError {
    /// Script traceback carried by strategy and simulation failures, if any.
    pub fn trace(&self) -> Option<&str> {
        match self {
            AxError::Strategy(StrategyError::ExecutionError { trace, .. })
            | AxError::Backtest(BacktestError::Simulation { trace, .. }) => {
                Some(trace.as_str()).filter(|t| !t.is_empty())
            }
            _ => None,
        }
    }
}

/// Data-related errors
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Data source not found: {0}")]
    SourceNotFound(String),

    #[error("Asset not supported by provider {provider}: {asset}")]
    AssetNotFound { provider: String, asset: String },

    #[error("No data available for {asset} in date range {start} to {end}")]
    Unavailable {
        asset: String,
        start: String,
        end: String,
    },

    #[error("Invalid data format: {message}")]
    InvalidFormat { message: String },

    #[error("Data loading failed: {message}")]
    LoadingFailed { message: String },

    #[error("Data parsing error: {message}")]
    ParseError { message: String },

    #[error("Network request failed after {attempts} attempts: {message}")]
    Network { attempts: u32, message: String },
}

/// Static validation failures for strategy source code
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("syntax error at line {line}, column {column}: {message}")]
    Syntax {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("import of module '{module}' is not allowed (line {line})")]
    DeniedImport { module: String, line: usize },

    #[error("package not available: '{module}' (line {line})")]
    PackageNotAvailable { module: String, line: usize },

    #[error("call to '{name}' is not allowed (line {line})")]
    BannedCall { name: String, line: usize },

    #[error("access to attribute '{attribute}' is not allowed (line {line})")]
    DunderAccess { attribute: String, line: usize },

    #[error("missing strategy class: define a class that inherits from bt.Strategy")]
    MissingStrategyClass,

    #[error("multiple strategy classes: {names}")]
    MultipleStrategyClasses { names: String },

    #[error("strategy class '{class}' is missing required method '{method}'")]
    MissingMethod { class: String, method: String },
}

/// Strategy-related errors
#[derive(Error, Debug)]
pub enum StrategyError {
    #[error("Strategy not found: {strategy_id}")]
    NotFound { strategy_id: String },

    #[error("Strategy load failed: {message}")]
    LoadFailed { message: String },

    #[error("Strategy execution error: {message}")]
    ExecutionError { message: String, trace: String },

    #[error("Strategy parameter error: {parameter}, message: {message}")]
    ParameterError { parameter: String, message: String },

    #[error("Permission denied: {message}")]
    PermissionDenied { message: String },
}

/// Backtest run errors
#[derive(Error, Debug)]
pub enum BacktestError {
    #[error("Run not found: {run_id}")]
    NotFound { run_id: String },

    #[error("Invalid status transition for run {run_id}: {from} -> {to}")]
    InvalidTransition {
        run_id: String,
        from: String,
        to: String,
    },

    #[error("No price feeds supplied to the simulation")]
    NoFeeds,

    #[error("Simulation error: {message}")]
    Simulation { message: String, trace: String },

    #[error("Results processing error: {message}")]
    ResultsProcessing { message: String },

    #[error("Timed out after {seconds}s waiting for the run lock of {owner}")]
    LockTimeout { owner: String, seconds: u64 },
}

/// Persistence errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query execution failed: {query}, error: {error}")]
    QueryFailed { query: String, error: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("Corrupt record: {message}")]
    Corrupt { message: String },
}

/// Result type alias for Arbitrex operations
pub type AxResult<T> = Result<T, AxError>;

/// Macro for creating invalid-parameter errors
#[macro_export]
macro_rules! invalid_parameter {
    ($param:expr, $($arg:tt)*) => {
        $crate::errors::AxError::InvalidParameter {
            parameter: $param.to_string(),
            message: format!($($arg)*),
        }
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::errors::AxError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::errors::AxError::Config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = DataError::Unavailable {
            asset: "BTC".to_string(),
            start: "2024-01-01".to_string(),
            end: "2024-01-31".to_string(),
        };

        assert!(error.to_string().contains("No data available"));
        assert!(error.to_string().contains("BTC"));
        assert!(error.to_string().contains("2024-01-31"));
    }

    #[test]
    fn test_error_conversion() {
        let validation = ValidationError::MissingMethod {
            class: "Cross".to_string(),
            method: "next".to_string(),
        };
        let ax_error: AxError = validation.into();

        match &ax_error {
            AxError::Validation(_) => (),
            _ => panic!("Expected Validation error"),
        }
        assert!(ax_error.to_string().contains("next"));
    }

    #[test]
    fn test_trace_is_exposed_for_simulation_errors() {
        let err: AxError = BacktestError::Simulation {
            message: "division by zero".to_string(),
            trace: "line 4, in next".to_string(),
        }
        .into();
        assert_eq!(err.trace(), Some("line 4, in next"));

        let err: AxError = DataError::SourceNotFound("x".to_string()).into();
        assert_eq!(err.trace(), None);
    }

    #[test]
    fn test_macros() {
        let err = invalid_parameter!("interval", "unsupported interval {}", "2h");
        assert!(err.to_string().contains("interval"));
        assert!(err.to_string().contains("2h"));
        let _internal_err = internal_error!("Something went wrong");
        let _config_err = config_error!("Missing required field: {}", "database.path");
    }
}
