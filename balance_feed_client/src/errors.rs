use bf_common::ParseValueError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var} is not a valid URL ({value}). {reason}")]
    InvalidUrl { var: &'static str, value: String, reason: String },
    #[error("{var} has an invalid value. {source}")]
    InvalidValue { var: &'static str, source: ParseValueError },
}
