mod helpers;
mod secret;

pub use helpers::{parse_boolean_flag, parse_millis, parse_positive, ParseValueError};
pub use secret::Secret;
