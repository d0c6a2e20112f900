//! Utility functions for common operations.
//!
//! - **URL validation**: scheme and private-address checks for feed sources
//! - **Text processing**: markup stripping and reading-time estimates

mod text;
mod url_validator;

pub use text::{estimate_reading_time, strip_control_chars, strip_html, WORDS_PER_MINUTE};
pub use url_validator::{validate_feed_url, UrlValidationError};
