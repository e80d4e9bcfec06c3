//! Conversion configuration.
//!
//! A `Config` value is threaded explicitly through the engine; there is no
//! module-level state.

use std::str::FromStr;

/// Named resilience profile.  `Auto` selects by estimated table size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Auto,
    Small,
    Medium,
    Large,
    Enterprise,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseProfileError;

impl FromStr for Profile {
    type Err = ParseProfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Profile::Auto),
            "small" => Ok(Profile::Small),
            "medium" => Ok(Profile::Medium),
            "large" => Ok(Profile::Large),
            "enterprise" => Ok(Profile::Enterprise),
            _ => Err(ParseProfileError),
        }
    }
}

/// What to do with a record that fails to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnRowError {
    /// Drop the record and count it.
    Skip,
    /// Insert the decodable columns, NULL for the rest.
    Partial,
    /// Abort the table.
    Abort,
}

impl FromStr for OnRowError {
    type Err = ParseProfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "skip" => Ok(OnRowError::Skip),
            "partial" => Ok(OnRowError::Partial),
            "abort" => Ok(OnRowError::Abort),
            _ => Err(ParseProfileError),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Hard cap for resident memory budgeting.  `None` takes the selected
    /// profile's limit.
    pub memory_limit_bytes: Option<u64>,
    pub profile: Profile,
    /// Code page for string fields, resolved by `codepage::CodePage`.
    pub code_page: String,
    pub on_row_error: OnRowError,
    /// Worker count for table-parallel decoding; honored only under the
    /// enterprise profile.
    pub parallel_tables: usize,
    /// Continue a previously cancelled conversion from its `_resume`
    /// markers.
    pub resume: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            memory_limit_bytes: None,
            profile: Profile::Auto,
            code_page: "cp437".to_string(),
            on_row_error: OnRowError::Skip,
            parallel_tables: 1,
            resume: false,
        }
    }
}

#[test]
fn test_profile_from_str() {
    assert_eq!("auto".parse::<Profile>().unwrap(), Profile::Auto);
    assert_eq!("Enterprise".parse::<Profile>().unwrap(), Profile::Enterprise);
    assert!("huge".parse::<Profile>().is_err());
}

#[test]
fn test_on_row_error_from_str() {
    assert_eq!("skip".parse::<OnRowError>().unwrap(), OnRowError::Skip);
    assert_eq!("PARTIAL".parse::<OnRowError>().unwrap(), OnRowError::Partial);
    assert!("ignore".parse::<OnRowError>().is_err());
}

#[test]
fn test_default_config() {
    let c = Config::default();
    assert_eq!(c.profile, Profile::Auto);
    assert_eq!(c.code_page, "cp437");
    assert_eq!(c.on_row_error, OnRowError::Skip);
    assert_eq!(c.parallel_tables, 1);
    assert!(!c.resume);
    assert!(c.memory_limit_bytes.is_none());
}
