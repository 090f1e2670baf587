//! Log setup from the `[logger]` config section.
//!
//! Each key names a module (`net`, `world`, `game`, ...) with a level in
//! {ERROR, INFO, DEBUG}; a `default` key sets the baseline. Unknown modules
//! are passed through as-is so subsystems can be added without touching
//! this file.

use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log level \"{0}\" (expected ERROR, INFO or DEBUG)")]
    BadLevel(String),
    #[error("logging already initialised")]
    AlreadyInitialised,
}

fn level_directive(level: &str) -> Result<&'static str, LoggingError> {
    match level.to_ascii_uppercase().as_str() {
        "ERROR" => Ok("error"),
        "INFO" => Ok("info"),
        "DEBUG" => Ok("debug"),
        other => Err(LoggingError::BadLevel(other.to_string())),
    }
}

/// The filter string for a set of `(module, level)` pairs, rooted at this
/// crate's module tree.
pub fn build_filter(entries: &[(String, String)]) -> Result<String, LoggingError> {
    let mut default = "info";
    let mut directives = Vec::new();
    for (module, level) in entries {
        let level = level_directive(level)?;
        if module == "default" {
            default = level;
        } else {
            directives.push(format!("yore::{module}={level}"));
        }
    }
    let mut filter = default.to_string();
    for directive in directives {
        filter.push(',');
        filter.push_str(&directive);
    }
    Ok(filter)
}

/// Installs the global subscriber. Call once, before the first connection.
pub fn init(entries: &[(String, String)]) -> Result<(), LoggingError> {
    let filter = build_filter(entries)?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialised)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(m, l)| (m.to_string(), l.to_string()))
            .collect()
    }

    #[test]
    fn builds_module_directives() {
        let filter = build_filter(&entries(&[("net", "DEBUG"), ("world", "ERROR")])).expect("ok");
        assert_eq!(filter, "info,yore::net=debug,yore::world=error");
    }

    #[test]
    fn default_key_changes_the_baseline() {
        let filter = build_filter(&entries(&[("default", "ERROR")])).expect("ok");
        assert_eq!(filter, "error");
    }

    #[test]
    fn level_names_are_case_insensitive() {
        let filter = build_filter(&entries(&[("net", "debug")])).expect("ok");
        assert_eq!(filter, "info,yore::net=debug");
    }

    #[test]
    fn unknown_levels_are_rejected() {
        assert!(matches!(
            build_filter(&entries(&[("net", "LOUD")])),
            Err(LoggingError::BadLevel(_))
        ));
    }
}
