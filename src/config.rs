//! INI-style configuration files: `[section]` headers, `key = value` lines,
//! `#`/`;` comments. Unknown keys are ignored; missing keys fall back to the
//! defaults the callers pass in.

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

#[derive(Debug, Default, Clone)]
pub struct ConfigFile {
    sections: HashMap<String, HashMap<String, String>>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current: Option<String> = None;

        for (index, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[') {
                let name = name.strip_suffix(']').ok_or(ConfigError::Malformed {
                    line: index + 1,
                    reason: "unterminated section header".to_string(),
                })?;
                let name = name.trim().to_string();
                sections.entry(name.clone()).or_default();
                current = Some(name);
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::Malformed {
                    line: index + 1,
                    reason: format!("expected key = value, got \"{line}\""),
                });
            };
            let Some(section) = current.as_ref() else {
                return Err(ConfigError::Malformed {
                    line: index + 1,
                    reason: "key before any [section]".to_string(),
                });
            };
            sections
                .entry(section.clone())
                .or_default()
                .insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(Self { sections })
    }

    pub fn has_value(&self, section: &str, key: &str) -> bool {
        self.sections
            .get(section)
            .map(|s| s.contains_key(key))
            .unwrap_or(false)
    }

    pub fn get_string(&self, section: &str, key: &str, default: &str) -> String {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    pub fn get_integer(&self, section: &str, key: &str, default: i64) -> i64 {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_boolean(&self, section: &str, key: &str, default: bool) -> bool {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .map(|v| v == "true")
            .unwrap_or(default)
    }

    /// Every key of a section, for the `[logger]` module levels.
    pub fn section_entries(&self, section: &str) -> Vec<(String, String)> {
        let mut entries: Vec<(String, String)> = self
            .sections
            .get(section)
            .map(|s| s.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        entries.sort();
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# world server
[server]
port = 7172

[world]
motd = Welcome to the world!
world_file = data/world.xml

[logger]
net = DEBUG
world = ERROR
";

    #[test]
    fn sections_keys_and_defaults() {
        let config = ConfigFile::parse(SAMPLE).expect("parse");
        assert_eq!(config.get_integer("server", "port", 7171), 7172);
        assert_eq!(
            config.get_string("world", "motd", ""),
            "Welcome to the world!"
        );
        assert_eq!(
            config.get_string("world", "accounts_file", "data/accounts.xml"),
            "data/accounts.xml"
        );
        assert_eq!(config.get_integer("login", "port", 7171), 7171);
        assert!(config.has_value("logger", "net"));
        assert!(!config.has_value("logger", "engine"));
    }

    #[test]
    fn logger_section_lists_modules() {
        let config = ConfigFile::parse(SAMPLE).expect("parse");
        assert_eq!(
            config.section_entries("logger"),
            vec![
                ("net".to_string(), "DEBUG".to_string()),
                ("world".to_string(), "ERROR".to_string()),
            ]
        );
    }

    #[test]
    fn unparseable_numbers_fall_back() {
        let config = ConfigFile::parse("[server]\nport = lots\n").expect("parse");
        assert_eq!(config.get_integer("server", "port", 7171), 7171);
    }

    #[test]
    fn malformed_lines_are_errors() {
        assert!(matches!(
            ConfigFile::parse("[server\nport = 1\n"),
            Err(ConfigError::Malformed { line: 1, .. })
        ));
        assert!(matches!(
            ConfigFile::parse("port = 1\n"),
            Err(ConfigError::Malformed { line: 1, .. })
        ));
        assert!(matches!(
            ConfigFile::parse("[server]\njust some words\n"),
            Err(ConfigError::Malformed { line: 2, .. })
        ));
    }
}
