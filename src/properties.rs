//! `key = value` properties files
//!
//! Used for the Resources configuration and for the Distributor's
//! checkpoint. Keys may contain spaces ("Workers Per Node"); surrounding
//! whitespace of keys and values is trimmed. Blank lines and lines
//! starting with `#` are ignored.

use crate::error::PropertiesError;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// An in-memory properties map, optionally backed by a file
#[derive(Debug, Clone, Default)]
pub struct PropertiesFile {
    path: Option<PathBuf>,
    entries: BTreeMap<String, String>,
}

impl PropertiesFile {
    /// Create an empty, unbacked set of properties
    pub fn new() -> Self {
        Self::default()
    }

    /// Load properties from `path`
    pub fn open(path: &Path) -> Result<Self, PropertiesError> {
        let content = fs::read_to_string(path).map_err(|source| PropertiesError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut props = Self::parse(&content, path)?;
        props.path = Some(path.to_path_buf());
        Ok(props)
    }

    /// Start a new properties file at `path`, discarding any existing content on sync
    pub fn create(path: &Path) -> Self {
        Self {
            path: Some(path.to_path_buf()),
            entries: BTreeMap::new(),
        }
    }

    fn parse(content: &str, path: &Path) -> Result<Self, PropertiesError> {
        let mut entries = BTreeMap::new();
        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(PropertiesError::Malformed {
                    path: path.to_path_buf(),
                    line: index + 1,
                    content: line.to_string(),
                });
            };
            let key = key.trim();
            if key.is_empty() {
                return Err(PropertiesError::Malformed {
                    path: path.to_path_buf(),
                    line: index + 1,
                    content: line.to_string(),
                });
            }
            entries.insert(key.to_string(), value.trim().to_string());
        }
        Ok(Self { path: None, entries })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn set_property(&mut self, key: &str, value: &str) {
        self.entries.insert(key.trim().to_string(), value.trim().to_string());
    }

    pub fn set_property_from_integer(&mut self, key: &str, value: i64) {
        self.set_property(key, &value.to_string());
    }

    pub fn get_property(&self, key: &str) -> Result<&str, PropertiesError> {
        self.entries
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| PropertiesError::NotFound(key.to_string()))
    }

    pub fn get_property_as_integer(&self, key: &str) -> Result<i64, PropertiesError> {
        let value = self.get_property(key)?;
        parse_integer(value).ok_or_else(|| PropertiesError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Interpret `true/false`, `yes/no`, `1/0` (case-insensitive)
    pub fn get_property_as_bool(&self, key: &str) -> Result<bool, PropertiesError> {
        let value = self.get_property(key)?;
        match value.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(true),
            "false" | "no" | "0" => Ok(false),
            _ => Err(PropertiesError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    pub fn remove_property(&mut self, key: &str) -> Result<(), PropertiesError> {
        self.entries
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| PropertiesError::NotFound(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Write the properties to the backing file
    ///
    /// Writes to a sibling temporary file, flushes it to disk and renames it
    /// over the target so a crash never leaves a half-written file. Unbacked
    /// properties sync as a no-op.
    pub fn sync(&self) -> Result<(), PropertiesError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let io_err = |source| PropertiesError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let mut file = fs::File::create(&tmp_path).map_err(io_err)?;
        for (key, value) in &self.entries {
            writeln!(file, "{} = {}", key, value).map_err(io_err)?;
        }
        file.sync_all().map_err(io_err)?;
        drop(file);

        fs::rename(&tmp_path, path).map_err(io_err)
    }
}

fn parse_integer(value: &str) -> Option<i64> {
    let value = value.trim();
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).ok();
    }
    value.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_trims_and_skips_blank_lines() {
        let props = PropertiesFile::parse(
            "  Workers Per Node =  NUMCPUS \n\n# comment\nChunk Size=4\nLogsheet URL =\n",
            Path::new("test"),
        )
        .unwrap();

        assert_eq!(props.get_property("Workers Per Node").unwrap(), "NUMCPUS");
        assert_eq!(props.get_property_as_integer("Chunk Size").unwrap(), 4);
        assert_eq!(props.get_property("Logsheet URL").unwrap(), "");
        assert!(matches!(
            props.get_property("Missing"),
            Err(PropertiesError::NotFound(_))
        ));
    }

    #[test]
    fn test_malformed_line() {
        let result = PropertiesFile::parse("no separator here", Path::new("bad"));
        assert!(matches!(result, Err(PropertiesError::Malformed { line: 1, .. })));
    }

    #[test]
    fn test_integer_and_bool_values() {
        let mut props = PropertiesFile::new();
        props.set_property_from_integer("Num Keys", 8);
        props.set_property("Hex", "0x10");
        props.set_property("Flag", "Yes");
        props.set_property("Bad", "eight");

        assert_eq!(props.get_property_as_integer("Num Keys").unwrap(), 8);
        assert_eq!(props.get_property_as_integer("Hex").unwrap(), 16);
        assert!(props.get_property_as_bool("Flag").unwrap());
        assert!(matches!(
            props.get_property_as_integer("Bad"),
            Err(PropertiesError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_sync_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.chk");

        let mut props = PropertiesFile::create(&path);
        props.set_property("Last Key", "record 0007");
        props.set_property_from_integer("Num Keys", 8);
        props.sync().unwrap();

        let reopened = PropertiesFile::open(&path).unwrap();
        assert_eq!(reopened.get_property("Last Key").unwrap(), "record 0007");
        assert_eq!(reopened.get_property_as_integer("Num Keys").unwrap(), 8);
        assert!(!dir.path().join("state.chk.tmp").exists());
    }

    #[test]
    fn test_remove_property() {
        let mut props = PropertiesFile::new();
        props.set_property("A", "1");
        props.remove_property("A").unwrap();
        assert!(!props.contains("A"));
        assert!(props.remove_property("A").is_err());
    }
}
