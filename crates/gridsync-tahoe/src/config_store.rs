//! Accessor for the node's `tahoe.cfg`
//!
//! The file is INI-style: `[section]` headers followed by `key = value`
//! lines. Reads go to disk every time so that changes made by the daemon are
//! observed; writes rewrite the file in place and keep unrelated lines.

use crate::error::Result;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Value of `option` in `section`, or `None` if either is absent or the
    /// file does not exist
    pub fn get(&self, section: &str, option: &str) -> Option<String> {
        let contents = fs::read_to_string(&self.path).ok()?;
        let mut current: Option<&str> = None;
        for line in contents.lines() {
            if let Some(name) = section_header(line) {
                current = Some(name);
                continue;
            }
            if current != Some(section) {
                continue;
            }
            if let Some((key, value)) = key_value(line) {
                if key == option {
                    return Some(value.to_string());
                }
            }
        }
        None
    }

    /// Set `option` in `section`, creating either as needed
    pub fn set(&self, section: &str, option: &str, value: &str) -> Result<()> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let mut lines: Vec<String> = contents.lines().map(str::to_string).collect();
        let entry = format!("{} = {}", option, value);

        let mut in_section = false;
        let mut section_end: Option<usize> = None;
        let mut replaced = false;
        for (i, line) in lines.iter_mut().enumerate() {
            if let Some(name) = section_header(line) {
                if in_section {
                    break;
                }
                in_section = name == section;
                if in_section {
                    section_end = Some(i + 1);
                }
                continue;
            }
            if !in_section {
                continue;
            }
            if let Some((key, _)) = key_value(line) {
                if key == option {
                    *line = entry.clone();
                    replaced = true;
                    break;
                }
            }
            if !line.trim().is_empty() {
                section_end = Some(i + 1);
            }
        }

        if !replaced {
            match section_end {
                Some(idx) => lines.insert(idx, entry),
                None => {
                    if lines.last().is_some_and(|l| !l.trim().is_empty()) {
                        lines.push(String::new());
                    }
                    lines.push(format!("[{}]", section));
                    lines.push(entry);
                }
            }
        }

        let mut output = lines.join("\n");
        output.push('\n');
        fs::write(&self.path, output)?;
        debug!(path = %self.path.display(), section, option, "Updated config");
        Ok(())
    }
}

fn section_header(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .map(str::trim)
}

fn key_value(line: &str) -> Option<(&str, &str)> {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') || trimmed.starts_with(';') {
        return None;
    }
    let (key, value) = trimmed.split_once('=')?;
    Some((key.trim(), value.trim()))
}
