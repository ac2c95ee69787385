//! Typed artifact descriptors.
//!
//! Tasks never call each other; they exchange data through files. Each task
//! declares the files it reads and writes so contracts can be checked
//! without running any worker.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Whether a consumer can run without the artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Requirement {
    #[default]
    Required,
    Optional,
}

/// Expected content format of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSchema {
    /// Any bytes; only existence is checked.
    #[default]
    Any,
    /// A single JSON document.
    Json,
    /// One JSON document per non-empty line.
    Jsonl,
    Markdown,
    Text,
}

/// A declared input or output file of a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub path: PathBuf,
    #[serde(default)]
    pub schema: ArtifactSchema,
    #[serde(default)]
    pub requirement: Requirement,
}

impl ArtifactDescriptor {
    pub fn required(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            schema: ArtifactSchema::Any,
            requirement: Requirement::Required,
        }
    }

    pub fn optional(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            schema: ArtifactSchema::Any,
            requirement: Requirement::Optional,
        }
    }

    pub fn with_schema(mut self, schema: ArtifactSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn is_required(&self) -> bool {
        self.requirement == Requirement::Required
    }

    /// Resolve against the session workspace; absolute paths pass through.
    pub fn resolve(&self, workspace: &Path) -> PathBuf {
        if self.path.is_absolute() {
            self.path.clone()
        } else {
            workspace.join(&self.path)
        }
    }

    /// Check that the file exists and matches its schema.
    pub fn validate_content(&self, workspace: &Path) -> Result<()> {
        let path = self.resolve(workspace);
        if !path.is_file() {
            return Err(Error::Validation(format!(
                "artifact {} does not exist",
                path.display()
            )));
        }
        match self.schema {
            ArtifactSchema::Json => {
                let text = fs::read_to_string(&path)?;
                serde_json::from_str::<serde_json::Value>(&text)?;
            }
            ArtifactSchema::Jsonl => {
                let text = fs::read_to_string(&path)?;
                for (n, line) in text.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    serde_json::from_str::<serde_json::Value>(line).map_err(|e| {
                        Error::Validation(format!(
                            "{} line {}: {}",
                            path.display(),
                            n + 1,
                            e
                        ))
                    })?;
                }
            }
            ArtifactSchema::Markdown | ArtifactSchema::Text => {
                fs::read_to_string(&path)?;
            }
            ArtifactSchema::Any => {}
        }
        Ok(())
    }
}

/// Result of checking a task's inputs before it starts.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct InputCheck {
    /// Optional inputs that are absent; the consumer treats them as "no data".
    pub missing_optional: Vec<PathBuf>,
    /// First required input that is absent, if any.
    pub missing_required: Option<PathBuf>,
}

impl InputCheck {
    pub fn is_satisfied(&self) -> bool {
        self.missing_required.is_none()
    }
}

/// Check declared inputs against the filesystem.
pub fn check_inputs(inputs: &[ArtifactDescriptor], workspace: &Path) -> InputCheck {
    let mut check = InputCheck::default();
    for input in inputs {
        let path = input.resolve(workspace);
        if path.exists() {
            continue;
        }
        if input.is_required() {
            if check.missing_required.is_none() {
                check.missing_required = Some(path);
            }
        } else {
            check.missing_optional.push(path);
        }
    }
    check
}

/// First required output the worker failed to produce.
pub fn first_missing_output(outputs: &[ArtifactDescriptor], workspace: &Path) -> Option<PathBuf> {
    outputs
        .iter()
        .filter(|o| o.is_required())
        .map(|o| o.resolve(workspace))
        .find(|p| !p.exists())
}

/// Write a file so readers never observe partial content.
///
/// Content goes to a temp file in the same directory which is then renamed
/// over the target. Cancelled workers leave at most a stray temp file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::Validation(format!("not a file path: {}", path.display())))?
        .to_string_lossy();
    let temp_name = format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple());
    let temp_path = match parent {
        Some(parent) => parent.join(temp_name),
        None => PathBuf::from(temp_name),
    };
    fs::write(&temp_path, contents)?;
    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e.into());
    }
    Ok(())
}
