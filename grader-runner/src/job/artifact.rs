//! The gradebook: control artifact handed to and produced by the transformation

use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};

use crate::error::ArtifactError;

/// File name of the control artifact inside input and output trees
pub const GRADEBOOK_FILE: &str = "gradebook.json";

/// Parsed result artifact of a grading run
///
/// The schema belongs to the transformation; only the aggregate `score` at
/// the top level is interpreted here.
#[derive(Debug, Clone, PartialEq)]
pub struct Gradebook {
    pub score: f64,
    pub raw: JsonValue,
}

impl Gradebook {
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(GRADEBOOK_FILE)
    }

    /// Loads the gradebook from a transformation's output directory
    pub async fn load(dir: &Path) -> Result<Self, ArtifactError> {
        let path = Self::path_in(dir);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| ArtifactError::Read {
                path: path.clone(),
                source,
            })?;

        let raw: JsonValue =
            serde_json::from_slice(&bytes).map_err(|source| ArtifactError::Parse {
                path: path.clone(),
                source,
            })?;

        let score = raw
            .get("score")
            .and_then(JsonValue::as_f64)
            .ok_or(ArtifactError::MissingScore(path))?;

        Ok(Self { score, raw })
    }
}

/// Writes `contents` as the control artifact of `dir`
pub async fn write_gradebook(dir: &Path, contents: &JsonValue) -> std::io::Result<()> {
    let bytes = serde_json::to_vec_pretty(contents)?;
    tokio::fs::write(Gradebook::path_in(dir), bytes).await
}

/// Removes the control artifact from `dir`; a missing file is not an error
pub async fn remove_gradebook(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(Gradebook::path_in(dir)).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
