//! Container image lookup
//!
//! The table maps a lecture code to its assignments' images:
//!
//! ```json
//! { "ds": { "3": "registry/ds-a3:latest", "default": "registry/ds:latest" } }
//! ```

use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

const DEFAULT_KEY: &str = "default";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageTable {
    #[serde(flatten)]
    lectures: HashMap<String, HashMap<String, String>>,
    #[serde(skip)]
    fallback: Option<String>,
}

impl ImageTable {
    /// Loads the table from a JSON file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read image table {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Invalid image table {}", path.display()))
    }

    /// Image used when neither the assignment nor its lecture has an entry
    pub fn with_fallback(mut self, image: Option<String>) -> Self {
        self.fallback = image;
        self
    }

    /// Picks the image for an assignment
    ///
    /// Lookup order: the assignment's entry, the lecture's `default`, the
    /// table-wide fallback, then `<lecture>_<assignment>_autograde`.
    pub fn resolve(&self, lecture_code: &str, assignment_id: i64) -> String {
        let lecture = self.lectures.get(lecture_code);
        lecture
            .and_then(|images| images.get(&assignment_id.to_string()))
            .or_else(|| lecture.and_then(|images| images.get(DEFAULT_KEY)))
            .or(self.fallback.as_ref())
            .cloned()
            .unwrap_or_else(|| {
                format!("{}_{}_autograde", lecture_code, assignment_id).to_lowercase()
            })
    }
}
