//! The assembled OCR report, and its text rendering.

use std::fmt;

use schemars::JsonSchema;

use crate::{engines::BackendId, prelude::*};

/// What one backend produced for one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BackendOutcome {
    /// The backend ran. `text` is empty if it found nothing.
    Recognized { text: String },
    /// The backend failed on this page, and the run kept going.
    Failed { error: String },
}

impl fmt::Display for BackendOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendOutcome::Recognized { text } => f.write_str(text),
            BackendOutcome::Failed { error } => write!(f, "[recognition failed: {}]", error),
        }
    }
}

/// Results for a single page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PageReport {
    /// 1-based page number.
    pub page: usize,
    /// Output of the handwriting model.
    pub handwriting: BackendOutcome,
    /// Output of the printed-text model.
    pub printed: BackendOutcome,
}

impl PageReport {
    /// Look up the outcome for one backend.
    pub fn outcome(&self, backend: BackendId) -> &BackendOutcome {
        match backend {
            BackendId::Handwriting => &self.handwriting,
            BackendId::Printed => &self.printed,
        }
    }
}

/// The full report for one upload. Immutable once assembled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Report {
    /// Did the upload have pages? If so, each section gets a page header.
    pub paged: bool,
    /// One entry per page, in document order.
    pub pages: Vec<PageReport>,
    /// Problems that didn't stop the run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl Report {
    /// Does any entry carry a failure marker?
    pub fn has_failures(&self) -> bool {
        self.pages.iter().any(|page| {
            BackendId::ALL
                .iter()
                .any(|&b| matches!(page.outcome(b), BackendOutcome::Failed { .. }))
        })
    }
}

/// Render the report as plain text:
///
/// ```text
/// --- Page 1 ---
/// Handwritten OCR:
/// ...
///
/// Typed OCR:
/// ...
/// ```
///
/// The page header is left out for uploads without pages.
impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, page) in self.pages.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            if self.paged {
                writeln!(f, "--- Page {} ---", page.page)?;
            }
            writeln!(f, "Handwritten OCR:")?;
            writeln!(f, "{}", page.handwriting)?;
            writeln!(f)?;
            writeln!(f, "Typed OCR:")?;
            writeln!(f, "{}", page.printed)?;
        }
        if !self.warnings.is_empty() {
            writeln!(f)?;
            for warning in &self.warnings {
                writeln!(f, "Warning: {}", warning)?;
            }
        }
        Ok(())
    }
}
