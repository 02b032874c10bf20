//! Command-line entry points.

pub mod check;
pub mod ocr;
pub mod schema;
