//! Common utility types for lens modules
//!
//! Output formats shared by every command and a few table formatting helpers.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default maximum length for category histograms in tables
pub const DEFAULT_CATEGORIES_MAX_LEN: usize = 48;

/// Unified output format for all lens commands
///
/// Commands that don't support a particular format should return an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    /// Pretty table with borders (default)
    #[default]
    Table,
    /// Markdown table format
    Markdown,
    /// Compact JSON (single line per object)
    Json,
    /// Pretty-printed JSON with indentation
    JsonPretty,
    /// JSON Lines format (one JSON object per line, for streaming)
    JsonLine,
    /// Pipe-separated values with header
    Psv,
}

impl OutputFormat {
    /// Check if this is a JSON variant
    pub fn is_json(&self) -> bool {
        matches!(self, Self::Json | Self::JsonPretty | Self::JsonLine)
    }

    /// Check if this is a table variant
    pub fn is_table(&self) -> bool {
        matches!(self, Self::Table | Self::Markdown)
    }

    /// Get a list of all format names for help text
    pub fn all_names() -> &'static [&'static str] {
        &[
            "table",
            "markdown",
            "json",
            "json-pretty",
            "json-line",
            "psv",
        ]
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Table => write!(f, "table"),
            Self::Markdown => write!(f, "markdown"),
            Self::Json => write!(f, "json"),
            Self::JsonPretty => write!(f, "json-pretty"),
            Self::JsonLine => write!(f, "json-line"),
            Self::Psv => write!(f, "psv"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" | "pretty" => Ok(Self::Table),
            "markdown" | "md" => Ok(Self::Markdown),
            "json" => Ok(Self::Json),
            "json-pretty" | "jsonpretty" => Ok(Self::JsonPretty),
            "json-line" | "jsonline" | "jsonl" | "ndjson" => Ok(Self::JsonLine),
            "psv" | "pipe" => Ok(Self::Psv),
            _ => Err(format!(
                "Unknown output format '{}'. Valid formats: {}",
                s,
                Self::all_names().join(", ")
            )),
        }
    }
}

/// Truncate a string to the specified length, adding "..." if truncated
///
/// # Examples
///
/// ```
/// use hexstat::lens::utils::truncate_name;
///
/// assert_eq!(truncate_name("burglary", 20), "burglary");
/// assert_eq!(truncate_name("anti-social-behaviour=12", 20), "anti-social-behav...");
/// ```
pub fn truncate_name(name: &str, max_len: usize) -> String {
    if name.chars().count() <= max_len {
        name.to_string()
    } else {
        let truncated: String = name.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}

/// Render a category histogram as `name=count` pairs, largest first
pub fn format_categories<'a, I>(categories: I) -> String
where
    I: IntoIterator<Item = (&'a String, &'a u64)>,
{
    categories
        .into_iter()
        .sorted_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)))
        .map(|(name, count)| format!("{}={}", name, count))
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_truncate_name() {
        assert_eq!(truncate_name("Short", 20), "Short");
        assert_eq!(
            truncate_name("12345678901234567890", 20),
            "12345678901234567890"
        );
        assert_eq!(
            truncate_name("This is a very long category name", 20),
            "This is a very lo..."
        );
        assert_eq!(truncate_name("", 20), "");
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!(
            OutputFormat::from_str("table").unwrap(),
            OutputFormat::Table
        );
        assert_eq!(OutputFormat::from_str("md").unwrap(), OutputFormat::Markdown);
        assert_eq!(
            OutputFormat::from_str("JSONL").unwrap(),
            OutputFormat::JsonLine
        );
        assert!(OutputFormat::from_str("xml").is_err());
    }

    #[test]
    fn test_output_format_helpers() {
        assert!(OutputFormat::JsonPretty.is_json());
        assert!(!OutputFormat::Psv.is_json());
        assert!(OutputFormat::Markdown.is_table());
        assert_eq!(OutputFormat::JsonLine.to_string(), "json-line");
    }

    #[test]
    fn test_format_categories() {
        let mut categories = BTreeMap::new();
        categories.insert("theft".to_string(), 2u64);
        categories.insert("burglary".to_string(), 5u64);
        categories.insert("arson".to_string(), 2u64);
        assert_eq!(
            format_categories(&categories),
            "burglary=5, arson=2, theft=2"
        );
    }
}
