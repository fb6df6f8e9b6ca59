//! Core domain model for the organization registry mirror.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "orgreg-core";

/// Setting name under which localized display names are stored.
pub const NAME_SETTING: &str = "name";

/// Locale used for a display name whose language is not listed in the names field.
pub const NO_LOCALE: &str = "none";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("csv header has no column `{column}` for logical field `{field}`")]
    MissingColumn { field: &'static str, column: String },
    #[error("invalid row range {start}-{end}")]
    InvalidRange { start: u64, end: u64 },
}

/// Canonical registry row, unique by `identifier`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub identifier: String,
    pub display_locale: Option<String>,
    pub is_active: bool,
    pub search_phrase: String,
}

/// Localized attribute of an entry, unique by `(identifier, locale, setting_name)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegistryEntrySetting {
    pub identifier: String,
    pub locale: String,
    pub setting_name: String,
    pub setting_value: String,
}

/// One row of a per-invocation staging table: the entry columns repeated for
/// every localized setting parsed from the source row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingRow {
    pub identifier: String,
    pub display_locale: Option<String>,
    pub is_active: bool,
    pub search_phrase: String,
    pub locale: String,
    pub setting_name: String,
    pub setting_value: String,
}

impl StagingRow {
    pub fn entry(&self) -> RegistryEntry {
        RegistryEntry {
            identifier: self.identifier.clone(),
            display_locale: self.display_locale.clone(),
            is_active: self.is_active,
            search_phrase: self.search_phrase.clone(),
        }
    }
}

/// Logical field name -> CSV column name mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMap {
    #[serde(default = "ColumnMap::default_identifier")]
    pub identifier: String,
    #[serde(default = "ColumnMap::default_display_name")]
    pub display_name: String,
    #[serde(default = "ColumnMap::default_names")]
    pub names: String,
    #[serde(default = "ColumnMap::default_display_locale")]
    pub display_locale: String,
    #[serde(default = "ColumnMap::default_status")]
    pub status: String,
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self {
            identifier: Self::default_identifier(),
            display_name: Self::default_display_name(),
            names: Self::default_names(),
            display_locale: Self::default_display_locale(),
            status: Self::default_status(),
        }
    }
}

impl ColumnMap {
    fn default_identifier() -> String {
        "id".to_string()
    }

    fn default_display_name() -> String {
        "name".to_string()
    }

    fn default_names() -> String {
        "names".to_string()
    }

    fn default_display_locale() -> String {
        "locale".to_string()
    }

    fn default_status() -> String {
        "status".to_string()
    }

    /// Resolve every logical column to its position in `header`.
    pub fn resolve<'a>(
        &self,
        header: impl IntoIterator<Item = &'a str>,
    ) -> Result<ResolvedColumns, CoreError> {
        let header: Vec<String> = header
            .into_iter()
            .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
            .collect();
        let find = |field: &'static str, column: &str| {
            header
                .iter()
                .position(|h| h == column)
                .ok_or_else(|| CoreError::MissingColumn {
                    field,
                    column: column.to_string(),
                })
        };

        Ok(ResolvedColumns {
            identifier: find("identifier", &self.identifier)?,
            display_name: find("display_name", &self.display_name)?,
            names: find("names", &self.names)?,
            display_locale: find("display_locale", &self.display_locale)?,
            status: find("status", &self.status)?,
        })
    }
}

/// Column positions for one CSV header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedColumns {
    pub identifier: usize,
    pub display_name: usize,
    pub names: usize,
    pub display_locale: usize,
    pub status: usize,
}

impl ResolvedColumns {
    /// Derive a parsed row from a record accessor. Rows with a blank identifier yield `None`.
    pub fn derive<'a>(&self, field: impl Fn(usize) -> Option<&'a str>) -> Option<ParsedRow> {
        let text = |idx: usize| field(idx).map(str::trim).unwrap_or_default();

        let identifier = text(self.identifier);
        if identifier.is_empty() {
            return None;
        }

        let display_locale = Some(text(self.display_locale))
            .filter(|l| !l.is_empty())
            .map(str::to_string);
        let display_name = text(self.display_name);
        let is_active = text(self.status).eq_ignore_ascii_case("active");

        let mut names = parse_names(text(self.names));
        let has_display_locale = display_locale
            .as_deref()
            .is_some_and(|locale| names.contains_key(locale));
        if !has_display_locale && !display_name.is_empty() {
            names
                .entry(NO_LOCALE.to_string())
                .or_insert_with(|| display_name.to_string());
        }

        let search_phrase = search_phrase(identifier, names.values().map(String::as_str));

        Some(ParsedRow {
            entry: RegistryEntry {
                identifier: identifier.to_string(),
                display_locale,
                is_active,
                search_phrase,
            },
            names,
        })
    }
}

/// An entry plus its locale -> name dictionary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRow {
    pub entry: RegistryEntry,
    pub names: BTreeMap<String, String>,
}

impl ParsedRow {
    pub fn staging_rows(&self) -> Vec<StagingRow> {
        self.names
            .iter()
            .map(|(locale, name)| StagingRow {
                identifier: self.entry.identifier.clone(),
                display_locale: self.entry.display_locale.clone(),
                is_active: self.entry.is_active,
                search_phrase: self.entry.search_phrase.clone(),
                locale: locale.clone(),
                setting_name: NAME_SETTING.to_string(),
                setting_value: name.clone(),
            })
            .collect()
    }
}

/// Parse `type:value` pairs separated by `;`. The first occurrence of a type wins.
pub fn parse_names(field: &str) -> BTreeMap<String, String> {
    let mut names = BTreeMap::new();
    for entry in field.split(';') {
        let Some((locale, value)) = entry.split_once(':') else {
            continue;
        };
        let locale = locale.trim();
        let value = value.trim();
        if locale.is_empty() || value.is_empty() {
            continue;
        }
        names
            .entry(locale.to_string())
            .or_insert_with(|| value.to_string());
    }
    names
}

/// Identifier followed by every distinct known name, space separated.
pub fn search_phrase<'a>(identifier: &str, names: impl IntoIterator<Item = &'a str>) -> String {
    let mut parts: Vec<&str> = vec![identifier];
    for name in names {
        if !parts.contains(&name) {
            parts.push(name);
        }
    }
    parts.join(" ")
}

/// Inclusive range of 1-based data row numbers (the header is row 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowRange {
    pub start: u64,
    pub end: u64,
}

impl RowRange {
    pub fn new(start: u64, end: u64) -> Result<Self, CoreError> {
        if start == 0 || end < start {
            return Err(CoreError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, row: u64) -> bool {
        row >= self.start && row <= self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Split rows `1..=total_rows` into disjoint ranges of at most `batch_rows` rows.
    pub fn partition(total_rows: u64, batch_rows: u64) -> Vec<RowRange> {
        let batch_rows = batch_rows.max(1);
        let mut ranges = Vec::new();
        let mut start = 1;
        while start <= total_rows {
            let end = (start + batch_rows - 1).min(total_rows);
            ranges.push(RowRange { start, end });
            start = end + 1;
        }
        ranges
    }
}

impl std::fmt::Display for RowRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}
