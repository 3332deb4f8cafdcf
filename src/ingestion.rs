use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::LookupOutcome;
use crate::errors::{AppError, AppResult};

const UTF8_BOM: &str = "\u{feff}";

/// One input row. Coordinates are filled in by the lookup step and nothing
/// else; the record itself is never removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub original: String,
    pub normalized: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl AddressRecord {
    pub fn new(original: impl Into<String>, normalized: impl Into<String>) -> Self {
        Self {
            original: original.into(),
            normalized: normalized.into(),
            latitude: None,
            longitude: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }

    /// `"lat,lon"` for resolved records.
    pub fn coordinates(&self) -> Option<String> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some(format!(
                "{},{}",
                format_coordinate(lat),
                format_coordinate(lon)
            )),
            _ => None,
        }
    }

    pub fn apply(&mut self, outcome: LookupOutcome) {
        match outcome {
            LookupOutcome::Resolved {
                latitude,
                longitude,
            } => {
                self.latitude = Some(latitude);
                self.longitude = Some(longitude);
            }
            LookupOutcome::Failed => {
                self.latitude = None;
                self.longitude = None;
            }
        }
    }
}

/// Renders a coordinate the way it round-trips, always with a decimal point.
pub fn format_coordinate(value: f64) -> String {
    format!("{value:?}")
}

/// Where raw addresses come from.
pub trait AddressSource {
    fn describe(&self) -> String;

    fn load(&self) -> AppResult<Vec<String>>;
}

impl AddressSource for Vec<String> {
    fn describe(&self) -> String {
        format!("{} in-memory addresses", self.len())
    }

    fn load(&self) -> AppResult<Vec<String>> {
        Ok(self.clone())
    }
}

#[derive(Debug, Clone)]
pub struct CsvAddressSource {
    path: PathBuf,
    column: String,
}

impl CsvAddressSource {
    pub fn new(path: impl Into<PathBuf>, column: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            column: column.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AddressSource for CsvAddressSource {
    fn describe(&self) -> String {
        format!("{} (column {:?})", self.path.display(), self.column)
    }

    fn load(&self) -> AppResult<Vec<String>> {
        let bytes = fs::read(&self.path).map_err(|err| {
            AppError::Input(format!("cannot read {}: {err}", self.path.display()))
        })?;
        let text = decode_with_fallback(bytes);
        let addresses = parse_addresses(&text, &self.column)?;
        info!(
            target: "ingestion",
            path = %self.path.display(),
            rows = addresses.len(),
            "addresses loaded"
        );
        Ok(addresses)
    }
}

/// UTF-8 first; anything that is not valid UTF-8 is read as Latin-1, where
/// every byte maps to the code point of the same value.
pub fn decode_with_fallback(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => match text.strip_prefix(UTF8_BOM) {
            Some(stripped) => stripped.to_string(),
            None => text,
        },
        Err(err) => {
            warn!(
                target: "ingestion",
                error = %err.utf8_error(),
                "input is not valid UTF-8; decoding as Latin-1"
            );
            err.into_bytes().into_iter().map(char::from).collect()
        }
    }
}

pub fn parse_addresses(text: &str, column: &str) -> AppResult<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = reader.headers()?.clone();
    let index = headers
        .iter()
        .position(|header| header.trim() == column)
        .ok_or_else(|| {
            AppError::Input(format!(
                "column {column:?} not found; available columns: {}",
                headers.iter().collect::<Vec<_>>().join(", ")
            ))
        })?;

    let mut addresses = Vec::new();
    for record in reader.records() {
        let record = record?;
        let value = record.get(index).unwrap_or_default();
        addresses.push(value.trim_matches('"').to_string());
    }
    Ok(addresses)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn reads_configured_column() {
        let text = "Order,Shipping Address\n1,\"Point 192 - Nasr City, Cairo\"\n2,\"\"\"Maadi\"\"\"\n3\n";
        let rows = parse_addresses(text, "Shipping Address").unwrap();
        assert_eq!(rows, vec!["Point 192 - Nasr City, Cairo", "Maadi", ""]);
    }

    #[test]
    fn missing_column_is_an_input_error() {
        let err = parse_addresses("Order,City\n1,Cairo\n", "Shipping Address").unwrap_err();
        assert!(matches!(err, AppError::Input(_)));
        assert!(err.to_string().contains("City"));
    }

    #[test]
    fn falls_back_to_latin1() {
        let mut bytes = b"Shipping Address\n\"Caf".to_vec();
        bytes.push(0xE9);
        bytes.extend_from_slice(b" Riche, Cairo\"\n");
        let text = decode_with_fallback(bytes);
        let rows = parse_addresses(&text, "Shipping Address").unwrap();
        assert_eq!(rows, vec!["Café Riche, Cairo"]);
    }

    #[test]
    fn strips_utf8_bom() {
        let text = decode_with_fallback("\u{feff}Shipping Address\nGiza\n".as_bytes().to_vec());
        assert_eq!(parse_addresses(&text, "Shipping Address").unwrap(), vec!["Giza"]);
    }

    #[test]
    fn missing_file_is_an_input_error() {
        let dir = tempdir().unwrap();
        let source = CsvAddressSource::new(dir.path().join("absent.csv"), "Shipping Address");
        assert!(matches!(source.load(), Err(AppError::Input(_))));
    }

    #[test]
    fn formats_resolved_coordinates() {
        let mut record = AddressRecord::new("A, city", "A");
        assert!(record.coordinates().is_none());
        record.apply(LookupOutcome::Resolved {
            latitude: 1.0,
            longitude: 2.5,
        });
        assert!(record.is_resolved());
        assert_eq!(record.coordinates().as_deref(), Some("1.0,2.5"));
        record.apply(LookupOutcome::Failed);
        assert!(!record.is_resolved());
    }
}
