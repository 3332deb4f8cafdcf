use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::FileSettings;
use crate::errors::AppResult;
use crate::ingestion::{format_coordinate, AddressRecord};
use crate::progress::RunStats;
use crate::report::format_number;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";
const LITERAL_TITLE: &str = "# Address to Coordinates Mapping";
const LITERAL_BINDING: &str = "address_coordinates";

/// Persists the current result set. Called after every batch with the full
/// record list, so each call replaces what the previous one wrote.
pub trait ResultWriter: Send + Sync {
    fn write(&self, records: &[AddressRecord], stats: &RunStats) -> AppResult<()>;
}

#[derive(Debug, Clone)]
pub struct FileResultWriter {
    table_path: PathBuf,
    json_path: PathBuf,
    literal_path: PathBuf,
    address_column: String,
}

impl FileResultWriter {
    pub fn new(
        table_path: impl Into<PathBuf>,
        json_path: impl Into<PathBuf>,
        literal_path: impl Into<PathBuf>,
        address_column: impl Into<String>,
    ) -> Self {
        Self {
            table_path: table_path.into(),
            json_path: json_path.into(),
            literal_path: literal_path.into(),
            address_column: address_column.into(),
        }
    }

    pub fn from_settings(files: &FileSettings) -> Self {
        Self::new(
            files.output_file.clone(),
            files.json_output.clone(),
            files.literal_output.clone(),
            files.address_column.clone(),
        )
    }

    pub fn table_path(&self) -> &Path {
        &self.table_path
    }

    pub fn json_path(&self) -> &Path {
        &self.json_path
    }

    pub fn literal_path(&self) -> &Path {
        &self.literal_path
    }

    fn render_table(&self, records: &[AddressRecord]) -> AppResult<Vec<u8>> {
        let mut buffer = UTF8_BOM.to_vec();
        {
            let mut writer = csv::Writer::from_writer(&mut buffer);
            writer.write_record([
                self.address_column.as_str(),
                "Cleaned_Address",
                "Latitude",
                "Longitude",
            ])?;
            for record in records {
                let latitude = record.latitude.map(format_coordinate).unwrap_or_default();
                let longitude = record.longitude.map(format_coordinate).unwrap_or_default();
                writer.write_record([
                    record.original.as_str(),
                    record.normalized.as_str(),
                    latitude.as_str(),
                    longitude.as_str(),
                ])?;
            }
            writer.flush()?;
        }
        Ok(buffer)
    }
}

impl ResultWriter for FileResultWriter {
    fn write(&self, records: &[AddressRecord], stats: &RunStats) -> AppResult<()> {
        let table = self.render_table(records)?;
        write_atomic(&self.table_path, &table)?;

        let mapping = coordinate_map(records);
        let json = serde_json::to_string_pretty(&mapping)?;
        write_atomic(&self.json_path, json.as_bytes())?;

        let literal = render_literal(&mapping, stats)?;
        write_atomic(&self.literal_path, literal.as_bytes())?;

        debug!(
            target: "output",
            rows = records.len(),
            mapped = mapping.len(),
            table = %self.table_path.display(),
            "results written"
        );
        Ok(())
    }
}

/// Original address to `"lat,lon"` for every resolved record.
pub fn coordinate_map(records: &[AddressRecord]) -> BTreeMap<String, String> {
    records
        .iter()
        .filter_map(|record| {
            record
                .coordinates()
                .map(|coords| (record.original.clone(), coords))
        })
        .collect()
}

pub fn render_literal(mapping: &BTreeMap<String, String>, stats: &RunStats) -> AppResult<String> {
    let body = serde_json::to_string_pretty(mapping)?;
    Ok(format!(
        "{LITERAL_TITLE}\n# Generated from {} addresses - {} entries - Success rate: {:.2}%\n{LITERAL_BINDING} = {body}\n",
        format_number(stats.total),
        format_number(mapping.len()),
        stats.success_rate(),
    ))
}

fn write_atomic(path: &Path, contents: &[u8]) -> AppResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".into());
    let staging = path.with_file_name(format!(".{file_name}.partial"));
    fs::write(&staging, contents)?;
    fs::rename(&staging, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn sample_records() -> Vec<AddressRecord> {
        let mut first = AddressRecord::new("A, city", "A");
        first.latitude = Some(1.0);
        first.longitude = Some(2.0);
        let second = AddressRecord::new("Point 192 - B", "B");
        vec![first, second]
    }

    fn sample_stats() -> RunStats {
        RunStats {
            total: 2,
            processed: 2,
            succeeded: 1,
            failed: 1,
            current_batch: 1,
            total_batches: 1,
        }
    }

    #[test]
    fn writes_all_three_forms() {
        let dir = tempdir().unwrap();
        let writer = FileResultWriter::new(
            dir.path().join("out.csv"),
            dir.path().join("map.json"),
            dir.path().join("map.py"),
            "Shipping Address",
        );
        writer.write(&sample_records(), &sample_stats()).unwrap();

        let table = fs::read(writer.table_path()).unwrap();
        assert!(table.starts_with(UTF8_BOM));
        let table = String::from_utf8(table[UTF8_BOM.len()..].to_vec()).unwrap();
        let mut lines = table.lines();
        assert_eq!(
            lines.next(),
            Some("Shipping Address,Cleaned_Address,Latitude,Longitude")
        );
        assert_eq!(lines.next(), Some("\"A, city\",A,1.0,2.0"));
        assert_eq!(lines.next(), Some("Point 192 - B,B,,"));

        let json: BTreeMap<String, String> =
            serde_json::from_str(&fs::read_to_string(writer.json_path()).unwrap()).unwrap();
        assert_eq!(json.len(), 1);
        assert_eq!(json.get("A, city").map(String::as_str), Some("1.0,2.0"));

        let literal = fs::read_to_string(writer.literal_path()).unwrap();
        assert!(literal.starts_with(LITERAL_TITLE));
        assert!(literal.contains("Generated from 2 addresses - 1 entries - Success rate: 50.00%"));
        assert!(literal.contains("address_coordinates = {"));
    }

    #[test]
    fn rewrites_replace_previous_output() {
        let dir = tempdir().unwrap();
        let writer = FileResultWriter::new(
            dir.path().join("nested/out.csv"),
            dir.path().join("nested/map.json"),
            dir.path().join("nested/map.py"),
            "Shipping Address",
        );
        writer.write(&sample_records(), &sample_stats()).unwrap();
        writer.write(&sample_records()[1..], &sample_stats()).unwrap();

        let json = fs::read_to_string(writer.json_path()).unwrap();
        assert_eq!(json.trim(), "{}");
        let leftovers = fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".partial"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
