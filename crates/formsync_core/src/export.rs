//! CSV export of a deduplicated set.
//!
//! The export is also the snapshot format: an apply run can load it back
//! instead of re-fetching. Header row is the identity field followed by one
//! column per tracked attribute (its label), cells hold the consent sentinel
//! or stay empty when the attribute was never submitted.

use crate::config::AttributeConfig;
use crate::dedupe::dedupe;
use crate::normalize::normalize_all;
use crate::paths::atomic_write;
use crate::types::{DedupedSet, RawEvent};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("Snapshot {path} has no '{column}' column")]
    MissingColumn { path: PathBuf, column: String },
}

pub struct SnapshotWriter<'a> {
    attributes: &'a AttributeConfig,
}

impl<'a> SnapshotWriter<'a> {
    pub fn new(attributes: &'a AttributeConfig) -> Self {
        Self { attributes }
    }

    pub fn header(&self) -> Vec<String> {
        let mut header = vec![self.attributes.identity_field.clone()];
        header.extend(
            self.attributes
                .tracked
                .iter()
                .map(|attr| attr.column_label().to_string()),
        );
        header
    }

    /// Render the set as CSV bytes.
    pub fn render(&self, set: &DedupedSet) -> Result<Vec<u8>, csv::Error> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(self.header())?;
        for entry in set.iter() {
            let mut row = Vec::with_capacity(self.attributes.tracked.len() + 1);
            row.push(entry.identity.as_str());
            for attr in &self.attributes.tracked {
                row.push(entry.attributes.get(&attr.field).map_or("", |s| s.as_str()));
            }
            writer.write_record(&row)?;
        }
        writer
            .into_inner()
            .map_err(|err| csv::Error::from(err.into_error()))
    }

    /// Write the set to `path`, replacing any previous export.
    pub fn write(&self, set: &DedupedSet, path: &Path) -> Result<usize, ExportError> {
        let bytes = self.render(set).map_err(|source| ExportError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        atomic_write(path, &bytes).map_err(|source| ExportError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Exported {} rows to {}", set.len(), path.display());
        Ok(set.len())
    }
}

pub struct SnapshotReader<'a> {
    attributes: &'a AttributeConfig,
}

impl<'a> SnapshotReader<'a> {
    pub fn new(attributes: &'a AttributeConfig) -> Self {
        Self { attributes }
    }

    /// Load a snapshot back into a deduplicated set.
    ///
    /// Rows run through the normal normalize/dedupe path, so empty
    /// identities are dropped and repeated identities keep the first row.
    pub fn read(&self, path: &Path) -> Result<DedupedSet, ExportError> {
        let csv_err = |source| ExportError::Csv {
            path: path.to_path_buf(),
            source,
        };
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(csv_err)?;

        let headers = reader.headers().map_err(csv_err)?.clone();
        let column = |name: &str| {
            headers
                .iter()
                .position(|h| h.eq_ignore_ascii_case(name))
        };

        let identity_field = self.attributes.identity_field.as_str();
        let identity_col = column(identity_field).ok_or_else(|| ExportError::MissingColumn {
            path: path.to_path_buf(),
            column: identity_field.to_string(),
        })?;
        let attribute_cols: Vec<(usize, &str)> = self
            .attributes
            .tracked
            .iter()
            .filter_map(|attr| {
                column(attr.column_label())
                    .or_else(|| column(attr.field.as_str()))
                    .map(|idx| (idx, attr.field.as_str()))
            })
            .collect();

        let mut events = Vec::new();
        for record in reader.records() {
            let record = record.map_err(csv_err)?;
            let mut event = RawEvent::new(0);
            if let Some(identity) = record.get(identity_col) {
                event = event.with_value(identity_field, identity);
            }
            for (idx, field) in &attribute_cols {
                if let Some(value) = record.get(*idx) {
                    event = event.with_value(*field, value);
                }
            }
            events.push(event);
        }

        let (usable, dropped) = normalize_all(&events, self.attributes);
        if dropped > 0 {
            debug!("Skipped {} snapshot rows without identity", dropped);
        }
        let set = dedupe(usable);
        info!("Loaded {} entries from {}", set.len(), path.display());
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackedAttribute;
    use crate::types::{ConsentState, NormalizedEvent};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn attributes() -> AttributeConfig {
        AttributeConfig {
            identity_field: "email".into(),
            tracked: vec![
                TrackedAttribute::new("terms_field").with_label("consent_terms"),
                TrackedAttribute::new("marketing_field").with_label("consent_marketing"),
            ],
            default_state: None,
        }
    }

    fn sample() -> DedupedSet {
        let mut first = BTreeMap::new();
        first.insert("terms_field".to_string(), ConsentState::Checked);
        first.insert("marketing_field".to_string(), ConsentState::NotChecked);
        let mut second = BTreeMap::new();
        second.insert("terms_field".to_string(), ConsentState::NotChecked);
        dedupe(vec![
            NormalizedEvent {
                identity: Some("a@x.com".into()),
                attributes: first,
                timestamp: 9,
            },
            NormalizedEvent {
                identity: Some("b@x.com".into()),
                attributes: second,
                timestamp: 5,
            },
        ])
    }

    #[test]
    fn test_render_has_header_and_one_row_per_identity() {
        let config = attributes();
        let bytes = SnapshotWriter::new(&config).render(&sample()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "email,consent_terms,consent_marketing");
        assert_eq!(lines[1], "a@x.com,Checked,Not Checked");
        assert_eq!(lines[2], "b@x.com,Not Checked,");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_snapshot_reloads_same_set() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("exports").join("form.csv");
        let config = attributes();
        let set = sample();

        SnapshotWriter::new(&config).write(&set, &path).unwrap();
        let loaded = SnapshotReader::new(&config).read(&path).unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.fingerprint(), set.fingerprint());
        assert_eq!(
            loaded.get(0).unwrap().attributes,
            set.get(0).unwrap().attributes
        );
    }

    #[test]
    fn test_reader_skips_blank_identities() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("upload.csv");
        std::fs::write(
            &path,
            "Email,consent_terms\n a@x.com ,Checked\n,Checked\nb@x.com,maybe\n",
        )
        .unwrap();

        let config = attributes();
        let set = SnapshotReader::new(&config).read(&path).unwrap();

        assert_eq!(set.len(), 2);
        assert_eq!(set.get(0).unwrap().identity, "a@x.com");
        assert!(set.get(1).unwrap().attributes.is_empty());
    }

    #[test]
    fn test_reader_requires_identity_column() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.csv");
        std::fs::write(&path, "name,consent_terms\nA,Checked\n").unwrap();

        let config = attributes();
        let err = SnapshotReader::new(&config).read(&path).unwrap_err();
        assert!(matches!(err, ExportError::MissingColumn { .. }));
    }
}
