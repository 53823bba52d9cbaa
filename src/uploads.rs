use crate::error::{DashboardError, Result};
use chrono::NaiveDate;
use serde::Serialize;
use std::fs::{self, create_dir_all};
use std::path::{Path, PathBuf};

/// Extensions the loader understands
pub const SUPPORTED_EXTENSIONS: &[&str] = &["xlsx", "xlsm", "xlsb", "xls", "ods", "csv"];

/// Uploaded file metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadEntry {
    /// Name of the file inside the uploads directory
    pub file_name: String,

    /// Date the upload is filed under
    pub date: NaiveDate,

    /// Sanitized name the file was uploaded with, without extension
    pub label: String,

    /// Size in bytes
    pub size: u64,
}

/// Directory of uploaded spreadsheets named `<YYYY-MM-DD>_<name>.<ext>`
#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
}

fn sanitize(stem: &str) -> String {
    let cleaned: String = stem
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_matches('_');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Splits `2024-03-01_sales.xlsx` into its date and label
fn parse_file_name(file_name: &str) -> Option<(NaiveDate, String)> {
    let (date, rest) = file_name.split_once('_')?;
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
    let label = Path::new(rest).file_stem()?.to_str()?.to_string();
    let extension = Path::new(rest).extension()?.to_str()?.to_lowercase();
    if SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
        Some((date, label))
    } else {
        None
    }
}

impl UploadStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Stores an uploaded file under `date`
    ///
    /// Uploading the same name twice on one date replaces the earlier file.
    ///
    /// # Errors
    /// * `UnsupportedFile` if the extension is not a spreadsheet format
    pub fn save(&self, original_name: &str, bytes: &[u8], date: NaiveDate) -> Result<UploadEntry> {
        // Browsers may send a full client path
        let base = original_name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(original_name);
        let path = Path::new(base);
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase())
            .filter(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
            .ok_or_else(|| DashboardError::UnsupportedFile(base.to_string()))?;
        let label = sanitize(path.file_stem().and_then(|s| s.to_str()).unwrap_or_default());

        create_dir_all(&self.dir)?;
        let file_name = format!("{}_{}.{}", date.format("%Y-%m-%d"), label, extension);
        fs::write(self.dir.join(&file_name), bytes)?;
        log::info!("stored upload {} ({} bytes)", file_name, bytes.len());

        Ok(UploadEntry {
            file_name,
            date,
            label,
            size: bytes.len() as u64,
        })
    }

    /// Lists uploads, newest date first then by name
    ///
    /// Files that do not follow the naming scheme are ignored. A missing
    /// directory is an empty list.
    pub fn list(&self) -> Result<Vec<UploadEntry>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut uploads = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some((date, label)) = parse_file_name(file_name) {
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                uploads.push(UploadEntry {
                    file_name: file_name.to_string(),
                    date,
                    label,
                    size,
                });
            }
        }

        uploads.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.file_name.cmp(&b.file_name)));
        Ok(uploads)
    }

    /// Looks up an upload by file name
    ///
    /// Only names produced by [`UploadStore::save`] resolve, so a name can
    /// never point outside the uploads directory.
    pub fn find(&self, file_name: &str) -> Result<UploadEntry> {
        self.list()?
            .into_iter()
            .find(|entry| entry.file_name == file_name)
            .ok_or_else(|| {
                DashboardError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("upload '{file_name}' not found"),
                ))
            })
    }

    pub fn path_of(&self, entry: &UploadEntry) -> PathBuf {
        self.dir.join(&entry.file_name)
    }
}
