use crate::aggregate::{GroupKey, Kpis, MeetingRow, PivotTable, meeting_counts, pivot};
use crate::error::{DashboardError, Result};
use crate::loader::{LoadReport, load_file};
use crate::records::{MeetingRecord, SalesRecord};
use crate::uploads::{UploadEntry, UploadStore};

/// One loaded upload
#[derive(Debug, Clone)]
pub struct PeriodData {
    pub upload: UploadEntry,
    pub report: LoadReport,
}

impl PeriodData {
    pub fn label(&self) -> String {
        format!("{} ({})", self.upload.date.format("%d %b %Y"), self.upload.label)
    }
}

/// Which uploads to compare
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub current: Option<String>,
    pub previous: Option<String>,
}

/// The current upload and, when available, the one before it
///
/// Held in memory until the next upload or selection replaces it.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub current: PeriodData,
    pub previous: Option<PeriodData>,
}

fn load_entry(store: &UploadStore, upload: UploadEntry) -> Result<PeriodData> {
    let report = load_file(store.path_of(&upload))?;
    Ok(PeriodData { upload, report })
}

impl Dataset {
    /// Loads the selected uploads
    ///
    /// Without an explicit choice the newest upload is Current and the
    /// next older one is Previous.
    ///
    /// # Errors
    /// * `NoDataset` if nothing has been uploaded yet
    /// * any loader error for the current file; a broken previous file is
    ///   reported as a warning and the comparison is dropped
    pub fn load(store: &UploadStore, selection: &Selection) -> Result<Self> {
        let uploads = store.list()?;

        let current_entry = match &selection.current {
            Some(name) => store.find(name)?,
            None => uploads.first().cloned().ok_or(DashboardError::NoDataset)?,
        };

        let previous_entry = match &selection.previous {
            Some(name) if name.is_empty() => None,
            Some(name) => Some(store.find(name)?),
            None => uploads
                .iter()
                .skip_while(|entry| entry.file_name != current_entry.file_name)
                .nth(1)
                .cloned(),
        };

        let mut current = load_entry(store, current_entry)?;
        let previous = match previous_entry {
            Some(entry) if entry.file_name == current.upload.file_name => None,
            Some(entry) => {
                let name = entry.file_name.clone();
                match load_entry(store, entry) {
                    Ok(data) => Some(data),
                    Err(e) => {
                        log::warn!("could not load previous period {}: {}", name, e);
                        current
                            .report
                            .warnings
                            .push(format!("Previous period {name} could not be loaded: {e}"));
                        None
                    }
                }
            }
            None => None,
        };

        Ok(Self { current, previous })
    }

    pub fn current_sales(&self) -> &[SalesRecord] {
        &self.current.report.sales
    }

    pub fn previous_sales(&self) -> &[SalesRecord] {
        self.previous
            .as_ref()
            .map(|p| p.report.sales.as_slice())
            .unwrap_or_default()
    }

    pub fn current_meetings(&self) -> &[MeetingRecord] {
        &self.current.report.meetings
    }

    pub fn previous_meetings(&self) -> &[MeetingRecord] {
        self.previous
            .as_ref()
            .map(|p| p.report.meetings.as_slice())
            .unwrap_or_default()
    }

    pub fn pivot(&self, keys: &[GroupKey]) -> PivotTable {
        pivot(self.current_sales(), self.previous_sales(), keys)
    }

    pub fn kpis(&self) -> (Kpis, Kpis) {
        (
            Kpis::compute(self.current_sales()),
            Kpis::compute(self.previous_sales()),
        )
    }

    pub fn meetings(&self, keys: &[GroupKey]) -> Result<Vec<MeetingRow>> {
        meeting_counts(self.current_meetings(), self.previous_meetings(), keys)
    }

    /// Loader warnings of both periods
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = self.current.report.warnings.clone();
        if let Some(previous) = &self.previous {
            warnings.extend(
                previous
                    .report
                    .warnings
                    .iter()
                    .map(|w| format!("Previous period: {w}")),
            );
        }
        warnings
    }

    pub fn selection(&self) -> Selection {
        Selection {
            current: Some(self.current.upload.file_name.clone()),
            previous: self.previous.as_ref().map(|p| p.upload.file_name.clone()),
        }
    }
}
