/*!
# Salesboard

Weekly sales pipeline and meeting dashboards built from spreadsheet uploads.

## Overview

An administrator uploads the weekly pipeline workbook (a `Sales` sheet and an
optional `Meetings` sheet, or a plain CSV). The newest upload is the Current
period and the one before it the Previous period. Signed-in users browse KPIs,
a group-by pivot comparing both periods with deltas, meeting counts, charts and
CSV/Excel exports.

## Architecture

### Data layer
- **loader**: reads CSV and workbooks (calamine), finds the header row,
  checks required columns and coerces amounts, percentages and dates
- **records**: typed sales and meeting rows plus the coercion rules
- **uploads**: date-named upload directory
- **dataset**: the Current/Previous pair picked from the uploads

### Aggregation
- **aggregate**: generic group-reduce, metric sums per group, the
  current-vs-previous pivot with totals, KPIs and meeting counts

### Access control
- **login**: JSON credential store with Argon2 hashes, sessions and the
  login handlers
- **limiter**: consecutive-failure lockout per username

### Web layer (feature `web`)
- **app**: axum router, shared state and page handlers
- **view**: handlebars templates and number formatting
- **graph**: grouped bar charts (plotters)
- **downloader**: CSV and XLSX exports of the pivot

## Configuration

Everything is read from the environment, optionally through a `.env` file;
see [`config::AppConfig`].
*/

pub mod aggregate;
pub mod config;
pub mod dataset;
pub mod error;
pub mod limiter;
pub mod loader;
pub mod login;
pub mod records;
pub mod uploads;

#[cfg(feature = "web")]
pub mod app;
#[cfg(feature = "web")]
pub mod downloader;
#[cfg(feature = "web")]
pub mod graph;
#[cfg(feature = "web")]
pub mod view;

pub use aggregate::{GroupKey, Kpis, Metric, PivotTable, group_by, meeting_counts, pivot};
pub use config::AppConfig;
pub use dataset::{Dataset, Selection};
pub use error::{DashboardError, Result};
pub use limiter::LoginLimiter;
pub use loader::{LoadReport, load_bytes, load_file};
pub use login::{AttemptOutcome, AuthGate, CredentialStore, Role};
pub use records::{MeetingRecord, PipelineStatus, SalesRecord};
pub use uploads::{UploadEntry, UploadStore};
