use chrono::{Datelike, Duration, NaiveDate};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref AMOUNT_NOISE: Regex = Regex::new(r"[\s,$€£₹]|USD|EUR|GBP|INR").unwrap();
    static ref PERCENT_REGEX: Regex = Regex::new(r"^\s*([+-]?[0-9]*\.?[0-9]+)\s*(%?)\s*$").unwrap();
}

/// Label used for records whose categorical field is blank
pub const UNASSIGNED: &str = "Unassigned";

/// Week label for records without an expected close date
pub const UNSCHEDULED: &str = "Unscheduled";

/// Pipeline category a sales record contributes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineStatus {
    Committed,
    Upside,
    ClosedWon,
    ClosedLost,
    Open,
}

impl PipelineStatus {
    /// Classifies a free-text status or stage, case-insensitively
    ///
    /// "Committed for the Month" and "commit" are both `Committed`; anything
    /// that is not recognised stays `Open`.
    pub fn classify(text: &str) -> Self {
        let text = text.to_lowercase();
        if text.contains("commit") {
            PipelineStatus::Committed
        } else if text.contains("upside") {
            PipelineStatus::Upside
        } else if text.contains("won") {
            PipelineStatus::ClosedWon
        } else if text.contains("lost") {
            PipelineStatus::ClosedLost
        } else {
            PipelineStatus::Open
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PipelineStatus::Committed => "Committed",
            PipelineStatus::Upside => "Upside",
            PipelineStatus::ClosedWon => "Closed Won",
            PipelineStatus::ClosedLost => "Closed Lost",
            PipelineStatus::Open => "Open",
        }
    }
}

/// One opportunity row from the sales worksheet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalesRecord {
    pub owner: String,
    pub team: String,
    pub practice: String,
    pub function: String,
    pub sales_stage: String,
    pub status: PipelineStatus,
    pub amount: f64,

    /// Win probability as a fraction between 0 and 1
    pub probability: f64,
    pub expected_close_date: Option<NaiveDate>,
}

impl SalesRecord {
    /// Amount weighted by win probability
    pub fn weighted_amount(&self) -> f64 {
        self.amount * self.probability
    }

    /// ISO week of the expected close date, e.g. `2024-W05`
    pub fn close_week(&self) -> String {
        week_label(self.expected_close_date)
    }
}

/// One row from the meetings worksheet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeetingRecord {
    pub owner: String,
    pub team: String,
    pub meeting_date: Option<NaiveDate>,
    pub meeting_type: String,
    pub client: String,
}

impl MeetingRecord {
    pub fn week(&self) -> String {
        week_label(self.meeting_date)
    }
}

pub fn week_label(date: Option<NaiveDate>) -> String {
    match date {
        Some(d) => {
            let iso = d.iso_week();
            format!("{}-W{:02}", iso.year(), iso.week())
        }
        None => UNSCHEDULED.to_string(),
    }
}

/// Trims a categorical value, substituting [`UNASSIGNED`] for blanks
pub fn category(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        UNASSIGNED.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Parses a money amount
///
/// Currency symbols, codes, whitespace and thousands separators are
/// ignored and `(1,200)` is negative. Blank input is `Some(0.0)`; text
/// that is not a number is `None`.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "-" {
        return Some(0.0);
    }

    let (negative, body) = match trimmed.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        Some(inner) => (true, inner),
        None => (false, trimmed),
    };

    let cleaned = AMOUNT_NOISE.replace_all(body, "");
    let value: f64 = cleaned.parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(if negative { -value } else { value })
}

/// Parses a probability into a fraction
///
/// Accepts `40%`, `40` and `0.4`. Values above 1 without a percent sign
/// are read as percentages. Blank input is `Some(0.0)`.
pub fn parse_percentage(raw: &str) -> Option<f64> {
    if raw.trim().is_empty() {
        return Some(0.0);
    }
    let caps = PERCENT_REGEX.captures(raw)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let has_sign = caps.get(2).is_some_and(|m| !m.as_str().is_empty());
    Some(normalize_fraction(value, has_sign))
}

/// Normalizes a numeric probability cell into a fraction
pub fn normalize_fraction(value: f64, is_percent: bool) -> f64 {
    if is_percent || value > 1.0 {
        value / 100.0
    } else {
        value
    }
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%d-%b-%Y", "%d %b %Y", "%Y/%m/%d"];

/// Parses a date written as text
///
/// Day-first is preferred for slash dates. A trailing time component
/// (`2024-03-01 00:00:00` or `2024-03-01T00:00:00`) is ignored, and a bare
/// number is taken as an Excel serial date.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let date_part = trimmed
        .split(['T', ' '])
        .next()
        .unwrap_or(trimmed);

    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(date_part, format) {
            return Some(date);
        }
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Some(date);
        }
    }

    trimmed.parse::<f64>().ok().and_then(excel_serial_to_date)
}

/// Converts an Excel serial day number (1900 date system) into a date
pub fn excel_serial_to_date(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() || serial < 1.0 || serial > 2_958_465.0 {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    epoch.checked_add_signed(Duration::days(serial.trunc() as i64))
}
