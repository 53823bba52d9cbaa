use crate::error::{DashboardError, Result};
use crate::records::{
    MeetingRecord, PipelineStatus, SalesRecord, category, excel_serial_to_date, normalize_fraction,
    parse_amount, parse_date, parse_percentage,
};
use calamine::{Data, Reader, open_workbook_auto_from_rs};
use chrono::NaiveDate;
use std::io::Cursor;
use std::path::Path;

/// Columns every sales worksheet must carry
pub const SALES_COLUMNS: &[&str] = &[
    "Sales Owner",
    "Team",
    "Practice",
    "Function",
    "Sales Stage",
    "Amount",
    "Probability",
    "Expected Close Date",
];

/// Optional column overriding the stage when classifying pipeline status
pub const STATUS_COLUMN: &str = "Status";

/// Columns every meetings worksheet must carry
pub const MEETING_COLUMNS: &[&str] = &["Sales Owner", "Meeting Date"];

const SALES_SHEET: &str = "Sales";
const MEETINGS_SHEET: &str = "Meetings";

static EMPTY_CELL: CellValue = CellValue::Empty;

/// A single spreadsheet cell after reading, before coercion
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Empty,
    Text(String),
    Number(f64),
    Date(NaiveDate),
    Bool(bool),
}

impl CellValue {
    fn from_text(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            CellValue::Empty
        } else {
            CellValue::Text(trimmed.to_string())
        }
    }

    fn from_data(data: &Data) -> Self {
        match data {
            Data::Int(i) => CellValue::Number(*i as f64),
            Data::Float(f) => CellValue::Number(*f),
            Data::String(s) => CellValue::from_text(s),
            Data::Bool(b) => CellValue::Bool(*b),
            Data::DateTime(dt) => match excel_serial_to_date(dt.as_f64()) {
                Some(date) => CellValue::Date(date),
                None => CellValue::Number(dt.as_f64()),
            },
            Data::DateTimeIso(s) => match parse_date(s) {
                Some(date) => CellValue::Date(date),
                None => CellValue::from_text(s),
            },
            Data::DurationIso(s) => CellValue::from_text(s),
            _ => CellValue::Empty,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }

    /// Text rendering used for categorical columns
    pub fn text(&self) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::Text(s) => s.clone(),
            CellValue::Number(n) if n.fract() == 0.0 => format!("{}", *n as i64),
            CellValue::Number(n) => n.to_string(),
            CellValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            CellValue::Bool(b) => b.to_string(),
        }
    }

    /// Money amount; blanks are zero
    pub fn as_amount(&self) -> Option<f64> {
        match self {
            CellValue::Empty => Some(0.0),
            CellValue::Number(n) => Some(*n),
            CellValue::Text(s) => parse_amount(s),
            CellValue::Date(_) | CellValue::Bool(_) => None,
        }
    }

    /// Probability as a fraction; blanks are zero
    pub fn as_fraction(&self) -> Option<f64> {
        match self {
            CellValue::Empty => Some(0.0),
            CellValue::Number(n) => Some(normalize_fraction(*n, false)),
            CellValue::Text(s) => parse_percentage(s),
            CellValue::Date(_) | CellValue::Bool(_) => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            CellValue::Date(d) => Some(*d),
            CellValue::Number(n) => excel_serial_to_date(*n),
            CellValue::Text(s) => parse_date(s),
            CellValue::Empty | CellValue::Bool(_) => None,
        }
    }
}

/// A worksheet with a header row
#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

fn normalize_header(name: &str) -> String {
    name.split(|c: char| c.is_whitespace() || c == '_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl Table {
    /// Builds a table from a raw grid
    ///
    /// The first non-empty row is the header; fully empty rows are dropped.
    ///
    /// # Errors
    /// * `EmptyDataset` if the grid has no header or no data rows
    pub fn from_grid(name: &str, grid: Vec<Vec<CellValue>>) -> Result<Self> {
        let mut rows = grid
            .into_iter()
            .filter(|row| row.iter().any(|cell| !cell.is_empty()));

        let headers: Vec<String> = match rows.next() {
            Some(header) => header.iter().map(|cell| cell.text()).collect(),
            None => return Err(DashboardError::EmptyDataset(name.to_string())),
        };

        let rows: Vec<Vec<CellValue>> = rows.collect();
        if rows.is_empty() {
            return Err(DashboardError::EmptyDataset(name.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            headers,
            rows,
        })
    }

    /// Case- and spacing-insensitive header lookup
    pub fn column_index(&self, column: &str) -> Option<usize> {
        let wanted = normalize_header(column);
        self.headers
            .iter()
            .position(|header| normalize_header(header) == wanted)
    }

    /// Resolves every required column, reporting all missing ones at once
    pub fn require_columns(&self, columns: &[&str]) -> Result<Vec<usize>> {
        let mut found = Vec::with_capacity(columns.len());
        let mut missing = Vec::new();
        for column in columns {
            match self.column_index(column) {
                Some(idx) => found.push(idx),
                None => missing.push(column.to_string()),
            }
        }

        if missing.is_empty() {
            Ok(found)
        } else {
            Err(DashboardError::MissingColumns(missing))
        }
    }

    fn cell(row: &[CellValue], idx: usize) -> &CellValue {
        row.get(idx).unwrap_or(&EMPTY_CELL)
    }
}

/// Tracks values of one column that could not be coerced
struct CoercionLog {
    column: &'static str,
    expected: &'static str,
    fallback: &'static str,
    bad: usize,
    first: Option<String>,
}

impl CoercionLog {
    fn new(column: &'static str, expected: &'static str, fallback: &'static str) -> Self {
        Self {
            column,
            expected,
            fallback,
            bad: 0,
            first: None,
        }
    }

    fn record(&mut self, cell: &CellValue) {
        self.bad += 1;
        if self.first.is_none() {
            self.first = Some(cell.text());
        }
    }

    fn flush(self, sheet: &str, warnings: &mut Vec<String>) {
        if self.bad > 0 {
            warnings.push(format!(
                "{}: {} value(s) in '{}' could not be read as {} and were treated as {} (first: '{}')",
                sheet,
                self.bad,
                self.column,
                self.expected,
                self.fallback,
                self.first.unwrap_or_default()
            ));
        }
    }
}

/// Converts a sales worksheet into records
///
/// # Errors
/// * `MissingColumns` listing every required column that is absent
pub fn sales_from_table(table: &Table, warnings: &mut Vec<String>) -> Result<Vec<SalesRecord>> {
    let cols = table.require_columns(SALES_COLUMNS)?;
    let status_col = table.column_index(STATUS_COLUMN);

    let mut amounts = CoercionLog::new("Amount", "numbers", "0");
    let mut probabilities = CoercionLog::new("Probability", "percentages", "0");
    let mut dates = CoercionLog::new("Expected Close Date", "dates", "unscheduled");

    let mut records = Vec::with_capacity(table.rows.len());
    for row in &table.rows {
        let text = |i: usize| Table::cell(row, cols[i]).text();

        let amount_cell = Table::cell(row, cols[5]);
        let amount = amount_cell.as_amount().unwrap_or_else(|| {
            amounts.record(amount_cell);
            0.0
        });

        let probability_cell = Table::cell(row, cols[6]);
        let probability = probability_cell.as_fraction().unwrap_or_else(|| {
            probabilities.record(probability_cell);
            0.0
        });

        let date_cell = Table::cell(row, cols[7]);
        let expected_close_date = date_cell.as_date();
        if expected_close_date.is_none() && !date_cell.is_empty() {
            dates.record(date_cell);
        }

        let sales_stage = text(4);
        let status_text = status_col
            .map(|idx| Table::cell(row, idx).text())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| sales_stage.clone());

        records.push(SalesRecord {
            owner: category(&text(0)),
            team: category(&text(1)),
            practice: category(&text(2)),
            function: category(&text(3)),
            sales_stage: category(&sales_stage),
            status: PipelineStatus::classify(&status_text),
            amount,
            probability,
            expected_close_date,
        });
    }

    amounts.flush(&table.name, warnings);
    probabilities.flush(&table.name, warnings);
    dates.flush(&table.name, warnings);

    Ok(records)
}

/// Converts a meetings worksheet into records
pub fn meetings_from_table(
    table: &Table,
    warnings: &mut Vec<String>,
) -> Result<Vec<MeetingRecord>> {
    let cols = table.require_columns(MEETING_COLUMNS)?;
    let team_col = table.column_index("Team");
    let type_col = table.column_index("Meeting Type");
    let client_col = table.column_index("Client");

    let mut dates = CoercionLog::new("Meeting Date", "dates", "unscheduled");
    let optional = |row: &[CellValue], idx: Option<usize>| {
        idx.map(|i| Table::cell(row, i).text()).unwrap_or_default()
    };

    let mut records = Vec::with_capacity(table.rows.len());
    for row in &table.rows {
        let date_cell = Table::cell(row, cols[1]);
        let meeting_date = date_cell.as_date();
        if meeting_date.is_none() && !date_cell.is_empty() {
            dates.record(date_cell);
        }

        records.push(MeetingRecord {
            owner: category(&Table::cell(row, cols[0]).text()),
            team: category(&optional(row, team_col)),
            meeting_date,
            meeting_type: category(&optional(row, type_col)),
            client: category(&optional(row, client_col)),
        });
    }

    dates.flush(&table.name, warnings);
    Ok(records)
}

/// Result of loading one uploaded file
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub source: String,
    pub sales: Vec<SalesRecord>,
    pub meetings: Vec<MeetingRecord>,
    pub warnings: Vec<String>,
}

/// Reads every worksheet of a file into raw grids
///
/// CSV files produce a single grid named after the file.
fn read_grids(file_name: &str, bytes: &[u8]) -> Result<Vec<(String, Vec<Vec<CellValue>>)>> {
    let extension = Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase());

    match extension.as_deref() {
        Some("csv") => {
            let text = std::str::from_utf8(bytes)
                .map_err(|_| DashboardError::Spreadsheet("CSV file is not valid UTF-8".into()))?;
            Ok(vec![(SALES_SHEET.to_string(), grid_from_csv(text)?)])
        }
        Some("xlsx") | Some("xlsm") | Some("xlsb") | Some("xls") | Some("ods") => {
            let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))?;
            let mut grids = Vec::new();
            for name in workbook.sheet_names() {
                let range = workbook.worksheet_range(&name)?;
                let grid = range
                    .rows()
                    .map(|row| row.iter().map(CellValue::from_data).collect())
                    .collect();
                grids.push((name, grid));
            }
            Ok(grids)
        }
        Some(ext) => Err(DashboardError::UnsupportedFile(format!(".{ext}"))),
        None => Err(DashboardError::UnsupportedFile("file has no extension".into())),
    }
}

/// Loads sales and meeting records from an uploaded file
///
/// Sales rows come from the `Sales` worksheet, or the first one when no
/// sheet has that name. A `Meetings` worksheet is optional; problems with
/// it are reported as warnings instead of failing the load.
///
/// # Errors
/// * `UnsupportedFile` for unknown extensions
/// * `Spreadsheet` when the file cannot be parsed
/// * `MissingColumns` / `EmptyDataset` for an unusable sales sheet
pub fn load_bytes(file_name: &str, bytes: &[u8]) -> Result<LoadReport> {
    let mut grids = read_grids(file_name, bytes)?;
    if grids.is_empty() {
        return Err(DashboardError::EmptyDataset(file_name.to_string()));
    }

    let sales_idx = grids
        .iter()
        .position(|(name, _)| name.eq_ignore_ascii_case(SALES_SHEET))
        .unwrap_or(0);
    let meetings_idx = grids
        .iter()
        .position(|(name, _)| name.eq_ignore_ascii_case(MEETINGS_SHEET))
        .filter(|idx| *idx != sales_idx);

    let mut warnings = Vec::new();

    let meetings = match meetings_idx {
        Some(idx) => {
            let (name, grid) = std::mem::take(&mut grids[idx]);
            match Table::from_grid(&name, grid)
                .and_then(|table| meetings_from_table(&table, &mut warnings))
            {
                Ok(records) => records,
                Err(e) => {
                    warnings.push(format!("{name}: {e}"));
                    Vec::new()
                }
            }
        }
        None => Vec::new(),
    };

    let (name, grid) = std::mem::take(&mut grids[sales_idx]);
    let table = Table::from_grid(&name, grid)?;
    let sales = sales_from_table(&table, &mut warnings)?;

    log::info!(
        "loaded {} sales rows and {} meetings from {} ({} warnings)",
        sales.len(),
        meetings.len(),
        file_name,
        warnings.len()
    );

    Ok(LoadReport {
        source: file_name.to_string(),
        sales,
        meetings,
        warnings,
    })
}

/// Reads a file from disk and loads it
pub fn load_file(path: impl AsRef<Path>) -> Result<LoadReport> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    load_bytes(name, &bytes)
}

/// Parses CSV text into a grid; quoted fields may span lines
fn grid_from_csv(text: &str) -> Result<Vec<Vec<CellValue>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.trim_start_matches('\u{feff}').as_bytes());

    reader
        .records()
        .map(|record| {
            let record =
                record.map_err(|e| DashboardError::Spreadsheet(format!("invalid CSV: {e}")))?;
            Ok(record.iter().map(CellValue::from_text).collect())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str =
        "Sales Owner,Team,Practice,Function,Sales Stage,Amount,Probability,Expected Close Date,Status";

    #[test]
    fn csv_rows_respect_quotes() {
        let grid = grid_from_csv("Ann,\"Data, AI\",\"He said \"\"hi\"\"\",,\r\n").unwrap();
        assert_eq!(
            grid[0],
            vec![
                CellValue::Text("Ann".into()),
                CellValue::Text("Data, AI".into()),
                CellValue::Text(r#"He said "hi""#.into()),
                CellValue::Empty,
                CellValue::Empty,
            ]
        );
    }

    #[test]
    fn quoted_line_breaks_stay_in_one_row() {
        let csv = format!(
            "{HEADER}\n\
             Ann,East,\"Acme\nCorp\",Sales,Commit,\"1,500\",50%,2024-03-01,\n\
             Bob,West,Data,Sales,Closed Won,250,100%,2024-03-01,\n"
        );
        let report = load_bytes("week.csv", csv.as_bytes()).unwrap();
        assert_eq!(report.sales.len(), 2);
        assert_eq!(report.sales[0].practice, "Acme\nCorp");
        assert_eq!(report.sales[0].amount, 1500.0);
        assert_eq!(report.sales[1].owner, "Bob");
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    }

    #[test]
    fn loads_csv_and_coerces_types() {
        let csv = format!(
            "{HEADER}\n\
             Ann,East,Cloud,Sales,Negotiation,\"$1,000\",40%,2024-03-01,Committed for the Month\n\
             Bob,West,Data,Presales,Closed Won,250,1,01/03/2024,\n\
             ,,,,,,,,\n\
             Cid,,Data,Sales,Prospecting,n/a,high,someday,Upside\n"
        );
        let report = load_bytes("week.csv", csv.as_bytes()).unwrap();
        assert_eq!(report.sales.len(), 3);

        let ann = &report.sales[0];
        assert_eq!(ann.amount, 1000.0);
        assert_eq!(ann.probability, 0.4);
        assert_eq!(ann.status, PipelineStatus::Committed);
        assert_eq!(ann.expected_close_date, NaiveDate::from_ymd_opt(2024, 3, 1));

        // Blank status falls back to the stage
        assert_eq!(report.sales[1].status, PipelineStatus::ClosedWon);
        assert_eq!(report.sales[1].probability, 1.0);

        let cid = &report.sales[2];
        assert_eq!(cid.team, crate::records::UNASSIGNED);
        assert_eq!(cid.amount, 0.0);
        assert_eq!(cid.expected_close_date, None);
        assert_eq!(report.warnings.len(), 3);
        assert!(report.warnings[0].contains("'Amount'"));
    }

    #[test]
    fn reports_every_missing_column() {
        let csv = "Sales Owner,Team,Amount\nAnn,East,10\n";
        match load_bytes("bad.csv", csv.as_bytes()) {
            Err(DashboardError::MissingColumns(missing)) => {
                assert_eq!(
                    missing,
                    vec![
                        "Practice",
                        "Function",
                        "Sales Stage",
                        "Probability",
                        "Expected Close Date"
                    ]
                );
            }
            other => panic!("expected missing columns, got {other:?}"),
        }
    }

    #[test]
    fn header_only_sheet_is_empty() {
        let err = load_bytes("empty.csv", format!("{HEADER}\n").as_bytes()).unwrap_err();
        assert!(matches!(err, DashboardError::EmptyDataset(_)));
    }

    #[test]
    fn headers_match_loosely() {
        let table = Table::from_grid(
            "t",
            vec![
                vec![CellValue::Text("sales_owner".into()), CellValue::Text(" TEAM ".into())],
                vec![CellValue::Text("Ann".into()), CellValue::Empty],
            ],
        )
        .unwrap();
        assert_eq!(table.column_index("Sales Owner"), Some(0));
        assert_eq!(table.column_index("team"), Some(1));
    }

    #[test]
    fn rejects_unknown_extensions() {
        let err = load_bytes("notes.txt", b"hello").unwrap_err();
        assert!(matches!(err, DashboardError::UnsupportedFile(_)));
    }
}
