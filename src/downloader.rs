#![cfg(not(tarpaulin_include))]

use crate::aggregate::{Metric, PivotColumn, PivotRow, PivotTable};
use crate::error::{DashboardError, Result};

/// Header row of an exported pivot: key labels, then one column per
/// metric and period
fn export_headers(table: &PivotTable, columns: &[PivotColumn]) -> Vec<String> {
    table
        .key_headers()
        .into_iter()
        .map(str::to_string)
        .chain(columns.iter().map(|c| c.header()))
        .collect()
}

fn export_rows(table: &PivotTable) -> impl Iterator<Item = &PivotRow> {
    table.rows.iter().chain(std::iter::once(&table.total))
}

/// Quotes a CSV field when it holds a comma, quote or line break
fn escape_csv(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Convert a pivot to CSV
///
/// Values are written unformatted with up to two decimals so the file
/// re-imports cleanly. The totals row comes last.
///
/// # Arguments
/// * `table` - Pivot to export
/// * `metrics` - Metrics to include, each as Current, Previous and Delta
///
/// # Returns
/// * CSV content as a string
pub fn pivot_to_csv(table: &PivotTable, metrics: &[Metric]) -> String {
    let columns = PivotTable::columns(metrics);
    let mut csv_content = String::new();

    let headers: Vec<String> = export_headers(table, &columns)
        .iter()
        .map(|h| escape_csv(h))
        .collect();
    csv_content.push_str(&headers.join(","));
    csv_content.push('\n');

    for row in export_rows(table) {
        let fields: Vec<String> = row
            .key
            .iter()
            .map(|k| escape_csv(k))
            .chain(columns.iter().map(|c| format_number(c.value(row))))
            .collect();
        csv_content.push_str(&fields.join(","));
        csv_content.push('\n');
    }

    csv_content
}

/// Shortest of the plain and two-decimal renderings
fn format_number(value: f64) -> String {
    let rounded = (value * 100.0).round() / 100.0;
    // Tiny negatives round to -0.0
    let rounded = if rounded == 0.0 { 0.0 } else { rounded };
    if rounded == rounded.trunc() {
        format!("{:.0}", rounded)
    } else {
        format!("{}", rounded)
    }
}

/// Convert a pivot to an XLSX workbook with a single `Pivot` sheet
///
/// Headers and the totals row are bold; numbers keep full precision with a
/// thousands format.
///
/// # Errors
/// * `Export` if the workbook cannot be written
pub fn pivot_to_xlsx(table: &PivotTable, metrics: &[Metric]) -> Result<Vec<u8>> {
    use rust_xlsxwriter::{Format, Workbook};

    let columns = PivotTable::columns(metrics);
    let to_export = |e: rust_xlsxwriter::XlsxError| DashboardError::Export(e.to_string());

    let plain = Format::new();
    let bold = Format::new().set_bold();
    let number = Format::new().set_num_format("#,##0.00");
    let bold_number = Format::new().set_bold().set_num_format("#,##0.00");

    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name("Pivot").map_err(to_export)?;

    for (c, header) in export_headers(table, &columns).iter().enumerate() {
        worksheet
            .write_string_with_format(0, c as u16, header, &bold)
            .map_err(to_export)?;
    }

    let total_row = table.rows.len();
    for (r, row) in export_rows(table).enumerate() {
        let (text_format, number_format) = if r == total_row {
            (&bold, &bold_number)
        } else {
            (&plain, &number)
        };
        let excel_row = (r + 1) as u32;
        for (c, key) in row.key.iter().enumerate() {
            worksheet
                .write_string_with_format(excel_row, c as u16, key, text_format)
                .map_err(to_export)?;
        }
        for (c, column) in columns.iter().enumerate() {
            worksheet
                .write_number_with_format(
                    excel_row,
                    (row.key.len() + c) as u16,
                    column.value(row),
                    number_format,
                )
                .map_err(to_export)?;
        }
    }

    worksheet.set_freeze_panes(1, 0).map_err(to_export)?;
    workbook.save_to_buffer().map_err(to_export)
}
