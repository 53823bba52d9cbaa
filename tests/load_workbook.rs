use chrono::NaiveDate;
use rust_xlsxwriter::Workbook;
use salesboard::aggregate::{GroupKey, Metric, pivot};
use salesboard::{DashboardError, PipelineStatus, load_bytes};

const SALES_HEADER: [&str; 8] = [
    "Sales Owner",
    "Team",
    "Practice",
    "Function",
    "Sales Stage",
    "Amount",
    "Probability",
    "Expected Close Date",
];

/// Workbook with a leading summary sheet, a Meetings sheet and a Sales sheet
fn weekly_workbook() -> Vec<u8> {
    let mut workbook = Workbook::new();

    let summary = workbook.add_worksheet();
    summary.set_name("Summary").unwrap();
    summary.write_string(0, 0, "Weekly pipeline").unwrap();

    let meetings = workbook.add_worksheet();
    meetings.set_name("Meetings").unwrap();
    for (c, header) in ["Sales Owner", "Meeting Date", "Meeting Type", "Client"]
        .iter()
        .enumerate()
    {
        meetings.write_string(0, c as u16, *header).unwrap();
    }
    meetings.write_string(1, 0, "Ann").unwrap();
    meetings.write_number(1, 1, 45352.0).unwrap();
    meetings.write_string(1, 2, "Demo").unwrap();
    meetings.write_string(1, 3, "Acme").unwrap();
    meetings.write_string(2, 0, "Ann").unwrap();
    meetings.write_string(2, 1, "2024-03-04").unwrap();
    meetings.write_string(2, 2, "Intro").unwrap();

    let sales = workbook.add_worksheet();
    sales.set_name("Sales").unwrap();
    for (c, header) in SALES_HEADER.iter().enumerate() {
        sales.write_string(0, c as u16, *header).unwrap();
    }
    // Ann: native numbers, percentage text, Excel serial date
    for (c, text) in ["Ann", "East", "Cloud", "Sales", "Commit"].iter().enumerate() {
        sales.write_string(1, c as u16, *text).unwrap();
    }
    sales.write_number(1, 5, 1200.0).unwrap();
    sales.write_string(1, 6, "40%").unwrap();
    sales.write_number(1, 7, 45352.0).unwrap();
    // Bob: currency text, fraction, day-first date
    for (c, text) in ["Bob", "West", "Data", "Sales", "Closed Won"].iter().enumerate() {
        sales.write_string(2, c as u16, *text).unwrap();
    }
    sales.write_string(2, 5, "$2,500").unwrap();
    sales.write_number(2, 6, 0.9).unwrap();
    sales.write_string(2, 7, "15/03/2024").unwrap();
    // Cid: blank team, negative amount in brackets, whole-number percentage, no date
    sales.write_string(3, 0, "Cid").unwrap();
    sales.write_string(3, 2, "Data").unwrap();
    sales.write_string(3, 3, "Presales").unwrap();
    sales.write_string(3, 4, "Negotiation").unwrap();
    sales.write_string(3, 5, "(100)").unwrap();
    sales.write_number(3, 6, 75.0).unwrap();

    workbook.save_to_buffer().unwrap()
}

#[test]
fn loads_named_sheets_and_coerces_values() {
    let report = load_bytes("pipeline.xlsx", &weekly_workbook()).unwrap();
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    assert_eq!(report.sales.len(), 3);

    let ann = &report.sales[0];
    assert_eq!(ann.status, PipelineStatus::Committed);
    assert_eq!(ann.amount, 1200.0);
    assert!((ann.probability - 0.4).abs() < 1e-9);
    assert_eq!(ann.expected_close_date, NaiveDate::from_ymd_opt(2024, 3, 1));

    let bob = &report.sales[1];
    assert_eq!(bob.status, PipelineStatus::ClosedWon);
    assert_eq!(bob.amount, 2500.0);
    assert!((bob.probability - 0.9).abs() < 1e-9);
    assert_eq!(bob.expected_close_date, NaiveDate::from_ymd_opt(2024, 3, 15));

    let cid = &report.sales[2];
    assert_eq!(cid.team, "Unassigned");
    assert_eq!(cid.amount, -100.0);
    assert!((cid.probability - 0.75).abs() < 1e-9);
    assert_eq!(cid.close_week(), "Unscheduled");
    assert_eq!(cid.status, PipelineStatus::Open);

    assert_eq!(report.meetings.len(), 2);
    assert_eq!(report.meetings[0].week(), "2024-W09");
    assert_eq!(report.meetings[1].meeting_date, NaiveDate::from_ymd_opt(2024, 3, 4));
    assert_eq!(report.meetings[1].team, "Unassigned");
}

#[test]
fn pivot_of_loaded_workbook() {
    let report = load_bytes("pipeline.xlsx", &weekly_workbook()).unwrap();
    let table = pivot(&report.sales, &[], &[GroupKey::Team]);

    let teams: Vec<&str> = table.rows.iter().map(|r| r.key[0].as_str()).collect();
    assert_eq!(teams, vec!["East", "Unassigned", "West"]);
    assert_eq!(table.total.current.get(Metric::Amount), 3600.0);
    assert_eq!(table.total.current.get(Metric::Total), 3700.0);
    assert_eq!(table.total.delta(Metric::ClosedWon), 2500.0);
}

#[test]
fn reports_every_missing_column() {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name("Sales").unwrap();
    sheet.write_string(0, 0, "Sales Owner").unwrap();
    sheet.write_string(0, 1, "Amount").unwrap();
    sheet.write_string(1, 0, "Ann").unwrap();
    sheet.write_number(1, 1, 10.0).unwrap();
    let bytes = workbook.save_to_buffer().unwrap();

    match load_bytes("broken.xlsx", &bytes) {
        Err(DashboardError::MissingColumns(missing)) => assert_eq!(
            missing,
            vec![
                "Team",
                "Practice",
                "Function",
                "Sales Stage",
                "Probability",
                "Expected Close Date"
            ]
        ),
        other => panic!("expected missing columns, got {other:?}"),
    }
}

#[test]
fn broken_meetings_sheet_is_only_a_warning() {
    let mut workbook = Workbook::new();
    let sales = workbook.add_worksheet();
    sales.set_name("Sales").unwrap();
    for (c, header) in SALES_HEADER.iter().enumerate() {
        sales.write_string(0, c as u16, *header).unwrap();
    }
    sales.write_string(1, 0, "Ann").unwrap();
    sales.write_string(1, 5, "ten").unwrap();
    let meetings = workbook.add_worksheet();
    meetings.set_name("meetings").unwrap();
    meetings.write_string(0, 0, "Client").unwrap();
    meetings.write_string(1, 0, "Acme").unwrap();
    let bytes = workbook.save_to_buffer().unwrap();

    let report = load_bytes("week.xlsx", &bytes).unwrap();
    assert_eq!(report.sales.len(), 1);
    assert_eq!(report.sales[0].amount, 0.0);
    assert!(report.meetings.is_empty());
    assert_eq!(report.warnings.len(), 2, "{:?}", report.warnings);
    assert!(report.warnings.iter().any(|w| w.contains("Meeting Date")));
    assert!(report.warnings.iter().any(|w| w.contains("Amount")));
}
