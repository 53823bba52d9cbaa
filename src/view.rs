//! Page rendering
//!
//! Every page is a handlebars template compiled into the binary. Numbers
//! are formatted here, before rendering, so templates only place strings.

use crate::aggregate::{GroupKey, Kpis, MeetingRow, Metric, PivotTable};
use crate::error::{DashboardError, Result};
use crate::login::Session;
use crate::uploads::UploadEntry;
use handlebars::Handlebars;
use serde::Serialize;

const TEMPLATES: &[(&str, &str)] = &[
    ("header", include_str!("../templates/partials/header.hbs")),
    ("footer", include_str!("../templates/partials/footer.hbs")),
    ("table", include_str!("../templates/partials/table.hbs")),
    ("login", include_str!("../templates/login.hbs")),
    ("dashboard", include_str!("../templates/dashboard.hbs")),
    ("pivot", include_str!("../templates/pivot.hbs")),
    ("meetings", include_str!("../templates/meetings.hbs")),
    ("uploads", include_str!("../templates/uploads.hbs")),
];

const PARTIALS: &[&str] = &["header", "footer", "table"];

/// Money with thousands separators and no decimals
pub fn format_money(value: f64) -> String {
    let rounded = value.round();
    let digits = format!("{:.0}", rounded.abs());
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if rounded < 0.0 {
        format!("-{grouped}")
    } else {
        grouped
    }
}

/// Signed money, `+` for gains
pub fn format_delta(value: f64) -> String {
    let text = format_money(value);
    if value.round() > 0.0 {
        format!("+{text}")
    } else {
        text
    }
}

/// Fraction as a percentage with one decimal
pub fn format_percent(fraction: f64) -> String {
    format!("{:.1}%", fraction * 100.0)
}

fn sign_class(value: f64) -> &'static str {
    let rounded = value.round();
    if rounded > 0.0 {
        "pos"
    } else if rounded < 0.0 {
        "neg"
    } else {
        ""
    }
}

/// Login form
#[derive(Debug, Default, Serialize)]
pub struct LoginPage {
    pub error: Option<String>,
    pub notice: Option<String>,
    pub username: Option<String>,
}

/// Navigation bar, banners and title shared by the signed-in pages
#[derive(Debug, Serialize)]
pub struct Chrome {
    pub title: String,
    pub active: &'static str,
    pub username: String,
    pub is_admin: bool,
    pub warnings: Vec<String>,
    pub notice: Option<String>,
}

impl Chrome {
    pub fn new(title: &str, active: &'static str, session: &Session) -> Self {
        Self {
            title: title.to_string(),
            active,
            username: session.username.clone(),
            is_admin: session.is_admin(),
            warnings: Vec::new(),
            notice: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CellView {
    pub text: String,
    pub class: &'static str,
}

impl CellView {
    fn label(text: &str) -> Self {
        Self {
            text: text.to_string(),
            class: "",
        }
    }

    fn number(value: f64) -> Self {
        Self {
            text: format_money(value),
            class: "num",
        }
    }

    fn delta(value: f64) -> Self {
        Self {
            text: format_delta(value),
            class: match sign_class(value) {
                "pos" => "num pos",
                "neg" => "num neg",
                _ => "num",
            },
        }
    }
}

/// A rendered table: headers, body rows and an optional totals row
#[derive(Debug, Serialize)]
pub struct TableView {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<CellView>>,
    pub total: Option<Vec<CellView>>,
}

impl TableView {
    pub fn from_pivot(table: &PivotTable, metrics: &[Metric]) -> Self {
        let columns = PivotTable::columns(metrics);
        let mut headers: Vec<String> = table.key_headers().iter().map(|h| h.to_string()).collect();
        headers.extend(columns.iter().map(|c| c.header()));

        let render_row = |row: &crate::aggregate::PivotRow| -> Vec<CellView> {
            row.key
                .iter()
                .map(|k| CellView::label(k))
                .chain(columns.iter().map(|column| {
                    let value = column.value(row);
                    match column.kind {
                        crate::aggregate::ColumnKind::Delta => CellView::delta(value),
                        _ => CellView::number(value),
                    }
                }))
                .collect()
        };

        Self {
            headers,
            rows: table.rows.iter().map(&render_row).collect(),
            total: Some(render_row(&table.total)),
        }
    }

    pub fn from_meetings(rows: &[MeetingRow], keys: &[GroupKey]) -> Self {
        let mut headers: Vec<String> = keys.iter().map(|k| k.label().to_string()).collect();
        headers.extend(
            ["Meetings (Current)", "Meetings (Previous)", "Meetings (Delta)", "By Type"]
                .iter()
                .map(|h| h.to_string()),
        );

        let mut totals = (0usize, 0usize);
        let body: Vec<Vec<CellView>> = rows
            .iter()
            .map(|row| {
                totals.0 += row.current;
                totals.1 += row.previous;
                let by_type = row
                    .by_type
                    .iter()
                    .map(|(kind, count)| format!("{kind}: {count}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                row.key
                    .iter()
                    .map(|k| CellView::label(k))
                    .chain::<[CellView; 4]>([
                        CellView::number(row.current as f64),
                        CellView::number(row.previous as f64),
                        CellView::delta(row.delta() as f64),
                        CellView::label(&by_type),
                    ])
                    .collect::<Vec<CellView>>()
            })
            .collect();

        let mut total: Vec<CellView> = vec![CellView::label("Total")];
        total.extend((1..keys.len()).map(|_| CellView::label("")));
        total.extend([
            CellView::number(totals.0 as f64),
            CellView::number(totals.1 as f64),
            CellView::delta(totals.0 as f64 - totals.1 as f64),
            CellView::label(""),
        ]);

        Self {
            headers,
            rows: body,
            total: Some(total),
        }
    }
}

/// Headline figure with its comparison
#[derive(Debug, Serialize)]
pub struct KpiCard {
    pub label: &'static str,
    pub current: String,
    pub previous: Option<String>,
    pub delta: Option<String>,
    pub delta_class: &'static str,
}

/// Cards for the dashboard; comparisons are omitted without a previous period
pub fn kpi_cards(current: &Kpis, previous: Option<&Kpis>) -> Vec<KpiCard> {
    let money = |label, pick: fn(&Kpis) -> f64| {
        let now = pick(current);
        let before = previous.map(pick);
        KpiCard {
            label,
            current: format_money(now),
            previous: before.map(format_money),
            delta: before.map(|b| format_delta(now - b)),
            delta_class: before.map(|b| sign_class(now - b)).unwrap_or(""),
        }
    };

    let win_rate = {
        let before = previous.map(|p| p.win_rate);
        let change = before.map(|b| (current.win_rate - b) * 100.0);
        KpiCard {
            label: "Win Rate",
            current: format_percent(current.win_rate),
            previous: before.map(format_percent),
            delta: change.map(|c| format!("{c:+.1} pts")),
            delta_class: change.map(|c| sign_class(c * 10.0)).unwrap_or(""),
        }
    };

    vec![
        money("Pipeline", |k| k.pipeline),
        money("Weighted", |k| k.weighted),
        money("Committed", |k| k.committed),
        money("Upside", |k| k.upside),
        money("Closed Won", |k| k.closed_won),
        win_rate,
        money("Avg Deal Size", |k| k.average_deal_size),
        money("Deals", |k| k.deals as f64),
    ]
}

/// Entry of a `<select>`
#[derive(Debug, Serialize)]
pub struct OptionView {
    pub value: String,
    pub label: String,
    pub selected: bool,
}

pub fn key_options(selected: &[GroupKey], available: &[GroupKey]) -> Vec<OptionView> {
    available
        .iter()
        .map(|key| OptionView {
            value: key.slug().to_string(),
            label: key.label().to_string(),
            selected: selected.contains(key),
        })
        .collect()
}

pub fn metric_options(selected: Metric) -> Vec<OptionView> {
    Metric::ALL
        .iter()
        .map(|metric| OptionView {
            value: metric.slug().to_string(),
            label: metric.label().to_string(),
            selected: *metric == selected,
        })
        .collect()
}

/// Landing page with KPIs and the owner pivot
#[derive(Debug, Serialize)]
pub struct DashboardPage {
    pub chrome: Chrome,
    pub has_data: bool,
    pub current_label: Option<String>,
    pub previous_label: Option<String>,
    pub kpis: Vec<KpiCard>,
    pub table: Option<TableView>,
    pub chart_url: Option<String>,
}

/// Configurable pivot page
#[derive(Debug, Serialize)]
pub struct PivotPage {
    pub chrome: Chrome,
    pub has_data: bool,
    pub keys: String,
    pub key_options: Vec<OptionView>,
    pub metric_options: Vec<OptionView>,
    pub table: Option<TableView>,
    pub chart_url: Option<String>,
    pub csv_url: Option<String>,
    pub xlsx_url: Option<String>,
}

/// Meeting counts page
#[derive(Debug, Serialize)]
pub struct MeetingsPage {
    pub chrome: Chrome,
    pub has_data: bool,
    pub keys: String,
    pub key_options: Vec<OptionView>,
    pub table: Option<TableView>,
}

#[derive(Debug, Serialize)]
pub struct UploadRow {
    pub file_name: String,
    pub date: String,
    pub label: String,
    pub size: String,
    pub is_current: bool,
    pub is_previous: bool,
}

impl UploadRow {
    pub fn new(entry: &UploadEntry, current: Option<&str>, previous: Option<&str>) -> Self {
        Self {
            file_name: entry.file_name.clone(),
            date: entry.date.format("%Y-%m-%d").to_string(),
            label: entry.label.clone(),
            size: format!("{} KB", entry.size.div_ceil(1024)),
            is_current: current == Some(entry.file_name.as_str()),
            is_previous: previous == Some(entry.file_name.as_str()),
        }
    }
}

/// Upload list and form
#[derive(Debug, Serialize)]
pub struct UploadsPage {
    pub chrome: Chrome,
    pub uploads: Vec<UploadRow>,

    /// Whether the loaded dataset compares against a previous upload
    pub has_previous: bool,
    pub today: String,
}

/// Compiled templates
pub struct Views {
    registry: Handlebars<'static>,
}

impl Views {
    pub fn new() -> Result<Self> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(false);
        for (name, source) in TEMPLATES {
            if PARTIALS.contains(name) {
                registry
                    .register_partial(name, *source)
                    .map_err(|e| DashboardError::Template(e.to_string()))?;
            } else {
                registry
                    .register_template_string(name, *source)
                    .map_err(|e| DashboardError::Template(e.to_string()))?;
            }
        }
        Ok(Self { registry })
    }

    pub fn render<T: Serialize>(&self, name: &str, data: &T) -> Result<String> {
        self.registry
            .render(name, data)
            .map_err(|e| DashboardError::Template(e.to_string()))
    }

    pub fn login(&self, page: &LoginPage) -> Result<String> {
        self.render("login", page)
    }
}

impl std::fmt::Debug for Views {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Views").finish_non_exhaustive()
    }
}
