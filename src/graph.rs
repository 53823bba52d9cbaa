#![cfg(not(tarpaulin_include))]
#![cfg(feature = "web")]
use crate::aggregate::{Metric, PivotTable};
use crate::error::{DashboardError, Result};
use image::{DynamicImage, ImageOutputFormat, RgbImage};
use plotters::prelude::*;
use plotters::style::text_anchor::{HPos, Pos, VPos};
use std::io::Cursor;

/// Colour of the current period's bars
const CURRENT_COLOR: RGBColor = RGBColor(31, 119, 180);

/// Colour of the previous period's bars
const PREVIOUS_COLOR: RGBColor = RGBColor(174, 199, 232);

/// Configuration options for chart generation
#[derive(Clone, Debug)]
pub struct ChartOptions {
    /// Title displayed at the top of the chart
    pub title: String,

    /// Label for the Y-axis
    pub y_label: String,

    /// Width of the chart in pixels
    pub width: u32,

    /// Height of the chart in pixels
    pub height: u32,

    /// Largest number of groups drawn; the rest are left out
    pub max_groups: usize,
}

impl Default for ChartOptions {
    fn default() -> Self {
        Self {
            title: "Pipeline".to_string(),
            y_label: "Amount".to_string(),
            width: 960,
            height: 480,
            max_groups: 12,
        }
    }
}

/// One group of bars: label, current value, previous value
#[derive(Debug, Clone, PartialEq)]
pub struct BarGroup {
    pub label: String,
    pub current: f64,
    pub previous: f64,
}

/// Picks the groups to draw, largest current value first
///
/// # Errors
/// * `EmptyDataset` if the table has no rows
pub fn bar_groups(table: &PivotTable, metric: Metric, max_groups: usize) -> Result<Vec<BarGroup>> {
    if table.rows.is_empty() {
        return Err(DashboardError::EmptyDataset("pivot table".into()));
    }

    let mut sorted = table.clone();
    sorted.sort_by_metric(metric);
    Ok(sorted
        .rows
        .iter()
        .take(max_groups.max(1))
        .map(|row| BarGroup {
            label: row.key.join(" / "),
            current: row.current.get(metric),
            previous: row.previous.get(metric),
        })
        .collect())
}

/// Value range of the Y-axis, always including zero
fn y_bounds(groups: &[BarGroup]) -> (f64, f64) {
    let values = groups.iter().flat_map(|g| [g.current, g.previous]);
    let (min, max) = values.fold((0.0_f64, 0.0_f64), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if min == max {
        (0.0, 1.0)
    } else {
        let pad = (max - min) * 0.05;
        (if min < 0.0 { min - pad } else { 0.0 }, max + pad)
    }
}

/// Renders a grouped bar chart of one pivot metric as PNG
///
/// Each group gets a current and a previous bar side by side.
///
/// # Arguments
/// * `table` - Pivot to draw
/// * `metric` - Metric whose current and previous values are compared
/// * `options` - Size and labels
///
/// # Errors
/// * `EmptyDataset` if the table has no rows
/// * `Chart` if drawing or PNG encoding fails
pub fn render_pivot_chart(
    table: &PivotTable,
    metric: Metric,
    options: &ChartOptions,
) -> Result<Vec<u8>> {
    let groups = bar_groups(table, metric, options.max_groups)?;

    let mut pixels = vec![0u8; (options.width * options.height * 3) as usize];
    draw_bars(&mut pixels, &groups, metric, options)
        .map_err(|e| DashboardError::Chart(e.to_string()))?;

    let image = RgbImage::from_raw(options.width, options.height, pixels)
        .ok_or_else(|| DashboardError::Chart("pixel buffer has the wrong size".into()))?;
    let mut png = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut png, ImageOutputFormat::Png)
        .map_err(|e| DashboardError::Chart(e.to_string()))?;
    Ok(png.into_inner())
}

fn draw_bars(
    pixels: &mut [u8],
    groups: &[BarGroup],
    metric: Metric,
    options: &ChartOptions,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let root = BitMapBackend::with_buffer(pixels, (options.width, options.height))
        .into_drawing_area();
    root.fill(&WHITE)?;

    let (y_min, y_max) = y_bounds(groups);
    let mut chart = ChartBuilder::on(&root)
        .caption(&options.title, ("sans-serif", 24).into_font())
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(70)
        .build_cartesian_2d(0f64..groups.len() as f64, y_min..y_max)?;

    chart
        .configure_mesh()
        .disable_x_mesh()
        .x_labels(0)
        .x_label_formatter(&|_| String::new())
        .y_desc(&options.y_label)
        .y_label_formatter(&|v| crate::view::format_money(*v))
        .draw()?;

    chart
        .draw_series(groups.iter().enumerate().map(|(i, g)| {
            let x = i as f64;
            Rectangle::new([(x + 0.1, 0.0), (x + 0.48, g.current)], CURRENT_COLOR.filled())
        }))?
        .label(format!("{} (Current)", metric.label()))
        .legend(|(x, y)| Rectangle::new([(x, y - 5), (x + 10, y + 5)], CURRENT_COLOR.filled()));

    chart
        .draw_series(groups.iter().enumerate().map(|(i, g)| {
            let x = i as f64;
            Rectangle::new([(x + 0.52, 0.0), (x + 0.9, g.previous)], PREVIOUS_COLOR.filled())
        }))?
        .label(format!("{} (Previous)", metric.label()))
        .legend(|(x, y)| Rectangle::new([(x, y - 5), (x + 10, y + 5)], PREVIOUS_COLOR.filled()));

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()?;

    // Group names under the bars, centred on each pair
    let label_style = ("sans-serif", 13)
        .into_font()
        .color(&BLACK)
        .pos(Pos::new(HPos::Center, VPos::Top));
    for (i, group) in groups.iter().enumerate() {
        let (x, y) = chart.backend_coord(&(i as f64 + 0.5, y_min));
        root.draw(&Text::new(group.label.clone(), (x, y + 6), label_style.clone()))?;
    }

    root.present()?;
    Ok(())
}
