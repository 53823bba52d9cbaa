use crate::error::{DashboardError, Result};
use crate::records::{MeetingRecord, PipelineStatus, SalesRecord};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Categorical field records can be grouped by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKey {
    Owner,
    Team,
    Function,
    Practice,
    Stage,
    Week,
}

impl GroupKey {
    pub const ALL: [GroupKey; 6] = [
        GroupKey::Owner,
        GroupKey::Team,
        GroupKey::Function,
        GroupKey::Practice,
        GroupKey::Stage,
        GroupKey::Week,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            GroupKey::Owner => "Sales Owner",
            GroupKey::Team => "Team",
            GroupKey::Function => "Function",
            GroupKey::Practice => "Practice",
            GroupKey::Stage => "Sales Stage",
            GroupKey::Week => "Week",
        }
    }

    pub fn slug(&self) -> &'static str {
        match self {
            GroupKey::Owner => "owner",
            GroupKey::Team => "team",
            GroupKey::Function => "function",
            GroupKey::Practice => "practice",
            GroupKey::Stage => "stage",
            GroupKey::Week => "week",
        }
    }

    pub fn value(&self, record: &SalesRecord) -> String {
        match self {
            GroupKey::Owner => record.owner.clone(),
            GroupKey::Team => record.team.clone(),
            GroupKey::Function => record.function.clone(),
            GroupKey::Practice => record.practice.clone(),
            GroupKey::Stage => record.sales_stage.clone(),
            GroupKey::Week => record.close_week(),
        }
    }

    /// Value for a meeting; only owner, team and week exist on meetings
    pub fn meeting_value(&self, meeting: &MeetingRecord) -> Option<String> {
        match self {
            GroupKey::Owner => Some(meeting.owner.clone()),
            GroupKey::Team => Some(meeting.team.clone()),
            GroupKey::Week => Some(meeting.week()),
            _ => None,
        }
    }

    /// Parses a comma separated key list such as `owner,team`
    ///
    /// Duplicates are dropped and an empty list means [`GroupKey::Owner`].
    pub fn parse_list(raw: &str) -> Result<Vec<GroupKey>> {
        let mut keys = Vec::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let key: GroupKey = part.parse()?;
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        if keys.is_empty() {
            keys.push(GroupKey::Owner);
        }
        Ok(keys)
    }
}

impl FromStr for GroupKey {
    type Err = DashboardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace(['_', ' '], "").as_str() {
            "owner" | "salesowner" => Ok(GroupKey::Owner),
            "team" => Ok(GroupKey::Team),
            "function" => Ok(GroupKey::Function),
            "practice" => Ok(GroupKey::Practice),
            "stage" | "salesstage" => Ok(GroupKey::Stage),
            "week" => Ok(GroupKey::Week),
            _ => Err(DashboardError::UnknownKey(s.to_string())),
        }
    }
}

/// Which upload a set of records came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Period {
    Current,
    Previous,
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Period::Current => write!(f, "Current"),
            Period::Previous => write!(f, "Previous"),
        }
    }
}

/// Summable pipeline figure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Committed,
    Upside,
    ClosedWon,
    Amount,
    Weighted,
    /// Committed + Upside + Closed Won
    Total,
}

impl Metric {
    /// Metrics shown in the pivot view, in column order
    pub const PIVOT: [Metric; 4] = [
        Metric::Committed,
        Metric::Upside,
        Metric::ClosedWon,
        Metric::Total,
    ];

    pub const ALL: [Metric; 6] = [
        Metric::Committed,
        Metric::Upside,
        Metric::ClosedWon,
        Metric::Amount,
        Metric::Weighted,
        Metric::Total,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Metric::Committed => "Committed",
            Metric::Upside => "Upside",
            Metric::ClosedWon => "Closed Won",
            Metric::Amount => "Amount",
            Metric::Weighted => "Weighted",
            Metric::Total => "Total",
        }
    }

    pub fn slug(&self) -> &'static str {
        match self {
            Metric::Committed => "committed",
            Metric::Upside => "upside",
            Metric::ClosedWon => "closed_won",
            Metric::Amount => "amount",
            Metric::Weighted => "weighted",
            Metric::Total => "total",
        }
    }
}

impl FromStr for Metric {
    type Err = DashboardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace(['_', ' ', '-'], "").as_str() {
            "committed" => Ok(Metric::Committed),
            "upside" => Ok(Metric::Upside),
            "closedwon" | "won" => Ok(Metric::ClosedWon),
            "amount" => Ok(Metric::Amount),
            "weighted" => Ok(Metric::Weighted),
            "total" => Ok(Metric::Total),
            _ => Err(DashboardError::UnknownMetric(s.to_string())),
        }
    }
}

/// Ratio that is 0 instead of NaN or infinity when the denominator is 0
pub fn safe_div(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 || !denominator.is_finite() {
        0.0
    } else {
        numerator / denominator
    }
}

/// Summed metrics for one group and period
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricSet {
    pub committed: f64,
    pub upside: f64,
    pub closed_won: f64,
    pub amount: f64,
    pub weighted: f64,
    pub deals: usize,
    pub won_deals: usize,
    pub lost_deals: usize,
}

impl MetricSet {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a SalesRecord>) -> Self {
        let mut set = MetricSet::default();
        for record in records {
            set.add(record);
        }
        set
    }

    pub fn add(&mut self, record: &SalesRecord) {
        self.amount += record.amount;
        self.weighted += record.weighted_amount();
        self.deals += 1;
        match record.status {
            PipelineStatus::Committed => self.committed += record.amount,
            PipelineStatus::Upside => self.upside += record.amount,
            PipelineStatus::ClosedWon => {
                self.closed_won += record.amount;
                self.won_deals += 1;
            }
            PipelineStatus::ClosedLost => self.lost_deals += 1,
            PipelineStatus::Open => {}
        }
    }

    pub fn merge(&mut self, other: &MetricSet) {
        self.committed += other.committed;
        self.upside += other.upside;
        self.closed_won += other.closed_won;
        self.amount += other.amount;
        self.weighted += other.weighted;
        self.deals += other.deals;
        self.won_deals += other.won_deals;
        self.lost_deals += other.lost_deals;
    }

    pub fn get(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Committed => self.committed,
            Metric::Upside => self.upside,
            Metric::ClosedWon => self.closed_won,
            Metric::Amount => self.amount,
            Metric::Weighted => self.weighted,
            Metric::Total => self.committed + self.upside + self.closed_won,
        }
    }

    /// Won deals over decided (won + lost) deals
    pub fn win_rate(&self) -> f64 {
        safe_div(
            self.won_deals as f64,
            (self.won_deals + self.lost_deals) as f64,
        )
    }

    /// Closed-won amount per won deal
    pub fn average_deal_size(&self) -> f64 {
        safe_div(self.closed_won, self.won_deals as f64)
    }
}

/// Groups items by key and folds each group into an accumulator
///
/// Groups come back ordered by key.
pub fn group_reduce<T, K, A, KF, F>(
    items: impl IntoIterator<Item = T>,
    mut key_fn: KF,
    mut fold: F,
) -> BTreeMap<K, A>
where
    K: Ord,
    A: Default,
    KF: FnMut(&T) -> K,
    F: FnMut(&mut A, T),
{
    let mut groups: BTreeMap<K, A> = BTreeMap::new();
    for item in items {
        let key = key_fn(&item);
        fold(groups.entry(key).or_default(), item);
    }
    groups
}

fn sales_key(keys: &[GroupKey], record: &SalesRecord) -> Vec<String> {
    keys.iter().map(|key| key.value(record)).collect()
}

/// One group of one period
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateRow {
    pub key: Vec<String>,
    pub period: Period,
    pub metrics: MetricSet,
}

/// Sums metrics per group for a single period
pub fn group_by(records: &[SalesRecord], keys: &[GroupKey], period: Period) -> Vec<AggregateRow> {
    group_reduce(
        records,
        |record| sales_key(keys, record),
        |set: &mut MetricSet, record| set.add(record),
    )
    .into_iter()
    .map(|(key, metrics)| AggregateRow {
        key,
        period,
        metrics,
    })
    .collect()
}

/// One group with both periods side by side
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PivotRow {
    pub key: Vec<String>,
    pub current: MetricSet,
    pub previous: MetricSet,
}

impl PivotRow {
    pub fn value(&self, metric: Metric, period: Period) -> f64 {
        match period {
            Period::Current => self.current.get(metric),
            Period::Previous => self.previous.get(metric),
        }
    }

    /// Current minus previous
    pub fn delta(&self, metric: Metric) -> f64 {
        self.current.get(metric) - self.previous.get(metric)
    }
}

/// Kind of a pivot column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ColumnKind {
    Period(Period),
    Delta,
}

/// A (metric, period) or (metric, delta) column of the pivot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PivotColumn {
    pub metric: Metric,
    pub kind: ColumnKind,
}

impl PivotColumn {
    pub fn header(&self) -> String {
        match self.kind {
            ColumnKind::Period(period) => format!("{} ({})", self.metric.label(), period),
            ColumnKind::Delta => format!("{} (Delta)", self.metric.label()),
        }
    }

    pub fn value(&self, row: &PivotRow) -> f64 {
        match self.kind {
            ColumnKind::Period(period) => row.value(self.metric, period),
            ColumnKind::Delta => row.delta(self.metric),
        }
    }
}

/// Current vs previous comparison table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PivotTable {
    pub keys: Vec<GroupKey>,
    pub rows: Vec<PivotRow>,
    pub total: PivotRow,
}

/// Label of the totals row in the first key column
pub const TOTAL_LABEL: &str = "Total";

/// Builds the current vs previous pivot
///
/// A group present in only one period gets zeros for the other. The
/// totals row is the sum of every group.
pub fn pivot(current: &[SalesRecord], previous: &[SalesRecord], keys: &[GroupKey]) -> PivotTable {
    let mut groups: BTreeMap<Vec<String>, (MetricSet, MetricSet)> = BTreeMap::new();
    for row in group_by(current, keys, Period::Current) {
        groups.entry(row.key).or_default().0 = row.metrics;
    }
    for row in group_by(previous, keys, Period::Previous) {
        groups.entry(row.key).or_default().1 = row.metrics;
    }

    let mut total_key = vec![String::new(); keys.len().max(1)];
    total_key[0] = TOTAL_LABEL.to_string();
    let mut total = PivotRow {
        key: total_key,
        current: MetricSet::default(),
        previous: MetricSet::default(),
    };

    let rows: Vec<PivotRow> = groups
        .into_iter()
        .map(|(key, (current, previous))| {
            total.current.merge(&current);
            total.previous.merge(&previous);
            PivotRow {
                key,
                current,
                previous,
            }
        })
        .collect();

    PivotTable {
        keys: keys.to_vec(),
        rows,
        total,
    }
}

impl PivotTable {
    /// Current, previous and delta columns for each metric
    pub fn columns(metrics: &[Metric]) -> Vec<PivotColumn> {
        metrics
            .iter()
            .flat_map(|&metric| {
                [
                    ColumnKind::Period(Period::Current),
                    ColumnKind::Period(Period::Previous),
                    ColumnKind::Delta,
                ]
                .into_iter()
                .map(move |kind| PivotColumn { metric, kind })
            })
            .collect()
    }

    pub fn key_headers(&self) -> Vec<&'static str> {
        self.keys.iter().map(|key| key.label()).collect()
    }

    /// Reorders rows by the current value of a metric, largest first
    pub fn sort_by_metric(&mut self, metric: Metric) {
        self.rows.sort_by(|a, b| {
            b.current
                .get(metric)
                .total_cmp(&a.current.get(metric))
                .then_with(|| a.key.cmp(&b.key))
        });
    }
}

/// Headline numbers for one period
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Kpis {
    pub deals: usize,
    pub pipeline: f64,
    pub weighted: f64,
    pub committed: f64,
    pub upside: f64,
    pub closed_won: f64,
    pub win_rate: f64,
    pub average_deal_size: f64,
}

impl Kpis {
    pub fn compute(records: &[SalesRecord]) -> Self {
        Self::from_metrics(&MetricSet::from_records(records))
    }

    pub fn from_metrics(set: &MetricSet) -> Self {
        Self {
            deals: set.deals,
            pipeline: set.amount,
            weighted: set.weighted,
            committed: set.committed,
            upside: set.upside,
            closed_won: set.closed_won,
            win_rate: set.win_rate(),
            average_deal_size: set.average_deal_size(),
        }
    }
}

/// Meeting counts for one group
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeetingRow {
    pub key: Vec<String>,
    pub current: usize,
    pub previous: usize,
    pub by_type: BTreeMap<String, usize>,
}

impl MeetingRow {
    pub fn delta(&self) -> i64 {
        self.current as i64 - self.previous as i64
    }
}

/// Counts meetings per group for both periods
///
/// `by_type` breaks down the current period's meetings by meeting type.
///
/// # Errors
/// * `UnknownKey` for keys meetings do not carry (function, practice, stage)
pub fn meeting_counts(
    current: &[MeetingRecord],
    previous: &[MeetingRecord],
    keys: &[GroupKey],
) -> Result<Vec<MeetingRow>> {
    if let Some(bad) = keys
        .iter()
        .find(|key| !matches!(key, GroupKey::Owner | GroupKey::Team | GroupKey::Week))
    {
        return Err(DashboardError::UnknownKey(format!(
            "{} (not recorded for meetings)",
            bad.slug()
        )));
    }

    let meeting_key = |meeting: &&MeetingRecord| -> Vec<String> {
        keys.iter()
            .filter_map(|key| key.meeting_value(meeting))
            .collect()
    };

    let mut rows: BTreeMap<Vec<String>, MeetingRow> = BTreeMap::new();
    let current_groups = group_reduce(current, meeting_key, |acc: &mut Vec<&MeetingRecord>, m| {
        acc.push(m)
    });
    for (key, meetings) in current_groups {
        let row = rows.entry(key.clone()).or_insert_with(|| MeetingRow {
            key,
            current: 0,
            previous: 0,
            by_type: BTreeMap::new(),
        });
        row.current = meetings.len();
        for meeting in meetings {
            *row.by_type.entry(meeting.meeting_type.clone()).or_default() += 1;
        }
    }

    let previous_groups = group_reduce(previous, meeting_key, |count: &mut usize, _| *count += 1);
    for (key, count) in previous_groups {
        rows.entry(key.clone())
            .or_insert_with(|| MeetingRow {
                key,
                current: 0,
                previous: 0,
                by_type: BTreeMap::new(),
            })
            .previous = count;
    }

    Ok(rows.into_values().collect())
}
