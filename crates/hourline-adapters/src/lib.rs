//! Header-tolerant readers that turn raw table grids into typed event rows
//! and run directives (KPI configs, block cutoffs, large-batch overrides).

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use hourline_core::{
    normalize_identity, parse_date, parse_date_only, parse_hour, EventRow, KpiConfig,
    OverrideDirective, OverrideSide, TaskType,
};
use hourline_store::Grid;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "hourline-adapters";

/// Table names as they exist in the external store.
pub const DEST_TABLE: &str = "All_Data";
pub const CONFIG_TABLE: &str = "KPI_Config";
pub const BLOCK_TABLE: &str = "Other Work";
pub const OVERRIDE_TABLE: &str = "Large_Overrides";

/// The seven source tables, in processing order.
pub const SOURCE_KINDS: [SourceKind; 7] = [
    SourceKind::Receive,
    SourceKind::Locate,
    SourceKind::Sort,
    SourceKind::Pack,
    SourceKind::StockTaking,
    SourceKind::Pick,
    SourceKind::Presort,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    Receive,
    Locate,
    Sort,
    Pack,
    StockTaking,
    Pick,
    Presort,
}

impl SourceKind {
    pub fn table(self) -> &'static str {
        match self {
            Self::Receive => "Receive",
            Self::Locate => "Locate",
            Self::Sort => "Sort",
            Self::Pack => "Pack",
            Self::StockTaking => "Stock taking",
            Self::Pick => "Pick",
            Self::Presort => "Presort",
        }
    }

    /// Pick and presort rows are aggregated per worker-hour before emission;
    /// the other tables emit one ledger row per event.
    pub fn is_aggregated(self) -> bool {
        matches!(self, Self::Pick | Self::Presort)
    }

    /// Fixed task type of the source, when one exists. Pack rows are
    /// sub-classified per row from the pack ratio.
    pub fn task_type(self) -> Option<TaskType> {
        match self {
            Self::Receive => Some(TaskType::Receive),
            Self::Locate => Some(TaskType::Locate),
            Self::Sort => Some(TaskType::Sort),
            Self::Pack => None,
            Self::StockTaking => Some(TaskType::StockTaking),
            Self::Pick => Some(TaskType::Pick),
            Self::Presort => Some(TaskType::Presort),
        }
    }
}

/// Why a source row was dropped instead of parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SkipReason {
    MissingIdentity,
    UnparseableTemporal,
    InvalidNumbers,
    FilteredCenter,
    Blocked,
    BelowThreshold,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingIdentity => "missing_identity",
            Self::UnparseableTemporal => "unparseable_temporal",
            Self::InvalidNumbers => "invalid_numbers",
            Self::FilteredCenter => "filtered_center",
            Self::Blocked => "blocked",
            Self::BelowThreshold => "below_threshold",
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("table `{table}` is missing required column `{column}`")]
    MissingColumn { table: String, column: String },
}

/// Parsed rows of one source table plus the rows dropped along the way.
#[derive(Debug, Default)]
pub struct ParsedSourceTable {
    pub events: Vec<EventRow>,
    pub skipped: Vec<SkipReason>,
}

/// Case/spacing-tolerant header-to-index map.
#[derive(Debug)]
struct HeaderMap<'a> {
    table: &'a str,
    index: HashMap<String, usize>,
}

fn canonical_column(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .filter(|c| !matches!(c, ' ' | '_' | '-'))
        .collect()
}

impl<'a> HeaderMap<'a> {
    fn new(table: &'a str, header: &[String]) -> Self {
        let mut index = HashMap::new();
        for (i, name) in header.iter().enumerate() {
            index.entry(canonical_column(name)).or_insert(i);
        }
        Self { table, index }
    }

    fn find(&self, candidates: &[&str]) -> Option<usize> {
        candidates
            .iter()
            .find_map(|c| self.index.get(&canonical_column(c)).copied())
    }

    fn require(&self, candidates: &[&str]) -> Result<usize, AdapterError> {
        self.find(candidates).ok_or_else(|| AdapterError::MissingColumn {
            table: self.table.to_string(),
            column: candidates[0].to_string(),
        })
    }
}

fn cell(row: &[String], idx: usize) -> &str {
    row.get(idx).map(String::as_str).unwrap_or("")
}

fn opt_cell(row: &[String], idx: Option<usize>) -> &str {
    idx.map(|i| cell(row, i)).unwrap_or("")
}

/// Parses a numeric cell the way the upstream loggers write them: empty means
/// zero, anything non-numeric poisons the row.
fn num_cell(row: &[String], idx: usize) -> Option<f64> {
    let t = cell(row, idx).trim();
    if t.is_empty() {
        return Some(0.0);
    }
    t.parse::<f64>().ok()
}

/// Reads one source table into normalized event rows. Row-level failures are
/// collected as [`SkipReason`]s; a missing required column fails the whole
/// table closed.
pub fn read_source_rows(
    kind: SourceKind,
    grid: &Grid,
    receive_center: Option<&str>,
) -> Result<ParsedSourceTable, AdapterError> {
    let mut out = ParsedSourceTable::default();
    if grid.len() < 2 {
        return Ok(out);
    }

    let header = HeaderMap::new(kind.table(), &grid[0]);
    let identity_col = header.require(&["full_name"])?;
    let date_col = header.require(&["date"])?;
    let hour_col = header.require(&["hour"])?;
    let start_col = header.require(&["Start"])?;
    let end_col = header.require(&["End"])?;
    let count_col = header.require(&["Count"])?;
    let username_col = header.find(&["username"]);
    let order_col = header.find(&["count_order"]);
    let center_col = if kind == SourceKind::Receive && receive_center.is_some() {
        Some(header.require(&["warehouse_name", "warehouses_name"])?)
    } else {
        None
    };

    for row in &grid[1..] {
        let identity = normalize_identity(cell(row, identity_col));
        if identity.is_empty() {
            out.skipped.push(SkipReason::MissingIdentity);
            continue;
        }

        let (date, hour) = match (parse_date(cell(row, date_col)), parse_hour(cell(row, hour_col)))
        {
            (Some(date), Some(hour)) => (date, hour),
            _ => {
                out.skipped.push(SkipReason::UnparseableTemporal);
                continue;
            }
        };

        let (quantity, start, end) = match (
            num_cell(row, count_col),
            num_cell(row, start_col),
            num_cell(row, end_col),
        ) {
            (Some(q), Some(s), Some(e)) => (q, s, e),
            _ => {
                out.skipped.push(SkipReason::InvalidNumbers);
                continue;
            }
        };
        let occupied_minutes = if end - start > 0.0 { end - start + 1.0 } else { 0.0 };
        if quantity <= 0.0 || occupied_minutes <= 0.0 {
            out.skipped.push(SkipReason::InvalidNumbers);
            continue;
        }

        if let (Some(center_col), Some(center)) = (center_col, receive_center) {
            if cell(row, center_col).trim() != center {
                out.skipped.push(SkipReason::FilteredCenter);
                continue;
            }
        }

        let order_count = match order_col {
            Some(idx) if kind == SourceKind::Pack => match num_cell(row, idx) {
                Some(v) => Some(v),
                None => {
                    out.skipped.push(SkipReason::InvalidNumbers);
                    continue;
                }
            },
            _ => None,
        };

        out.events.push(EventRow {
            identity,
            date,
            hour,
            quantity,
            occupied_minutes,
            username: opt_cell(row, username_col).trim().to_string(),
            order_count,
        });
    }

    Ok(out)
}

/// Reads the effective-dated KPI configuration table. Malformed rows are
/// skipped individually.
pub fn read_kpi_configs(grid: &Grid) -> (Vec<KpiConfig>, usize) {
    let mut configs = Vec::new();
    let mut skipped = 0usize;
    if grid.len() < 2 {
        return (configs, skipped);
    }

    let header = HeaderMap::new(CONFIG_TABLE, &grid[0]);
    let (Some(type_col), Some(base_col), Some(rotation_col), Some(effective_col)) = (
        header.find(&["task_type"]),
        header.find(&["base"]),
        header.find(&["rotation"]),
        header.find(&["effective_from"]),
    ) else {
        warn!(table = CONFIG_TABLE, "configuration header unusable; no KPIs loaded");
        return (configs, grid.len() - 1);
    };

    for row in &grid[1..] {
        let task_label = cell(row, type_col).trim().to_string();
        let base = cell(row, base_col).trim().parse::<f64>();
        let rotation = cell(row, rotation_col).trim().parse::<f64>();
        let effective = NaiveDate::parse_from_str(cell(row, effective_col).trim(), "%Y-%m-%d");
        match (task_label.is_empty(), base, rotation, effective) {
            (false, Ok(base), Ok(rotation), Ok(effective)) => configs.push(KpiConfig {
                task_label,
                base,
                rotation,
                effective,
            }),
            _ => skipped += 1,
        }
    }
    (configs, skipped)
}

/// Reads the blocking table into one cutoff per identity. Collisions keep the
/// earliest (most restrictive) cutoff.
pub fn read_block_directives(grid: &Grid) -> (BTreeMap<String, NaiveDate>, usize) {
    let mut cutoffs = BTreeMap::new();
    let mut skipped = 0usize;
    if grid.len() < 2 {
        return (cutoffs, skipped);
    }

    for row in &grid[1..] {
        let identity = normalize_identity(cell(row, 2));
        if identity.is_empty() {
            skipped += 1;
            continue;
        }
        let Some(cutoff) = parse_date_only(cell(row, 0)) else {
            skipped += 1;
            continue;
        };
        cutoffs
            .entry(identity)
            .and_modify(|existing: &mut NaiveDate| {
                if cutoff < *existing {
                    *existing = cutoff;
                }
            })
            .or_insert(cutoff);
    }
    (cutoffs, skipped)
}

/// Reads the override table: date, hour, identity, forced-side label. Rows
/// whose date/hour resist the event-row parser fall back to date-only plus a
/// plain digit hour before being dropped.
pub fn read_overrides(grid: &Grid) -> (Vec<OverrideDirective>, usize) {
    let mut overrides = Vec::new();
    let mut skipped = 0usize;

    for row in grid {
        if row.len() < 4 {
            skipped += 1;
            continue;
        }
        let identity = normalize_identity(cell(row, 2));
        if identity.is_empty() {
            skipped += 1;
            continue;
        }
        let Some(side) = OverrideSide::from_label(cell(row, 3)) else {
            skipped += 1;
            continue;
        };

        let parsed = match (parse_date(cell(row, 0)), parse_hour(cell(row, 1))) {
            (Some(date), Some(hour)) => Some((date, hour)),
            _ => fallback_date_hour(cell(row, 0), cell(row, 1)),
        };
        let Some((date, hour)) = parsed else {
            skipped += 1;
            continue;
        };

        overrides.push(OverrideDirective {
            identity,
            date,
            hour,
            side,
        });
    }
    (overrides, skipped)
}

fn fallback_date_hour(date_raw: &str, hour_raw: &str) -> Option<(NaiveDate, u8)> {
    let date = parse_date_only(date_raw)?;
    let hour: u8 = hour_raw.trim().parse().ok()?;
    if hour > 23 {
        return None;
    }
    Some((date, hour))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(rows: &[&[&str]]) -> Grid {
        rows.iter()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    const EVENT_HEADER: &[&str] = &["full_name", "date", "hour", "Start", "End", "Count", "username"];

    #[test]
    fn header_resolution_is_case_and_spacing_tolerant() {
        let g = grid(&[
            &[" Full_Name ", "Date", "HOUR", "start", "end", "count", "User Name"],
            &["Sara Ahmadi", "2024-05-02", "9", "0", "44", "30", "s.ahmadi.s1"],
        ]);
        let parsed = read_source_rows(SourceKind::Sort, &g, None).unwrap();
        assert_eq!(parsed.events.len(), 1);
        let ev = &parsed.events[0];
        assert_eq!(ev.quantity, 30.0);
        assert_eq!(ev.occupied_minutes, 45.0);
        assert_eq!(ev.username, "s.ahmadi.s1");
    }

    #[test]
    fn missing_required_column_fails_the_table_closed() {
        let g = grid(&[
            &["full_name", "date", "hour", "Start", "End"],
            &["x", "2024-05-02", "9", "0", "44"],
        ]);
        let err = read_source_rows(SourceKind::Sort, &g, None).unwrap_err();
        assert!(matches!(err, AdapterError::MissingColumn { .. }));
    }

    #[test]
    fn rows_fail_individually_with_reasons() {
        let g = grid(&[
            EVENT_HEADER,
            &["", "2024-05-02", "9", "0", "44", "30", "u"],
            &["x", "someday", "9", "0", "44", "30", "u"],
            &["x", "2024-05-02", "9", "10", "5", "30", "u"],
            &["x", "2024-05-02", "9", "0", "44", "lots", "u"],
            &["x", "2024-05-02", "9", "0", "44", "30", "u"],
        ]);
        let parsed = read_source_rows(SourceKind::Sort, &g, None).unwrap();
        assert_eq!(parsed.events.len(), 1);
        assert_eq!(
            parsed.skipped,
            vec![
                SkipReason::MissingIdentity,
                SkipReason::UnparseableTemporal,
                SkipReason::InvalidNumbers,
                SkipReason::InvalidNumbers,
            ]
        );
    }

    #[test]
    fn receive_rows_are_filtered_to_the_configured_center() {
        let g = grid(&[
            &["full_name", "date", "hour", "Start", "End", "Count", "username", "warehouse_name"],
            &["x", "2024-05-02", "9", "0", "44", "30", "u", "مرکز پردازش مهرآباد"],
            &["y", "2024-05-02", "9", "0", "44", "30", "u", "مرکز دیگر"],
        ]);
        let parsed =
            read_source_rows(SourceKind::Receive, &g, Some("مرکز پردازش مهرآباد")).unwrap();
        assert_eq!(parsed.events.len(), 1);
        assert_eq!(parsed.skipped, vec![SkipReason::FilteredCenter]);
    }

    #[test]
    fn pack_rows_carry_their_order_count() {
        let g = grid(&[
            &["full_name", "date", "hour", "Start", "End", "Count", "username", "count_order"],
            &["x", "2024-05-02", "9", "0", "44", "30", "u", "27"],
            &["y", "2024-05-02", "9", "0", "44", "30", "u", ""],
        ]);
        let parsed = read_source_rows(SourceKind::Pack, &g, None).unwrap();
        assert_eq!(parsed.events[0].order_count, Some(27.0));
        assert_eq!(parsed.events[1].order_count, Some(0.0));
    }

    #[test]
    fn kpi_rows_skip_individually() {
        let g = grid(&[
            &["task_type", "base", "rotation", "effective_from"],
            &["Pick", "50", "1.2", "2024-01-01"],
            &["Pick", "sixty", "1.2", "2024-06-01"],
            &["Presort", "40", "1", "2024-02-15"],
        ]);
        let (configs, skipped) = read_kpi_configs(&g);
        assert_eq!(configs.len(), 2);
        assert_eq!(skipped, 1);
        assert_eq!(configs[0].task_label, "Pick");
    }

    #[test]
    fn block_collisions_keep_the_earliest_cutoff() {
        let g = grid(&[
            &["start", "note", "full_name"],
            &["3/10/2024", "", "Sara Ahmadi"],
            &["3/01/2024 08:00:00", "", "Sara\u{200C} Ahmadi"],
            &["not a date", "", "Someone"],
        ]);
        let (cutoffs, skipped) = read_block_directives(&g);
        assert_eq!(skipped, 1);
        assert_eq!(cutoffs.len(), 1);
        assert_eq!(
            cutoffs["Sara Ahmadi"],
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
        );
    }

    #[test]
    fn overrides_parse_with_fallback_and_label_tolerance() {
        let g = grid(&[
            &["date", "hour", "full_name", "type"],
            &["2024-05-02", "9", "Sara Ahmadi", "Pick"],
            &["3/10/2024 00:00:00", "7", "Ali Rezaei", "Presort_Large"],
            &["2024-05-02", "9", "Sara Ahmadi", "Packing"],
            &["2024-05-02", "noon", "Sara Ahmadi", "Pick"],
        ]);
        let (overrides, skipped) = read_overrides(&g);
        // the header row itself fails the label match and is counted skipped
        assert_eq!(overrides.len(), 2);
        assert_eq!(skipped, 3);
        assert_eq!(overrides[0].side, OverrideSide::Pick);
        assert_eq!(overrides[1].side, OverrideSide::Presort);
        assert_eq!(overrides[1].hour, 7);
    }
}
