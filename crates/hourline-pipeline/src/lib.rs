//! Reconciliation engine: one batch run that folds the raw productivity
//! tables into the append-only hourly ledger.
//!
//! The run reads every input table fully, computes all output rows in memory
//! and appends them in a single bulk call at the end. Row-level problems are
//! absorbed as skip counts; only store connectivity aborts the run.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use hourline_adapters::{
    read_block_directives, read_kpi_configs, read_overrides, read_source_rows, SkipReason,
    SourceKind, BLOCK_TABLE, CONFIG_TABLE, DEST_TABLE, OVERRIDE_TABLE, SOURCE_KINDS,
};
use hourline_core::{
    dedup_key, norm_date_text, norm_num_text, normalize_identity, EventRow, HourKey,
    HourlyAggregate, KpiConfig, OutputRecord, OverrideSide, TaskType, DEST_HEADER,
};
use hourline_store::{Grid, StoreError, TableStore};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hourline-pipeline";

/// Engine knobs, one env var each.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub store_path: PathBuf,
    pub min_quantity: f64,
    pub receive_center: String,
}

impl RunConfig {
    pub fn from_env() -> Self {
        Self {
            store_path: std::env::var("HOURLINE_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./hourline_tables.json")),
            min_quantity: std::env::var("HOURLINE_MIN_QTY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(15.0),
            receive_center: std::env::var("HOURLINE_RECEIVE_CENTER")
                .unwrap_or_else(|_| "مرکز پردازش مهرآباد".to_string()),
        }
    }
}

/// What one reconciliation run did.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub appended_rows: usize,
    pub duplicate_rows: usize,
    pub preexisting_keys: usize,
    pub malformed_directives: usize,
    pub skipped: BTreeMap<String, usize>,
    pub emitted_by_type: BTreeMap<String, usize>,
}

// ---------------------------------------------------------------------------
// KPI resolution
// ---------------------------------------------------------------------------

/// Effective-dated KPI lookup over the configs loaded for this run.
#[derive(Debug, Default)]
pub struct KpiBook {
    by_label: HashMap<String, Vec<KpiConfig>>,
}

impl KpiBook {
    pub fn new(configs: Vec<KpiConfig>) -> Self {
        let mut by_label: HashMap<String, Vec<KpiConfig>> = HashMap::new();
        for config in configs {
            by_label.entry(config.task_label.clone()).or_default().push(config);
        }
        for configs in by_label.values_mut() {
            configs.sort_by_key(|c| c.effective);
        }
        Self { by_label }
    }

    /// Latest config for the label whose effective date does not exceed the
    /// record date.
    pub fn lookup(&self, label: &str, date: NaiveDate) -> Option<&KpiConfig> {
        let mut chosen = None;
        for config in self.by_label.get(label)? {
            if config.effective <= date {
                chosen = Some(config);
            } else {
                break;
            }
        }
        chosen
    }

    /// Lookup with large-batch fallback: a large variant with no config of
    /// its own uses the config of its base type.
    pub fn lookup_for(&self, task: TaskType, date: NaiveDate) -> Option<&KpiConfig> {
        if let Some(config) = self.lookup(task.label(), date) {
            return Some(config);
        }
        task.base_type().and_then(|base| self.lookup(base.label(), date))
    }
}

// ---------------------------------------------------------------------------
// Eligibility, aggregation, classification
// ---------------------------------------------------------------------------

/// Suppresses a record when the worker transitioned to unrelated duties on or
/// before the record date.
pub fn is_blocked(
    cutoffs: &BTreeMap<String, NaiveDate>,
    identity: &str,
    date: NaiveDate,
) -> bool {
    cutoffs.get(identity).is_some_and(|cutoff| date >= *cutoff)
}

/// Groups events by worker-hour, summing quantity and occupied minutes. The
/// last-seen username follows source row order.
pub fn aggregate_hourly(events: &[EventRow]) -> BTreeMap<HourKey, HourlyAggregate> {
    let mut agg: BTreeMap<HourKey, HourlyAggregate> = BTreeMap::new();
    for event in events {
        let entry = agg.entry(event.hour_key()).or_default();
        entry.quantity += event.quantity;
        entry.occupied_minutes += event.occupied_minutes;
        entry.username = event.username.clone();
    }
    agg
}

/// Override directives keyed by worker-hour; the first directive for a key
/// wins.
pub type OverrideMap = HashMap<(String, NaiveDate, u8), OverrideSide>;

/// Task type for one side of a worker-hour under the override-only policy:
/// a directive naming this side forces its large-batch variant, anything else
/// stays standard.
pub fn classify_side(side: OverrideSide, forced: Option<OverrideSide>) -> TaskType {
    if forced == Some(side) {
        side.large()
    } else {
        side.standard()
    }
}

/// Pack sub-classification from the quantity-per-order ratio.
pub fn pack_task_and_ratio(quantity: f64, order_count: f64) -> (TaskType, Option<f64>) {
    if order_count > 0.0 {
        let ratio = (quantity / order_count * 100.0).round() / 100.0;
        let task = if (1.0..=1.2).contains(&ratio) {
            TaskType::PackSingle
        } else {
            TaskType::PackMulti
        };
        (task, Some(ratio))
    } else {
        (TaskType::PackMulti, None)
    }
}

/// Derives performance fields and assembles one ledger record.
pub fn build_record(
    task: TaskType,
    identity: &str,
    quantity: f64,
    occupied_minutes: f64,
    date: NaiveDate,
    hour: u8,
    order_count: Option<f64>,
    pack_ratio: Option<f64>,
    username: &str,
    kpi: Option<&KpiConfig>,
) -> OutputRecord {
    let mut perf_without = None;
    let mut perf_with = None;
    if let Some(config) = kpi {
        if quantity > 0.0 && occupied_minutes > 0.0 && config.base > 0.0 && config.rotation > 0.0 {
            perf_without = Some(quantity / config.base * 100.0);
            perf_with = Some(quantity / (occupied_minutes * config.rotation) * 100.0);
        }
    }
    OutputRecord {
        full_name: identity.to_string(),
        task_type: task,
        quantity,
        date,
        hour,
        occupied_minutes,
        order_count,
        perf_without_rotation: perf_without,
        perf_with_rotation: perf_with,
        pack_ratio,
        username: username.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Run context: the only mutable state of a run
// ---------------------------------------------------------------------------

struct RunContext {
    seen_keys: HashSet<String>,
    new_rows: Vec<OutputRecord>,
    duplicate_rows: usize,
    skipped: BTreeMap<String, usize>,
    emitted_by_type: BTreeMap<String, usize>,
}

impl RunContext {
    fn new(seen_keys: HashSet<String>) -> Self {
        Self {
            seen_keys,
            new_rows: Vec::new(),
            duplicate_rows: 0,
            skipped: BTreeMap::new(),
            emitted_by_type: BTreeMap::new(),
        }
    }

    fn record_skip(&mut self, reason: SkipReason) {
        *self.skipped.entry(reason.as_str().to_string()).or_default() += 1;
    }

    /// Dedup guard: emits the record unless its composite key is already in
    /// the destination or was emitted earlier in this run.
    fn push(&mut self, record: OutputRecord) {
        let key = record.dedup_key();
        if !self.seen_keys.insert(key) {
            self.duplicate_rows += 1;
            return;
        }
        *self
            .emitted_by_type
            .entry(record.task_type.label().to_string())
            .or_default() += 1;
        self.new_rows.push(record);
    }
}

// ---------------------------------------------------------------------------
// Run orchestration
// ---------------------------------------------------------------------------

/// Runs one full reconciliation batch against the store.
pub async fn run_once(store: &dyn TableStore, config: &RunConfig) -> Result<RunSummary> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    info!(%run_id, "reconciliation run started");

    let destination = ensure_destination(store).await?;
    let existing_keys = existing_keys(&destination);
    let preexisting_keys = existing_keys.len();
    let mut ctx = RunContext::new(existing_keys);

    let (kpis, kpi_skipped) = read_kpi_configs(&read_or_empty(store, CONFIG_TABLE).await?);
    let book = KpiBook::new(kpis);
    let (cutoffs, block_skipped) = read_block_directives(&read_or_empty(store, BLOCK_TABLE).await?);
    let (overrides, override_skipped) =
        read_overrides(&read_or_empty(store, OVERRIDE_TABLE).await?);
    let mut forced: OverrideMap = HashMap::new();
    for directive in overrides {
        forced
            .entry((directive.identity, directive.date, directive.hour))
            .or_insert(directive.side);
    }
    let malformed_directives = kpi_skipped + block_skipped + override_skipped;

    for kind in SOURCE_KINDS {
        let grid = read_or_empty(store, kind.table()).await?;
        let center = (kind == SourceKind::Receive).then_some(config.receive_center.as_str());
        let parsed = match read_source_rows(kind, &grid, center) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(table = kind.table(), %err, "source table unusable; skipped");
                continue;
            }
        };
        for reason in parsed.skipped {
            ctx.record_skip(reason);
        }

        if kind.is_aggregated() {
            process_aggregated(kind, parsed.events, &cutoffs, &forced, &book, config, &mut ctx);
        } else {
            process_simple(kind, parsed.events, &cutoffs, &book, config, &mut ctx);
        }
    }

    let appended_rows = ctx.new_rows.len();
    if appended_rows > 0 {
        let rows: Vec<Vec<String>> = ctx.new_rows.iter().map(OutputRecord::cells).collect();
        store
            .append_rows(DEST_TABLE, rows)
            .await
            .context("appending reconciled rows to the destination table")?;
    }

    let finished_at = Utc::now();
    info!(
        %run_id,
        appended_rows,
        duplicate_rows = ctx.duplicate_rows,
        "reconciliation run finished"
    );
    Ok(RunSummary {
        run_id,
        started_at,
        finished_at,
        appended_rows,
        duplicate_rows: ctx.duplicate_rows,
        preexisting_keys,
        malformed_directives,
        skipped: ctx.skipped,
        emitted_by_type: ctx.emitted_by_type,
    })
}

/// One ledger row per event for the five simple sources.
fn process_simple(
    kind: SourceKind,
    events: Vec<EventRow>,
    cutoffs: &BTreeMap<String, NaiveDate>,
    book: &KpiBook,
    config: &RunConfig,
    ctx: &mut RunContext,
) {
    for event in events {
        if is_blocked(cutoffs, &event.identity, event.date) {
            ctx.record_skip(SkipReason::Blocked);
            continue;
        }
        if event.quantity < config.min_quantity {
            ctx.record_skip(SkipReason::BelowThreshold);
            continue;
        }

        let (task, pack_ratio, order_count) = if kind == SourceKind::Pack {
            let order = event.order_count.unwrap_or(0.0);
            let (task, ratio) = pack_task_and_ratio(event.quantity, order);
            (task, ratio, Some(order))
        } else {
            let task = kind.task_type().expect("non-pack sources have a fixed task type");
            (task, None, None)
        };

        let kpi = book.lookup_for(task, event.date);
        ctx.push(build_record(
            task,
            &event.identity,
            event.quantity,
            event.occupied_minutes,
            event.date,
            event.hour,
            order_count,
            pack_ratio,
            &event.username,
            kpi,
        ));
    }
}

/// Hourly aggregation plus override-driven classification for pick/presort.
fn process_aggregated(
    kind: SourceKind,
    events: Vec<EventRow>,
    cutoffs: &BTreeMap<String, NaiveDate>,
    forced: &OverrideMap,
    book: &KpiBook,
    config: &RunConfig,
    ctx: &mut RunContext,
) {
    let side = match kind {
        SourceKind::Pick => OverrideSide::Pick,
        SourceKind::Presort => OverrideSide::Presort,
        _ => unreachable!("only pick/presort sources aggregate"),
    };

    let mut eligible = Vec::with_capacity(events.len());
    for event in events {
        if is_blocked(cutoffs, &event.identity, event.date) {
            ctx.record_skip(SkipReason::Blocked);
        } else {
            eligible.push(event);
        }
    }

    for ((identity, date, hour), agg) in aggregate_hourly(&eligible) {
        if agg.quantity < config.min_quantity {
            ctx.record_skip(SkipReason::BelowThreshold);
            continue;
        }
        let task = classify_side(side, forced.get(&(identity.clone(), date, hour)).copied());
        let kpi = book.lookup_for(task, date);
        ctx.push(build_record(
            task,
            &identity,
            agg.quantity,
            agg.occupied_minutes,
            date,
            hour,
            None,
            None,
            &agg.username,
            kpi,
        ));
    }
}

/// Reads a table, treating a missing table as empty (with a warning); any
/// other store failure is fatal for the run.
async fn read_or_empty(store: &dyn TableStore, table: &str) -> Result<Grid> {
    match store.read_table(table).await {
        Ok(grid) => Ok(grid),
        Err(StoreError::MissingTable(_)) => {
            warn!(table, "table not found; treated as empty");
            Ok(Vec::new())
        }
        Err(err) => Err(err).with_context(|| format!("reading table `{table}`")),
    }
}

/// Creates or repairs the destination header before any append, then returns
/// the destination snapshot used to seed the dedup guard.
async fn ensure_destination(store: &dyn TableStore) -> Result<Grid> {
    let header: Vec<String> = DEST_HEADER.iter().map(|c| c.to_string()).collect();
    let mut grid = match store.read_table(DEST_TABLE).await {
        Ok(grid) => grid,
        Err(StoreError::MissingTable(_)) => Vec::new(),
        Err(err) => return Err(err).context("opening the destination table"),
    };

    if grid.is_empty() {
        store
            .replace_first_row(DEST_TABLE, header.clone())
            .await
            .context("creating the destination header")?;
        grid = vec![header];
    } else if grid[0] != header {
        warn!(table = DEST_TABLE, "destination header mismatched; repairing");
        store
            .replace_first_row(DEST_TABLE, header.clone())
            .await
            .context("repairing the destination header")?;
        grid[0] = header;
    }
    Ok(grid)
}

/// Rebuilds composite keys from the rows already in the destination, applying
/// the same normalization the emitters use.
fn existing_keys(destination: &Grid) -> HashSet<String> {
    let mut keys = HashSet::new();
    for row in destination.iter().skip(1) {
        let cell = |i: usize| row.get(i).map(String::as_str).unwrap_or("");
        keys.insert(dedup_key(
            &normalize_identity(cell(0)),
            cell(1).trim(),
            &norm_date_text(cell(3)),
            &norm_num_text(cell(4)),
        ));
    }
    keys
}

/// Human-readable one-line digest of a run, used for log tails.
pub fn summary_line(summary: &RunSummary) -> String {
    format!(
        "run {} appended {} rows ({} duplicates suppressed, {} skipped)",
        summary.run_id,
        summary.appended_rows,
        summary.duplicate_rows,
        summary.skipped.values().sum::<usize>()
    )
}
