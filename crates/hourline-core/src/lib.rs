//! Core domain model for Hourline: task types, normalized events, directives,
//! identity/temporal normalization and destination-cell formatting.

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

pub const CRATE_NAME: &str = "hourline-core";

/// Destination ledger header, fixed order. Column 7 (`order`) is filled only
/// for pack task types.
pub const DEST_HEADER: [&str; 13] = [
    "full_name",
    "task_type",
    "quantity",
    "date",
    "hour",
    "occupied_minutes",
    "order",
    "perf_without_rotation",
    "perf_with_rotation",
    "negative_minutes",
    "pack_ratio",
    "username",
    "shift",
];

/// Task types as they appear in the `task_type` column of the destination
/// ledger and the KPI configuration table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    Receive,
    Locate,
    Sort,
    PackSingle,
    PackMulti,
    StockTaking,
    Pick,
    PickLarge,
    Presort,
    PresortLarge,
}

impl TaskType {
    pub fn label(self) -> &'static str {
        match self {
            Self::Receive => "Receive",
            Self::Locate => "Locate",
            Self::Sort => "Sort",
            Self::PackSingle => "Pack_Single",
            Self::PackMulti => "Pack_Multi",
            Self::StockTaking => "Stock taking",
            Self::Pick => "Pick",
            Self::PickLarge => "Pick_Large",
            Self::Presort => "Presort",
            Self::PresortLarge => "Presort_Large",
        }
    }

    /// Base type a large-batch variant falls back to for KPI lookup.
    pub fn base_type(self) -> Option<Self> {
        match self {
            Self::PickLarge => Some(Self::Pick),
            Self::PresortLarge => Some(Self::Presort),
            _ => None,
        }
    }

    pub fn is_pack(self) -> bool {
        matches!(self, Self::PackSingle | Self::PackMulti)
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Which side of a worker-hour an override directive forces to its
/// large-batch variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OverrideSide {
    Pick,
    Presort,
}

impl OverrideSide {
    pub fn standard(self) -> TaskType {
        match self {
            Self::Pick => TaskType::Pick,
            Self::Presort => TaskType::Presort,
        }
    }

    pub fn large(self) -> TaskType {
        match self {
            Self::Pick => TaskType::PickLarge,
            Self::Presort => TaskType::PresortLarge,
        }
    }

    /// Maps a free-text forced-side label. Case-tolerant, accepts Persian
    /// spellings, and strips an optional large-batch suffix before matching.
    pub fn from_label(raw: &str) -> Option<Self> {
        let mut label = normalize_identity(raw).to_lowercase();
        for suffix in ["_large", "_larg", "-large", " large"] {
            if let Some(stripped) = label.strip_suffix(suffix) {
                label = stripped.trim_end().to_string();
                break;
            }
        }
        match label.as_str() {
            "pick" | "\u{067e}\u{06cc}\u{06a9}" => Some(Self::Pick),
            "presort" | "pre-sort" | "pre sort" => Some(Self::Presort),
            // "پیش سورت", with and without the inter-word space (the
            // normalizer removes a joining ZWNJ).
            "\u{067e}\u{06cc}\u{0634} \u{0633}\u{0648}\u{0631}\u{062a}"
            | "\u{067e}\u{06cc}\u{0634}\u{0633}\u{0648}\u{0631}\u{062a}" => Some(Self::Presort),
            _ => None,
        }
    }
}

/// One normalized productivity event, ready for filtering/aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRow {
    pub identity: String,
    pub date: NaiveDate,
    pub hour: u8,
    pub quantity: f64,
    pub occupied_minutes: f64,
    pub username: String,
    /// Order count, present on packing rows only.
    pub order_count: Option<f64>,
}

/// Grouping key for hourly aggregation.
pub type HourKey = (String, NaiveDate, u8);

impl EventRow {
    pub fn hour_key(&self) -> HourKey {
        (self.identity.clone(), self.date, self.hour)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HourlyAggregate {
    pub quantity: f64,
    pub occupied_minutes: f64,
    pub username: String,
}

/// Effective-dated performance target for one task-type label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiConfig {
    pub task_label: String,
    pub base: f64,
    pub rotation: f64,
    pub effective: NaiveDate,
}

/// Forces one side of a specific worker-hour to its large-batch variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideDirective {
    pub identity: String,
    pub date: NaiveDate,
    pub hour: u8,
    pub side: OverrideSide,
}

// ---------------------------------------------------------------------------
// Identity normalization
// ---------------------------------------------------------------------------

/// Canonicalizes a free-text worker name into a stable identity key.
///
/// Decomposes (NFD), drops combining marks and invisible format characters,
/// folds Arabic/Persian look-alike letters onto one canonical form, recomposes
/// (NFC) and collapses whitespace. Idempotent.
pub fn normalize_identity(raw: &str) -> String {
    let folded: String = raw
        .nfd()
        .filter(|c| !is_combining_mark(*c) && !is_invisible(*c))
        .map(fold_lookalike)
        .collect();
    let composed: String = folded.nfc().collect();
    composed.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_invisible(c: char) -> bool {
    matches!(
        c,
        '\u{200B}'..='\u{200F}'
            | '\u{202A}'..='\u{202E}'
            | '\u{2060}'
            | '\u{2066}'..='\u{2069}'
            | '\u{FEFF}'
    )
}

fn fold_lookalike(c: char) -> char {
    match c {
        // Arabic yeh / alef maksura -> Farsi yeh
        '\u{064A}' | '\u{0649}' => '\u{06CC}',
        // Arabic kaf -> Farsi keheh
        '\u{0643}' => '\u{06A9}',
        // teh marbuta -> heh
        '\u{0629}' => '\u{0647}',
        _ => c,
    }
}

// ---------------------------------------------------------------------------
// Temporal parsing
// ---------------------------------------------------------------------------

/// Spreadsheet-style serial day epoch.
pub fn serial_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1899, 12, 30).expect("fixed epoch date")
}

/// Numeric date values above this are day counts from [`serial_epoch`].
pub const SERIAL_FLOOR: f64 = 30_000.0;

const DATE_FORMATS: [&str; 3] = ["%m/%d/%Y", "%B %d, %Y", "%Y-%m-%d"];
const DATETIME_FORMAT: &str = "%m/%d/%Y %H:%M:%S";

/// Parses the date cell of an event row: numeric serial day count first, then
/// the accepted text layouts in fixed priority order.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let t = raw.trim();
    if t.is_empty() {
        return None;
    }
    if let Ok(v) = t.parse::<f64>() {
        if v > SERIAL_FLOOR {
            return serial_epoch().checked_add_signed(chrono::Duration::days(v.trunc() as i64));
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(t, fmt) {
            return Some(d);
        }
    }
    NaiveDateTime::parse_from_str(t, DATETIME_FORMAT)
        .ok()
        .map(|dt| dt.date())
}

/// Parses the hour cell of an event row into an hour of day.
///
/// A digit string in 0..=23 is taken directly; any other numeric value is
/// interpreted as a fractional-day offset from the serial epoch and reduced
/// to its hour component.
pub fn parse_hour(raw: &str) -> Option<u8> {
    let t = raw.trim();
    if t.is_empty() {
        return None;
    }
    if t.bytes().all(|b| b.is_ascii_digit()) {
        let v: u64 = t.parse().ok()?;
        if v <= 23 {
            return Some(v as u8);
        }
        return serial_hour(v as f64);
    }
    serial_hour(t.parse().ok()?)
}

/// Hour component of a fractional serial-day value.
fn serial_hour(v: f64) -> Option<u8> {
    if !v.is_finite() || v < 0.0 {
        return None;
    }
    let frac = v - v.floor();
    Some((frac * 24.0).floor() as u8)
}

/// Date-only parsing used for block cutoffs and override fallbacks. Accepts
/// the datetime layout first, then plain dates, then a numeric serial.
pub fn parse_date_only(raw: &str) -> Option<NaiveDate> {
    let t = raw.trim();
    if t.is_empty() {
        return None;
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(t, DATETIME_FORMAT) {
        return Some(dt.date());
    }
    for fmt in ["%m/%d/%Y", "%Y-%m-%d", "%B %d, %Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(t, fmt) {
            return Some(d);
        }
    }
    let v: f64 = t.parse().ok()?;
    if v > SERIAL_FLOOR {
        return serial_epoch().checked_add_signed(chrono::Duration::days(v.floor() as i64));
    }
    None
}

// ---------------------------------------------------------------------------
// Destination-cell formatting
// ---------------------------------------------------------------------------

/// Renders a numeric cell without a trailing `.0` for integral values.
pub fn fmt_cell_num(v: f64) -> String {
    if !v.is_finite() {
        return String::new();
    }
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

pub fn fmt_cell_date(d: NaiveDate) -> String {
    format!("{:04}-{:02}-{:02}", d.year(), d.month(), d.day())
}

/// Stable numeric rendering of an arbitrary cell, used when rebuilding dedup
/// keys from pre-existing destination rows.
pub fn norm_num_text(raw: &str) -> String {
    let t = raw.trim();
    match t.parse::<f64>() {
        Ok(v) => fmt_cell_num(v),
        Err(_) => t.to_string(),
    }
}

/// Stable date rendering of an arbitrary cell.
pub fn norm_date_text(raw: &str) -> String {
    match parse_date_only(raw) {
        Some(d) => fmt_cell_date(d),
        None => raw.trim().to_string(),
    }
}

/// Shift tag derived from the username suffix convention.
pub fn shift_from_username(user: &str) -> &'static str {
    let lower = user.trim().to_lowercase();
    if lower.ends_with(".s1") {
        "Shift1"
    } else if lower.ends_with(".s2") {
        "Shift2"
    } else if lower.ends_with(".flex") {
        "Flex"
    } else {
        "Other"
    }
}

/// Four-part composite key guaranteeing at-most-once emission per
/// worker-hour-type.
pub fn dedup_key(full_name: &str, task_label: &str, date: &str, hour: &str) -> String {
    format!("{full_name}||{task_label}||{date}||{hour}")
}

/// One row of the reconciled ledger, pre-formatting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub full_name: String,
    pub task_type: TaskType,
    pub quantity: f64,
    pub date: NaiveDate,
    pub hour: u8,
    pub occupied_minutes: f64,
    pub order_count: Option<f64>,
    pub perf_without_rotation: Option<f64>,
    pub perf_with_rotation: Option<f64>,
    pub pack_ratio: Option<f64>,
    pub username: String,
}

impl OutputRecord {
    /// Unused minutes of the hour, only meaningful for partial hours.
    pub fn negative_minutes(&self) -> Option<f64> {
        if self.occupied_minutes > 0.0 && self.occupied_minutes < 60.0 {
            Some(60.0 - self.occupied_minutes)
        } else {
            None
        }
    }

    pub fn shift(&self) -> &'static str {
        shift_from_username(&self.username)
    }

    pub fn dedup_key(&self) -> String {
        dedup_key(
            &self.full_name,
            self.task_type.label(),
            &fmt_cell_date(self.date),
            &fmt_cell_num(f64::from(self.hour)),
        )
    }

    /// Formats the record into the 13 destination columns.
    pub fn cells(&self) -> Vec<String> {
        let order = if self.task_type.is_pack() {
            self.order_count.map(fmt_cell_num).unwrap_or_default()
        } else {
            String::new()
        };
        vec![
            self.full_name.clone(),
            self.task_type.label().to_string(),
            fmt_cell_num(self.quantity),
            fmt_cell_date(self.date),
            fmt_cell_num(f64::from(self.hour)),
            fmt_cell_num(self.occupied_minutes),
            order,
            fmt_percent(self.perf_without_rotation),
            fmt_percent(self.perf_with_rotation),
            self.negative_minutes().map(fmt_cell_num).unwrap_or_default(),
            self.pack_ratio.map(fmt_cell_num).unwrap_or_default(),
            self.username.clone(),
            self.shift().to_string(),
        ]
    }
}

fn fmt_percent(v: Option<f64>) -> String {
    v.map(|p| format!("{p:.1}%")).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn identities_differing_by_zero_width_joiner_collapse() {
        let a = normalize_identity("علی\u{200D} رضایی");
        let b = normalize_identity("علی رضایی");
        assert_eq!(a, b);
    }

    #[test]
    fn identity_folds_arabic_lookalikes_and_marks() {
        let arabic = normalize_identity("عـلي\u{064E} اكبري");
        let farsi = normalize_identity("عـلی اکبری");
        assert_eq!(arabic, farsi);
    }

    #[test]
    fn identity_collapses_whitespace_and_is_idempotent() {
        let once = normalize_identity("  Sara\t  Ahmadi ");
        assert_eq!(once, "Sara Ahmadi");
        assert_eq!(normalize_identity(&once), once);
    }

    #[test]
    fn serial_date_values_use_the_fixed_epoch() {
        // 45_292 days after 1899-12-30 is 2024-01-01.
        assert_eq!(parse_date("45292"), Some(d(2024, 1, 1)));
        assert_eq!(parse_date("45292.75"), Some(d(2024, 1, 1)));
    }

    #[test]
    fn text_date_layouts_resolve_in_priority_order() {
        assert_eq!(parse_date("3/10/2024"), Some(d(2024, 3, 10)));
        assert_eq!(parse_date("March 10, 2024"), Some(d(2024, 3, 10)));
        assert_eq!(parse_date("2024-03-10"), Some(d(2024, 3, 10)));
        assert_eq!(parse_date("3/10/2024 13:45:00"), Some(d(2024, 3, 10)));
        assert_eq!(parse_date("10 March 2024"), None);
        assert_eq!(parse_date("123"), None);
    }

    #[test]
    fn hour_variants_normalize_to_hour_of_day() {
        assert_eq!(parse_hour("7"), Some(7));
        assert_eq!(parse_hour("23"), Some(23));
        assert_eq!(parse_hour("0.3125"), Some(7)); // 07:30 as a day fraction
        assert_eq!(parse_hour("45292.5"), Some(12));
        assert_eq!(parse_hour(""), None);
        assert_eq!(parse_hour("abc"), None);
    }

    #[test]
    fn date_only_accepts_timestamps_and_serials() {
        assert_eq!(parse_date_only("3/10/2024 08:15:00"), Some(d(2024, 3, 10)));
        assert_eq!(parse_date_only("45292.9"), Some(d(2024, 1, 1)));
        assert_eq!(parse_date_only("29999"), None);
    }

    #[test]
    fn override_labels_are_tolerant() {
        assert_eq!(OverrideSide::from_label(" Pick "), Some(OverrideSide::Pick));
        assert_eq!(OverrideSide::from_label("PICK_LARGE"), Some(OverrideSide::Pick));
        assert_eq!(OverrideSide::from_label("Pre-Sort"), Some(OverrideSide::Presort));
        assert_eq!(OverrideSide::from_label("Presort_Larg"), Some(OverrideSide::Presort));
        assert_eq!(OverrideSide::from_label("پیک"), Some(OverrideSide::Pick));
        assert_eq!(OverrideSide::from_label("پیش‌سورت"), Some(OverrideSide::Presort));
        assert_eq!(OverrideSide::from_label("packing"), None);
    }

    #[test]
    fn shift_tags_follow_username_suffixes() {
        assert_eq!(shift_from_username("a.rezaei.s1"), "Shift1");
        assert_eq!(shift_from_username("A.Rezaei.S2"), "Shift2");
        assert_eq!(shift_from_username("s.ahmadi.flex"), "Flex");
        assert_eq!(shift_from_username("warehouse7"), "Other");
    }

    #[test]
    fn numeric_cells_render_without_spurious_decimals() {
        assert_eq!(fmt_cell_num(22.0), "22");
        assert_eq!(fmt_cell_num(1.25), "1.25");
        assert_eq!(norm_num_text("7.0"), "7");
        assert_eq!(norm_num_text("n/a"), "n/a");
    }

    #[test]
    fn output_record_cells_and_key() {
        let rec = OutputRecord {
            full_name: "Sara Ahmadi".into(),
            task_type: TaskType::PackSingle,
            quantity: 30.0,
            date: d(2024, 5, 2),
            hour: 9,
            occupied_minutes: 45.0,
            order_count: Some(27.0),
            perf_without_rotation: Some(95.456),
            perf_with_rotation: Some(101.0),
            pack_ratio: Some(1.11),
            username: "s.ahmadi.s1".into(),
        };
        assert_eq!(
            rec.cells(),
            vec![
                "Sara Ahmadi",
                "Pack_Single",
                "30",
                "2024-05-02",
                "9",
                "45",
                "27",
                "95.5%",
                "101.0%",
                "15",
                "1.11",
                "s.ahmadi.s1",
                "Shift1",
            ]
        );
        assert_eq!(rec.dedup_key(), "Sara Ahmadi||Pack_Single||2024-05-02||9");
    }

    #[test]
    fn negative_minutes_only_for_partial_hours() {
        let mut rec = OutputRecord {
            full_name: "x".into(),
            task_type: TaskType::Sort,
            quantity: 20.0,
            date: d(2024, 1, 1),
            hour: 8,
            occupied_minutes: 60.0,
            order_count: None,
            perf_without_rotation: None,
            perf_with_rotation: None,
            pack_ratio: None,
            username: String::new(),
        };
        assert_eq!(rec.negative_minutes(), None);
        rec.occupied_minutes = 61.0;
        assert_eq!(rec.negative_minutes(), None);
        rec.occupied_minutes = 41.0;
        assert_eq!(rec.negative_minutes(), Some(19.0));
    }
}
