use hourline_adapters::{read_source_rows, SourceKind};

fn grid(rows: &[&[&str]]) -> Vec<Vec<String>> {
    rows.iter()
        .map(|r| r.iter().map(|c| c.to_string()).collect())
        .collect()
}

// A realistic pick-table snapshot: serial dates, fractional-day hours and a
// retyped header, the way the upstream loggers actually deliver them.
#[test]
fn pick_snapshot_parses_end_to_end() {
    let g = grid(&[
        &["Full_Name", "Date", "Hour", "Start", "End", "Count", "UserName"],
        &["علی رضایی", "45292", "0.375", "0", "40", "18", "a.rezaei.s1"],
        &["علي رضایی", "1/1/2024", "9", "45", "59", "7", "a.rezaei.s1"],
        &["", "45292", "9", "0", "10", "5", ""],
    ]);

    let parsed = read_source_rows(SourceKind::Pick, &g, None).unwrap();
    assert_eq!(parsed.events.len(), 2);
    assert_eq!(parsed.skipped.len(), 1);

    // both spellings of the same worker collapse to one identity key
    assert_eq!(parsed.events[0].identity, parsed.events[1].identity);
    assert_eq!(parsed.events[0].hour, 9);
    assert_eq!(parsed.events[0].date.to_string(), "2024-01-01");
    assert_eq!(parsed.events[0].occupied_minutes, 41.0);
}
