use super::*;

struct NoLayout;

static L: NoLayout = NoLayout;

fn table() -> Vec<ModelMatch<NoLayout>> {
    vec![
        ModelMatch {
            pattern: &[0xAA, 0x01, 0, 0, 0xBB],
            firmware_min: 0x0200,
            model: 1,
            name: "one",
            layout: &L,
        },
        ModelMatch {
            pattern: &[0xAA, 0x01, 0, 0, 0xBB],
            firmware_min: 0,
            model: 2,
            name: "one-legacy",
            layout: &L,
        },
        ModelMatch {
            pattern: &[0xAA, 0x02, 0, 0, 0, 0, 0, 0],
            firmware_min: 0,
            model: 3,
            name: "two",
            layout: &L,
        },
    ]
}

#[test]
fn literal_bytes_must_match() {
    let table = table();
    assert!(match_version(&table, &[0xAB, 0x01, 9, 9, 0xBB]).is_none());
    assert!(match_version(&table, &[0xAA, 0x01, 9, 9, 0xBC]).is_none());
}

#[test]
fn wildcards_extract_the_firmware() {
    let table = table();
    let (row, firmware) =
        match_version(&table, &[0xAA, 0x01, 0x03, 0x15, 0xBB]).unwrap();
    assert_eq!(row.model, 1);
    assert_eq!(firmware, 0x0315);
}

#[test]
fn firmware_minimum_falls_through_to_a_later_row() {
    let table = table();
    // too old for the first row, accepted by the legacy row
    let (row, firmware) =
        match_version(&table, &[0xAA, 0x01, 0x01, 0x00, 0xBB]).unwrap();
    assert_eq!(row.model, 2);
    assert_eq!(firmware, 0x0100);
}

#[test]
fn only_the_first_wildcard_run_feeds_the_firmware() {
    let rows = vec![ModelMatch {
        pattern: &[0x10, 0, 0, 0x20, 0, 0],
        firmware_min: 0,
        model: 9,
        name: "split",
        layout: &L,
    }];
    let (_, firmware) =
        match_version(&rows, &[0x10, 0xAB, 0xCD, 0x20, 0xFF, 0xFF])
            .unwrap();
    assert_eq!(firmware, 0xABCD);
}

#[test]
fn long_wildcard_runs_cap_at_four_bytes() {
    let rows = vec![ModelMatch {
        pattern: &[0x10, 0, 0, 0, 0, 0, 0],
        firmware_min: 0,
        model: 9,
        name: "wide",
        layout: &L,
    }];
    let (_, firmware) =
        match_version(&rows, &[0x10, 1, 2, 3, 4, 5, 6]).unwrap();
    assert_eq!(firmware, 0x01020304);
}

#[test]
fn short_version_records_never_match() {
    let table = table();
    assert!(match_version(&table, &[0xAA, 0x01, 0x03]).is_none());
}

#[test]
fn longer_version_records_match_on_the_prefix() {
    let table = table();
    let (row, _) =
        match_version(&table, &[0xAA, 0x01, 0x03, 0x15, 0xBB, 0x99, 0x77])
            .unwrap();
    assert_eq!(row.model, 1);
}

#[test]
fn all_literal_pattern_has_firmware_zero() {
    let rows = vec![ModelMatch {
        pattern: &[0x55, 0x66],
        firmware_min: 0,
        model: 9,
        name: "fixed",
        layout: &L,
    }];
    let (_, firmware) = match_version(&rows, &[0x55, 0x66]).unwrap();
    assert_eq!(firmware, 0);
}

#[test]
fn serial_decodes_by_format() {
    assert_eq!(
        decode_serial(&[0x00, 0x01, 0xE2, 0x40], SerialFormat::Binary),
        123_456
    );
    assert_eq!(decode_serial(&[1, 2, 3, 4], SerialFormat::Bcd), 1234);
    assert_eq!(
        decode_serial(&[0x12, 0x34, 0x56, 0x78], SerialFormat::PackedBcd),
        12_345_678
    );
}
