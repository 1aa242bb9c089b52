/// Structural checks on the migration file — table, index, and constraint
/// presence — separate from the testcontainers-backed behavioral tests in
/// `store_events.rs`.
const MIGRATION_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/migrations/0001_init.sql");

fn read_migration() -> String {
    std::fs::read_to_string(MIGRATION_PATH).expect("migration file should exist")
}

#[test]
fn migration_file_exists_and_is_nonempty() {
    assert!(!read_migration().trim().is_empty());
}

#[test]
fn events_table_has_the_expected_columns() {
    let sql = read_migration();
    for column in ["id", "pubkey", "created_at", "kind", "tags", "content", "sig", "d_tag"] {
        assert!(sql.contains(column), "events table must define column {column}");
    }
}

#[test]
fn events_has_hex_shape_check_constraints() {
    let sql = read_migration();
    assert!(sql.contains("events_id_hex"), "id must have a hex-shape check constraint");
    assert!(sql.contains("events_pubkey_hex"), "pubkey must have a hex-shape check constraint");
    assert!(sql.contains("events_sig_hex"), "sig must have a hex-shape check constraint");
}

#[test]
fn events_has_the_replaceable_and_addressable_partial_unique_indexes() {
    let sql = read_migration();
    assert!(sql.contains("events_replaceable_uidx"), "missing the replaceable partial unique index");
    assert!(sql.contains("events_addressable_uidx"), "missing the addressable partial unique index");
    assert!(sql.contains("d_tag"), "addressable index must key on d_tag");
}

#[test]
fn events_has_a_gin_index_on_tags() {
    let sql = read_migration();
    assert!(sql.to_uppercase().contains("USING GIN"), "tags must be indexed with GIN for tag-clause lookups");
}

#[test]
fn events_has_created_at_and_pubkey_kind_indexes() {
    let sql = read_migration();
    assert!(sql.contains("events_created_at_idx"));
    assert!(sql.contains("events_pubkey_kind_idx"));
    assert!(sql.contains("events_pubkey_kind_created_at_idx"));
}
