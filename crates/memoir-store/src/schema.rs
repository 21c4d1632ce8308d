//! The stable schema from spec §6, built the way
//! `toka_store_sqlite::SqliteBackend::migrate` builds its two tables:
//! idempotent `CREATE TABLE IF NOT EXISTS` + `STRICT`.

/// `__vrefs__(uid TEXT PK, value BLOB)`
pub const VALUE_TABLE: &str = "__vrefs__";
/// `__provenance__(call_uid TEXT, vref_uid TEXT, direction TEXT, name TEXT, op_internal_name TEXT)`
pub const PROVENANCE_TABLE: &str = "__provenance__";
/// `__event_log__(uid TEXT, table TEXT, ts TIMESTAMP)`
pub const EVENT_LOG_TABLE: &str = "__event_log__";

pub const UID_COL: &str = "uid";
pub const CAUSAL_UID_COL: &str = "causal_uid";

pub fn create_value_table_sql() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {VALUE_TABLE} (\
            {UID_COL} TEXT PRIMARY KEY, \
            value BLOB NOT NULL\
        ) STRICT"
    )
}

pub fn create_provenance_table_sql() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {PROVENANCE_TABLE} (\
            call_uid TEXT NOT NULL, \
            vref_uid TEXT NOT NULL, \
            direction TEXT NOT NULL, \
            name TEXT NOT NULL, \
            op_internal_name TEXT NOT NULL\
        ) STRICT"
    )
}

pub fn create_event_log_table_sql() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {EVENT_LOG_TABLE} (\
            {UID_COL} TEXT NOT NULL, \
            \"table\" TEXT NOT NULL, \
            ts TEXT NOT NULL\
        ) STRICT"
    )
}

/// DDL for a per-function memo table, named by the function's versioned UI
/// name: `uid`, `causal_uid`, one column per input name, and `output_0..N-1`.
pub fn create_memo_table_sql(table_name: &str, input_names: &[String], n_outputs: usize) -> String {
    let mut cols = vec![
        format!("{UID_COL} TEXT PRIMARY KEY"),
        format!("{CAUSAL_UID_COL} TEXT NOT NULL"),
    ];
    for input in input_names {
        cols.push(format!("\"{input}\" TEXT NOT NULL"));
    }
    for i in 0..n_outputs {
        cols.push(format!("output_{i} TEXT"));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS \"{table_name}\" ({}) STRICT",
        cols.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memo_table_sql_has_one_column_per_input_and_output() {
        let sql = create_memo_table_sql("add@1", &["a".to_string(), "b".to_string()], 1);
        assert!(sql.contains("\"a\""));
        assert!(sql.contains("\"b\""));
        assert!(sql.contains("output_0"));
        assert!(sql.contains(CAUSAL_UID_COL));
    }
}
