//! Owns the schema: the value table, per-function memo tables, the
//! provenance table and the event log (spec §4.F), and the operations that
//! keep them consistent with each other inside one transaction.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use indexmap::IndexMap;
use sqlx::Row as SqlxRow;
use tokio::sync::RwLock;
use tracing::debug;

use memoir_core::call::{Call, FuncOp};
use memoir_core::uid::Uid;
use memoir_core::value::ValueRef;

use crate::backend::SqliteBackend;
use crate::error::Result;
use crate::schema::{
    create_memo_table_sql, CAUSAL_UID_COL, EVENT_LOG_TABLE, PROVENANCE_TABLE, UID_COL,
    VALUE_TABLE,
};

/// Direction of a provenance edge, per spec §3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Input => "input",
            Direction::Output => "output",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "input" => Direction::Input,
            _ => Direction::Output,
        }
    }
}

/// One row of `__provenance__`.
#[derive(Clone, Debug)]
pub struct ProvenanceRow {
    pub call_uid: Uid,
    pub vref_uid: Uid,
    pub direction: Direction,
    pub name_or_index: String,
    pub versioned_internal_name: String,
}

pub struct RelAdapter {
    backend: Arc<SqliteBackend>,
    known_tables: RwLock<HashSet<String>>,
}

impl RelAdapter {
    pub fn new(backend: Arc<SqliteBackend>) -> Self {
        RelAdapter {
            backend,
            known_tables: RwLock::new(HashSet::new()),
        }
    }

    async fn ensure_memo_table(&self, func_op: &FuncOp) -> Result<String> {
        let table = func_op.sig.versioned_ui_name();
        if !self.known_tables.read().await.contains(&table) {
            let ddl = create_memo_table_sql(&table, &func_op.sig.input_names, func_op.sig.n_outputs());
            self.backend.ensure_table(&ddl).await?;
            self.known_tables.write().await.insert(table.clone());
        }
        Ok(table)
    }

    /// Fetch a value's payload. Returns `None` if the value has never been
    /// committed.
    pub async fn obj_get(&self, uid: &Uid) -> Result<Option<ValueRef>> {
        let row = sqlx::query(&format!("SELECT value FROM {VALUE_TABLE} WHERE {UID_COL} = ?"))
            .bind(uid.as_str())
            .fetch_optional(self.backend.pool())
            .await?;
        Ok(row.map(|r| {
            let bytes: Vec<u8> = r.get("value");
            ValueRef::lazy(uid.clone(), uid.clone()).with_loaded_bytes(bytes)
        }))
    }

    pub async fn obj_gets(&self, uids: &[Uid]) -> Result<Vec<ValueRef>> {
        let mut out = Vec::with_capacity(uids.len());
        for uid in uids {
            if let Some(v) = self.obj_get(uid).await? {
                out.push(v);
            }
        }
        Ok(out)
    }

    /// Persist values, each keyed by its full causal `uid` (spec §6's
    /// `__vrefs__` schema keys on `uid`, not `content_uid`). One event-log
    /// row per value.
    pub async fn obj_sets(&self, values: &IndexMap<Uid, ValueRef>) -> Result<()> {
        let mut tx = self.backend.pool().begin().await?;
        for (uid, vref) in values {
            let bytes = vref.payload_bytes().ok_or_else(|| {
                crate::error::StoreError::Core(memoir_core::error::Error::NotInMemory(uid.clone()))
            })?;
            sqlx::query(&format!(
                "INSERT OR REPLACE INTO {VALUE_TABLE} ({UID_COL}, value) VALUES (?, ?)"
            ))
            .bind(uid.as_str())
            .bind(bytes)
            .execute(&mut *tx)
            .await?;
            sqlx::query(&format!(
                "INSERT INTO {EVENT_LOG_TABLE} ({UID_COL}, \"table\", ts) VALUES (?, ?, ?)"
            ))
            .bind(uid.as_str())
            .bind(VALUE_TABLE)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(count = values.len(), "persisted values");
        Ok(())
    }

    pub async fn call_exists(&self, func_op: &FuncOp, call_uid: &Uid) -> Result<bool> {
        let table = self.ensure_memo_table(func_op).await?;
        let row = sqlx::query(&format!("SELECT 1 as present FROM \"{table}\" WHERE {UID_COL} = ?"))
            .bind(call_uid.as_str())
            .fetch_optional(self.backend.pool())
            .await?;
        Ok(row.is_some())
    }

    /// Load a call with its input/output UIDs only (no payloads) — callers
    /// load payloads separately via `obj_get`/`obj_gets` and reattach with
    /// `Call::set_input_values`/`set_output_values`.
    pub async fn call_get_lazy(&self, func_op: &FuncOp, call_uid: &Uid) -> Result<Option<Call>> {
        let table = self.ensure_memo_table(func_op).await?;
        let row = sqlx::query(&format!("SELECT * FROM \"{table}\" WHERE {UID_COL} = ?"))
            .bind(call_uid.as_str())
            .fetch_optional(self.backend.pool())
            .await?;
        let Some(row) = row else { return Ok(None) };

        let mut input_uids = IndexMap::new();
        for name in &func_op.sig.input_names {
            let uid_text: String = row.get(name.as_str());
            input_uids.insert(name.clone(), Uid::from_hex(uid_text));
        }
        let mut output_uids = Vec::with_capacity(func_op.sig.n_outputs());
        for i in 0..func_op.sig.n_outputs() {
            let uid_text: String = row.get(format!("output_{i}").as_str());
            output_uids.push(Uid::from_hex(uid_text));
        }
        Ok(Some(Call::lazy(
            call_uid.clone(),
            func_op.clone(),
            input_uids,
            output_uids,
        )))
    }

    /// Every memoized call for `func_op`, lazily (UIDs only), in insertion
    /// order. Used by `memoir-provenance::from_op` to materialize a
    /// function's whole memoization table as one `CallNode`.
    pub async fn all_calls(&self, func_op: &FuncOp) -> Result<Vec<Call>> {
        let table = self.ensure_memo_table(func_op).await?;
        let rows = sqlx::query(&format!("SELECT * FROM \"{table}\""))
            .fetch_all(self.backend.pool())
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let call_uid: String = row.get(UID_COL);
            let mut input_uids = IndexMap::new();
            for name in &func_op.sig.input_names {
                let uid_text: String = row.get(name.as_str());
                input_uids.insert(name.clone(), Uid::from_hex(uid_text));
            }
            let mut output_uids = Vec::with_capacity(func_op.sig.n_outputs());
            for i in 0..func_op.sig.n_outputs() {
                let uid_text: String = row.get(format!("output_{i}").as_str());
                output_uids.push(Uid::from_hex(uid_text));
            }
            out.push(Call::lazy(Uid::from_hex(call_uid), func_op.clone(), input_uids, output_uids));
        }
        Ok(out)
    }

    /// For each of `vref_uids`, the provenance row recording its creating
    /// call (if any) — `direction = output`. Used by `back()` to find each
    /// value's producing call and output name.
    pub async fn creator_rows_for(&self, vref_uids: &[Uid]) -> Result<IndexMap<Uid, ProvenanceRow>> {
        if vref_uids.is_empty() {
            return Ok(IndexMap::new());
        }
        let placeholders = vec!["?"; vref_uids.len()].join(", ");
        let sql = format!(
            "SELECT call_uid, vref_uid, direction, name, op_internal_name FROM {PROVENANCE_TABLE} WHERE direction = 'output' AND vref_uid IN ({placeholders})"
        );
        let mut q = sqlx::query(&sql);
        for uid in vref_uids {
            q = q.bind(uid.as_str());
        }
        let rows = q.fetch_all(self.backend.pool()).await?;
        let mut out = IndexMap::new();
        for r in rows {
            let vref_uid: String = r.get("vref_uid");
            let row = ProvenanceRow {
                call_uid: Uid::from_hex(r.get::<String, _>("call_uid")),
                vref_uid: Uid::from_hex(vref_uid.clone()),
                direction: Direction::from_str(&r.get::<String, _>("direction")),
                name_or_index: r.get("name"),
                versioned_internal_name: r.get("op_internal_name"),
            };
            out.insert(Uid::from_hex(vref_uid), row);
        }
        Ok(out)
    }

    /// Every input-direction provenance row for the given `call_uids`, i.e.
    /// what each call consumed and under what name.
    pub async fn input_rows_for_calls(&self, call_uids: &[Uid]) -> Result<Vec<ProvenanceRow>> {
        if call_uids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; call_uids.len()].join(", ");
        let sql = format!(
            "SELECT call_uid, vref_uid, direction, name, op_internal_name FROM {PROVENANCE_TABLE} WHERE direction = 'input' AND call_uid IN ({placeholders})"
        );
        let mut q = sqlx::query(&sql);
        for uid in call_uids {
            q = q.bind(uid.as_str());
        }
        let rows = q.fetch_all(self.backend.pool()).await?;
        Ok(rows
            .iter()
            .map(|r| ProvenanceRow {
                call_uid: Uid::from_hex(r.get::<String, _>("call_uid")),
                vref_uid: Uid::from_hex(r.get::<String, _>("vref_uid")),
                direction: Direction::from_str(&r.get::<String, _>("direction")),
                name_or_index: r.get("name"),
                versioned_internal_name: r.get("op_internal_name"),
            })
            .collect())
    }

    /// Persist calls, their provenance rows and event-log rows atomically,
    /// in that order, per spec §4.G's commit ordering.
    pub async fn upsert_calls(&self, calls: &[Call]) -> Result<()> {
        for call in calls {
            let table = self.ensure_memo_table(&call.func_op).await?;
            let mut tx = self.backend.pool().begin().await?;

            let mut columns = vec![UID_COL.to_string(), CAUSAL_UID_COL.to_string()];
            let mut values = vec![call.uid.as_str().to_string(), call.causal_uid.as_str().to_string()];
            for name in &call.func_op.sig.input_names {
                columns.push(format!("\"{name}\""));
                values.push(call.inputs[name].uid().as_str().to_string());
            }
            for (i, out) in call.outputs.iter().enumerate() {
                columns.push(format!("output_{i}"));
                values.push(out.uid().as_str().to_string());
            }
            let placeholders = vec!["?"; values.len()].join(", ");
            let sql = format!(
                "INSERT OR REPLACE INTO \"{table}\" ({}) VALUES ({placeholders})",
                columns.join(", ")
            );
            let mut q = sqlx::query(&sql);
            for v in &values {
                q = q.bind(v.clone());
            }
            q.execute(&mut *tx).await?;

            let versioned = call.func_op.sig.versioned_internal_name();
            for (name, vref) in &call.inputs {
                sqlx::query(&format!(
                    "INSERT INTO {PROVENANCE_TABLE} (call_uid, vref_uid, direction, name, op_internal_name) VALUES (?, ?, ?, ?, ?)"
                ))
                .bind(call.uid.as_str())
                .bind(vref.uid().as_str())
                .bind(Direction::Input.as_str())
                .bind(name)
                .bind(&versioned)
                .execute(&mut *tx)
                .await?;
            }
            for (i, vref) in call.outputs.iter().enumerate() {
                sqlx::query(&format!(
                    "INSERT INTO {PROVENANCE_TABLE} (call_uid, vref_uid, direction, name, op_internal_name) VALUES (?, ?, ?, ?, ?)"
                ))
                .bind(call.uid.as_str())
                .bind(vref.uid().as_str())
                .bind(Direction::Output.as_str())
                .bind(format!("output_{i}"))
                .bind(&versioned)
                .execute(&mut *tx)
                .await?;
            }

            sqlx::query(&format!(
                "INSERT INTO {EVENT_LOG_TABLE} ({UID_COL}, \"table\", ts) VALUES (?, ?, ?)"
            ))
            .bind(call.uid.as_str())
            .bind(&table)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
        }
        Ok(())
    }

    pub async fn get_event_log(&self) -> Result<Vec<crate::backend::Record>> {
        self.backend.get_data(EVENT_LOG_TABLE).await
    }

    pub async fn clear_event_log(&self) -> Result<()> {
        sqlx::query(&format!("DELETE FROM {EVENT_LOG_TABLE}"))
            .execute(self.backend.pool())
            .await?;
        Ok(())
    }

    /// Shared handle to the underlying backend, for callers (e.g.
    /// `memoir-sync`) that need to join the event log against arbitrary
    /// tables or upsert rows whose shape this adapter doesn't otherwise
    /// know about.
    pub fn backend(&self) -> Arc<SqliteBackend> {
        self.backend.clone()
    }

    /// Rows of `table` whose primary `uid` is one of `uids`, in `uids`'
    /// order is not guaranteed — callers join by `uid` again if order
    /// matters.
    pub async fn rows_by_uids(&self, table: &str, uids: &[Uid]) -> Result<Vec<crate::backend::Record>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; uids.len()].join(", ");
        let sql = format!("SELECT * FROM \"{table}\" WHERE {UID_COL} IN ({placeholders})");
        let mut q = sqlx::query(&sql);
        for uid in uids {
            q = q.bind(uid.as_str());
        }
        let rows = q.fetch_all(self.backend.pool()).await?;
        Ok(rows.iter().map(crate::backend::decode_row).collect())
    }

    /// For each builtin constructor call in the provenance table, derive
    /// implicit edges from the container value to its members and back, so
    /// a `back()` expansion or `eval()` over a member value can still reach
    /// (or be reached from) the container (spec §4.F, §9).
    pub async fn propagate_struct_provenance(&self, builtin_ops: &[String]) -> Result<usize> {
        if builtin_ops.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; builtin_ops.len()].join(", ");
        let sql = format!(
            "SELECT call_uid, vref_uid, direction, name, op_internal_name FROM {PROVENANCE_TABLE} WHERE op_internal_name IN ({placeholders})"
        );
        let mut q = sqlx::query(&sql);
        for op in builtin_ops {
            q = q.bind(op);
        }
        let rows = q.fetch_all(self.backend.pool()).await?;

        let mut by_call: std::collections::HashMap<String, Vec<ProvenanceRow>> = Default::default();
        for r in &rows {
            let call_uid: String = r.get("call_uid");
            let vref_uid: String = r.get("vref_uid");
            let direction: String = r.get("direction");
            let name: String = r.get("name");
            let op: String = r.get("op_internal_name");
            by_call.entry(call_uid.clone()).or_default().push(ProvenanceRow {
                call_uid: Uid::from_hex(call_uid),
                vref_uid: Uid::from_hex(vref_uid),
                direction: Direction::from_str(&direction),
                name_or_index: name,
                versioned_internal_name: op,
            });
        }

        let mut inserted = 0usize;
        let mut tx = self.backend.pool().begin().await?;
        for group in by_call.values() {
            // A construct call's single output is the container; every
            // input is a member. Add a direct member <-> container edge
            // labeled with the builtin's own op name so it's distinguishable
            // from the call's own input/output edges.
            let container = group.iter().find(|r| r.direction == Direction::Output);
            let Some(container) = container else { continue };
            for member in group.iter().filter(|r| r.direction == Direction::Input) {
                sqlx::query(&format!(
                    "INSERT INTO {PROVENANCE_TABLE} (call_uid, vref_uid, direction, name, op_internal_name) VALUES (?, ?, ?, ?, ?)"
                ))
                .bind(container.call_uid.as_str())
                .bind(member.vref_uid.as_str())
                .bind("member")
                .bind(&member.name_or_index)
                .bind(&container.versioned_internal_name)
                .execute(&mut *tx)
                .await?;
                inserted += 1;
            }
        }
        tx.commit().await?;
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use memoir_core::call::ComputeInputs;
    use memoir_core::hash::hash_value;
    use memoir_core::signature::Signature;
    use memoir_core::value::ValueRef;

    fn func_op() -> FuncOp {
        let sig = Signature::new("add", vec!["a".to_string(), "b".to_string()], 1);
        FuncOp::new(sig, |_inputs: ComputeInputs| Ok(vec![vec![]]))
    }

    #[tokio::test]
    async fn upsert_then_lazy_load_round_trips_uids() {
        let backend = Arc::new(SqliteBackend::in_memory().await.unwrap());
        let adapter = RelAdapter::new(backend);
        let op = func_op();

        let a = ValueRef::wrap(&1i64).unwrap();
        let b = ValueRef::wrap(&2i64).unwrap();
        let call_uid = hash_value(&"some-call".to_string());
        let out = ValueRef::wrap(&3i64).unwrap();

        let mut inputs = IndexMap::new();
        inputs.insert("a".to_string(), a.clone());
        inputs.insert("b".to_string(), b.clone());
        let call = Call::new(call_uid.clone(), op.clone(), inputs, vec![out.clone()]);

        adapter.upsert_calls(&[call.clone()]).await.unwrap();
        assert!(adapter.call_exists(&op, &call_uid).await.unwrap());

        let lazy = adapter.call_get_lazy(&op, &call_uid).await.unwrap().unwrap();
        assert_eq!(lazy.inputs["a"].uid(), a.uid());
        assert_eq!(lazy.outputs[0].uid(), out.uid());
    }

    #[tokio::test]
    async fn obj_sets_then_obj_get_round_trips_payload() {
        let backend = Arc::new(SqliteBackend::in_memory().await.unwrap());
        let adapter = RelAdapter::new(backend);
        let v = ValueRef::wrap(&"hello".to_string()).unwrap();
        let mut map = IndexMap::new();
        map.insert(v.uid().clone(), v.clone());
        adapter.obj_sets(&map).await.unwrap();

        let loaded = adapter.obj_get(v.uid()).await.unwrap().unwrap();
        let s: String = loaded.unwrap().unwrap();
        assert_eq!(s, "hello");
    }

    #[tokio::test]
    async fn event_log_records_every_write_and_clears() {
        let backend = Arc::new(SqliteBackend::in_memory().await.unwrap());
        let adapter = RelAdapter::new(backend);
        let v = ValueRef::wrap(&1i64).unwrap();
        let mut map = IndexMap::new();
        map.insert(v.uid().clone(), v);
        adapter.obj_sets(&map).await.unwrap();

        let log = adapter.get_event_log().await.unwrap();
        assert_eq!(log.len(), 1);
        adapter.clear_event_log().await.unwrap();
        let log = adapter.get_event_log().await.unwrap();
        assert!(log.is_empty());
    }
}
