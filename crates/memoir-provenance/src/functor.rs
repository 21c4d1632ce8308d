//! Arena-based provenance subgraph (spec §4.I): `ValNode`s and `CallNode`s
//! reference each other by index rather than by owned pointer, since the
//! two node kinds are mutually referential (a value's creator is a call, a
//! call's inputs are values) and Rust has no safe way to express that as a
//! cycle of owned references.

use std::collections::{BTreeSet, HashMap, HashSet};

use indexmap::IndexMap;

use memoir_core::call::FuncOp;
use memoir_core::hash::hash_value;
use memoir_core::signature::Signature;
use memoir_core::uid::Uid;
use memoir_core::value::ValueRef;
use memoir_store::adapter::RelAdapter;

use crate::error::{ProvenanceError, Result};

pub type ValNodeId = usize;
pub type CallNodeId = usize;

/// One column's worth of content-addressed values, all produced (if at all)
/// the same way: `refs_hash` is a function of `refs` alone, so two value
/// sets with identical content and ordering always collapse to one node.
#[derive(Clone, Debug)]
pub struct ValNode {
    pub ty: Option<String>,
    pub refs: Vec<ValueRef>,
    /// Per-row producing call, if known.
    pub creators: Vec<Option<CallNodeId>>,
    /// Per-row output name under which the producing call emitted this row.
    pub created_as: Vec<Option<String>>,
    /// Per-row list of (consuming call, input name) edges discovered so far.
    pub consumers: Vec<Vec<(CallNodeId, String)>>,
    pub refs_hash: Uid,
}

impl ValNode {
    fn new(refs: Vec<ValueRef>) -> Self {
        let n = refs.len();
        let refs_hash = hash_refs(&refs);
        ValNode {
            ty: None,
            refs,
            creators: vec![None; n],
            created_as: vec![None; n],
            consumers: vec![Vec::new(); n],
            refs_hash,
        }
    }

    fn recompute_hash(&mut self) {
        self.refs_hash = hash_refs(&self.refs);
    }
}

fn hash_refs(refs: &[ValueRef]) -> Uid {
    let uids: Vec<Uid> = refs.iter().map(|r| r.uid().clone()).collect();
    hash_value(&uids)
}

/// A group of calls to the same (versioned) function, sharing one identity
/// (`call_uids_hash`) within the subgraph.
#[derive(Clone, Debug)]
pub struct CallNode {
    pub func_op: FuncOp,
    pub inputs: IndexMap<String, ValNodeId>,
    pub outputs: IndexMap<String, ValNodeId>,
    pub call_uids: Vec<Uid>,
    pub call_uids_hash: Uid,
    pub orientation: Option<String>,
}

fn filter_by_mask<T: Clone>(items: &[T], keep: &[bool]) -> Vec<T> {
    items
        .iter()
        .zip(keep)
        .filter_map(|(item, k)| k.then(|| item.clone()))
        .collect()
}

fn split_versioned(versioned: &str) -> (String, u32) {
    match versioned.rsplit_once('@') {
        Some((name, version)) => (name.to_string(), version.parse().unwrap_or(1)),
        None => (versioned.to_string(), 1),
    }
}

/// A queryable, read-only view over a subgraph of persisted provenance.
///
/// Never mutated in place by its query/reshape operations (`mask`, `back`,
/// `rename` excepted, which model the Python original's in-place API but
/// operate on an owned `Self` here) — callers chain `let rf2 = rf.mask(...)`.
#[derive(Clone, Debug, Default)]
pub struct ProvenanceFunctor {
    val_nodes: Vec<ValNode>,
    call_nodes: Vec<CallNode>,
    columns: IndexMap<String, ValNodeId>,
}

impl ProvenanceFunctor {
    /// One `ValNode` named `v0`, with no known provenance yet (spec §4.I
    /// `from_refs`). `storage` isn't touched here — it exists only so a
    /// caller already holding one can pass it without an extra branch before
    /// going on to call `back`.
    pub fn from_refs(refs: Vec<ValueRef>, _storage: &RelAdapter) -> Self {
        let mut rf = ProvenanceFunctor::default();
        let id = rf.push_val_node(ValNode::new(refs));
        rf.columns.insert("v0".to_string(), id);
        rf
    }

    /// Materializes a function's entire memoization table as one
    /// `CallNode`, with one named `ValNode` per input and per output
    /// (`output_0..output_{n-1}`), rows aligned by call (spec §4.I
    /// `from_op`).
    pub async fn from_op(func_op: &FuncOp, storage: &RelAdapter) -> Result<Self> {
        let calls = storage.all_calls(func_op).await?;
        let mut rf = ProvenanceFunctor::default();

        let call_uids: Vec<Uid> = calls.iter().map(|c| c.uid.clone()).collect();
        let call_uids_hash = hash_value(&call_uids);
        let call_node_id = rf.call_nodes.len();
        rf.call_nodes.push(CallNode {
            func_op: func_op.clone(),
            inputs: IndexMap::new(),
            outputs: IndexMap::new(),
            call_uids,
            call_uids_hash,
            orientation: func_op.is_builtin.then(|| "builtin".to_string()),
        });

        for name in &func_op.sig.input_names {
            let refs: Vec<ValueRef> = calls.iter().map(|c| c.inputs[name].clone()).collect();
            let mut node = ValNode::new(refs);
            for c in node.consumers.iter_mut() {
                c.push((call_node_id, name.clone()));
            }
            let id = rf.push_val_node(node);
            rf.call_nodes[call_node_id].inputs.insert(name.clone(), id);
            rf.columns.insert(name.clone(), id);
        }

        for i in 0..func_op.sig.n_outputs() {
            let out_name = format!("output_{i}");
            let refs: Vec<ValueRef> = calls.iter().map(|c| c.outputs[i].clone()).collect();
            let mut node = ValNode::new(refs);
            for (creator, created_as) in node.creators.iter_mut().zip(node.created_as.iter_mut()) {
                *creator = Some(call_node_id);
                *created_as = Some(out_name.clone());
            }
            let id = rf.push_val_node(node);
            rf.call_nodes[call_node_id].outputs.insert(out_name.clone(), id);
            rf.columns.insert(out_name, id);
        }

        Ok(rf)
    }

    fn push_val_node(&mut self, node: ValNode) -> ValNodeId {
        self.val_nodes.push(node);
        self.val_nodes.len() - 1
    }

    fn column_id(&self, name: &str) -> Result<ValNodeId> {
        self.columns
            .get(name)
            .copied()
            .ok_or_else(|| ProvenanceError::UnknownColumn(name.to_string()))
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.keys().cloned().collect()
    }

    /// `__getitem__(col)`: the series of values under one column.
    pub fn index(&self, name: &str) -> Result<Vec<ValueRef>> {
        Ok(self.val_nodes[self.column_id(name)?].refs.clone())
    }

    /// `__getitem__([cols])`: a dataframe-shaped map of column -> series.
    pub fn columns_values(&self, names: &[String]) -> Result<IndexMap<String, Vec<ValueRef>>> {
        names.iter().map(|n| Ok((n.clone(), self.index(n)?))).collect()
    }

    /// Boolean-mask indexing: every `ValNode.refs` / `CallNode.call_uids`
    /// filtered positionally by the same mask, preserving row alignment
    /// across the whole subgraph (spec §4.I invariant).
    pub fn mask(&self, keep: &[bool]) -> Result<Self> {
        let n = keep.len();
        let mut next = self.clone();
        for node in &mut next.val_nodes {
            if node.refs.len() != n {
                return Err(ProvenanceError::InvalidIndexer {
                    got: n,
                    expected: node.refs.len(),
                });
            }
            node.refs = filter_by_mask(&node.refs, keep);
            node.creators = filter_by_mask(&node.creators, keep);
            node.created_as = filter_by_mask(&node.created_as, keep);
            node.consumers = filter_by_mask(&node.consumers, keep);
            node.recompute_hash();
        }
        for cn in &mut next.call_nodes {
            if cn.call_uids.len() != n {
                return Err(ProvenanceError::InvalidIndexer {
                    got: n,
                    expected: cn.call_uids.len(),
                });
            }
            cn.call_uids = filter_by_mask(&cn.call_uids, keep);
            cn.call_uids_hash = hash_value(&cn.call_uids);
        }
        Ok(next)
    }

    /// `eval(cols)`: a dataframe of the unwrapped payloads behind each
    /// column, loaded through `storage`. Payloads are rendered through
    /// `serde_json::Value` so columns of any shape (scalars, lists, maps)
    /// land in one Utf8 series, matching how `memoir-store` renders opaque
    /// payload columns for `execute_df`.
    pub async fn eval(&self, storage: &RelAdapter, cols: &[String]) -> Result<polars::frame::DataFrame> {
        use polars::prelude::*;

        let mut series = Vec::with_capacity(cols.len());
        for col in cols {
            let node = &self.val_nodes[self.column_id(col)?];
            let mut values: Vec<Option<String>> = Vec::with_capacity(node.refs.len());
            for vref in &node.refs {
                let loaded = storage
                    .obj_get(vref.uid())
                    .await?
                    .ok_or_else(|| ProvenanceError::Decode(format!("value `{}` not in storage", vref.uid())))?;
                let bytes = loaded
                    .payload_bytes()
                    .ok_or_else(|| ProvenanceError::Decode(format!("value `{}` has no payload", vref.uid())))?;
                let json: serde_json::Value = rmp_serde::from_slice(bytes)
                    .map_err(|e| ProvenanceError::Decode(e.to_string()))?;
                values.push(Some(json.to_string()));
            }
            series.push(Series::new(col, values));
        }
        DataFrame::new(series).map_err(|e| ProvenanceError::Dataframe(e.to_string()))
    }

    /// `creators(col)`: the producing op's internal name per row, or `None`
    /// for rows with no known creator.
    pub fn creators(&self, col: &str) -> Result<Vec<Option<String>>> {
        let node = &self.val_nodes[self.column_id(col)?];
        Ok(node
            .creators
            .iter()
            .map(|c| c.map(|id| self.call_nodes[id].func_op.sig.internal_name.clone()))
            .collect())
    }

    /// `consumers(col)`: per row, the internal names of every call known to
    /// consume that row's value.
    pub fn consumers(&self, col: &str) -> Result<Vec<Vec<String>>> {
        let node = &self.val_nodes[self.column_id(col)?];
        Ok(node
            .consumers
            .iter()
            .map(|edges| {
                edges
                    .iter()
                    .map(|(id, _name)| self.call_nodes[*id].func_op.sig.internal_name.clone())
                    .collect()
            })
            .collect())
    }

    /// Backward expansion (spec §4.I `back`): for each column in the
    /// frontier, find its creator calls and pull in their other inputs as
    /// new columns/nodes. With `cols = None`, repeats over the growing
    /// frontier of newly discovered value nodes until nothing new appears.
    pub async fn back(&self, storage: &RelAdapter, cols: Option<&[String]>, silent_failure: bool) -> Result<Self> {
        let mut next = self.clone();
        let mut frontier: Vec<ValNodeId> = match cols {
            Some(names) => names.iter().map(|n| next.column_id(n)).collect::<Result<_>>()?,
            None => (0..next.val_nodes.len()).collect(),
        };
        let fixpoint = cols.is_none();

        loop {
            let mut discovered = Vec::new();
            for val_id in frontier {
                if next.val_nodes[val_id].refs.is_empty() {
                    continue;
                }
                if next.val_nodes[val_id].creators.iter().all(Option::is_some) {
                    // Already has a recorded creator; nothing more to expand.
                    continue;
                }
                match next.expand_val_node(storage, val_id, silent_failure).await? {
                    Some(new_ids) => discovered.extend(new_ids),
                    None => continue, // silent_failure skip
                }
            }
            if !fixpoint || discovered.is_empty() {
                break;
            }
            frontier = discovered;
        }
        Ok(next)
    }

    /// Expand one `ValNode`'s backward edge: find its creator calls, attach
    /// (or reuse) the `CallNode`, and attach (or reuse, by `refs_hash`) a
    /// `ValNode` per distinct input of that call. Returns the ids of freshly
    /// created (not reused) input `ValNode`s, or `None` if this column was
    /// skipped under `silent_failure`.
    async fn expand_val_node(
        &mut self,
        storage: &RelAdapter,
        val_id: ValNodeId,
        silent_failure: bool,
    ) -> Result<Option<Vec<ValNodeId>>> {
        let uids: Vec<Uid> = self.val_nodes[val_id].refs.iter().map(|r| r.uid().clone()).collect();
        let creator_rows = storage.creator_rows_for(&uids).await?;

        let mut op_names = HashSet::new();
        let mut out_names = HashSet::new();
        let mut per_row_call_uid = Vec::with_capacity(uids.len());
        let mut missing = 0usize;
        for uid in &uids {
            match creator_rows.get(uid) {
                Some(row) => {
                    op_names.insert(row.versioned_internal_name.clone());
                    out_names.insert(row.name_or_index.clone());
                    per_row_call_uid.push(row.call_uid.clone());
                }
                None => missing += 1,
            }
        }

        // Every row is a root value (no creator anywhere): nothing to
        // expand, and not an error — `back`'s fixpoint iteration relies on
        // roots quietly dropping out of the frontier.
        if missing == uids.len() {
            return Ok(Some(Vec::new()));
        }

        if missing > 0 || op_names.len() > 1 || out_names.len() > 1 {
            if silent_failure {
                return Ok(None);
            }
            let reason = if missing > 0 {
                "some but not all values in this column have a recorded creator".to_string()
            } else if op_names.len() > 1 {
                format!("creators span multiple ops: {op_names:?}")
            } else {
                format!("output name differs across rows: {out_names:?}")
            };
            let col = self
                .columns
                .iter()
                .find(|(_, id)| **id == val_id)
                .map(|(name, _)| name.clone())
                .unwrap_or_else(|| format!("<node {val_id}>"));
            return Err(ProvenanceError::ProvenanceAmbiguity { col, reason });
        }

        let op_name = op_names.into_iter().next().unwrap();
        let out_name = out_names.into_iter().next().unwrap();
        let call_uids = per_row_call_uid;
        let call_uids_hash = hash_value(&call_uids);

        let call_node_id = match self.call_nodes.iter().position(|c| c.call_uids_hash == call_uids_hash) {
            Some(id) => id,
            None => {
                let (name, version) = split_versioned(&op_name);
                let sig = Signature {
                    ui_name: name.clone(),
                    internal_name: name,
                    version,
                    input_names: Vec::new(),
                    input_types: IndexMap::new(),
                    output_types: vec!["any".to_string()],
                    ui_to_internal_input_map: IndexMap::new(),
                    new_input_defaults_uids: IndexMap::new(),
                };
                self.call_nodes.push(CallNode {
                    func_op: FuncOp::headless(sig),
                    inputs: IndexMap::new(),
                    outputs: IndexMap::new(),
                    call_uids: call_uids.clone(),
                    call_uids_hash,
                    orientation: None,
                });
                self.call_nodes.len() - 1
            }
        };
        self.call_nodes[call_node_id]
            .outputs
            .entry(out_name.clone())
            .or_insert(val_id);
        for (creator, created_as) in self.val_nodes[val_id]
            .creators
            .iter_mut()
            .zip(self.val_nodes[val_id].created_as.iter_mut())
        {
            *creator = Some(call_node_id);
            *created_as = Some(out_name.clone());
        }

        let input_rows = storage.input_rows_for_calls(&call_uids).await?;
        let mut by_call_and_name: HashMap<(String, String), Uid> = HashMap::new();
        let mut input_names: BTreeSet<String> = BTreeSet::new();
        for row in &input_rows {
            input_names.insert(row.name_or_index.clone());
            by_call_and_name.insert((row.call_uid.as_str().to_string(), row.name_or_index.clone()), row.vref_uid.clone());
        }

        let mut created = Vec::new();
        for name in &input_names {
            let mut refs_uids = Vec::with_capacity(call_uids.len());
            for cu in &call_uids {
                match by_call_and_name.get(&(cu.as_str().to_string(), name.clone())) {
                    Some(u) => refs_uids.push(u.clone()),
                    None => {}
                }
            }
            if refs_uids.len() != call_uids.len() {
                // Inconsistent input across this call group; skip this one
                // input rather than the whole expansion.
                continue;
            }
            let refs: Vec<ValueRef> = refs_uids.iter().map(|u| ValueRef::lazy(u.clone(), u.clone())).collect();
            let refs_hash = hash_value(&refs_uids);

            let input_val_id = match self.val_nodes.iter().position(|v| v.refs_hash == refs_hash) {
                Some(id) => id,
                None => {
                    let id = self.push_val_node(ValNode::new(refs));
                    created.push(id);
                    id
                }
            };
            for edges in self.val_nodes[input_val_id].consumers.iter_mut() {
                edges.push((call_node_id, name.clone()));
            }
            self.call_nodes[call_node_id].inputs.insert(name.clone(), input_val_id);
        }

        Ok(Some(created))
    }

    /// Deep-copies the subgraph. Arena indices are stable, so `Clone`
    /// already gives deep-copy-with-preserved-cross-edges semantics.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// Renames columns: `mapping` is old name -> new name. Fails rather
    /// than silently dropping a column if two names collide.
    pub fn rename(&mut self, mapping: &IndexMap<String, String>) -> Result<()> {
        let old_columns = std::mem::take(&mut self.columns);
        let mut next_columns = IndexMap::new();
        for (name, id) in old_columns {
            let final_name = mapping.get(&name).cloned().unwrap_or(name);
            if next_columns.contains_key(&final_name) {
                self.columns = next_columns;
                return Err(ProvenanceError::NameCollision(final_name));
            }
            next_columns.insert(final_name, id);
        }
        self.columns = next_columns;
        Ok(())
    }

    pub fn val_node(&self, id: ValNodeId) -> &ValNode {
        &self.val_nodes[id]
    }

    pub fn call_node(&self, id: CallNodeId) -> &CallNode {
        &self.call_nodes[id]
    }

    pub fn call_node_count(&self) -> usize {
        self.call_nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoir_core::call::{Call, ComputeInputs};
    use memoir_store::backend::SqliteBackend;
    use std::sync::Arc;

    fn inc_op() -> FuncOp {
        let sig = Signature::new("inc", vec!["x".to_string()], 1);
        FuncOp::new(sig, |inputs: ComputeInputs| match inputs {
            ComputeInputs::Wrapped(map) => {
                let x: i64 = map["x"].unwrap().map_err(|e| e.to_string())?;
                Ok(vec![rmp_serde::to_vec_named(&(x + 1)).unwrap()])
            }
            ComputeInputs::Raw(_) => Err("expected wrapped inputs".to_string()),
        })
    }

    async fn run_inc(adapter: &RelAdapter, op: &FuncOp, x: i64) -> (ValueRef, ValueRef) {
        let x_ref = ValueRef::wrap(&x).unwrap();
        let call_uid = hash_value(&format!("inc({x})"));
        let outputs = memoir_core::value::wrap_outputs(&[rmp_serde::to_vec_named(&(x + 1)).unwrap()], &call_uid);
        let mut inputs = IndexMap::new();
        inputs.insert("x".to_string(), x_ref.clone());
        let call = Call::new(call_uid, op.clone(), inputs, outputs.clone());

        let mut objs = IndexMap::new();
        objs.insert(x_ref.uid().clone(), x_ref.clone());
        objs.insert(outputs[0].uid().clone(), outputs[0].clone());
        adapter.obj_sets(&objs).await.unwrap();
        adapter.upsert_calls(&[call]).await.unwrap();
        (x_ref, outputs[0].clone())
    }

    #[tokio::test]
    async fn from_op_eval_returns_one_row_per_call() {
        let backend = Arc::new(SqliteBackend::in_memory().await.unwrap());
        let adapter = RelAdapter::new(backend);
        let op = inc_op();
        run_inc(&adapter, &op, 1).await;
        run_inc(&adapter, &op, 2).await;

        let rf = ProvenanceFunctor::from_op(&op, &adapter).await.unwrap();
        let df = rf.eval(&adapter, &["output_0".to_string()]).await.unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(df.width(), 1);
    }

    #[tokio::test]
    async fn back_from_outputs_recovers_inputs() {
        let backend = Arc::new(SqliteBackend::in_memory().await.unwrap());
        let adapter = RelAdapter::new(backend);
        let op = inc_op();
        let (_, out1) = run_inc(&adapter, &op, 1).await;
        let (_, out2) = run_inc(&adapter, &op, 2).await;

        let rf = ProvenanceFunctor::from_refs(vec![out1, out2], &adapter);
        let expanded = rf.back(&adapter, None, false).await.unwrap();
        assert_eq!(expanded.call_node_count(), 1);

        let values = expanded.index("x").unwrap();
        assert_eq!(values.len(), 2);
        let mut nums = Vec::new();
        for v in &values {
            let loaded = adapter.obj_get(v.uid()).await.unwrap().unwrap();
            nums.push(loaded.unwrap::<i64>().unwrap());
        }
        assert_eq!(nums, vec![1, 2]);
    }

    #[tokio::test]
    async fn back_without_cols_expands_a_chain_to_fixpoint() {
        let backend = Arc::new(SqliteBackend::in_memory().await.unwrap());
        let adapter = RelAdapter::new(backend);
        let op = inc_op();
        let (_, mid) = run_inc(&adapter, &op, 1).await; // inc(1) = 2

        let mid_val: i64 = 2;
        let _ = mid_val;
        let mid_as_input = mid.clone();
        let call_uid2 = hash_value(&"inc(2)-chained".to_string());
        let out2 = memoir_core::value::wrap_outputs(&[rmp_serde::to_vec_named(&3i64).unwrap()], &call_uid2);
        let mut inputs2 = IndexMap::new();
        inputs2.insert("x".to_string(), mid_as_input.clone());
        let call2 = Call::new(call_uid2, op.clone(), inputs2, out2.clone());
        let mut objs = IndexMap::new();
        objs.insert(out2[0].uid().clone(), out2[0].clone());
        adapter.obj_sets(&objs).await.unwrap();
        adapter.upsert_calls(&[call2]).await.unwrap();

        let rf = ProvenanceFunctor::from_refs(vec![out2[0].clone()], &adapter);
        let expanded = rf.back(&adapter, None, false).await.unwrap();
        // Two distinct inc calls should both be present after fixpoint expansion.
        assert_eq!(expanded.call_node_count(), 2);
    }

    #[test]
    fn rename_rejects_collisions() {
        let mut rf = ProvenanceFunctor::default();
        rf.columns.insert("a".to_string(), 0);
        rf.columns.insert("b".to_string(), 1);
        rf.val_nodes.push(ValNode::new(vec![]));
        rf.val_nodes.push(ValNode::new(vec![]));

        let mut mapping = IndexMap::new();
        mapping.insert("a".to_string(), "b".to_string());
        assert!(rf.rename(&mapping).is_err());
    }

    #[tokio::test]
    async fn mask_filters_every_node_positionally() {
        let backend = Arc::new(SqliteBackend::in_memory().await.unwrap());
        let adapter = RelAdapter::new(backend);
        let a = ValueRef::wrap(&1i64).unwrap();
        let b = ValueRef::wrap(&2i64).unwrap();
        let rf = ProvenanceFunctor::from_refs(vec![a, b], &adapter);
        let masked = rf.mask(&[true, false]).unwrap();
        assert_eq!(masked.index("v0").unwrap().len(), 1);
    }
}
