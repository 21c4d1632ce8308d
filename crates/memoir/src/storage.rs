//! The orchestrator (spec §4.G): owns the caches, the relational adapter,
//! the signature registry and (optionally) a remote log, and implements
//! `call_run`/`commit`/`execute_query`/`call_batch` in terms of the crates
//! underneath it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{debug, info, instrument};

use memoir_cache::KvCache;
use memoir_core::call::{Call, ComputeInputs, FuncOp};
use memoir_core::hash::{hash_value, CanonicalValue};
use memoir_core::signature::{Signature, SignatureRegistry};
use memoir_core::uid::Uid;
use memoir_core::value::{wrap_outputs, ValueRef};
use memoir_store::adapter::RelAdapter;
use memoir_store::backend::SqliteBackend;
use memoir_sync::RemoteLog;

use crate::config::Config;
use crate::error::{Error, Result};

/// A symbolic reference inside a not-yet-compiled query graph.
#[derive(Clone, Debug)]
pub enum ValQuery {
    /// A placeholder awaiting compilation against the relational schema.
    Placeholder(Uid),
    /// An already-resolved value, usable as a join key or filter.
    Concrete(ValueRef),
}

/// One symbolic function-call node in a query graph (spec §4.G `call_query`).
/// The compiler that lowers a set of these to SQL is out of scope here —
/// only the shape callers build and hand to a [`QueryCompiler`] is.
#[derive(Clone, Debug)]
pub struct FuncQuery {
    pub func_op: FuncOp,
    pub inputs: IndexMap<String, ValQuery>,
}

/// Lowers a set of [`FuncQuery`] nodes into a query the relational backend
/// can run. The real compiler lives outside this crate; this trait is the
/// seam it plugs into.
pub trait QueryCompiler: Send + Sync {
    fn compile(&self, queries: &[FuncQuery]) -> Result<String>;
}

/// A deferred call queued under `batch` mode: its inputs may themselves be
/// [`ValueRef::Delayed`] slots produced by an earlier struct in the same
/// workflow.
#[derive(Clone, Debug)]
pub struct CallStruct {
    pub func_op: FuncOp,
    pub inputs: IndexMap<String, ValueRef>,
    pub output_slots: Vec<Uid>,
}

/// An ordered queue of [`CallStruct`]s built up during one `batch`-mode
/// context.
#[derive(Debug, Default)]
pub struct Workflow {
    calls: Vec<CallStruct>,
}

impl Workflow {
    pub fn new() -> Self {
        Workflow::default()
    }

    pub fn push(&mut self, call: CallStruct) {
        self.calls.push(call);
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Replays a [`Workflow`]'s queued [`CallStruct`]s through `call_run`,
/// resolving each struct's `Delayed` inputs from slots filled by earlier
/// structs, then deduplicating the resulting calls by UID.
pub struct SimpleWorkflowExecutor;

impl SimpleWorkflowExecutor {
    pub async fn execute(storage: &Storage, workflow: Workflow) -> Result<Vec<Call>> {
        let mut resolved: HashMap<Uid, ValueRef> = HashMap::new();
        let mut executed = Vec::with_capacity(workflow.calls.len());

        for call_struct in workflow.calls {
            let mut inputs = IndexMap::with_capacity(call_struct.inputs.len());
            for (name, vref) in call_struct.inputs {
                let concrete = match &vref {
                    ValueRef::Delayed { uid } => resolved.get(uid).cloned().ok_or_else(|| {
                        Error::Core(memoir_core::error::Error::NotInMemory(uid.clone()))
                    })?,
                    ValueRef::Value(_) => vref,
                };
                inputs.insert(name, concrete);
            }
            let (outputs, call) = storage.call_run(&call_struct.func_op, inputs).await?;
            for (slot, output) in call_struct.output_slots.iter().zip(outputs.iter()) {
                resolved.insert(slot.clone(), output.clone());
            }
            executed.push(call);
        }

        let mut seen = HashSet::new();
        executed.retain(|c| seen.insert(c.uid.clone()));
        Ok(executed)
    }
}

/// Owns everything `call_run`/`commit`/`execute_query`/`call_batch` need:
/// the dirty-tracked object/call caches, the relational adapter, the
/// signature registry, and an optional remote log.
pub struct Storage {
    pub config: Config,
    registry: RwLock<SignatureRegistry>,
    adapter: RelAdapter,
    obj_cache: KvCache<Uid, ValueRef>,
    call_cache: KvCache<Uid, Call>,
    remote: Option<Arc<dyn RemoteLog>>,
    last_remote_timestamp: AsyncMutex<DateTime<Utc>>,
    delay_seq: AtomicU64,
}

impl Storage {
    pub fn new(backend: Arc<SqliteBackend>, config: Config) -> Self {
        // No remote yet: `local_only` must agree with that regardless of what
        // the caller passed in. `with_remote` flips it back.
        let config = Config { local_only: true, ..config };
        Storage {
            config,
            registry: RwLock::new(SignatureRegistry::new()),
            adapter: RelAdapter::new(backend),
            obj_cache: KvCache::new(),
            call_cache: KvCache::new(),
            remote: None,
            last_remote_timestamp: AsyncMutex::new(DateTime::<Utc>::from_timestamp(0, 0).unwrap_or_default()),
            delay_seq: AtomicU64::new(0),
        }
    }

    /// Attach a remote log, flipping `Config::local_only` off so
    /// `sync_from_remote`/`sync_to_remote` actually use it.
    pub fn with_remote(mut self, remote: Arc<dyn RemoteLog>) -> Self {
        self.remote = Some(remote);
        self.config.local_only = false;
        self
    }

    pub fn adapter(&self) -> &RelAdapter {
        &self.adapter
    }

    pub async fn register_signature(&self, sig: Signature) -> Result<()> {
        self.registry.write().await.register(sig)?;
        Ok(())
    }

    pub async fn signature(&self, internal_name: &str) -> Option<Signature> {
        self.registry.read().await.get(internal_name).cloned()
    }

    /// `true` iff neither cache has entries awaiting `commit`.
    pub async fn is_clean(&self) -> bool {
        self.obj_cache.is_clean().await && self.call_cache.is_clean().await
    }

    /// spec §6: `call_uid = hash([hashable_input_uids, versioned_internal_name])`,
    /// where an input is excluded from `hashable_input_uids` if its UID
    /// matches the default it was given when added to the signature.
    fn hash_call(func_op: &FuncOp, inputs: &IndexMap<String, ValueRef>) -> Uid {
        let mut hashable = std::collections::BTreeMap::new();
        for name in &func_op.sig.input_names {
            let Some(vref) = inputs.get(name) else { continue };
            if let Some(default_uid) = func_op.sig.new_input_defaults_uids.get(name) {
                if vref.uid() == default_uid {
                    continue;
                }
            }
            hashable.insert(name.clone(), CanonicalValue::Str(vref.uid().as_str().to_owned()));
        }
        hash_value(&CanonicalValue::List(vec![
            CanonicalValue::Map(hashable),
            CanonicalValue::Str(func_op.sig.versioned_internal_name()),
        ]))
    }

    /// spec §7: with `Config::check_signature_on_each_call` set, reject the
    /// call if `internal_name`'s signature has drifted from the remote since
    /// the last `sync_from_remote` — fatal to this call only, not the whole
    /// context. A no-op with no remote configured.
    async fn check_signature_drift(&self, internal_name: &str) -> Result<()> {
        if !self.config.check_signature_on_each_call || self.config.local_only {
            return Ok(());
        }
        let remote = self
            .remote
            .as_ref()
            .expect("local_only is false only when a remote is attached");
        let registry = self.registry.read().await;
        for sig in remote.signatures().await? {
            if sig.internal_name != internal_name {
                continue;
            }
            let (synced, reason) = registry.is_synced(&sig);
            if !synced {
                return Err(Error::SyncException(
                    reason.unwrap_or_else(|| sig.internal_name.clone()),
                ));
            }
        }
        Ok(())
    }

    /// spec §4.G `call_run`: hash inputs, check memoization, and either
    /// replay the cached/persisted result or execute `func_op` and cache the
    /// fresh one as dirty.
    #[instrument(skip(self, func_op, inputs), fields(op = %func_op.sig.versioned_internal_name()))]
    pub async fn call_run(
        &self,
        func_op: &FuncOp,
        inputs: IndexMap<String, ValueRef>,
    ) -> Result<(Vec<ValueRef>, Call)> {
        self.check_signature_drift(&func_op.sig.internal_name).await?;

        for name in &func_op.sig.input_names {
            if !inputs.contains_key(name) {
                return Err(Error::Core(memoir_core::error::Error::SchemaMissing(name.clone())));
            }
        }

        let call_uid = Self::hash_call(func_op, &inputs);

        if let Some(call) = self.call_cache.get(&call_uid).await {
            debug!(%call_uid, "call_run hit in-memory cache");
            return Ok((call.outputs.clone(), call));
        }

        if self.adapter.call_exists(func_op, &call_uid).await? {
            debug!(%call_uid, "call_run hit relational store");
            let lazy = self
                .adapter
                .call_get_lazy(func_op, &call_uid)
                .await?
                .ok_or_else(|| Error::Core(memoir_core::error::Error::SchemaMissing(call_uid.to_string())))?;

            let mut wanted: Vec<Uid> = lazy.inputs.values().map(|v| v.uid().clone()).collect();
            wanted.extend(lazy.outputs.iter().map(|v| v.uid().clone()));
            let loaded = self.adapter.obj_gets(&wanted).await?;
            let mut by_uid: HashMap<Uid, ValueRef> =
                loaded.into_iter().map(|v| (v.uid().clone(), v)).collect();

            let mut resolved_inputs = IndexMap::with_capacity(lazy.inputs.len());
            for (name, placeholder) in &lazy.inputs {
                let loaded = by_uid.remove(placeholder.uid()).ok_or_else(|| {
                    Error::Core(memoir_core::error::Error::NotInMemory(placeholder.uid().clone()))
                })?;
                resolved_inputs.insert(name.clone(), loaded);
            }
            let mut resolved_outputs = Vec::with_capacity(lazy.outputs.len());
            for placeholder in &lazy.outputs {
                let loaded = by_uid.remove(placeholder.uid()).ok_or_else(|| {
                    Error::Core(memoir_core::error::Error::NotInMemory(placeholder.uid().clone()))
                })?;
                resolved_outputs.push(loaded);
            }

            let call = lazy
                .set_input_values(resolved_inputs)
                .set_output_values(resolved_outputs);
            self.call_cache.set(call_uid.clone(), call.clone()).await;
            return Ok((call.outputs.clone(), call));
        }

        let compute_inputs = if self.config.autounwrap_inputs {
            let mut raw = IndexMap::with_capacity(inputs.len());
            for (name, vref) in &inputs {
                let bytes = vref
                    .payload_bytes()
                    .ok_or_else(|| Error::Core(memoir_core::error::Error::NotInMemory(vref.uid().clone())))?;
                raw.insert(name.clone(), bytes.to_vec());
            }
            ComputeInputs::Raw(raw)
        } else {
            ComputeInputs::Wrapped(inputs.clone())
        };

        let output_bytes = func_op.compute(compute_inputs)?;
        let outputs = wrap_outputs(&output_bytes, &call_uid);
        let call = Call::new(call_uid.clone(), func_op.clone(), inputs.clone(), outputs.clone());

        for vref in inputs.values() {
            if vref.in_memory() {
                self.obj_cache.set(vref.uid().clone(), vref.clone()).await;
            }
        }
        for vref in &outputs {
            self.obj_cache.set(vref.uid().clone(), vref.clone()).await;
        }
        self.call_cache.set(call_uid.clone(), call.clone()).await;

        info!(%call_uid, "executed and cached a fresh call");
        Ok((outputs, call))
    }

    /// spec §4.G `call_query`: build a symbolic node, touching neither cache
    /// nor store. Purely structural — the heavy lifting is the external
    /// compiler's.
    pub fn call_query(&self, func_op: &FuncOp, inputs: IndexMap<String, ValQuery>) -> FuncQuery {
        FuncQuery {
            func_op: func_op.clone(),
            inputs,
        }
    }

    /// spec §4.G `call_batch`: defer computation, returning `Delayed`
    /// placeholders plus the [`CallStruct`] a [`SimpleWorkflowExecutor`]
    /// will later resolve.
    pub fn call_batch(&self, func_op: &FuncOp, inputs: IndexMap<String, ValueRef>) -> (Vec<ValueRef>, CallStruct) {
        let seq = self.delay_seq.fetch_add(1, Ordering::SeqCst);
        let n = func_op.sig.n_outputs();
        let mut output_slots = Vec::with_capacity(n);
        let mut delayed = Vec::with_capacity(n);
        for i in 0..n {
            let slot_uid = hash_value(&CanonicalValue::List(vec![
                CanonicalValue::Str("batch-slot".to_string()),
                CanonicalValue::Str(func_op.sig.versioned_internal_name()),
                CanonicalValue::Int(seq as i64),
                CanonicalValue::Int(i as i64),
            ]));
            output_slots.push(slot_uid.clone());
            delayed.push(ValueRef::new_delayed(slot_uid));
        }
        (
            delayed,
            CallStruct {
                func_op: func_op.clone(),
                inputs,
                output_slots,
            },
        )
    }

    /// spec §4.G `commit`: gather dirty objects and calls (or the caller's
    /// explicit list), write them atomically in objs -> calls order (calls
    /// upsert already interleaves provenance + event-log rows per call,
    /// spec §6 "Ordering"), then clear dirty sets and, if configured, evict.
    #[instrument(skip(self, calls))]
    pub async fn commit(&self, calls: Option<&[Call]>) -> Result<()> {
        let calls_to_write: Vec<Call> = match calls {
            Some(cs) => cs.to_vec(),
            None => {
                let mut out = Vec::new();
                for uid in self.call_cache.dirty_entries().await {
                    if let Some(c) = self.call_cache.get(&uid).await {
                        out.push(c);
                    }
                }
                out
            }
        };

        let mut objs = IndexMap::new();
        for uid in self.obj_cache.dirty_entries().await {
            if let Some(v) = self.obj_cache.get(&uid).await {
                if v.in_memory() {
                    objs.insert(uid, v);
                }
            }
        }

        self.adapter.obj_sets(&objs).await?;
        self.adapter.upsert_calls(&calls_to_write).await?;

        self.obj_cache.clear_dirty().await;
        self.call_cache.clear_dirty().await;

        if self.config.evict_on_commit {
            self.obj_cache.clear().await;
            self.call_cache.clear().await;
        }

        info!(objs = objs.len(), calls = calls_to_write.len(), "committed");
        Ok(())
    }

    /// spec §4.G `execute_query`: commit first so the relational backend is
    /// consistent, delegate compilation to the caller-supplied compiler, run
    /// the resulting SQL, and return the materialized dataframe.
    pub async fn execute_query(
        &self,
        queries: &[FuncQuery],
        compiler: &dyn QueryCompiler,
    ) -> Result<polars::frame::DataFrame> {
        self.commit(None).await?;
        let sql = compiler.compile(queries)?;
        use memoir_store::backend::RelationalBackend;
        let df = self.adapter.backend().execute_df(&sql).await?;
        Ok(df)
    }

    /// spec §4.H: pull remote signature changes and new log entries, apply
    /// them, and advance the local watermark. A no-op with no remote
    /// configured.
    pub async fn sync_from_remote(&self) -> Result<()> {
        if self.config.local_only {
            return Ok(());
        }
        let remote = self
            .remote
            .as_ref()
            .expect("local_only is false only when a remote is attached");
        let mut registry = self.registry.write().await;
        for sig in remote.signatures().await? {
            let (synced, reason) = registry.is_synced(&sig);
            if !synced {
                return Err(Error::SyncException(
                    reason.unwrap_or_else(|| sig.internal_name.clone()),
                ));
            }
            let _ = registry.register(sig);
        }

        let mut last = self.last_remote_timestamp.lock().await;
        let (entries, newer) = remote.get_log_entries_since(*last).await?;
        memoir_sync::apply_from_remote(&self.adapter, &registry, &entries).await?;
        *last = newer;
        Ok(())
    }

    /// spec §4.H: bundle and send the local event log; with no remote
    /// configured this degrades to trimming the log.
    pub async fn sync_to_remote(&self) -> Result<()> {
        if self.config.local_only {
            self.adapter.clear_event_log().await?;
            return Ok(());
        }
        let remote = self
            .remote
            .as_ref()
            .expect("local_only is false only when a remote is attached");
        let registry = self.registry.read().await;
        let bundle = memoir_sync::bundle_to_remote(&self.adapter, &registry).await?;
        remote.save_event_log_entry(bundle).await?;
        self.adapter.clear_event_log().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn add_op(counter: Arc<AtomicUsize>) -> FuncOp {
        let sig = Signature::new("add", vec!["a".to_string(), "b".to_string()], 1);
        FuncOp::new(sig, move |inputs: ComputeInputs| match inputs {
            ComputeInputs::Wrapped(map) => {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
                let a: i64 = map["a"].unwrap().map_err(|e| e.to_string())?;
                let b: i64 = map["b"].unwrap().map_err(|e| e.to_string())?;
                Ok(vec![rmp_serde::to_vec_named(&(a + b)).unwrap()])
            }
            ComputeInputs::Raw(_) => Err("expected wrapped inputs".to_string()),
        })
    }

    async fn fresh_storage() -> Storage {
        let backend = Arc::new(SqliteBackend::in_memory().await.unwrap());
        Storage::new(backend, Config::default())
    }

    #[tokio::test]
    async fn call_run_executes_once_and_memoizes() {
        let storage = fresh_storage().await;
        let counter = Arc::new(AtomicUsize::new(0));
        let op = add_op(counter.clone());

        let mut inputs = IndexMap::new();
        inputs.insert("a".to_string(), ValueRef::wrap(&2i64).unwrap());
        inputs.insert("b".to_string(), ValueRef::wrap(&3i64).unwrap());

        let (out1, call1) = storage.call_run(&op, inputs.clone()).await.unwrap();
        let (out2, call2) = storage.call_run(&op, inputs).await.unwrap();

        assert_eq!(call1.uid, call2.uid);
        assert_eq!(out1[0].uid(), out2[0].uid());
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 1);
        assert!(!storage.is_clean().await);
    }

    #[tokio::test]
    async fn commit_then_is_clean_and_survives_cache_eviction() {
        let storage = fresh_storage().await;
        let counter = Arc::new(AtomicUsize::new(0));
        let op = add_op(counter.clone());

        let mut inputs = IndexMap::new();
        inputs.insert("a".to_string(), ValueRef::wrap(&5i64).unwrap());
        inputs.insert("b".to_string(), ValueRef::wrap(&7i64).unwrap());
        let (outputs, _) = storage.call_run(&op, inputs.clone()).await.unwrap();

        storage.commit(None).await.unwrap();
        assert!(storage.is_clean().await);

        let loaded = storage.adapter().obj_get(outputs[0].uid()).await.unwrap().unwrap();
        let sum: i64 = loaded.unwrap().unwrap();
        assert_eq!(sum, 12);

        // A second call_run after commit still memoizes via the relational
        // store, not just the in-memory cache.
        let (_, call2) = storage.call_run(&op, inputs).await.unwrap();
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(call2.outputs[0].uid(), outputs[0].uid());
    }

    #[tokio::test]
    async fn call_batch_then_workflow_executor_resolves_delayed_outputs() {
        let storage = fresh_storage().await;
        let counter = Arc::new(AtomicUsize::new(0));
        let op = add_op(counter);

        let mut first_inputs = IndexMap::new();
        first_inputs.insert("a".to_string(), ValueRef::wrap(&1i64).unwrap());
        first_inputs.insert("b".to_string(), ValueRef::wrap(&1i64).unwrap());
        let (first_out, first_struct) = storage.call_batch(&op, first_inputs);

        let mut second_inputs = IndexMap::new();
        second_inputs.insert("a".to_string(), first_out[0].clone());
        second_inputs.insert("b".to_string(), ValueRef::wrap(&10i64).unwrap());
        let (_second_out, second_struct) = storage.call_batch(&op, second_inputs);

        let mut workflow = Workflow::new();
        workflow.push(first_struct);
        workflow.push(second_struct);

        let executed = SimpleWorkflowExecutor::execute(&storage, workflow).await.unwrap();
        assert_eq!(executed.len(), 2);

        let final_call = &executed[1];
        let sum: i64 = final_call.outputs[0].unwrap().unwrap();
        assert_eq!(sum, 12);
    }
}
