//! Scoped context lifecycle (spec §4.G, §5): a `thread_local!` LIFO stack,
//! since this crate's concurrency model is single-threaded/cooperative —
//! nothing calls for cross-task context propagation, so a plain thread-local
//! stack of `Rc`s is the direct translation of "process-local... nested
//! contexts stack LIFO", not `tokio::task_local!`.

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

use indexmap::IndexMap;

use memoir_core::call::FuncOp;
use memoir_core::value::ValueRef;

use crate::error::Result;
use crate::storage::{SimpleWorkflowExecutor, Storage, Workflow};

/// Which of the three call-routing behaviors a context applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Execute and memoize immediately.
    Run,
    /// Build a symbolic query node; nothing executes.
    Query,
    /// Queue a deferred call, returning `Delayed` placeholders.
    Batch,
}

thread_local! {
    static STACK: RefCell<Vec<Rc<Context>>> = RefCell::new(Vec::new());
}

/// A scoped acquisition of a [`Storage`] under one [`Mode`]. Mirrors the
/// enter/exit pair of a Python context manager: callers go through
/// [`Context::scoped`] rather than driving `enter`/`exit` by hand, so the
/// exit phase always runs even if the body returns an error.
pub struct Context {
    pub storage: Rc<Storage>,
    pub mode: Mode,
    pub lazy: bool,
    workflow: RefCell<Workflow>,
}

impl Context {
    fn new(storage: Rc<Storage>, mode: Mode, lazy: bool) -> Rc<Self> {
        Rc::new(Context {
            storage,
            mode,
            lazy,
            workflow: RefCell::new(Workflow::new()),
        })
    }

    /// The innermost context currently entered on this thread, if any.
    pub fn current() -> Option<Rc<Context>> {
        STACK.with(|s| s.borrow().last().cloned())
    }

    async fn enter(self: &Rc<Self>) -> Result<()> {
        STACK.with(|s| s.borrow_mut().push(self.clone()));
        if self.mode == Mode::Run {
            self.storage.sync_from_remote().await?;
        }
        Ok(())
    }

    /// spec §4.G exit path: `run` commits (if `autocommit`) then syncs to
    /// remote; `query` passes through; `batch` replays its queued
    /// `CallStruct`s through the workflow executor and commits the result.
    async fn exit(self: &Rc<Self>) -> Result<()> {
        STACK.with(|s| {
            s.borrow_mut().pop();
        });
        match self.mode {
            Mode::Run => {
                if self.storage.config.autocommit {
                    self.storage.commit(None).await?;
                }
                self.storage.sync_to_remote().await?;
            }
            Mode::Query => {}
            Mode::Batch => {
                let workflow = self.workflow.replace(Workflow::new());
                if !workflow.is_empty() {
                    let calls = SimpleWorkflowExecutor::execute(&self.storage, workflow).await?;
                    self.storage.commit(Some(&calls)).await?;
                }
            }
        }
        Ok(())
    }

    /// Mode-routed call entry point: `run` executes and memoizes
    /// immediately; `query` is not handled here (callers use
    /// `Storage::call_query` directly, since its result is a symbolic node,
    /// not a `Vec<ValueRef>`); `batch` queues a `CallStruct` on this
    /// context's workflow and returns `Delayed` placeholders.
    pub async fn call_run(&self, func_op: &FuncOp, inputs: IndexMap<String, ValueRef>) -> Result<Vec<ValueRef>> {
        match self.mode {
            Mode::Batch => {
                let (delayed, call_struct) = self.storage.call_batch(func_op, inputs);
                self.workflow.borrow_mut().push(call_struct);
                Ok(delayed)
            }
            Mode::Run | Mode::Query => {
                let (outputs, _) = self.storage.call_run(func_op, inputs).await?;
                Ok(outputs)
            }
        }
    }

    /// Enter, run `body`, and exit — even if `body` errors. An error from
    /// the exit phase itself (a failed commit or sync) takes precedence over
    /// one from `body`, exactly as the original's `__exit__` re-raises its
    /// own caught exception ahead of the one that triggered it; otherwise
    /// `body`'s result is returned.
    pub async fn scoped<F, Fut, T>(storage: Rc<Storage>, mode: Mode, lazy: bool, body: F) -> Result<T>
    where
        F: FnOnce(Rc<Context>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let ctx = Context::new(storage, mode, lazy);
        ctx.enter().await?;
        let outcome = body(ctx.clone()).await;
        let exit_result = ctx.exit().await;
        match exit_result {
            Err(e) => Err(e),
            Ok(()) => outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use memoir_core::call::ComputeInputs;
    use memoir_core::signature::Signature;
    use memoir_store::backend::SqliteBackend;
    use std::sync::Arc as StdArc;

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

    async fn storage() -> Rc<Storage> {
        let backend = StdArc::new(SqliteBackend::in_memory().await.unwrap());
        Rc::new(Storage::new(backend, Config::default()))
    }

    #[tokio::test]
    async fn run_mode_autocommits_on_exit() {
        let storage = storage().await;
        let op = inc_op();

        Context::scoped(storage.clone(), Mode::Run, false, |ctx| async move {
            let mut inputs = IndexMap::new();
            inputs.insert("x".to_string(), ValueRef::wrap(&1i64).unwrap());
            ctx.call_run(&op, inputs).await?;
            Ok(())
        })
        .await
        .unwrap();

        assert!(storage.is_clean().await);
        assert!(Context::current().is_none());
    }

    #[tokio::test]
    async fn batch_mode_defers_until_exit() {
        let storage = storage().await;
        let op = inc_op();

        let outputs = Context::scoped(storage.clone(), Mode::Batch, false, |ctx| {
            let op = op.clone();
            async move {
                let mut inputs = IndexMap::new();
                inputs.insert("x".to_string(), ValueRef::wrap(&4i64).unwrap());
                let delayed = ctx.call_run(&op, inputs).await?;
                assert!(delayed[0].is_delayed());
                Ok(delayed)
            }
        })
        .await
        .unwrap();

        assert!(storage.is_clean().await);
        let loaded = storage.adapter().obj_get(outputs[0].uid()).await.unwrap().unwrap();
        let five: i64 = loaded.unwrap().unwrap();
        assert_eq!(five, 5);
    }

    #[tokio::test]
    async fn nested_contexts_stack_and_unlink_when_empty() {
        let storage = storage().await;
        Context::scoped(storage.clone(), Mode::Run, false, |_outer| async move {
            assert!(Context::current().is_some());
            Context::scoped(storage.clone(), Mode::Query, false, |_inner| async move {
                assert_eq!(Context::current().unwrap().mode, Mode::Query);
                Ok(())
            })
            .await
            .unwrap();
            assert_eq!(Context::current().unwrap().mode, Mode::Run);
            Ok(())
        })
        .await
        .unwrap();
        assert!(Context::current().is_none());
    }
}
