//! The six process-wide knobs from spec §6, kept as one plain struct the
//! way `toka_config_cli` keeps its settings — no builder, just public
//! fields with a `Default` that matches the spec's defaults.

/// Tunables governing `Storage` and `Context` behavior. None of these
/// affect a call's identity (its UID); they only change when work happens
/// and how eagerly caches are trimmed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Commit dirty state on context exit (`run` mode). Default `true`.
    pub autocommit: bool,
    /// Purge in-memory caches immediately after a successful commit.
    pub evict_on_commit: bool,
    /// Reject calls whose signature has drifted from the remote before
    /// every single invocation (`Storage::call_run`), not just at context
    /// entry (`Context::enter`'s own `sync_from_remote` check). A no-op with
    /// no remote configured.
    pub check_signature_on_each_call: bool,
    /// Pass raw payload bytes rather than `ValueRef`s to user functions.
    pub autounwrap_inputs: bool,
    /// Enables inline image rendering in the (out-of-scope) visualization
    /// surface; carried as a config knob since other components check it
    /// before attempting to render, not because this crate renders anything.
    pub has_pil: bool,
    /// No remote is configured: `sync_from_remote`/`sync_to_remote` degrade
    /// to no-ops and trimming, respectively. `Storage` keeps this in sync
    /// with whether a remote is actually attached (`new`, `with_remote`);
    /// callers don't need to set it themselves.
    pub local_only: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            autocommit: true,
            evict_on_commit: false,
            check_signature_on_each_call: false,
            autounwrap_inputs: false,
            has_pil: false,
            local_only: true,
        }
    }
}
