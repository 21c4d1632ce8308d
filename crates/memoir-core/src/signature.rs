use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::uid::Uid;
use crate::value::ValueRef;

/// Direction for [`SignatureRegistry::rename_tables`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenameDirection {
    /// UI-facing names -> immutable internal names (outbound, e.g. before
    /// `bundle_to_remote`).
    ToInternal,
    /// Internal names -> current UI-facing names (inbound, e.g. after
    /// `apply_from_remote`).
    ToUi,
}

/// The persisted identity of a memoized function.
///
/// `internal_name` is chosen once at first registration and never changes;
/// `ui_name` and `ui_to_internal_input_map` may be renamed freely without
/// affecting any previously computed call UID, since call UIDs are always
/// hashed using internal names (spec §6).
#[derive(Clone, Debug)]
pub struct Signature {
    pub ui_name: String,
    pub internal_name: String,
    pub version: u32,
    /// Internal input names, in declaration order.
    pub input_names: Vec<String>,
    pub input_types: IndexMap<String, String>,
    pub output_types: Vec<String>,
    pub ui_to_internal_input_map: IndexMap<String, String>,
    /// internal input name -> UID of the default value it was given when
    /// added. Calls whose input UID for that name matches the recorded
    /// default are hashed as if the input were absent (spec §6), so
    /// pre-existing calls keep their identity after the input is added.
    pub new_input_defaults_uids: IndexMap<String, Uid>,
}

impl Signature {
    /// Construct a signature whose UI names equal their internal names —
    /// the common case at first registration.
    pub fn new(name: impl Into<String>, input_names: Vec<String>, n_outputs: usize) -> Self {
        let name = name.into();
        let ui_to_internal_input_map = input_names
            .iter()
            .map(|n| (n.clone(), n.clone()))
            .collect();
        Signature {
            ui_name: name.clone(),
            internal_name: name,
            version: 1,
            input_names,
            input_types: IndexMap::new(),
            output_types: (0..n_outputs).map(|_| "any".to_string()).collect(),
            ui_to_internal_input_map,
            new_input_defaults_uids: IndexMap::new(),
        }
    }

    pub fn versioned_internal_name(&self) -> String {
        format!("{}@{}", self.internal_name, self.version)
    }

    pub fn versioned_ui_name(&self) -> String {
        format!("{}@{}", self.ui_name, self.version)
    }

    pub fn n_outputs(&self) -> usize {
        self.output_types.len()
    }
}

/// Tracks every function signature known to this process, enforcing
/// spec §4.C's invariants (immutable internal names, default-backed input
/// additions, version bumps).
#[derive(Default)]
pub struct SignatureRegistry {
    by_internal_name: IndexMap<String, Signature>,
}

impl SignatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, sig: Signature) -> Result<()> {
        if let Some(existing) = self.by_internal_name.get(&sig.internal_name) {
            if existing.version >= sig.version {
                return Err(Error::InvalidSignatureChange(format!(
                    "`{}` already registered at version {}",
                    sig.internal_name, existing.version
                )));
            }
        }
        self.by_internal_name.insert(sig.internal_name.clone(), sig);
        Ok(())
    }

    pub fn get(&self, internal_name: &str) -> Option<&Signature> {
        self.by_internal_name.get(internal_name)
    }

    /// Add a new input with a required default. The default's UID is
    /// recorded so future call-UID hashing (spec §6) can exclude it when the
    /// caller's value matches the default, preserving old calls' identity.
    pub fn add_input(&mut self, internal_name: &str, name: &str, default: &ValueRef) -> Result<()> {
        let sig = self
            .by_internal_name
            .get_mut(internal_name)
            .ok_or_else(|| Error::SchemaMissing(internal_name.to_string()))?;
        if sig.input_names.iter().any(|n| n == name) {
            return Err(Error::InvalidSignatureChange(format!(
                "`{name}` already exists on `{internal_name}`"
            )));
        }
        sig.input_names.push(name.to_string());
        sig.ui_to_internal_input_map
            .insert(name.to_string(), name.to_string());
        sig.new_input_defaults_uids
            .insert(name.to_string(), default.uid().clone());
        Ok(())
    }

    /// Rename the UI-facing name of an input. The internal name, and
    /// therefore every existing call UID, is unaffected.
    pub fn rename_input(&mut self, internal_name: &str, old_ui: &str, new_ui: &str) -> Result<()> {
        let sig = self
            .by_internal_name
            .get_mut(internal_name)
            .ok_or_else(|| Error::SchemaMissing(internal_name.to_string()))?;
        let internal = sig
            .ui_to_internal_input_map
            .shift_remove(old_ui)
            .ok_or_else(|| Error::SchemaMissing(format!("input `{old_ui}`")))?;
        if sig.ui_to_internal_input_map.contains_key(new_ui) {
            return Err(Error::InvalidSignatureChange(format!(
                "`{new_ui}` already in use"
            )));
        }
        sig.ui_to_internal_input_map.insert(new_ui.to_string(), internal);
        Ok(())
    }

    pub fn bump_version(&mut self, internal_name: &str) -> Result<u32> {
        let sig = self
            .by_internal_name
            .get_mut(internal_name)
            .ok_or_else(|| Error::SchemaMissing(internal_name.to_string()))?;
        sig.version += 1;
        Ok(sig.version)
    }

    /// Whether `remote` is compatible with the locally known signature of
    /// the same `internal_name`: same output arity/types, and every input
    /// the remote declares that we also declare has the same type.
    pub fn is_synced(&self, remote: &Signature) -> (bool, Option<String>) {
        match self.by_internal_name.get(&remote.internal_name) {
            None => (true, None),
            Some(local) => {
                if local.output_types != remote.output_types {
                    return (
                        false,
                        Some(format!(
                            "output arity/types changed for `{}`",
                            remote.internal_name
                        )),
                    );
                }
                for (name, ty) in &local.input_types {
                    if let Some(remote_ty) = remote.input_types.get(name) {
                        if remote_ty != ty {
                            return (
                                false,
                                Some(format!("input `{name}` changed type")),
                            );
                        }
                    } else if local.input_names.contains(name) {
                        return (
                            false,
                            Some(format!("input `{name}` removed upstream")),
                        );
                    }
                }
                (true, None)
            }
        }
    }

    /// Rename the keys of `tables` between UI and internal per-function
    /// table names, leaving any table not owned by a known signature
    /// untouched (e.g. `__vrefs__`, `__provenance__`, `__event_log__`).
    pub fn rename_tables<T>(
        &self,
        tables: IndexMap<String, T>,
        to: RenameDirection,
    ) -> IndexMap<String, T> {
        tables
            .into_iter()
            .map(|(table_name, data)| {
                let renamed = self
                    .by_internal_name
                    .values()
                    .find_map(|sig| match to {
                        RenameDirection::ToInternal if table_name == sig.versioned_ui_name() => {
                            Some(sig.versioned_internal_name())
                        }
                        RenameDirection::ToUi if table_name == sig.versioned_internal_name() => {
                            Some(sig.versioned_ui_name())
                        }
                        _ => None,
                    })
                    .unwrap_or(table_name);
                (renamed, data)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_input_preserves_call_identity_exclusion() {
        let mut reg = SignatureRegistry::new();
        reg.register(Signature::new("add", vec!["a".into(), "b".into()], 1))
            .unwrap();
        let default = ValueRef::wrap(&0i64).unwrap();
        reg.add_input("add", "c", &default).unwrap();
        let sig = reg.get("add").unwrap();
        assert!(sig.input_names.contains(&"c".to_string()));
        assert_eq!(sig.new_input_defaults_uids["c"], *default.uid());
    }

    #[test]
    fn rename_input_does_not_touch_internal_name() {
        let mut reg = SignatureRegistry::new();
        reg.register(Signature::new("add", vec!["a".into()], 1)).unwrap();
        reg.rename_input("add", "a", "first").unwrap();
        let sig = reg.get("add").unwrap();
        assert_eq!(sig.ui_to_internal_input_map["first"], "a");
        assert_eq!(sig.internal_name, "add");
    }

    #[test]
    fn rename_tables_round_trips() {
        let mut reg = SignatureRegistry::new();
        reg.register(Signature::new("add", vec!["a".into()], 1)).unwrap();
        let mut tables = IndexMap::new();
        tables.insert("add@1".to_string(), 123);
        let internal = reg.rename_tables(tables, RenameDirection::ToInternal);
        assert!(internal.contains_key("add@1")); // ui == internal here
    }

    #[test]
    fn is_synced_flags_output_arity_change() {
        let mut reg = SignatureRegistry::new();
        reg.register(Signature::new("add", vec!["a".into()], 1)).unwrap();
        let mut remote = Signature::new("add", vec!["a".into()], 2);
        remote.internal_name = "add".to_string();
        let (ok, reason) = reg.is_synced(&remote);
        assert!(!ok);
        assert!(reason.is_some());
    }
}
