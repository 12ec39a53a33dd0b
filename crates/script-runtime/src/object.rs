//! Counted references to interpreter objects.

use crate::runtime::{ObjId, Runtime};

/// A strong reference to an interpreter object (a module or an instance).
///
/// Cloning and dropping adjust the interpreter-side count under the runtime
/// lock. Once the runtime is no longer alive a drop leaks the reference
/// instead: interpreter state is never touched after finalization.
pub struct ObjectRef {
    id: ObjId,
    runtime: Runtime,
}

impl ObjectRef {
    /// Wrap an id whose count was already incremented on our behalf.
    pub(crate) fn adopt(runtime: &Runtime, id: ObjId) -> Self {
        Self {
            id,
            runtime: runtime.clone(),
        }
    }

    pub(crate) fn id(&self) -> ObjId {
        self.id
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }
}

impl Clone for ObjectRef {
    fn clone(&self) -> Self {
        let guard = self.runtime.lock();
        if guard.with(|interp| interp.incref(self.id)) != Some(true) {
            tracing::trace!(object = self.id, "Cloned a reference into a dead runtime");
        }
        drop(guard);
        Self::adopt(&self.runtime, self.id)
    }
}

impl Drop for ObjectRef {
    fn drop(&mut self) {
        let guard = self.runtime.lock();
        if !guard.is_held() {
            self.runtime.note_leak();
            tracing::trace!(object = self.id, "Runtime not alive, leaking object reference");
            return;
        }
        let garbage = guard.with(|interp| interp.decref(self.id)).unwrap_or_default();
        drop(guard);
        // Freed objects may own callables holding further references.
        drop(garbage);
    }
}

impl std::fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRef").field("id", &self.id).finish()
    }
}
