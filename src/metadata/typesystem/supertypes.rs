//! Supertype chains: constant-time ancestor queries.
//!
//! Each type publishes an array of its ancestors ordered root-first and
//! ending with itself, plus its depth. `B` is an ancestor of `A` exactly
//! when `A`'s chain has `B` at index `B.depth - 1`, which turns subtype
//! checks into one bounds check and one pointer comparison.
//!
//! Publication order matters for lock-free readers: the array is stored
//! before the depth, and the depth is the readiness flag. A reader that
//! observes a non-zero depth is guaranteed to observe the full array.

use crate::{
    metadata::typesystem::{
        registry::{LoadScope, TypeRegistry},
        TypeHandle, TypeRc,
    },
    Error, Result,
};

impl TypeRegistry {
    /// Publish the ancestor chain of `ty` (and, transitively, of its
    /// parents).
    ///
    /// # Errors
    /// Propagates initialization failures; a broken parent chain poisons
    /// `ty` with a chained dependency error.
    pub fn ensure_supertypes(&self, ty: &TypeRc) -> Result<()> {
        let mut scope = LoadScope::default();
        self.supertypes_with(ty, &mut scope)
    }

    pub(crate) fn supertypes_with(&self, ty: &TypeRc, scope: &mut LoadScope) -> Result<()> {
        ty.ensure_ok()?;
        if ty.idepth() != 0 {
            return Ok(());
        }
        self.initialize(ty, scope)?;

        let chain = match ty.parent() {
            Some(parent) => {
                self.supertypes_with(&parent, scope)
                    .map_err(|e| ty.poison(Error::dependency(&ty.to_string(), &e)))?;
                let Some(parent_chain) = parent.supertypes() else {
                    return Err(ty.poison(Error::LockError));
                };
                let mut chain = Vec::with_capacity(parent_chain.len() + 1);
                chain.extend(parent_chain.iter().cloned());
                chain.push(TypeHandle::new(ty));
                chain
            }
            None => vec![TypeHandle::new(ty)],
        };

        let _guard = self.lock_loader()?;
        ty.publish_supertypes(chain.into_boxed_slice());
        Ok(())
    }
}
