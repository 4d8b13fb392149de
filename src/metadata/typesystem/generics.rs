//! Generic instantiation: the cache and the deferred parent protocol.
//!
//! Instantiating a definition with argument descriptors yields one interned
//! instance per distinct argument list; the instance is inserted into the
//! cache *before* its parent is resolved, which is what terminates directly
//! self-referential hierarchies such as `C<T> : Base<C<T>>` (resolving the
//! parent's argument hits the cache instead of re-creating the instance).
//!
//! Deeper recursion through the parent chain is handled by recording:
//! while one instance's parent is being set up, instances created along the
//! way are queued on the scope instead of setting up their own parents
//! inline. Once the outer parent is linked, the queue is drained and every
//! recorded instance that still lacks a parent gets one. The result is
//! that no instance is ever observable with an unset parent after its
//! creating call returns.

use std::sync::Arc;

use tracing::trace;

use crate::{
    metadata::{
        modules::{ModuleId, TypeDefRow},
        typesystem::{
            registry::{InstantiationKey, LoadScope, TypeRegistry},
            GenericInstanceInfo, TypeDescriptor, TypeHandle, TypeKind, TypeRc, TypeTraits,
        },
    },
    Error, Result,
};

impl TypeRegistry {
    /// Instantiate `definition` with the given argument descriptors.
    ///
    /// Interned: equal definitions and argument lists always return the
    /// same descriptor. The returned instance always has its parent link
    /// set (recursive hierarchies included).
    ///
    /// # Errors
    /// Fails on a non-generic definition, argument count mismatch, or
    /// `System.Void` among the arguments; parent-resolution failures
    /// poison the new instance.
    pub fn instantiate(&self, definition: &TypeRc, args: &[TypeRc]) -> Result<TypeRc> {
        let mut scope = LoadScope::default();
        self.instantiate_with(definition, args, &mut scope)
    }

    pub(crate) fn instantiate_with(
        &self,
        definition: &TypeRc,
        args: &[TypeRc],
        scope: &mut LoadScope,
    ) -> Result<TypeRc> {
        definition.ensure_ok()?;
        if !definition.is_generic_definition() {
            return Err(malformed_error!(
                "{} is not a generic type definition",
                definition
            ));
        }
        if args.len() != definition.generic_param_count as usize {
            return Err(Error::UnresolvedDependency(format!(
                "{} expects {} type argument(s), got {}",
                definition,
                definition.generic_param_count,
                args.len()
            )));
        }
        for arg in args {
            if arg.fullname() == "System.Void" {
                return Err(Error::UnresolvedDependency(format!(
                    "System.Void cannot be a type argument of {definition}"
                )));
            }
        }

        let key = InstantiationKey {
            definition: definition.key(),
            args: args.iter().map(|a| a.key()).collect(),
        };
        if let Some(existing) = self.instantiations.get(&key) {
            return Ok(existing.clone());
        }

        let created: TypeRc = Arc::new(
            TypeDescriptor::new(
                self.alloc_token(),
                definition.module,
                &definition.namespace,
                &definition.name,
                TypeKind::GenericInstance,
                definition.flags,
            )
            .with_generic(GenericInstanceInfo {
                definition: TypeHandle::new(definition),
                args: args.to_vec().into_boxed_slice(),
            }),
        );
        // Cache before parent setup; a racing creation settles here too
        let ty = self
            .instantiations
            .entry(key)
            .or_insert(created)
            .value()
            .clone();
        let ty = self.intern_constructed(ty);
        trace!(instance = %ty, "instantiated generic definition");

        if scope.recording > 0 {
            // A parent chain is being set up above us; queue for patching
            scope.recorded.push(ty.clone());
            return Ok(ty);
        }

        scope.recording += 1;
        let setup = self.setup_instance_parent(&ty, scope);
        scope.recording -= 1;
        if let Err(err) = setup {
            return Err(ty.poison(err));
        }
        while let Some(recorded) = scope.recorded.pop() {
            if recorded.parent_set() {
                continue;
            }
            if let Err(err) = self.setup_instance_parent(&recorded, scope) {
                return Err(recorded.poison(err));
            }
        }
        Ok(ty)
    }

    fn setup_instance_parent(&self, ty: &TypeRc, scope: &mut LoadScope) -> Result<()> {
        let (def_module, row) = self.definition_row(ty)?;
        self.setup_parent(ty, def_module, &row, scope)
    }

    /// Resolve and link `ty`'s parent from its row, deriving value-type
    /// and enum traits from the parent's identity.
    pub(crate) fn setup_parent(
        &self,
        ty: &TypeRc,
        def_module: ModuleId,
        row: &TypeDefRow,
        scope: &mut LoadScope,
    ) -> Result<()> {
        if ty.parent_set() {
            return Ok(());
        }
        let Some(extends) = &row.extends else {
            return Ok(());
        };
        let ctx: Option<&[TypeRc]> = ty.generic.as_ref().map(|g| &g.args[..]);
        let parent = self
            .resolve_shape(def_module, extends, ctx, scope)
            .map_err(|e| Error::dependency(&ty.to_string(), &e))?;
        ty.set_traits(derive_traits(ty, &parent));
        ty.set_parent(TypeHandle::new(&parent));
        Ok(())
    }
}

/// Value-type and enum facts follow from the direct parent's identity.
fn derive_traits(ty: &TypeRc, parent: &TypeRc) -> TypeTraits {
    let parent_name = parent.fullname();
    let enum_parent = parent_name == "System.Enum";
    TypeTraits {
        value_type: enum_parent
            || (parent_name == "System.ValueType" && ty.fullname() != "System.Enum"),
        enum_type: enum_parent,
    }
}
