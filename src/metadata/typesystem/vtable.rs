//! Virtual dispatch table construction.
//!
//! A class vtable is built in layers on top of a copy of the parent's
//! table:
//!
//! 1. interface method ranges are appended (offsets from the
//!    [`interfaces`](super::interfaces) assigner),
//! 2. explicit override rows are applied, redirecting ancestor or
//!    interface declarations to local bodies,
//! 3. the type's own virtual methods are placed: reuse-slot methods take
//!    over a matching ancestor slot, new-slot methods (and those with no
//!    match) extend the table,
//! 4. every interface method is resolved in search order: explicit
//!    override, then a matching new-slot method of the class itself, then
//!    a back-to-front scan of the table built so far, then the
//!    declaration's own default body,
//! 5. the finished table is validated: on a concrete type every slot must
//!    hold a non-abstract method.
//!
//! Single-dimensional arrays of reference elements append one synthetic
//! slot for the covariant store check. Generic instances never run the
//! general algorithm: the definition's finished table is mirrored
//! slot-by-slot, each method replaced by its counterpart on the
//! instantiated hierarchy (same owner, same method index).
//!
//! A child whose table came out identical to its parent's shares the
//! parent's allocation.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::{
    metadata::{
        modules::MethodAttributes,
        typesystem::{
            registry::{LoadScope, TypeRegistry},
            MethodDescriptor, MethodRc, TypeHandle, TypeKey, TypeKind, TypeRc, VTable,
        },
    },
    Error, Result,
};

/// Hard cap on vtable slots
const MAX_VTABLE_SIZE: u32 = 0xFFFF;

impl TypeRegistry {
    /// Build and publish the vtable of `ty` (parents, interfaces, and for
    /// instances the generic definition included).
    ///
    /// Idempotent; a published table short-circuits without locking.
    ///
    /// # Errors
    /// Dispatch inconsistencies poison `ty`; parent and interface
    /// failures are chained.
    pub fn ensure_vtable(&self, ty: &TypeRc) -> Result<()> {
        let mut scope = LoadScope::default();
        self.vtable_with(ty, &mut scope)
    }

    pub(crate) fn vtable_with(&self, ty: &TypeRc, scope: &mut LoadScope) -> Result<()> {
        ty.ensure_ok()?;
        if ty.vtable().is_some() {
            return Ok(());
        }
        self.initialize(ty, scope)?;
        if ty.vtable().is_some() {
            return Ok(());
        }
        match self.build_vtable(ty, scope) {
            Ok(vtable) => {
                debug!(ty = %ty, slots = vtable.len(), "vtable built");
                let _guard = self.lock_loader()?;
                ty.publish_vtable(vtable);
                Ok(())
            }
            Err(err) => Err(ty.poison(err)),
        }
    }

    fn build_vtable(&self, ty: &TypeRc, scope: &mut LoadScope) -> Result<Arc<VTable>> {
        if ty.is_interface() {
            return self.build_interface_vtable(ty, scope);
        }
        match ty.kind {
            TypeKind::SzArray => self.build_array_vtable(ty, scope),
            TypeKind::Pointer | TypeKind::FnPtr | TypeKind::GenericParam { .. } => {
                self.assign_interface_offsets(ty, 0, scope)?;
                Ok(Arc::new(VTable {
                    slots: Box::new([]),
                }))
            }
            TypeKind::GenericInstance => self.build_instance_vtable(ty, scope),
            TypeKind::Definition | TypeKind::GenericDefinition => {
                self.build_class_vtable(ty, scope)
            }
        }
    }

    /// Interfaces carry a table of their own virtual instance methods,
    /// numbered from 0 in declaration order. These slot numbers are what
    /// implementing classes add their interface offsets to.
    fn build_interface_vtable(&self, ty: &TypeRc, scope: &mut LoadScope) -> Result<Arc<VTable>> {
        let methods = ty.methods().cloned().unwrap_or_else(|| Arc::from(Vec::new()));
        let mut slots: Vec<Option<MethodRc>> = Vec::new();
        for method in methods.iter() {
            if method.is_virtual() && !method.is_static() {
                method.set_slot(slots.len() as u32);
                slots.push(Some(method.clone()));
            }
        }
        self.assign_interface_offsets(ty, slots.len() as u32, scope)?;
        Ok(Arc::new(VTable {
            slots: slots.into_boxed_slice(),
        }))
    }

    fn build_array_vtable(&self, ty: &TypeRc, scope: &mut LoadScope) -> Result<Arc<VTable>> {
        let parent = ty.parent().ok_or_else(|| {
            Error::VTableInconsistency(format!("array type {ty} has no parent"))
        })?;
        self.vtable_with(&parent, scope)
            .map_err(|e| Error::dependency(&ty.to_string(), &e))?;
        let parent_vtable = parent.vtable().cloned().ok_or(Error::LockError)?;

        let element_is_ref = ty.element().is_some_and(|e| e.is_reference_like());
        if !element_is_ref {
            // Identical to the parent's table; share the allocation
            self.assign_interface_offsets(ty, parent_vtable.len() as u32, scope)?;
            return Ok(parent_vtable);
        }

        let mut slots = parent_vtable.slots.to_vec();
        // Covariant writes go through a per-array store check
        let store_check: MethodRc = Arc::new(MethodDescriptor::new(
            "StoreElementChecked",
            MethodAttributes::PUBLIC
                | MethodAttributes::VIRTUAL
                | MethodAttributes::HIDE_BY_SIG
                | MethodAttributes::NEW_SLOT,
            true,
            Box::new([TypeHandle::new(&self.core().object)]),
            TypeHandle::new(&self.primitive(crate::metadata::signatures::PrimitiveKind::Void)),
            TypeHandle::new(ty),
            0,
        ));
        store_check.set_slot(slots.len() as u32);
        slots.push(Some(store_check));
        self.assign_interface_offsets(ty, slots.len() as u32, scope)?;
        Ok(Arc::new(VTable {
            slots: slots.into_boxed_slice(),
        }))
    }

    /// A generic instance mirrors its definition's table slot-by-slot.
    fn build_instance_vtable(&self, ty: &TypeRc, scope: &mut LoadScope) -> Result<Arc<VTable>> {
        let definition = match &ty.generic {
            Some(generic) => generic.definition.get()?,
            None => return Err(Error::TypeNotFound(ty.token)),
        };
        self.vtable_with(&definition, scope)
            .map_err(|e| Error::dependency(&ty.to_string(), &e))?;
        let def_vtable = definition.vtable().cloned().ok_or(Error::LockError)?;

        // The instance's own ranges mirror the definition's, but the
        // table must exist for dispatch queries against the instance
        if let Some(parent) = ty.parent() {
            self.vtable_with(&parent, scope)
                .map_err(|e| Error::dependency(&ty.to_string(), &e))?;
        }
        let base = ty.parent().and_then(|p| p.vtable().map(|v| v.len() as u32));
        self.assign_interface_offsets(ty, base.unwrap_or(0), scope)?;

        let mut slots: Vec<Option<MethodRc>> = Vec::with_capacity(def_vtable.len());
        for def_slot in def_vtable.slots.iter() {
            match def_slot {
                None => slots.push(None),
                Some(def_method) => {
                    let counterpart = self.counterpart_method(ty, def_method, scope)?;
                    counterpart.set_slot(slots.len() as u32);
                    slots.push(Some(counterpart));
                }
            }
        }
        Ok(Arc::new(VTable {
            slots: slots.into_boxed_slice(),
        }))
    }

    /// Map a method occupying a definition-side vtable slot to its
    /// counterpart on the instantiated hierarchy: the type backed by the
    /// same definition, at the same method index.
    fn counterpart_method(
        &self,
        instance: &TypeRc,
        def_method: &MethodRc,
        scope: &mut LoadScope,
    ) -> Result<MethodRc> {
        let decl_owner = def_method.owner.get()?;
        let owner_key = backing_key(&decl_owner)?;

        let mut current = Some(instance.clone());
        while let Some(candidate) = current {
            if backing_key(&candidate)? == owner_key {
                self.initialize(&candidate, scope)?;
                return candidate
                    .methods()
                    .and_then(|methods| methods.get(def_method.index).cloned())
                    .ok_or_else(|| {
                        Error::VTableInconsistency(format!(
                            "method {} has no counterpart on {}",
                            def_method.name, candidate
                        ))
                    });
            }
            current = candidate.parent();
        }

        // Default interface bodies live on the (possibly instantiated)
        // interface rather than on the class chain
        if let Some(table) = instance.interface_table() {
            for entry in &table.entries {
                let iface = entry.interface.get()?;
                if backing_key(&iface)? == owner_key {
                    self.initialize(&iface, scope)?;
                    if let Some(method) =
                        iface.methods().and_then(|m| m.get(def_method.index).cloned())
                    {
                        return Ok(method);
                    }
                }
            }
        }
        Err(Error::VTableInconsistency(format!(
            "no counterpart for {}.{} in the hierarchy of {}",
            decl_owner, def_method.name, instance
        )))
    }

    fn build_class_vtable(&self, ty: &TypeRc, scope: &mut LoadScope) -> Result<Arc<VTable>> {
        let (def_module, row) = self.definition_row(ty)?;
        let methods = ty
            .methods()
            .cloned()
            .unwrap_or_else(|| Arc::from(Vec::new()));
        let ctx: Option<&[TypeRc]> = ty.generic.as_ref().map(|g| &g.args[..]);

        let parent_vtable = match ty.parent() {
            Some(parent) => {
                self.vtable_with(&parent, scope)
                    .map_err(|e| Error::dependency(&ty.to_string(), &e))?;
                parent.vtable().cloned()
            }
            None => None,
        };
        let mut slots: Vec<Option<MethodRc>> = parent_vtable
            .as_ref()
            .map(|v| v.slots.to_vec())
            .unwrap_or_default();

        // Interface ranges sit between the parent copy and own new slots
        let mut cur_slot = self.assign_interface_offsets(ty, slots.len() as u32, scope)?;
        slots.resize(cur_slot as usize, None);

        // Explicit overrides
        let mut override_map: Vec<(MethodRc, MethodRc)> = Vec::new();
        for ov in &row.overrides {
            let decl_type = self
                .resolve_shape(def_module, &ov.declaring_type, ctx, scope)
                .map_err(|e| Error::dependency(&ty.to_string(), &e))?;
            self.initialize(&decl_type, scope)?;
            self.vtable_with(&decl_type, scope)
                .map_err(|e| Error::dependency(&ty.to_string(), &e))?;
            let decl = decl_type
                .methods()
                .and_then(|ms| {
                    ms.iter()
                        .find(|m| m.is_virtual() && m.name == ov.declaration)
                        .cloned()
                })
                .ok_or_else(|| {
                    Error::VTableInconsistency(format!(
                        "override declaration {}.{} not found",
                        decl_type, ov.declaration
                    ))
                })?;
            let body = methods.get(ov.body_index).cloned().ok_or_else(|| {
                Error::VTableInconsistency(format!(
                    "override body index {} out of range on {ty}",
                    ov.body_index
                ))
            })?;
            self.check_override(&decl_type, &decl, &body)?;

            if decl_type.is_interface() {
                let iid = decl_type.interface_id().ok_or_else(|| {
                    Error::VTableInconsistency(format!("{ty} does not implement {decl_type}"))
                })?;
                let offset = ty
                    .interface_table()
                    .and_then(|t| t.offset_of(iid))
                    .ok_or_else(|| {
                        Error::VTableInconsistency(format!(
                            "{ty} overrides {decl_type}.{} without implementing {decl_type}",
                            decl.name
                        ))
                    })?;
                let islot = decl.slot().ok_or(Error::LockError)?;
                slots[(offset + islot) as usize] = Some(body.clone());
                override_map.push((decl, body));
            } else {
                let decl_slot = decl.slot().ok_or_else(|| {
                    Error::VTableInconsistency(format!(
                        "overridden method {}.{} has no slot",
                        decl_type, decl.name
                    ))
                })?;
                body.set_slot(decl_slot);
                slots[decl_slot as usize] = Some(body.clone());
                override_map.push((decl, body));
            }
        }

        // Own virtual methods
        for method in methods.iter() {
            if !method.is_virtual() || method.is_static() {
                continue;
            }
            if method.slot().is_some() {
                // Placed by an explicit class override already
                continue;
            }
            if !method.is_newslot() {
                if let Some(slot) = find_ancestor_slot(ty, method) {
                    method.set_slot(slot);
                    slots[slot as usize] = Some(method.clone());
                    trace!(ty = %ty, method = %method.name, slot, "slot reused");
                    continue;
                }
            }
            method.set_slot(cur_slot);
            slots.push(Some(method.clone()));
            trace!(ty = %ty, method = %method.name, slot = cur_slot, "new slot");
            cur_slot += 1;
        }

        // Interface dispatch
        let entries: Vec<(TypeRc, u32)> = ty
            .interface_table()
            .map(|table| {
                table
                    .entries
                    .iter()
                    .map(|e| e.interface.get().map(|i| (i, e.offset)))
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();
        for (iface, offset) in entries {
            self.vtable_with(&iface, scope)
                .map_err(|e| Error::dependency(&ty.to_string(), &e))?;
            let iface_methods = iface.methods().cloned().unwrap_or_else(|| Arc::from(Vec::new()));
            for decl in iface_methods.iter() {
                if !decl.is_virtual() || decl.is_static() {
                    continue;
                }
                let islot = decl.slot().ok_or(Error::LockError)?;
                let target = (offset + islot) as usize;
                let resolved = resolve_interface_method(decl, &override_map, &methods, &slots);
                match resolved {
                    Some(implementation) => slots[target] = Some(implementation),
                    None => {
                        // A parent-copied implementation may already be in
                        // place; only a true hole matters
                        if slots[target].is_none() && !ty.is_abstract() {
                            return Err(Error::VTableInconsistency(format!(
                                "{ty} does not implement {}.{}",
                                iface, decl.name
                            )));
                        }
                    }
                }
            }
        }

        if cur_slot > MAX_VTABLE_SIZE {
            return Err(Error::VTableInconsistency(format!(
                "{ty} requires {cur_slot} vtable slots, above the {MAX_VTABLE_SIZE} limit"
            )));
        }
        debug_assert_eq!(slots.len(), cur_slot as usize);

        // Final concreteness validation
        if !ty.is_abstract() {
            for (index, slot) in slots.iter().enumerate() {
                match slot {
                    None => {
                        return Err(Error::VTableInconsistency(format!(
                            "{ty} has an empty vtable slot {index}"
                        )))
                    }
                    Some(method) if method.is_abstract() => {
                        return Err(Error::VTableInconsistency(format!(
                            "{ty} leaves abstract method {} in slot {index}",
                            method.name
                        )))
                    }
                    Some(_) => {}
                }
            }
        }

        // Identical tables alias the parent's allocation
        if let Some(parent_vtable) = parent_vtable {
            if tables_equal(&slots, &parent_vtable.slots) {
                return Ok(parent_vtable);
            }
        }
        Ok(Arc::new(VTable {
            slots: slots.into_boxed_slice(),
        }))
    }

    fn check_override(
        &self,
        decl_type: &TypeRc,
        decl: &MethodRc,
        body: &MethodRc,
    ) -> Result<()> {
        if !decl.is_virtual() || decl.is_static() {
            return Err(Error::VTableInconsistency(format!(
                "override declaration {} is not a virtual instance method",
                decl.name
            )));
        }
        if !body.is_virtual() || body.is_static() {
            return Err(Error::VTableInconsistency(format!(
                "override body {} is not a virtual instance method",
                body.name
            )));
        }
        if decl.is_final() {
            return Err(Error::VTableInconsistency(format!(
                "cannot override final method {}",
                decl.name
            )));
        }
        if !decl.sig_types_match(body) {
            return Err(Error::VTableInconsistency(format!(
                "override body {} does not match the signature of {}",
                body.name, decl.name
            )));
        }
        if body.flags.accessibility() < decl.flags.accessibility() {
            let legacy_allowance = self.options().allow_legacy_collection_overrides
                && decl_type.is_interface()
                && decl_type.namespace.starts_with("System.Collections");
            if !legacy_allowance {
                return Err(Error::VTableInconsistency(format!(
                    "override body {} narrows the accessibility of {}",
                    body.name, decl.name
                )));
            }
        }
        Ok(())
    }
}

/// Key of the type's generic definition, or its own key when it is not
/// an instantiation.
fn backing_key(ty: &TypeRc) -> Result<TypeKey> {
    match &ty.generic {
        Some(generic) => Ok(generic.definition.get()?.key()),
        None => Ok(ty.key()),
    }
}

/// Slot of the closest ancestor's virtual method matching `method` by
/// name and signature, if any.
fn find_ancestor_slot(ty: &TypeRc, method: &MethodRc) -> Option<u32> {
    let mut current = ty.parent();
    while let Some(ancestor) = current {
        if let Some(methods) = ancestor.methods() {
            for candidate in methods.iter() {
                if candidate.is_virtual()
                    && !candidate.is_static()
                    && candidate.signature_matches(method)
                {
                    if let Some(slot) = candidate.slot() {
                        return Some(slot);
                    }
                }
            }
        }
        current = ancestor.parent();
    }
    None
}

/// Search order for an interface declaration's implementation.
fn resolve_interface_method(
    decl: &MethodRc,
    override_map: &[(MethodRc, MethodRc)],
    own_methods: &Arc<[MethodRc]>,
    slots: &[Option<MethodRc>],
) -> Option<MethodRc> {
    // 1. explicit override of this exact declaration
    for (overridden, body) in override_map {
        if Arc::ptr_eq(overridden, decl) {
            return Some(body.clone());
        }
    }
    // 2. a new-slot method of the class itself, by name and signature.
    // Slot-reusing methods are reachable through the table scan below
    // once they land in an ancestor's slot.
    for method in own_methods.iter() {
        if method.is_virtual()
            && !method.is_static()
            && method.is_newslot()
            && method.signature_matches(decl)
        {
            return Some(method.clone());
        }
    }
    // 3. most derived implementation already in the table
    for slot in slots.iter().rev().flatten() {
        if !slot.is_abstract() && slot.signature_matches(decl) {
            return Some(slot.clone());
        }
    }
    // 4. the declaration's own default body
    if decl.has_body && !decl.is_abstract() {
        return Some(decl.clone());
    }
    None
}

fn tables_equal(a: &[Option<MethodRc>], b: &[Option<MethodRc>]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b.iter()).all(|(x, y)| match (x, y) {
            (None, None) => true,
            (Some(x), Some(y)) => Arc::ptr_eq(x, y),
            _ => false,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{
        modules::{ModuleMetadata, TypeAttributes, TypeDefRow},
        signatures::{PrimitiveKind, TypeShape},
        typesystem::registry::CORE_MODULE,
        token::Token,
    };

    #[test]
    fn test_object_vtable_has_core_virtuals() {
        let registry = TypeRegistry::new();
        let object = registry.by_name("System.Object").unwrap();
        registry.ensure_vtable(&object).unwrap();
        let vtable = object.vtable().unwrap();
        assert_eq!(vtable.len(), 4);
        assert_eq!(vtable.slot(0).unwrap().name, "ToString");
        assert_eq!(vtable.slot(3).unwrap().name, "Finalize");
    }

    #[test]
    fn test_trivial_subclass_aliases_parent_vtable() {
        let registry = TypeRegistry::new();
        let mut module = ModuleMetadata::new("m");
        let object_ref = module.add_type_ref(CORE_MODULE, Token::typedef(1));
        let token = module.add_type(
            TypeDefRow::new("N", "Plain", TypeAttributes::PUBLIC)
                .extends(TypeShape::Class(object_ref)),
        );
        let id = registry.add_module(module);
        let ty = registry.get(id, token).unwrap();
        registry.ensure_vtable(&ty).unwrap();
        let object = registry.by_name("System.Object").unwrap();
        assert!(Arc::ptr_eq(
            ty.vtable().unwrap(),
            object.vtable().unwrap()
        ));
    }

    #[test]
    fn test_ref_array_gets_store_check_slot() {
        let registry = TypeRegistry::new();
        let string = registry.primitive(PrimitiveKind::String);
        let string_array = registry.szarray_of(&string);
        registry.ensure_vtable(&string_array).unwrap();
        let array = registry.by_name("System.Array").unwrap();
        let base_len = array.vtable().unwrap().len();
        let vtable = string_array.vtable().unwrap();
        assert_eq!(vtable.len(), base_len + 1);
        assert_eq!(
            vtable.slot(base_len as u32).unwrap().name,
            "StoreElementChecked"
        );

        let int32 = registry.primitive(PrimitiveKind::I4);
        let int_array = registry.szarray_of(&int32);
        registry.ensure_vtable(&int_array).unwrap();
        assert_eq!(int_array.vtable().unwrap().len(), base_len);
    }
}
