//! Member materialization: the cheap first pass over field and method rows.
//!
//! This pass copies names, attribute bits, and raw signature blobs out of
//! the row tables into shared descriptors. It deliberately resolves
//! *nothing* about field types; that is the resolver's job, deferred until
//! layout actually needs sizes. Keeping this pass cheap is what lets
//! enumeration-style consumers (reflection over names, member counts) run
//! without triggering layout.
//!
//! Two orthogonal rules:
//! - A definition still under external construction defers: the call
//!   succeeds without materializing, and a later call retries.
//! - A generic instance materializes by copying its definition's member
//!   rows; names, counts, and declaration order are identical by
//!   construction.

use std::sync::Arc;

use crate::{
    metadata::typesystem::{
        registry::{LoadScope, TypeRegistry},
        FieldDescriptor, FieldRc, MethodDescriptor, MethodRc, TypeHandle, TypeKind, TypeRc,
    },
    Error, Result,
};

impl TypeRegistry {
    /// Materialize field descriptors for `ty` from its rows.
    ///
    /// Idempotent. Defers (returns `Ok` without materializing) while the
    /// backing definition is marked under construction.
    ///
    /// # Errors
    /// Propagates row-table lookup failures.
    pub(crate) fn ensure_fields(&self, ty: &TypeRc, scope: &mut LoadScope) -> Result<()> {
        if ty.fields().is_some() {
            return Ok(());
        }
        match ty.kind {
            TypeKind::Definition | TypeKind::GenericDefinition => {
                let (_, row) = self.definition_row(ty)?;
                if row.under_construction {
                    return Ok(());
                }
                let owner = TypeHandle::new(ty);
                let fields: Vec<FieldRc> = row
                    .fields
                    .iter()
                    .map(|f| {
                        Arc::new(FieldDescriptor::new(
                            &f.name,
                            f.flags,
                            Arc::from(f.signature.as_slice()),
                            f.explicit_offset,
                            owner.clone(),
                        ))
                    })
                    .collect();
                ty.set_fields(Arc::from(fields));
                Ok(())
            }
            TypeKind::GenericInstance => {
                let definition = match &ty.generic {
                    Some(generic) => generic.definition.get()?,
                    None => return Err(Error::TypeNotFound(ty.token)),
                };
                self.ensure_fields(&definition, scope)?;
                // Deferred along with the definition
                let Some(def_fields) = definition.fields() else {
                    return Ok(());
                };
                let owner = TypeHandle::new(ty);
                let fields: Vec<FieldRc> = def_fields
                    .iter()
                    .map(|f| {
                        Arc::new(FieldDescriptor::new(
                            &f.name,
                            f.flags,
                            f.signature.clone(),
                            f.explicit_offset,
                            owner.clone(),
                        ))
                    })
                    .collect();
                ty.set_fields(Arc::from(fields));
                Ok(())
            }
            _ => {
                ty.set_fields(Arc::from(Vec::new()));
                Ok(())
            }
        }
    }

    /// Materialize method descriptors for `ty`, resolving parameter and
    /// return types (shallowly) so signature comparison reduces to pointer
    /// equality.
    ///
    /// # Errors
    /// Propagates resolution failures of parameter/return shapes, chained
    /// as a dependency of `ty`.
    pub(crate) fn ensure_methods(&self, ty: &TypeRc, scope: &mut LoadScope) -> Result<()> {
        if ty.methods().is_some() {
            return Ok(());
        }
        if !matches!(
            ty.kind,
            TypeKind::Definition | TypeKind::GenericDefinition | TypeKind::GenericInstance
        ) {
            ty.set_methods(Arc::from(Vec::new()));
            return Ok(());
        }

        let (def_module, row) = self.definition_row(ty)?;
        let ctx: Option<&[TypeRc]> = ty.generic.as_ref().map(|g| &g.args[..]);
        let owner = TypeHandle::new(ty);

        let mut methods: Vec<MethodRc> = Vec::with_capacity(row.methods.len());
        for (index, m) in row.methods.iter().enumerate() {
            let params = m
                .params
                .iter()
                .map(|p| {
                    self.resolve_shape(def_module, p, ctx, scope)
                        .map(|rc| TypeHandle::new(&rc))
                })
                .collect::<Result<Vec<_>>>()
                .map_err(|e| Error::dependency(&ty.to_string(), &e))?;
            let returns = self
                .resolve_shape(def_module, &m.returns, ctx, scope)
                .map_err(|e| Error::dependency(&ty.to_string(), &e))?;
            methods.push(Arc::new(MethodDescriptor::new(
                &m.name,
                m.flags,
                m.has_body,
                params.into_boxed_slice(),
                TypeHandle::new(&returns),
                owner.clone(),
                index,
            )));
        }
        ty.set_methods(Arc::from(methods));
        Ok(())
    }
}
