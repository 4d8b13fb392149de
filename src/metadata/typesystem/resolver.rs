//! Shape resolution: turning decoded [`TypeShape`]s into interned
//! descriptors.
//!
//! Resolution is *shallow*: looking up a class token interns its descriptor
//! but does not initialize or lay it out, which is what keeps mutually
//! recursive type graphs (a class with a field of its own type, generic
//! hierarchies referring back to themselves) resolvable without cycles.
//!
//! Field-type resolution layers on top: it parses the raw signature blob,
//! substitutes the owner's generic arguments for `Var` occurrences, and
//! caches the result on the field descriptor. Any failure here poisons the
//! owning type permanently, with the root cause chained through
//! [`Error::dependency`].

use tracing::trace;

use crate::{
    metadata::{
        modules::ModuleId,
        signatures::{parse_field_signature, TypeShape},
        typesystem::{
            registry::{LoadScope, TypeRegistry},
            FieldRc, TypeHandle, TypeRc,
        },
    },
    Error, Result,
};

impl TypeRegistry {
    /// Resolve a decoded shape against this registry.
    ///
    /// `module` scopes the tokens inside the shape; `ctx` supplies the
    /// generic arguments substituted for `Var` indices, with unsubstituted
    /// indices falling back to shared placeholder descriptors so open
    /// definitions resolve too.
    pub(crate) fn resolve_shape(
        &self,
        module: ModuleId,
        shape: &TypeShape,
        ctx: Option<&[TypeRc]>,
        scope: &mut LoadScope,
    ) -> Result<TypeRc> {
        match shape {
            TypeShape::Primitive(kind) => Ok(self.primitive(*kind)),
            TypeShape::Class(token) | TypeShape::ValueType(token) => self.get(module, *token),
            TypeShape::SzArray(inner) => {
                let element = self.resolve_shape(module, inner, ctx, scope)?;
                Ok(self.szarray_of(&element))
            }
            TypeShape::Pointer(inner) => {
                let pointee = self.resolve_shape(module, inner, ctx, scope)?;
                Ok(self.pointer_to(&pointee))
            }
            TypeShape::FnPtr { params, returns } => {
                let params = params
                    .iter()
                    .map(|p| self.resolve_shape(module, p, ctx, scope))
                    .collect::<Result<Vec<_>>>()?;
                let returns = self.resolve_shape(module, returns, ctx, scope)?;
                Ok(self.fnptr_of(&params, &returns))
            }
            TypeShape::Var(index) => match ctx {
                Some(args) => args.get(*index as usize).cloned().ok_or_else(|| {
                    Error::UnresolvedDependency(format!(
                        "generic parameter !{index} is beyond the argument list of length {}",
                        args.len()
                    ))
                }),
                None => Ok(self.generic_param(*index)),
            },
            TypeShape::GenericInst {
                definition, args, ..
            } => {
                let definition = self.get(module, *definition)?;
                let args = args
                    .iter()
                    .map(|a| self.resolve_shape(module, a, ctx, scope))
                    .collect::<Result<Vec<_>>>()?;
                self.instantiate_with(&definition, &args, scope)
            }
        }
    }

    /// Resolve the declared type of `field`, caching it on the descriptor.
    ///
    /// # Errors
    /// A parse or resolution failure poisons the owning type; the recorded
    /// (first) failure is returned.
    pub fn resolve_field_type(&self, field: &FieldRc) -> Result<TypeRc> {
        let owner = field.owner.get()?;
        let mut scope = LoadScope::default();
        self.resolve_field_type_with(&owner, field, &mut scope)
    }

    pub(crate) fn resolve_field_type_with(
        &self,
        owner: &TypeRc,
        field: &FieldRc,
        scope: &mut LoadScope,
    ) -> Result<TypeRc> {
        owner.ensure_ok()?;
        if let Some(resolved) = field.resolved_type() {
            return Ok(resolved);
        }

        let shape = match parse_field_signature(&field.signature) {
            Ok(shape) => shape,
            Err(err) => return Err(owner.poison(err)),
        };
        trace!(owner = %owner, field = %field.name, ?shape, "resolving field type");

        // Tokens in the blob are scoped to the defining module; instances
        // share their definition's blobs
        let module = match &owner.generic {
            Some(generic) => generic.definition.get()?.module,
            None => owner.module,
        };
        let ctx: Option<&[TypeRc]> = owner.generic.as_ref().map(|g| &g.args[..]);

        let resolved = match self.resolve_shape(module, &shape, ctx, scope) {
            Ok(resolved) => resolved,
            Err(err) => {
                return Err(owner.poison(Error::dependency(&owner.to_string(), &err)));
            }
        };
        if let Err(err) = resolved.ensure_ok() {
            return Err(owner.poison(Error::dependency(&owner.to_string(), &err)));
        }

        field.set_resolved_type(TypeHandle::new(&resolved));
        Ok(resolved)
    }

    /// The underlying primitive representation of an enum type, derived
    /// from its single non-static field and cached as the enum's element
    /// type.
    ///
    /// # Errors
    /// Zero or multiple instance fields, or a non-integral field type,
    /// poison the enum with [`Error::MalformedSignature`].
    pub(crate) fn enum_underlying(&self, ty: &TypeRc, scope: &mut LoadScope) -> Result<TypeRc> {
        if let Some(element) = ty.element() {
            return Ok(element);
        }
        let Some(fields) = ty.fields() else {
            return Err(Error::UnresolvedDependency(format!(
                "{ty} has no materialized fields"
            )));
        };
        let fields = fields.clone();
        let mut instance_fields = fields.iter().filter(|f| !f.is_static());
        let underlying_field = match (instance_fields.next(), instance_fields.next()) {
            (Some(field), None) => field,
            (None, _) => {
                return Err(ty.poison(malformed_error!(
                    "enum {} has no instance field to derive its representation from",
                    ty
                )))
            }
            (Some(_), Some(_)) => {
                return Err(ty.poison(malformed_error!(
                    "enum {} has more than one instance field",
                    ty
                )))
            }
        };
        let underlying = self.resolve_field_type_with(ty, underlying_field, scope)?;
        let integral = underlying
            .primitive
            .is_some_and(|kind| kind.is_integral());
        if !integral {
            return Err(ty.poison(malformed_error!(
                "enum {} has non-integral underlying type {}",
                ty,
                underlying
            )));
        }
        ty.set_element(TypeHandle::new(&underlying));
        Ok(underlying)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::metadata::{
        signatures::PrimitiveKind,
        typesystem::registry::CORE_MODULE,
        token::Token,
    };

    #[test]
    fn test_resolve_primitive_and_array() {
        let registry = TypeRegistry::new();
        let mut scope = LoadScope::default();
        let shape = TypeShape::SzArray(Box::new(TypeShape::Primitive(PrimitiveKind::I4)));
        let resolved = registry
            .resolve_shape(CORE_MODULE, &shape, None, &mut scope)
            .unwrap();
        assert!(resolved.is_szarray());
        let again = registry
            .resolve_shape(CORE_MODULE, &shape, None, &mut scope)
            .unwrap();
        assert!(Arc::ptr_eq(&resolved, &again));
    }

    #[test]
    fn test_resolve_var_with_and_without_context() {
        let registry = TypeRegistry::new();
        let mut scope = LoadScope::default();
        let int32 = registry.primitive(PrimitiveKind::I4);
        let with_ctx = registry
            .resolve_shape(
                CORE_MODULE,
                &TypeShape::Var(0),
                Some(&[int32.clone()]),
                &mut scope,
            )
            .unwrap();
        assert!(Arc::ptr_eq(&with_ctx, &int32));
        let open = registry
            .resolve_shape(CORE_MODULE, &TypeShape::Var(1), None, &mut scope)
            .unwrap();
        assert_eq!(open.name, "!1");
    }

    #[test]
    fn test_resolve_unknown_token_fails() {
        let registry = TypeRegistry::new();
        let mut scope = LoadScope::default();
        let shape = TypeShape::Class(Token::typedef(4000));
        assert!(registry
            .resolve_shape(CORE_MODULE, &shape, None, &mut scope)
            .is_err());
    }
}
