//! Central type interning and the initialization phase.
//!
//! The [`TypeRegistry`] owns every descriptor: a lock-free skip list keyed
//! by `(module, token)` is the primary index, with secondary caches for
//! constructed shapes (arrays, pointers, function pointers, generic
//! parameters) and generic instantiations. All lookups return the same
//! `Arc` for the same type, which is what makes pointer identity usable as
//! type identity throughout the crate.
//!
//! The registry also carries the single coarse **loader lock** that
//! serializes first-time phase publication. Read paths are double-checked:
//! a published result short-circuits without touching the lock.
//!
//! An intrinsic core module (module 0) provides `System.Object`,
//! `System.ValueType`, `System.Enum`, `System.String`, `System.Array`,
//! ``System.Nullable`1`` and the primitive value types; they are ordinary
//! row-backed definitions and run through the same phases as user types.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex, MutexGuard,
};

use crossbeam_skiplist::SkipMap;
use dashmap::DashMap;
use rayon::prelude::*;
use tracing::{debug, trace};

use crate::{
    metadata::{
        modules::{GenericVariance, ModuleId, ModuleMetadata, TypeAttributes, TypeDefRow},
        signatures::{PrimitiveKind, TypeShape},
        token::{Token, TABLE_TYPEDEF, TABLE_TYPEREF},
    },
    metadata::typesystem::{
        FieldRc, MethodRc, TypeDescriptor, TypeHandle, TypeKey, TypeKind, TypeRc, TypeTraits,
    },
    Error, Result,
};

/// First artificial token handed out for constructed types
const ARTIFICIAL_TOKEN_BASE: u32 = 0xF000_0020;

/// Hard cap on definition-graph recursion during initialization
const MAX_INIT_DEPTH: usize = 100;

/// Hard cap on `TypeRef` chains followed by a single lookup
const MAX_TYPEREF_CHAIN: usize = 100;

/// Tuning knobs of a registry, fixed at construction.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Byte size of a managed pointer
    pub pointer_size: u32,
    /// Byte size of the object header preceding instance fields
    pub object_header_size: u32,
    /// Widen `min_align` of pointer-sized-or-smaller value types to their
    /// payload size. Opt-in: widening moves such a struct when it is
    /// embedded inside another type, so offsets computed with and without
    /// it disagree
    pub align_small_structs: bool,
    /// Accept overrides that narrow accessibility when the overridden
    /// declaration sits on a `System.Collections` interface (compatibility
    /// with assemblies that shipped relying on the old unchecked behavior)
    pub allow_legacy_collection_overrides: bool,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        RegistryOptions {
            pointer_size: 8,
            object_header_size: 8,
            align_small_structs: false,
            allow_legacy_collection_overrides: true,
        }
    }
}

/// Strong references to the intrinsic core types.
pub(crate) struct CoreTypes {
    pub object: TypeRc,
    pub value_type: TypeRc,
    pub enum_type: TypeRc,
    pub string: TypeRc,
    pub array: TypeRc,
    pub nullable: TypeRc,
    primitives: Vec<(PrimitiveKind, TypeRc)>,
}

impl CoreTypes {
    /// Descriptor of a built-in primitive kind.
    pub(crate) fn primitive(&self, kind: PrimitiveKind) -> &TypeRc {
        match kind {
            PrimitiveKind::Object => &self.object,
            PrimitiveKind::String => &self.string,
            _ => {
                // The vector carries every remaining kind; Object is the
                // fallback that can never be reached with intact bootstrap.
                self.primitives
                    .iter()
                    .find(|(k, _)| *k == kind)
                    .map_or(&self.object, |(_, ty)| ty)
            }
        }
    }
}

/// Recursion state threaded through one top-level operation.
///
/// Created at every public entry point and passed by `&mut` through the
/// internal call graph, so re-entrancy is visible in the call structure
/// itself rather than hidden in thread-local storage.
#[derive(Default)]
pub(crate) struct LoadScope {
    /// Types whose initialization frame is on the call stack
    pub init_stack: Vec<TypeKey>,
    /// Types whose layout frame is on the call stack
    pub layout_stack: Vec<TypeKey>,
    /// Depth of generic-instantiation recording; non-zero defers parent
    /// setup of freshly created instances
    pub recording: u32,
    /// Instances created while recording was active, awaiting parent setup
    pub recorded: Vec<TypeRc>,
}

/// Key of the generic-instantiation cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct InstantiationKey {
    pub definition: TypeKey,
    pub args: Box<[TypeKey]>,
}

/// The central interning table and phase driver.
///
/// All state is owned by the registry instance; dropping it reclaims the
/// entire descriptor graph, since descriptors link to each other only
/// through weak [`TypeHandle`]s.
pub struct TypeRegistry {
    options: RegistryOptions,
    modules: DashMap<ModuleId, Arc<ModuleMetadata>>,
    types: SkipMap<TypeKey, TypeRc>,
    name_index: DashMap<String, TypeHandle>,
    pub(crate) instantiations: DashMap<InstantiationKey, TypeRc>,
    arrays: DashMap<TypeKey, TypeRc>,
    pointers: DashMap<TypeKey, TypeRc>,
    fnptrs: DashMap<Box<[TypeKey]>, TypeRc>,
    gparams: DashMap<u32, TypeRc>,
    next_token: AtomicU32,
    next_iid: AtomicU32,
    next_module: AtomicU32,
    loader_lock: Mutex<()>,
    core: CoreTypes,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        TypeRegistry::new()
    }
}

impl TypeRegistry {
    /// Registry with default [`RegistryOptions`].
    #[must_use]
    pub fn new() -> Self {
        TypeRegistry::with_options(RegistryOptions::default())
    }

    /// Registry with explicit options, bootstrapping the intrinsic core
    /// module.
    #[must_use]
    pub fn with_options(options: RegistryOptions) -> Self {
        let (corlib, primitive_kinds) = build_core_module();
        let corlib = Arc::new(corlib);

        let types = SkipMap::new();
        let name_index = DashMap::new();
        let mut primitives = Vec::new();
        let mut named: Vec<TypeRc> = Vec::new();

        for token in corlib.type_tokens() {
            // Rows exist for every token just produced
            let Some(row) = corlib.type_def(token) else {
                continue;
            };
            let kind = if row.generic_param_count > 0 {
                TypeKind::GenericDefinition
            } else {
                TypeKind::Definition
            };
            let mut descriptor = TypeDescriptor::new(
                token,
                CORE_MODULE,
                &row.namespace,
                &row.name,
                kind,
                row.flags,
            )
            .with_generic_param_count(row.generic_param_count);
            if let Some(kind) = primitive_kinds[(token.row() - 1) as usize] {
                descriptor = descriptor.with_primitive(kind).with_traits(TypeTraits {
                    value_type: kind.is_value_type(),
                    enum_type: false,
                });
            }
            let ty: TypeRc = Arc::new(descriptor);
            types.insert(ty.key(), ty.clone());
            name_index.insert(ty.fullname(), TypeHandle::new(&ty));
            if let Some(kind) = primitive_kinds[(token.row() - 1) as usize] {
                primitives.push((kind, ty.clone()));
            }
            named.push(ty);
        }

        // Row order is fixed by build_core_module
        let core = CoreTypes {
            object: named[0].clone(),
            value_type: named[1].clone(),
            enum_type: named[2].clone(),
            string: named[3].clone(),
            array: named[4].clone(),
            nullable: named[named.len() - 1].clone(),
            primitives,
        };

        let modules = DashMap::new();
        modules.insert(CORE_MODULE, corlib);

        TypeRegistry {
            options,
            modules,
            types,
            name_index,
            instantiations: DashMap::new(),
            arrays: DashMap::new(),
            pointers: DashMap::new(),
            fnptrs: DashMap::new(),
            gparams: DashMap::new(),
            next_token: AtomicU32::new(ARTIFICIAL_TOKEN_BASE),
            next_iid: AtomicU32::new(1),
            next_module: AtomicU32::new(1),
            loader_lock: Mutex::new(()),
            core,
        }
    }

    /// Configured options.
    #[must_use]
    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    /// Register a module, returning its id.
    pub fn add_module(&self, module: ModuleMetadata) -> ModuleId {
        let id = ModuleId(self.next_module.fetch_add(1, Ordering::Relaxed));
        debug!(module = %module.name, id = id.0, "registering module");
        self.modules.insert(id, Arc::new(module));
        id
    }

    /// Row tables of a registered module.
    ///
    /// # Errors
    /// Returns [`Error::TypeNotFound`] for an unknown module id.
    pub fn module(&self, id: ModuleId) -> Result<Arc<ModuleMetadata>> {
        self.modules
            .get(&id)
            .map(|m| m.value().clone())
            .ok_or(Error::TypeNotFound(Token::new(0)))
    }

    pub(crate) fn core(&self) -> &CoreTypes {
        &self.core
    }

    pub(crate) fn alloc_token(&self) -> Token {
        Token::new(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn alloc_interface_id(&self) -> u32 {
        self.next_iid.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn lock_loader(&self) -> Result<MutexGuard<'_, ()>> {
        self.loader_lock.lock().map_err(|_| Error::LockError)
    }

    /// Insert a constructed descriptor into the primary index, yielding
    /// the canonical one if a racing thread inserted first.
    pub(crate) fn intern_constructed(&self, ty: TypeRc) -> TypeRc {
        self.types.get_or_insert(ty.key(), ty).value().clone()
    }

    /// Descriptor of a built-in primitive.
    #[must_use]
    pub fn primitive(&self, kind: PrimitiveKind) -> TypeRc {
        self.core.primitive(kind).clone()
    }

    /// Look up an interned type by `Namespace.Name`.
    #[must_use]
    pub fn by_name(&self, fullname: &str) -> Option<TypeRc> {
        self.name_index.get(fullname).and_then(|h| h.upgrade())
    }

    /// Resolve `(module, token)` to its unique descriptor, interning on
    /// first sight. `TypeRef` tokens are followed through the module's
    /// reference table.
    ///
    /// # Errors
    /// Returns [`Error::TypeNotFound`] for unknown modules/rows,
    /// [`Error::MalformedSignature`] for a dangling `TypeRef`, and
    /// [`Error::RecursionLimit`] for a cyclic reference chain.
    pub fn get(&self, module: ModuleId, token: Token) -> Result<TypeRc> {
        match token.table() {
            TABLE_TYPEREF => {
                // Ref targets can themselves be refs; bound the chain so a
                // cyclic reference graph errors instead of recursing
                let mut module = module;
                let mut token = token;
                for _ in 0..MAX_TYPEREF_CHAIN {
                    let target = {
                        let meta = self
                            .modules
                            .get(&module)
                            .ok_or(Error::TypeNotFound(token))?;
                        meta.type_ref(token)
                            .ok_or_else(|| malformed_error!("Dangling TypeRef token {token}"))?
                    };
                    module = target.module;
                    token = target.token;
                    if token.table() != TABLE_TYPEREF {
                        return self.get(module, token);
                    }
                }
                Err(Error::RecursionLimit(MAX_TYPEREF_CHAIN))
            }
            TABLE_TYPEDEF => {
                let key = TypeKey {
                    module,
                    token: token.value(),
                };
                if let Some(entry) = self.types.get(&key) {
                    return Ok(entry.value().clone());
                }
                let created = self.create_definition(module, token)?;
                // get_or_insert settles creation races; both sides built
                // identical bare descriptors
                let entry = self.types.get_or_insert(key, created);
                let ty = entry.value().clone();
                self.name_index
                    .insert(ty.fullname(), TypeHandle::new(&ty));
                trace!(ty = %ty, "interned definition");
                Ok(ty)
            }
            _ => Err(Error::TypeNotFound(token)),
        }
    }

    fn create_definition(&self, module: ModuleId, token: Token) -> Result<TypeRc> {
        let meta = self
            .modules
            .get(&module)
            .ok_or(Error::TypeNotFound(token))?;
        let row = meta.type_def(token).ok_or(Error::TypeNotFound(token))?;
        let kind = if row.generic_param_count > 0 {
            TypeKind::GenericDefinition
        } else {
            TypeKind::Definition
        };
        Ok(Arc::new(
            TypeDescriptor::new(token, module, &row.namespace, &row.name, kind, row.flags)
                .with_generic_param_count(row.generic_param_count)
                .with_variance(&row.variance),
        ))
    }

    /// Interned single-dimensional array of `element`.
    #[must_use]
    pub fn szarray_of(&self, element: &TypeRc) -> TypeRc {
        if let Some(existing) = self.arrays.get(&element.key()) {
            return existing.clone();
        }
        let ty: TypeRc = Arc::new(
            TypeDescriptor::new(
                self.alloc_token(),
                element.module,
                &element.namespace,
                &format!("{}[]", element.name),
                TypeKind::SzArray,
                TypeAttributes::PUBLIC | TypeAttributes::SEALED,
            )
            .with_traits(TypeTraits::default()),
        );
        ty.set_parent(TypeHandle::new(&self.core.array));
        ty.set_element(TypeHandle::new(element));
        let ty = self
            .arrays
            .entry(element.key())
            .or_insert(ty)
            .value()
            .clone();
        self.types.get_or_insert(ty.key(), ty.clone());
        ty
    }

    /// Interned unmanaged pointer to `pointee`.
    #[must_use]
    pub fn pointer_to(&self, pointee: &TypeRc) -> TypeRc {
        if let Some(existing) = self.pointers.get(&pointee.key()) {
            return existing.clone();
        }
        let ty: TypeRc = Arc::new(
            TypeDescriptor::new(
                self.alloc_token(),
                pointee.module,
                &pointee.namespace,
                &format!("{}*", pointee.name),
                TypeKind::Pointer,
                TypeAttributes::PUBLIC | TypeAttributes::SEALED,
            )
            .with_traits(TypeTraits {
                value_type: true,
                enum_type: false,
            }),
        );
        ty.set_element(TypeHandle::new(pointee));
        let ty = self
            .pointers
            .entry(pointee.key())
            .or_insert(ty)
            .value()
            .clone();
        self.types.get_or_insert(ty.key(), ty.clone());
        ty
    }

    /// Interned function-pointer type over the given parameter and return
    /// types.
    #[must_use]
    pub fn fnptr_of(&self, params: &[TypeRc], returns: &TypeRc) -> TypeRc {
        let mut key: Vec<TypeKey> = params.iter().map(|p| p.key()).collect();
        key.push(returns.key());
        let key = key.into_boxed_slice();
        if let Some(existing) = self.fnptrs.get(&key) {
            return existing.clone();
        }
        let ty: TypeRc = Arc::new(
            TypeDescriptor::new(
                self.alloc_token(),
                CORE_MODULE,
                "",
                "fnptr",
                TypeKind::FnPtr,
                TypeAttributes::PUBLIC | TypeAttributes::SEALED,
            )
            .with_traits(TypeTraits {
                value_type: true,
                enum_type: false,
            }),
        );
        let ty = self.fnptrs.entry(key).or_insert(ty).value().clone();
        self.types.get_or_insert(ty.key(), ty.clone());
        ty
    }

    /// Interned placeholder for the generic type parameter at `index`.
    ///
    /// All parameters at the same index share one descriptor: placeholders
    /// only exist so open definitions can be laid out, and every parameter
    /// is laid out identically (as a reference slot).
    #[must_use]
    pub fn generic_param(&self, index: u32) -> TypeRc {
        if let Some(existing) = self.gparams.get(&index) {
            return existing.clone();
        }
        let ty: TypeRc = Arc::new(
            TypeDescriptor::new(
                self.alloc_token(),
                CORE_MODULE,
                "",
                &format!("!{index}"),
                TypeKind::GenericParam { index },
                TypeAttributes::PUBLIC,
            )
            .with_traits(TypeTraits::default()),
        );
        let ty = self.gparams.entry(index).or_insert(ty).value().clone();
        self.types.get_or_insert(ty.key(), ty.clone());
        ty
    }

    /// Run initialization (parent, interfaces, members) for `ty`.
    ///
    /// Idempotent; concurrent callers race benignly on identical results.
    ///
    /// # Errors
    /// A failure poisons `ty` permanently and is returned; dependency
    /// failures are chained.
    pub fn ensure_initialized(&self, ty: &TypeRc) -> Result<()> {
        let mut scope = LoadScope::default();
        self.initialize(ty, &mut scope)
    }

    pub(crate) fn initialize(&self, ty: &TypeRc, scope: &mut LoadScope) -> Result<()> {
        ty.ensure_ok()?;
        if ty.is_initialized() {
            return Ok(());
        }
        match ty.kind {
            TypeKind::SzArray => {
                if let Some(element) = ty.element() {
                    self.initialize(&element, scope)
                        .map_err(|e| ty.poison(Error::dependency(&ty.to_string(), &e)))?;
                }
                if let Some(parent) = ty.parent() {
                    self.initialize(&parent, scope)
                        .map_err(|e| ty.poison(Error::dependency(&ty.to_string(), &e)))?;
                }
                ty.mark_initialized();
                Ok(())
            }
            TypeKind::Pointer | TypeKind::FnPtr | TypeKind::GenericParam { .. } => {
                ty.mark_initialized();
                Ok(())
            }
            TypeKind::Definition | TypeKind::GenericDefinition | TypeKind::GenericInstance => {
                let key = ty.key();
                if scope.init_stack.contains(&key) {
                    return Err(ty.poison(Error::RecursiveDefinition(ty.to_string())));
                }
                if scope.init_stack.len() >= MAX_INIT_DEPTH {
                    return Err(Error::RecursionLimit(MAX_INIT_DEPTH));
                }
                scope.init_stack.push(key);
                let result = self.initialize_definition(ty, scope);
                scope.init_stack.pop();
                match result {
                    Ok(()) => {
                        ty.mark_initialized();
                        Ok(())
                    }
                    Err(err) => Err(ty.poison(err)),
                }
            }
        }
    }

    fn initialize_definition(&self, ty: &TypeRc, scope: &mut LoadScope) -> Result<()> {
        trace!(ty = %ty, "initializing");
        let (def_module, row) = self.definition_row(ty)?;

        // Parent link; generic instances may already carry one from the
        // instantiation path
        if !ty.parent_set() {
            self.setup_parent(ty, def_module, &row, scope)?;
        }
        if let Some(parent) = ty.parent() {
            self.initialize(&parent, scope)
                .map_err(|e| Error::dependency(&ty.to_string(), &e))?;
            if parent.is_value_type() && !ty.is_value_type() {
                return Err(malformed_error!(
                    "{} extends the value type {}",
                    ty,
                    parent
                ));
            }
        } else if !ty.is_interface() && ty.fullname() != "System.Object" {
            return Err(malformed_error!("{} has no parent type", ty));
        }
        if ty.is_interface() {
            ty.set_traits(TypeTraits::default());
        }

        // Direct interfaces
        let ctx: Option<&[TypeRc]> = ty.generic.as_ref().map(|g| &g.args[..]);
        let mut ifaces = Vec::with_capacity(row.interfaces.len());
        for shape in &row.interfaces {
            let itf = self
                .resolve_shape(def_module, shape, ctx, scope)
                .and_then(|itf| {
                    self.initialize(&itf, scope)?;
                    Ok(itf)
                })
                .map_err(|e| Error::dependency(&ty.to_string(), &e))?;
            if !itf.is_interface() {
                return Err(malformed_error!(
                    "{} implements {} which is not an interface",
                    ty,
                    itf
                ));
            }
            ifaces.push(TypeHandle::new(&itf));
        }
        ty.set_interfaces(ifaces.into_boxed_slice());

        self.ensure_fields(ty, scope)?;
        self.ensure_methods(ty, scope)?;
        Ok(())
    }

    /// The defining module id and `TypeDef` row backing `ty`; generic
    /// instances are backed by their definition's row.
    pub(crate) fn definition_row(&self, ty: &TypeRc) -> Result<(ModuleId, TypeDefRow)> {
        let source = match &ty.generic {
            Some(generic) => generic.definition.get()?,
            None => ty.clone(),
        };
        let meta = self
            .modules
            .get(&source.module)
            .ok_or(Error::TypeNotFound(source.token))?;
        let row = meta
            .type_def(source.token)
            .ok_or(Error::TypeNotFound(source.token))?
            .clone();
        Ok((source.module, row))
    }

    /// Batch-build layout and dispatch tables for every type of a module.
    ///
    /// Individual type failures poison the types and are logged rather
    /// than aborting the batch.
    pub fn initialize_all(&self, module: ModuleId) -> Result<()> {
        let meta = self.module(module)?;
        let tokens: Vec<Token> = meta.type_tokens().collect();
        tokens.par_iter().for_each(|token| {
            let result = self
                .get(module, *token)
                .and_then(|ty| self.ensure_vtable(&ty).map(|_| ty))
                .and_then(|ty| self.ensure_layout(&ty));
            if let Err(err) = result {
                debug!(module = module.0, token = %token, %err, "type failed during warm-up");
            }
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Public query surface. Each accessor triggers the phases it needs
    // and reports the poisoned failure of a broken type.
    // ------------------------------------------------------------------

    /// Full boxed instance size of `ty` in bytes, header included.
    ///
    /// # Errors
    /// Propagates the type's (possibly pre-existing) layout failure.
    pub fn instance_size(&self, ty: &TypeRc) -> Result<u32> {
        self.ensure_layout(ty)?;
        ty.sizes()
            .map(|s| s.instance_size)
            .ok_or(Error::LockError)
    }

    /// Size of the static storage block of `ty` in bytes.
    ///
    /// # Errors
    /// Propagates the type's layout failure.
    pub fn class_size(&self, ty: &TypeRc) -> Result<u32> {
        self.ensure_layout(ty)?;
        ty.sizes().map(|s| s.class_size).ok_or(Error::LockError)
    }

    /// Byte offset of `field` within its owner's instance (or static
    /// block), object header included for instance fields.
    ///
    /// # Errors
    /// Propagates the owner's layout failure; literal fields have no
    /// offset and report [`Error::LayoutViolation`].
    pub fn field_offset(&self, field: &FieldRc) -> Result<u32> {
        let owner = field.owner.get()?;
        self.ensure_layout(&owner)?;
        field.offset().ok_or_else(|| {
            Error::LayoutViolation(format!(
                "field {}.{} has no storage offset",
                owner, field.name
            ))
        })
    }

    /// Vtable slot of `method`.
    ///
    /// # Errors
    /// Propagates the owner's vtable failure; non-virtual methods have no
    /// slot and report [`Error::VTableInconsistency`].
    pub fn vtable_slot(&self, method: &MethodRc) -> Result<u32> {
        let owner = method.owner.get()?;
        self.ensure_vtable(&owner)?;
        method.slot().ok_or_else(|| {
            Error::VTableInconsistency(format!(
                "method {}.{} occupies no vtable slot",
                owner, method.name
            ))
        })
    }

    /// Base vtable slot of `iface`'s method range within `ty`.
    ///
    /// # Errors
    /// Propagates vtable failures; reports [`Error::VTableInconsistency`]
    /// when `ty` does not implement `iface`.
    pub fn interface_offset(&self, ty: &TypeRc, iface: &TypeRc) -> Result<u32> {
        self.ensure_vtable(ty)?;
        let iid = iface.interface_id().ok_or_else(|| {
            Error::VTableInconsistency(format!("{ty} does not implement {iface}"))
        })?;
        ty.interface_table()
            .and_then(|t| t.offset_of(iid))
            .ok_or_else(|| {
                Error::VTableInconsistency(format!("{ty} does not implement {iface}"))
            })
    }

    /// True if `ty` implements `iface` (directly or transitively), via the
    /// compressed interface bitmap.
    ///
    /// # Errors
    /// Propagates vtable failures of `ty`.
    pub fn implements_interface(&self, ty: &TypeRc, iface: &TypeRc) -> Result<bool> {
        self.ensure_vtable(ty)?;
        let Some(iid) = iface.interface_id() else {
            // Never participated in any offset table, so nothing
            // implements it
            return Ok(false);
        };
        Ok(ty
            .interface_table()
            .is_some_and(|table| table.implements(iid)))
    }

    /// True if a value of type `source` can be assigned to a location of
    /// type `target`.
    ///
    /// Covers identity, class subtyping (constant-time via the supertype
    /// chain), interface implementation (via the bitmap, with declared
    /// co-/contravariance honored for generic interfaces), single-dim
    /// array covariance over reference elements, and `Nullable<T>` against
    /// a bare `T`.
    ///
    /// # Errors
    /// Propagates phase failures of either type.
    pub fn is_assignable_from(&self, target: &TypeRc, source: &TypeRc) -> Result<bool> {
        if Arc::ptr_eq(target, source) {
            return Ok(true);
        }
        if target.is_interface() {
            if self.implements_interface(source, target)? {
                return Ok(true);
            }
            return self.variant_interface_match(target, source);
        }
        if let Some(generic) = &target.generic {
            if Arc::ptr_eq(&generic.definition.get()?, &self.core.nullable) {
                return Ok(Arc::ptr_eq(&generic.args[0], source));
            }
        }
        if target.is_szarray() && source.is_szarray() {
            let (Some(te), Some(se)) = (target.element(), source.element()) else {
                return Ok(false);
            };
            self.ensure_initialized(&te)?;
            self.ensure_initialized(&se)?;
            if te.is_reference_like() && se.is_reference_like() {
                return self.is_assignable_from(&te, &se);
            }
            return Ok(Arc::ptr_eq(&te, &se));
        }
        // Class subtyping
        self.ensure_supertypes(target)?;
        self.ensure_supertypes(source)?;
        let depth = target.idepth();
        if depth == 0 || source.idepth() < depth {
            return Ok(false);
        }
        let Some(chain) = source.supertypes() else {
            return Ok(false);
        };
        Ok(chain
            .get((depth - 1) as usize)
            .and_then(TypeHandle::upgrade)
            .is_some_and(|ancestor| Arc::ptr_eq(&ancestor, target)))
    }

    /// Variant interface compatibility: `target` is an instantiation of a
    /// variant interface definition, and `source` implements some other
    /// instantiation of the same definition whose arguments are compatible
    /// under the declared variance.
    fn variant_interface_match(&self, target: &TypeRc, source: &TypeRc) -> Result<bool> {
        let Some(target_generic) = &target.generic else {
            return Ok(false);
        };
        let definition = target_generic.definition.get()?;
        if !definition.has_variant_params() {
            return Ok(false);
        }
        // The table carries the source's own entry when it is an interface
        self.ensure_vtable(source)?;
        let Some(table) = source.interface_table() else {
            return Ok(false);
        };
        for entry in table.entries.iter() {
            let iface = entry.interface.get()?;
            let Some(iface_generic) = &iface.generic else {
                continue;
            };
            if !Arc::ptr_eq(&iface_generic.definition.get()?, &definition) {
                continue;
            }
            if self.variant_args_compatible(
                &definition,
                &target_generic.args,
                &iface_generic.args,
            )? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Per-argument variance check between two instantiations of the same
    /// definition. Variant positions admit reference conversions only, as
    /// value arguments change the layout of the instantiation.
    fn variant_args_compatible(
        &self,
        definition: &TypeRc,
        target_args: &[TypeRc],
        source_args: &[TypeRc],
    ) -> Result<bool> {
        for (index, (ta, sa)) in target_args.iter().zip(source_args.iter()).enumerate() {
            if Arc::ptr_eq(ta, sa) {
                continue;
            }
            let variance = definition
                .variance
                .get(index)
                .copied()
                .unwrap_or(GenericVariance::Invariant);
            let (wide, narrow) = match variance {
                GenericVariance::Invariant => return Ok(false),
                GenericVariance::Covariant => (ta, sa),
                GenericVariance::Contravariant => (sa, ta),
            };
            self.ensure_initialized(wide)?;
            self.ensure_initialized(narrow)?;
            if !wide.is_reference_like()
                || !narrow.is_reference_like()
                || !self.is_assignable_from(wide, narrow)?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Module id of the intrinsic core library
pub const CORE_MODULE: ModuleId = ModuleId(0);

/// Build the intrinsic core module rows.
///
/// Returns the module plus, per row, the primitive kind backing it (if
/// any). Row order is relied upon by `TypeRegistry::with_options`.
fn build_core_module() -> (ModuleMetadata, Vec<Option<PrimitiveKind>>) {
    use crate::metadata::modules::{FieldRow, MethodAttributes, MethodRow};

    let mut corlib = ModuleMetadata::new("corlib");
    let mut kinds: Vec<Option<PrimitiveKind>> = Vec::new();

    let object_token = Token::typedef(1);
    let value_type_token = Token::typedef(2);

    let object = TypeDefRow::new("System", "Object", TypeAttributes::PUBLIC)
        .method(MethodRow::virtual_new(
            "ToString",
            vec![],
            TypeShape::Primitive(PrimitiveKind::String),
        ))
        .method(MethodRow::virtual_new(
            "Equals",
            vec![TypeShape::Primitive(PrimitiveKind::Object)],
            TypeShape::Primitive(PrimitiveKind::Boolean),
        ))
        .method(MethodRow::virtual_new(
            "GetHashCode",
            vec![],
            TypeShape::Primitive(PrimitiveKind::I4),
        ))
        .method(
            MethodRow::virtual_new("Finalize", vec![], TypeShape::Primitive(PrimitiveKind::Void))
                .with_flags(
                    MethodAttributes::FAMILY
                        | MethodAttributes::VIRTUAL
                        | MethodAttributes::HIDE_BY_SIG
                        | MethodAttributes::NEW_SLOT,
                ),
        );
    corlib.add_type(object);
    kinds.push(None);

    corlib.add_type(
        TypeDefRow::new(
            "System",
            "ValueType",
            TypeAttributes::PUBLIC | TypeAttributes::ABSTRACT,
        )
        .extends(TypeShape::Class(object_token)),
    );
    kinds.push(None);

    corlib.add_type(
        TypeDefRow::new(
            "System",
            "Enum",
            TypeAttributes::PUBLIC | TypeAttributes::ABSTRACT,
        )
        .extends(TypeShape::Class(value_type_token)),
    );
    kinds.push(None);

    corlib.add_type(
        TypeDefRow::new(
            "System",
            "String",
            TypeAttributes::PUBLIC | TypeAttributes::SEALED,
        )
        .extends(TypeShape::Class(object_token)),
    );
    kinds.push(None);

    corlib.add_type(
        TypeDefRow::new(
            "System",
            "Array",
            TypeAttributes::PUBLIC | TypeAttributes::ABSTRACT,
        )
        .extends(TypeShape::Class(object_token)),
    );
    kinds.push(None);

    for kind in [
        PrimitiveKind::Void,
        PrimitiveKind::Boolean,
        PrimitiveKind::Char,
        PrimitiveKind::I1,
        PrimitiveKind::U1,
        PrimitiveKind::I2,
        PrimitiveKind::U2,
        PrimitiveKind::I4,
        PrimitiveKind::U4,
        PrimitiveKind::I8,
        PrimitiveKind::U8,
        PrimitiveKind::R4,
        PrimitiveKind::R8,
        PrimitiveKind::I,
        PrimitiveKind::U,
    ] {
        corlib.add_type(
            TypeDefRow::new(
                "System",
                kind.name(),
                TypeAttributes::PUBLIC
                    | TypeAttributes::SEALED
                    | TypeAttributes::SEQUENTIAL_LAYOUT,
            )
            .extends(TypeShape::Class(value_type_token)),
        );
        kinds.push(Some(kind));
    }

    // Last row: Nullable`1, the one generic definition the core carries
    corlib.add_type(
        TypeDefRow::new(
            "System",
            "Nullable`1",
            TypeAttributes::PUBLIC | TypeAttributes::SEALED | TypeAttributes::SEQUENTIAL_LAYOUT,
        )
        .extends(TypeShape::Class(value_type_token))
        .generic(1)
        .field(FieldRow::instance(
            "hasValue",
            &TypeShape::Primitive(PrimitiveKind::Boolean),
        ))
        .field(FieldRow::instance("value", &TypeShape::Var(0))),
    );
    kinds.push(None);

    (corlib, kinds)
}
