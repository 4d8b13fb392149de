//! Interned type descriptors and the computed state attached to them.
//!
//! # Architecture
//!
//! Every type known to a [`TypeRegistry`] is represented by exactly one
//! [`TypeDescriptor`], shared as an `Arc` ([`TypeRc`]) and interned by the
//! registry: resolving the same `(module, token)` pair, or instantiating the
//! same generic definition with the same arguments, always yields the same
//! allocation. Pointer identity therefore *is* type identity, and every
//! cross-descriptor link ([`TypeHandle`]) is a weak reference so that
//! dropping the registry reclaims the whole graph.
//!
//! A descriptor starts as bare identity (token, name, kind, flags) and
//! accumulates computed state through independent phases, each published
//! exactly once through an `OnceLock`:
//!
//! 1. **Initialization** - parent link, direct interfaces, field and method
//!    descriptors ([`TypeRegistry::ensure_initialized`])
//! 2. **Field layout** - offsets, instance/static sizes, alignment
//!    ([`layout`])
//! 3. **Supertype chain** - ancestor array plus depth ([`supertypes`])
//! 4. **Interface offsets** - packed offset table plus compressed bitmap
//!    ([`interfaces`])
//! 5. **Virtual dispatch table** - slot assignment and validation
//!    ([`vtable`])
//!
//! Readers never block: a phase result is either published (visible through
//! an acquire load) or absent, in which case the caller runs the phase under
//! the registry's loader lock. Losing a publication race is harmless since
//! both sides computed identical results from identical inputs.
//!
//! # Failure model
//!
//! The first error raised against a type poisons it permanently via
//! [`TypeDescriptor::poison`]; every later operation observes the original
//! failure. A type whose parent, interface, or field type is poisoned
//! becomes poisoned itself with a chained [`Error::UnresolvedDependency`].
//!
//! [`TypeRegistry`]: registry::TypeRegistry
//! [`TypeRegistry::ensure_initialized`]: registry::TypeRegistry::ensure_initialized

use std::{
    fmt,
    sync::{
        atomic::{AtomicI32, AtomicU32, Ordering},
        Arc, OnceLock, Weak,
    },
};

use crate::{
    metadata::{
        modules::{FieldAttributes, GenericVariance, MethodAttributes, ModuleId, TypeAttributes},
        signatures::PrimitiveKind,
        token::Token,
    },
    Error, Result,
};

pub mod fields;
pub mod generics;
pub mod interfaces;
pub mod layout;
pub mod registry;
pub mod resolver;
pub mod supertypes;
pub mod vtable;

pub use registry::{RegistryOptions, TypeRegistry};

/// Reference-counted pointer to a [`TypeDescriptor`]
pub type TypeRc = Arc<TypeDescriptor>;
/// Reference-counted pointer to a [`FieldDescriptor`]
pub type FieldRc = Arc<FieldDescriptor>;
/// Reference-counted pointer to a [`MethodDescriptor`]
pub type MethodRc = Arc<MethodDescriptor>;

/// Registry-wide unique key of a descriptor: defining module plus token
/// (real metadata token, or an artificial one for constructed types).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeKey {
    /// Defining module
    pub module: ModuleId,
    /// Raw token value
    pub token: u32,
}

/// Weak reference to a [`TypeDescriptor`].
///
/// All descriptor-to-descriptor links use this wrapper; the registry's
/// interning tables hold the only strong references, so the entire type
/// graph is reclaimed when the registry is dropped even though descriptors
/// link to each other freely (including cyclically).
#[derive(Clone)]
pub struct TypeHandle(Weak<TypeDescriptor>);

impl TypeHandle {
    /// Create a handle pointing at `ty`.
    #[must_use]
    pub fn new(ty: &TypeRc) -> Self {
        TypeHandle(Arc::downgrade(ty))
    }

    /// Upgrade to a strong reference, if the registry is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<TypeRc> {
        self.0.upgrade()
    }

    /// Upgrade, reporting a dropped registry as an error.
    ///
    /// # Errors
    /// Returns [`Error::UnresolvedDependency`] when the target descriptor
    /// has been reclaimed.
    pub fn get(&self) -> Result<TypeRc> {
        self.0.upgrade().ok_or_else(|| {
            Error::UnresolvedDependency(
                "type descriptor was reclaimed while still referenced".to_string(),
            )
        })
    }

    /// True if both handles point at the same descriptor.
    #[must_use]
    pub fn ptr_eq(&self, other: &TypeHandle) -> bool {
        self.0.ptr_eq(&other.0)
    }
}

impl fmt::Debug for TypeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.upgrade() {
            Some(ty) => write!(f, "TypeHandle({})", ty.fullname()),
            None => write!(f, "TypeHandle(<dropped>)"),
        }
    }
}

/// Structural category of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    /// Non-generic `TypeDef` row
    Definition,
    /// `TypeDef` row with generic parameters (open type)
    GenericDefinition,
    /// Instantiation of a generic definition with concrete arguments
    GenericInstance,
    /// Single-dimensional, zero-based array
    SzArray,
    /// Unmanaged pointer
    Pointer,
    /// Function pointer
    FnPtr,
    /// Unsubstituted generic type parameter (reference-sized placeholder)
    GenericParam {
        /// 0-based parameter index
        index: u32,
    },
}

/// Facts about a type derived from its parent chain during initialization.
#[derive(Debug, Clone, Copy, Default)]
pub struct TypeTraits {
    /// Instances are inline values rather than heap references
    pub value_type: bool,
    /// Type derives directly from `System.Enum`
    pub enum_type: bool,
}

/// Computed size and layout facts, published once per type.
#[derive(Debug, Clone, Copy)]
pub struct SizeInfo {
    /// Full boxed instance size in bytes, object header included
    pub instance_size: u32,
    /// Size of the static storage block in bytes
    pub class_size: u32,
    /// Required alignment of the instance data
    pub min_align: u32,
    /// Effective packing size (0 when defaulted)
    pub packing_size: u16,
    /// Instance fields contain at least one GC reference
    pub has_references: bool,
    /// Static fields contain at least one GC reference
    pub has_static_refs: bool,
    /// Memory representation is identical to the unmanaged one
    pub blittable: bool,
}

impl SizeInfo {
    /// Unboxed payload size for a value type laid out with `header` bytes
    /// of object header.
    #[must_use]
    pub fn payload_size(&self, header: u32) -> u32 {
        self.instance_size.saturating_sub(header)
    }
}

/// One row of the packed interface-offset table.
#[derive(Debug, Clone)]
pub struct InterfaceEntry {
    /// Interface id of the implemented interface
    pub iid: u32,
    /// The implemented interface
    pub interface: TypeHandle,
    /// Base vtable slot of this interface's method range
    pub offset: u32,
}

/// Packed, iid-sorted interface-offset table plus the run-length compressed
/// implementation bitmap.
#[derive(Debug)]
pub struct InterfaceTable {
    /// Entries sorted by ascending iid
    pub entries: Box<[InterfaceEntry]>,
    /// Compressed bitmap of implemented iids (see [`interfaces`])
    pub bitmap: Box<[u8]>,
    /// Highest iid carried by the bitmap
    pub max_iid: u32,
}

impl InterfaceTable {
    /// Vtable offset of the interface with id `iid`, if implemented.
    #[must_use]
    pub fn offset_of(&self, iid: u32) -> Option<u32> {
        self.entries
            .binary_search_by_key(&iid, |e| e.iid)
            .ok()
            .map(|i| self.entries[i].offset)
    }

    /// True if the bitmap has the bit for `iid` set.
    #[must_use]
    pub fn implements(&self, iid: u32) -> bool {
        iid <= self.max_iid && interfaces::interface_match(&self.bitmap, iid)
    }
}

/// A built virtual dispatch table.
///
/// Slots can be `None` only on abstract types (interface ranges whose
/// methods have no implementation yet); concrete types are validated to
/// have every slot filled with a non-abstract method.
#[derive(Debug)]
pub struct VTable {
    /// Slot array; index is the vtable slot number
    pub slots: Box<[Option<MethodRc>]>,
}

impl VTable {
    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True for an empty table.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Method occupying slot `slot`, if any.
    #[must_use]
    pub fn slot(&self, slot: u32) -> Option<&MethodRc> {
        self.slots.get(slot as usize).and_then(Option::as_ref)
    }
}

/// Generic-instantiation facts of a [`TypeKind::GenericInstance`] descriptor.
#[derive(Debug)]
pub struct GenericInstanceInfo {
    /// The open definition this instance was built from
    pub definition: TypeHandle,
    /// Resolved argument descriptors, in declaration order
    pub args: Box<[TypeRc]>,
}

/// One interned type, with identity fixed at creation and computed state
/// published through the phase locks.
pub struct TypeDescriptor {
    /// Token within the defining module (artificial for constructed types)
    pub token: Token,
    /// Defining module
    pub module: ModuleId,
    /// Namespace (may be empty)
    pub namespace: String,
    /// Simple name
    pub name: String,
    /// Structural category
    pub kind: TypeKind,
    /// Attribute bits (copied from the definition for generic instances)
    pub flags: TypeAttributes,
    /// Built-in primitive kind, for the core primitives only
    pub primitive: Option<PrimitiveKind>,
    /// Number of generic parameters (definitions only)
    pub generic_param_count: u16,
    /// Declared parameter variance (definitions only; empty means all
    /// parameters are invariant)
    pub variance: Box<[GenericVariance]>,
    /// Instantiation facts (generic instances only)
    pub generic: Option<GenericInstanceInfo>,

    parent: OnceLock<TypeHandle>,
    element: OnceLock<TypeHandle>,
    interfaces: OnceLock<Box<[TypeHandle]>>,
    traits: OnceLock<TypeTraits>,
    init_done: OnceLock<()>,
    fields: OnceLock<Arc<[FieldRc]>>,
    methods: OnceLock<Arc<[MethodRc]>>,
    sizes: OnceLock<SizeInfo>,
    supertypes: OnceLock<Box<[TypeHandle]>>,
    idepth: AtomicU32,
    iface_table: OnceLock<InterfaceTable>,
    interface_id: OnceLock<u32>,
    vtable: OnceLock<Arc<VTable>>,
    failure: OnceLock<Error>,
}

impl TypeDescriptor {
    /// Bare descriptor with identity only; computed state is attached by
    /// the registry's phases.
    #[must_use]
    pub(crate) fn new(
        token: Token,
        module: ModuleId,
        namespace: &str,
        name: &str,
        kind: TypeKind,
        flags: TypeAttributes,
    ) -> Self {
        TypeDescriptor {
            token,
            module,
            namespace: namespace.to_string(),
            name: name.to_string(),
            kind,
            flags,
            primitive: None,
            generic_param_count: 0,
            variance: Box::new([]),
            generic: None,
            parent: OnceLock::new(),
            element: OnceLock::new(),
            interfaces: OnceLock::new(),
            traits: OnceLock::new(),
            init_done: OnceLock::new(),
            fields: OnceLock::new(),
            methods: OnceLock::new(),
            sizes: OnceLock::new(),
            supertypes: OnceLock::new(),
            idepth: AtomicU32::new(0),
            iface_table: OnceLock::new(),
            interface_id: OnceLock::new(),
            vtable: OnceLock::new(),
            failure: OnceLock::new(),
        }
    }

    pub(crate) fn with_primitive(mut self, kind: PrimitiveKind) -> Self {
        self.primitive = Some(kind);
        self
    }

    pub(crate) fn with_generic_param_count(mut self, count: u16) -> Self {
        self.generic_param_count = count;
        self
    }

    pub(crate) fn with_variance(mut self, variance: &[GenericVariance]) -> Self {
        self.variance = variance.into();
        self
    }

    /// True if any generic parameter is declared co- or contravariant.
    #[must_use]
    pub fn has_variant_params(&self) -> bool {
        self.variance
            .iter()
            .any(|v| *v != GenericVariance::Invariant)
    }

    pub(crate) fn with_generic(mut self, info: GenericInstanceInfo) -> Self {
        self.generic = Some(info);
        self
    }

    pub(crate) fn with_traits(self, traits: TypeTraits) -> Self {
        let _ = self.traits.set(traits);
        self
    }

    /// Registry-wide unique key.
    #[must_use]
    pub fn key(&self) -> TypeKey {
        TypeKey {
            module: self.module,
            token: self.token.value(),
        }
    }

    /// `Namespace.Name`, or just `Name` for the empty namespace.
    #[must_use]
    pub fn fullname(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }

    /// True for interface types.
    #[must_use]
    pub fn is_interface(&self) -> bool {
        self.flags.contains(TypeAttributes::INTERFACE)
    }

    /// True for abstract types (interfaces included).
    #[must_use]
    pub fn is_abstract(&self) -> bool {
        self.flags.contains(TypeAttributes::ABSTRACT)
    }

    /// True once initialization has determined this is a value type.
    ///
    /// Primitives and constructed value shapes know this at creation;
    /// definitions learn it from their parent during initialization.
    #[must_use]
    pub fn is_value_type(&self) -> bool {
        self.traits.get().is_some_and(|t| t.value_type)
    }

    /// True for enum types (direct subtypes of `System.Enum`).
    #[must_use]
    pub fn is_enum(&self) -> bool {
        self.traits.get().is_some_and(|t| t.enum_type)
    }

    /// True for single-dimensional array descriptors.
    #[must_use]
    pub fn is_szarray(&self) -> bool {
        self.kind == TypeKind::SzArray
    }

    /// True for open generic definitions.
    #[must_use]
    pub fn is_generic_definition(&self) -> bool {
        self.kind == TypeKind::GenericDefinition
    }

    /// True for generic instantiations.
    #[must_use]
    pub fn is_generic_instance(&self) -> bool {
        self.kind == TypeKind::GenericInstance
    }

    /// Instances of this type are stored as GC references rather than
    /// inline values.
    #[must_use]
    pub fn is_reference_like(&self) -> bool {
        match self.kind {
            TypeKind::Pointer | TypeKind::FnPtr => false,
            // Unsubstituted parameters are laid out as reference slots
            TypeKind::GenericParam { .. } | TypeKind::SzArray => true,
            _ => !self.is_value_type(),
        }
    }

    pub(crate) fn set_traits(&self, traits: TypeTraits) {
        let _ = self.traits.set(traits);
    }

    pub(crate) fn mark_initialized(&self) {
        let _ = self.init_done.set(());
    }

    /// Initialization phase has completed for this descriptor.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.init_done.get().is_some()
    }

    /// Parent type, once initialization has linked it.
    ///
    /// `None` for the root object type, for interfaces, and before
    /// initialization.
    #[must_use]
    pub fn parent(&self) -> Option<TypeRc> {
        self.parent.get().and_then(TypeHandle::upgrade)
    }

    pub(crate) fn parent_set(&self) -> bool {
        self.parent.get().is_some()
    }

    pub(crate) fn set_parent(&self, parent: TypeHandle) {
        let _ = self.parent.set(parent);
    }

    /// Element type: array element, pointee, or enum underlying primitive.
    #[must_use]
    pub fn element(&self) -> Option<TypeRc> {
        self.element.get().and_then(TypeHandle::upgrade)
    }

    pub(crate) fn set_element(&self, element: TypeHandle) {
        let _ = self.element.set(element);
    }

    /// Directly implemented interfaces, once initialization has resolved
    /// them.
    #[must_use]
    pub fn interfaces(&self) -> &[TypeHandle] {
        self.interfaces.get().map_or(&[], |v| &v[..])
    }

    pub(crate) fn set_interfaces(&self, ifaces: Box<[TypeHandle]>) {
        let _ = self.interfaces.set(ifaces);
    }

    /// Field descriptors, once materialized. `None` while deferred for an
    /// under-construction definition.
    #[must_use]
    pub fn fields(&self) -> Option<&Arc<[FieldRc]>> {
        self.fields.get()
    }

    pub(crate) fn set_fields(&self, fields: Arc<[FieldRc]>) {
        let _ = self.fields.set(fields);
    }

    /// Method descriptors, once materialized.
    #[must_use]
    pub fn methods(&self) -> Option<&Arc<[MethodRc]>> {
        self.methods.get()
    }

    pub(crate) fn set_methods(&self, methods: Arc<[MethodRc]>) {
        let _ = self.methods.set(methods);
    }

    /// Published layout facts, if the layout phase has run.
    #[must_use]
    pub fn sizes(&self) -> Option<&SizeInfo> {
        self.sizes.get()
    }

    pub(crate) fn publish_sizes(&self, info: SizeInfo) {
        let _ = self.sizes.set(info);
    }

    /// Depth of this type in its supertype chain (1 for the root), or 0
    /// before the chain is published.
    #[must_use]
    pub fn idepth(&self) -> u32 {
        self.idepth.load(Ordering::Acquire)
    }

    /// Ancestor chain ordered root-first with this type last, once
    /// published.
    #[must_use]
    pub fn supertypes(&self) -> Option<&[TypeHandle]> {
        // Depth is stored after the array; a non-zero depth guarantees the
        // array is visible.
        if self.idepth.load(Ordering::Acquire) == 0 {
            return None;
        }
        self.supertypes.get().map(|chain| &chain[..])
    }

    pub(crate) fn publish_supertypes(&self, chain: Box<[TypeHandle]>) {
        let depth = chain.len() as u32;
        if self.supertypes.set(chain).is_ok() {
            self.idepth.store(depth, Ordering::Release);
        }
    }

    /// Packed interface-offset table, once published.
    #[must_use]
    pub fn interface_table(&self) -> Option<&InterfaceTable> {
        self.iface_table.get()
    }

    pub(crate) fn publish_interface_table(&self, table: InterfaceTable) {
        let _ = self.iface_table.set(table);
    }

    /// Interface id, assigned on first interface-offset participation.
    /// Ids are registry-scoped and never 0.
    #[must_use]
    pub fn interface_id(&self) -> Option<u32> {
        self.interface_id.get().copied()
    }

    pub(crate) fn assign_interface_id(&self, iid: u32) -> u32 {
        *self.interface_id.get_or_init(|| iid)
    }

    /// Built vtable, once published.
    #[must_use]
    pub fn vtable(&self) -> Option<&Arc<VTable>> {
        self.vtable.get()
    }

    pub(crate) fn publish_vtable(&self, vtable: Arc<VTable>) {
        let _ = self.vtable.set(vtable);
    }

    /// Permanently mark this type as failed.
    ///
    /// The first recorded failure wins; the returned error is the one all
    /// future operations will observe, which may differ from `err` if a
    /// racing thread poisoned first.
    pub(crate) fn poison(&self, err: Error) -> Error {
        let _ = self.failure.set(err);
        // set() only fails when a value is already present
        self.failure.get().cloned().unwrap_or(Error::LockError)
    }

    /// The recorded permanent failure, if this type is poisoned.
    #[must_use]
    pub fn failure(&self) -> Option<&Error> {
        self.failure.get()
    }

    /// Fail fast if this type is poisoned.
    ///
    /// # Errors
    /// Returns a clone of the recorded failure.
    pub fn ensure_ok(&self) -> Result<()> {
        match self.failure.get() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("token", &self.token)
            .field("module", &self.module)
            .field("name", &self.fullname())
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fullname())?;
        if let Some(generic) = &self.generic {
            write!(f, "<")?;
            for (i, arg) in generic.args.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{arg}")?;
            }
            write!(f, ">")?;
        }
        Ok(())
    }
}

/// One field of a type: declaration-order row data plus the resolved type
/// and byte offset attached by the resolver and the layout engine.
pub struct FieldDescriptor {
    /// Field name
    pub name: String,
    /// Attribute bits
    pub flags: FieldAttributes,
    /// Raw signature blob (shared with the defining row)
    pub signature: Arc<[u8]>,
    /// Declared byte offset under explicit layout
    pub explicit_offset: Option<u32>,
    /// Owning type
    pub owner: TypeHandle,
    resolved_type: OnceLock<TypeHandle>,
    offset: OnceLock<u32>,
}

impl FieldDescriptor {
    pub(crate) fn new(
        name: &str,
        flags: FieldAttributes,
        signature: Arc<[u8]>,
        explicit_offset: Option<u32>,
        owner: TypeHandle,
    ) -> Self {
        FieldDescriptor {
            name: name.to_string(),
            flags,
            signature,
            explicit_offset,
            owner,
            resolved_type: OnceLock::new(),
            offset: OnceLock::new(),
        }
    }

    /// Field belongs to the type rather than to instances.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(FieldAttributes::STATIC)
    }

    /// Compile-time constant with no backing storage.
    #[must_use]
    pub fn is_literal(&self) -> bool {
        self.flags.contains(FieldAttributes::LITERAL)
    }

    /// Resolved declared type, once the resolver has run.
    #[must_use]
    pub fn resolved_type(&self) -> Option<TypeRc> {
        self.resolved_type.get().and_then(TypeHandle::upgrade)
    }

    pub(crate) fn set_resolved_type(&self, ty: TypeHandle) {
        let _ = self.resolved_type.set(ty);
    }

    /// Byte offset within the instance (object header included) or within
    /// the static block, once layout has run.
    #[must_use]
    pub fn offset(&self) -> Option<u32> {
        self.offset.get().copied()
    }

    pub(crate) fn set_offset(&self, offset: u32) {
        let _ = self.offset.set(offset);
    }
}

impl fmt::Debug for FieldDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDescriptor")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .field("offset", &self.offset())
            .finish_non_exhaustive()
    }
}

/// Slot value meaning "not yet assigned"
const SLOT_UNASSIGNED: i32 = -1;

/// One method of a type, with its resolved parameter/return types and the
/// vtable slot assigned during dispatch-table construction.
pub struct MethodDescriptor {
    /// Method name
    pub name: String,
    /// Attribute bits
    pub flags: MethodAttributes,
    /// Method has an IL body
    pub has_body: bool,
    /// Resolved parameter types, in declaration order
    pub params: Box<[TypeHandle]>,
    /// Resolved return type
    pub returns: TypeHandle,
    /// Owning type
    pub owner: TypeHandle,
    /// Position within the owner's method list; generic instances keep the
    /// positions of their definition, which is what lets an instance vtable
    /// be derived slot-by-slot from the definition's
    pub index: usize,
    slot: AtomicI32,
}

impl MethodDescriptor {
    pub(crate) fn new(
        name: &str,
        flags: MethodAttributes,
        has_body: bool,
        params: Box<[TypeHandle]>,
        returns: TypeHandle,
        owner: TypeHandle,
        index: usize,
    ) -> Self {
        MethodDescriptor {
            name: name.to_string(),
            flags,
            has_body,
            params,
            returns,
            owner,
            index,
            slot: AtomicI32::new(SLOT_UNASSIGNED),
        }
    }

    /// Method participates in virtual dispatch.
    #[must_use]
    pub fn is_virtual(&self) -> bool {
        self.flags.contains(MethodAttributes::VIRTUAL)
    }

    /// Method belongs to the type rather than to instances.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodAttributes::STATIC)
    }

    /// Method has no implementation at this level.
    #[must_use]
    pub fn is_abstract(&self) -> bool {
        self.flags.contains(MethodAttributes::ABSTRACT)
    }

    /// Method always introduces a fresh vtable slot.
    #[must_use]
    pub fn is_newslot(&self) -> bool {
        self.flags.contains(MethodAttributes::NEW_SLOT)
    }

    /// Method cannot be overridden further.
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.flags.contains(MethodAttributes::FINAL)
    }

    /// Assigned vtable slot, if dispatch-table construction has placed
    /// this method.
    #[must_use]
    pub fn slot(&self) -> Option<u32> {
        let raw = self.slot.load(Ordering::Acquire);
        (raw != SLOT_UNASSIGNED).then_some(raw as u32)
    }

    /// Assign the vtable slot; the first assignment wins.
    pub(crate) fn set_slot(&self, slot: u32) {
        let _ = self.slot.compare_exchange(
            SLOT_UNASSIGNED,
            slot as i32,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// True when `other` has the same name and the same resolved
    /// parameter/return types.
    ///
    /// Types are interned, so signature equality is pointer equality of
    /// the resolved descriptors.
    #[must_use]
    pub fn signature_matches(&self, other: &MethodDescriptor) -> bool {
        self.name == other.name && self.sig_types_match(other)
    }

    /// Signature comparison ignoring the name, for explicit overrides
    /// whose body is named differently from the declaration.
    #[must_use]
    pub fn sig_types_match(&self, other: &MethodDescriptor) -> bool {
        if self.params.len() != other.params.len()
            || !self.returns.ptr_eq(&other.returns)
        {
            return false;
        }
        self.params
            .iter()
            .zip(other.params.iter())
            .all(|(a, b)| a.ptr_eq(b))
    }
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .field("index", &self.index)
            .field("slot", &self.slot())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str) -> TypeRc {
        Arc::new(TypeDescriptor::new(
            Token::typedef(1),
            ModuleId(1),
            "N",
            name,
            TypeKind::Definition,
            TypeAttributes::PUBLIC,
        ))
    }

    #[test]
    fn test_poison_first_failure_wins() {
        let ty = descriptor("A");
        let first = ty.poison(Error::LayoutViolation("first".to_string()));
        let second = ty.poison(Error::LayoutViolation("second".to_string()));
        assert_eq!(first.to_string(), "first");
        assert_eq!(second.to_string(), "first");
        assert!(ty.ensure_ok().is_err());
    }

    #[test]
    fn test_supertypes_publication_order() {
        let ty = descriptor("A");
        assert_eq!(ty.idepth(), 0);
        assert!(ty.supertypes().is_none());
        let chain = vec![TypeHandle::new(&ty)].into_boxed_slice();
        ty.publish_supertypes(chain);
        assert_eq!(ty.idepth(), 1);
        assert_eq!(ty.supertypes().unwrap().len(), 1);
    }

    #[test]
    fn test_handle_upgrade_after_drop() {
        let handle = {
            let ty = descriptor("A");
            TypeHandle::new(&ty)
        };
        assert!(handle.upgrade().is_none());
        assert!(handle.get().is_err());
    }

    #[test]
    fn test_method_slot_first_assignment_wins() {
        let ty = descriptor("A");
        let method = MethodDescriptor::new(
            "M",
            MethodAttributes::PUBLIC | MethodAttributes::VIRTUAL,
            true,
            Box::new([]),
            TypeHandle::new(&ty),
            TypeHandle::new(&ty),
            0,
        );
        assert_eq!(method.slot(), None);
        method.set_slot(4);
        method.set_slot(9);
        assert_eq!(method.slot(), Some(4));
    }
}
