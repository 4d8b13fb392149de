//! Field layout: offsets, instance sizes, alignment, and blittability.
//!
//! Layout runs once per type and publishes a [`SizeInfo`] through the
//! type's phase lock; field offsets are stored on the field descriptors
//! before the size record becomes visible, so any thread that observes
//! published sizes also observes every offset.
//!
//! Three policies, selected by the type's attribute bits:
//!
//! - **Automatic**: for classes, fields are placed in two passes with GC
//!   reference slots first, packing references together for precise
//!   scanning; value types use a single declaration-order pass.
//! - **Sequential**: one pass in declaration order, honoring the packing
//!   directive (capped at each field's natural alignment). Reference
//!   slots are always pointer-aligned regardless of packing.
//! - **Explicit**: every instance field carries a declared offset, shifted
//!   past the object header. A byte-classification scan rejects layouts
//!   where reference and non-reference storage overlap, and reference
//!   slots must be pointer-aligned.
//!
//! Value-type payloads are bounded: at least one byte (an empty struct
//! still occupies storage) and at most 1 MiB. Enums delegate entirely to
//! their underlying primitive.
//!
//! Re-entering layout for a type already being laid out on this call
//! stack is a silent no-op; the outer frame completes the work. A value
//! type that transitively embeds itself is therefore caught when its
//! size is needed while still unpublished.

use tracing::{debug, trace};

use crate::{
    metadata::{
        modules::TypeAttributes,
        signatures::PrimitiveKind,
        typesystem::{
            registry::{LoadScope, TypeRegistry},
            FieldRc, SizeInfo, TypeKind, TypeRc,
        },
    },
    Error, Result,
};

/// Upper bound on a value type's unboxed payload
const MAX_VALUE_TYPE_PAYLOAD: u32 = 0x0010_0000;

/// Largest accepted packing directive
const MAX_PACKING_SIZE: u16 = 128;

/// Byte classification marks for the explicit-layout overlap scan
const BYTE_REF: u8 = 1;
const BYTE_NONREF: u8 = 2;

/// Storage characteristics of one field, derived from its resolved type.
struct FieldFacts {
    /// Bytes occupied inside the owner
    size: u32,
    /// Natural alignment
    align: u32,
    /// The field is a single GC reference slot
    ref_slot: bool,
    /// The field's storage contains GC references anywhere
    carries_refs: bool,
    /// The field's representation is blittable
    blittable: bool,
}

fn align_up(value: u32, align: u32) -> u32 {
    if align <= 1 {
        value
    } else {
        value.div_ceil(align) * align
    }
}

impl TypeRegistry {
    /// Run field layout for `ty`, publishing sizes and field offsets.
    ///
    /// Idempotent; a published result short-circuits without locking.
    ///
    /// # Errors
    /// Layout violations poison `ty`; failures of field types are chained
    /// into the poison.
    pub fn ensure_layout(&self, ty: &TypeRc) -> Result<()> {
        let mut scope = LoadScope::default();
        self.layout_with(ty, &mut scope)
    }

    pub(crate) fn layout_with(&self, ty: &TypeRc, scope: &mut LoadScope) -> Result<()> {
        ty.ensure_ok()?;
        if ty.sizes().is_some() {
            return Ok(());
        }
        let key = ty.key();
        if scope.layout_stack.contains(&key) {
            // Already being laid out further up this call stack
            return Ok(());
        }
        self.initialize(ty, scope)?;
        if ty.sizes().is_some() {
            return Ok(());
        }

        scope.layout_stack.push(key);
        let result = self.compute_layout(ty, scope);
        scope.layout_stack.pop();

        match result {
            Ok(info) => {
                debug_assert!(info.min_align.is_power_of_two());
                debug!(
                    ty = %ty,
                    instance_size = info.instance_size,
                    class_size = info.class_size,
                    min_align = info.min_align,
                    "layout computed"
                );
                // Computation ran outside the loader lock, so two racing
                // frames may both reach this point with identical results;
                // the first publication wins and the duplicate work is
                // discarded. Offsets were stored during computation;
                // publication of the size record is what makes them
                // observable. The lock serializes first-time publication
                // only.
                let _guard = self.lock_loader()?;
                ty.publish_sizes(info);
                Ok(())
            }
            Err(err) => Err(ty.poison(err)),
        }
    }

    fn compute_layout(&self, ty: &TypeRc, scope: &mut LoadScope) -> Result<SizeInfo> {
        let ptr = self.options().pointer_size;
        let header = self.options().object_header_size;

        if let Some(kind) = ty.primitive {
            let size = kind.size(ptr).max(1);
            return Ok(SizeInfo {
                instance_size: header + size,
                class_size: 0,
                min_align: size,
                packing_size: 0,
                has_references: false,
                has_static_refs: false,
                blittable: !matches!(kind, PrimitiveKind::Boolean | PrimitiveKind::Char),
            });
        }

        match ty.kind {
            TypeKind::Pointer | TypeKind::FnPtr => {
                return Ok(SizeInfo {
                    instance_size: header + ptr,
                    class_size: 0,
                    min_align: ptr,
                    packing_size: 0,
                    has_references: false,
                    has_static_refs: false,
                    blittable: true,
                })
            }
            TypeKind::GenericParam { .. } => {
                return Ok(SizeInfo {
                    instance_size: header + ptr,
                    class_size: 0,
                    min_align: ptr,
                    packing_size: 0,
                    has_references: true,
                    has_static_refs: false,
                    blittable: false,
                })
            }
            TypeKind::SzArray => {
                let element_refs = ty.element().is_some_and(|e| e.is_reference_like());
                return Ok(SizeInfo {
                    // Fixed part: header, length, first-element padding
                    instance_size: header + 2 * ptr,
                    class_size: 0,
                    min_align: ptr,
                    packing_size: 0,
                    has_references: element_refs,
                    has_static_refs: false,
                    blittable: false,
                });
            }
            _ => {}
        }

        self.ensure_fields(ty, scope)?;
        let Some(fields) = ty.fields() else {
            return Err(Error::UnresolvedDependency(format!(
                "{ty} is still under construction and cannot be laid out"
            )));
        };
        let fields = fields.clone();

        if ty.is_interface() {
            for field in fields.iter() {
                if !field.is_static() {
                    return Err(malformed_error!(
                        "interface {} declares instance field {}",
                        ty,
                        field.name
                    ));
                }
            }
            let (class_size, has_static_refs) = self.layout_statics(ty, &fields, scope)?;
            return Ok(SizeInfo {
                instance_size: header,
                class_size,
                min_align: 1,
                packing_size: 0,
                has_references: false,
                has_static_refs,
                blittable: false,
            });
        }

        if ty.is_enum() {
            let underlying = self.enum_underlying(ty, scope)?;
            let size = underlying
                .primitive
                .map_or(ptr, |kind| kind.size(ptr))
                .max(1);
            let (class_size, has_static_refs) = self.layout_statics(ty, &fields, scope)?;
            return Ok(SizeInfo {
                instance_size: header + size,
                class_size,
                min_align: size,
                packing_size: 0,
                has_references: false,
                has_static_refs,
                blittable: true,
            });
        }

        let (_, row) = self.definition_row(ty)?;
        let packing = row.packing_size;
        if packing != 0 && (!packing.is_power_of_two() || packing > MAX_PACKING_SIZE) {
            return Err(Error::LayoutViolation(format!(
                "{ty} has invalid packing size {packing}"
            )));
        }

        let explicit = ty.flags.contains(TypeAttributes::EXPLICIT_LAYOUT);
        let auto = !explicit && !ty.flags.contains(TypeAttributes::SEQUENTIAL_LAYOUT);

        // Parent data comes first for classes; value types embed nothing
        // from System.ValueType
        let mut cursor = header;
        let mut min_align = 1u32;
        let mut has_references = false;
        let mut blittable = true;
        if let Some(parent) = ty.parent() {
            if !ty.is_value_type() {
                self.layout_with(&parent, scope)
                    .map_err(|e| Error::dependency(&ty.to_string(), &e))?;
                let Some(parent_sizes) = parent.sizes() else {
                    return Err(Error::LayoutViolation(format!(
                        "recursive layout involving {parent}"
                    )));
                };
                cursor = parent_sizes.instance_size;
                min_align = parent_sizes.min_align;
                has_references = parent_sizes.has_references;
                blittable = parent_sizes.blittable;
            }
        }
        if auto {
            blittable = false;
        }

        // Resolve every instance field type up front so a broken field
        // poisons before any offset is assigned
        let mut instance_fields: Vec<(FieldRc, FieldFacts)> = Vec::new();
        for field in fields.iter() {
            if field.is_static() {
                continue;
            }
            let field_type = self.resolve_field_type_with(ty, field, scope)?;
            let facts = self.field_facts(&field_type, scope).map_err(|e| {
                Error::dependency(&format!("{}.{}", ty, field.name), &e)
            })?;
            instance_fields.push((field.clone(), facts));
        }

        let gc_aware = auto && !ty.is_value_type();
        let passes: u32 = if gc_aware { 2 } else { 1 };

        if explicit {
            for (field, facts) in &instance_fields {
                let Some(declared) = field.explicit_offset else {
                    return Err(Error::LayoutViolation(format!(
                        "{}.{} has no explicit offset",
                        ty, field.name
                    )));
                };
                let offset = header + declared;
                if facts.carries_refs && offset % ptr != 0 {
                    return Err(Error::LayoutViolation(format!(
                        "{}.{} places a reference at misaligned offset {declared}",
                        ty, field.name
                    )));
                }
                field.set_offset(offset);
                cursor = cursor.max(offset + facts.size);
                min_align = min_align.max(facts.align);
                if facts.carries_refs {
                    has_references = true;
                }
                if !facts.blittable {
                    blittable = false;
                }
            }
            check_explicit_overlap(ty, header, cursor, &instance_fields)?;
        } else {
            for pass in 0..passes {
                for (field, facts) in &instance_fields {
                    if gc_aware {
                        // Reference slots first, everything else second
                        if (pass == 0) != facts.ref_slot {
                            continue;
                        }
                    }
                    let mut align = facts.align;
                    if packing != 0 {
                        align = align.min(u32::from(packing));
                    }
                    if facts.carries_refs {
                        // GC scanning requires pointer alignment no matter
                        // what the packing directive says
                        align = align.max(ptr);
                        has_references = true;
                    }
                    min_align = min_align.max(align);
                    let offset = align_up(cursor, align);
                    field.set_offset(offset);
                    trace!(ty = %ty, field = %field.name, offset, size = facts.size, "field placed");
                    cursor = offset + facts.size;
                    if !facts.blittable {
                        blittable = false;
                    }
                }
            }
        }

        let instance_size = if ty.is_value_type() {
            let mut payload = cursor.saturating_sub(header);
            if payload == 0 {
                payload = 1;
            }
            if row.class_size != 0 {
                payload = payload.max(row.class_size);
            }
            if payload > MAX_VALUE_TYPE_PAYLOAD {
                return Err(Error::LayoutViolation(format!(
                    "value type {ty} has payload of {payload} bytes, above the {MAX_VALUE_TYPE_PAYLOAD} byte limit"
                )));
            }
            payload = align_up(payload, min_align);
            if self.options().align_small_structs
                && payload <= ptr
                && payload.is_power_of_two()
            {
                min_align = min_align.max(payload);
            }
            header + payload
        } else {
            let mut size = cursor.max(header);
            if row.class_size != 0 {
                size = size.max(header + row.class_size);
            }
            align_up(size, min_align)
        };

        let (class_size, has_static_refs) = self.layout_statics(ty, &fields, scope)?;

        Ok(SizeInfo {
            instance_size,
            class_size,
            min_align,
            packing_size: packing,
            has_references,
            has_static_refs,
            blittable,
        })
    }

    /// Lay out the static block: offsets from 0, literals skipped.
    fn layout_statics(
        &self,
        ty: &TypeRc,
        fields: &[FieldRc],
        scope: &mut LoadScope,
    ) -> Result<(u32, bool)> {
        let mut cursor = 0u32;
        let mut max_align = 1u32;
        let mut has_static_refs = false;
        for field in fields {
            if !field.is_static() || field.is_literal() {
                continue;
            }
            let field_type = self.resolve_field_type_with(ty, field, scope)?;
            let facts = self.field_facts(&field_type, scope).map_err(|e| {
                Error::dependency(&format!("{}.{}", ty, field.name), &e)
            })?;
            let offset = align_up(cursor, facts.align);
            field.set_offset(offset);
            cursor = offset + facts.size;
            max_align = max_align.max(facts.align);
            if facts.carries_refs {
                has_static_refs = true;
            }
        }
        Ok((align_up(cursor, max_align), has_static_refs))
    }

    /// Size, alignment, and GC facts of a field whose declared type is
    /// `field_type`. Embedded value types are laid out recursively.
    fn field_facts(&self, field_type: &TypeRc, scope: &mut LoadScope) -> Result<FieldFacts> {
        let ptr = self.options().pointer_size;
        let header = self.options().object_header_size;

        // Value-type-ness comes from the parent link, so the field type
        // must be initialized before it can be classified
        self.initialize(field_type, scope)?;

        if field_type.primitive == Some(PrimitiveKind::Void) {
            return Err(malformed_error!("field has type System.Void"));
        }
        if field_type.is_reference_like() {
            return Ok(FieldFacts {
                size: ptr,
                align: ptr,
                ref_slot: true,
                carries_refs: true,
                blittable: false,
            });
        }
        if let Some(kind) = field_type.primitive {
            let size = kind.size(ptr).max(1);
            return Ok(FieldFacts {
                size,
                align: size,
                ref_slot: false,
                carries_refs: false,
                blittable: !matches!(kind, PrimitiveKind::Boolean | PrimitiveKind::Char),
            });
        }
        if matches!(field_type.kind, TypeKind::Pointer | TypeKind::FnPtr) {
            return Ok(FieldFacts {
                size: ptr,
                align: ptr,
                ref_slot: false,
                carries_refs: false,
                blittable: true,
            });
        }

        // Embedded value type (struct or enum): its own layout supplies
        // size and alignment
        self.layout_with(field_type, scope)?;
        let Some(sizes) = field_type.sizes() else {
            return Err(Error::LayoutViolation(format!(
                "value type {field_type} recursively embeds itself"
            )));
        };
        Ok(FieldFacts {
            size: sizes.payload_size(header).max(1),
            align: sizes.min_align,
            ref_slot: false,
            carries_refs: sizes.has_references,
            blittable: sizes.blittable,
        })
    }
}

/// Reject explicit layouts where reference and non-reference storage
/// overlap, by classifying every payload byte.
fn check_explicit_overlap(
    ty: &TypeRc,
    header: u32,
    end: u32,
    instance_fields: &[(FieldRc, FieldFacts)],
) -> Result<()> {
    let payload = (end.saturating_sub(header)) as usize;
    let mut classes = vec![0u8; payload];
    for (field, facts) in instance_fields {
        let Some(offset) = field.offset() else {
            continue;
        };
        let mark = if facts.carries_refs { BYTE_REF } else { BYTE_NONREF };
        let start = (offset - header) as usize;
        for byte in classes.iter_mut().skip(start).take(facts.size as usize) {
            if *byte != 0 && *byte != mark {
                return Err(Error::LayoutViolation(format!(
                    "{}.{} overlaps reference and non-reference storage",
                    ty, field.name
                )));
            }
            *byte = mark;
        }
    }
    Ok(())
}
