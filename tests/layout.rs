//! Field layout end to end: offsets, sizes, alignment, packing, explicit
//! layout validation, enums, statics, and poisoning through field types.

mod common;

use cilclass::prelude::*;
use common::*;

#[test]
fn class_int_field_lands_after_header() {
    let registry = TypeRegistry::new();
    let mut builder = ModuleBuilder::new("m");
    let token = builder.add(
        builder
            .class("Counter")
            .field(FieldRow::instance("count", &prim(PrimitiveKind::I4))),
    );
    let id = builder.register(&registry);

    let ty = registry.get(id, token).unwrap();
    assert_eq!(registry.instance_size(&ty).unwrap(), 12);
    let count = field_named(&ty, "count");
    assert_eq!(registry.field_offset(&count).unwrap(), 8);
    // Automatic layout is never blittable
    assert!(!ty.sizes().unwrap().blittable);
}

#[test]
fn derived_class_reference_fields_precede_scalars() {
    let registry = TypeRegistry::new();
    let mut builder = ModuleBuilder::new("m");
    let base = builder.add(
        builder
            .class("Base")
            .field(FieldRow::instance("a", &prim(PrimitiveKind::I4))),
    );
    let derived = builder.add(
        builder
            .class("Derived")
            .extends(TypeShape::Class(base))
            .field(FieldRow::instance("b", &prim(PrimitiveKind::I2)))
            .field(FieldRow::instance("name", &prim(PrimitiveKind::String))),
    );
    let id = builder.register(&registry);

    let derived = registry.get(id, derived).unwrap();
    registry.ensure_layout(&derived).unwrap();

    // Parent data first, then the reference pass, then scalars
    assert_eq!(field_named(&derived, "name").offset(), Some(16));
    assert_eq!(field_named(&derived, "b").offset(), Some(24));
    let sizes = derived.sizes().unwrap();
    assert_eq!(sizes.instance_size, 32);
    assert!(sizes.has_references);
}

#[test]
fn sequential_struct_follows_declaration_order() {
    let registry = TypeRegistry::new();
    let mut builder = ModuleBuilder::new("m");
    let token = builder.add(
        builder
            .strukt("Mixed")
            .field(FieldRow::instance("flag", &prim(PrimitiveKind::I1)))
            .field(FieldRow::instance("ticks", &prim(PrimitiveKind::I8))),
    );
    let id = builder.register(&registry);

    let ty = registry.get(id, token).unwrap();
    registry.ensure_layout(&ty).unwrap();

    assert_eq!(field_named(&ty, "flag").offset(), Some(8));
    assert_eq!(field_named(&ty, "ticks").offset(), Some(16));
    let sizes = ty.sizes().unwrap();
    assert_eq!(sizes.instance_size, 24);
    assert_eq!(sizes.min_align, 8);
    assert!(sizes.blittable);
    assert!(!sizes.has_references);
}

#[test]
fn packing_directive_caps_field_alignment() {
    let registry = TypeRegistry::new();
    let mut builder = ModuleBuilder::new("m");
    let token = builder.add(
        builder
            .strukt("Packed")
            .layout_directives(1, 0)
            .field(FieldRow::instance("tag", &prim(PrimitiveKind::I1)))
            .field(FieldRow::instance("value", &prim(PrimitiveKind::I4))),
    );
    let id = builder.register(&registry);

    let ty = registry.get(id, token).unwrap();
    registry.ensure_layout(&ty).unwrap();

    assert_eq!(field_named(&ty, "tag").offset(), Some(8));
    assert_eq!(field_named(&ty, "value").offset(), Some(9));
    assert_eq!(ty.sizes().unwrap().instance_size, 13);
}

#[test]
fn invalid_packing_is_rejected() {
    let registry = TypeRegistry::new();
    let mut builder = ModuleBuilder::new("m");
    let token = builder.add(
        builder
            .strukt("BadPack")
            .layout_directives(3, 0)
            .field(FieldRow::instance("x", &prim(PrimitiveKind::I4))),
    );
    let id = builder.register(&registry);

    let ty = registry.get(id, token).unwrap();
    assert!(matches!(
        registry.ensure_layout(&ty),
        Err(Error::LayoutViolation(_))
    ));
    assert!(ty.failure().is_some());
}

#[test]
fn empty_struct_still_occupies_a_byte() {
    let registry = TypeRegistry::new();
    let mut builder = ModuleBuilder::new("m");
    let token = builder.add(builder.strukt("Empty"));
    let id = builder.register(&registry);

    let ty = registry.get(id, token).unwrap();
    assert_eq!(registry.instance_size(&ty).unwrap(), 9);
}

#[test]
fn small_struct_alignment_is_widened_when_opted_in() {
    let registry = TypeRegistry::with_options(RegistryOptions {
        align_small_structs: true,
        ..RegistryOptions::default()
    });
    let mut builder = ModuleBuilder::new("m");
    let token = builder.add(
        builder
            .strukt("Wrapper")
            .field(FieldRow::instance("a", &prim(PrimitiveKind::I2)))
            .field(FieldRow::instance("b", &prim(PrimitiveKind::I2))),
    );
    let id = builder.register(&registry);

    let ty = registry.get(id, token).unwrap();
    registry.ensure_layout(&ty).unwrap();
    let sizes = ty.sizes().unwrap();
    // Payload is 4 bytes; natural alignment would be 2
    assert_eq!(sizes.instance_size, 12);
    assert_eq!(sizes.min_align, 4);
}

#[test]
fn small_struct_widening_is_off_by_default() {
    let registry = TypeRegistry::new();
    let mut builder = ModuleBuilder::new("m");
    let token = builder.add(
        builder
            .strukt("Wrapper")
            .field(FieldRow::instance("a", &prim(PrimitiveKind::I2)))
            .field(FieldRow::instance("b", &prim(PrimitiveKind::I2))),
    );
    let id = builder.register(&registry);

    let ty = registry.get(id, token).unwrap();
    registry.ensure_layout(&ty).unwrap();
    assert_eq!(ty.sizes().unwrap().min_align, 2);
}

#[test]
fn embedded_struct_carries_its_own_alignment() {
    let registry = TypeRegistry::new();
    let mut builder = ModuleBuilder::new("m");
    let inner = builder.add(
        builder
            .strukt("Inner")
            .field(FieldRow::instance("x", &prim(PrimitiveKind::I4)))
            .field(FieldRow::instance("y", &prim(PrimitiveKind::I4))),
    );
    let outer = builder.add(
        builder
            .strukt("Outer")
            .field(FieldRow::instance("pad", &prim(PrimitiveKind::I1)))
            .field(FieldRow::instance("inner", &TypeShape::ValueType(inner))),
    );
    let id = builder.register(&registry);

    let outer = registry.get(id, outer).unwrap();
    registry.ensure_layout(&outer).unwrap();

    assert_eq!(field_named(&outer, "pad").offset(), Some(8));
    assert_eq!(field_named(&outer, "inner").offset(), Some(12));
    assert_eq!(outer.sizes().unwrap().instance_size, 20);
}

#[test]
fn self_embedding_struct_is_a_layout_violation() {
    let registry = TypeRegistry::new();
    let mut builder = ModuleBuilder::new("m");
    // The row's own token is the next one the builder hands out
    let own_token = Token::typedef(builder.module.type_count() as u32 + 1);
    let token = builder.add(
        builder
            .strukt("Ouroboros")
            .field(FieldRow::instance("inner", &TypeShape::ValueType(own_token))),
    );
    assert_eq!(token, own_token);
    let id = builder.register(&registry);

    let ty = registry.get(id, token).unwrap();
    let err = registry.ensure_layout(&ty).unwrap_err();
    assert!(err.to_string().contains("recursively embeds itself"));
    assert!(ty.failure().is_some());
}

#[test]
fn explicit_union_of_scalars_is_accepted() {
    let registry = TypeRegistry::new();
    let mut builder = ModuleBuilder::new("m");
    let token = builder.add(
        builder
            .explicit_strukt("IntOrFloat")
            .field(FieldRow::instance("i", &prim(PrimitiveKind::I4)).at_offset(0))
            .field(FieldRow::instance("f", &prim(PrimitiveKind::R4)).at_offset(0)),
    );
    let id = builder.register(&registry);

    let ty = registry.get(id, token).unwrap();
    registry.ensure_layout(&ty).unwrap();
    assert_eq!(field_named(&ty, "i").offset(), Some(8));
    assert_eq!(field_named(&ty, "f").offset(), Some(8));
    assert_eq!(ty.sizes().unwrap().instance_size, 12);
}

#[test]
fn explicit_overlap_of_reference_and_scalar_is_rejected() {
    let registry = TypeRegistry::new();
    let mut builder = ModuleBuilder::new("m");
    let token = builder.add(
        builder
            .explicit_strukt("Evil")
            .field(FieldRow::instance("o", &prim(PrimitiveKind::Object)).at_offset(0))
            .field(FieldRow::instance("i", &prim(PrimitiveKind::I4)).at_offset(4)),
    );
    let id = builder.register(&registry);

    let ty = registry.get(id, token).unwrap();
    let err = registry.ensure_layout(&ty).unwrap_err();
    assert!(matches!(err, Error::LayoutViolation(_)));

    // The poison is permanent and repeats verbatim
    let again = registry.ensure_layout(&ty).unwrap_err();
    assert_eq!(err.to_string(), again.to_string());
}

#[test]
fn explicit_misaligned_reference_is_rejected() {
    let registry = TypeRegistry::new();
    let mut builder = ModuleBuilder::new("m");
    let token = builder.add(
        builder
            .explicit_strukt("Tilted")
            .field(FieldRow::instance("o", &prim(PrimitiveKind::Object)).at_offset(4)),
    );
    let id = builder.register(&registry);

    let ty = registry.get(id, token).unwrap();
    assert!(matches!(
        registry.ensure_layout(&ty),
        Err(Error::LayoutViolation(_))
    ));
}

#[test]
fn enum_delegates_to_its_underlying_primitive() {
    let registry = TypeRegistry::new();
    let mut builder = ModuleBuilder::new("m");
    let token = builder.add(
        builder
            .enumeration("Color", PrimitiveKind::I2)
            .field(FieldRow::literal("Red", &prim(PrimitiveKind::I2)))
            .field(FieldRow::literal("Green", &prim(PrimitiveKind::I2))),
    );
    let id = builder.register(&registry);

    let ty = registry.get(id, token).unwrap();
    registry.ensure_layout(&ty).unwrap();

    assert!(ty.is_enum());
    assert!(ty.is_value_type());
    let sizes = ty.sizes().unwrap();
    assert_eq!(sizes.instance_size, 10);
    assert_eq!(sizes.min_align, 2);
    assert!(sizes.blittable);
    assert_eq!(ty.element().unwrap().fullname(), "System.Int16");
}

#[test]
fn enum_without_instance_field_is_malformed() {
    let registry = TypeRegistry::new();
    let mut builder = ModuleBuilder::new("m");
    let mut row = builder.enumeration("Hollow", PrimitiveKind::I4);
    row.fields.clear();
    let token = builder.add(row);
    let id = builder.register(&registry);

    let ty = registry.get(id, token).unwrap();
    assert!(matches!(
        registry.ensure_layout(&ty),
        Err(Error::MalformedSignature { .. })
    ));
}

#[test]
fn statics_are_packed_from_zero_and_literals_skipped() {
    let registry = TypeRegistry::new();
    let mut builder = ModuleBuilder::new("m");
    let token = builder.add(
        builder
            .class("Holder")
            .field(FieldRow::static_field("counter", &prim(PrimitiveKind::I4)))
            .field(FieldRow::static_field("label", &prim(PrimitiveKind::String)))
            .field(FieldRow::literal("MAX", &prim(PrimitiveKind::I4))),
    );
    let id = builder.register(&registry);

    let ty = registry.get(id, token).unwrap();
    assert_eq!(registry.class_size(&ty).unwrap(), 16);
    assert_eq!(field_named(&ty, "counter").offset(), Some(0));
    assert_eq!(field_named(&ty, "label").offset(), Some(8));
    assert!(ty.sizes().unwrap().has_static_refs);

    let max = field_named(&ty, "MAX");
    assert!(matches!(
        registry.field_offset(&max),
        Err(Error::LayoutViolation(_))
    ));
}

#[test]
fn oversized_value_type_is_rejected() {
    let registry = TypeRegistry::new();
    let mut builder = ModuleBuilder::new("m");
    let token = builder.add(
        builder
            .strukt("Leviathan")
            .layout_directives(0, 0x0010_0001),
    );
    let id = builder.register(&registry);

    let ty = registry.get(id, token).unwrap();
    assert!(matches!(
        registry.ensure_layout(&ty),
        Err(Error::LayoutViolation(_))
    ));
}

#[test]
fn broken_field_type_poisons_the_dependent() {
    let registry = TypeRegistry::new();
    let mut builder = ModuleBuilder::new("m");
    let mut bad_row = builder.strukt("Corrupt");
    bad_row.fields.push(FieldRow {
        name: "garbage".to_string(),
        flags: FieldAttributes::PUBLIC,
        signature: vec![0xFF],
        explicit_offset: None,
    });
    let bad = builder.add(bad_row);
    let dependent = builder.add(
        builder
            .class("Dependent")
            .field(FieldRow::instance("payload", &TypeShape::ValueType(bad))),
    );
    let id = builder.register(&registry);

    let dependent = registry.get(id, dependent).unwrap();
    let err = registry.ensure_layout(&dependent).unwrap_err();
    assert!(err.to_string().contains("could not be loaded, due to:"));

    let bad = registry.get(id, bad).unwrap();
    assert!(bad.failure().is_some());
    assert!(dependent.failure().is_some());
}

#[test]
fn layout_is_deterministic_across_registries() {
    fn build(registry: &TypeRegistry) -> (u32, u32, u32) {
        let mut builder = ModuleBuilder::new("m");
        let token = builder.add(
            builder
                .class("Sample")
                .field(FieldRow::instance("a", &prim(PrimitiveKind::I1)))
                .field(FieldRow::instance("s", &prim(PrimitiveKind::String)))
                .field(FieldRow::instance("b", &prim(PrimitiveKind::I8))),
        );
        let id = builder.register(registry);
        let ty = registry.get(id, token).unwrap();
        registry.ensure_layout(&ty).unwrap();
        (
            registry.instance_size(&ty).unwrap(),
            field_named(&ty, "s").offset().unwrap(),
            field_named(&ty, "b").offset().unwrap(),
        )
    }

    let first = build(&TypeRegistry::new());
    let second = build(&TypeRegistry::new());
    assert_eq!(first, second);
}
