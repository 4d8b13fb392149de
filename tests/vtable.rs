//! Dispatch table construction end to end: slot reuse and shadowing,
//! interface ranges and the compressed bitmap, explicit overrides,
//! default bodies, and assignability.

mod common;

use std::sync::Arc;

use cilclass::prelude::*;
use common::*;

/// Slots occupied by `System.Object` (ToString, Equals, GetHashCode,
/// Finalize).
const OBJECT_SLOTS: u32 = 4;

#[test]
fn virtual_method_extends_the_parent_table() {
    let registry = TypeRegistry::new();
    let mut builder = ModuleBuilder::new("m");
    let token = builder.add(builder.class("Animal").method(MethodRow::virtual_new(
        "Speak",
        vec![],
        prim(PrimitiveKind::Void),
    )));
    let id = builder.register(&registry);

    let ty = registry.get(id, token).unwrap();
    registry.ensure_vtable(&ty).unwrap();
    let vtable = ty.vtable().unwrap();
    assert_eq!(vtable.len() as u32, OBJECT_SLOTS + 1);

    let speak = method_named(&ty, "Speak");
    assert_eq!(registry.vtable_slot(&speak).unwrap(), OBJECT_SLOTS);
    assert!(Arc::ptr_eq(vtable.slot(OBJECT_SLOTS).unwrap(), &speak));
}

#[test]
fn reuse_slot_overrides_in_place() {
    let registry = TypeRegistry::new();
    let mut builder = ModuleBuilder::new("m");
    let animal = builder.add(builder.class("Animal").method(MethodRow::virtual_new(
        "Speak",
        vec![],
        prim(PrimitiveKind::Void),
    )));
    let dog = builder.add(
        builder
            .class("Dog")
            .extends(TypeShape::Class(animal))
            .method(MethodRow::virtual_reuse(
                "Speak",
                vec![],
                prim(PrimitiveKind::Void),
            )),
    );
    let id = builder.register(&registry);

    let animal = registry.get(id, animal).unwrap();
    let dog = registry.get(id, dog).unwrap();
    registry.ensure_vtable(&dog).unwrap();

    let base_speak = method_named(&animal, "Speak");
    let dog_speak = method_named(&dog, "Speak");
    assert_eq!(dog_speak.slot(), base_speak.slot());
    assert_eq!(dog.vtable().unwrap().len() as u32, OBJECT_SLOTS + 1);
    assert!(Arc::ptr_eq(
        dog.vtable().unwrap().slot(OBJECT_SLOTS).unwrap(),
        &dog_speak
    ));
    // The parent's table is untouched
    assert!(Arc::ptr_eq(
        animal.vtable().unwrap().slot(OBJECT_SLOTS).unwrap(),
        &base_speak
    ));
}

#[test]
fn new_slot_shadows_instead_of_overriding() {
    let registry = TypeRegistry::new();
    let mut builder = ModuleBuilder::new("m");
    let animal = builder.add(builder.class("Animal").method(MethodRow::virtual_new(
        "Speak",
        vec![],
        prim(PrimitiveKind::Void),
    )));
    let cat = builder.add(
        builder
            .class("Cat")
            .extends(TypeShape::Class(animal))
            .method(MethodRow::virtual_new(
                "Speak",
                vec![],
                prim(PrimitiveKind::Void),
            )),
    );
    let id = builder.register(&registry);

    let animal = registry.get(id, animal).unwrap();
    let cat = registry.get(id, cat).unwrap();
    registry.ensure_vtable(&cat).unwrap();

    let vtable = cat.vtable().unwrap();
    assert_eq!(vtable.len() as u32, OBJECT_SLOTS + 2);
    assert!(Arc::ptr_eq(
        vtable.slot(OBJECT_SLOTS).unwrap(),
        &method_named(&animal, "Speak")
    ));
    assert!(Arc::ptr_eq(
        vtable.slot(OBJECT_SLOTS + 1).unwrap(),
        &method_named(&cat, "Speak")
    ));
}

#[test]
fn interface_ranges_are_contiguous_and_dispatched() {
    let registry = TypeRegistry::new();
    let mut builder = ModuleBuilder::new("m");
    let ia = builder.add(builder.iface("IDrawable").method(MethodRow::abstract_virtual(
        "Draw",
        vec![],
        prim(PrimitiveKind::Void),
    )));
    let ib = builder.add(builder.iface("IMovable").method(MethodRow::abstract_virtual(
        "Move",
        vec![prim(PrimitiveKind::I4)],
        prim(PrimitiveKind::Void),
    )));
    let shape = builder.add(
        builder
            .class("Shape")
            .implements(TypeShape::Class(ia))
            .implements(TypeShape::Class(ib))
            .method(MethodRow::virtual_new("Draw", vec![], prim(PrimitiveKind::Void)))
            .method(MethodRow::virtual_new(
                "Move",
                vec![prim(PrimitiveKind::I4)],
                prim(PrimitiveKind::Void),
            )),
    );
    let id = builder.register(&registry);

    let ia = registry.get(id, ia).unwrap();
    let ib = registry.get(id, ib).unwrap();
    let shape = registry.get(id, shape).unwrap();
    registry.ensure_vtable(&shape).unwrap();

    let ia_offset = registry.interface_offset(&shape, &ia).unwrap();
    let ib_offset = registry.interface_offset(&shape, &ib).unwrap();
    assert_eq!(ia_offset, OBJECT_SLOTS);
    assert_eq!(ib_offset, OBJECT_SLOTS + 1);

    // Interface slots dispatch to the class's implementations
    let vtable = shape.vtable().unwrap();
    assert!(Arc::ptr_eq(
        vtable.slot(ia_offset).unwrap(),
        &method_named(&shape, "Draw")
    ));
    assert!(Arc::ptr_eq(
        vtable.slot(ib_offset).unwrap(),
        &method_named(&shape, "Move")
    ));

    assert!(registry.implements_interface(&shape, &ia).unwrap());
    assert!(registry.implements_interface(&shape, &ib).unwrap());
    assert!(registry.is_assignable_from(&ia, &shape).unwrap());
}

#[test]
fn subclass_shares_interface_offsets_and_table() {
    let registry = TypeRegistry::new();
    let mut builder = ModuleBuilder::new("m");
    let ia = builder.add(builder.iface("IDrawable").method(MethodRow::abstract_virtual(
        "Draw",
        vec![],
        prim(PrimitiveKind::Void),
    )));
    let shape = builder.add(
        builder
            .class("Shape")
            .implements(TypeShape::Class(ia))
            .method(MethodRow::virtual_new("Draw", vec![], prim(PrimitiveKind::Void))),
    );
    let circle = builder.add(builder.class("Circle").extends(TypeShape::Class(shape)));
    let id = builder.register(&registry);

    let ia = registry.get(id, ia).unwrap();
    let shape = registry.get(id, shape).unwrap();
    let circle = registry.get(id, circle).unwrap();
    registry.ensure_vtable(&circle).unwrap();

    // Inherited ranges keep their offsets, and an unchanged table is
    // shared with the parent
    assert_eq!(
        registry.interface_offset(&circle, &ia).unwrap(),
        registry.interface_offset(&shape, &ia).unwrap()
    );
    assert!(registry.implements_interface(&circle, &ia).unwrap());
    assert!(Arc::ptr_eq(
        circle.vtable().unwrap(),
        shape.vtable().unwrap()
    ));
}

#[test]
fn unimplemented_interface_method_poisons_concrete_type() {
    let registry = TypeRegistry::new();
    let mut builder = ModuleBuilder::new("m");
    let ia = builder.add(builder.iface("IDrawable").method(MethodRow::abstract_virtual(
        "Draw",
        vec![],
        prim(PrimitiveKind::Void),
    )));
    let token = builder.add(builder.class("Sketch").implements(TypeShape::Class(ia)));
    let id = builder.register(&registry);

    let ty = registry.get(id, token).unwrap();
    let err = registry.ensure_vtable(&ty).unwrap_err();
    assert!(matches!(err, Error::VTableInconsistency(_)));

    let again = registry.ensure_vtable(&ty).unwrap_err();
    assert_eq!(err.to_string(), again.to_string());
}

#[test]
fn abstract_chain_resolves_at_the_concrete_leaf() {
    let registry = TypeRegistry::new();
    let mut builder = ModuleBuilder::new("m");
    let base = builder.add(
        builder
            .class("Stream")
            .method(MethodRow::abstract_virtual("Flush", vec![], prim(PrimitiveKind::Void))),
    );
    {
        let row = builder.module.type_def_mut(base).unwrap();
        row.flags |= TypeAttributes::ABSTRACT;
    }
    let good = builder.add(
        builder
            .class("FileStream")
            .extends(TypeShape::Class(base))
            .method(MethodRow::virtual_reuse("Flush", vec![], prim(PrimitiveKind::Void))),
    );
    let bad = builder.add(builder.class("BrokenStream").extends(TypeShape::Class(base)));
    let id = builder.register(&registry);

    let base = registry.get(id, base).unwrap();
    registry.ensure_vtable(&base).unwrap();

    let good = registry.get(id, good).unwrap();
    registry.ensure_vtable(&good).unwrap();
    assert!(Arc::ptr_eq(
        good.vtable().unwrap().slot(OBJECT_SLOTS).unwrap(),
        &method_named(&good, "Flush")
    ));

    let bad = registry.get(id, bad).unwrap();
    assert!(matches!(
        registry.ensure_vtable(&bad),
        Err(Error::VTableInconsistency(_))
    ));
}

#[test]
fn abstract_reuse_method_does_not_fill_an_interface_slot() {
    let registry = TypeRegistry::new();
    let mut builder = ModuleBuilder::new("m");
    let ia = builder.add(builder.iface("IReadable").method(MethodRow::abstract_virtual(
        "Read",
        vec![],
        prim(PrimitiveKind::I4),
    )));
    // Abstract declaration without NEW_SLOT
    let abstract_reuse = MethodAttributes::PUBLIC
        | MethodAttributes::VIRTUAL
        | MethodAttributes::HIDE_BY_SIG
        | MethodAttributes::ABSTRACT;
    let base = builder.add(
        builder
            .class("Reader")
            .implements(TypeShape::Class(ia))
            .method(
                MethodRow::abstract_virtual("Read", vec![], prim(PrimitiveKind::I4))
                    .with_flags(abstract_reuse),
            ),
    );
    {
        let row = builder.module.type_def_mut(base).unwrap();
        row.flags |= TypeAttributes::ABSTRACT;
    }
    let leaf = builder.add(
        builder
            .class("FileReader")
            .extends(TypeShape::Class(base))
            .method(MethodRow::virtual_reuse("Read", vec![], prim(PrimitiveKind::I4))),
    );
    let id = builder.register(&registry);

    let ia = registry.get(id, ia).unwrap();
    let base = registry.get(id, base).unwrap();
    registry.ensure_vtable(&base).unwrap();

    // The abstract declaration occupies its own slot but never stands in
    // for the interface method
    let offset = registry.interface_offset(&base, &ia).unwrap();
    assert!(base.vtable().unwrap().slot(offset).is_none());

    let leaf = registry.get(id, leaf).unwrap();
    registry.ensure_vtable(&leaf).unwrap();
    let offset = registry.interface_offset(&leaf, &ia).unwrap();
    assert!(Arc::ptr_eq(
        leaf.vtable().unwrap().slot(offset).unwrap(),
        &method_named(&leaf, "Read")
    ));
}

#[test]
fn explicit_override_redirects_an_ancestor_slot() {
    let registry = TypeRegistry::new();
    let mut builder = ModuleBuilder::new("m");
    let base = builder.add(builder.class("Widget").method(MethodRow::virtual_new(
        "Render",
        vec![],
        prim(PrimitiveKind::Void),
    )));
    let derived = builder.add(
        builder
            .class("Button")
            .extends(TypeShape::Class(base))
            .method(MethodRow::virtual_new(
                "RenderCore",
                vec![],
                prim(PrimitiveKind::Void),
            ))
            .overrides(MethodImplRow {
                declaring_type: TypeShape::Class(base),
                declaration: "Render".to_string(),
                body_index: 0,
            }),
    );
    let id = builder.register(&registry);

    let base = registry.get(id, base).unwrap();
    let derived = registry.get(id, derived).unwrap();
    registry.ensure_vtable(&derived).unwrap();

    let render_slot = registry
        .vtable_slot(&method_named(&base, "Render"))
        .unwrap();
    assert!(Arc::ptr_eq(
        derived.vtable().unwrap().slot(render_slot).unwrap(),
        &method_named(&derived, "RenderCore")
    ));
    assert_eq!(derived.vtable().unwrap().len() as u32, OBJECT_SLOTS + 1);
}

#[test]
fn explicit_interface_override_fills_the_interface_slot() {
    let registry = TypeRegistry::new();
    let mut builder = ModuleBuilder::new("m");
    let ia = builder.add(builder.iface("IDrawable").method(MethodRow::abstract_virtual(
        "Draw",
        vec![],
        prim(PrimitiveKind::Void),
    )));
    let token = builder.add(
        builder
            .class("Canvas")
            .implements(TypeShape::Class(ia))
            .method(MethodRow::virtual_new(
                "DrawExplicit",
                vec![],
                prim(PrimitiveKind::Void),
            ))
            .overrides(MethodImplRow {
                declaring_type: TypeShape::Class(ia),
                declaration: "Draw".to_string(),
                body_index: 0,
            }),
    );
    let id = builder.register(&registry);

    let ia = registry.get(id, ia).unwrap();
    let ty = registry.get(id, token).unwrap();
    registry.ensure_vtable(&ty).unwrap();

    let offset = registry.interface_offset(&ty, &ia).unwrap();
    assert!(Arc::ptr_eq(
        ty.vtable().unwrap().slot(offset).unwrap(),
        &method_named(&ty, "DrawExplicit")
    ));
}

#[test]
fn default_interface_body_backfills_missing_implementations() {
    let registry = TypeRegistry::new();
    let mut builder = ModuleBuilder::new("m");
    let ia = builder.add(builder.iface("IGreeter").method(MethodRow::virtual_new(
        "Greet",
        vec![],
        prim(PrimitiveKind::Void),
    )));
    let token = builder.add(builder.class("Silent").implements(TypeShape::Class(ia)));
    let id = builder.register(&registry);

    let ia = registry.get(id, ia).unwrap();
    let ty = registry.get(id, token).unwrap();
    registry.ensure_vtable(&ty).unwrap();

    let offset = registry.interface_offset(&ty, &ia).unwrap();
    assert!(Arc::ptr_eq(
        ty.vtable().unwrap().slot(offset).unwrap(),
        &method_named(&ia, "Greet")
    ));
}

#[test]
fn override_cannot_touch_final_or_narrow_accessibility() {
    let registry = TypeRegistry::new();
    let mut builder = ModuleBuilder::new("m");
    let sealed_flags = MethodAttributes::PUBLIC
        | MethodAttributes::VIRTUAL
        | MethodAttributes::HIDE_BY_SIG
        | MethodAttributes::NEW_SLOT
        | MethodAttributes::FINAL;
    let base = builder.add(
        builder.class("Locked").method(
            MethodRow::virtual_new("Commit", vec![], prim(PrimitiveKind::Void))
                .with_flags(sealed_flags),
        ),
    );
    let over_final = builder.add(
        builder
            .class("Pick")
            .extends(TypeShape::Class(base))
            .method(MethodRow::virtual_new(
                "CommitMine",
                vec![],
                prim(PrimitiveKind::Void),
            ))
            .overrides(MethodImplRow {
                declaring_type: TypeShape::Class(base),
                declaration: "Commit".to_string(),
                body_index: 0,
            }),
    );

    let narrow_flags = MethodAttributes::ASSEMBLY
        | MethodAttributes::VIRTUAL
        | MethodAttributes::HIDE_BY_SIG
        | MethodAttributes::NEW_SLOT;
    let iface = builder.add(builder.iface("IPublic").method(MethodRow::abstract_virtual(
        "Run",
        vec![],
        prim(PrimitiveKind::Void),
    )));
    let narrowing = builder.add(
        builder
            .class("Shy")
            .implements(TypeShape::Class(iface))
            .method(
                MethodRow::virtual_new("RunHidden", vec![], prim(PrimitiveKind::Void))
                    .with_flags(narrow_flags),
            )
            .overrides(MethodImplRow {
                declaring_type: TypeShape::Class(iface),
                declaration: "Run".to_string(),
                body_index: 0,
            }),
    );
    let id = builder.register(&registry);

    let over_final = registry.get(id, over_final).unwrap();
    assert!(matches!(
        registry.ensure_vtable(&over_final),
        Err(Error::VTableInconsistency(_))
    ));

    let narrowing = registry.get(id, narrowing).unwrap();
    assert!(matches!(
        registry.ensure_vtable(&narrowing),
        Err(Error::VTableInconsistency(_))
    ));
}

#[test]
fn legacy_collection_interfaces_may_narrow_accessibility() {
    fn build(registry: &TypeRegistry) -> Result<(), Error> {
        let mut builder = ModuleBuilder::new("m");
        let iface = builder.add(
            TypeDefRow::new(
                "System.Collections.Custom",
                "ILegacy",
                TypeAttributes::PUBLIC | TypeAttributes::INTERFACE | TypeAttributes::ABSTRACT,
            )
            .method(MethodRow::abstract_virtual(
                "CopyTo",
                vec![],
                prim(PrimitiveKind::Void),
            )),
        );
        let narrow_flags = MethodAttributes::ASSEMBLY
            | MethodAttributes::VIRTUAL
            | MethodAttributes::HIDE_BY_SIG
            | MethodAttributes::NEW_SLOT;
        let token = builder.add(
            builder
                .class("OldCollection")
                .implements(TypeShape::Class(iface))
                .method(
                    MethodRow::virtual_new("CopyToImpl", vec![], prim(PrimitiveKind::Void))
                        .with_flags(narrow_flags),
                )
                .overrides(MethodImplRow {
                    declaring_type: TypeShape::Class(iface),
                    declaration: "CopyTo".to_string(),
                    body_index: 0,
                }),
        );
        let id = builder.register(registry);
        let ty = registry.get(id, token)?;
        registry.ensure_vtable(&ty)
    }

    build(&TypeRegistry::new()).unwrap();

    let strict = TypeRegistry::with_options(RegistryOptions {
        allow_legacy_collection_overrides: false,
        ..RegistryOptions::default()
    });
    assert!(matches!(
        build(&strict),
        Err(Error::VTableInconsistency(_))
    ));
}

#[test]
fn interface_extension_is_transitive() {
    let registry = TypeRegistry::new();
    let mut builder = ModuleBuilder::new("m");
    let ibase = builder.add(builder.iface("IBase").method(MethodRow::abstract_virtual(
        "Root",
        vec![],
        prim(PrimitiveKind::Void),
    )));
    let iderived = builder.add(
        builder
            .iface("IDerived")
            .implements(TypeShape::Class(ibase))
            .method(MethodRow::abstract_virtual(
                "Leaf",
                vec![],
                prim(PrimitiveKind::Void),
            )),
    );
    let token = builder.add(
        builder
            .class("Impl")
            .implements(TypeShape::Class(iderived))
            .method(MethodRow::virtual_new("Root", vec![], prim(PrimitiveKind::Void)))
            .method(MethodRow::virtual_new("Leaf", vec![], prim(PrimitiveKind::Void))),
    );
    let id = builder.register(&registry);

    let ibase = registry.get(id, ibase).unwrap();
    let iderived = registry.get(id, iderived).unwrap();
    let ty = registry.get(id, token).unwrap();
    registry.ensure_vtable(&ty).unwrap();

    // Implementing the derived interface implies the base one
    assert!(registry.implements_interface(&ty, &iderived).unwrap());
    assert!(registry.implements_interface(&ty, &ibase).unwrap());
    assert!(registry.interface_offset(&ty, &ibase).is_ok());

    // The derived interface itself implements its base
    registry.ensure_vtable(&iderived).unwrap();
    assert!(registry.implements_interface(&iderived, &ibase).unwrap());
}

#[test]
fn array_covariance_holds_for_references_only() {
    let registry = TypeRegistry::new();
    let string = registry.primitive(PrimitiveKind::String);
    let object = registry.primitive(PrimitiveKind::Object);
    let int32 = registry.primitive(PrimitiveKind::I4);

    let string_array = registry.szarray_of(&string);
    let object_array = registry.szarray_of(&object);
    let int_array = registry.szarray_of(&int32);

    assert!(registry
        .is_assignable_from(&object_array, &string_array)
        .unwrap());
    assert!(!registry
        .is_assignable_from(&string_array, &object_array)
        .unwrap());
    assert!(!registry.is_assignable_from(&object_array, &int_array).unwrap());
    assert!(registry.is_assignable_from(&int_array, &int_array).unwrap());

    // Arrays are assignable to System.Array through the class chain
    let array = registry.by_name("System.Array").unwrap();
    assert!(registry.is_assignable_from(&array, &int_array).unwrap());
}

#[test]
fn never_registered_interface_is_implemented_by_nothing() {
    let registry = TypeRegistry::new();
    let mut builder = ModuleBuilder::new("m");
    let lonely = builder.add(builder.iface("ILonely"));
    let plain = builder.add(builder.class("Plain"));
    let id = builder.register(&registry);

    let lonely = registry.get(id, lonely).unwrap();
    let plain = registry.get(id, plain).unwrap();
    assert!(!registry.implements_interface(&plain, &lonely).unwrap());
    assert!(matches!(
        registry.interface_offset(&plain, &lonely),
        Err(Error::VTableInconsistency(_))
    ));
}
