//! Interface offset assignment and the compressed implementation bitmap.
//!
//! Every interface descriptor gets a registry-scoped id (never 0) the
//! first time it participates in an offset table. A type's packed table
//! maps each implemented interface, direct or transitive, to the base
//! vtable slot of its method range: ranges inherited from the parent are
//! force-copied (an interface dispatches at the same offset everywhere in
//! a hierarchy), and interfaces new to this type get contiguous fresh
//! ranges sized by their own virtual instance method count.
//!
//! Membership queries go through a run-length compressed bitmap: a
//! sequence of 2-byte elements `(zero-byte-count, literal-byte)`, with
//! runs longer than 255 zero bytes split by `(255, 0)` elements. For the
//! sparse id sets typical of real programs this is far smaller than a
//! plain bitmap while still decoding in a few iterations.

use std::collections::HashSet;

use tracing::trace;

use crate::{
    metadata::typesystem::{
        registry::{LoadScope, TypeRegistry},
        InterfaceEntry, InterfaceTable, TypeHandle, TypeKey, TypeRc,
    },
    Error, Result,
};

/// Compress a plain bitmap into the run-length form.
///
/// Each output element covers `zero-count` zero bytes followed by one
/// literal byte; trailing zero bytes of the input produce no output.
pub(crate) fn compress_bitmap(bitmap: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut zeros: u32 = 0;
    for &byte in bitmap {
        if byte == 0 {
            zeros += 1;
            continue;
        }
        while zeros > 255 {
            out.push(255);
            out.push(0);
            // The (255, 0) element covers 255 zeros plus its literal byte
            zeros -= 256;
        }
        out.push(zeros as u8);
        out.push(byte);
        zeros = 0;
    }
    out
}

/// Test bit `id` of a compressed bitmap.
pub(crate) fn interface_match(bitmap: &[u8], id: u32) -> bool {
    let mut id = id;
    let mut pos = 0;
    while pos + 1 < bitmap.len() {
        let zero_bits = u32::from(bitmap[pos]) * 8;
        if id < zero_bits {
            return false;
        }
        id -= zero_bits;
        if id < 8 {
            return bitmap[pos + 1] & (1u8 << id) != 0;
        }
        id -= 8;
        pos += 2;
    }
    false
}

/// Number of slots an interface's method range occupies: its own virtual
/// instance methods (interfaces it extends have ranges of their own).
fn virtual_method_count(iface: &TypeRc) -> u32 {
    iface.methods().map_or(0, |methods| {
        methods
            .iter()
            .filter(|m| m.is_virtual() && !m.is_static())
            .count() as u32
    })
}

impl TypeRegistry {
    /// Build and publish the interface-offset table of `ty`, with fresh
    /// ranges starting at `base_slot`. Returns the first slot past all
    /// assigned ranges.
    ///
    /// Runs during vtable construction; idempotent, with a republication
    /// race resolved by the table's phase lock.
    pub(crate) fn assign_interface_offsets(
        &self,
        ty: &TypeRc,
        base_slot: u32,
        scope: &mut LoadScope,
    ) -> Result<u32> {
        if let Some(table) = ty.interface_table() {
            let mut next = base_slot;
            for entry in &table.entries {
                let iface = entry.interface.get()?;
                next = next.max(entry.offset + virtual_method_count(&iface));
            }
            return Ok(next);
        }

        // Ancestor ranges are force-copied so dispatch offsets agree
        // across the hierarchy
        let mut ordered: Vec<(TypeRc, u32)> = Vec::new();
        let mut seen: HashSet<TypeKey> = HashSet::new();
        if let Some(parent) = ty.parent() {
            if let Some(parent_table) = parent.interface_table() {
                for entry in &parent_table.entries {
                    let iface = entry.interface.get()?;
                    if seen.insert(iface.key()) {
                        ordered.push((iface, entry.offset));
                    }
                }
            }
        }

        let mut fresh: Vec<TypeRc> = Vec::new();
        if ty.is_interface() {
            // An interface implements itself at offset 0
            if seen.insert(ty.key()) {
                fresh.push(ty.clone());
            }
        }
        for handle in ty.interfaces() {
            collect_transitive(&handle.get()?, &mut seen, &mut fresh);
        }

        let mut cursor = base_slot;
        for iface in fresh {
            self.initialize(&iface, scope)?;
            let offset = if ty.is_interface() && iface.key() == ty.key() {
                0
            } else {
                let offset = cursor;
                cursor += virtual_method_count(&iface);
                offset
            };
            ordered.push((iface, offset));
        }

        // Assign ids and build the packed table
        let mut entries: Vec<InterfaceEntry> = Vec::with_capacity(ordered.len());
        let mut max_iid = 0u32;
        for (iface, offset) in ordered {
            let iid = match iface.interface_id() {
                Some(iid) => iid,
                None => iface.assign_interface_id(self.alloc_interface_id()),
            };
            max_iid = max_iid.max(iid);
            entries.push(InterfaceEntry {
                iid,
                interface: TypeHandle::new(&iface),
                offset,
            });
        }
        entries.sort_by_key(|e| e.iid);

        let mut bitmap = vec![0u8; (max_iid / 8 + 1) as usize];
        for entry in &entries {
            bitmap[(entry.iid / 8) as usize] |= 1 << (entry.iid % 8);
        }
        let compressed = compress_bitmap(&bitmap);
        trace!(ty = %ty, interfaces = entries.len(), max_iid, "interface offsets assigned");

        let _guard = self.lock_loader()?;
        ty.publish_interface_table(InterfaceTable {
            entries: entries.into_boxed_slice(),
            bitmap: compressed.into_boxed_slice(),
            max_iid,
        });
        Ok(cursor)
    }
}

/// Depth-first transitive closure over extended interfaces, in
/// declaration order.
fn collect_transitive(iface: &TypeRc, seen: &mut HashSet<TypeKey>, out: &mut Vec<TypeRc>) {
    if !seen.insert(iface.key()) {
        return;
    }
    out.push(iface.clone());
    for extended in iface.interfaces() {
        if let Some(extended) = extended.upgrade() {
            collect_transitive(&extended, seen, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_round_trip() {
        let mut bitmap = vec![0u8; 70];
        for id in [1u32, 9, 64, 530] {
            let byte = (id / 8) as usize;
            if byte >= bitmap.len() {
                bitmap.resize(byte + 1, 0);
            }
            bitmap[byte] |= 1 << (id % 8);
        }
        let compressed = compress_bitmap(&bitmap);
        for id in [1u32, 9, 64, 530] {
            assert!(interface_match(&compressed, id), "id {id} lost");
        }
        for id in [0u32, 2, 8, 63, 65, 529, 531, 4096] {
            assert!(!interface_match(&compressed, id), "id {id} spurious");
        }
    }

    #[test]
    fn test_compress_long_zero_run() {
        // Bit far enough out to require multiple (255, 0) elements
        let id: u32 = 255 * 8 * 2 + 100;
        let mut bitmap = vec![0u8; (id / 8 + 1) as usize];
        bitmap[(id / 8) as usize] |= 1 << (id % 8);
        let compressed = compress_bitmap(&bitmap);
        assert!(interface_match(&compressed, id));
        assert!(!interface_match(&compressed, id - 1));
        assert!(!interface_match(&compressed, id + 1));
    }

    #[test]
    fn test_empty_bitmap_matches_nothing() {
        assert!(compress_bitmap(&[0, 0, 0]).is_empty());
        assert!(!interface_match(&[], 0));
        assert!(!interface_match(&[], 7));
    }
}
