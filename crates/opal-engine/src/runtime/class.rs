//! Class descriptors
//!
//! Fields and methods are identified by selectors; a selector is unique
//! per member name across the whole program, and fields and methods draw
//! from the same pool. Each class stores its members in an open-addressed
//! hash table: a member's initial position is `selector & table_mask`,
//! and collisions probe linearly to the next free slot. Field entries
//! carry the offset into the instance, method entries the offset into
//! the vtable (whose slots initially hold the method trampolines).
//!
//! The descriptor's address doubles as the runtime identity of the
//! class: generated code compares an object's first word against it for
//! `is` tests and guards. Descriptors are therefore boxed once and never
//! move.

use crate::analysis::bitset::BitSet;
use crate::jit::addr_store::{self, AddrKind};
use crate::parser::ast::TypeTag;
use crate::sema::symtab::{builtin_ids, SymId, SymKind, SymbolTable};

/// What a member slot resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    IntField,
    ObjField,
    /// Method with this many declared parameters (receiver not counted)
    Method { params: u16 },
}

/// One occupied slot of the selector table.
#[derive(Debug, Clone, Copy)]
pub struct MemberSlot {
    pub selector: u16,
    /// Field: offset within the instance. Method: offset within the vtable.
    pub offset: u16,
    pub kind: MemberKind,
}

/// Runtime class descriptor.
#[derive(Debug)]
pub struct ClassDesc {
    /// Defining symbol (debugging and dumps)
    pub sym: SymId,
    /// Marks which field offsets hold object references
    pub object_map: BitSet,
    /// Table size minus one (size is a power of two)
    pub table_mask: usize,
    /// `table_mask + 1` slots, open addressing with linear probing
    pub members: Vec<Option<MemberSlot>>,
    /// Method entry points, indexed by method offset
    pub vtable: Vec<*const u8>,
}

impl ClassDesc {
    /// Selector-table size for a class with the given member counts:
    /// 4 × 2^⌈log₂(methods+fields)⌉, always a power of two.
    pub fn selector_table_size(methods: usize, fields: usize) -> usize {
        let n = methods + fields;
        if n == 0 {
            return 4;
        }
        4 * n.next_power_of_two()
    }

    fn with_table_size(sym: SymId, size: usize, fields: usize, methods: usize) -> ClassDesc {
        debug_assert!(size.is_power_of_two());
        ClassDesc {
            sym,
            object_map: BitSet::new(fields),
            table_mask: size - 1,
            members: vec![None; size],
            vtable: vec![std::ptr::null(); methods],
        }
    }

    /// Install one member, probing linearly from its home slot.
    pub fn add_selector(&mut self, selector: u16, offset: u16, kind: MemberKind) {
        debug_assert!(selector != 0);
        let mut index = selector as usize & self.table_mask;
        while self.members[index].is_some() {
            index = (index + 1) & self.table_mask;
        }
        self.members[index] = Some(MemberSlot {
            selector,
            offset,
            kind,
        });
    }

    /// Member lookup: probe from `selector & mask`; an empty slot is a
    /// miss.
    pub fn lookup(&self, selector: u16) -> Option<MemberSlot> {
        let mut index = selector as usize & self.table_mask;
        loop {
            match self.members[index] {
                None => return None,
                Some(slot) if slot.selector == selector => return Some(slot),
                Some(_) => index = (index + 1) & self.table_mask,
            }
        }
    }

    /// Build and link the descriptor for a user class: one slot per
    /// field and method, the object map marking reference fields, and
    /// the vtable pointing at each method's trampoline.
    pub fn new_user(table: &mut SymbolTable, class_sym: SymId) -> Box<ClassDesc> {
        let storage = {
            let sym = table.lookup(class_sym).expect("class symbol");
            debug_assert_eq!(sym.kind, SymKind::Class);
            sym.storage
        };
        let size =
            ClassDesc::selector_table_size(storage.functions as usize, storage.fields as usize);
        let mut class = Box::new(ClassDesc::with_table_size(
            class_sym,
            size,
            storage.fields as usize,
            storage.functions as usize,
        ));

        // member symbols carry selector, offset, and type
        let members: Vec<(u16, u16, MemberKind, Option<*mut u8>, TypeTag)> = table
            .user_symbols()
            .filter(|s| s.parent == Some(class_sym) && s.selector != 0)
            .filter(|s| {
                s.kind == SymKind::Function
                    || (s.kind == SymKind::Variable && !s.is_stack_dynamic())
            })
            .map(|s| {
                let kind = match s.kind {
                    SymKind::Function => MemberKind::Method {
                        params: s.params.len() as u16,
                    },
                    _ => match s.ty.map(TypeTag::canonical) {
                        Some(TypeTag::Int) => MemberKind::IntField,
                        _ => MemberKind::ObjField,
                    },
                };
                let tramp = if s.kind == SymKind::Function {
                    Some(s.trampoline)
                } else {
                    None
                };
                (
                    s.selector,
                    s.offset as u16,
                    kind,
                    tramp,
                    s.ty.unwrap_or(TypeTag::Obj),
                )
            })
            .collect();

        for (selector, offset, kind, tramp, ty) in members {
            class.add_selector(selector, offset, kind);
            match kind {
                MemberKind::Method { .. } => {
                    if let Some(tramp) = tramp {
                        class.vtable[offset as usize] = tramp as *const u8;
                    }
                }
                _ => {
                    if ty.canonical() == TypeTag::Obj {
                        class.object_map.set(offset as usize);
                    }
                }
            }
        }

        let name = {
            let sym = table.lookup(class_sym).unwrap();
            table.interner.resolve(sym.name).to_string()
        };
        let addr = &*class as *const ClassDesc as *mut u8;
        addr_store::put(addr, AddrKind::Type, &name);
        table.lookup_mut(class_sym).unwrap().code = addr;
        class
    }

    /// Address used as the class's runtime identity.
    pub fn address(&self) -> *const u8 {
        self as *const ClassDesc as *const u8
    }
}

// Safety: descriptors are built single-threadedly during compilation;
// afterwards only vtable slots are patched, by the same thread that
// runs the generated code.
unsafe impl Send for ClassDesc {}

/// Descriptors of the built-in classes, linked to their hidden class
/// symbols.
#[derive(Debug)]
pub struct BuiltinClasses {
    pub boxed_int: Box<ClassDesc>,
    pub boxed_real: Box<ClassDesc>,
    pub string: Box<ClassDesc>,
    pub array: Box<ClassDesc>,
}

impl BuiltinClasses {
    /// Create the built-in descriptors and register them with the
    /// symbol table (`size` methods included).
    pub fn install(table: &mut SymbolTable) -> BuiltinClasses {
        use crate::runtime::object;

        let boxed_int = Box::new(ClassDesc::with_table_size(builtin_ids::CLASS_INT, 1, 1, 0));
        let boxed_real = Box::new(ClassDesc::with_table_size(builtin_ids::CLASS_REAL, 1, 1, 0));
        let mut string = Box::new(ClassDesc::with_table_size(builtin_ids::CLASS_STRING, 2, 1, 1));
        let mut array = Box::new(ClassDesc::with_table_size(builtin_ids::CLASS_ARRAY, 2, 1, 1));

        let size_selector = table
            .lookup(builtin_ids::SELECTOR_SIZE)
            .expect("size selector")
            .selector;
        string.add_selector(size_selector, 0, MemberKind::Method { params: 0 });
        string.vtable[0] = object::builtin_string_size as *const u8;
        array.add_selector(size_selector, 0, MemberKind::Method { params: 0 });
        array.vtable[0] = object::builtin_array_size as *const u8;

        let classes = BuiltinClasses {
            boxed_int,
            boxed_real,
            string,
            array,
        };
        for (id, class, name) in [
            (builtin_ids::CLASS_INT, &classes.boxed_int, "Int"),
            (builtin_ids::CLASS_REAL, &classes.boxed_real, "Real"),
            (builtin_ids::CLASS_STRING, &classes.string, "String"),
            (builtin_ids::CLASS_ARRAY, &classes.array, "Array"),
        ] {
            let addr = class.address() as *mut u8;
            table.lookup_mut(id).unwrap().code = addr;
            addr_store::put(addr, AddrKind::Type, name);
        }
        classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_size() {
        assert_eq!(ClassDesc::selector_table_size(0, 0), 4);
        assert_eq!(ClassDesc::selector_table_size(0, 1), 4);
        assert_eq!(ClassDesc::selector_table_size(1, 1), 8);
        assert_eq!(ClassDesc::selector_table_size(2, 1), 16);
        assert_eq!(ClassDesc::selector_table_size(2, 2), 16);
        assert_eq!(ClassDesc::selector_table_size(3, 2), 32);
    }

    #[test]
    fn test_add_and_lookup() {
        let mut class =
            ClassDesc::with_table_size(SymId::from_raw(1), 8, 2, 1);
        class.add_selector(3, 0, MemberKind::IntField);
        class.add_selector(7, 1, MemberKind::ObjField);
        class.add_selector(5, 0, MemberKind::Method { params: 2 });

        let slot = class.lookup(3).unwrap();
        assert_eq!(slot.kind, MemberKind::IntField);
        assert_eq!(slot.offset, 0);

        let slot = class.lookup(5).unwrap();
        assert_eq!(slot.kind, MemberKind::Method { params: 2 });

        assert!(class.lookup(4).is_none());
    }

    #[test]
    fn test_collision_probing() {
        // selectors 1 and 9 share home slot 1 in an 8-entry table
        let mut class = ClassDesc::with_table_size(SymId::from_raw(1), 8, 2, 0);
        class.add_selector(1, 0, MemberKind::IntField);
        class.add_selector(9, 1, MemberKind::IntField);

        assert_eq!(class.lookup(1).unwrap().offset, 0);
        assert_eq!(class.lookup(9).unwrap().offset, 1);
        // no two slots share a selector
        let mut seen = Vec::new();
        for slot in class.members.iter().flatten() {
            assert!(!seen.contains(&slot.selector));
            seen.push(slot.selector);
        }
    }

    #[test]
    fn test_dense_selector_population() {
        // many members with consecutive selectors: every one must be
        // installed exactly once and found again, regardless of probe
        // order
        let fields = 20usize;
        let methods = 12usize;
        let size = ClassDesc::selector_table_size(methods, fields);
        let mut class =
            ClassDesc::with_table_size(SymId::from_raw(1), size, fields, methods);

        for i in 0..fields {
            class.add_selector((i + 1) as u16, i as u16, MemberKind::IntField);
        }
        for i in 0..methods {
            let selector = (fields + i + 1) as u16;
            class.add_selector(selector, i as u16, MemberKind::Method { params: 1 });
        }

        for i in 0..fields {
            let slot = class.lookup((i + 1) as u16).unwrap();
            assert_eq!(slot.kind, MemberKind::IntField);
            assert_eq!(slot.offset, i as u16);
        }
        for i in 0..methods {
            let slot = class.lookup((fields + i + 1) as u16).unwrap();
            assert_eq!(slot.kind, MemberKind::Method { params: 1 });
            assert_eq!(slot.offset, i as u16);
        }
        // misses stay misses even in a well-populated table
        assert!(class.lookup((fields + methods + 5) as u16).is_none());
        assert_eq!(
            class.members.iter().flatten().count(),
            fields + methods
        );
    }

    #[test]
    fn test_clustered_selectors_probe_past_collisions() {
        // selectors that all hash to the same home slot
        let mut class = ClassDesc::with_table_size(SymId::from_raw(1), 16, 4, 0);
        for i in 0..4u16 {
            // 2, 18, 34, 50 — identical low bits under mask 15
            class.add_selector(2 + 16 * i, i, MemberKind::ObjField);
        }
        for i in 0..4u16 {
            assert_eq!(class.lookup(2 + 16 * i).unwrap().offset, i);
        }
        assert!(class.lookup(2 + 16 * 4).is_none());
    }

    #[test]
    fn test_builtin_classes() {
        let mut table = SymbolTable::new();
        let classes = BuiltinClasses::install(&mut table);

        // symbols point at the descriptors
        let int_sym = table.lookup(builtin_ids::CLASS_INT).unwrap();
        assert_eq!(int_sym.code as *const u8, classes.boxed_int.address());

        // string and array expose `size` through the same selector
        let size_selector = table.lookup(builtin_ids::SELECTOR_SIZE).unwrap().selector;
        let s = classes.string.lookup(size_selector).unwrap();
        let a = classes.array.lookup(size_selector).unwrap();
        assert_eq!(s.kind, MemberKind::Method { params: 0 });
        assert_eq!(a.kind, MemberKind::Method { params: 0 });
        assert!(!classes.string.vtable[0].is_null());
    }
}
