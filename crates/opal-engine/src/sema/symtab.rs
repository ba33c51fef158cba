//! Symbol table
//!
//! Two arenas — user symbols (positive ids, 1-based) and builtin symbols
//! (negative ids) — plus the process-global selector table. Ids are
//! stable; entry 0 is reserved and invalid. Selector numbers are dense
//! small integers starting at 1, shared by fields and methods across all
//! classes.
//!
//! Builtin entries with prescribed ids are installed first (generated
//! code and the parser compile against those numbers); the remaining
//! builtins take the next free slots.

use crate::parser::ast::{NodeId, TypeTag};
use crate::parser::interner::{Interner, Name};
use rustc_hash::FxHashMap;

/// Signed, stable symbol id. Positive: user symbols (1-based); negative:
/// builtins; 0 is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymId(i32);

impl SymId {
    pub const fn from_raw(raw: i32) -> SymId {
        SymId(raw)
    }

    pub fn raw(self) -> i32 {
        self.0
    }

    pub fn is_builtin(self) -> bool {
        self.0 < 0
    }
}

/// Fixed builtin symbol ids. Generated code, the parser's operator
/// applications, and type analysis all reference these directly.
pub mod builtin_ids {
    use super::SymId;

    pub const OP_ADD: SymId = SymId::from_raw(-1);
    pub const OP_SUB: SymId = SymId::from_raw(-2);
    pub const OP_MUL: SymId = SymId::from_raw(-3);
    pub const OP_DIV: SymId = SymId::from_raw(-4);
    pub const OP_TEST_EQ: SymId = SymId::from_raw(-5);
    pub const OP_TEST_LE: SymId = SymId::from_raw(-6);
    pub const OP_TEST_LT: SymId = SymId::from_raw(-7);
    pub const OP_NOT: SymId = SymId::from_raw(-8);
    pub const OP_CONVERT: SymId = SymId::from_raw(-9);
    pub const OP_ALLOCATE: SymId = SymId::from_raw(-10);
    pub const OP_SELF: SymId = SymId::from_raw(-11);
    pub const FN_PRINT: SymId = SymId::from_raw(-12);
    pub const FN_ASSERT: SymId = SymId::from_raw(-13);
    pub const CLASS_INT: SymId = SymId::from_raw(-14);
    pub const CLASS_REAL: SymId = SymId::from_raw(-15);
    pub const CLASS_STRING: SymId = SymId::from_raw(-16);
    pub const CLASS_ARRAY: SymId = SymId::from_raw(-17);
    pub const SELECTOR_SIZE: SymId = SymId::from_raw(-18);
    pub const METHOD_STRING_SIZE: SymId = SymId::from_raw(-19);
    pub const METHOD_ARRAY_SIZE: SymId = SymId::from_raw(-20);
}

/// What a symbol denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymKind {
    Variable,
    /// Includes constructors (flagged `CONSTRUCTOR`)
    Function,
    Class,
    /// Canonical selector entry; only `selector` is meaningful
    Selector,
}

/// Symbol flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SymFlags(u16);

impl SymFlags {
    /// Name not visible to user code
    pub const HIDDEN: SymFlags = SymFlags(0x01);
    pub const BUILTIN: SymFlags = SymFlags(0x02);
    /// Class member (field with `Variable`, method with `Function`)
    pub const MEMBER: SymFlags = SymFlags(0x04);
    /// Parameter (only with `Variable`)
    pub const PARAM: SymFlags = SymFlags(0x08);
    pub const CONSTRUCTOR: SymFlags = SymFlags(0x10);
    /// Fully translated to machine code
    pub const COMPILED: SymFlags = SymFlags(0x20);

    pub const fn empty() -> SymFlags {
        SymFlags(0)
    }

    pub fn contains(self, other: SymFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: SymFlags) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for SymFlags {
    type Output = SymFlags;
    fn bitor(self, rhs: SymFlags) -> SymFlags {
        SymFlags(self.0 | rhs.0)
    }
}

/// Storage counters attached to functions and classes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageRecord {
    /// Functions: local variables. Classes: (unused; see `fields`)
    pub vars: u16,
    /// Classes: fields
    pub fields: u16,
    /// Classes: methods. Top level: functions
    pub functions: u16,
    /// Maximum number of live temporary slots
    pub temps: u16,
}

/// One symbol-table entry.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub id: SymId,
    pub name: Name,
    pub kind: SymKind,
    pub flags: SymFlags,
    /// Declared/returned type
    pub ty: Option<TypeTag>,
    /// Structural parent (class of a member, function of a parameter)
    pub parent: Option<SymId>,
    /// Declaration site
    pub astref: Option<NodeId>,
    /// How many same-named symbols this one shadows (for dumps)
    pub occurrence: u16,
    /// Parameter types, in order; `None` accepts any type uncoerced
    pub params: Vec<Option<TypeTag>>,
    pub storage: StorageRecord,
    /// Global selector id for members; 0 = none
    pub selector: u16,
    /// Member: offset in instance/vtable. Param: parameter number.
    /// Variable: slot number (stack or static).
    pub offset: i32,
    /// Classes: the synthesised constructor
    pub constructor: Option<SymId>,
    /// Entry point of compiled code; classes: the descriptor address
    pub code: *mut u8,
    /// Trampoline entry, once bound
    pub trampoline: *mut u8,
}

impl Symbol {
    /// Statically allocated (global) variable.
    pub fn is_static(&self) -> bool {
        self.parent.is_none() && self.kind == SymKind::Variable && self.id != builtin_ids::OP_SELF
    }

    /// Lives in the current stack frame.
    pub fn is_stack_dynamic(&self) -> bool {
        (self.parent.is_some() && !self.flags.contains(SymFlags::MEMBER))
            || self.id == builtin_ids::OP_SELF
    }

    /// Constructor parameter of a class (illegal to capture in methods).
    pub fn is_constructor_param(&self, table: &SymbolTable) -> bool {
        self.flags.contains(SymFlags::PARAM)
            && self
                .parent
                .and_then(|p| table.lookup(p))
                .map(|p| p.kind == SymKind::Class)
                .unwrap_or(false)
    }
}

/// User and builtin symbol arenas plus the selector table.
#[derive(Debug)]
pub struct SymbolTable {
    user: Vec<Symbol>,
    builtin: Vec<Symbol>,
    /// Selector name → canonical selector symbol
    selectors: FxHashMap<Name, SymId>,
    /// Next free selector number; selector 0 is reserved (miss)
    pub selectors_nr: u16,
    /// The identifier interner travels with the table
    pub interner: Interner,
}

impl SymbolTable {
    /// Empty table with all builtin entries installed.
    pub fn new() -> SymbolTable {
        let mut table = SymbolTable {
            user: Vec::with_capacity(128),
            builtin: Vec::new(),
            selectors: FxHashMap::default(),
            selectors_nr: 1,
            interner: Interner::new(),
        };
        table.register_builtins();
        table
    }

    /// Look up a symbol by id; `None` for 0 and unknown ids.
    pub fn lookup(&self, id: SymId) -> Option<&Symbol> {
        match id.raw() {
            0 => None,
            n if n > 0 => self.user.get((n - 1) as usize),
            n => self.builtin.get((-n - 1) as usize),
        }
    }

    pub fn lookup_mut(&mut self, id: SymId) -> Option<&mut Symbol> {
        match id.raw() {
            0 => None,
            n if n > 0 => self.user.get_mut((n - 1) as usize),
            n => self.builtin.get_mut((-n - 1) as usize),
        }
    }

    /// Number of user symbols.
    pub fn user_len(&self) -> usize {
        self.user.len()
    }

    /// Number of builtin symbols.
    pub fn builtin_len(&self) -> usize {
        self.builtin.len()
    }

    /// Iterate user symbols in id order.
    pub fn user_symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.user.iter()
    }

    /// Iterate builtin symbols in id order.
    pub fn builtin_symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.builtin.iter()
    }

    /// Allocate a new user symbol.
    pub fn new_symbol(
        &mut self,
        kind: SymKind,
        flags: SymFlags,
        ty: Option<TypeTag>,
        name: Name,
        astref: Option<NodeId>,
    ) -> SymId {
        let id = SymId(self.user.len() as i32 + 1);
        self.user.push(Symbol {
            id,
            name,
            kind,
            flags,
            ty,
            parent: None,
            astref,
            occurrence: 0,
            params: Vec::new(),
            storage: StorageRecord::default(),
            selector: 0,
            offset: 0,
            constructor: None,
            code: std::ptr::null_mut(),
            trampoline: std::ptr::null_mut(),
        });
        id
    }

    /// Install a builtin symbol. `requested` must be the next free
    /// negative id (prescribed entries are installed in id order).
    fn builtin_new(
        &mut self,
        requested: SymId,
        kind: SymKind,
        flags: SymFlags,
        ty: Option<TypeTag>,
        name: &str,
    ) -> SymId {
        let id = SymId(-(self.builtin.len() as i32) - 1);
        debug_assert_eq!(id, requested, "builtin id mismatch for `{}`", name);
        let name = self.interner.intern(name);
        self.builtin.push(Symbol {
            id,
            name,
            kind,
            flags: flags | SymFlags::BUILTIN,
            ty,
            parent: None,
            astref: None,
            occurrence: 0,
            params: Vec::new(),
            storage: StorageRecord::default(),
            selector: 0,
            offset: 0,
            constructor: None,
            code: std::ptr::null_mut(),
            trampoline: std::ptr::null_mut(),
        });
        id
    }

    /// The canonical selector symbol for `name`, created on first use.
    ///
    /// Only the `selector` field of the returned symbol is meaningful;
    /// per-class information lives with the member symbols.
    pub fn selector(&mut self, name: Name) -> SymId {
        if let Some(&id) = self.selectors.get(&name) {
            return id;
        }
        let selector = self.selectors_nr;
        self.selectors_nr += 1;
        let id = self.new_symbol(SymKind::Selector, SymFlags::empty(), None, name, None);
        self.lookup_mut(id).unwrap().selector = selector;
        self.selectors.insert(name, id);
        id
    }

    /// Selector lookup without creating (used by tests and dumps).
    pub fn find_selector(&self, name: Name) -> Option<SymId> {
        self.selectors.get(&name).copied()
    }

    fn register_builtins(&mut self) {
        use builtin_ids::*;
        use SymKind::*;

        let hidden_fn = SymFlags::HIDDEN;
        let int2 = vec![Some(TypeTag::Int), Some(TypeTag::Int)];

        // Hidden operators at prescribed ids
        let add = self.builtin_new(OP_ADD, Function, hidden_fn, Some(TypeTag::Int), "+");
        let sub = self.builtin_new(OP_SUB, Function, hidden_fn, Some(TypeTag::Int), "-");
        let mul = self.builtin_new(OP_MUL, Function, hidden_fn, Some(TypeTag::Int), "*");
        let div = self.builtin_new(OP_DIV, Function, hidden_fn, Some(TypeTag::Int), "/");
        for id in [add, sub, mul, div] {
            self.lookup_mut(id).unwrap().params = int2.clone();
        }

        // equality accepts both scalar and object operands uncoerced
        let eq = self.builtin_new(OP_TEST_EQ, Function, hidden_fn, Some(TypeTag::Int), "==");
        self.lookup_mut(eq).unwrap().params = vec![None, None];
        let le = self.builtin_new(OP_TEST_LE, Function, hidden_fn, Some(TypeTag::Int), "<=");
        let lt = self.builtin_new(OP_TEST_LT, Function, hidden_fn, Some(TypeTag::Int), "<");
        for id in [le, lt] {
            self.lookup_mut(id).unwrap().params = int2.clone();
        }

        let not = self.builtin_new(OP_NOT, Function, hidden_fn, Some(TypeTag::Int), "not");
        self.lookup_mut(not).unwrap().params = vec![Some(TypeTag::Int)];

        // __convert has no fixed signature; type analysis assigns per use
        self.builtin_new(OP_CONVERT, Function, hidden_fn, None, "__convert");

        let alloc = self.builtin_new(OP_ALLOCATE, Function, hidden_fn, Some(TypeTag::Obj), "__allocate");
        self.lookup_mut(alloc).unwrap().params = vec![Some(TypeTag::Int)];

        self.builtin_new(OP_SELF, Variable, SymFlags::HIDDEN, Some(TypeTag::Obj), "self");

        // Visible builtin functions
        let print = self.builtin_new(FN_PRINT, Function, SymFlags::empty(), Some(TypeTag::Obj), "print");
        self.lookup_mut(print).unwrap().params = vec![Some(TypeTag::Obj)];
        let assert_ = self.builtin_new(FN_ASSERT, Function, SymFlags::empty(), Some(TypeTag::Obj), "assert");
        self.lookup_mut(assert_).unwrap().params = vec![Some(TypeTag::Int)];

        // Builtin classes (hidden; descriptors linked by the runtime)
        self.builtin_new(CLASS_INT, Class, SymFlags::HIDDEN, None, "Int");
        self.builtin_new(CLASS_REAL, Class, SymFlags::HIDDEN, None, "Real");
        self.builtin_new(CLASS_STRING, Class, SymFlags::HIDDEN, None, "String");
        self.builtin_new(CLASS_ARRAY, Class, SymFlags::HIDDEN, None, "Array");

        // The `size` selector and the builtin methods behind it
        let size_name = self.interner.intern("size");
        let size_sel = self.builtin_new(SELECTOR_SIZE, Selector, SymFlags::empty(), None, "size");
        let selector = self.selectors_nr;
        self.selectors_nr += 1;
        self.lookup_mut(size_sel).unwrap().selector = selector;
        self.selectors.insert(size_name, size_sel);

        let string_size = self.builtin_new(
            METHOD_STRING_SIZE,
            Function,
            SymFlags::MEMBER,
            Some(TypeTag::Int),
            "size",
        );
        {
            let sym = self.lookup_mut(string_size).unwrap();
            sym.selector = selector;
            sym.parent = Some(CLASS_STRING);
        }
        let array_size = self.builtin_new(
            METHOD_ARRAY_SIZE,
            Function,
            SymFlags::MEMBER,
            Some(TypeTag::Int),
            "size",
        );
        {
            let sym = self.lookup_mut(array_size).unwrap();
            sym.selector = selector;
            sym.parent = Some(CLASS_ARRAY);
        }
    }

    /// Render one entry (debug dumps).
    pub fn dump_entry(&self, id: SymId, out: &mut String) {
        use std::fmt::Write;
        let Some(sym) = self.lookup(id) else {
            out.push_str("(invalid symbol)\n");
            return;
        };
        let _ = write!(out, "#{}:\t", sym.id.raw());
        self.dump_name(id, out);
        let _ = write!(out, "\n\tKind:\t{:?}", sym.kind);
        for (flag, label) in [
            (SymFlags::HIDDEN, "HIDDEN"),
            (SymFlags::BUILTIN, "BUILTIN"),
            (SymFlags::MEMBER, "MEMBER"),
            (SymFlags::PARAM, "PARAM"),
            (SymFlags::CONSTRUCTOR, "CONSTRUCTOR"),
            (SymFlags::COMPILED, "COMPILED"),
        ] {
            if sym.flags.contains(flag) {
                let _ = write!(out, " {}", label);
            }
        }
        if let Some(ty) = sym.ty {
            let _ = write!(out, " : {}", ty);
        }
        if !sym.params.is_empty() {
            let _ = write!(out, "\n\tArgs:\t{}", sym.params.len());
        }
        if sym.selector != 0 {
            let _ = write!(out, "\n\tSelect:\t{}", sym.selector);
        }
        let _ = write!(out, "\n\tOffset:\t{}\n", sym.offset);
    }

    /// Canonical dotted name of an entry.
    pub fn dump_name(&self, id: SymId, out: &mut String) {
        use std::fmt::Write;
        if let Some(sym) = self.lookup(id) {
            if let Some(parent) = sym.parent {
                self.dump_name(parent, out);
                out.push('.');
            }
            out.push_str(self.interner.resolve(sym.name));
            if sym.occurrence > 0 {
                let _ = write!(out, "${}", sym.occurrence);
            }
        }
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        SymbolTable::new()
    }
}
