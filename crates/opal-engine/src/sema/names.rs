//! Name analysis
//!
//! One recursive pass that resolves identifiers to symbols, detects scope
//! errors, and threads storage allocation (global slots, frame-local
//! slots, temporary slots) through the same traversal.
//!
//! Blocks use a two-sub-pass discipline: function and class declarations
//! are bound first (allowing mutual recursion), then the statements are
//! walked left-to-right. A variable declaration's initialiser is analysed
//! *before* the new binding is added, so `int x = x;` refers to the outer
//! `x`.
//!
//! Member names on the right of `.` resolve through the global selector
//! table, never the lexical environment.

use crate::parser::ast::{Ast, NodeFlags, NodeId, NodeKind, TypeTag, Value};
use crate::parser::interner::Name;
use crate::sema::diag::Diagnostics;
use crate::sema::symtab::{StorageRecord, SymFlags, SymId, SymKind, SymbolTable};
use rustc_hash::FxHashMap;

const PASS: &str = "name";

/// Traversal flags handed down to children (not stored in the table).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Flags {
    /// Resolve names through the selector table
    selector: bool,
    /// `break` / `continue` are legal here
    within_loop: bool,
    /// Direct child of a class body (declarations become members)
    part_of_classdecl: bool,
    /// The node may need a temporary spill slot
    need_storage: bool,
    /// Declarations here are class members
    member: bool,
    /// Declarations here are parameters
    param: bool,
}

/// Storage counters for the symbol currently being analysed.
#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    vars: u16,
    /// High-water mark for frame locals (sibling blocks reuse offsets)
    vars_max: u16,
    fields: u16,
    functions: u16,
    temps: u16,
}

impl Counters {
    fn finish(self) -> StorageRecord {
        StorageRecord {
            vars: self.vars.max(self.vars_max),
            fields: self.fields,
            functions: self.functions,
            temps: self.temps,
        }
    }
}

struct NameAnalysis<'a> {
    ast: &'a mut Ast,
    table: &'a mut SymbolTable,
    diags: &'a mut Diagnostics,
    /// Innermost-last scope stack
    scopes: Vec<FxHashMap<Name, SymId>>,
    classes_nr: usize,
}

/// Run name analysis over the whole program.
///
/// `main_sym` receives the top-level storage record (globals and
/// temporaries of the entry point). Returns the number of classes found;
/// the error count is the growth of `diags`.
pub fn name_analysis(
    ast: &mut Ast,
    root: NodeId,
    table: &mut SymbolTable,
    main_sym: SymId,
    diags: &mut Diagnostics,
) -> usize {
    let mut scopes = vec![FxHashMap::default()];
    // Non-hidden builtin functions are visible at top level
    for sym in table.builtin_symbols() {
        if !sym.flags.contains(SymFlags::HIDDEN) && sym.kind != SymKind::Selector {
            scopes[0].insert(sym.name, sym.id);
        }
    }

    let mut pass = NameAnalysis {
        ast,
        table,
        diags,
        scopes,
        classes_nr: 0,
    };
    let mut counters = Counters::default();
    pass.fixnames(Some(root), None, Flags::default(), &mut counters);

    let classes_nr = pass.classes_nr;
    table.lookup_mut(main_sym).unwrap().storage = counters.finish();
    classes_nr
}

impl<'a> NameAnalysis<'a> {
    fn error(&mut self, node: NodeId, message: impl Into<String>) {
        let line = self.ast.node(node).line;
        self.diags.error(PASS, line, message);
    }

    fn lookup_scopes(&self, name: Name) -> Option<SymId> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(&name).copied())
    }

    /// Rewrite a `NameRef` into an `IdRef` carrying `sym`, preserving flags.
    fn resolve_node(&mut self, node: NodeId, sym: SymId) {
        let n = self.ast.node_mut(node);
        n.kind = NodeKind::IdRef;
        n.value = Some(Value::Id(sym));
        n.sym = Some(sym);
    }

    fn selector_for(&mut self, node: NodeId) -> Option<SymId> {
        match self.ast.node(node).name() {
            Some(name) => Some(self.table.selector(name)),
            None => {
                self.error(node, "member name expected");
                None
            }
        }
    }

    /// Walk all children of `node`, threading the temporary-slot
    /// discipline: every storage-needing child claims one slot, siblings
    /// start above the slots of previous children, and the node's total
    /// is the maximum over its children.
    fn fixnames_children(
        &mut self,
        node: NodeId,
        parent: Option<SymId>,
        mut flags: Flags,
        counters: &mut Counters,
    ) {
        let children = self.ast.node(node).children.clone();
        let mut base_temps = counters.temps;
        let mut max_temps = base_temps;
        let last = children.len().saturating_sub(1);
        for (i, child) in children.iter().enumerate() {
            if i == last {
                // the last argument's value can stay in its register
                flags.need_storage = false;
            }
            counters.temps = base_temps;
            self.fixnames(*child, parent, flags, counters);
            if counters.temps >= max_temps {
                max_temps = counters.temps;
            }
            if flags.need_storage {
                base_temps += 1;
            }
        }
        counters.temps = max_temps;
    }

    /// Bind parameters into a fresh scope, then analyse the body against
    /// the callable's own storage counters (for `FunDef` and `ClassDef`).
    fn fix_with_parameters(&mut self, node: NodeId, mut flags_body: Flags) {
        let name_node = self.ast.child(node, 0).expect("declaration name");
        let Some(sym) = self.ast.node(name_node).sym else {
            // the surrounding block failed to bind this definition
            return;
        };

        self.scopes.push(FxHashMap::default());

        let mut counters = Counters::default();
        let formals = self.ast.child(node, 1).expect("formals");
        let param_flags = Flags {
            param: true,
            ..Flags::default()
        };
        self.fixnames_children(formals, Some(sym), param_flags, &mut counters);

        // Parameters were numbered through the variable counter
        let params_nr = counters.vars;
        counters.vars = 0;

        let formal_children = self.ast.node(formals).children.clone();
        let mut param_types = Vec::with_capacity(params_nr as usize);
        for child in formal_children.iter().flatten() {
            param_types.push(self.ast.node(*child).ty);
        }
        self.table.lookup_mut(sym).unwrap().params = param_types;

        flags_body.within_loop = false;
        flags_body.need_storage = false;
        flags_body.selector = false;
        self.fixnames(self.ast.child(node, 2), Some(sym), flags_body, &mut counters);

        self.table.lookup_mut(sym).unwrap().storage = counters.finish();
        self.scopes.pop();
    }

    fn fixnames(
        &mut self,
        node: Option<NodeId>,
        parent: Option<SymId>,
        mut flags: Flags,
        counters: &mut Counters,
    ) {
        let Some(node) = node else { return };

        let part_of_classdecl = flags.part_of_classdecl;
        if flags.need_storage {
            self.ast.node_mut(node).storage = counters.temps as i32;
        } else {
            self.ast.node_mut(node).storage = -1;
        }
        flags.part_of_classdecl = false;
        flags.need_storage = false;

        let kind = self.ast.node(node).kind;
        match kind {
            NodeKind::IdRef | NodeKind::BuiltinRef => {
                // Only builtin references are pre-resolved at this stage
                if let Some(Value::Id(id)) | Some(Value::Builtin(id)) =
                    self.ast.node(node).value.clone()
                {
                    self.ast.node_mut(node).sym = Some(id);
                }
            }

            NodeKind::NameRef => {
                let lookup = if flags.selector {
                    self.selector_for(node)
                } else {
                    self.ast.node(node).name().and_then(|n| self.lookup_scopes(n))
                };
                match lookup {
                    None => self.error(node, "undefined name"),
                    Some(sym_id) => {
                        let is_cons_arg = self
                            .table
                            .lookup(sym_id)
                            .map(|s| s.is_constructor_param(self.table))
                            .unwrap_or(false);
                        let parent_is_function = parent
                            .and_then(|p| self.table.lookup(p))
                            .map(|p| p.kind == SymKind::Function)
                            .unwrap_or(false);
                        if is_cons_arg && parent_is_function {
                            self.error(
                                node,
                                "must not reference constructor parameter in method body",
                            );
                            return;
                        }
                        self.resolve_node(node, sym_id);
                    }
                }
            }

            NodeKind::FunDef => {
                counters.functions += 1;
                // definitions are managed by the surrounding block
                let mut body = flags;
                body.member = false;
                self.fix_with_parameters(node, body);
                if let Some(name_node) = self.ast.child(node, 0) {
                    self.ast.node_mut(name_node).flags.insert(NodeFlags::DECL);
                }
                return;
            }

            NodeKind::ClassDef => {
                self.classes_nr += 1;
                let mut body = flags;
                body.member = true;
                body.part_of_classdecl = true;
                self.fix_with_parameters(node, body);
                if let Some(name_node) = self.ast.child(node, 0) {
                    self.ast.node_mut(name_node).flags.insert(NodeFlags::DECL);
                }
                return;
            }

            NodeKind::Formals => {
                let mut f = flags;
                f.param = true;
                self.fixnames_children(node, parent, f, counters);
                return;
            }

            NodeKind::VarDecl => {
                // The initialiser sees the environment without the new binding
                self.fixnames(self.ast.child(node, 1), parent, flags, counters);

                let name_node = self.ast.child(node, 0).expect("declared name");
                let selector_sym = if flags.member {
                    self.selector_for(name_node)
                } else {
                    None
                };
                self.ast.node_mut(name_node).flags.insert(NodeFlags::DECL);

                let Some(name) = self.ast.node(name_node).name() else {
                    return;
                };
                let occurrence = self
                    .lookup_scopes(name)
                    .and_then(|id| self.table.lookup(id))
                    .map(|s| s.occurrence + 1)
                    .unwrap_or(0);

                let mut sym_flags = SymFlags::empty();
                if flags.member {
                    sym_flags.insert(SymFlags::MEMBER);
                }
                if flags.param {
                    sym_flags.insert(SymFlags::PARAM);
                }
                let declared_ty = self.ast.node(node).ty;
                let sym = self.table.new_symbol(
                    SymKind::Variable,
                    sym_flags,
                    declared_ty,
                    name,
                    Some(node),
                );
                let offset = if flags.member {
                    let o = counters.fields;
                    counters.fields += 1;
                    o
                } else {
                    let o = counters.vars;
                    counters.vars += 1;
                    o
                };
                let selector = selector_sym.map(|s| self.table.lookup(s).unwrap().selector);
                {
                    let entry = self.table.lookup_mut(sym).unwrap();
                    entry.occurrence = occurrence;
                    entry.parent = parent;
                    entry.offset = offset as i32;
                    if let Some(selector) = selector {
                        entry.selector = selector;
                    }
                }

                self.resolve_node(name_node, sym);
                self.scopes.last_mut().unwrap().insert(name, sym);
                self.ast.node_mut(node).sym = Some(sym);
                return;
            }

            NodeKind::Actuals => {
                // arguments may need spill slots
                let mut f = flags;
                f.need_storage = true;
                self.fixnames_children(node, parent, f, counters);
                return;
            }

            NodeKind::FunApp => {
                let callee = self.ast.child(node, 0);
                let callee_is_member = callee
                    .map(|c| self.ast.node(c).kind == NodeKind::Member)
                    .unwrap_or(false);
                if callee_is_member {
                    // method call: one slot for the method address...
                    if self.ast.node(node).storage < 0 {
                        self.ast.node_mut(node).storage = counters.temps as i32;
                        counters.temps += 1;
                    }
                    // ...and one for the receiver, spilled during argument setup
                    let mut f = flags;
                    f.need_storage = true;
                    self.fixnames(callee, parent, f, counters);
                    counters.temps += 1;
                    self.fixnames(self.ast.child(node, 1), parent, flags, counters);
                } else {
                    if parent.is_some() && self.ast.node(node).storage < 0 {
                        // may turn out to be a method call target; reserve anyway
                        self.ast.node_mut(node).storage = counters.temps as i32;
                        counters.temps += 1;
                    }
                    self.fixnames_children(node, parent, flags, counters);
                }
                return;
            }

            NodeKind::While => {
                flags.within_loop = true;
            }

            NodeKind::Continue => {
                if !flags.within_loop {
                    self.error(node, "'continue' outside of loop");
                }
            }

            NodeKind::Break => {
                if !flags.within_loop {
                    self.error(node, "'break' outside of loop");
                }
            }

            NodeKind::Member => {
                self.fixnames(self.ast.child(node, 0), parent, flags, counters);
                let mut f = flags;
                f.selector = true;
                self.fixnames(self.ast.child(node, 1), parent, f, counters);
                return;
            }

            NodeKind::Assign => {
                // the rhs is computed first, so it may need a spill slot
                let base_temps = counters.temps;
                let mut f = flags;
                f.need_storage = true;
                self.fixnames(self.ast.child(node, 1), parent, f, counters);
                let max_temps = counters.temps;
                counters.temps = base_temps;
                self.fixnames(self.ast.child(node, 0), parent, flags, counters);
                counters.temps = counters.temps.max(max_temps);
                return;
            }

            NodeKind::ArraySub => {
                self.fixnames(self.ast.child(node, 1), parent, flags, counters);
                self.fixnames(self.ast.child(node, 0), parent, flags, counters);
                return;
            }

            NodeKind::ArrayVal => {
                // the array base stays spilled while elements are filled in
                if self.ast.node(node).storage < 0 {
                    self.ast.node_mut(node).storage = counters.temps as i32;
                    counters.temps += 1;
                }
                self.fixnames(self.ast.child(node, 0), parent, flags, counters);
                self.fixnames(self.ast.child(node, 1), parent, flags, counters);
                return;
            }

            NodeKind::Block => {
                self.scopes.push(FxHashMap::default());
                let in_function = parent.is_some();
                let base_vars = counters.vars;

                // First sub-pass: bind functions and classes for mutual recursion
                let children = self.ast.node(node).children.clone();
                let mut methods_nr = 0;
                for child in children.iter().flatten() {
                    let child = *child;
                    let child_kind = self.ast.node(child).kind;
                    let sym = match child_kind {
                        NodeKind::FunDef => {
                            let name_node = self.ast.child(child, 0).expect("function name");
                            if parent.is_some() && !flags.member {
                                self.error(name_node, "nested functions are not permitted");
                            }
                            let Some(name) = self.ast.node(name_node).name() else {
                                continue;
                            };
                            let mut sym_flags = SymFlags::empty();
                            if flags.member {
                                sym_flags.insert(SymFlags::MEMBER);
                            }
                            let ret_ty = self.ast.node(child).ty;
                            let sym = self.table.new_symbol(
                                SymKind::Function,
                                sym_flags,
                                ret_ty,
                                name,
                                Some(child),
                            );
                            if flags.member {
                                let selector_sym = self.table.selector(name);
                                let selector = self.table.lookup(selector_sym).unwrap().selector;
                                let entry = self.table.lookup_mut(sym).unwrap();
                                entry.selector = selector;
                                entry.offset = methods_nr;
                                entry.parent = parent;
                                methods_nr += 1;
                            }
                            Some((sym, name, name_node))
                        }
                        NodeKind::ClassDef => {
                            let name_node = self.ast.child(child, 0).expect("class name");
                            if parent.is_some() {
                                self.error(name_node, "nested classes are not permitted");
                            }
                            let Some(name) = self.ast.node(name_node).name() else {
                                continue;
                            };
                            let sym = self.table.new_symbol(
                                SymKind::Class,
                                SymFlags::empty(),
                                Some(TypeTag::Obj),
                                name,
                                Some(child),
                            );
                            Some((sym, name, name_node))
                        }
                        _ => None,
                    };

                    if let Some((sym, name, name_node)) = sym {
                        if self.scopes.last().unwrap().contains_key(&name) {
                            self.error(
                                name_node,
                                "multiple recursive definitions with identical name",
                            );
                        }
                        self.scopes.last_mut().unwrap().insert(name, sym);
                        self.resolve_node(name_node, sym);
                    }
                }

                // Nested declarations become part of the constructor body,
                // not class members
                let mut body_flags = flags;
                if !part_of_classdecl {
                    body_flags.member = false;
                }

                self.fixnames_children(node, parent, body_flags, counters);
                self.scopes.pop();
                self.ast.node_mut(node).storage = counters.temps as i32;

                // Sibling blocks inside a function reuse local slots
                if in_function {
                    counters.vars_max = counters.vars_max.max(counters.vars);
                    counters.vars = base_vars;
                }
                return;
            }

            _ => {}
        }

        self.fixnames_children(node, parent, flags, counters);
    }
}
