//! Type analysis
//!
//! The second semantic pass. It assigns a type to every expression,
//! synthesises explicit `__convert` applications wherever a value of one
//! type flows into a position of another, rewrites method calls from
//! `FunApp(Member(..), args)` into `MethodApp` nodes, rewrites `is`
//! tests, and synthesises one constructor function per class:
//!
//! ```text
//! self := __allocate(class-id);
//! self.field := <initialiser>;   // per initialised field, in order
//! <other class-body statements>  // moved out of the class body
//! return self;
//! ```
//!
//! Floating-point literals are rejected here; the `Real` tag stays
//! reserved for them.

use crate::options::CompilerOptions;
use crate::parser::ast::{Ast, AstNode, NodeFlags, NodeId, NodeKind, TypeTag, Value};
use crate::sema::diag::Diagnostics;
use crate::sema::symtab::{builtin_ids, SymFlags, SymId, SymKind, SymbolTable};

const PASS: &str = "type";

/// Callables and classes discovered by the pass, in compilation order.
#[derive(Debug, Default)]
pub struct TypedProgram {
    /// Top-level functions and synthesised constructors
    pub callables: Vec<NodeId>,
    /// Class definitions
    pub classes: Vec<NodeId>,
}

struct TypeAnalysis<'a> {
    ast: &'a mut Ast,
    table: &'a mut SymbolTable,
    diags: &'a mut Diagnostics,
    options: &'a CompilerOptions,
    program: TypedProgram,
}

/// Run type analysis over the whole program.
pub fn type_analysis(
    ast: &mut Ast,
    root: NodeId,
    table: &mut SymbolTable,
    options: &CompilerOptions,
    diags: &mut Diagnostics,
) -> TypedProgram {
    let mut pass = TypeAnalysis {
        ast,
        table,
        diags,
        options,
        program: TypedProgram::default(),
    };
    pass.analyse(root, None, None);
    pass.program
}

impl<'a> TypeAnalysis<'a> {
    fn error(&mut self, node: NodeId, message: impl Into<String>) {
        let line = self.ast.node(node).line;
        self.diags.error(PASS, line, message);
    }

    fn node_ty(&self, node: NodeId) -> Option<TypeTag> {
        self.ast.node(node).ty
    }

    fn set_ty(&mut self, node: NodeId, ty: TypeTag) {
        self.ast.node_mut(node).ty = Some(ty);
    }

    /// Mark `node` as an assignment target, rejecting non-lvalues.
    fn require_lvalue(&mut self, node: Option<NodeId>, is_declaration: bool) -> Option<NodeId> {
        let _ = is_declaration;
        let node = node?;
        match self.ast.node(node).kind {
            NodeKind::IdRef | NodeKind::Member | NodeKind::ArraySub => {}
            _ => self.error(node, "attempted assignment to non-lvalue"),
        }
        self.ast.node_mut(node).flags.insert(NodeFlags::LVALUE);
        Some(node)
    }

    /// Coerce `node` to `ty`, synthesising a `__convert` wrapper when the
    /// types differ. An untyped node (member access) adopts the requested
    /// type; an unconstrained position (`ty == None`) accepts anything.
    fn require_type(&mut self, node: Option<NodeId>, ty: Option<TypeTag>) -> Option<NodeId> {
        let node = node?;
        let current = self.node_ty(node);

        let Some(current) = current else {
            // member access: adopt the requested type, object by default
            self.ast.node_mut(node).ty = Some(ty.unwrap_or(TypeTag::Obj));
            return Some(node);
        };
        let Some(ty) = ty else {
            return Some(node);
        };
        // no conversion involves floats; reject them before they reach
        // the code generator
        if current == TypeTag::Real || ty == TypeTag::Real {
            self.error(node, "Floating point numbers are not presently supported");
            return Some(node);
        }
        if current == ty {
            return Some(node);
        }

        let line = self.ast.node(node).line;
        let mut fun = AstNode::value(
            NodeKind::BuiltinRef,
            line,
            Value::Builtin(builtin_ids::OP_CONVERT),
        );
        fun.sym = Some(builtin_ids::OP_CONVERT);
        fun.ty = Some(ty);
        let fun = self.ast.add(fun);
        let actuals = self
            .ast
            .add(AstNode::new(NodeKind::Actuals, line, vec![Some(node)]));
        let mut conversion = AstNode::new(NodeKind::FunApp, line, vec![Some(fun), Some(actuals)]);
        conversion.ty = Some(ty);
        Some(self.ast.add(conversion))
    }

    fn analyse(
        &mut self,
        node: NodeId,
        mut classref: Option<SymId>,
        mut function: Option<SymId>,
    ) -> NodeId {
        let kind = self.ast.node(node).kind;

        if !kind.is_value() {
            match kind {
                NodeKind::ClassDef => classref = self.ast.child(node, 0).and_then(|n| self.ast.node(n).sym),
                NodeKind::FunDef => function = self.ast.child(node, 0).and_then(|n| self.ast.node(n).sym),
                _ => {}
            }
            let children_nr = self.ast.node(node).children.len();
            for i in 0..children_nr {
                if let Some(child) = self.ast.child(node, i) {
                    let new_child = self.analyse(child, classref, function);
                    self.ast.set_child(node, i, Some(new_child));
                }
            }
        }

        match kind {
            NodeKind::IntLit => self.set_ty(node, TypeTag::Int),
            NodeKind::StrLit => self.set_ty(node, TypeTag::Obj),
            NodeKind::RealLit => {
                self.error(node, "Floating point numbers are not presently supported")
            }

            NodeKind::IdRef => {
                if let Some(sym_id) = self.ast.node(node).sym {
                    let (sym_ty, is_cons_arg) = {
                        let sym = self.table.lookup(sym_id).unwrap();
                        (sym.ty, sym.is_constructor_param(self.table))
                    };
                    if let Some(ty) = sym_ty {
                        self.set_ty(node, ty);
                    }
                    if function.is_some() && is_cons_arg {
                        let in_constructor = function
                            .and_then(|f| self.table.lookup(f))
                            .map(|f| f.flags.contains(SymFlags::CONSTRUCTOR))
                            .unwrap_or(false);
                        if !in_constructor {
                            self.error(
                                node,
                                "Method bodies must not reference class constructor arguments",
                            );
                        }
                    }
                }
            }

            NodeKind::Null => self.set_ty(node, TypeTag::Obj),

            NodeKind::FunApp => return self.analyse_funapp(node, classref, function),

            NodeKind::FunDef => {
                if classref.is_some() {
                    self.unpack_method_formals(node, function);
                } else {
                    self.program.callables.push(node);
                }
            }

            NodeKind::ClassDef => self.synthesise_constructor(node),

            NodeKind::Return => {
                let Some(function) = function else {
                    self.error(node, "`return' outside of a function body");
                    return node;
                };
                if classref.is_some() {
                    // methods return the canonical boxed type
                    let ret = self.options.method_call_return_type;
                    self.table.lookup_mut(function).unwrap().ty = Some(ret);
                }
                let ret_ty = self.table.lookup(function).unwrap().ty;
                let coerced = self.require_type(self.ast.child(node, 0), ret_ty);
                self.ast.set_child(node, 0, coerced);
            }

            NodeKind::IsPrimTy => {
                let child = self.ast.child(node, 0).expect("`is` operand");
                let tested = self.node_ty(node);
                match tested.map(TypeTag::canonical) {
                    Some(TypeTag::Obj) => {
                        // trivially true
                        let n = self.ast.node_mut(node);
                        n.kind = NodeKind::IntLit;
                        n.value = Some(Value::Int(1));
                        n.children = Vec::new();
                        n.ty = Some(TypeTag::Int);
                    }
                    Some(TypeTag::Int) => {
                        let line = self.ast.node(node).line;
                        let coerced = self.require_type(Some(child), Some(TypeTag::Obj));
                        let mut class_node = AstNode::value(
                            NodeKind::IdRef,
                            line,
                            Value::Id(builtin_ids::CLASS_INT),
                        );
                        class_node.sym = Some(builtin_ids::CLASS_INT);
                        let class_node = self.ast.add(class_node);
                        let n = self.ast.node_mut(node);
                        n.kind = NodeKind::IsInstance;
                        n.children = vec![coerced, Some(class_node)];
                        n.ty = Some(TypeTag::Int);
                    }
                    _ => self.error(node, "unsupported builtin type in `is`"),
                }
            }

            NodeKind::IsInstance => {
                if let Some(class_sym) = self
                    .ast
                    .child(node, 1)
                    .and_then(|n| self.ast.node(n).sym)
                {
                    let (kind, name) = {
                        let sym = self.table.lookup(class_sym).unwrap();
                        (sym.kind, self.table.interner.resolve(sym.name).to_string())
                    };
                    if kind != SymKind::Class {
                        self.error(node, format!("`is` on non-class ({})", name));
                    }
                } // otherwise name analysis already reported an error

                let coerced = self.require_type(self.ast.child(node, 0), Some(TypeTag::Obj));
                self.ast.set_child(node, 0, coerced);
                self.set_ty(node, TypeTag::Int);
            }

            NodeKind::VarDecl | NodeKind::Assign => {
                let lhs_ty = self.ast.child(node, 0).and_then(|c| self.node_ty(c));
                let coerced = self.require_type(self.ast.child(node, 1), lhs_ty);
                self.ast.set_child(node, 1, coerced);
                self.require_lvalue(self.ast.child(node, 0), kind == NodeKind::VarDecl);
            }

            NodeKind::ArrayList => {
                let storage_ty = self.options.array_storage_type;
                let children_nr = self.ast.node(node).children.len();
                for i in 0..children_nr {
                    let coerced = self.require_type(self.ast.child(node, i), Some(storage_ty));
                    self.ast.set_child(node, i, coerced);
                }
            }

            NodeKind::ArrayVal => {
                let coerced = self.require_type(self.ast.child(node, 1), Some(TypeTag::Int));
                self.ast.set_child(node, 1, coerced);
                self.set_ty(node, TypeTag::Obj);
            }

            NodeKind::ArraySub => {
                let receiver_ty = self.ast.child(node, 0).and_then(|c| self.node_ty(c));
                if matches!(receiver_ty, Some(TypeTag::Int) | Some(TypeTag::Real)) {
                    self.error(node, "array subscription must be on object, not number");
                }
                let receiver = self.require_type(self.ast.child(node, 0), Some(TypeTag::Obj));
                self.ast.set_child(node, 0, receiver);
                let index = self.require_type(self.ast.child(node, 1), Some(TypeTag::Int));
                self.ast.set_child(node, 1, index);
                self.set_ty(node, self.options.array_storage_type);
            }

            NodeKind::While | NodeKind::If => {
                let cond = self.require_type(self.ast.child(node, 0), Some(TypeTag::Int));
                self.ast.set_child(node, 0, cond);
            }

            _ => {}
        }

        node
    }

    /// `FunApp` dispatch: plain call, instantiation, or method call.
    fn analyse_funapp(
        &mut self,
        node: NodeId,
        _classref: Option<SymId>,
        _function: Option<SymId>,
    ) -> NodeId {
        let callee = self.ast.child(node, 0).expect("callee");
        let callee_kind = self.ast.node(callee).kind;

        if callee_kind == NodeKind::Member {
            // Method call: rewrite to MethodApp(receiver, selector, actuals)
            let receiver = self.ast.child(callee, 0).expect("receiver");
            let selector_node = self.ast.child(callee, 1).expect("selector");
            let actuals = self.ast.child(node, 1).expect("actuals");
            self.ast.node_mut(node).sym = self.ast.node(selector_node).sym;

            let param_ty = self.options.method_call_param_type;
            let args_nr = self.ast.node(actuals).children.len();
            for i in 0..args_nr {
                let coerced = self.require_type(self.ast.child(actuals, i), Some(param_ty));
                self.ast.set_child(actuals, i, coerced);
            }

            if matches!(
                self.node_ty(receiver),
                Some(TypeTag::Int) | Some(TypeTag::Real)
            ) {
                self.error(node, "method receiver must be an object");
            }
            let receiver = self
                .require_type(Some(receiver), Some(TypeTag::Obj))
                .unwrap();

            // the receiver's spill slot was claimed on the member node
            let receiver_slot = self.ast.node(callee).storage;
            self.ast.node_mut(selector_node).storage = receiver_slot;

            let ret_ty = self.options.method_call_return_type;
            let n = self.ast.node_mut(node);
            n.kind = NodeKind::MethodApp;
            n.children = vec![Some(receiver), Some(selector_node), Some(actuals)];
            n.ty = Some(ret_ty);
            return node;
        }

        if !matches!(callee_kind, NodeKind::IdRef | NodeKind::BuiltinRef) {
            self.error(node, "calls only permitted on functions and methods!");
            return node;
        }

        let Some(fun) = self.ast.node(callee).sym else {
            // should only happen after a name-analysis failure
            self.error(node, "(internal) unresolved callee");
            return node;
        };

        let (fun_kind, fun_ty, fun_params, fun_name) = {
            let sym = self.table.lookup(fun).unwrap();
            (
                sym.kind,
                sym.ty,
                sym.params.clone(),
                self.table.interner.resolve(sym.name).to_string(),
            )
        };

        match fun_kind {
            SymKind::Class => {
                self.ast.node_mut(node).kind = NodeKind::NewInstance;
            }
            SymKind::Function => {}
            _ => {
                self.error(
                    node,
                    format!("Attempt to call non-function/non-class `{}`", fun_name),
                );
                return node;
            }
        }
        self.ast.node_mut(node).sym = Some(fun);

        let actuals = self.ast.child(node, 1).expect("actuals");
        let actuals_nr = self.ast.node(actuals).children.len();
        if actuals_nr != fun_params.len() {
            self.error(
                node,
                format!(
                    "expected {} parameters, found {}",
                    fun_params.len(),
                    actuals_nr
                ),
            );
        }

        for (i, expected) in fun_params.iter().enumerate().take(actuals_nr) {
            let coerced = self.require_type(self.ast.child(actuals, i), *expected);
            self.ast.set_child(actuals, i, coerced);
        }

        if let Some(ty) = fun_ty {
            self.set_ty(node, ty);
        }
        node
    }

    /// Methods receive every argument in the canonical parameter type;
    /// formals declared with a different type are unpacked on entry by a
    /// prepended `formal := convert(formal)` assignment.
    fn unpack_method_formals(&mut self, node: NodeId, function: Option<SymId>) {
        let Some(function) = function else { return };
        let param_ty = self.options.method_call_param_type;
        let params = self.table.lookup(function).unwrap().params.clone();

        let formals = self.ast.child(node, 1).expect("formals");
        let formal_children = self.ast.node(formals).children.clone();

        let mut unpacks = Vec::new();
        for (i, declared) in params.iter().enumerate() {
            let Some(declared) = *declared else { continue };
            if declared == param_ty {
                continue;
            }
            let Some(Some(formal)) = formal_children.get(i).copied() else {
                continue;
            };
            let Some(param_sym) = self
                .ast
                .child(formal, 0)
                .and_then(|n| self.ast.node(n).sym)
            else {
                continue;
            };
            let line = self.ast.node(formal).line;

            // lhs: the declared view of the parameter
            let mut lhs = AstNode::value(NodeKind::IdRef, line, Value::Id(param_sym));
            lhs.sym = Some(param_sym);
            lhs.ty = Some(declared);
            lhs.flags.insert(NodeFlags::LVALUE);
            let lhs = self.ast.add(lhs);

            // rhs: the raw incoming value, viewed with the canonical type
            let mut raw = AstNode::value(NodeKind::IdRef, line, Value::Id(param_sym));
            raw.sym = Some(param_sym);
            raw.ty = Some(param_ty);
            let raw = self.ast.add(raw);
            let rhs = self.require_type(Some(raw), Some(declared));

            let mut assign = AstNode::new(NodeKind::Assign, line, vec![Some(lhs), rhs]);
            assign.ty = Some(declared);
            unpacks.push(Some(self.ast.add(assign)));
        }

        if unpacks.is_empty() {
            return;
        }

        let body = self.ast.child(node, 2).expect("method body");
        let line = self.ast.node(body).line;
        unpacks.push(Some(body));
        let init_body = self.ast.add(AstNode::new(NodeKind::Block, line, unpacks));
        self.ast.set_child(node, 2, Some(init_body));
    }

    /// Build the class's constructor function and re-shape the class body
    /// so fields come first and methods last.
    fn synthesise_constructor(&mut self, node: NodeId) {
        self.program.classes.push(node);

        let Some(class_sym) = self.ast.child(node, 0).and_then(|n| self.ast.node(n).sym) else {
            return;
        };
        self.ast.node_mut(node).sym = Some(class_sym);

        let line = self.ast.node(node).line;
        let body = self.ast.child(node, 2).expect("class body");
        let body_children = self.ast.node(body).children.clone();

        let mut cons_body = Vec::new();

        // self := __allocate(class-id)
        let self_lhs = self.self_ref(line, true);
        let class_id_lit = self.ast.add({
            let mut n = AstNode::value(NodeKind::IntLit, line, Value::Int(class_sym.raw() as i64));
            n.ty = Some(TypeTag::Int);
            n
        });
        let mut alloc_fun = AstNode::value(
            NodeKind::BuiltinRef,
            line,
            Value::Builtin(builtin_ids::OP_ALLOCATE),
        );
        alloc_fun.sym = Some(builtin_ids::OP_ALLOCATE);
        alloc_fun.ty = Some(TypeTag::Obj);
        let alloc_fun = self.ast.add(alloc_fun);
        let alloc_actuals = self.ast.add(AstNode::new(
            NodeKind::Actuals,
            line,
            vec![Some(class_id_lit)],
        ));
        let mut alloc_call = AstNode::new(
            NodeKind::FunApp,
            line,
            vec![Some(alloc_fun), Some(alloc_actuals)],
        );
        alloc_call.ty = Some(TypeTag::Obj);
        let alloc_call = self.ast.add(alloc_call);
        let self_init = self.ast.add(AstNode::new(
            NodeKind::Assign,
            line,
            vec![Some(self_lhs), Some(alloc_call)],
        ));
        cons_body.push(Some(self_init));

        // Field initialisers and loose statements, in source order
        let mut fields = Vec::new();
        let mut methods = Vec::new();
        for child in body_children.iter().flatten() {
            let child = *child;
            match self.ast.node(child).kind {
                NodeKind::FunDef => methods.push(Some(child)),
                NodeKind::VarDecl => {
                    if let Some(init) = self.ast.set_child(child, 1, None) {
                        let field_sym = self.ast.node(child).sym;
                        let field_ty = self.ast.node(child).ty;
                        let fline = self.ast.node(child).line;

                        let receiver = self.self_ref(fline, false);
                        let mut field_ref = AstNode::value(
                            NodeKind::IdRef,
                            fline,
                            Value::Id(field_sym.expect("field symbol")),
                        );
                        field_ref.sym = field_sym;
                        field_ref.ty = field_ty;
                        let field_ref = self.ast.add(field_ref);

                        let mut member = AstNode::new(
                            NodeKind::Member,
                            fline,
                            vec![Some(receiver), Some(field_ref)],
                        );
                        member.ty = field_ty;
                        member.flags.insert(NodeFlags::LVALUE);
                        let member = self.ast.add(member);

                        let assign = self.ast.add(AstNode::new(
                            NodeKind::Assign,
                            fline,
                            vec![Some(member), Some(init)],
                        ));
                        cons_body.push(Some(assign));
                    }
                    fields.push(Some(child));
                }
                _ => cons_body.push(Some(child)),
            }
        }

        // return self
        let self_ret = self.self_ref(line, false);
        let ret = self
            .ast
            .add(AstNode::new(NodeKind::Return, line, vec![Some(self_ret)]));
        cons_body.push(Some(ret));

        let cons_body_node = self.ast.add(AstNode::new(NodeKind::Block, line, cons_body));

        // Constructor symbol: parameters and storage mirror the class
        let (class_name, class_params, class_storage) = {
            let sym = self.table.lookup(class_sym).unwrap();
            (sym.name, sym.params.clone(), sym.storage)
        };
        let cons_sym = self.table.new_symbol(
            SymKind::Function,
            SymFlags::CONSTRUCTOR,
            Some(TypeTag::Obj),
            class_name,
            None,
        );
        {
            let entry = self.table.lookup_mut(cons_sym).unwrap();
            entry.parent = Some(class_sym);
            entry.params = class_params;
            entry.storage = class_storage;
        }
        self.table.lookup_mut(class_sym).unwrap().constructor = Some(cons_sym);

        let mut cons_name = AstNode::value(NodeKind::IdRef, line, Value::Id(cons_sym));
        cons_name.sym = Some(cons_sym);
        cons_name.flags.insert(NodeFlags::DECL);
        let cons_name = self.ast.add(cons_name);
        let formals_clone = {
            let formals = self.ast.child(node, 1).expect("class formals");
            self.ast.clone_subtree(formals)
        };
        let mut constructor = AstNode::new(
            NodeKind::FunDef,
            line,
            vec![Some(cons_name), Some(formals_clone), Some(cons_body_node)],
        );
        constructor.ty = Some(TypeTag::Obj);
        constructor.sym = Some(cons_sym);
        let constructor = self.ast.add(constructor);
        self.table.lookup_mut(cons_sym).unwrap().astref = Some(constructor);
        self.ast.set_child(node, 3, Some(constructor));
        self.program.callables.push(constructor);

        // New class body: fields first, then methods
        let new_len = fields.len() + methods.len();
        fields.extend(methods);
        debug_assert_eq!(fields.len(), new_len);
        let new_body = self.ast.add(AstNode::new(NodeKind::Block, line, fields));
        self.ast.set_child(node, 2, Some(new_body));
    }

    /// A resolved reference to the hidden `self` builtin.
    fn self_ref(&mut self, line: u32, lvalue: bool) -> NodeId {
        let mut n = AstNode::value(NodeKind::IdRef, line, Value::Id(builtin_ids::OP_SELF));
        n.sym = Some(builtin_ids::OP_SELF);
        n.ty = Some(TypeTag::Obj);
        if lvalue {
            n.flags.insert(NodeFlags::LVALUE);
        }
        self.ast.add(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{Lexer, Parser};
    use crate::sema::names::name_analysis;

    fn analyse(src: &str) -> (Ast, NodeId, SymbolTable, TypedProgram, Diagnostics) {
        let mut table = SymbolTable::new();
        let lexer = Lexer::tokenize(src, &mut table.interner).expect("lex");
        let mut ast = Ast::new();
        let root = Parser::new(&lexer, &mut ast, &table.interner)
            .parse_program()
            .expect("parse");
        let main_name = table.interner.intern("<main>");
        let main_sym = table.new_symbol(
            SymKind::Function,
            SymFlags::HIDDEN,
            None,
            main_name,
            Some(root),
        );
        let mut diags = Diagnostics::new();
        name_analysis(&mut ast, root, &mut table, main_sym, &mut diags);
        assert!(diags.is_empty(), "name analysis failed: {:?}", diags);
        let options = CompilerOptions::default();
        let program = type_analysis(&mut ast, root, &mut table, &options, &mut diags);
        (ast, root, table, program, diags)
    }

    fn is_convert(ast: &Ast, node: NodeId) -> bool {
        ast.node(node).kind == NodeKind::FunApp
            && ast
                .child(node, 0)
                .map(|c| ast.node(c).sym == Some(builtin_ids::OP_CONVERT))
                .unwrap_or(false)
    }

    #[test]
    fn test_int_to_obj_conversion_synthesised() {
        // print takes obj; 3+4 is int, so a convert wrapper appears
        let (ast, root, _, _, diags) = analyse("print(3+4);");
        assert!(diags.is_empty());
        let call = ast.child(root, 0).unwrap();
        let actuals = ast.child(call, 1).unwrap();
        let arg = ast.child(actuals, 0).unwrap();
        assert!(is_convert(&ast, arg));
        assert_eq!(ast.node(arg).ty, Some(TypeTag::Obj));
    }

    #[test]
    fn test_no_conversion_when_types_match() {
        let (ast, root, _, _, diags) = analyse("int x = 3; int y = x;");
        assert!(diags.is_empty());
        let decl = ast.child(root, 1).unwrap();
        let init = ast.child(decl, 1).unwrap();
        assert!(!is_convert(&ast, init));
        assert_eq!(ast.node(init).kind, NodeKind::IdRef);
    }

    #[test]
    fn test_conversion_exactly_when_types_differ() {
        // obj := int and int := obj both convert; obj := obj does not
        let (ast, root, _, _, diags) = analyse("obj a = 3; int b = a; obj c = a;");
        assert!(diags.is_empty());
        let a = ast.child(root, 0).unwrap();
        assert!(is_convert(&ast, ast.child(a, 1).unwrap()));
        let b = ast.child(root, 1).unwrap();
        assert!(is_convert(&ast, ast.child(b, 1).unwrap()));
        let c = ast.child(root, 2).unwrap();
        assert!(!is_convert(&ast, ast.child(c, 1).unwrap()));
    }

    #[test]
    fn test_float_rejected() {
        let (_, _, _, _, diags) = analyse("obj x = 1.5;");
        assert_eq!(diags.len(), 1);
        assert!(diags.iter().next().unwrap().message.contains("Floating point"));
    }

    #[test]
    fn test_real_declaration_rejected_at_use() {
        // the reserved `real` type cannot flow anywhere
        let (_, _, _, _, diags) = analyse("real x = 1;");
        assert!(diags.iter().any(|d| d.message.contains("Floating point")));
    }

    #[test]
    fn test_arity_mismatch() {
        let (_, _, _, _, diags) = analyse("int f(int a) { return a; } f(1, 2);");
        assert!(diags
            .iter()
            .any(|d| d.message.contains("expected 1 parameters, found 2")));
    }

    #[test]
    fn test_method_call_rewritten() {
        let (ast, root, _, _, diags) = analyse("obj a = null; a.p(1);");
        assert!(diags.is_empty());
        let call = ast.child(root, 1).unwrap();
        assert_eq!(ast.node(call).kind, NodeKind::MethodApp);
        assert_eq!(ast.node(call).ty, Some(TypeTag::Obj));
        // arguments are coerced to the canonical method parameter type
        let actuals = ast.child(call, 2).unwrap();
        let arg = ast.child(actuals, 0).unwrap();
        assert!(is_convert(&ast, arg));
    }

    #[test]
    fn test_class_call_becomes_new_instance() {
        let (ast, root, _, _, diags) = analyse("class C() { int x = 17; } obj a = C();");
        assert!(diags.is_empty());
        let decl = ast.child(root, 1).unwrap();
        let init = ast.child(decl, 1).unwrap();
        assert_eq!(ast.node(init).kind, NodeKind::NewInstance);
        assert_eq!(ast.node(init).ty, Some(TypeTag::Obj));
    }

    #[test]
    fn test_constructor_synthesised() {
        let (ast, root, table, program, diags) = analyse("class C() { int x = 17; }");
        assert!(diags.is_empty());
        assert_eq!(program.classes.len(), 1);
        // main has no functions, so the only callable is the constructor
        assert_eq!(program.callables.len(), 1);

        let classdef = ast.child(root, 0).unwrap();
        let constructor = ast.child(classdef, 3).expect("constructor attached");
        assert_eq!(ast.node(constructor).kind, NodeKind::FunDef);

        let cons_sym = ast.node(constructor).sym.unwrap();
        let cons = table.lookup(cons_sym).unwrap();
        assert!(cons.flags.contains(SymFlags::CONSTRUCTOR));
        assert_eq!(cons.kind, SymKind::Function);

        // body: self := allocate, self.x := 17, return self
        let body = ast.child(constructor, 2).unwrap();
        let stmts: Vec<NodeId> = ast.node(body).children.iter().flatten().copied().collect();
        assert_eq!(stmts.len(), 3);
        assert_eq!(ast.node(stmts[0]).kind, NodeKind::Assign);
        assert_eq!(ast.node(stmts[1]).kind, NodeKind::Assign);
        assert_eq!(ast.node(stmts[2]).kind, NodeKind::Return);
        // the field write goes through a member lvalue on self
        let member = ast.child(stmts[1], 0).unwrap();
        assert_eq!(ast.node(member).kind, NodeKind::Member);
        assert!(ast.node(member).is_lvalue());
    }

    #[test]
    fn test_class_body_reordered_fields_then_methods() {
        let (ast, root, _, _, diags) =
            analyse("class C() { obj m() { return null; } int x = 1; }");
        assert!(diags.is_empty());
        let classdef = ast.child(root, 0).unwrap();
        let body = ast.child(classdef, 2).unwrap();
        let kinds: Vec<NodeKind> = ast
            .node(body)
            .children
            .iter()
            .flatten()
            .map(|c| ast.node(*c).kind)
            .collect();
        assert_eq!(kinds, vec![NodeKind::VarDecl, NodeKind::FunDef]);
    }

    #[test]
    fn test_is_int_on_literal() {
        let (ast, root, _, _, diags) = analyse("if (1 is int) print(1);");
        assert!(diags.is_empty());
        let iff = ast.child(root, 0).unwrap();
        let cond = ast.child(iff, 0).unwrap();
        assert_eq!(ast.node(cond).kind, NodeKind::IsInstance);
        // operand boxed to obj for the class test
        let operand = ast.child(cond, 0).unwrap();
        assert!(is_convert(&ast, operand));
    }

    #[test]
    fn test_is_obj_constant_folds() {
        let (ast, root, _, _, diags) = analyse("obj a = null; if (a is obj) print(1);");
        assert!(diags.is_empty());
        let iff = ast.child(root, 1).unwrap();
        let cond = ast.child(iff, 0).unwrap();
        assert_eq!(ast.node(cond).kind, NodeKind::IntLit);
        assert_eq!(ast.node(cond).value, Some(Value::Int(1)));
    }

    #[test]
    fn test_assign_to_non_lvalue() {
        let (_, _, _, _, diags) = analyse("1 := 2;");
        assert!(diags
            .iter()
            .any(|d| d.message.contains("non-lvalue")));
    }

    #[test]
    fn test_return_outside_function() {
        let (_, _, _, _, diags) = analyse("return 1;");
        assert!(diags
            .iter()
            .any(|d| d.message.contains("outside of a function body")));
    }

    #[test]
    fn test_condition_coerced_to_int() {
        let (ast, root, _, _, diags) = analyse("obj a = null; while (a) print(1);");
        assert!(diags.is_empty());
        let wh = ast.child(root, 1).unwrap();
        let cond = ast.child(wh, 0).unwrap();
        assert!(is_convert(&ast, cond));
        assert_eq!(ast.node(cond).ty, Some(TypeTag::Int));
    }

    #[test]
    fn test_method_formal_unpacking() {
        // p's formal is declared int but methods receive obj arguments;
        // the body gains an unpacking assignment
        let (ast, root, _, _, diags) =
            analyse("class C() { obj p(int x) { print(x); } }");
        assert!(diags.is_empty());
        let classdef = ast.child(root, 0).unwrap();
        let body = ast.child(classdef, 2).unwrap();
        let method = ast
            .node(body)
            .children
            .iter()
            .flatten()
            .copied()
            .find(|c| ast.node(*c).kind == NodeKind::FunDef)
            .unwrap();
        let method_body = ast.child(method, 2).unwrap();
        let first = ast.child(method_body, 0).unwrap();
        assert_eq!(ast.node(first).kind, NodeKind::Assign);
        let rhs = ast.child(first, 1).unwrap();
        assert!(is_convert(&ast, rhs));
        assert_eq!(ast.node(rhs).ty, Some(TypeTag::Int));
    }

    #[test]
    fn test_array_subscript_types() {
        let (ast, root, _, _, diags) = analyse("obj a = [1, 7]; int x = a[1];");
        assert!(diags.is_empty());
        let decl = ast.child(root, 1).unwrap();
        let init = ast.child(decl, 1).unwrap();
        // a[1] : obj (default array storage), converted to int
        assert!(is_convert(&ast, init));
        let sub = ast.child(ast.child(init, 1).unwrap(), 0).unwrap();
        assert_eq!(ast.node(sub).kind, NodeKind::ArraySub);
        assert_eq!(ast.node(sub).ty, Some(TypeTag::Obj));
    }
}
