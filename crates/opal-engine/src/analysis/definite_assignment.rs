//! Definite-assignment analysis
//!
//! Forward must-analysis over the locals of one callable: a variable is
//! definitely assigned at a point if every path from entry assigns it.
//! Reads of possibly-unassigned variables are reported as data-flow
//! errors (once per variable), which block compilation.

use crate::analysis::bitset::BitSet;
use crate::analysis::cfg::Cfg;
use crate::analysis::dataflow::{solve, DataFlowAnalysis};
use crate::parser::ast::{Ast, NodeId, NodeKind};
use crate::sema::diag::Diagnostics;
use crate::sema::symtab::{SymId, SymbolTable};
use rustc_hash::FxHashMap;

const PASS: &str = "data-flow";

struct DefiniteAssignment {
    locals: FxHashMap<SymId, usize>,
}

impl DefiniteAssignment {
    /// The local-variable index of a direct identifier node, if any.
    fn local_of(&self, ast: &Ast, node: NodeId) -> Option<usize> {
        if ast.node(node).kind != NodeKind::IdRef {
            return None;
        }
        ast.node(node)
            .sym
            .and_then(|sym| self.locals.get(&sym).copied())
    }
}

impl DataFlowAnalysis for DefiniteAssignment {
    fn name(&self) -> &'static str {
        "definite-assignments"
    }

    fn forward(&self) -> bool {
        true
    }

    fn boundary_fact(&self) -> BitSet {
        // nothing is assigned on entry
        BitSet::new(self.locals.len())
    }

    fn top_fact(&self) -> BitSet {
        BitSet::filled(self.locals.len())
    }

    fn join(&self, acc: &mut BitSet, edge: &BitSet) {
        acc.and_assign(edge);
    }

    fn transfer(&self, ast: &Ast, stmt: NodeId, fact: &BitSet) -> BitSet {
        let mut out = fact.clone();
        match ast.node(stmt).kind {
            NodeKind::VarDecl | NodeKind::Assign => {
                if let Some(lhs) = ast.child(stmt, 0) {
                    if let Some(var) = self.local_of(ast, lhs) {
                        if ast.node(stmt).kind == NodeKind::Assign || ast.child(stmt, 1).is_some() {
                            out.set(var);
                        } else {
                            // declaration without initialiser
                            out.clear(var);
                        }
                    }
                }
            }
            _ => {}
        }
        out
    }
}

/// Collect the callable's local variables: every declaration in the
/// body, excluding nested function and class definitions.
fn collect_locals(ast: &Ast, node: NodeId, locals: &mut FxHashMap<SymId, usize>) {
    match ast.node(node).kind {
        NodeKind::FunDef | NodeKind::ClassDef => return,
        NodeKind::VarDecl => {
            if let Some(sym) = ast.node(node).sym {
                let next = locals.len();
                locals.entry(sym).or_insert(next);
            }
        }
        _ => {}
    }
    for i in 0..ast.node(node).children.len() {
        if let Some(child) = ast.child(node, i) {
            collect_locals(ast, child, locals);
        }
    }
}

/// Report reads of possibly-unassigned variables within one expression
/// subtree (which contains no nested statements).
fn check_reads(
    analysis: &DefiniteAssignment,
    ast: &Ast,
    table: &SymbolTable,
    node: NodeId,
    assigned: &BitSet,
    reported: &mut BitSet,
    diags: &mut Diagnostics,
) {
    match ast.node(node).kind {
        NodeKind::FunDef | NodeKind::ClassDef => return,
        _ => {}
    }
    if let Some(var) = analysis.local_of(ast, node) {
        if !assigned.get(var) && !reported.get(var) {
            reported.set(var);
            let sym = ast.node(node).sym.unwrap();
            let name = table
                .lookup(sym)
                .map(|s| table.interner.resolve(s.name).to_string())
                .unwrap_or_default();
            diags.error(
                PASS,
                ast.node(node).line,
                format!("Variable may be uninitialised: `{}`", name),
            );
        }
    }
    for i in 0..ast.node(node).children.len() {
        if let Some(child) = ast.child(node, i) {
            check_reads(analysis, ast, table, child, assigned, reported, diags);
        }
    }
}

/// Run definite-assignment checking over one callable body.
pub fn check_definite_assignment(
    ast: &Ast,
    body: NodeId,
    table: &SymbolTable,
    diags: &mut Diagnostics,
) {
    let mut locals = FxHashMap::default();
    collect_locals(ast, body, &mut locals);
    if locals.is_empty() {
        return;
    }

    let cfg = Cfg::build(ast, body);
    let analysis = DefiniteAssignment { locals };
    let facts = solve(&cfg, ast, &analysis);

    let mut reported = BitSet::new(analysis.locals.len());
    for (i, node) in cfg.nodes.iter().enumerate() {
        let Some(stmt) = node.ast else { continue };
        let fact = &facts[i];
        match ast.node(stmt).kind {
            // for assignments, only the value side is a read; the target
            // is a read only when it is not a direct local
            NodeKind::VarDecl | NodeKind::Assign => {
                if let Some(rhs) = ast.child(stmt, 1) {
                    check_reads(&analysis, ast, table, rhs, fact, &mut reported, diags);
                }
                if let Some(lhs) = ast.child(stmt, 0) {
                    if analysis.local_of(ast, lhs).is_none() {
                        check_reads(&analysis, ast, table, lhs, fact, &mut reported, diags);
                    }
                }
            }
            // conditions are the only expressions evaluated at these nodes
            NodeKind::If | NodeKind::While => {
                if let Some(cond) = ast.child(stmt, 0) {
                    check_reads(&analysis, ast, table, cond, fact, &mut reported, diags);
                }
            }
            NodeKind::Break | NodeKind::Continue | NodeKind::Skip => {}
            _ => check_reads(&analysis, ast, table, stmt, fact, &mut reported, diags),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::CompilerOptions;
    use crate::parser::{Lexer, Parser};
    use crate::sema::names::name_analysis;
    use crate::sema::symtab::{SymFlags, SymKind};
    use crate::sema::types::type_analysis;

    fn check(src: &str) -> Diagnostics {
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
        assert!(diags.is_empty());
        let options = CompilerOptions::default();
        let program = type_analysis(&mut ast, root, &mut table, &options, &mut diags);
        assert!(diags.is_empty());

        check_definite_assignment(&ast, root, &table, &mut diags);
        for callable in &program.callables {
            if let Some(body) = ast.child(*callable, 2) {
                check_definite_assignment(&ast, body, &table, &mut diags);
            }
        }
        diags
    }

    #[test]
    fn test_initialised_variable_ok() {
        let diags = check("int x = 1; print(x);");
        assert!(diags.is_empty());
    }

    #[test]
    fn test_uninitialised_read_reported() {
        let diags = check("int x; print(x);");
        assert_eq!(diags.len(), 1);
        assert!(diags
            .iter()
            .next()
            .unwrap()
            .message
            .contains("may be uninitialised"));
    }

    #[test]
    fn test_assignment_before_read_ok() {
        let diags = check("int x; x := 1; print(x);");
        assert!(diags.is_empty());
    }

    #[test]
    fn test_one_branch_assignment_reported() {
        let diags = check("int c = 0; int x; if (c) x := 1; print(x);");
        assert_eq!(diags.len(), 1);
    }

    #[test]
    fn test_both_branches_assignment_ok() {
        let diags = check("int c = 0; int x; if (c) x := 1; else x := 2; print(x);");
        assert!(diags.is_empty());
    }

    #[test]
    fn test_loop_body_assignment_not_definite() {
        let diags = check("int c = 0; int x; while (c) x := 1; print(x);");
        assert_eq!(diags.len(), 1);
    }

    #[test]
    fn test_reported_once_per_variable() {
        let diags = check("int x; print(x); print(x);");
        assert_eq!(diags.len(), 1);
    }

    #[test]
    fn test_function_locals_checked() {
        let diags = check("int f() { int y; return y; } print(f());");
        assert_eq!(diags.len(), 1);
    }

    #[test]
    fn test_self_assignment_in_rhs_reported() {
        let diags = check("int x; x := x + 1;");
        assert_eq!(diags.len(), 1);
    }
}
