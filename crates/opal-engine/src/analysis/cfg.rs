//! Per-callable control-flow graph
//!
//! Statement-level graph: assignments, declarations, expression
//! statements, returns, and the condition positions of `if`/`while` each
//! become one node. Nested function and class definitions do not
//! participate in the enclosing graph (they get graphs of their own).
//!
//! Node 0 is the distinguished entry, node 1 the exit.

use crate::parser::ast::{Ast, NodeId, NodeKind};

/// Index of the entry node.
pub const ENTRY: usize = 0;
/// Index of the exit node.
pub const EXIT: usize = 1;

/// One control-flow node.
#[derive(Debug, Default)]
pub struct CfgNode {
    /// Backing statement; `None` for entry/exit
    pub ast: Option<NodeId>,
    pub succ: Vec<usize>,
    pub pred: Vec<usize>,
}

/// Control-flow graph over one callable body.
#[derive(Debug, Default)]
pub struct Cfg {
    pub nodes: Vec<CfgNode>,
}

impl Cfg {
    /// Build the graph for a callable body.
    pub fn build(ast: &Ast, body: NodeId) -> Cfg {
        let mut cfg = Cfg::default();
        cfg.nodes.push(CfgNode::default()); // entry
        cfg.nodes.push(CfgNode::default()); // exit

        let mut builder = Builder {
            cfg: &mut cfg,
            ast,
            loops: Vec::new(),
        };
        let ends = builder.stmt(body, vec![ENTRY]);
        for end in ends {
            cfg.link(end, EXIT);
        }
        cfg
    }

    fn add(&mut self, ast: NodeId) -> usize {
        let index = self.nodes.len();
        self.nodes.push(CfgNode {
            ast: Some(ast),
            succ: Vec::new(),
            pred: Vec::new(),
        });
        index
    }

    fn link(&mut self, from: usize, to: usize) {
        if !self.nodes[from].succ.contains(&to) {
            self.nodes[from].succ.push(to);
            self.nodes[to].pred.push(from);
        }
    }

    /// Render the graph in DOT format.
    pub fn dottify(&self, ast: &Ast, title: &str) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let _ = writeln!(out, "digraph \"{}\" {{", title);
        for (i, node) in self.nodes.iter().enumerate() {
            let label = match (i, node.ast) {
                (ENTRY, _) => "entry".to_string(),
                (EXIT, _) => "exit".to_string(),
                (_, Some(id)) => {
                    format!("{:?} (line {})", ast.node(id).kind, ast.node(id).line)
                }
                (_, None) => "?".to_string(),
            };
            let _ = writeln!(out, "  n{} [label=\"{}\"];", i, label);
            for succ in &node.succ {
                let _ = writeln!(out, "  n{} -> n{};", i, succ);
            }
        }
        out.push_str("}\n");
        out
    }
}

struct LoopFrame {
    /// The condition node (`continue` target)
    head: usize,
    /// Nodes whose exit edges jump past the loop (`break` sources)
    breaks: Vec<usize>,
}

struct Builder<'a> {
    cfg: &'a mut Cfg,
    ast: &'a Ast,
    loops: Vec<LoopFrame>,
}

impl<'a> Builder<'a> {
    /// Wire `stmt` after `preds`; returns the open ends that fall through.
    fn stmt(&mut self, stmt: NodeId, preds: Vec<usize>) -> Vec<usize> {
        match self.ast.node(stmt).kind {
            NodeKind::Block => {
                let mut current = preds;
                let children: Vec<NodeId> = self
                    .ast
                    .node(stmt)
                    .children
                    .iter()
                    .flatten()
                    .copied()
                    .collect();
                for child in children {
                    current = self.stmt(child, current);
                }
                current
            }

            // nested definitions are not part of this graph
            NodeKind::FunDef | NodeKind::ClassDef => preds,

            NodeKind::If => {
                let cond = self.node_after(stmt, &preds);
                let mut ends = Vec::new();
                if let Some(then) = self.ast.child(stmt, 1) {
                    ends.extend(self.stmt(then, vec![cond]));
                } else {
                    ends.push(cond);
                }
                if let Some(els) = self.ast.child(stmt, 2) {
                    ends.extend(self.stmt(els, vec![cond]));
                } else {
                    ends.push(cond);
                }
                ends
            }

            NodeKind::While => {
                let cond = self.node_after(stmt, &preds);
                self.loops.push(LoopFrame {
                    head: cond,
                    breaks: Vec::new(),
                });
                if let Some(body) = self.ast.child(stmt, 1) {
                    let body_ends = self.stmt(body, vec![cond]);
                    for end in body_ends {
                        self.cfg.link(end, cond);
                    }
                }
                let frame = self.loops.pop().unwrap();
                let mut ends = vec![cond];
                ends.extend(frame.breaks);
                ends
            }

            NodeKind::Break => {
                let node = self.node_after(stmt, &preds);
                if let Some(frame) = self.loops.last_mut() {
                    frame.breaks.push(node);
                }
                Vec::new()
            }

            NodeKind::Continue => {
                let node = self.node_after(stmt, &preds);
                let head = self.loops.last().map(|f| f.head);
                if let Some(head) = head {
                    self.cfg.link(node, head);
                }
                Vec::new()
            }

            NodeKind::Return => {
                let node = self.node_after(stmt, &preds);
                self.cfg.link(node, EXIT);
                Vec::new()
            }

            // every remaining statement is a straight-line node
            _ => {
                let node = self.node_after(stmt, &preds);
                vec![node]
            }
        }
    }

    fn node_after(&mut self, stmt: NodeId, preds: &[usize]) -> usize {
        let node = self.cfg.add(stmt);
        for &p in preds {
            self.cfg.link(p, node);
        }
        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{Interner, Lexer, Parser};

    fn build(src: &str) -> (Ast, Cfg) {
        let mut interner = Interner::new();
        let lexer = Lexer::tokenize(src, &mut interner).expect("lex");
        let mut ast = Ast::new();
        let root = Parser::new(&lexer, &mut ast, &interner)
            .parse_program()
            .expect("parse");
        let cfg = Cfg::build(&ast, root);
        (ast, cfg)
    }

    #[test]
    fn test_straight_line() {
        let (_, cfg) = build("int x = 1; print(x);");
        // entry, exit, two statements
        assert_eq!(cfg.nodes.len(), 4);
        assert_eq!(cfg.nodes[ENTRY].succ, vec![2]);
        assert_eq!(cfg.nodes[2].succ, vec![3]);
        assert_eq!(cfg.nodes[3].succ, vec![EXIT]);
    }

    #[test]
    fn test_if_branches_rejoin() {
        let (ast, cfg) = build("int x = 0; if (x) x := 1; else x := 2; print(x);");
        // find the condition node (the If statement)
        let cond = cfg
            .nodes
            .iter()
            .position(|n| {
                n.ast
                    .map(|id| ast.node(id).kind == NodeKind::If)
                    .unwrap_or(false)
            })
            .unwrap();
        assert_eq!(cfg.nodes[cond].succ.len(), 2);
        // both branches flow into the print statement
        let print_node = cfg
            .nodes
            .iter()
            .position(|n| {
                n.ast
                    .map(|id| ast.node(id).kind == NodeKind::FunApp)
                    .unwrap_or(false)
            })
            .unwrap();
        assert_eq!(cfg.nodes[print_node].pred.len(), 2);
    }

    #[test]
    fn test_while_back_edge() {
        let (ast, cfg) = build("int x = 0; while (x < 3) { x := x + 1; }");
        let cond = cfg
            .nodes
            .iter()
            .position(|n| {
                n.ast
                    .map(|id| ast.node(id).kind == NodeKind::While)
                    .unwrap_or(false)
            })
            .unwrap();
        // condition has two successors: body and fallthrough to exit
        assert_eq!(cfg.nodes[cond].succ.len(), 2);
        // the body statement loops back
        let body = cfg.nodes[cond]
            .succ
            .iter()
            .copied()
            .find(|&s| s != EXIT)
            .unwrap();
        assert!(cfg.nodes[body].succ.contains(&cond));
    }

    #[test]
    fn test_break_leaves_loop() {
        let (ast, cfg) = build("while (1) { break; } print(0);");
        let brk = cfg
            .nodes
            .iter()
            .position(|n| {
                n.ast
                    .map(|id| ast.node(id).kind == NodeKind::Break)
                    .unwrap_or(false)
            })
            .unwrap();
        let print_node = cfg
            .nodes
            .iter()
            .position(|n| {
                n.ast
                    .map(|id| ast.node(id).kind == NodeKind::FunApp)
                    .unwrap_or(false)
            })
            .unwrap();
        assert!(cfg.nodes[brk].succ.contains(&print_node));
    }

    #[test]
    fn test_nested_definitions_excluded() {
        let (ast, cfg) = build("int f() { return 1; } print(0);");
        // the top-level graph skips the definition's body entirely
        assert!(cfg.nodes.iter().all(|n| n
            .ast
            .map(|id| ast.node(id).kind != NodeKind::Return)
            .unwrap_or(true)));
        // entry, exit, print
        assert_eq!(cfg.nodes.len(), 3);
    }

    #[test]
    fn test_return_goes_to_exit() {
        // build a function body graph directly
        let mut interner = Interner::new();
        let lexer = Lexer::tokenize("int f() { return 1; }", &mut interner).unwrap();
        let mut ast = Ast::new();
        let root = Parser::new(&lexer, &mut ast, &interner)
            .parse_program()
            .unwrap();
        let fundef = ast.child(root, 0).unwrap();
        let body = ast.child(fundef, 2).unwrap();
        let cfg = Cfg::build(&ast, body);
        let ret = cfg
            .nodes
            .iter()
            .position(|n| {
                n.ast
                    .map(|id| ast.node(id).kind == NodeKind::Return)
                    .unwrap_or(false)
            })
            .unwrap();
        assert_eq!(cfg.nodes[ret].succ, vec![EXIT]);
    }

    #[test]
    fn test_dot_output() {
        let (ast, cfg) = build("int x = 0;");
        let dot = cfg.dottify(&ast, "main");
        assert!(dot.starts_with("digraph"));
        assert!(dot.contains("entry"));
        assert!(dot.contains("exit"));
        assert!(dot.contains("VarDecl"));
    }
}
