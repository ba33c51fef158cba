//! Abstract syntax tree
//!
//! Nodes live in one arena owned by the pipeline and are addressed by
//! [`NodeId`] handles; the semantic passes rewrite nodes in place (name
//! resolution swaps `Name` references for `Id` references, type analysis
//! wraps children in conversion calls and replaces call nodes with
//! method-application nodes). Children are optional, matching the
//! grammar's optional positions (initialisers, `else` branches, array
//! sizes).

use crate::parser::interner::{Interner, Name};
use crate::sema::SymId;
use std::fmt;

/// Expression type as tracked on AST nodes and symbols.
///
/// `Real` is reserved: type analysis rejects it. `Var` is reserved and
/// treated as `Obj` at every decision point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    Int,
    Real,
    Obj,
    Var,
}

impl TypeTag {
    /// Normalise the reserved `Var` tag to `Obj`.
    pub fn canonical(self) -> TypeTag {
        match self {
            TypeTag::Var => TypeTag::Obj,
            t => t,
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TypeTag::Int => "int",
            TypeTag::Real => "real",
            TypeTag::Obj => "obj",
            TypeTag::Var => "var",
        };
        f.write_str(s)
    }
}

/// Extra node flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeFlags(u8);

impl NodeFlags {
    /// Node is used in lvalue position (yields an address, not a value)
    pub const LVALUE: NodeFlags = NodeFlags(0x01);
    /// Node is a declaring occurrence of a name
    pub const DECL: NodeFlags = NodeFlags(0x02);
    /// Integer literal was written in hexadecimal
    pub const HEX_REPR: NodeFlags = NodeFlags(0x04);

    pub fn contains(self, other: NodeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: NodeFlags) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for NodeFlags {
    type Output = NodeFlags;
    fn bitor(self, rhs: NodeFlags) -> NodeFlags {
        NodeFlags(self.0 | rhs.0)
    }
}

/// Handle to a node in the [`Ast`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Payload of a value node.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Real(f64),
    Str(String),
    /// Unresolved identifier (pre name analysis)
    Name(Name),
    /// Resolved identifier (post name analysis)
    Id(SymId),
    /// Reference to a builtin entity
    Builtin(SymId),
}

/// Node kind.
///
/// The first six are value kinds (no children); the rest are generic
/// nodes whose child count is fixed at allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    // Value kinds
    IntLit,
    RealLit,
    StrLit,
    /// Identifier, unresolved
    NameRef,
    /// Identifier, resolved to a symbol
    IdRef,
    /// Builtin entity reference
    BuiltinRef,

    // Generic kinds
    /// Statement sequence; children are the statements
    Block,
    /// [0] name, [1] formals, [2] body
    FunDef,
    /// [0] name, [1] formals, [2] body, [3] synthesised constructor
    ClassDef,
    /// Parameter list; children are `VarDecl`s without initialisers
    Formals,
    /// Argument list
    Actuals,
    /// [0] name, [1] optional initialiser; declared type in `ty`
    VarDecl,
    /// [0] lvalue, [1] rhs
    Assign,
    /// [0] condition, [1] then, [2] optional else
    If,
    /// [0] condition, [1] body
    While,
    Break,
    Continue,
    /// [0] optional value
    Return,
    /// [0] callee (IdRef / NameRef / Member), [1] actuals
    FunApp,
    /// [0] receiver, [1] selector, [2] actuals (rewritten from FunApp)
    MethodApp,
    /// [0] class reference, [1] actuals (rewritten from FunApp)
    NewInstance,
    /// [0] receiver expression, [1] member name (selector)
    Member,
    /// [0] array expression, [1] index
    ArraySub,
    /// [0] element list (ArrayList), [1] optional explicit size
    ArrayVal,
    /// Array literal elements
    ArrayList,
    /// [0] expression; tested primitive type in `ty`
    IsPrimTy,
    /// [0] expression, [1] class identifier (rewritten from IsPrimTy)
    IsInstance,
    Null,
    /// Empty statement
    Skip,
}

impl NodeKind {
    pub fn is_value(self) -> bool {
        matches!(
            self,
            NodeKind::IntLit
                | NodeKind::RealLit
                | NodeKind::StrLit
                | NodeKind::NameRef
                | NodeKind::IdRef
                | NodeKind::BuiltinRef
        )
    }
}

/// A single AST node.
#[derive(Debug, Clone)]
pub struct AstNode {
    pub kind: NodeKind,
    /// Expression type, if assigned (by the parser for literals and
    /// declarations, by type analysis for everything else)
    pub ty: Option<TypeTag>,
    pub flags: NodeFlags,
    /// 1-based source line
    pub line: u32,
    /// Temporary-storage slot claimed during name analysis (−1 if none)
    pub storage: i32,
    /// Symbol back-reference, set during name analysis
    pub sym: Option<SymId>,
    /// Payload for value nodes
    pub value: Option<Value>,
    pub children: Vec<Option<NodeId>>,
}

impl AstNode {
    /// Allocate a generic node with the given children.
    pub fn new(kind: NodeKind, line: u32, children: Vec<Option<NodeId>>) -> AstNode {
        debug_assert!(!kind.is_value());
        AstNode {
            kind,
            ty: None,
            flags: NodeFlags::default(),
            line,
            storage: -1,
            sym: None,
            value: None,
            children,
        }
    }

    /// Allocate a value node.
    pub fn value(kind: NodeKind, line: u32, value: Value) -> AstNode {
        debug_assert!(kind.is_value());
        AstNode {
            kind,
            ty: None,
            flags: NodeFlags::default(),
            line,
            storage: -1,
            sym: None,
            value: Some(value),
            children: Vec::new(),
        }
    }

    /// The interned name of a `NameRef` node.
    pub fn name(&self) -> Option<Name> {
        match self.value {
            Some(Value::Name(n)) => Some(n),
            _ => None,
        }
    }

    pub fn is_lvalue(&self) -> bool {
        self.flags.contains(NodeFlags::LVALUE)
    }
}

/// Arena of AST nodes.
///
/// The arena is append-only; "freeing" a subtree simply abandons its
/// nodes, which the arena reclaims when dropped alongside the image.
#[derive(Default, Debug)]
pub struct Ast {
    nodes: Vec<AstNode>,
}

impl Ast {
    pub fn new() -> Ast {
        Ast::default()
    }

    pub fn add(&mut self, node: AstNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> &AstNode {
        &self.nodes[id.index()]
    }

    #[inline]
    pub fn node_mut(&mut self, id: NodeId) -> &mut AstNode {
        &mut self.nodes[id.index()]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Child `i` of `id`, if present.
    pub fn child(&self, id: NodeId, i: usize) -> Option<NodeId> {
        self.node(id).children.get(i).copied().flatten()
    }

    /// Replace child `i` of `id`, returning the previous child.
    pub fn set_child(&mut self, id: NodeId, i: usize, child: Option<NodeId>) -> Option<NodeId> {
        std::mem::replace(&mut self.node_mut(id).children[i], child)
    }

    /// Deep-clone the subtree rooted at `id` into fresh nodes.
    pub fn clone_subtree(&mut self, id: NodeId) -> NodeId {
        let mut node = self.node(id).clone();
        for slot in node.children.iter_mut() {
            if let Some(child) = *slot {
                *slot = Some(self.clone_subtree(child));
            }
        }
        self.add(node)
    }

    /// Pretty-print the subtree rooted at `id` (diagnostic output).
    pub fn dump(&self, id: NodeId, interner: &Interner, out: &mut String) {
        self.dump_indent(id, interner, out, 0);
    }

    fn dump_indent(&self, id: NodeId, interner: &Interner, out: &mut String, depth: usize) {
        use std::fmt::Write;
        let node = self.node(id);
        for _ in 0..depth {
            out.push_str("  ");
        }
        let _ = write!(out, "{:?}", node.kind);
        match &node.value {
            Some(Value::Int(i)) => {
                if node.flags.contains(NodeFlags::HEX_REPR) {
                    let _ = write!(out, " {:#x}", i);
                } else {
                    let _ = write!(out, " {}", i);
                }
            }
            Some(Value::Real(r)) => {
                let _ = write!(out, " {}", r);
            }
            Some(Value::Str(s)) => {
                let _ = write!(out, " {:?}", s);
            }
            Some(Value::Name(n)) => {
                let _ = write!(out, " {}", interner.resolve(*n));
            }
            Some(Value::Id(sym)) | Some(Value::Builtin(sym)) => {
                let _ = write!(out, " #{}", sym.raw());
            }
            None => {}
        }
        if let Some(ty) = node.ty {
            let _ = write!(out, " : {}", ty);
        }
        if node.is_lvalue() {
            out.push_str(" lvalue");
        }
        if node.storage >= 0 {
            let _ = write!(out, " t{}", node.storage);
        }
        out.push('\n');
        for child in &node.children {
            match child {
                Some(c) => self.dump_indent(*c, interner, out, depth + 1),
                None => {
                    for _ in 0..=depth {
                        out.push_str("  ");
                    }
                    out.push_str("-\n");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_access() {
        let mut ast = Ast::new();
        let lit = ast.add(AstNode::value(NodeKind::IntLit, 1, Value::Int(42)));
        let block = ast.add(AstNode::new(NodeKind::Block, 1, vec![Some(lit)]));
        assert_eq!(ast.child(block, 0), Some(lit));
        assert_eq!(ast.node(lit).value, Some(Value::Int(42)));
    }

    #[test]
    fn test_set_child() {
        let mut ast = Ast::new();
        let a = ast.add(AstNode::value(NodeKind::IntLit, 1, Value::Int(1)));
        let b = ast.add(AstNode::value(NodeKind::IntLit, 1, Value::Int(2)));
        let block = ast.add(AstNode::new(NodeKind::Block, 1, vec![Some(a)]));
        let old = ast.set_child(block, 0, Some(b));
        assert_eq!(old, Some(a));
        assert_eq!(ast.child(block, 0), Some(b));
    }

    #[test]
    fn test_clone_subtree_is_deep() {
        let mut ast = Ast::new();
        let lit = ast.add(AstNode::value(NodeKind::IntLit, 3, Value::Int(9)));
        let ret = ast.add(AstNode::new(NodeKind::Return, 3, vec![Some(lit)]));
        let copy = ast.clone_subtree(ret);
        assert_ne!(copy, ret);
        let copy_child = ast.child(copy, 0).unwrap();
        assert_ne!(copy_child, lit);
        assert_eq!(ast.node(copy_child).value, Some(Value::Int(9)));
    }

    #[test]
    fn test_flags() {
        let mut flags = NodeFlags::default();
        assert!(!flags.contains(NodeFlags::LVALUE));
        flags.insert(NodeFlags::LVALUE);
        flags.insert(NodeFlags::DECL);
        assert!(flags.contains(NodeFlags::LVALUE));
        assert!(flags.contains(NodeFlags::DECL));
        assert!(!flags.contains(NodeFlags::HEX_REPR));
    }
}
