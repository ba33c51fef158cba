//! Parser module: lexer, interner, AST, and parser
//!
//! The front end turns Opal source text into the generic AST consumed by
//! the semantic passes. Nodes live in an arena ([`Ast`]) and are addressed
//! by [`NodeId`] handles so that later passes can rewrite nodes in place.

pub mod ast;
pub mod interner;
pub mod lexer;
#[allow(clippy::module_inception)]
pub mod parser;

pub use ast::{Ast, AstNode, NodeFlags, NodeId, NodeKind, TypeTag, Value};
pub use interner::{Interner, Name};
pub use lexer::{LexError, Lexer, Token};
pub use parser::{ParseError, Parser};
