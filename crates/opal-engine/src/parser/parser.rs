//! Recursive-descent parser for the Opal language
//!
//! Grammar sketch (statements):
//!
//! ```text
//! program  := stmt* EOF
//! stmt     := ';' | 'skip' ';' | '{' stmt* '}'
//!           | 'if' '(' expr ')' stmt ('else' stmt)?
//!           | 'while' '(' expr ')' stmt
//!           | 'break' ';' | 'continue' ';' | 'return' expr? ';'
//!           | 'class' IDENT '(' formals ')' '{' stmt* '}'
//!           | type IDENT '(' formals ')' '{' stmt* '}'
//!           | type IDENT ('=' expr)? ';'
//!           | expr (':=' expr)? ';'
//! type     := 'int' | 'obj' | 'real' | 'var'
//! ```
//!
//! Expressions: `is`-tests over comparisons (`==` `<=` `<`) over additive
//! over multiplicative over `not`/unary-minus over postfix (call,
//! subscript, member) over primaries. Array literals are
//! `[e0, e1, ...]` with an optional explicit size after `;`:
//! `[e0, e1; n]`.
//!
//! Operator uses parse to `FunApp` nodes whose callee is a builtin
//! reference with the operator's fixed symbol id; the later passes treat
//! them uniformly with ordinary calls.

use crate::parser::ast::{Ast, AstNode, NodeFlags, NodeId, NodeKind, TypeTag, Value};
use crate::parser::interner::Interner;
use crate::parser::lexer::{Lexer, Token};
use crate::sema::builtin_ids;
use crate::sema::SymId;

/// Parse failure; parsing stops at the first error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub line: u32,
    pub message: String,
}

/// Recursive-descent parser producing nodes into an [`Ast`] arena.
pub struct Parser<'a> {
    tokens: &'a [(Token, u32)],
    pos: usize,
    lexer: &'a Lexer,
    ast: &'a mut Ast,
    interner: &'a Interner,
}

impl<'a> Parser<'a> {
    pub fn new(lexer: &'a Lexer, ast: &'a mut Ast, interner: &'a Interner) -> Parser<'a> {
        Parser {
            tokens: lexer.tokens(),
            pos: 0,
            lexer,
            ast,
            interner,
        }
    }

    /// Parse a whole program into a top-level block.
    pub fn parse_program(mut self) -> Result<NodeId, ParseError> {
        let line = self.line();
        let mut stmts = Vec::new();
        while self.peek() != Token::Eof {
            stmts.push(Some(self.parse_stmt()?));
        }
        Ok(self.ast.add(AstNode::new(NodeKind::Block, line, stmts)))
    }

    // ------------------------------------------------------------------
    // Token plumbing
    // ------------------------------------------------------------------

    fn peek(&self) -> Token {
        self.tokens[self.pos].0
    }

    fn line(&self) -> u32 {
        self.tokens[self.pos].1
    }

    fn bump(&mut self) -> Token {
        let t = self.tokens[self.pos].0;
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<(), ParseError> {
        if self.peek() == token {
            self.bump();
            Ok(())
        } else {
            let found = self.describe(self.peek());
            Err(self.error(format!("expected {}, found {}", what, found)))
        }
    }

    fn describe(&self, token: Token) -> String {
        match token {
            Token::Int(v) => format!("integer `{}`", v),
            Token::HexInt(v) => format!("integer `{:#x}`", v),
            Token::Real(v) => format!("real `{}`", v),
            Token::Str(_) => "string literal".into(),
            Token::Ident(name) => format!("identifier `{}`", self.interner.resolve(name)),
            Token::Eof => "end of input".into(),
            t => format!("`{:?}`", t),
        }
    }

    fn error(&self, message: String) -> ParseError {
        ParseError {
            line: self.line(),
            message,
        }
    }

    fn type_keyword(&self, token: Token) -> Option<TypeTag> {
        match token {
            Token::KwInt => Some(TypeTag::Int),
            Token::KwObj => Some(TypeTag::Obj),
            Token::KwReal => Some(TypeTag::Real),
            Token::KwVar => Some(TypeTag::Var),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn parse_stmt(&mut self) -> Result<NodeId, ParseError> {
        let line = self.line();
        match self.peek() {
            Token::Semi => {
                self.bump();
                Ok(self.ast.add(AstNode::new(NodeKind::Skip, line, vec![])))
            }
            Token::KwSkip => {
                self.bump();
                self.expect(Token::Semi, "`;`")?;
                Ok(self.ast.add(AstNode::new(NodeKind::Skip, line, vec![])))
            }
            Token::LBrace => self.parse_block(),
            Token::KwIf => {
                self.bump();
                self.expect(Token::LParen, "`(`")?;
                let cond = self.parse_expr()?;
                self.expect(Token::RParen, "`)`")?;
                let then = self.parse_stmt()?;
                let els = if self.peek() == Token::KwElse {
                    self.bump();
                    Some(self.parse_stmt()?)
                } else {
                    None
                };
                Ok(self.ast.add(AstNode::new(
                    NodeKind::If,
                    line,
                    vec![Some(cond), Some(then), els],
                )))
            }
            Token::KwWhile => {
                self.bump();
                self.expect(Token::LParen, "`(`")?;
                let cond = self.parse_expr()?;
                self.expect(Token::RParen, "`)`")?;
                let body = self.parse_stmt()?;
                Ok(self.ast.add(AstNode::new(
                    NodeKind::While,
                    line,
                    vec![Some(cond), Some(body)],
                )))
            }
            Token::KwBreak => {
                self.bump();
                self.expect(Token::Semi, "`;`")?;
                Ok(self.ast.add(AstNode::new(NodeKind::Break, line, vec![])))
            }
            Token::KwContinue => {
                self.bump();
                self.expect(Token::Semi, "`;`")?;
                Ok(self.ast.add(AstNode::new(NodeKind::Continue, line, vec![])))
            }
            Token::KwReturn => {
                self.bump();
                let value = if self.peek() == Token::Semi {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect(Token::Semi, "`;`")?;
                Ok(self
                    .ast
                    .add(AstNode::new(NodeKind::Return, line, vec![value])))
            }
            Token::KwClass => self.parse_classdef(),
            t if self.type_keyword(t).is_some() => self.parse_typed_decl(),
            _ => {
                // Expression statement or assignment
                let lhs = self.parse_expr()?;
                if self.peek() == Token::Walrus {
                    self.bump();
                    let rhs = self.parse_expr()?;
                    self.expect(Token::Semi, "`;`")?;
                    Ok(self.ast.add(AstNode::new(
                        NodeKind::Assign,
                        line,
                        vec![Some(lhs), Some(rhs)],
                    )))
                } else {
                    self.expect(Token::Semi, "`;`")?;
                    Ok(lhs)
                }
            }
        }
    }

    fn parse_block(&mut self) -> Result<NodeId, ParseError> {
        let line = self.line();
        self.expect(Token::LBrace, "`{`")?;
        let mut stmts = Vec::new();
        while self.peek() != Token::RBrace {
            if self.peek() == Token::Eof {
                return Err(self.error("unterminated block".into()));
            }
            stmts.push(Some(self.parse_stmt()?));
        }
        self.bump();
        Ok(self.ast.add(AstNode::new(NodeKind::Block, line, stmts)))
    }

    /// `type NAME ...`: either a function definition or a variable
    /// declaration, disambiguated by a `(` after the name.
    fn parse_typed_decl(&mut self) -> Result<NodeId, ParseError> {
        let line = self.line();
        let ty = self.type_keyword(self.peek()).unwrap();
        self.bump();
        let name = match self.peek() {
            Token::Ident(n) => {
                self.bump();
                n
            }
            t => return Err(self.error(format!("expected identifier, found {}", self.describe(t)))),
        };
        let name_node = self
            .ast
            .add(AstNode::value(NodeKind::NameRef, line, Value::Name(name)));

        if self.peek() == Token::LParen {
            // Function definition
            let formals = self.parse_formals()?;
            let body = self.parse_block()?;
            let mut node = AstNode::new(
                NodeKind::FunDef,
                line,
                vec![Some(name_node), Some(formals), Some(body)],
            );
            node.ty = Some(ty);
            Ok(self.ast.add(node))
        } else {
            // Variable declaration
            let init = if self.peek() == Token::Eq {
                self.bump();
                Some(self.parse_expr()?)
            } else {
                None
            };
            self.expect(Token::Semi, "`;`")?;
            let mut node = AstNode::new(NodeKind::VarDecl, line, vec![Some(name_node), init]);
            node.ty = Some(ty);
            Ok(self.ast.add(node))
        }
    }

    fn parse_classdef(&mut self) -> Result<NodeId, ParseError> {
        let line = self.line();
        self.bump(); // class
        let name = match self.peek() {
            Token::Ident(n) => {
                self.bump();
                n
            }
            t => return Err(self.error(format!("expected class name, found {}", self.describe(t)))),
        };
        let name_node = self
            .ast
            .add(AstNode::value(NodeKind::NameRef, line, Value::Name(name)));
        let formals = self.parse_formals()?;
        let body = self.parse_block()?;
        // The fourth child receives the synthesised constructor later
        let mut node = AstNode::new(
            NodeKind::ClassDef,
            line,
            vec![Some(name_node), Some(formals), Some(body), None],
        );
        node.ty = Some(TypeTag::Obj);
        Ok(self.ast.add(node))
    }

    fn parse_formals(&mut self) -> Result<NodeId, ParseError> {
        let line = self.line();
        self.expect(Token::LParen, "`(`")?;
        let mut params = Vec::new();
        if self.peek() != Token::RParen {
            loop {
                let pline = self.line();
                let ty = self
                    .type_keyword(self.peek())
                    .ok_or_else(|| self.error("expected parameter type".into()))?;
                self.bump();
                let name = match self.peek() {
                    Token::Ident(n) => {
                        self.bump();
                        n
                    }
                    t => {
                        return Err(
                            self.error(format!("expected parameter name, found {}", self.describe(t)))
                        )
                    }
                };
                let name_node =
                    self.ast
                        .add(AstNode::value(NodeKind::NameRef, pline, Value::Name(name)));
                let mut decl = AstNode::new(NodeKind::VarDecl, pline, vec![Some(name_node), None]);
                decl.ty = Some(ty);
                params.push(Some(self.ast.add(decl)));
                if self.peek() != Token::Comma {
                    break;
                }
                self.bump();
            }
        }
        self.expect(Token::RParen, "`)`")?;
        Ok(self.ast.add(AstNode::new(NodeKind::Formals, line, params)))
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn parse_expr(&mut self) -> Result<NodeId, ParseError> {
        self.parse_is()
    }

    fn parse_is(&mut self) -> Result<NodeId, ParseError> {
        let mut lhs = self.parse_cmp()?;
        while self.peek() == Token::KwIs {
            let line = self.line();
            self.bump();
            if let Some(ty) = self.type_keyword(self.peek()) {
                self.bump();
                let mut node = AstNode::new(NodeKind::IsPrimTy, line, vec![Some(lhs)]);
                node.ty = Some(ty);
                lhs = self.ast.add(node);
            } else if let Token::Ident(name) = self.peek() {
                self.bump();
                let class_node =
                    self.ast
                        .add(AstNode::value(NodeKind::NameRef, line, Value::Name(name)));
                lhs = self.ast.add(AstNode::new(
                    NodeKind::IsInstance,
                    line,
                    vec![Some(lhs), Some(class_node)],
                ));
            } else {
                return Err(self.error("expected type or class name after `is`".into()));
            }
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> Result<NodeId, ParseError> {
        let mut lhs = self.parse_addsub()?;
        loop {
            let op = match self.peek() {
                Token::EqEq => builtin_ids::OP_TEST_EQ,
                Token::Le => builtin_ids::OP_TEST_LE,
                Token::Lt => builtin_ids::OP_TEST_LT,
                _ => break,
            };
            let line = self.line();
            self.bump();
            let rhs = self.parse_addsub()?;
            lhs = self.builtin_app(op, line, vec![lhs, rhs]);
        }
        Ok(lhs)
    }

    fn parse_addsub(&mut self) -> Result<NodeId, ParseError> {
        let mut lhs = self.parse_muldiv()?;
        loop {
            let op = match self.peek() {
                Token::Plus => builtin_ids::OP_ADD,
                Token::Minus => builtin_ids::OP_SUB,
                _ => break,
            };
            let line = self.line();
            self.bump();
            let rhs = self.parse_muldiv()?;
            lhs = self.builtin_app(op, line, vec![lhs, rhs]);
        }
        Ok(lhs)
    }

    fn parse_muldiv(&mut self) -> Result<NodeId, ParseError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => builtin_ids::OP_MUL,
                Token::Slash => builtin_ids::OP_DIV,
                _ => break,
            };
            let line = self.line();
            self.bump();
            let rhs = self.parse_unary()?;
            lhs = self.builtin_app(op, line, vec![lhs, rhs]);
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<NodeId, ParseError> {
        let line = self.line();
        match self.peek() {
            Token::KwNot => {
                self.bump();
                let operand = self.parse_unary()?;
                Ok(self.builtin_app(builtin_ids::OP_NOT, line, vec![operand]))
            }
            Token::Minus => {
                self.bump();
                // Fold a minus directly into integer literals; otherwise 0 - e
                if let Token::Int(v) = self.peek() {
                    self.bump();
                    return Ok(self
                        .ast
                        .add(AstNode::value(NodeKind::IntLit, line, Value::Int(-v))));
                }
                let operand = self.parse_unary()?;
                let zero = self
                    .ast
                    .add(AstNode::value(NodeKind::IntLit, line, Value::Int(0)));
                Ok(self.builtin_app(builtin_ids::OP_SUB, line, vec![zero, operand]))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<NodeId, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            let line = self.line();
            match self.peek() {
                Token::LParen => {
                    let actuals = self.parse_actuals()?;
                    expr = self.ast.add(AstNode::new(
                        NodeKind::FunApp,
                        line,
                        vec![Some(expr), Some(actuals)],
                    ));
                }
                Token::LBracket => {
                    self.bump();
                    let index = self.parse_expr()?;
                    self.expect(Token::RBracket, "`]`")?;
                    expr = self.ast.add(AstNode::new(
                        NodeKind::ArraySub,
                        line,
                        vec![Some(expr), Some(index)],
                    ));
                }
                Token::Dot => {
                    self.bump();
                    let name = match self.peek() {
                        Token::Ident(n) => {
                            self.bump();
                            n
                        }
                        t => {
                            return Err(
                                self.error(format!("expected member name, found {}", self.describe(t)))
                            )
                        }
                    };
                    let name_node =
                        self.ast
                            .add(AstNode::value(NodeKind::NameRef, line, Value::Name(name)));
                    expr = self.ast.add(AstNode::new(
                        NodeKind::Member,
                        line,
                        vec![Some(expr), Some(name_node)],
                    ));
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_actuals(&mut self) -> Result<NodeId, ParseError> {
        let line = self.line();
        self.expect(Token::LParen, "`(`")?;
        let mut args = Vec::new();
        if self.peek() != Token::RParen {
            loop {
                args.push(Some(self.parse_expr()?));
                if self.peek() != Token::Comma {
                    break;
                }
                self.bump();
            }
        }
        self.expect(Token::RParen, "`)`")?;
        Ok(self.ast.add(AstNode::new(NodeKind::Actuals, line, args)))
    }

    fn parse_primary(&mut self) -> Result<NodeId, ParseError> {
        let line = self.line();
        match self.bump() {
            Token::Int(v) => Ok(self
                .ast
                .add(AstNode::value(NodeKind::IntLit, line, Value::Int(v)))),
            Token::HexInt(v) => {
                let mut node = AstNode::value(NodeKind::IntLit, line, Value::Int(v));
                node.flags.insert(NodeFlags::HEX_REPR);
                Ok(self.ast.add(node))
            }
            Token::Real(v) => Ok(self
                .ast
                .add(AstNode::value(NodeKind::RealLit, line, Value::Real(v)))),
            Token::Str(i) => {
                let text = self.lexer.string(i).to_string();
                Ok(self
                    .ast
                    .add(AstNode::value(NodeKind::StrLit, line, Value::Str(text))))
            }
            Token::Ident(name) => Ok(self
                .ast
                .add(AstNode::value(NodeKind::NameRef, line, Value::Name(name)))),
            Token::KwNull => Ok(self.ast.add(AstNode::new(NodeKind::Null, line, vec![]))),
            Token::LParen => {
                let inner = self.parse_expr()?;
                self.expect(Token::RParen, "`)`")?;
                Ok(inner)
            }
            Token::LBracket => self.parse_array_literal(line),
            t => Err(ParseError {
                line,
                message: format!("expected expression, found {}", self.describe(t)),
            }),
        }
    }

    /// `[e0, e1, ...]` or `[e0, e1; size]` (the `[` is already consumed).
    fn parse_array_literal(&mut self, line: u32) -> Result<NodeId, ParseError> {
        let mut elements = Vec::new();
        if self.peek() != Token::RBracket && self.peek() != Token::Semi {
            loop {
                elements.push(Some(self.parse_expr()?));
                if self.peek() != Token::Comma {
                    break;
                }
                self.bump();
            }
        }
        let size = if self.peek() == Token::Semi {
            self.bump();
            Some(self.parse_expr()?)
        } else {
            None
        };
        self.expect(Token::RBracket, "`]`")?;
        let list = self
            .ast
            .add(AstNode::new(NodeKind::ArrayList, line, elements));
        Ok(self.ast.add(AstNode::new(
            NodeKind::ArrayVal,
            line,
            vec![Some(list), size],
        )))
    }

    fn builtin_app(&mut self, op: SymId, line: u32, args: Vec<NodeId>) -> NodeId {
        let callee = self
            .ast
            .add(AstNode::value(NodeKind::BuiltinRef, line, Value::Builtin(op)));
        let actuals = self.ast.add(AstNode::new(
            NodeKind::Actuals,
            line,
            args.into_iter().map(Some).collect(),
        ));
        self.ast.add(AstNode::new(
            NodeKind::FunApp,
            line,
            vec![Some(callee), Some(actuals)],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> (Ast, NodeId, Interner) {
        let mut interner = Interner::new();
        let lexer = Lexer::tokenize(src, &mut interner).expect("lex");
        let mut ast = Ast::new();
        let root = Parser::new(&lexer, &mut ast, &interner)
            .parse_program()
            .expect("parse");
        (ast, root, interner)
    }

    #[test]
    fn test_print_call() {
        let (ast, root, _) = parse("print(3+4);");
        let stmt = ast.child(root, 0).unwrap();
        assert_eq!(ast.node(stmt).kind, NodeKind::FunApp);
        let callee = ast.child(stmt, 0).unwrap();
        assert_eq!(ast.node(callee).kind, NodeKind::NameRef);
        let actuals = ast.child(stmt, 1).unwrap();
        assert_eq!(ast.node(actuals).children.len(), 1);
        // the single argument is the + operator application
        let plus = ast.child(actuals, 0).unwrap();
        assert_eq!(ast.node(plus).kind, NodeKind::FunApp);
        let op = ast.child(plus, 0).unwrap();
        assert_eq!(ast.node(op).kind, NodeKind::BuiltinRef);
    }

    #[test]
    fn test_precedence() {
        // 1 + 2 * 3 parses as 1 + (2 * 3)
        let (ast, root, _) = parse("1 + 2 * 3;");
        let plus = ast.child(root, 0).unwrap();
        let actuals = ast.child(plus, 1).unwrap();
        let rhs = ast.child(actuals, 1).unwrap();
        assert_eq!(ast.node(rhs).kind, NodeKind::FunApp);
        let rhs_op = ast.child(rhs, 0).unwrap();
        assert_eq!(
            ast.node(rhs_op).value,
            Some(Value::Builtin(builtin_ids::OP_MUL))
        );
    }

    #[test]
    fn test_fundef() {
        let (ast, root, _) = parse("int fact(int a) { return a; }");
        let def = ast.child(root, 0).unwrap();
        let node = ast.node(def);
        assert_eq!(node.kind, NodeKind::FunDef);
        assert_eq!(node.ty, Some(TypeTag::Int));
        let formals = ast.child(def, 1).unwrap();
        assert_eq!(ast.node(formals).children.len(), 1);
        let param = ast.child(formals, 0).unwrap();
        assert_eq!(ast.node(param).kind, NodeKind::VarDecl);
        assert_eq!(ast.node(param).ty, Some(TypeTag::Int));
    }

    #[test]
    fn test_classdef_reserves_constructor_slot() {
        let (ast, root, _) = parse("class C() { int x = 17; }");
        let def = ast.child(root, 0).unwrap();
        let node = ast.node(def);
        assert_eq!(node.kind, NodeKind::ClassDef);
        assert_eq!(node.children.len(), 4);
        assert_eq!(node.children[3], None);
    }

    #[test]
    fn test_vardecl_and_assign() {
        let (ast, root, _) = parse("int x = 0; x := x + 1;");
        let decl = ast.child(root, 0).unwrap();
        assert_eq!(ast.node(decl).kind, NodeKind::VarDecl);
        let assign = ast.child(root, 1).unwrap();
        assert_eq!(ast.node(assign).kind, NodeKind::Assign);
    }

    #[test]
    fn test_member_and_method_call() {
        let (ast, root, _) = parse("a.p(1);");
        let call = ast.child(root, 0).unwrap();
        assert_eq!(ast.node(call).kind, NodeKind::FunApp);
        let member = ast.child(call, 0).unwrap();
        assert_eq!(ast.node(member).kind, NodeKind::Member);
    }

    #[test]
    fn test_array_literal_with_size() {
        let (ast, root, _) = parse("obj a = [1, 7; 10];");
        let decl = ast.child(root, 0).unwrap();
        let arr = ast.child(decl, 1).unwrap();
        assert_eq!(ast.node(arr).kind, NodeKind::ArrayVal);
        assert!(ast.child(arr, 1).is_some());
        let list = ast.child(arr, 0).unwrap();
        assert_eq!(ast.node(list).children.len(), 2);
    }

    #[test]
    fn test_subscript_assignment() {
        let (ast, root, _) = parse("a[1] := 2;");
        let assign = ast.child(root, 0).unwrap();
        assert_eq!(ast.node(assign).kind, NodeKind::Assign);
        let lhs = ast.child(assign, 0).unwrap();
        assert_eq!(ast.node(lhs).kind, NodeKind::ArraySub);
    }

    #[test]
    fn test_is_expressions() {
        let (ast, root, _) = parse("if (1 is int) print(1);");
        let iff = ast.child(root, 0).unwrap();
        let cond = ast.child(iff, 0).unwrap();
        assert_eq!(ast.node(cond).kind, NodeKind::IsPrimTy);
        assert_eq!(ast.node(cond).ty, Some(TypeTag::Int));

        let (ast, root, _) = parse("x is C;");
        let test = ast.child(root, 0).unwrap();
        assert_eq!(ast.node(test).kind, NodeKind::IsInstance);
    }

    #[test]
    fn test_unary_minus_folds_literals() {
        let (ast, root, _) = parse("print(-5);");
        let call = ast.child(root, 0).unwrap();
        let actuals = ast.child(call, 1).unwrap();
        let arg = ast.child(actuals, 0).unwrap();
        assert_eq!(ast.node(arg).value, Some(Value::Int(-5)));
    }

    #[test]
    fn test_parse_error_reports_line() {
        let mut interner = Interner::new();
        let lexer = Lexer::tokenize("1;\nwhile (", &mut interner).unwrap();
        let mut ast = Ast::new();
        let err = Parser::new(&lexer, &mut ast, &interner)
            .parse_program()
            .unwrap_err();
        assert_eq!(err.line, 2);
    }
}
