//! Lexer for the Opal language
//!
//! Implemented with the logos library. Source text is tokenised up front;
//! every token carries the 1-based source line it starts on, which the
//! semantic passes propagate into diagnostics.

use crate::parser::interner::{Interner, Name};
use logos::Logos;

/// Logos-based token enum used internally for tokenisation.
#[derive(Logos, Debug, Clone, PartialEq)]
enum LogosToken {
    // Whitespace (skip; newlines are counted separately for line numbers)
    #[regex(r"[ \t\r\n]+", logos::skip)]
    Whitespace,

    #[regex(r"//[^\n]*", logos::skip)]
    LineComment,

    // Keywords (must come before identifiers)
    #[token("int")]
    KwInt,

    #[token("obj")]
    KwObj,

    #[token("real")]
    KwReal,

    #[token("var")]
    KwVar,

    #[token("class")]
    KwClass,

    #[token("if")]
    KwIf,

    #[token("else")]
    KwElse,

    #[token("while")]
    KwWhile,

    #[token("break")]
    KwBreak,

    #[token("continue")]
    KwContinue,

    #[token("return")]
    KwReturn,

    #[token("is")]
    KwIs,

    #[token("not")]
    KwNot,

    #[token("null")]
    KwNull,

    #[token("skip")]
    KwSkip,

    // Literals
    #[regex(r"0[xX][0-9a-fA-F]+")]
    HexInt,

    #[regex(r"[0-9]+\.[0-9]+")]
    Real,

    #[regex(r"[0-9]+")]
    Int,

    #[regex(r#""([^"\\]|\\.)*""#)]
    Str,

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*")]
    Ident,

    // Punctuation and operators
    #[token(":=")]
    Walrus,

    #[token("==")]
    EqEq,

    #[token("<=")]
    Le,

    #[token("<")]
    Lt,

    #[token("=")]
    Eq,

    #[token("+")]
    Plus,

    #[token("-")]
    Minus,

    #[token("*")]
    Star,

    #[token("/")]
    Slash,

    #[token(".")]
    Dot,

    #[token(",")]
    Comma,

    #[token(";")]
    Semi,

    #[token("(")]
    LParen,

    #[token(")")]
    RParen,

    #[token("{")]
    LBrace,

    #[token("}")]
    RBrace,

    #[token("[")]
    LBracket,

    #[token("]")]
    RBracket,
}

/// A lexed token with identifier text already interned.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Token {
    Int(i64),
    /// Integer written in hexadecimal (kept distinct for AST round-tripping)
    HexInt(i64),
    Real(f64),
    /// Index into the lexer's string-literal table
    Str(u32),
    Ident(Name),
    KwInt,
    KwObj,
    KwReal,
    KwVar,
    KwClass,
    KwIf,
    KwElse,
    KwWhile,
    KwBreak,
    KwContinue,
    KwReturn,
    KwIs,
    KwNot,
    KwNull,
    KwSkip,
    Walrus,
    EqEq,
    Le,
    Lt,
    Eq,
    Plus,
    Minus,
    Star,
    Slash,
    Dot,
    Comma,
    Semi,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Eof,
}

/// Lexing failure with the offending line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub line: u32,
    pub message: String,
}

/// Tokenised source, ready for the parser.
#[derive(Debug)]
pub struct Lexer {
    tokens: Vec<(Token, u32)>,
    strings: Vec<String>,
}

impl Lexer {
    /// Tokenise `source`, interning identifiers into `interner`.
    pub fn tokenize(source: &str, interner: &mut Interner) -> Result<Lexer, LexError> {
        let mut tokens = Vec::new();
        let mut strings = Vec::new();
        let mut lex = LogosToken::lexer(source);

        while let Some(result) = lex.next() {
            let line = line_of(source, lex.span().start);
            let tok = match result {
                Err(()) => {
                    return Err(LexError {
                        line,
                        message: format!("unexpected character `{}`", lex.slice()),
                    });
                }
                Ok(t) => t,
            };
            let token = match tok {
                LogosToken::Whitespace | LogosToken::LineComment => continue,
                LogosToken::Int => {
                    let value: i64 = lex.slice().parse().map_err(|_| LexError {
                        line,
                        message: format!("integer literal out of range: {}", lex.slice()),
                    })?;
                    Token::Int(value)
                }
                LogosToken::HexInt => {
                    let digits = &lex.slice()[2..];
                    let value = i64::from_str_radix(digits, 16).map_err(|_| LexError {
                        line,
                        message: format!("integer literal out of range: {}", lex.slice()),
                    })?;
                    Token::HexInt(value)
                }
                LogosToken::Real => {
                    let value: f64 = lex.slice().parse().map_err(|_| LexError {
                        line,
                        message: format!("malformed real literal: {}", lex.slice()),
                    })?;
                    Token::Real(value)
                }
                LogosToken::Str => {
                    let text = unescape(lex.slice(), line)?;
                    strings.push(text);
                    Token::Str((strings.len() - 1) as u32)
                }
                LogosToken::Ident => Token::Ident(interner.intern(lex.slice())),
                LogosToken::KwInt => Token::KwInt,
                LogosToken::KwObj => Token::KwObj,
                LogosToken::KwReal => Token::KwReal,
                LogosToken::KwVar => Token::KwVar,
                LogosToken::KwClass => Token::KwClass,
                LogosToken::KwIf => Token::KwIf,
                LogosToken::KwElse => Token::KwElse,
                LogosToken::KwWhile => Token::KwWhile,
                LogosToken::KwBreak => Token::KwBreak,
                LogosToken::KwContinue => Token::KwContinue,
                LogosToken::KwReturn => Token::KwReturn,
                LogosToken::KwIs => Token::KwIs,
                LogosToken::KwNot => Token::KwNot,
                LogosToken::KwNull => Token::KwNull,
                LogosToken::KwSkip => Token::KwSkip,
                LogosToken::Walrus => Token::Walrus,
                LogosToken::EqEq => Token::EqEq,
                LogosToken::Le => Token::Le,
                LogosToken::Lt => Token::Lt,
                LogosToken::Eq => Token::Eq,
                LogosToken::Plus => Token::Plus,
                LogosToken::Minus => Token::Minus,
                LogosToken::Star => Token::Star,
                LogosToken::Slash => Token::Slash,
                LogosToken::Dot => Token::Dot,
                LogosToken::Comma => Token::Comma,
                LogosToken::Semi => Token::Semi,
                LogosToken::LParen => Token::LParen,
                LogosToken::RParen => Token::RParen,
                LogosToken::LBrace => Token::LBrace,
                LogosToken::RBrace => Token::RBrace,
                LogosToken::LBracket => Token::LBracket,
                LogosToken::RBracket => Token::RBracket,
            };
            tokens.push((token, line));
        }

        let last_line = line_of(source, source.len());
        tokens.push((Token::Eof, last_line));
        Ok(Lexer { tokens, strings })
    }

    /// Token stream, terminated by [`Token::Eof`].
    pub fn tokens(&self) -> &[(Token, u32)] {
        &self.tokens
    }

    /// Resolve a string-literal index from [`Token::Str`].
    pub fn string(&self, index: u32) -> &str {
        &self.strings[index as usize]
    }
}

/// 1-based line number of a byte offset.
fn line_of(source: &str, offset: usize) -> u32 {
    1 + source.as_bytes()[..offset.min(source.len())]
        .iter()
        .filter(|&&b| b == b'\n')
        .count() as u32
}

/// Strip quotes and process escape sequences of a string literal.
fn unescape(slice: &str, line: u32) -> Result<String, LexError> {
    let inner = &slice[1..slice.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('0') => out.push('\0'),
            other => {
                return Err(LexError {
                    line,
                    message: format!("unknown escape sequence `\\{}`", other.unwrap_or(' ')),
                });
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(src: &str) -> (Vec<Token>, Interner) {
        let mut interner = Interner::new();
        let lexer = Lexer::tokenize(src, &mut interner).expect("lex failure");
        let toks = lexer.tokens().iter().map(|&(t, _)| t).collect();
        (toks, interner)
    }

    #[test]
    fn test_simple_statement() {
        let (toks, _) = lex("print(3+4);");
        assert!(matches!(toks[0], Token::Ident(_)));
        assert_eq!(toks[1], Token::LParen);
        assert_eq!(toks[2], Token::Int(3));
        assert_eq!(toks[3], Token::Plus);
        assert_eq!(toks[4], Token::Int(4));
        assert_eq!(toks[5], Token::RParen);
        assert_eq!(toks[6], Token::Semi);
        assert_eq!(toks[7], Token::Eof);
    }

    #[test]
    fn test_keywords_vs_idents() {
        let (toks, mut rest) = lex("int intx");
        assert_eq!(toks[0], Token::KwInt);
        let name = rest.intern("intx");
        assert_eq!(toks[1], Token::Ident(name));
    }

    #[test]
    fn test_walrus_and_eq() {
        let (toks, _) = lex("x := 1; y = 2; x == y;");
        assert!(toks.contains(&Token::Walrus));
        assert!(toks.contains(&Token::Eq));
        assert!(toks.contains(&Token::EqEq));
    }

    #[test]
    fn test_hex_literal() {
        let (toks, _) = lex("0x1f");
        assert_eq!(toks[0], Token::HexInt(31));
    }

    #[test]
    fn test_line_numbers() {
        let mut interner = Interner::new();
        let lexer = Lexer::tokenize("1;\n2;\n3;", &mut interner).unwrap();
        let lines: Vec<u32> = lexer.tokens().iter().map(|&(_, l)| l).collect();
        assert_eq!(&lines[..6], &[1, 1, 2, 2, 3, 3]);
    }

    #[test]
    fn test_string_escapes() {
        let mut interner = Interner::new();
        let lexer = Lexer::tokenize(r#""a\nb""#, &mut interner).unwrap();
        match lexer.tokens()[0].0 {
            Token::Str(i) => assert_eq!(lexer.string(i), "a\nb"),
            ref t => panic!("expected string, got {:?}", t),
        }
    }

    #[test]
    fn test_comments_skipped() {
        let (toks, _) = lex("// nothing here\n7;");
        assert_eq!(toks[0], Token::Int(7));
    }

    #[test]
    fn test_bad_character() {
        let mut interner = Interner::new();
        let err = Lexer::tokenize("a # b", &mut interner).unwrap_err();
        assert_eq!(err.line, 1);
    }
}
