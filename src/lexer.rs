//! Lexer for the tensor expression language using logos
//!
//! Supports tokens like:
//! - Identifiers: X, W1, acc
//! - Numbers: 1, 2.5, 3e-2 (sign is handled by the parser)
//! - Operators: @, #, +, -, *, >=
//! - Punctuation: (, ), [, ], ,, :, ?, =, .
//! - Keywords: let, in, def, for, fold, as

use logos::Logos;

/// Token types for the tensor expression language
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\n\r]+")]
#[logos(skip r"//[^\n]*")]
pub enum Token {
    // Literals
    #[regex(r"[0-9]+(\.[0-9]+)?([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    Number(f64),

    // Keywords
    #[token("let")]
    Let,

    #[token("in")]
    In,

    #[token("def")]
    Def,

    #[token("for")]
    For,

    #[token("fold")]
    Fold,

    #[token("as")]
    As,

    // Identifiers
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    // Operators
    #[token("@")]
    MatMul,

    #[token("#")]
    Conv,

    #[token("+")]
    Plus,

    #[token("-")]
    Minus,

    #[token("*")]
    Star,

    #[token(">=")]
    GreaterEq,

    #[token("=")]
    Equals,

    #[token(".")]
    Dot,

    // Punctuation
    #[token("(")]
    LParen,

    #[token(")")]
    RParen,

    #[token("[")]
    LBracket,

    #[token("]")]
    RBracket,

    #[token(",")]
    Comma,

    #[token(":")]
    Colon,

    #[token("?")]
    Question,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{}", n),
            Token::Ident(s) => write!(f, "{}", s),
            Token::Let => write!(f, "let"),
            Token::In => write!(f, "in"),
            Token::Def => write!(f, "def"),
            Token::For => write!(f, "for"),
            Token::Fold => write!(f, "fold"),
            Token::As => write!(f, "as"),
            Token::MatMul => write!(f, "@"),
            Token::Conv => write!(f, "#"),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::GreaterEq => write!(f, ">="),
            Token::Equals => write!(f, "="),
            Token::Dot => write!(f, "."),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Comma => write!(f, ","),
            Token::Colon => write!(f, ":"),
            Token::Question => write!(f, "?"),
        }
    }
}

/// Lexer wrapper that provides a stream of tokens
pub struct Lexer<'source> {
    inner: logos::Lexer<'source, Token>,
}

impl<'source> Lexer<'source> {
    pub fn new(source: &'source str) -> Self {
        Self {
            inner: Token::lexer(source),
        }
    }

    /// Byte range of the most recently produced token
    pub fn span(&self) -> std::ops::Range<usize> {
        self.inner.span()
    }

    /// Text of the most recently produced token
    pub fn slice(&self) -> &'source str {
        self.inner.slice()
    }
}

impl<'source> Iterator for Lexer<'source> {
    type Item = Result<Token, ()>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}
