//! Parser for tensor expressions
//!
//! Parses programs like:
//! - `let X : (4, 1) in [-1.0, 1.0] in W @ X + b`
//! - `let h = tanh(W @ X) in argmax(h)`
//! - `for i in [0:4] fold acc = 0 in acc * 0.5 + x`
//! - `def f(x: (2, 1)) = relu(x) in f(X)`

use crate::ast::{BinaryOp, Expr, Nonlinear, Shape, TensorLiteral, UnaryOp};
use crate::config::WordSize;
use crate::error::{CompileError, CompileResult};
use crate::lexer::{Lexer, Token};

/// Parser for tensor expression programs
pub struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    lex_error: Option<CompileError>,
    source_len: usize,
}

impl Parser {
    pub fn new(source: &str) -> Self {
        let mut lexer = Lexer::new(source);
        let mut tokens = Vec::new();
        let mut lex_error = None;

        while let Some(result) = lexer.next() {
            match result {
                Ok(tok) => tokens.push((tok, lexer.span().start)),
                Err(()) => {
                    lex_error = Some(CompileError::LexerError {
                        position: lexer.span().start,
                        message: format!("unexpected input `{}`", lexer.slice()),
                    });
                    break;
                }
            }
        }

        Self {
            tokens,
            pos: 0,
            lex_error,
            source_len: source.len(),
        }
    }

    fn current(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(tok, _)| tok)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(_, offset)| *offset)
            .unwrap_or(self.source_len)
    }

    fn error(&self, msg: impl std::fmt::Display) -> CompileError {
        CompileError::parse_error(format!("{} at offset {}", msg, self.offset()))
    }

    /// Advance to the next token
    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|(tok, _)| tok.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    /// Check if current token matches expected
    fn check(&self, expected: &Token) -> bool {
        match self.current() {
            Some(tok) => std::mem::discriminant(tok) == std::mem::discriminant(expected),
            None => false,
        }
    }

    /// Consume token if it matches, otherwise error
    fn expect(&mut self, expected: Token) -> CompileResult<Token> {
        if self.check(&expected) {
            self.advance()
                .ok_or_else(|| self.error("Unexpected end of input"))
        } else {
            Err(self.error(format!(
                "Expected `{}`, got {}",
                expected,
                self.describe_current()
            )))
        }
    }

    fn describe_current(&self) -> String {
        match self.current() {
            Some(tok) => format!("`{}`", tok),
            None => "end of input".to_string(),
        }
    }

    fn expect_ident(&mut self) -> CompileResult<String> {
        match self.current() {
            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.error(format!(
                "Expected identifier, got {}",
                self.describe_current()
            ))),
        }
    }

    /// Non-negative integer literal
    fn expect_int(&mut self) -> CompileResult<usize> {
        match self.current() {
            Some(Token::Number(n)) if n.fract() == 0.0 && *n >= 0.0 => {
                let n = *n as usize;
                self.advance();
                Ok(n)
            }
            _ => Err(self.error(format!(
                "Expected integer, got {}",
                self.describe_current()
            ))),
        }
    }

    /// Number with an optional leading minus
    fn expect_signed_number(&mut self) -> CompileResult<f64> {
        let negative = if self.check(&Token::Minus) {
            self.advance();
            true
        } else {
            false
        };

        match self.current() {
            Some(Token::Number(n)) => {
                let n = *n;
                self.advance();
                Ok(if negative { -n } else { n })
            }
            _ => Err(self.error(format!(
                "Expected number, got {}",
                self.describe_current()
            ))),
        }
    }

    /// Parse a complete program (a single expression)
    pub fn parse_program(&mut self) -> CompileResult<Expr> {
        if let Some(err) = self.lex_error.take() {
            return Err(err);
        }

        let expr = self.parse_expr()?;

        if self.current().is_some() {
            return Err(self.error(format!(
                "Unexpected trailing {}",
                self.describe_current()
            )));
        }

        Ok(expr)
    }

    /// Parse an expression, including binding forms
    pub fn parse_expr(&mut self) -> CompileResult<Expr> {
        match self.current() {
            Some(Token::Let) => self.parse_let(),
            Some(Token::Def) => self.parse_def(),
            Some(Token::For) => self.parse_loop(),
            _ => self.parse_cond(),
        }
    }

    /// `let x = e in body` or `let X : dims [as iN] in [lo, hi] in body`
    fn parse_let(&mut self) -> CompileResult<Expr> {
        self.expect(Token::Let)?;
        let name = self.expect_ident()?;

        if self.check(&Token::Colon) {
            self.advance();
            let shape = self.parse_dims()?;

            let width = if self.check(&Token::As) {
                self.advance();
                Some(self.parse_word()?)
            } else {
                None
            };

            self.expect(Token::In)?;
            self.expect(Token::LBracket)?;
            let lo = self.expect_signed_number()?;
            self.expect(Token::Comma)?;
            let hi = self.expect_signed_number()?;
            self.expect(Token::RBracket)?;

            if lo > hi {
                return Err(self.error(format!("Empty range [{}, {}] for `{}`", lo, hi, name)));
            }

            self.expect(Token::In)?;
            let body = self.parse_expr()?;

            return Ok(Expr::Input {
                name,
                shape,
                width,
                range: (lo, hi),
                body: Box::new(body),
            });
        }

        self.expect(Token::Equals)?;
        let value = self.parse_expr()?;
        self.expect(Token::In)?;
        let body = self.parse_expr()?;

        Ok(Expr::Let {
            name,
            value: Box::new(value),
            body: Box::new(body),
        })
    }

    fn parse_word(&mut self) -> CompileResult<WordSize> {
        let name = self.expect_ident()?;
        match name.as_str() {
            "i8" => Ok(WordSize::I8),
            "i16" => Ok(WordSize::I16),
            "i32" => Ok(WordSize::I32),
            other => Err(self.error(format!("Unknown word size `{}`", other))),
        }
    }

    /// `def f(x: dims, ...) = body in rest`
    fn parse_def(&mut self) -> CompileResult<Expr> {
        self.expect(Token::Def)?;
        let name = self.expect_ident()?;
        self.expect(Token::LParen)?;

        let mut params = Vec::new();
        while !self.check(&Token::RParen) {
            let param = self.expect_ident()?;
            self.expect(Token::Colon)?;
            let shape = self.parse_dims()?;
            params.push((param, shape));

            if self.check(&Token::Comma) {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(Token::RParen)?;

        self.expect(Token::Equals)?;
        let body = self.parse_expr()?;
        self.expect(Token::In)?;
        let rest = self.parse_expr()?;

        Ok(Expr::FuncDef {
            name,
            params,
            body: Box::new(body),
            rest: Box::new(rest),
        })
    }

    /// `for i in [start:end] fold acc = init in body`
    fn parse_loop(&mut self) -> CompileResult<Expr> {
        self.expect(Token::For)?;
        let index = self.expect_ident()?;
        self.expect(Token::In)?;
        self.expect(Token::LBracket)?;
        let start = self.expect_int()?;
        self.expect(Token::Colon)?;
        let end = self.expect_int()?;
        self.expect(Token::RBracket)?;

        if end <= start {
            return Err(self.error(format!("Empty loop range [{}:{}]", start, end)));
        }

        self.expect(Token::Fold)?;
        let acc = self.expect_ident()?;
        self.expect(Token::Equals)?;
        let init = self.parse_expr()?;
        self.expect(Token::In)?;
        let body = self.parse_expr()?;

        Ok(Expr::Loop {
            index,
            start,
            end,
            acc,
            init: Box::new(init),
            body: Box::new(body),
        })
    }

    /// `p >= 0 ? a : b`
    fn parse_cond(&mut self) -> CompileResult<Expr> {
        let predicate = self.parse_additive()?;

        if !self.check(&Token::GreaterEq) {
            return Ok(predicate);
        }
        self.advance();

        match self.current() {
            Some(Token::Number(n)) if *n == 0.0 => {
                self.advance();
            }
            _ => return Err(self.error("Conditions compare against 0 (`p >= 0 ? a : b`)")),
        }

        self.expect(Token::Question)?;
        let then_branch = self.parse_expr()?;
        self.expect(Token::Colon)?;
        let else_branch = self.parse_expr()?;

        Ok(Expr::Cond {
            predicate: Box::new(predicate),
            then_branch: Box::new(then_branch),
            else_branch: Box::new(else_branch),
        })
    }

    /// Parse additive expressions: a + b, a - b
    fn parse_additive(&mut self) -> CompileResult<Expr> {
        let mut left = self.parse_multiplicative()?;

        loop {
            let op = if self.check(&Token::Plus) {
                BinaryOp::Add
            } else if self.check(&Token::Minus) {
                BinaryOp::Sub
            } else {
                break;
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = binary(op, left, right);
        }

        Ok(left)
    }

    /// Parse multiplicative expressions: a * b, A # F
    fn parse_multiplicative(&mut self) -> CompileResult<Expr> {
        let mut left = self.parse_matmul()?;

        loop {
            let op = if self.check(&Token::Star) {
                BinaryOp::Mul
            } else if self.check(&Token::Conv) {
                BinaryOp::Conv
            } else {
                break;
            };
            self.advance();
            let right = self.parse_matmul()?;
            left = binary(op, left, right);
        }

        Ok(left)
    }

    /// Parse matrix multiplication: a @ b
    fn parse_matmul(&mut self) -> CompileResult<Expr> {
        let mut left = self.parse_unary()?;
        while self.check(&Token::MatMul) {
            self.advance();
            let right = self.parse_unary()?;
            left = binary(BinaryOp::MatMul, left, right);
        }
        Ok(left)
    }

    /// Parse unary expressions: -a
    fn parse_unary(&mut self) -> CompileResult<Expr> {
        if self.check(&Token::Minus) {
            self.advance();
            let operand = self.parse_unary()?;
            Ok(match operand {
                Expr::Number(n) => Expr::Number(-n),
                operand => Expr::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                },
            })
        } else {
            self.parse_postfix()
        }
    }

    /// Parse postfix expressions: a.T, a[i]
    fn parse_postfix(&mut self) -> CompileResult<Expr> {
        let mut expr = self.parse_primary()?;

        loop {
            if self.check(&Token::Dot) {
                self.advance();
                let attr = self.expect_ident()?;
                if attr != "T" {
                    return Err(self.error(format!("Unknown attribute: {}", attr)));
                }
                expr = Expr::Unary {
                    op: UnaryOp::Transpose,
                    operand: Box::new(expr),
                };
            } else if self.check(&Token::LBracket) {
                self.advance();
                let index = self.parse_expr()?;
                self.expect(Token::RBracket)?;
                expr = Expr::Index {
                    operand: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                break;
            }
        }

        Ok(expr)
    }

    /// Parse primary expressions: literals, variables, parenthesized, calls
    fn parse_primary(&mut self) -> CompileResult<Expr> {
        match self.current() {
            Some(Token::Number(n)) => {
                let n = *n;
                self.advance();
                Ok(Expr::Number(n))
            }

            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.advance();

                if self.check(&Token::LParen) {
                    return self.parse_call(name);
                }

                Ok(Expr::Variable(name))
            }

            Some(Token::LParen) => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }

            Some(Token::LBracket) => {
                let (dims, values) = self.parse_tensor()?;
                Ok(Expr::Tensor(TensorLiteral::new(Shape::new(dims), values)))
            }

            None => Err(self.error("Unexpected end of input")),

            Some(_) => Err(self.error(format!("Unexpected {}", self.describe_current()))),
        }
    }

    /// Built-in or user function call; the name has been consumed
    fn parse_call(&mut self, name: String) -> CompileResult<Expr> {
        if name == "reshape" {
            self.expect(Token::LParen)?;
            let operand = self.parse_expr()?;
            self.expect(Token::Comma)?;
            let shape = self.parse_dims()?;
            self.expect(Token::RParen)?;
            return Ok(Expr::Reshape {
                operand: Box::new(operand),
                shape,
            });
        }

        let mut args = self.parse_args()?;

        let unary = match name.as_str() {
            "relu" => Some(UnaryOp::Relu),
            "argmax" => Some(UnaryOp::ArgMax),
            _ => None,
        };
        let builtin = unary.is_some() || Nonlinear::from_name(&name).is_some();

        if builtin && args.len() != 1 {
            return Err(self.error(format!(
                "{} expects 1 argument, got {}",
                name,
                args.len()
            )));
        }

        if let Some(op) = unary {
            return Ok(Expr::Unary {
                op,
                operand: Box::new(args.remove(0)),
            });
        }

        if let Some(func) = Nonlinear::from_name(&name) {
            return Ok(Expr::Nonlinear {
                func,
                arg: Box::new(args.remove(0)),
            });
        }

        Ok(Expr::FuncCall { name, args })
    }

    /// Parse function arguments: (arg1, arg2, ...)
    fn parse_args(&mut self) -> CompileResult<Vec<Expr>> {
        self.expect(Token::LParen)?;

        let mut args = Vec::new();

        if !self.check(&Token::RParen) {
            args.push(self.parse_expr()?);

            while self.check(&Token::Comma) {
                self.advance();
                if self.check(&Token::RParen) {
                    break; // Trailing comma
                }
                args.push(self.parse_expr()?);
            }
        }

        self.expect(Token::RParen)?;
        Ok(args)
    }

    /// Parse a shape: `()`, `(4)`, `(4,)`, `(4, 1)`
    fn parse_dims(&mut self) -> CompileResult<Shape> {
        self.expect(Token::LParen)?;

        let mut dims = Vec::new();
        while !self.check(&Token::RParen) {
            let dim = self.expect_int()?;
            if dim == 0 {
                return Err(self.error("Dimensions must be positive"));
            }
            dims.push(dim);

            if self.check(&Token::Comma) {
                self.advance();
            } else {
                break;
            }
        }

        self.expect(Token::RParen)?;
        Ok(Shape::new(dims))
    }

    /// Parse a nested tensor literal, returning its dimensions and row-major values
    fn parse_tensor(&mut self) -> CompileResult<(Vec<usize>, Vec<f64>)> {
        self.expect(Token::LBracket)?;

        if self.check(&Token::LBracket) {
            let mut inner_dims: Option<Vec<usize>> = None;
            let mut values = Vec::new();
            let mut count = 0;

            while self.check(&Token::LBracket) {
                let (dims, mut sub) = self.parse_tensor()?;
                match &inner_dims {
                    Some(expected) if *expected != dims => {
                        return Err(self.error(format!(
                            "Ragged tensor literal: element {} has shape {}, expected {}",
                            count,
                            Shape::new(dims),
                            Shape::new(expected.clone())
                        )));
                    }
                    _ => inner_dims = Some(dims),
                }
                values.append(&mut sub);
                count += 1;

                if self.check(&Token::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }

            self.expect(Token::RBracket)?;

            let mut dims = vec![count];
            dims.extend(inner_dims.unwrap_or_default());
            Ok((dims, values))
        } else {
            let mut values = Vec::new();

            while !self.check(&Token::RBracket) {
                values.push(self.expect_signed_number()?);

                if self.check(&Token::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }

            self.expect(Token::RBracket)?;

            if values.is_empty() {
                return Err(self.error("Empty tensor literal"));
            }
            Ok((vec![values.len()], values))
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

/// Parse a complete program
pub fn parse(source: &str) -> CompileResult<Expr> {
    Parser::new(source).parse_program()
}
