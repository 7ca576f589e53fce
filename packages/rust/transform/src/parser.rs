//! Recursive descent parser for transform expressions.
//!
//! Grammar:
//! ```text
//! function   := params '=>' expr
//! params     := IDENT | '(' ')' | '(' IDENT ')' | '(' '{' IDENT (',' IDENT)* [','] '}' ')'
//! expr       := nullish ['?' expr ':' expr]
//! nullish    := or ('??' or)*
//! or         := and ('||' and)*
//! and        := equality ('&&' equality)*
//! equality   := comparison (('==' | '!=') comparison)*
//! comparison := additive (('<' | '<=' | '>' | '>=') additive)*
//! additive   := term (('+' | '-') term)*
//! term       := unary (('*' | '/' | '%') unary)*
//! unary      := ('!' | '-') unary | postfix
//! postfix    := primary ('.' IDENT | '?.' IDENT | '[' expr ']' | '?.' '[' expr ']' | '(' args ')')*
//! primary    := literal | IDENT | lambda | '(' expr ')' | array | object
//! lambda     := IDENT '=>' expr | '(' [IDENT (',' IDENT)*] ')' '=>' expr
//! ```

use serde_json::Value;

use crate::lexer::{Spanned, Token, tokenize};

/// Maximum syntactic nesting accepted by the parser.
const MAX_PARSE_DEPTH: usize = 64;

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// How the single context argument is bound.
#[derive(Debug, Clone, PartialEq)]
pub enum Params {
    /// `(ctx) => ...`: the whole context under one name.
    Whole(String),
    /// `({ a, b }) => ...`: selected context fields.
    Destructured(Vec<String>),
    /// `() => ...`
    None,
}

/// A compiled operator function.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub params: Params,
    pub body: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogicalOp {
    And,
    Or,
    Nullish,
}

/// One entry of an object literal.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectEntry {
    Field(String, Expr),
    Spread(Expr),
}

/// One element of an array literal.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayEntry {
    Item(Expr),
    Spread(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Var(String),
    Array(Vec<ArrayEntry>),
    Object(Vec<ObjectEntry>),
    Member {
        object: Box<Expr>,
        property: String,
        optional: bool,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
        optional: bool,
    },
    /// `object.method(args)`
    MethodCall {
        object: Box<Expr>,
        method: String,
        args: Vec<Expr>,
        optional: bool,
    },
    /// `helper(args)`
    HelperCall {
        name: String,
        args: Vec<Expr>,
    },
    Lambda {
        params: Vec<String>,
        body: Box<Expr>,
    },
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Logical(LogicalOp, Box<Expr>, Box<Expr>),
    Conditional {
        test: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parse a single-expression arrow function.
pub fn parse_function(source: &str) -> Result<Function, String> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err("empty source".into());
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let function = parser.function()?;
    if let Some(extra) = parser.peek() {
        return Err(format!(
            "unexpected {} at offset {} after the function body",
            extra.token.describe(),
            extra.offset
        ));
    }
    Ok(function)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Spanned> {
        self.tokens.get(self.pos)
    }

    fn peek_token(&self) -> Option<&Token> {
        self.peek().map(|s| &s.token)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Token> {
        self.tokens.get(self.pos + ahead).map(|s| &s.token)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|s| s.token.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek_token() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("expected {}", expected.describe())))
        }
    }

    fn unexpected(&self, context: &str) -> String {
        match self.peek() {
            Some(s) => format!("{context}, found {} at offset {}", s.token.describe(), s.offset),
            None => format!("{context}, found end of input"),
        }
    }

    fn ident(&mut self) -> Result<String, String> {
        match self.peek_token() {
            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.unexpected("expected identifier")),
        }
    }

    // -- function ----------------------------------------------------------

    fn function(&mut self) -> Result<Function, String> {
        let params = match self.peek_token() {
            Some(Token::Ident(_)) => Params::Whole(self.ident()?),
            Some(Token::LParen) => {
                self.pos += 1;
                let params = if self.eat(&Token::RParen) {
                    return self.function_body(Params::None);
                } else if self.eat(&Token::LBrace) {
                    let mut names = Vec::new();
                    while !self.eat(&Token::RBrace) {
                        names.push(self.ident()?);
                        if !self.eat(&Token::Comma) {
                            self.expect(Token::RBrace)?;
                            break;
                        }
                    }
                    Params::Destructured(names)
                } else {
                    Params::Whole(self.ident()?)
                };
                self.expect(Token::RParen)?;
                params
            }
            _ => return Err(self.unexpected("expected an arrow function")),
        };
        self.function_body(params)
    }

    fn function_body(&mut self, params: Params) -> Result<Function, String> {
        self.expect(Token::Arrow)?;
        if self.peek_token() == Some(&Token::LBrace) && !self.looks_like_object() {
            return Err(self.unexpected("function body must be a single expression"));
        }
        let body = self.expr()?;
        Ok(Function { params, body })
    }

    /// At `{`: is this an object literal rather than a statement block?
    fn looks_like_object(&self) -> bool {
        match (self.peek_at(1), self.peek_at(2)) {
            (Some(Token::RBrace), _) => true,
            (Some(Token::Ellipsis), _) => true,
            (Some(Token::Ident(_) | Token::Str(_)), Some(Token::Colon | Token::Comma | Token::RBrace)) => true,
            _ => false,
        }
    }

    // -- expressions -------------------------------------------------------

    fn expr(&mut self) -> Result<Expr, String> {
        self.depth += 1;
        if self.depth > MAX_PARSE_DEPTH {
            return Err(format!("expression nested deeper than {MAX_PARSE_DEPTH} levels"));
        }
        let result = self.conditional();
        self.depth -= 1;
        result
    }

    fn conditional(&mut self) -> Result<Expr, String> {
        let test = self.logical(0)?;
        if !self.eat(&Token::Question) {
            return Ok(test);
        }
        let then = self.expr()?;
        self.expect(Token::Colon)?;
        let otherwise = self.expr()?;
        Ok(Expr::Conditional {
            test: Box::new(test),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    /// Precedence levels: `??`, `||`, `&&`.
    fn logical(&mut self, level: usize) -> Result<Expr, String> {
        let (token, op) = match level {
            0 => (Token::Nullish, LogicalOp::Nullish),
            1 => (Token::OrOr, LogicalOp::Or),
            2 => (Token::AndAnd, LogicalOp::And),
            _ => return self.equality(),
        };
        let mut left = self.logical(level + 1)?;
        while self.eat(&token) {
            let right = self.logical(level + 1)?;
            left = Expr::Logical(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr, String> {
        let mut left = self.comparison()?;
        loop {
            let op = match self.peek_token() {
                Some(Token::EqEq) => BinaryOp::Eq,
                Some(Token::NotEq) => BinaryOp::NotEq,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.comparison()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn comparison(&mut self) -> Result<Expr, String> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek_token() {
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::LtEq) => BinaryOp::LtEq,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::GtEq) => BinaryOp::GtEq,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn additive(&mut self) -> Result<Expr, String> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek_token() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn term(&mut self) -> Result<Expr, String> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek_token() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn unary(&mut self) -> Result<Expr, String> {
        let op = match self.peek_token() {
            Some(Token::Bang) => UnaryOp::Not,
            Some(Token::Minus) => UnaryOp::Neg,
            _ => return self.postfix(),
        };
        self.pos += 1;
        self.depth += 1;
        if self.depth > MAX_PARSE_DEPTH {
            return Err(format!("expression nested deeper than {MAX_PARSE_DEPTH} levels"));
        }
        let operand = self.unary();
        self.depth -= 1;
        Ok(Expr::Unary(op, Box::new(operand?)))
    }

    fn postfix(&mut self) -> Result<Expr, String> {
        let mut expr = self.primary()?;
        loop {
            match self.peek_token() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    let property = self.ident()?;
                    expr = self.member_or_call(expr, property, false)?;
                }
                Some(Token::QuestionDot) => {
                    self.pos += 1;
                    if self.eat(&Token::LBracket) {
                        let index = self.expr()?;
                        self.expect(Token::RBracket)?;
                        expr = Expr::Index {
                            object: Box::new(expr),
                            index: Box::new(index),
                            optional: true,
                        };
                    } else {
                        let property = self.ident()?;
                        expr = self.member_or_call(expr, property, true)?;
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.expr()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                        optional: false,
                    };
                }
                Some(Token::LParen) => match expr {
                    Expr::Var(name) => {
                        self.pos += 1;
                        let args = self.args()?;
                        expr = Expr::HelperCall { name, args };
                    }
                    _ => return Err(self.unexpected("only methods and helpers can be called")),
                },
                _ => return Ok(expr),
            }
        }
    }

    fn member_or_call(&mut self, object: Expr, name: String, optional: bool) -> Result<Expr, String> {
        if self.eat(&Token::LParen) {
            let args = self.args()?;
            Ok(Expr::MethodCall {
                object: Box::new(object),
                method: name,
                args,
                optional,
            })
        } else {
            Ok(Expr::Member {
                object: Box::new(object),
                property: name,
                optional,
            })
        }
    }

    /// Arguments after an opening `(`, through the closing `)`.
    fn args(&mut self) -> Result<Vec<Expr>, String> {
        let mut args = Vec::new();
        while !self.eat(&Token::RParen) {
            args.push(self.expr()?);
            if !self.eat(&Token::Comma) {
                self.expect(Token::RParen)?;
                break;
            }
        }
        Ok(args)
    }

    fn primary(&mut self) -> Result<Expr, String> {
        if self.is_lambda_start() {
            return self.lambda();
        }

        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Literal(number_value(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(name)) => Ok(match name.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" | "undefined" => Expr::Literal(Value::Null),
                _ => Expr::Var(name),
            }),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => self.array(),
            Some(Token::LBrace) => self.object(),
            Some(_) => {
                self.pos -= 1;
                Err(self.unexpected("expected an expression"))
            }
            None => Err(self.unexpected("expected an expression")),
        }
    }

    fn is_lambda_start(&self) -> bool {
        match self.peek_token() {
            Some(Token::Ident(_)) => self.peek_at(1) == Some(&Token::Arrow),
            Some(Token::LParen) => {
                // `(` [IDENT (, IDENT)*] `)` `=>`
                let mut ahead = 1;
                loop {
                    match self.peek_at(ahead) {
                        Some(Token::RParen) => return self.peek_at(ahead + 1) == Some(&Token::Arrow),
                        Some(Token::Ident(_)) => ahead += 1,
                        _ => return false,
                    }
                    match self.peek_at(ahead) {
                        Some(Token::Comma) => ahead += 1,
                        Some(Token::RParen) => {}
                        _ => return false,
                    }
                }
            }
            _ => false,
        }
    }

    fn lambda(&mut self) -> Result<Expr, String> {
        let mut params = Vec::new();
        if self.eat(&Token::LParen) {
            while !self.eat(&Token::RParen) {
                params.push(self.ident()?);
                self.eat(&Token::Comma);
            }
        } else {
            params.push(self.ident()?);
        }
        self.expect(Token::Arrow)?;
        let body = self.expr()?;
        Ok(Expr::Lambda {
            params,
            body: Box::new(body),
        })
    }

    fn array(&mut self) -> Result<Expr, String> {
        let mut entries = Vec::new();
        while !self.eat(&Token::RBracket) {
            if self.eat(&Token::Ellipsis) {
                entries.push(ArrayEntry::Spread(self.expr()?));
            } else {
                entries.push(ArrayEntry::Item(self.expr()?));
            }
            if !self.eat(&Token::Comma) {
                self.expect(Token::RBracket)?;
                break;
            }
        }
        Ok(Expr::Array(entries))
    }

    fn object(&mut self) -> Result<Expr, String> {
        let mut entries = Vec::new();
        while !self.eat(&Token::RBrace) {
            if self.eat(&Token::Ellipsis) {
                entries.push(ObjectEntry::Spread(self.expr()?));
            } else {
                let key = match self.advance() {
                    Some(Token::Ident(name)) => name,
                    Some(Token::Str(s)) => s,
                    Some(Token::Number(n)) => number_value(n).to_string(),
                    Some(_) => {
                        self.pos -= 1;
                        return Err(self.unexpected("expected an object key"));
                    }
                    None => return Err(self.unexpected("expected an object key")),
                };
                let value = if self.eat(&Token::Colon) {
                    self.expr()?
                } else {
                    // Shorthand `{ name }`
                    Expr::Var(key.clone())
                };
                entries.push(ObjectEntry::Field(key, value));
            }
            if !self.eat(&Token::Comma) {
                self.expect(Token::RBrace)?;
                break;
            }
        }
        Ok(Expr::Object(entries))
    }
}

/// Integral numbers are kept as JSON integers.
pub(crate) fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_destructured_params() {
        let f = parse_function("({ item, data, }) => item").unwrap();
        assert_eq!(f.params, Params::Destructured(vec!["item".into(), "data".into()]));
        assert_eq!(f.body, Expr::Var("item".into()));
    }

    #[test]
    fn parses_whole_context_param() {
        let f = parse_function("ctx => ctx.item").unwrap();
        assert_eq!(f.params, Params::Whole("ctx".into()));
        let f = parse_function("(ctx) => ctx.item").unwrap();
        assert_eq!(f.params, Params::Whole("ctx".into()));
        let f = parse_function("() => 1").unwrap();
        assert_eq!(f.params, Params::None);
    }

    #[test]
    fn respects_precedence() {
        let f = parse_function("() => 1 + 2 * 3 == 7 && !false").unwrap();
        let Expr::Logical(LogicalOp::And, left, _) = f.body else {
            panic!("expected &&");
        };
        assert!(matches!(*left, Expr::Binary(BinaryOp::Eq, _, _)));
    }

    #[test]
    fn parses_method_chain_with_lambda() {
        let f = parse_function("({ item }) => item.tags.filter(t => t != 'x').join(', ')").unwrap();
        let Expr::MethodCall { method, object, .. } = f.body else {
            panic!("expected method call");
        };
        assert_eq!(method, "join");
        let Expr::MethodCall { method, args, .. } = *object else {
            panic!("expected inner method call");
        };
        assert_eq!(method, "filter");
        assert!(matches!(args[0], Expr::Lambda { .. }));
    }

    #[test]
    fn parses_object_literals() {
        let f = parse_function("({ item }) => ({ ...item, extra: 1, item, 'quoted key': null })").unwrap();
        let Expr::Object(entries) = f.body else {
            panic!("expected object");
        };
        assert_eq!(entries.len(), 4);
        assert!(matches!(entries[0], ObjectEntry::Spread(_)));

        // Unparenthesised object bodies are accepted too.
        assert!(parse_function("({ item }) => { a: item }").is_ok());
    }

    #[test]
    fn rejects_non_functions() {
        assert!(parse_function("").is_err());
        assert!(parse_function("item.title").is_err());
        assert!(parse_function("function (x) { return x }").is_err());
        assert!(parse_function("({ item }) => { return item; }").is_err());
        assert!(parse_function("({ item }) => item +").is_err());
        assert!(parse_function("({ item }) => item item").is_err());
        assert!(parse_function("({ item }) => (1)(2)").is_err());
    }

    #[test]
    fn rejects_excessive_nesting() {
        let source = format!("() => {}1{}", "(".repeat(200), ")".repeat(200));
        let err = parse_function(&source).unwrap_err();
        assert!(err.contains("nested deeper"));
    }
}
