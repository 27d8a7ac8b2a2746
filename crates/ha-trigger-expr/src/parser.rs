//! Recursive-descent parser for trigger expressions
//!
//! The grammar is the expression subset of Python: conditional expressions,
//! `and`/`or`/`not`, chained comparisons, arithmetic, calls, subscripts,
//! attribute access and container literals. Error messages match what the
//! Python grammar reports for the same input so that decorator errors read
//! the same as errors in ordinary script code.

use std::sync::Arc;

use crate::ast::{BinOp, BoolOp, CmpOp, ConditionTree, Expr, ExprKind, UnaryOp};
use crate::diagnostic::{Diagnostic, Origin};
use crate::lexer::{
    tokenize, SyntaxError, Token, TokenKind, INVALID_SYNTAX, MAX_NESTING, TOO_COMPLEX,
    TOO_MANY_NESTED, UNEXPECTED_EOF,
};
use crate::value::Value;

const KEYWORDS: &[&str] = &[
    "and", "as", "assert", "async", "await", "break", "class", "continue", "def", "del", "elif",
    "else", "except", "finally", "for", "from", "global", "if", "import", "in", "is", "lambda",
    "nonlocal", "not", "or", "pass", "raise", "return", "try", "while", "with", "yield",
];

/// Parse one expression into a [`ConditionTree`]
///
/// Syntax errors come back as a `SyntaxError` diagnostic already mapped onto
/// `origin`.
pub fn parse(source: &str, origin: &Origin) -> Result<ConditionTree, Diagnostic> {
    let root = parse_expression(source)
        .map_err(|err| Diagnostic::syntax(origin, source, &err.message, err.offset))?;
    Ok(ConditionTree::new(Arc::from(source), origin.clone(), root))
}

/// Parse raw expression text without attaching an origin
pub fn parse_expression(source: &str) -> Result<Expr, SyntaxError> {
    let mut parser = Parser::new(tokenize(source)?);
    parser.skip_newlines();
    if parser.at_eof() {
        return Err(SyntaxError::new(UNEXPECTED_EOF, source.len()));
    }
    let expr = parser.expression()?;
    parser.skip_newlines();
    parser.expect_eof()?;
    Ok(expr)
}

/// Positional and keyword arguments of a call, as written
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments {
    pub positional: Vec<Expr>,
    pub keywords: Vec<(String, Expr)>,
}

/// Parse the text between the parentheses of a call, e.g. a decorator's
/// `"pyscript.var1 == 1", state_hold=5`
pub fn parse_arguments(source: &str) -> Result<Arguments, SyntaxError> {
    let mut parser = Parser::new(tokenize(source)?);
    // Arguments always sit inside the decorator's parentheses
    parser.depth = 1;
    parser.skip_newlines();
    let args = parser.arguments(&TokenKind::Eof)?;
    parser.skip_newlines();
    parser.expect_eof()?;
    Ok(args)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Open brackets at the current position
    depth: usize,
    /// Right-recursive operators at the current position
    nesting: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
            nesting: 0,
        }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn peek_second(&self) -> &TokenKind {
        &self.tokens[(self.pos + 1).min(self.tokens.len() - 1)].kind
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek_kind(), TokenKind::Eof)
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        self.peek_kind().is_keyword(keyword)
    }

    fn eat(&mut self, kind: &TokenKind) -> Option<Token> {
        if self.peek_kind() == kind {
            Some(self.advance())
        } else {
            None
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> Option<Token> {
        if self.at_keyword(keyword) {
            Some(self.advance())
        } else {
            None
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek_kind(), TokenKind::Newline) {
            self.advance();
        }
    }

    /// Error for the current token: EOF inside brackets reads differently
    fn unexpected(&self) -> SyntaxError {
        let token = self.peek();
        if matches!(token.kind, TokenKind::Eof) && self.depth > 0 {
            SyntaxError::new(UNEXPECTED_EOF, token.span.start)
        } else {
            SyntaxError::new(INVALID_SYNTAX, token.span.start)
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<Token, SyntaxError> {
        self.eat(kind).ok_or_else(|| self.unexpected())
    }

    fn expect_eof(&self) -> Result<(), SyntaxError> {
        if self.at_eof() {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn open(&mut self, kind: &TokenKind) -> Result<Token, SyntaxError> {
        if self.depth + self.nesting >= MAX_NESTING && self.peek_kind() == kind {
            return Err(SyntaxError::new(TOO_MANY_NESTED, self.peek().span.start));
        }
        let token = self.expect(kind)?;
        self.depth += 1;
        Ok(token)
    }

    /// Run a right-recursive production one level deeper
    fn nested(
        &mut self,
        production: fn(&mut Self) -> Result<Expr, SyntaxError>,
    ) -> Result<Expr, SyntaxError> {
        if self.depth + self.nesting >= MAX_NESTING {
            return Err(SyntaxError::new(TOO_COMPLEX, self.peek().span.start));
        }
        self.nesting += 1;
        let result = production(self);
        self.nesting -= 1;
        result
    }

    fn close(&mut self, kind: &TokenKind) -> Result<Token, SyntaxError> {
        let token = self.expect(kind)?;
        self.depth -= 1;
        Ok(token)
    }

    // --- Grammar ---

    fn expression(&mut self) -> Result<Expr, SyntaxError> {
        let body = self.or_test()?;
        if self.eat_keyword("if").is_none() {
            return Ok(body);
        }
        let test = self.or_test()?;
        if self.eat_keyword("else").is_none() {
            return Err(self.unexpected());
        }
        let orelse = self.nested(Self::expression)?;
        let span = body.span.to(orelse.span);
        Ok(Expr::new(
            ExprKind::IfExp {
                test: Box::new(test),
                body: Box::new(body),
                orelse: Box::new(orelse),
            },
            span,
        ))
    }

    fn or_test(&mut self) -> Result<Expr, SyntaxError> {
        self.bool_chain("or", BoolOp::Or, Self::and_test)
    }

    fn and_test(&mut self) -> Result<Expr, SyntaxError> {
        self.bool_chain("and", BoolOp::And, Self::not_test)
    }

    fn bool_chain(
        &mut self,
        keyword: &str,
        op: BoolOp,
        operand: fn(&mut Self) -> Result<Expr, SyntaxError>,
    ) -> Result<Expr, SyntaxError> {
        let first = operand(self)?;
        if !self.at_keyword(keyword) {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_keyword(keyword).is_some() {
            values.push(operand(self)?);
        }
        let span = values[0].span.to(values[values.len() - 1].span);
        Ok(Expr::new(ExprKind::BoolOp { op, values }, span))
    }

    fn not_test(&mut self) -> Result<Expr, SyntaxError> {
        if let Some(token) = self.eat_keyword("not") {
            let operand = self.nested(Self::not_test)?;
            let span = token.span.to(operand.span);
            return Ok(Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                span,
            ));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, SyntaxError> {
        let left = self.arith()?;
        let mut ops = Vec::new();
        while let Some(op) = self.comparison_op() {
            ops.push((op, self.arith()?));
        }
        if ops.is_empty() {
            return Ok(left);
        }
        let span = left.span.to(ops[ops.len() - 1].1.span);
        Ok(Expr::new(
            ExprKind::Compare {
                left: Box::new(left),
                ops,
            },
            span,
        ))
    }

    fn comparison_op(&mut self) -> Option<CmpOp> {
        let kind = self.peek_kind();
        let second = self.peek_second();
        let (op, width) = match kind {
            TokenKind::EqEq => (CmpOp::Eq, 1),
            TokenKind::NotEq => (CmpOp::NotEq, 1),
            TokenKind::Lt => (CmpOp::Lt, 1),
            TokenKind::Le => (CmpOp::Le, 1),
            TokenKind::Gt => (CmpOp::Gt, 1),
            TokenKind::Ge => (CmpOp::Ge, 1),
            k if k.is_keyword("in") => (CmpOp::In, 1),
            k if k.is_keyword("not") && second.is_keyword("in") => (CmpOp::NotIn, 2),
            k if k.is_keyword("is") && second.is_keyword("not") => (CmpOp::IsNot, 2),
            k if k.is_keyword("is") => (CmpOp::Is, 1),
            _ => return None,
        };
        for _ in 0..width {
            self.advance();
        }
        Some(op)
    }

    fn arith(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.term()?;
            left = binary(op, left, right);
        }
    }

    fn term(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.factor()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::DoubleSlash => BinOp::FloorDiv,
                TokenKind::Percent => BinOp::Mod,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.factor()?;
            left = binary(op, left, right);
        }
    }

    fn factor(&mut self) -> Result<Expr, SyntaxError> {
        let op = match self.peek_kind() {
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Plus => UnaryOp::Pos,
            _ => return self.power(),
        };
        let token = self.advance();
        let operand = self.nested(Self::factor)?;
        let span = token.span.to(operand.span);
        Ok(Expr::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            span,
        ))
    }

    fn power(&mut self) -> Result<Expr, SyntaxError> {
        let base = self.primary()?;
        if self.eat(&TokenKind::DoubleStar).is_some() {
            // Right associative, and binds tighter than unary minus on the left only
            let exponent = self.nested(Self::factor)?;
            return Ok(binary(BinOp::Pow, base, exponent));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Expr, SyntaxError> {
        let mut expr = self.atom()?;
        loop {
            match self.peek_kind() {
                TokenKind::Dot => {
                    self.advance();
                    let token = self.advance();
                    let attr = match token.kind {
                        TokenKind::Name(name) if !KEYWORDS.contains(&name.as_str()) => name,
                        _ => return Err(SyntaxError::new(INVALID_SYNTAX, token.span.start)),
                    };
                    let span = expr.span.to(token.span);
                    expr = match expr.kind {
                        ExprKind::Name(mut path) => {
                            path.push(attr);
                            Expr::new(ExprKind::Name(path), span)
                        }
                        kind => Expr::new(
                            ExprKind::Attribute {
                                value: Box::new(Expr::new(kind, expr.span)),
                                attr,
                            },
                            span,
                        ),
                    };
                }
                TokenKind::LParen => {
                    self.open(&TokenKind::LParen)?;
                    let args = self.arguments(&TokenKind::RParen)?;
                    let close = self.close(&TokenKind::RParen)?;
                    let span = expr.span.to(close.span);
                    expr = Expr::new(
                        ExprKind::Call {
                            func: Box::new(expr),
                            args: args.positional,
                            keywords: args.keywords,
                        },
                        span,
                    );
                }
                TokenKind::LBracket => {
                    self.open(&TokenKind::LBracket)?;
                    let index = self.expression()?;
                    let close = self.close(&TokenKind::RBracket)?;
                    let span = expr.span.to(close.span);
                    expr = Expr::new(
                        ExprKind::Subscript {
                            value: Box::new(expr),
                            index: Box::new(index),
                        },
                        span,
                    );
                }
                _ => return Ok(expr),
            }
        }
    }

    /// Comma-separated call arguments up to (not including) `end`
    fn arguments(&mut self, end: &TokenKind) -> Result<Arguments, SyntaxError> {
        let mut args = Arguments::default();
        while self.peek_kind() != end {
            let is_keyword = matches!(self.peek_kind(), TokenKind::Name(_))
                && matches!(self.peek_second(), TokenKind::Assign);
            if is_keyword {
                let token = self.advance();
                self.advance();
                let TokenKind::Name(name) = token.kind else {
                    unreachable!("checked above");
                };
                args.keywords.push((name, self.expression()?));
            } else if !args.keywords.is_empty() {
                // positional argument follows keyword argument
                return Err(SyntaxError::new(INVALID_SYNTAX, self.peek().span.start));
            } else {
                args.positional.push(self.expression()?);
            }
            if self.eat(&TokenKind::Comma).is_none() {
                break;
            }
        }
        if self.peek_kind() != end {
            return Err(self.unexpected());
        }
        Ok(args)
    }

    fn atom(&mut self) -> Result<Expr, SyntaxError> {
        let token = self.peek().clone();
        let literal = match &token.kind {
            TokenKind::Int(n) => Some(Value::Int(*n)),
            TokenKind::Float(f) => Some(Value::Float(*f)),
            TokenKind::Name(name) if name == "True" => Some(Value::Bool(true)),
            TokenKind::Name(name) if name == "False" => Some(Value::Bool(false)),
            TokenKind::Name(name) if name == "None" => Some(Value::None),
            _ => None,
        };
        if let Some(value) = literal {
            self.advance();
            return Ok(Expr::new(ExprKind::Literal(value), token.span));
        }

        match token.kind {
            TokenKind::Name(name) if !KEYWORDS.contains(&name.as_str()) => {
                self.advance();
                Ok(Expr::new(ExprKind::Name(vec![name]), token.span))
            }
            TokenKind::Str(_) => {
                // Adjacent string literals concatenate
                let mut text = String::new();
                let mut span = token.span;
                while let TokenKind::Str(part) = self.peek_kind().clone() {
                    span = span.to(self.advance().span);
                    text.push_str(&part);
                }
                Ok(Expr::new(ExprKind::Literal(Value::Str(text)), span))
            }
            TokenKind::LParen => self.paren(),
            TokenKind::LBracket => {
                let open = self.open(&TokenKind::LBracket)?;
                let items = self.items(&TokenKind::RBracket)?.0;
                let close = self.close(&TokenKind::RBracket)?;
                Ok(Expr::new(ExprKind::List(items), open.span.to(close.span)))
            }
            TokenKind::LBrace => self.dict(),
            _ => Err(self.unexpected()),
        }
    }

    fn paren(&mut self) -> Result<Expr, SyntaxError> {
        let open = self.open(&TokenKind::LParen)?;
        let (mut items, trailing_comma) = self.items(&TokenKind::RParen)?;
        let close = self.close(&TokenKind::RParen)?;
        let span = open.span.to(close.span);
        if items.len() == 1 && !trailing_comma {
            let mut inner = items.remove(0);
            inner.span = span;
            return Ok(inner);
        }
        Ok(Expr::new(ExprKind::Tuple(items), span))
    }

    fn dict(&mut self) -> Result<Expr, SyntaxError> {
        let open = self.open(&TokenKind::LBrace)?;
        let mut pairs = Vec::new();
        while self.peek_kind() != &TokenKind::RBrace {
            let key = self.expression()?;
            self.expect(&TokenKind::Colon)?;
            pairs.push((key, self.expression()?));
            if self.eat(&TokenKind::Comma).is_none() {
                break;
            }
        }
        let close = self.close(&TokenKind::RBrace)?;
        Ok(Expr::new(ExprKind::Dict(pairs), open.span.to(close.span)))
    }

    /// Comma-separated expressions up to `end`; reports a trailing comma
    fn items(&mut self, end: &TokenKind) -> Result<(Vec<Expr>, bool), SyntaxError> {
        let mut items = Vec::new();
        let mut trailing_comma = false;
        while self.peek_kind() != end {
            items.push(self.expression()?);
            trailing_comma = self.eat(&TokenKind::Comma).is_some();
            if !trailing_comma {
                break;
            }
        }
        Ok((items, trailing_comma))
    }
}

fn binary(op: BinOp, left: Expr, right: Expr) -> Expr {
    let span = left.span.to(right.span);
    Expr::new(
        ExprKind::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        span,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Span;

    fn err(source: &str) -> SyntaxError {
        parse_expression(source).unwrap_err()
    }

    #[test]
    fn test_trailing_operator_is_invalid_syntax() {
        let e = err("z + ");
        assert_eq!(e.message, INVALID_SYNTAX);
        assert_eq!(e.offset, 4);
        assert_eq!(err("z+").message, INVALID_SYNTAX);
    }

    #[test]
    fn test_unclosed_call_is_unexpected_eof() {
        assert_eq!(err("func(").message, UNEXPECTED_EOF);
        assert_eq!(err("(1 + 2").message, UNEXPECTED_EOF);
        assert_eq!(err("[1, 2").message, UNEXPECTED_EOF);
    }

    #[test]
    fn test_empty_expression() {
        assert_eq!(err("").message, UNEXPECTED_EOF);
        assert_eq!(err("   ").message, UNEXPECTED_EOF);
    }

    #[test]
    fn test_invalid_token_sequences() {
        assert_eq!(err("1 )").message, INVALID_SYNTAX);
        assert_eq!(err("a b").message, INVALID_SYNTAX);
        assert_eq!(err("a +\nb").message, INVALID_SYNTAX);
        assert_eq!(err("x if y").message, INVALID_SYNTAX);
        assert_eq!(err("lambda: 1").message, INVALID_SYNTAX);
        assert_eq!(err("a.if").message, INVALID_SYNTAX);
    }

    #[test]
    fn test_deep_nesting_is_a_syntax_error() {
        let parens = |depth: usize| format!("{}1{}", "(".repeat(depth), ")".repeat(depth));
        assert!(parse_expression(&parens(MAX_NESTING - 1)).is_ok());

        let error = err(&parens(500));
        assert_eq!(error.message, TOO_MANY_NESTED);
        assert_eq!(error.offset, MAX_NESTING);
        assert_eq!(err(&parens(100_000)).message, TOO_MANY_NESTED);

        assert!(parse_expression("not not (-(x) ** -2)").is_ok());
        assert_eq!(err(&format!("{}x", "not ".repeat(500))).message, TOO_COMPLEX);
        assert_eq!(err(&format!("{}1", "-".repeat(500))).message, TOO_COMPLEX);
        assert_eq!(err(&vec!["2"; 200].join(" ** ")).message, TOO_COMPLEX);
        assert_eq!(
            err(&format!("{}0", "1 if x else ".repeat(100))).message,
            TOO_COMPLEX
        );

        // Brackets and operators share one budget
        let mixed = format!("{}{}x", "not ".repeat(40), "(".repeat(40));
        assert_eq!(err(&mixed).message, TOO_MANY_NESTED);
    }

    #[test]
    fn test_long_operator_chain_is_a_syntax_error() {
        let chain = |terms: usize| vec!["1"; terms].join(" + ");
        assert!(parse_expression(&chain(200)).is_ok());
        assert_eq!(err(&chain(100_000)).message, TOO_COMPLEX);
        assert_eq!(err(&format!("[{}]", "1, ".repeat(5000))).message, TOO_COMPLEX);
    }

    #[test]
    fn test_dotted_names_merge() {
        let expr = parse_expression("pyscript.var1.old").unwrap();
        assert_eq!(
            expr.kind,
            ExprKind::Name(vec!["pyscript".into(), "var1".into(), "old".into()])
        );
        assert_eq!(expr.span, Span::new(0, 17));
    }

    #[test]
    fn test_precedence() {
        let expr = parse_expression("1 + 2 * 3").unwrap();
        let ExprKind::Binary { op, right, .. } = expr.kind else {
            panic!("expected binary");
        };
        assert_eq!(op, BinOp::Add);
        assert!(matches!(right.kind, ExprKind::Binary { op: BinOp::Mul, .. }));

        let expr = parse_expression("not a == b").unwrap();
        assert!(matches!(
            expr.kind,
            ExprKind::Unary {
                op: UnaryOp::Not,
                ..
            }
        ));
    }

    #[test]
    fn test_chained_comparison() {
        let expr = parse_expression("0 < x <= 10").unwrap();
        let ExprKind::Compare { ops, .. } = expr.kind else {
            panic!("expected compare");
        };
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].0, CmpOp::Lt);
        assert_eq!(ops[1].0, CmpOp::Le);
    }

    #[test]
    fn test_not_in_and_is_not() {
        let expr = parse_expression("a not in b").unwrap();
        assert!(matches!(&expr.kind, ExprKind::Compare { ops, .. } if ops[0].0 == CmpOp::NotIn));
        let expr = parse_expression("a is not None").unwrap();
        assert!(matches!(&expr.kind, ExprKind::Compare { ops, .. } if ops[0].0 == CmpOp::IsNot));
    }

    #[test]
    fn test_call_span_covers_parens() {
        let expr = parse_expression("1 / int(pyscript.var1)").unwrap();
        let ExprKind::Binary { right, .. } = expr.kind else {
            panic!("expected binary");
        };
        assert_eq!(right.span, Span::new(4, 22));
    }

    #[test]
    fn test_containers_and_tuples() {
        assert!(matches!(
            parse_expression("[1, 2,]").unwrap().kind,
            ExprKind::List(items) if items.len() == 2
        ));
        assert!(matches!(
            parse_expression("(1,)").unwrap().kind,
            ExprKind::Tuple(items) if items.len() == 1
        ));
        assert!(matches!(
            parse_expression("(1)").unwrap().kind,
            ExprKind::Literal(Value::Int(1))
        ));
        assert!(matches!(
            parse_expression("{'a': 1}").unwrap().kind,
            ExprKind::Dict(pairs) if pairs.len() == 1
        ));
    }

    #[test]
    fn test_parse_arguments() {
        let args = parse_arguments(r#""pyscript.var1 == 1", "x", state_hold=5"#).unwrap();
        assert_eq!(args.positional.len(), 2);
        assert_eq!(args.keywords.len(), 1);
        assert_eq!(args.keywords[0].0, "state_hold");
        assert_eq!(args.keywords[0].1.as_literal(), Some(Value::Int(5)));
        assert_eq!(
            args.positional[0].as_literal(),
            Some(Value::Str("pyscript.var1 == 1".into()))
        );
    }

    #[test]
    fn test_parse_arguments_errors() {
        assert_eq!(parse_arguments("a=1, 2").unwrap_err().message, INVALID_SYNTAX);
        assert_eq!(parse_arguments("'x', [1,").unwrap_err().message, UNEXPECTED_EOF);
        assert!(parse_arguments("").unwrap().positional.is_empty());
    }
}
