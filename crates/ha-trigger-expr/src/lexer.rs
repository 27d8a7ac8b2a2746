//! Tokenizer for trigger expressions

use thiserror::Error;

use crate::ast::Span;

pub const INVALID_SYNTAX: &str = "invalid syntax";
pub const UNEXPECTED_EOF: &str = "unexpected EOF while parsing";
pub const EOL_IN_STRING: &str = "EOL while scanning string literal";
pub const TOO_MANY_NESTED: &str = "too many nested parentheses";
pub const TOO_COMPLEX: &str = "expression too complex";

/// Deepest nesting of brackets, and of brackets plus right-recursive
/// operators (`not`, unary signs, `**`, `else`) once parsed
pub const MAX_NESTING: usize = 64;

/// Most tokens in one expression; bounds the depth of operator chains
pub const MAX_TOKENS: usize = 1000;

/// A syntax error at a byte offset of the expression text
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at offset {offset}")]
pub struct SyntaxError {
    pub message: String,
    pub offset: usize,
}

impl SyntaxError {
    pub fn new(message: impl Into<String>, offset: usize) -> Self {
        Self {
            message: message.into(),
            offset,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Assign,
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    DoubleSlash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    /// Only emitted outside brackets
    Newline,
    Eof,
}

impl TokenKind {
    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, TokenKind::Name(name) if name == keyword)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

/// Split expression text into tokens, ending with [`TokenKind::Eof`]
pub fn tokenize(source: &str) -> Result<Vec<Token>, SyntaxError> {
    Lexer::new(source).run()
}

struct Lexer<'a> {
    source: &'a str,
    chars: Vec<(usize, char)>,
    pos: usize,
    depth: usize,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().collect(),
            pos: 0,
            depth: 0,
            tokens: Vec::new(),
        }
    }

    fn offset(&self) -> usize {
        self.chars
            .get(self.pos)
            .map(|(i, _)| *i)
            .unwrap_or(self.source.len())
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).map(|(_, c)| *c)
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).map(|(_, c)| *c)
    }

    fn push(&mut self, kind: TokenKind, start: usize) {
        let end = self.offset();
        self.tokens.push(Token {
            kind,
            span: Span::new(start, end),
        });
    }

    fn run(mut self) -> Result<Vec<Token>, SyntaxError> {
        while let Some(c) = self.peek() {
            let start = self.offset();
            if self.tokens.len() >= MAX_TOKENS && !c.is_whitespace() {
                return Err(SyntaxError::new(TOO_COMPLEX, start));
            }
            match c {
                '\n' => {
                    self.pos += 1;
                    if self.depth == 0 {
                        self.push(TokenKind::Newline, start);
                    }
                }
                c if c.is_whitespace() => self.pos += 1,
                '\\' if self.peek_at(1) == Some('\n') => self.pos += 2,
                '#' => {
                    while !matches!(self.peek(), None | Some('\n')) {
                        self.pos += 1;
                    }
                }
                '"' | '\'' => self.string(c)?,
                c if c.is_ascii_digit() => self.number()?,
                '.' if self.peek_at(1).is_some_and(|d| d.is_ascii_digit()) => self.number()?,
                c if c.is_alphabetic() || c == '_' => {
                    while self
                        .peek()
                        .is_some_and(|c| c.is_alphanumeric() || c == '_')
                    {
                        self.pos += 1;
                    }
                    let name = self.source[start..self.offset()].to_string();
                    self.push(TokenKind::Name(name), start);
                }
                _ => self.operator(c, start)?,
            }
        }
        let end = self.source.len();
        self.tokens.push(Token {
            kind: TokenKind::Eof,
            span: Span::new(end, end),
        });
        Ok(self.tokens)
    }

    fn operator(&mut self, c: char, start: usize) -> Result<(), SyntaxError> {
        let next = self.peek_at(1);
        let (kind, width) = match (c, next) {
            ('*', Some('*')) => (TokenKind::DoubleStar, 2),
            ('/', Some('/')) => (TokenKind::DoubleSlash, 2),
            ('=', Some('=')) => (TokenKind::EqEq, 2),
            ('!', Some('=')) => (TokenKind::NotEq, 2),
            ('<', Some('=')) => (TokenKind::Le, 2),
            ('>', Some('=')) => (TokenKind::Ge, 2),
            ('(', _) => (TokenKind::LParen, 1),
            (')', _) => (TokenKind::RParen, 1),
            ('[', _) => (TokenKind::LBracket, 1),
            (']', _) => (TokenKind::RBracket, 1),
            ('{', _) => (TokenKind::LBrace, 1),
            ('}', _) => (TokenKind::RBrace, 1),
            (',', _) => (TokenKind::Comma, 1),
            (':', _) => (TokenKind::Colon, 1),
            ('.', _) => (TokenKind::Dot, 1),
            ('=', _) => (TokenKind::Assign, 1),
            ('+', _) => (TokenKind::Plus, 1),
            ('-', _) => (TokenKind::Minus, 1),
            ('*', _) => (TokenKind::Star, 1),
            ('/', _) => (TokenKind::Slash, 1),
            ('%', _) => (TokenKind::Percent, 1),
            ('<', _) => (TokenKind::Lt, 1),
            ('>', _) => (TokenKind::Gt, 1),
            _ => return Err(SyntaxError::new(INVALID_SYNTAX, start)),
        };
        match kind {
            TokenKind::LParen | TokenKind::LBracket | TokenKind::LBrace => {
                if self.depth >= MAX_NESTING {
                    return Err(SyntaxError::new(TOO_MANY_NESTED, start));
                }
                self.depth += 1
            }
            TokenKind::RParen | TokenKind::RBracket | TokenKind::RBrace => {
                self.depth = self.depth.saturating_sub(1)
            }
            _ => {}
        }
        self.pos += width;
        self.push(kind, start);
        Ok(())
    }

    fn number(&mut self) -> Result<(), SyntaxError> {
        let start = self.offset();
        let mut is_float = false;
        while let Some(c) = self.peek() {
            match c {
                '0'..='9' | '_' => self.pos += 1,
                '.' if !is_float => {
                    is_float = true;
                    self.pos += 1;
                }
                'e' | 'E' => {
                    is_float = true;
                    self.pos += 1;
                    if matches!(self.peek(), Some('+') | Some('-')) {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
        if self.peek().is_some_and(|c| c.is_alphabetic() || c == '_') {
            return Err(SyntaxError::new(INVALID_SYNTAX, self.offset()));
        }
        let text: String = self.source[start..self.offset()]
            .chars()
            .filter(|c| *c != '_')
            .collect();
        let kind = if is_float {
            TokenKind::Float(
                text.parse()
                    .map_err(|_| SyntaxError::new(INVALID_SYNTAX, start))?,
            )
        } else {
            match text.parse::<i64>() {
                Ok(n) => TokenKind::Int(n),
                // Out of i64 range: keep the magnitude as a float
                Err(_) => TokenKind::Float(
                    text.parse()
                        .map_err(|_| SyntaxError::new(INVALID_SYNTAX, start))?,
                ),
            }
        };
        self.push(kind, start);
        Ok(())
    }

    fn string(&mut self, quote: char) -> Result<(), SyntaxError> {
        let start = self.offset();
        self.pos += 1;
        let mut value = String::new();
        loop {
            match self.peek() {
                None | Some('\n') => return Err(SyntaxError::new(EOL_IN_STRING, start)),
                Some(c) if c == quote => {
                    self.pos += 1;
                    break;
                }
                Some('\\') => {
                    self.pos += 1;
                    let escaped = match self.peek() {
                        None => return Err(SyntaxError::new(EOL_IN_STRING, start)),
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some('0') => '\0',
                        Some(c @ ('\\' | '\'' | '"')) => c,
                        Some(other) => {
                            value.push('\\');
                            other
                        }
                    };
                    value.push(escaped);
                    self.pos += 1;
                }
                Some(c) => {
                    value.push(c);
                    self.pos += 1;
                }
            }
        }
        self.push(TokenKind::Str(value), start);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_dotted_name_and_operators() {
        assert_eq!(
            kinds("1 / int(pyscript.var1)"),
            vec![
                TokenKind::Int(1),
                TokenKind::Slash,
                TokenKind::Name("int".into()),
                TokenKind::LParen,
                TokenKind::Name("pyscript".into()),
                TokenKind::Dot,
                TokenKind::Name("var1".into()),
                TokenKind::RParen,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_spans_are_byte_offsets() {
        let tokens = tokenize("a  >= 'x'").unwrap();
        assert_eq!(tokens[1].span, Span::new(3, 5));
        assert_eq!(tokens[2].span, Span::new(6, 9));
        assert_eq!(tokens[3].span, Span::new(9, 9));
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            kinds("10 2.5 1e3 .5 1_000"),
            vec![
                TokenKind::Int(10),
                TokenKind::Float(2.5),
                TokenKind::Float(1000.0),
                TokenKind::Float(0.5),
                TokenKind::Int(1000),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#""a\"b" 'c\n'"#),
            vec![
                TokenKind::Str("a\"b".into()),
                TokenKind::Str("c\n".into()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_unterminated_string() {
        let err = tokenize("x == 'abc").unwrap_err();
        assert_eq!(err.message, EOL_IN_STRING);
        assert_eq!(err.offset, 5);
    }

    #[test]
    fn test_invalid_character() {
        let err = tokenize("a $ b").unwrap_err();
        assert_eq!(err.message, INVALID_SYNTAX);
        assert_eq!(err.offset, 2);
    }

    #[test]
    fn test_nesting_and_length_limits() {
        let open = "[".repeat(MAX_NESTING);
        assert!(tokenize(&open).is_ok());

        let err = tokenize(&"(".repeat(100_000)).unwrap_err();
        assert_eq!(err.message, TOO_MANY_NESTED);
        assert_eq!(err.offset, MAX_NESTING);

        // Closing brackets make room again
        assert!(tokenize(&format!("{}0", "(1) + ".repeat(100))).is_ok());

        let err = tokenize(&"x ".repeat(MAX_TOKENS + 1)).unwrap_err();
        assert_eq!(err.message, TOO_COMPLEX);
        assert_eq!(err.offset, 2 * MAX_TOKENS);
    }

    #[test]
    fn test_newline_only_outside_brackets() {
        assert_eq!(
            kinds("(a\n)\n"),
            vec![
                TokenKind::LParen,
                TokenKind::Name("a".into()),
                TokenKind::RParen,
                TokenKind::Newline,
                TokenKind::Eof
            ]
        );
    }
}
