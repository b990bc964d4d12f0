use rust_decimal::Decimal;

use super::ast::Span;
use super::error::CompileError;
use crate::model::decimal;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Int(i32),
    Long(i64),
    Number(f64),
    Decimal(Decimal),
    String(String),
    True,
    False,
    Null,

    // Identifiers & keywords
    Ident(String),
    /// `$in`, `$out`, `$0` and friends; the text after the dollar sign.
    Dollar(String),
    Function,
    If,
    Else,
    While,
    Do,
    For,
    Foreach,
    Switch,
    Case,
    Default,
    Break,
    Continue,
    Return,
    Import,

    // Type names
    IntegerTy,
    LongTy,
    NumberTy,
    DecimalTy,
    StringTy,
    BooleanTy,
    DateTy,
    VoidTy,
    MapTy,

    // Punctuation
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Semicolon,
    Colon,
    Arrow,     // ->

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    PlusPlus,
    MinusMinus,
    PlusEq,
    MinusEq,
    StarEq,
    SlashEq,
    PercentEq,
    Lt,
    Gt,
    Le,        // <= or le
    Ge,        // >= or ge
    EqEq,      // == or eq
    Ne,        // != or ne
    And,       // && or and
    Or,        // || or or
    Bang,      // ! or not
    Eq,        // =
    Question,  // ?

    // Special
    Eof,
}

#[derive(Debug, Clone)]
pub struct SpannedToken {
    pub token: Token,
    pub span: Span,
}

const INT_MIN_MAGNITUDE: &str = "2147483648";
const LONG_MIN_MAGNITUDE: &str = "9223372036854775808";

pub fn lex(source: &str) -> Result<Vec<SpannedToken>, Vec<CompileError>> {
    let mut lexer = Lexer::new(source);
    lexer.tokenize()
}

struct Lexer<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: usize,
    tokens: Vec<SpannedToken>,
    errors: Vec<CompileError>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            pos: 0,
            tokens: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn tokenize(&mut self) -> Result<Vec<SpannedToken>, Vec<CompileError>> {
        while self.pos < self.bytes.len() {
            self.skip_whitespace_and_comments();
            if self.pos >= self.bytes.len() {
                break;
            }

            let start = self.pos;
            let ch = self.bytes[self.pos];

            match ch {
                b'(' => self.single(Token::LParen, start),
                b')' => self.single(Token::RParen, start),
                b'{' => self.single(Token::LBrace, start),
                b'}' => self.single(Token::RBrace, start),
                b'[' => self.single(Token::LBracket, start),
                b']' => self.single(Token::RBracket, start),
                b',' => self.single(Token::Comma, start),
                b'.' => self.single(Token::Dot, start),
                b';' => self.single(Token::Semicolon, start),
                b':' => self.single(Token::Colon, start),
                b'?' => self.single(Token::Question, start),
                b'+' => self.operator(start, Token::Plus, Some(Token::PlusPlus), Token::PlusEq),
                b'-' => {
                    if self.bytes.get(self.pos + 1) == Some(&b'>') {
                        self.pos += 2;
                        self.push(Token::Arrow, start, self.pos);
                    } else {
                        self.operator(start, Token::Minus, Some(Token::MinusMinus), Token::MinusEq);
                    }
                }
                b'*' => self.operator(start, Token::Star, None, Token::StarEq),
                b'/' => self.operator(start, Token::Slash, None, Token::SlashEq),
                b'%' => self.operator(start, Token::Percent, None, Token::PercentEq),
                b'<' => self.operator(start, Token::Lt, None, Token::Le),
                b'>' => self.operator(start, Token::Gt, None, Token::Ge),
                b'=' => self.operator(start, Token::Eq, None, Token::EqEq),
                b'!' => self.operator(start, Token::Bang, None, Token::Ne),
                b'|' | b'&' => {
                    self.pos += 1;
                    if self.peek() == Some(ch) {
                        self.pos += 1;
                        let token = if ch == b'|' { Token::Or } else { Token::And };
                        self.push(token, start, self.pos);
                    } else {
                        self.errors.push(CompileError::lexer(
                            format!("Expected '{0}{0}'", ch as char),
                            Span::new(start, self.pos),
                        ));
                    }
                }
                b'"' | b'\'' => {
                    self.pos += 1;
                    self.lex_string(start, ch);
                }
                b'$' => {
                    self.pos += 1;
                    self.lex_dollar(start);
                }
                b'0'..=b'9' => {
                    self.lex_number(start);
                }
                b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                    self.lex_ident(start);
                }
                _ => {
                    let ch = self.source[start..].chars().next().unwrap_or('?');
                    self.errors.push(CompileError::lexer(
                        format!("Unexpected character: '{ch}'"),
                        Span::new(start, start + ch.len_utf8()),
                    ));
                    self.pos += ch.len_utf8();
                }
            }
        }

        self.tokens.push(SpannedToken {
            token: Token::Eof,
            span: Span::new(self.pos, self.pos),
        });

        if self.errors.is_empty() {
            Ok(std::mem::take(&mut self.tokens))
        } else {
            Err(std::mem::take(&mut self.errors))
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn push(&mut self, token: Token, start: usize, end: usize) {
        self.tokens.push(SpannedToken {
            token,
            span: Span::new(start, end),
        });
    }

    fn single(&mut self, token: Token, start: usize) {
        self.pos += 1;
        self.push(token, start, self.pos);
    }

    /// Lex `x`, `xx` (when `doubled` is given) or `x=`.
    fn operator(&mut self, start: usize, plain: Token, doubled: Option<Token>, with_eq: Token) {
        let ch = self.bytes[self.pos];
        self.pos += 1;
        match (self.peek(), doubled) {
            (Some(b'='), _) => {
                self.pos += 1;
                self.push(with_eq, start, self.pos);
            }
            (Some(next), Some(doubled)) if next == ch => {
                self.pos += 1;
                self.push(doubled, start, self.pos);
            }
            _ => self.push(plain, start, self.pos),
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b' ' | b'\t' | b'\n' | b'\r' => self.pos += 1,
                b'/' if self.bytes.get(self.pos + 1) == Some(&b'/') => {
                    while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
                        self.pos += 1;
                    }
                }
                b'/' if self.bytes.get(self.pos + 1) == Some(&b'*') => {
                    let start = self.pos;
                    self.pos += 2;
                    loop {
                        if self.pos + 1 >= self.bytes.len() {
                            self.errors.push(CompileError::lexer(
                                "Unterminated block comment",
                                Span::new(start, self.bytes.len()),
                            ));
                            self.pos = self.bytes.len();
                            break;
                        }
                        if self.bytes[self.pos] == b'*' && self.bytes[self.pos + 1] == b'/' {
                            self.pos += 2;
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
    }

    fn lex_string(&mut self, start: usize, quote: u8) {
        let mut value = String::new();
        let mut closed = false;
        while let Some(ch) = self.source[self.pos..].chars().next() {
            self.pos += ch.len_utf8();
            if ch as u32 == u32::from(quote) {
                closed = true;
                break;
            }
            if ch == '\n' {
                break;
            }
            // Single-quoted strings are taken verbatim.
            if ch == '\\' && quote == b'"' {
                let Some(escaped) = self.source[self.pos..].chars().next() else {
                    break;
                };
                self.pos += escaped.len_utf8();
                match escaped {
                    'n' => value.push('\n'),
                    't' => value.push('\t'),
                    'r' => value.push('\r'),
                    '"' => value.push('"'),
                    '\'' => value.push('\''),
                    '\\' => value.push('\\'),
                    'u' => self.lex_unicode_escape(&mut value),
                    other => self.errors.push(CompileError::lexer(
                        format!("Invalid escape sequence: \\{other}"),
                        Span::new(self.pos - 2, self.pos),
                    )),
                }
                continue;
            }
            value.push(ch);
        }
        if !closed {
            self.errors.push(CompileError::lexer(
                "Unterminated string literal",
                Span::new(start, self.pos),
            ));
        }
        self.push(Token::String(value), start, self.pos);
    }

    fn lex_unicode_escape(&mut self, value: &mut String) {
        let start = self.pos;
        let hex = self.source.get(self.pos..self.pos + 4).unwrap_or("");
        match u32::from_str_radix(hex, 16).ok().and_then(char::from_u32) {
            Some(c) if hex.len() == 4 => {
                value.push(c);
                self.pos += 4;
            }
            _ => self.errors.push(CompileError::lexer(
                "Invalid unicode escape, expected \\uXXXX",
                Span::new(start - 2, self.pos),
            )),
        }
    }

    fn lex_dollar(&mut self, start: usize) {
        let name_start = self.pos;
        while self.pos < self.bytes.len()
            && (self.bytes[self.pos].is_ascii_alphanumeric() || self.bytes[self.pos] == b'_')
        {
            self.pos += 1;
        }
        if name_start == self.pos {
            self.errors.push(CompileError::lexer(
                "Expected port name after '$'",
                Span::new(start, self.pos),
            ));
            return;
        }
        let name = self.source[name_start..self.pos].to_string();
        self.push(Token::Dollar(name), start, self.pos);
    }

    fn lex_number(&mut self, start: usize) {
        if self.bytes[self.pos] == b'0' && matches!(self.bytes.get(self.pos + 1), Some(b'x' | b'X'))
        {
            self.lex_hex(start);
            return;
        }
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        // `$in.0.1` selects field 1 of port 0, so right after a dot only
        // whole numbers are lexed.
        let after_dot = matches!(self.tokens.last(), Some(SpannedToken { token: Token::Dot, .. }));
        let mut is_float = false;
        if !after_dot
            && self.peek() == Some(b'.')
            && self.bytes.get(self.pos + 1).is_some_and(u8::is_ascii_digit)
        {
            is_float = true;
            self.pos += 1;
            while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
                self.pos += 1;
            }
        }
        if !after_dot && matches!(self.peek(), Some(b'e' | b'E')) {
            let mut look = self.pos + 1;
            if matches!(self.bytes.get(look), Some(b'+' | b'-')) {
                look += 1;
            }
            if self.bytes.get(look).is_some_and(u8::is_ascii_digit) {
                is_float = true;
                self.pos = look;
                while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
                    self.pos += 1;
                }
            }
        }
        let text = &self.source[start..self.pos];
        let suffix = self.peek().map(|b| b.to_ascii_lowercase());
        match suffix {
            Some(b'l') if !is_float => {
                self.pos += 1;
                match text.parse::<i64>() {
                    Ok(v) => self.push(Token::Long(v), start, self.pos),
                    Err(_) if text == LONG_MIN_MAGNITUDE && self.after_unary_minus() => {
                        self.push(Token::Long(i64::MIN), start, self.pos);
                    }
                    Err(_) => self.number_error("long", text, start),
                }
            }
            Some(b'd') => {
                self.pos += 1;
                match decimal::parse(text) {
                    Some(v) => self.push(Token::Decimal(v), start, self.pos),
                    None => self.number_error("decimal", text, start),
                }
            }
            _ if is_float => match text.parse::<f64>() {
                Ok(v) => self.push(Token::Number(v), start, self.pos),
                Err(_) => self.number_error("number", text, start),
            },
            _ => match text.parse::<i32>() {
                Ok(v) => self.push(Token::Int(v), start, self.pos),
                Err(_) if text == INT_MIN_MAGNITUDE && self.after_unary_minus() => {
                    self.push(Token::Int(i32::MIN), start, self.pos);
                }
                Err(_) => self.number_error("integer (use the L suffix for long)", text, start),
            },
        }
    }

    fn lex_hex(&mut self, start: usize) {
        self.pos += 2;
        let digits_start = self.pos;
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_hexdigit() {
            self.pos += 1;
        }
        let digits = &self.source[digits_start..self.pos];
        let long = matches!(self.peek(), Some(b'l' | b'L'));
        if long {
            self.pos += 1;
            match i64::from_str_radix(digits, 16) {
                Ok(v) => self.push(Token::Long(v), start, self.pos),
                Err(_) => self.number_error("long", digits, start),
            }
        } else {
            match u32::from_str_radix(digits, 16) {
                #[allow(clippy::cast_possible_wrap)]
                Ok(v) => self.push(Token::Int(v as i32), start, self.pos),
                Err(_) => self.number_error("integer", digits, start),
            }
        }
    }

    /// The last token is a `-` that the parser will read as negation, so a
    /// literal one past the positive range still denotes MIN.
    fn after_unary_minus(&self) -> bool {
        let mut recent = self.tokens.iter().rev().map(|t| &t.token);
        if recent.next() != Some(&Token::Minus) {
            return false;
        }
        !matches!(
            recent.next(),
            Some(
                Token::Int(_)
                    | Token::Long(_)
                    | Token::Number(_)
                    | Token::Decimal(_)
                    | Token::String(_)
                    | Token::True
                    | Token::False
                    | Token::Null
                    | Token::Ident(_)
                    | Token::Dollar(_)
                    | Token::RParen
                    | Token::RBracket
                    | Token::PlusPlus
                    | Token::MinusMinus
            )
        )
    }

    fn number_error(&mut self, what: &str, text: &str, start: usize) {
        self.errors.push(CompileError::lexer(
            format!("Invalid {what} literal: {text}"),
            Span::new(start, self.pos),
        ));
    }

    fn lex_ident(&mut self, start: usize) {
        while self.pos < self.bytes.len()
            && (self.bytes[self.pos].is_ascii_alphanumeric() || self.bytes[self.pos] == b'_')
        {
            self.pos += 1;
        }
        let word = &self.source[start..self.pos];
        let token = match word {
            "function" => Token::Function,
            "if" => Token::If,
            "else" => Token::Else,
            "while" => Token::While,
            "do" => Token::Do,
            "for" => Token::For,
            "foreach" => Token::Foreach,
            "switch" => Token::Switch,
            "case" => Token::Case,
            "default" => Token::Default,
            "break" => Token::Break,
            "continue" => Token::Continue,
            "return" => Token::Return,
            "import" => Token::Import,
            "true" => Token::True,
            "false" => Token::False,
            "null" => Token::Null,
            "integer" | "int" => Token::IntegerTy,
            "long" => Token::LongTy,
            "number" | "double" => Token::NumberTy,
            "decimal" => Token::DecimalTy,
            "string" => Token::StringTy,
            "boolean" => Token::BooleanTy,
            "date" => Token::DateTy,
            "void" => Token::VoidTy,
            "map" => Token::MapTy,
            "eq" => Token::EqEq,
            "ne" => Token::Ne,
            "lt" => Token::Lt,
            "le" => Token::Le,
            "gt" => Token::Gt,
            "ge" => Token::Ge,
            "and" => Token::And,
            "or" => Token::Or,
            "not" => Token::Bang,
            _ => Token::Ident(word.to_string()),
        };
        self.push(token, start, self.pos);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn tok(s: &str) -> Vec<Token> {
        lex(s).unwrap().into_iter().map(|t| t.token).collect()
    }

    #[test]
    fn simple_tokens() {
        let tokens = tok("1 + 2.0;");
        assert_eq!(
            tokens,
            vec![Token::Int(1), Token::Plus, Token::Number(2.0), Token::Semicolon, Token::Eof]
        );
    }

    #[test]
    fn negated_min_literals() {
        assert_eq!(tok("= -2147483648")[2], Token::Int(i32::MIN));
        assert_eq!(tok("(-9223372036854775808L")[2], Token::Long(i64::MIN));
        assert!(lex("2147483648").is_err());
        assert!(lex("x - 2147483648").is_err());
    }

    #[test]
    fn keywords_and_type_aliases() {
        let tokens = tok("function int integer double foreach");
        assert_eq!(tokens, vec![
            Token::Function, Token::IntegerTy, Token::IntegerTy, Token::NumberTy,
            Token::Foreach, Token::Eof,
        ]);
    }

    #[test]
    fn word_form_operators() {
        let tokens = tok("a eq b and not c");
        assert_eq!(tokens, vec![
            Token::Ident("a".into()), Token::EqEq, Token::Ident("b".into()),
            Token::And, Token::Bang, Token::Ident("c".into()), Token::Eof,
        ]);
    }

    #[test]
    fn numeric_suffixes() {
        let tokens = tok("10L 1.5D 3d 0x1F 1e3");
        assert_eq!(tokens, vec![
            Token::Long(10),
            Token::Decimal(Decimal::new(15, 1)),
            Token::Decimal(Decimal::new(3, 0)),
            Token::Int(31),
            Token::Number(1000.0),
            Token::Eof,
        ]);
    }

    #[test]
    fn port_field_by_position() {
        let tokens = tok("$in.0.1");
        assert_eq!(
            tokens,
            vec![
                Token::Dollar("in".into()),
                Token::Dot,
                Token::Int(0),
                Token::Dot,
                Token::Int(1),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn compound_operators() {
        let tokens = tok("a += 1; b++; c -= d--; e %= 2");
        assert!(tokens.contains(&Token::PlusEq));
        assert!(tokens.contains(&Token::PlusPlus));
        assert!(tokens.contains(&Token::MinusEq));
        assert!(tokens.contains(&Token::MinusMinus));
        assert!(tokens.contains(&Token::PercentEq));
    }

    #[test]
    fn string_escapes() {
        assert_eq!(tok(r#""a\tb\"c""#)[0], Token::String("a\tb\"c".into()));
        assert_eq!(tok(r"'raw\n'")[0], Token::String("raw\\n".into()));
        assert_eq!(tok(r#""A""#)[0], Token::String("A".into()));
    }

    #[test]
    fn comments_are_skipped() {
        let tokens = tok("//#CTL2:COMPILE\n/* block\n comment */ x // tail");
        assert_eq!(tokens, vec![Token::Ident("x".into()), Token::Eof]);
    }

    #[test]
    fn integer_overflow_needs_long_suffix() {
        let errors = lex("3000000000").unwrap_err();
        assert!(errors[0].message.contains("L suffix"));
    }

    #[test]
    fn unterminated_string() {
        let errors = lex("\"abc").unwrap_err();
        assert!(errors[0].message.contains("Unterminated"));
    }
}
