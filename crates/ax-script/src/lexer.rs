// Tokenizer for strategy scripts
// Indentation-sensitive: emits Indent/Dedent tokens and joins lines inside brackets

use std::fmt;

use crate::error::ParseError;

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Name(String),
    Keyword(Keyword),
    Int(i64),
    Float(f64),
    Str(String),
    /// Body of an f-string, escapes already processed.
    FStr(String),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    False,
    None,
    True,
    And,
    As,
    Break,
    Class,
    Continue,
    Def,
    Elif,
    Else,
    For,
    From,
    If,
    Import,
    In,
    Is,
    Not,
    Or,
    Pass,
    Return,
    While,
    // Reserved words the language does not support
    Assert,
    Async,
    Await,
    Del,
    Except,
    Finally,
    Global,
    Lambda,
    Nonlocal,
    Raise,
    Try,
    With,
    Yield,
}

impl Keyword {
    fn lookup(word: &str) -> Option<Keyword> {
        use Keyword::*;
        Some(match word {
            "False" => False,
            "None" => None,
            "True" => True,
            "and" => And,
            "as" => As,
            "break" => Break,
            "class" => Class,
            "continue" => Continue,
            "def" => Def,
            "elif" => Elif,
            "else" => Else,
            "for" => For,
            "from" => From,
            "if" => If,
            "import" => Import,
            "in" => In,
            "is" => Is,
            "not" => Not,
            "or" => Or,
            "pass" => Pass,
            "return" => Return,
            "while" => While,
            "assert" => Assert,
            "async" => Async,
            "await" => Await,
            "del" => Del,
            "except" => Except,
            "finally" => Finally,
            "global" => Global,
            "lambda" => Lambda,
            "nonlocal" => Nonlocal,
            "raise" => Raise,
            "try" => Try,
            "with" => With,
            "yield" => Yield,
            _ => return Option::None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        use Keyword::*;
        match self {
            False => "False",
            None => "None",
            True => "True",
            And => "and",
            As => "as",
            Break => "break",
            Class => "class",
            Continue => "continue",
            Def => "def",
            Elif => "elif",
            Else => "else",
            For => "for",
            From => "from",
            If => "if",
            Import => "import",
            In => "in",
            Is => "is",
            Not => "not",
            Or => "or",
            Pass => "pass",
            Return => "return",
            While => "while",
            Assert => "assert",
            Async => "async",
            Await => "await",
            Del => "del",
            Except => "except",
            Finally => "finally",
            Global => "global",
            Lambda => "lambda",
            Nonlocal => "nonlocal",
            Raise => "raise",
            Try => "try",
            With => "with",
            Yield => "yield",
        }
    }
}

impl fmt::Display for Tok {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tok::Name(n) => write!(f, "name '{}'", n),
            Tok::Keyword(k) => write!(f, "'{}'", k.as_str()),
            Tok::Int(i) => write!(f, "number {}", i),
            Tok::Float(x) => write!(f, "number {}", x),
            Tok::Str(_) | Tok::FStr(_) => write!(f, "string literal"),
            Tok::Op(op) => write!(f, "'{}'", op),
            Tok::Newline => write!(f, "end of line"),
            Tok::Indent => write!(f, "indent"),
            Tok::Dedent => write!(f, "dedent"),
            Tok::Eof => write!(f, "end of file"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: usize,
    pub col: usize,
}

// Longest operators first so prefix matching picks them
const OPERATORS: &[&str] = &[
    "**=", "//=", ">>=", "<<=", "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=", "%=", "->", "<<",
    ">>", "+", "-", "*", "/", "%", "<", ">", "=", "(", ")", "[", "]", "{", "}", ",", ":", ".", ";", "@", "&",
    "|", "^", "~",
];

struct Lexer<'a> {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
    depth: usize,
    indents: Vec<usize>,
    tokens: Vec<Token>,
    _source: &'a str,
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, ParseError> {
    let mut lexer = Lexer {
        chars: source.chars().collect(),
        pos: 0,
        line: 1,
        col: 1,
        depth: 0,
        indents: vec![0],
        tokens: Vec::new(),
        _source: source,
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

impl<'a> Lexer<'a> {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(self.line, self.col, message)
    }

    fn push(&mut self, tok: Tok, line: usize, col: usize) {
        self.tokens.push(Token { tok, line, col });
    }

    fn last_is_newline(&self) -> bool {
        matches!(
            self.tokens.last().map(|t| &t.tok),
            None | Some(Tok::Newline) | Some(Tok::Indent) | Some(Tok::Dedent)
        )
    }

    fn run(&mut self) -> Result<(), ParseError> {
        let mut at_line_start = true;

        while self.pos < self.chars.len() {
            if at_line_start && self.depth == 0 {
                at_line_start = false;
                if self.handle_indentation()? {
                    // Blank or comment-only line: measure the next one
                    at_line_start = true;
                    continue;
                }
            }

            let Some(c) = self.peek() else { break };
            match c {
                ' ' | '\t' | '\x0c' | '\r' => {
                    self.bump();
                }
                '#' => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                '\n' => {
                    let (line, col) = (self.line, self.col);
                    self.bump();
                    if self.depth == 0 {
                        if !self.last_is_newline() {
                            self.push(Tok::Newline, line, col);
                        }
                        at_line_start = true;
                    }
                }
                '\\' if self.peek_at(1) == Some('\n') => {
                    self.bump();
                    self.bump();
                }
                c if c.is_ascii_digit() || (c == '.' && self.peek_at(1).is_some_and(|d| d.is_ascii_digit())) => {
                    self.lex_number()?;
                }
                c if c.is_alphabetic() || c == '_' => {
                    if !self.try_lex_prefixed_string()? {
                        self.lex_name();
                    }
                }
                '\'' | '"' => {
                    let (line, col) = (self.line, self.col);
                    let body = self.lex_string_body(false)?;
                    self.push(Tok::Str(body), line, col);
                }
                _ => self.lex_operator()?,
            }
        }

        let (line, col) = (self.line, self.col);
        if !self.last_is_newline() {
            self.push(Tok::Newline, line, col);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent, line, col);
        }
        self.push(Tok::Eof, line, col);
        Ok(())
    }

    /// Measure leading whitespace and emit indent changes.
    /// Returns true when the line was blank or comment-only and got consumed.
    fn handle_indentation(&mut self) -> Result<bool, ParseError> {
        let mut width = 0usize;
        loop {
            match self.peek() {
                Some(' ') => width += 1,
                Some('\t') => width = (width / 8 + 1) * 8,
                Some('\x0c') | Some('\r') => {}
                _ => break,
            }
            self.bump();
        }

        match self.peek() {
            None => return Ok(true),
            Some('\n') => {
                self.bump();
                return Ok(true);
            }
            Some('#') => {
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.bump();
                }
                if self.peek() == Some('\n') {
                    self.bump();
                }
                return Ok(true);
            }
            _ => {}
        }

        let current = *self.indents.last().unwrap_or(&0);
        if width > current {
            self.indents.push(width);
            self.push(Tok::Indent, self.line, 1);
        } else if width < current {
            while width < *self.indents.last().unwrap_or(&0) {
                self.indents.pop();
                self.push(Tok::Dedent, self.line, 1);
            }
            if width != *self.indents.last().unwrap_or(&0) {
                return Err(self.error("unindent does not match any outer indentation level"));
            }
        }
        Ok(false)
    }

    fn lex_number(&mut self) -> Result<(), ParseError> {
        let (line, col) = (self.line, self.col);
        let mut text = String::new();

        if self.peek() == Some('0') && matches!(self.peek_at(1), Some('x') | Some('X')) {
            self.bump();
            self.bump();
            while let Some(c) = self.peek() {
                if c.is_ascii_hexdigit() || c == '_' {
                    if c != '_' {
                        text.push(c);
                    }
                    self.bump();
                } else {
                    break;
                }
            }
            let value = i64::from_str_radix(&text, 16).map_err(|_| self.error("invalid hexadecimal literal"))?;
            self.push(Tok::Int(value), line, col);
            return Ok(());
        }

        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '_' {
                if c != '_' {
                    text.push(c);
                }
                self.bump();
            } else if c == '.' && !is_float {
                is_float = true;
                text.push(c);
                self.bump();
            } else if (c == 'e' || c == 'E')
                && (self.peek_at(1).is_some_and(|d| d.is_ascii_digit())
                    || (matches!(self.peek_at(1), Some('+') | Some('-'))
                        && self.peek_at(2).is_some_and(|d| d.is_ascii_digit())))
            {
                is_float = true;
                text.push('e');
                self.bump();
                if let Some(sign) = self.peek().filter(|s| *s == '+' || *s == '-') {
                    text.push(sign);
                    self.bump();
                }
            } else {
                break;
            }
        }

        if is_float {
            let value: f64 = text.parse().map_err(|_| self.error(format!("invalid number '{}'", text)))?;
            self.push(Tok::Float(value), line, col);
        } else {
            let value: i64 = text
                .parse()
                .map_err(|_| self.error(format!("integer literal '{}' is too large", text)))?;
            self.push(Tok::Int(value), line, col);
        }
        Ok(())
    }

    fn lex_name(&mut self) {
        let (line, col) = (self.line, self.col);
        let mut name = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                name.push(c);
                self.bump();
            } else {
                break;
            }
        }
        let tok = match Keyword::lookup(&name) {
            Some(kw) => Tok::Keyword(kw),
            None => Tok::Name(name),
        };
        self.push(tok, line, col);
    }

    /// Handle r"", f"", b"", rf"" style prefixes. Returns false when the
    /// identifier is not a string prefix.
    fn try_lex_prefixed_string(&mut self) -> Result<bool, ParseError> {
        let mut prefix = String::new();
        let mut offset = 0;
        while let Some(c) = self.peek_at(offset) {
            if matches!(c, 'r' | 'R' | 'f' | 'F' | 'b' | 'B' | 'u' | 'U') && offset < 2 {
                prefix.push(c.to_ascii_lowercase());
                offset += 1;
            } else {
                break;
            }
        }
        if prefix.is_empty() || !matches!(self.peek_at(offset), Some('\'') | Some('"')) {
            return Ok(false);
        }

        let (line, col) = (self.line, self.col);
        for _ in 0..offset {
            self.bump();
        }
        let raw = prefix.contains('r');
        let body = self.lex_string_body(raw)?;
        if prefix.contains('f') {
            self.push(Tok::FStr(body), line, col);
        } else {
            self.push(Tok::Str(body), line, col);
        }
        Ok(true)
    }

    fn lex_string_body(&mut self, raw: bool) -> Result<String, ParseError> {
        let (line, col) = (self.line, self.col);
        let quote = self.bump().ok_or_else(|| self.error("expected string"))?;
        let triple = self.peek() == Some(quote) && self.peek_at(1) == Some(quote);
        if triple {
            self.bump();
            self.bump();
        }

        let mut out = String::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(ParseError::new(line, col, "unterminated string literal"));
            };
            if c == quote {
                if !triple {
                    break;
                }
                if self.peek() == Some(quote) && self.peek_at(1) == Some(quote) {
                    self.bump();
                    self.bump();
                    break;
                }
                out.push(c);
                continue;
            }
            if c == '\n' && !triple {
                return Err(ParseError::new(line, col, "unterminated string literal"));
            }
            if c == '\\' {
                let Some(next) = self.bump() else {
                    return Err(ParseError::new(line, col, "unterminated string literal"));
                };
                if raw {
                    out.push('\\');
                    out.push(next);
                    continue;
                }
                match next {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    '0' => out.push('\0'),
                    '\\' => out.push('\\'),
                    '\'' => out.push('\''),
                    '"' => out.push('"'),
                    '\n' => {}
                    'x' => {
                        let hex: String = (0..2).filter_map(|_| self.bump()).collect();
                        let code = u32::from_str_radix(&hex, 16).map_err(|_| self.error("invalid \\x escape"))?;
                        out.push(char::from_u32(code).unwrap_or('\u{fffd}'));
                    }
                    'u' => {
                        let hex: String = (0..4).filter_map(|_| self.bump()).collect();
                        let code = u32::from_str_radix(&hex, 16).map_err(|_| self.error("invalid \\u escape"))?;
                        out.push(char::from_u32(code).unwrap_or('\u{fffd}'));
                    }
                    other => {
                        out.push('\\');
                        out.push(other);
                    }
                }
                continue;
            }
            out.push(c);
        }
        Ok(out)
    }

    fn lex_operator(&mut self) -> Result<(), ParseError> {
        let (line, col) = (self.line, self.col);
        for op in OPERATORS {
            let matches = op.chars().enumerate().all(|(i, ch)| self.peek_at(i) == Some(ch));
            if matches {
                for _ in 0..op.len() {
                    self.bump();
                }
                match *op {
                    "(" | "[" | "{" => self.depth += 1,
                    ")" | "]" | "}" => self.depth = self.depth.saturating_sub(1),
                    _ => {}
                }
                self.push(Tok::Op(op), line, col);
                return Ok(());
            }
        }
        let c = self.peek().unwrap_or(' ');
        Err(self.error(format!("invalid character '{}'", c)))
    }
}
