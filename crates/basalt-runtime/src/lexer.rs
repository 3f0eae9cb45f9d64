//! Lexical analysis (tokenization)
//!
//! The lexer converts Basalt source code into tokens on demand: the
//! compiler is single-pass and never needs more than one token of
//! lookahead, so there is no tokenize-everything entry point.

use crate::span::Span;
use crate::token::{Token, TokenKind};

/// Lexer state for tokenizing source code
pub struct Lexer {
    /// Original source code
    source: String,
    /// Characters of source code
    chars: Vec<char>,
    /// Current position in chars
    current: usize,
    /// Start position of current token
    start: usize,
    /// Current line number (1-indexed)
    line: u32,
}

impl Lexer {
    /// Create a new lexer for the given source code
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        let chars: Vec<char> = source.chars().collect();
        Self {
            source,
            chars,
            current: 0,
            start: 0,
            line: 1,
        }
    }

    /// Scan and return the next token
    pub fn next_token(&mut self) -> Token {
        self.skip_whitespace_and_comments();
        self.start = self.current;

        if self.is_at_end() {
            return self.make_token(TokenKind::Eof);
        }

        let c = self.advance();

        match c {
            '(' => self.make_token(TokenKind::LeftParen),
            ')' => self.make_token(TokenKind::RightParen),
            '{' => self.make_token(TokenKind::LeftBrace),
            '}' => self.make_token(TokenKind::RightBrace),
            '[' => self.make_token(TokenKind::LeftBracket),
            ']' => self.make_token(TokenKind::RightBracket),
            ',' => self.make_token(TokenKind::Comma),
            '.' => self.make_token(TokenKind::Dot),
            '-' => self.make_token(TokenKind::Minus),
            '+' => self.make_token(TokenKind::Plus),
            ';' => self.make_token(TokenKind::Semicolon),
            '/' => self.make_token(TokenKind::Slash),
            '*' => self.make_token(TokenKind::Star),

            '!' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::BangEqual)
                } else {
                    self.make_token(TokenKind::Bang)
                }
            }
            '=' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::EqualEqual)
                } else {
                    self.make_token(TokenKind::Equal)
                }
            }
            '<' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::LessEqual)
                } else {
                    self.make_token(TokenKind::Less)
                }
            }
            '>' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::GreaterEqual)
                } else {
                    self.make_token(TokenKind::Greater)
                }
            }

            '"' => self.string(),

            c if c.is_ascii_digit() => self.number(),
            c if c.is_alphabetic() || c == '_' => self.identifier(),

            _ => self.error_token(format!("Unexpected character '{}'.", c)),
        }
    }

    /// 1-based column of a source offset (for diagnostics)
    pub fn column_of(&self, offset: usize) -> usize {
        let upto = offset.min(self.chars.len());
        let since_newline = self.chars[..upto]
            .iter()
            .rev()
            .take_while(|&&c| c != '\n')
            .count();
        since_newline + 1
    }

    /// Get the source line for a given line number (for diagnostics)
    pub fn line_snippet(&self, line: u32) -> String {
        self.source
            .lines()
            .nth((line - 1) as usize)
            .unwrap_or("")
            .to_string()
    }

    /// Skip whitespace and `//` line comments
    fn skip_whitespace_and_comments(&mut self) {
        loop {
            if self.is_at_end() {
                return;
            }

            match self.peek() {
                ' ' | '\r' | '\t' => {
                    self.advance();
                }
                '\n' => {
                    self.advance();
                    self.line += 1;
                }
                '/' => {
                    if self.peek_next() == Some('/') {
                        while !self.is_at_end() && self.peek() != '\n' {
                            self.advance();
                        }
                    } else {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    /// Scan a string literal (no escape sequences)
    fn string(&mut self) -> Token {
        while !self.is_at_end() && self.peek() != '"' {
            if self.peek() == '\n' {
                self.line += 1;
            }
            self.advance();
        }

        if self.is_at_end() {
            return self.error_token("Unterminated string.");
        }

        self.advance(); // closing quote
        self.make_token(TokenKind::String)
    }

    /// Scan a number literal: digits, optionally `.` and more digits
    fn number(&mut self) -> Token {
        while self.peek().is_ascii_digit() {
            self.advance();
        }

        // A fractional part requires a digit after the dot
        if self.peek() == '.' && self.peek_next().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }

        self.make_token(TokenKind::Number)
    }

    /// Scan an identifier or keyword
    fn identifier(&mut self) -> Token {
        while self.peek().is_alphanumeric() || self.peek() == '_' {
            self.advance();
        }

        let lexeme: String = self.chars[self.start..self.current].iter().collect();
        let kind = keyword_kind(&lexeme).unwrap_or(TokenKind::Identifier);
        self.make_token(kind)
    }

    // === Character navigation ===

    /// Advance to next character and return it
    fn advance(&mut self) -> char {
        let c = self.chars[self.current];
        self.current += 1;
        c
    }

    /// Peek at current character without advancing
    fn peek(&self) -> char {
        if self.is_at_end() {
            '\0'
        } else {
            self.chars[self.current]
        }
    }

    /// Peek at next character (current + 1)
    fn peek_next(&self) -> Option<char> {
        if self.current + 1 >= self.chars.len() {
            None
        } else {
            Some(self.chars[self.current + 1])
        }
    }

    /// Check if current character matches expected, and advance if so
    fn match_char(&mut self, expected: char) -> bool {
        if self.is_at_end() || self.chars[self.current] != expected {
            false
        } else {
            self.current += 1;
            true
        }
    }

    /// Check if we've reached the end of source
    fn is_at_end(&self) -> bool {
        self.current >= self.chars.len()
    }

    // === Token creation ===

    /// Create a token for the current lexeme
    fn make_token(&self, kind: TokenKind) -> Token {
        let lexeme: String = self.chars[self.start..self.current].iter().collect();
        let span = Span::new(self.start, self.current);
        Token::new(kind, lexeme, self.line, span)
    }

    /// Create an error token carrying the message as its lexeme
    fn error_token(&self, message: impl Into<String>) -> Token {
        let span = Span::new(self.start, self.current.max(self.start + 1));
        Token::new(TokenKind::Error, message, self.line, span)
    }
}

/// Recognize reserved words. Dispatches on the first character before
/// comparing the remainder, mirroring the shape of the keyword set.
fn keyword_kind(lexeme: &str) -> Option<TokenKind> {
    let kind = match lexeme.as_bytes().first()? {
        b'a' if lexeme == "and" => TokenKind::And,
        b'c' if lexeme == "class" => TokenKind::Class,
        b'e' if lexeme == "else" => TokenKind::Else,
        b'f' => match lexeme {
            "false" => TokenKind::False,
            "for" => TokenKind::For,
            "fun" => TokenKind::Fun,
            _ => return None,
        },
        b'i' if lexeme == "if" => TokenKind::If,
        b'n' if lexeme == "nil" => TokenKind::Nil,
        b'o' if lexeme == "or" => TokenKind::Or,
        b'p' if lexeme == "print" => TokenKind::Print,
        b'r' if lexeme == "return" => TokenKind::Return,
        b's' if lexeme == "super" => TokenKind::Super,
        b't' => match lexeme {
            "this" => TokenKind::This,
            "true" => TokenKind::True,
            _ => return None,
        },
        b'v' if lexeme == "var" => TokenKind::Var,
        b'w' if lexeme == "while" => TokenKind::While,
        _ => return None,
    };
    Some(kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(source);
        let mut out = Vec::new();
        loop {
            let token = lexer.next_token();
            let done = token.kind == TokenKind::Eof;
            out.push(token.kind);
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn test_punctuation_and_operators() {
        assert_eq!(
            kinds("( ) { } [ ] , . - + ; / * ! != = == > >= < <="),
            vec![
                TokenKind::LeftParen,
                TokenKind::RightParen,
                TokenKind::LeftBrace,
                TokenKind::RightBrace,
                TokenKind::LeftBracket,
                TokenKind::RightBracket,
                TokenKind::Comma,
                TokenKind::Dot,
                TokenKind::Minus,
                TokenKind::Plus,
                TokenKind::Semicolon,
                TokenKind::Slash,
                TokenKind::Star,
                TokenKind::Bang,
                TokenKind::BangEqual,
                TokenKind::Equal,
                TokenKind::EqualEqual,
                TokenKind::Greater,
                TokenKind::GreaterEqual,
                TokenKind::Less,
                TokenKind::LessEqual,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_keywords_vs_identifiers() {
        assert_eq!(
            kinds("class classy var varnish fun func"),
            vec![
                TokenKind::Class,
                TokenKind::Identifier,
                TokenKind::Var,
                TokenKind::Identifier,
                TokenKind::Fun,
                TokenKind::Identifier,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_number_literals() {
        let mut lexer = Lexer::new("12 3.5 7.");
        assert_eq!(lexer.next_token().lexeme, "12");
        assert_eq!(lexer.next_token().lexeme, "3.5");
        // `7.` is a number followed by a dot, never a fractional literal
        assert_eq!(lexer.next_token().lexeme, "7");
        assert_eq!(lexer.next_token().kind, TokenKind::Dot);
    }

    #[test]
    fn test_string_literal_keeps_quotes_in_lexeme() {
        let mut lexer = Lexer::new("\"hello\"");
        let token = lexer.next_token();
        assert_eq!(token.kind, TokenKind::String);
        assert_eq!(token.lexeme, "\"hello\"");
    }

    #[test]
    fn test_unterminated_string() {
        let mut lexer = Lexer::new("\"oops");
        let token = lexer.next_token();
        assert_eq!(token.kind, TokenKind::Error);
        assert_eq!(token.lexeme, "Unterminated string.");
    }

    #[test]
    fn test_comments_and_lines() {
        let mut lexer = Lexer::new("// comment\nprint");
        let token = lexer.next_token();
        assert_eq!(token.kind, TokenKind::Print);
        assert_eq!(token.line, 2);
    }

    #[test]
    fn test_unexpected_character() {
        let mut lexer = Lexer::new("@");
        let token = lexer.next_token();
        assert_eq!(token.kind, TokenKind::Error);
        assert_eq!(token.lexeme, "Unexpected character '@'.");
    }
}
