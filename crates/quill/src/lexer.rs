//! Lexer: UTF-8 source text to a token stream.
//!
//! Interpolated strings are handled by re-running the lexer over each
//! `${ ... }` segment, producing nested token lists the parser later
//! re-enters in expression mode. Blank lines between statements are
//! preserved as explicit [`TokenKind::EmptyLine`] tokens.

use crate::{
    error::{ErrorCode, QuillError},
    token::{Token, TokenKind, TokenLiteral, keyword_kind},
};

/// Lexes a module source, accumulating recoverable errors.
///
/// The returned stream always ends with an `EndOfFile` token. On an
/// unexpected character the lexer records `UnexpectedChar` and resumes at
/// the next character.
#[must_use]
pub fn lex(source: &str) -> (Vec<Token>, Vec<QuillError>) {
    let mut lexer = Lexer::new(source);
    lexer.run();
    (lexer.tokens, lexer.errors)
}

struct Lexer<'a> {
    source: &'a str,
    /// Byte offset of the next unread character.
    index: usize,
    line: u32,
    column: u32,
    tokens: Vec<Token>,
    errors: Vec<QuillError>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            index: 0,
            line: 1,
            column: 1,
            tokens: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn run(&mut self) {
        loop {
            self.strip();
            let Some(c) = self.peek() else { break };
            let (line, column, offset) = (self.line, self.column, self.index as u32);
            if c.is_alphabetic() || c == '_' {
                self.identifier(line, column, offset);
            } else if c.is_ascii_digit() {
                self.number(line, column, offset);
            } else if c == '\'' || c == '"' {
                self.advance();
                self.string(c, line, column, offset);
            } else {
                self.punctuation(c, line, column, offset);
            }
        }
        self.tokens.push(Token::new(
            TokenKind::EndOfFile,
            "",
            self.line,
            self.column,
            self.index as u32,
            0,
        ));
    }

    fn peek(&self) -> Option<char> {
        self.source[self.index..].chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        let mut chars = self.source[self.index..].chars();
        chars.next();
        chars.next()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.index += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    /// Consumes whitespace and comments. Emits an `EmptyLine` token when at
    /// least one completely blank line separates two pieces of content.
    fn strip(&mut self) {
        let mut newlines = 0u32;
        let mut blank_line = (0u32, 0u32, 0u32);
        loop {
            match self.peek() {
                Some('\n') => {
                    newlines += 1;
                    if newlines == 2 {
                        blank_line = (self.line, self.column, self.index as u32);
                    }
                    self.advance();
                }
                Some(c) if c.is_whitespace() => {
                    self.advance();
                }
                Some('/') if self.peek_second() == Some('/') => {
                    // single-line comment, documentation variant included
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                Some('/') if self.peek_second() == Some('*') => {
                    self.block_comment();
                }
                _ => break,
            }
        }
        if newlines >= 2 && !self.tokens.is_empty() && self.peek().is_some() {
            let (line, column, offset) = blank_line;
            self.tokens
                .push(Token::new(TokenKind::EmptyLine, "\n", line, column, offset, 1));
        }
    }

    fn block_comment(&mut self) {
        let (line, column, offset) = (self.line, self.column, self.index as u32);
        self.advance();
        self.advance();
        loop {
            match self.peek() {
                Some('*') if self.peek_second() == Some('/') => {
                    self.advance();
                    self.advance();
                    return;
                }
                Some(_) => {
                    self.advance();
                }
                None => {
                    self.errors.push(QuillError::new(
                        ErrorCode::UnterminatedLiteral,
                        "unterminated block comment",
                        line,
                        column,
                        offset,
                        (self.index as u32) - offset,
                    ));
                    return;
                }
            }
        }
    }

    fn identifier(&mut self, line: u32, column: u32, offset: u32) {
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                self.advance();
            } else {
                break;
            }
        }
        let lexeme = &self.source[offset as usize..self.index];
        let length = (self.index as u32) - offset;
        let kind = keyword_kind(lexeme).unwrap_or(TokenKind::Identifier);
        let mut token = Token::new(kind, lexeme, line, column, offset, length);
        match kind {
            TokenKind::True => token.literal = Some(TokenLiteral::Bool(true)),
            TokenKind::False => token.literal = Some(TokenLiteral::Bool(false)),
            _ => {}
        }
        self.tokens.push(token);
    }

    fn number(&mut self, line: u32, column: u32, offset: u32) {
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.advance();
            } else if c == '.' && !is_float && self.peek_second().is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                self.advance();
            } else if (c == 'e' || c == 'E')
                && self.index > offset as usize
                && self
                    .peek_second()
                    .is_some_and(|c| c.is_ascii_digit() || c == '+' || c == '-')
            {
                is_float = true;
                self.advance();
                if matches!(self.peek(), Some('+' | '-')) {
                    self.advance();
                }
            } else {
                break;
            }
        }
        let lexeme = &self.source[offset as usize..self.index];
        let length = (self.index as u32) - offset;
        let (kind, literal) = if is_float {
            (
                TokenKind::FloatLiteral,
                lexeme.parse::<f64>().ok().map(TokenLiteral::Float),
            )
        } else {
            (TokenKind::IntLiteral, lexeme.parse::<i64>().ok().map(TokenLiteral::Int))
        };
        let mut token = Token::new(kind, lexeme, line, column, offset, length);
        token.literal = literal;
        self.tokens.push(token);
    }

    /// Lexes the rest of a string after the opening quote.
    ///
    /// `${ ... }` segments are cut out, lexed recursively into nested token
    /// lists, and replaced by `{N}` placeholders in the stored literal.
    fn string(&mut self, quote: char, line: u32, column: u32, offset: u32) {
        let mut text = String::new();
        let mut segments: Vec<Vec<Token>> = Vec::new();
        loop {
            let Some(c) = self.peek() else {
                self.errors.push(QuillError::new(
                    ErrorCode::UnterminatedLiteral,
                    "unterminated string literal",
                    line,
                    column,
                    offset,
                    (self.index as u32) - offset,
                ));
                break;
            };
            if c == quote {
                self.advance();
                break;
            }
            if c == '\\' {
                self.advance();
                let escaped = match self.advance() {
                    Some('n') => '\n',
                    Some('r') => '\r',
                    Some('t') => '\t',
                    Some('\\') => '\\',
                    Some('\'') => '\'',
                    Some('"') => '"',
                    Some(other) => {
                        self.errors.push(QuillError::new(
                            ErrorCode::UnexpectedChar,
                            format!("unknown escape `\\{other}` in string literal"),
                            self.line,
                            self.column,
                            (self.index as u32).saturating_sub(1),
                            1,
                        ));
                        other
                    }
                    None => continue,
                };
                text.push(escaped);
            } else if c == '$' && self.peek_second() == Some('{') {
                self.advance();
                self.advance();
                let segment = self.interpolation_segment(line, column, offset);
                text.push('{');
                text.push_str(&segments.len().to_string());
                text.push('}');
                segments.push(segment);
            } else {
                self.advance();
                text.push(c);
            }
        }
        let length = (self.index as u32) - offset;
        let lexeme = &self.source[offset as usize..self.index];
        let mut token = if segments.is_empty() {
            let mut token = Token::new(TokenKind::StringLiteral, lexeme, line, column, offset, length);
            token.literal = Some(TokenLiteral::Str(text));
            token
        } else {
            let mut token = Token::new(TokenKind::InterpolatedString, lexeme, line, column, offset, length);
            token.literal = Some(TokenLiteral::Interpolation { text, segments });
            token
        };
        token.length = length;
        self.tokens.push(token);
    }

    /// Cuts the source between `${` and its matching `}` and lexes it
    /// recursively. Nested braces inside the segment are balanced.
    fn interpolation_segment(&mut self, line: u32, column: u32, offset: u32) -> Vec<Token> {
        let start = self.index;
        let (seg_line, seg_column) = (self.line, self.column);
        let mut depth = 1u32;
        loop {
            match self.peek() {
                Some('{') => {
                    depth += 1;
                    self.advance();
                }
                Some('}') => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                    self.advance();
                }
                Some(_) => {
                    self.advance();
                }
                None => {
                    self.errors.push(QuillError::new(
                        ErrorCode::UnterminatedLiteral,
                        "unterminated interpolation segment",
                        line,
                        column,
                        offset,
                        (self.index as u32) - offset,
                    ));
                    return Vec::new();
                }
            }
        }
        let inner = &self.source[start..self.index];
        // consume the closing brace
        self.advance();
        let (mut tokens, errors) = lex(inner);
        // re-anchor segment positions to the enclosing source
        for token in &mut tokens {
            token.offset += start as u32;
            if token.line == 1 {
                token.column += seg_column - 1;
            }
            token.line += seg_line - 1;
        }
        self.errors.extend(errors.into_iter().map(|mut e| {
            e.offset += start as u32;
            if e.line == 1 {
                e.column += seg_column - 1;
            }
            e.line += seg_line - 1;
            e
        }));
        tokens
    }

    fn punctuation(&mut self, c: char, line: u32, column: u32, offset: u32) {
        self.advance();
        let second = self.peek();
        let (kind, len) = match (c, second) {
            ('+', Some('+')) => (TokenKind::Increment, 2),
            ('+', Some('=')) => (TokenKind::PlusAssign, 2),
            ('+', _) => (TokenKind::Plus, 1),
            ('-', Some('-')) => (TokenKind::Decrement, 2),
            ('-', Some('=')) => (TokenKind::MinusAssign, 2),
            ('-', _) => (TokenKind::Minus, 1),
            ('*', Some('=')) => (TokenKind::StarAssign, 2),
            ('*', _) => (TokenKind::Star, 1),
            ('/', Some('=')) => (TokenKind::SlashAssign, 2),
            ('/', _) => (TokenKind::Slash, 1),
            ('%', _) => (TokenKind::Percent, 1),
            ('=', Some('=')) => (TokenKind::Equal, 2),
            ('=', Some('>')) => (TokenKind::Arrow, 2),
            ('=', _) => (TokenKind::Assign, 1),
            ('!', Some('=')) => (TokenKind::NotEqual, 2),
            ('!', _) => (TokenKind::LogicalNot, 1),
            ('<', Some('=')) => (TokenKind::LesserOrEqual, 2),
            ('<', _) => (TokenKind::Lesser, 1),
            ('>', Some('=')) => (TokenKind::GreaterOrEqual, 2),
            ('>', _) => (TokenKind::Greater, 1),
            ('&', Some('&')) => (TokenKind::LogicalAnd, 2),
            ('|', Some('|')) => (TokenKind::LogicalOr, 2),
            ('?', _) => (TokenKind::Question, 1),
            (':', _) => (TokenKind::Colon, 1),
            ('.', Some('.')) if self.peek_second() == Some('.') => {
                self.advance();
                self.advance();
                (TokenKind::Spread, 3)
            }
            ('.', _) => (TokenKind::Dot, 1),
            (',', _) => (TokenKind::Comma, 1),
            (';', _) => (TokenKind::Semicolon, 1),
            ('(', _) => (TokenKind::LeftParen, 1),
            (')', _) => (TokenKind::RightParen, 1),
            ('[', _) => (TokenKind::LeftBracket, 1),
            (']', _) => (TokenKind::RightBracket, 1),
            ('{', _) => (TokenKind::LeftBrace, 1),
            ('}', _) => (TokenKind::RightBrace, 1),
            _ => {
                self.errors.push(QuillError::new(
                    ErrorCode::UnexpectedChar,
                    format!("unexpected character `{c}`"),
                    line,
                    column,
                    offset,
                    c.len_utf8() as u32,
                ));
                return;
            }
        };
        if len == 2 {
            self.advance();
        }
        let lexeme = &self.source[offset as usize..self.index];
        self.tokens.push(Token::new(kind, lexeme, line, column, offset, len));
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let (tokens, errors) = lex(source);
        assert!(errors.is_empty(), "unexpected lex errors: {errors:?}");
        tokens.iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lexes_declaration() {
        assert_eq!(
            kinds("var x = 1"),
            vec![
                TokenKind::Var,
                TokenKind::Identifier,
                TokenKind::Assign,
                TokenKind::IntLiteral,
                TokenKind::EndOfFile,
            ]
        );
    }

    #[test]
    fn lexes_float_and_exponent() {
        let (tokens, _) = lex("1.5 2e3 7");
        assert_eq!(tokens[0].literal, Some(TokenLiteral::Float(1.5)));
        assert_eq!(tokens[1].literal, Some(TokenLiteral::Float(2000.0)));
        assert_eq!(tokens[2].literal, Some(TokenLiteral::Int(7)));
    }

    #[test]
    fn member_access_on_int_is_not_a_float() {
        assert_eq!(
            kinds("1.toString"),
            vec![
                TokenKind::IntLiteral,
                TokenKind::Dot,
                TokenKind::Identifier,
                TokenKind::EndOfFile,
            ]
        );
    }

    #[test]
    fn lexes_string_escapes() {
        let (tokens, errors) = lex(r#"'a\n\tb' "q\"" "#);
        assert!(errors.is_empty());
        assert_eq!(tokens[0].literal, Some(TokenLiteral::Str("a\n\tb".to_owned())));
        assert_eq!(tokens[1].literal, Some(TokenLiteral::Str("q\"".to_owned())));
    }

    #[test]
    fn interpolation_produces_nested_tokens_and_placeholders() {
        let (tokens, errors) = lex("'a ${x + 1} b ${y}'");
        assert!(errors.is_empty());
        assert_eq!(tokens[0].kind, TokenKind::InterpolatedString);
        let Some(TokenLiteral::Interpolation { text, segments }) = &tokens[0].literal else {
            panic!("expected interpolation literal");
        };
        assert_eq!(text, "a {0} b {1}");
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0][0].kind, TokenKind::Identifier);
        assert_eq!(segments[0][1].kind, TokenKind::Plus);
        assert_eq!(segments[1][0].lexeme, "y");
    }

    #[test]
    fn empty_lines_are_preserved() {
        let kinds = kinds("var a = 1\n\n\nvar b = 2");
        assert!(kinds.contains(&TokenKind::EmptyLine));
    }

    #[test]
    fn comments_are_stripped() {
        assert_eq!(
            kinds("// doc\n/* block\nstill */ var x /// trailing doc"),
            vec![TokenKind::Var, TokenKind::Identifier, TokenKind::EndOfFile]
        );
    }

    #[test]
    fn unexpected_char_is_recorded_and_skipped() {
        let (tokens, errors) = lex("var #x");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, ErrorCode::UnexpectedChar);
        assert_eq!(errors[0].column, 5);
        assert_eq!(tokens[1].kind, TokenKind::Identifier);
    }

    #[test]
    fn positions_are_one_based() {
        let (tokens, _) = lex("a\n bc");
        assert_eq!((tokens[0].line, tokens[0].column), (1, 1));
        assert_eq!((tokens[1].line, tokens[1].column), (2, 2));
        assert_eq!(tokens[1].offset, 3);
    }
}
