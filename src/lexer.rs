//! Tokenization of S-expression source text.
//!
//! The lexer holds the remaining source slice and exactly one current
//! token of lookahead; the compiler drives it with [`Lexer::current`]
//! and [`Lexer::advance`]. Individual tokens are recognized by small
//! nom parsers over the remaining input.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::take_while,
    character::complete::{char, satisfy},
    combinator::{recognize, value},
    sequence::pair,
};

use crate::{Error, LexErrorKind};

/// Characters the lexer treats as whitespace between tokens
const WHITESPACE: [char; 3] = [' ', '\t', '\n'];

/// A single source token
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// End of input
    Eof,
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    /// `#`, which introduces an anonymous function
    Hash,
    /// A `"…"` literal, or the `'sym` quoting shorthand
    String(String),
    Number(f32),
    Symbol(String),
}

/// Can `c` start a symbol run?
fn is_symbol_start(c: char) -> bool {
    c.is_ascii_alphabetic() || "_-+*/?.".contains(c)
}

/// Can `c` continue a symbol run? Digits are admitted after the first
/// character.
fn is_symbol_char(c: char) -> bool {
    is_symbol_start(c) || c.is_ascii_digit()
}

fn punctuation(input: &str) -> IResult<&str, Token> {
    alt((
        value(Token::LeftParen, char('(')),
        value(Token::RightParen, char(')')),
        value(Token::LeftBracket, char('[')),
        value(Token::RightBracket, char(']')),
        value(Token::Hash, char('#')),
    ))
    .parse(input)
}

/// Parse a string literal. Content is the bytes between the quotes
/// verbatim; there is no escape processing.
fn string_literal(input: &str) -> IResult<&str, Token> {
    let (input, _) = char('"').parse(input)?;
    let (input, body) = take_while(|c| c != '"').parse(input)?;
    // Fails at end of input, which surfaces as an unterminated string
    let (input, _) = char('"').parse(input)?;
    Ok((input, Token::String(body.to_owned())))
}

fn symbol_text(input: &str) -> IResult<&str, &str> {
    recognize(pair(satisfy(is_symbol_start), take_while(is_symbol_char))).parse(input)
}

fn symbol(input: &str) -> IResult<&str, Token> {
    let (input, name) = symbol_text(input)?;
    Ok((input, Token::Symbol(name.to_owned())))
}

/// Parse the `'sym` quoting shorthand, which yields the symbol's text
/// as a string token.
fn quoted_symbol(input: &str) -> IResult<&str, Token> {
    let (input, _) = char('\'').parse(input)?;
    let (input, name) = symbol_text(input)?;
    Ok((input, Token::String(name.to_owned())))
}

/// Parse a number: a run starting with a digit, admitting digits and `.`
fn number(input: &str) -> IResult<&str, Token> {
    let (rest, text) = recognize(pair(
        satisfy(|c: char| c.is_ascii_digit()),
        take_while(|c: char| c.is_ascii_digit() || c == '.'),
    ))
    .parse(input)?;

    match text.parse::<f32>() {
        Ok(n) => Ok((rest, Token::Number(n))),
        // A digit run that is not a float, e.g. "1.2.3"
        Err(_) => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Float,
        ))),
    }
}

fn token(input: &str) -> IResult<&str, Token> {
    alt((punctuation, string_literal, quoted_symbol, number, symbol)).parse(input)
}

/// Turn a failed token recognition into a structured lex error, keyed
/// off the character the run started with.
fn classify_failure(rest: &str) -> Error {
    let snippet: String = rest.chars().take(12).collect();
    match rest.chars().next() {
        Some('"') => Error::lex(
            LexErrorKind::UnterminatedString,
            format!("string: missing closing quote near {snippet:?}"),
        ),
        Some(c) if c.is_ascii_digit() => Error::lex(
            LexErrorKind::MalformedNumber,
            format!("number: malformed literal near {snippet:?}"),
        ),
        Some('\'') => Error::lex(
            LexErrorKind::InvalidCharacter,
            format!("quote: expected a symbol near {snippet:?}"),
        ),
        Some(c) => Error::lex(
            LexErrorKind::InvalidCharacter,
            format!("unexpected character {c:?}"),
        ),
        None => Error::lex(LexErrorKind::InvalidCharacter, "unexpected end of input"),
    }
}

/// A single-lookahead token stream over a source string.
#[derive(Debug)]
pub struct Lexer<'a> {
    rest: &'a str,
    current: Token,
}

impl<'a> Lexer<'a> {
    /// Position at the start of `source` and advance to the first token.
    pub fn new(source: &'a str) -> Result<Self, Error> {
        let mut lexer = Lexer {
            rest: source,
            current: Token::Eof,
        };
        lexer.advance()?;
        Ok(lexer)
    }

    /// The current token.
    pub fn current(&self) -> &Token {
        &self.current
    }

    /// Advance to the next token.
    pub fn advance(&mut self) -> Result<(), Error> {
        self.rest = self.rest.trim_start_matches(WHITESPACE);
        if self.rest.is_empty() {
            self.current = Token::Eof;
            return Ok(());
        }
        match token(self.rest) {
            Ok((rest, tok)) => {
                self.rest = rest;
                self.current = tok;
                Ok(())
            }
            Err(_) => Err(classify_failure(self.rest)),
        }
    }
}

/// Drive a lexer over `source` and collect every token up to `Eof`.
pub fn tokenize(source: &str) -> Result<Vec<Token>, Error> {
    let mut lexer = Lexer::new(source)?;
    let mut tokens = Vec::new();
    while *lexer.current() != Token::Eof {
        tokens.push(lexer.current().clone());
        lexer.advance()?;
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Expected outcome of lexing one input
    enum LexTestResult {
        Tokens(Vec<Token>),
        Fail(LexErrorKind),
    }
    use LexTestResult::*;
    use Token::*;

    fn sym(name: &str) -> Token {
        Symbol(name.to_owned())
    }

    fn string(text: &str) -> Token {
        Token::String(text.to_owned())
    }

    fn run_lex_tests(cases: Vec<(&str, LexTestResult)>) {
        for (i, (input, expected)) in cases.iter().enumerate() {
            let test_id = format!("Lex test #{}", i + 1);
            match (tokenize(input), expected) {
                (Ok(actual), Tokens(tokens)) => {
                    assert_eq!(actual, *tokens, "{test_id}: token mismatch for {input:?}");
                }
                (Err(Error::LexError(e)), Fail(kind)) => {
                    assert_eq!(e.kind, *kind, "{test_id}: error kind mismatch for {input:?}");
                }
                (Ok(actual), Fail(kind)) => {
                    panic!("{test_id}: expected {kind:?}, got tokens {actual:?}");
                }
                (Err(err), Tokens(_)) => {
                    panic!("{test_id}: expected tokens, got error {err:?}");
                }
                (Err(err), Fail(_)) => {
                    panic!("{test_id}: unexpected error variant {err:?}");
                }
            }
        }
    }

    #[test]
    fn test_lexer_comprehensive() {
        let cases = vec![
            // Empty and whitespace-only inputs
            ("", Tokens(vec![])),
            (" \t\n  ", Tokens(vec![])),
            // Punctuation
            ("()", Tokens(vec![LeftParen, RightParen])),
            ("[]", Tokens(vec![LeftBracket, RightBracket])),
            ("#", Tokens(vec![Hash])),
            // Numbers parse as f32
            ("3", Tokens(vec![Number(3.0)])),
            ("3.5", Tokens(vec![Number(3.5)])),
            ("0", Tokens(vec![Number(0.0)])),
            ("10.25", Tokens(vec![Number(10.25)])),
            // A digit run stops at non-number characters
            ("12a", Tokens(vec![Number(12.0), sym("a")])),
            // Strings are verbatim, no escapes
            (r#""hi""#, Tokens(vec![string("hi")])),
            (r#""""#, Tokens(vec![string("")])),
            (r#""a \n b""#, Tokens(vec![string(r"a \n b")])),
            // Quote shorthand produces a string token
            ("'foo", Tokens(vec![string("foo")])),
            ("'done?", Tokens(vec![string("done?")])),
            // Symbols, including operator characters and trailing digits
            ("foo", Tokens(vec![sym("foo")])),
            ("+", Tokens(vec![sym("+")])),
            ("-", Tokens(vec![sym("-")])),
            ("*", Tokens(vec![sym("*")])),
            ("/", Tokens(vec![sym("/")])),
            ("done?", Tokens(vec![sym("done?")])),
            ("with-dash", Tokens(vec![sym("with-dash")])),
            ("_x2", Tokens(vec![sym("_x2")])),
            ("v17a", Tokens(vec![sym("v17a")])),
            // A leading minus starts a symbol, not a number
            ("-5", Tokens(vec![sym("-5")])),
            // true/false are plain symbols; the compiler special-cases them
            ("true false", Tokens(vec![sym("true"), sym("false")])),
            // Whole forms
            (
                "(def x 1)",
                Tokens(vec![LeftParen, sym("def"), sym("x"), Number(1.0), RightParen]),
            ),
            (
                "(f #(+ 1 2))",
                Tokens(vec![
                    LeftParen,
                    sym("f"),
                    Hash,
                    LeftParen,
                    sym("+"),
                    Number(1.0),
                    Number(2.0),
                    RightParen,
                    RightParen,
                ]),
            ),
            (
                "(defun id [x] x)",
                Tokens(vec![
                    LeftParen,
                    sym("defun"),
                    sym("id"),
                    LeftBracket,
                    sym("x"),
                    RightBracket,
                    sym("x"),
                    RightParen,
                ]),
            ),
            // Failures
            (r#""unterminated"#, Fail(LexErrorKind::UnterminatedString)),
            ("1.2.3", Fail(LexErrorKind::MalformedNumber)),
            ("@", Fail(LexErrorKind::InvalidCharacter)),
            ("'1", Fail(LexErrorKind::InvalidCharacter)),
            ("{", Fail(LexErrorKind::InvalidCharacter)),
        ];

        run_lex_tests(cases);
    }

    #[test]
    fn test_single_lookahead() {
        let mut lexer = Lexer::new("(a)").unwrap();
        assert_eq!(*lexer.current(), LeftParen);
        lexer.advance().unwrap();
        assert_eq!(*lexer.current(), sym("a"));
        lexer.advance().unwrap();
        assert_eq!(*lexer.current(), RightParen);
        lexer.advance().unwrap();
        assert_eq!(*lexer.current(), Eof);
        // Advancing past Eof stays at Eof
        lexer.advance().unwrap();
        assert_eq!(*lexer.current(), Eof);
    }
}
