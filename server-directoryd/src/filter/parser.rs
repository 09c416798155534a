//! Recursive-descent parser for the filter language.
//!
//! ```text
//! expr    := and ( '|' and )*
//! and     := unary ( '&' unary )*
//! unary   := '!' unary | primary
//! primary := '(' expr ')' | clause
//! clause  := word [ op word | '+' | '-' ]
//! op      := '=' | ':' | '<' | '>' | '<=' | '>='
//! ```
//!
//! Words may contain spaces (trimmed at both ends). `\` makes the next
//! character literal. `+`/`-` are flag suffixes only when followed by a
//! delimiter, so `touge-club` stays one word.

use thiserror::Error;
use crate::filter::{Filter, Key, Op};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unexpected end of filter")]
    UnexpectedEnd,

    #[error("unexpected {0}")]
    UnexpectedToken(String),

    #[error("unbalanced parentheses")]
    Unbalanced,

    #[error("unknown property '{0}'")]
    UnknownKey(String),

    #[error("'{value}' is not a valid value for {key}")]
    InvalidValue { key: String, value: String },

    #[error("filter nests deeper than {MAX_DEPTH} levels")]
    TooDeep,
}

/// Deepest allowed nesting of groups and negations.
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Op(Op),
    Flag(bool),
    And,
    Or,
    Not,
    Open,
    Close,
}

fn is_special(c: char) -> bool {
    matches!(c, '&' | '|' | '!' | '(' | ')' | '<' | '>' | '=' | ':')
}

fn is_delimiter(c: Option<char>) -> bool {
    match c {
        None => true,
        Some(c) => c.is_whitespace() || matches!(c, '&' | '|' | ')'),
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '&' => {
                chars.next();
                tokens.push(Token::And);
            }
            '|' => {
                chars.next();
                tokens.push(Token::Or);
            }
            '!' => {
                chars.next();
                tokens.push(Token::Not);
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '=' | ':' => {
                chars.next();
                tokens.push(Token::Op(if c == '=' { Op::Eq } else { Op::Contains }));
            }
            '<' | '>' => {
                chars.next();
                let or_equal = chars.peek() == Some(&'=');
                if or_equal {
                    chars.next();
                }
                tokens.push(Token::Op(match (c, or_equal) {
                    ('<', false) => Op::Lt,
                    ('<', true) => Op::Le,
                    ('>', false) => Op::Gt,
                    _ => Op::Ge,
                }));
            }
            _ => {
                let mut word = String::new();
                // Trailing spaces are trimmed, escaped ones are kept
                let mut kept = 0;
                while let Some(&c) = chars.peek() {
                    if c == '\\' {
                        chars.next();
                        let escaped = chars.next().ok_or(ParseError::UnexpectedEnd)?;
                        word.push(escaped);
                        kept = word.len();
                        continue;
                    }
                    if is_special(c) {
                        break;
                    }
                    if (c == '+' || c == '-') && !word.trim().is_empty() {
                        let mut ahead = chars.clone();
                        ahead.next();
                        if is_delimiter(ahead.peek().copied()) {
                            break;
                        }
                    }
                    chars.next();
                    word.push(c);
                    if !c.is_whitespace() {
                        kept = word.len();
                    }
                }
                word.truncate(kept);
                tokens.push(Token::Word(word));

                match chars.peek() {
                    Some('+') => {
                        chars.next();
                        tokens.push(Token::Flag(true));
                    }
                    Some('-') => {
                        chars.next();
                        tokens.push(Token::Flag(false));
                    }
                    _ => {}
                }
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> Result<Filter, ParseError> {
        let mut parts = vec![self.and()?];
        while self.peek() == Some(&Token::Or) {
            self.next();
            parts.push(self.and()?);
        }
        Ok(if parts.len() == 1 { parts.remove(0) } else { Filter::Or(parts) })
    }

    fn and(&mut self) -> Result<Filter, ParseError> {
        let mut parts = vec![self.unary()?];
        while self.peek() == Some(&Token::And) {
            self.next();
            parts.push(self.unary()?);
        }
        Ok(if parts.len() == 1 { parts.remove(0) } else { Filter::And(parts) })
    }

    fn descend(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ParseError::TooDeep);
        }
        Ok(())
    }

    fn unary(&mut self) -> Result<Filter, ParseError> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            self.descend()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Filter::Not(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Filter, ParseError> {
        match self.next() {
            Some(Token::Open) => {
                self.descend()?;
                let inner = self.expr()?;
                self.depth -= 1;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    Some(other) => Err(ParseError::UnexpectedToken(describe(&other))),
                    None => Err(ParseError::Unbalanced),
                }
            }
            Some(Token::Word(word)) => self.clause(word),
            Some(other) => Err(ParseError::UnexpectedToken(describe(&other))),
            None => Err(ParseError::UnexpectedEnd),
        }
    }

    fn clause(&mut self, word: String) -> Result<Filter, ParseError> {
        match self.peek() {
            Some(Token::Op(op)) => {
                let op = *op;
                self.next();
                let key = Key::from_word(&word).ok_or_else(|| ParseError::UnknownKey(word.clone()))?;
                match self.next() {
                    Some(Token::Word(value)) => Filter::compare(key, op, &value),
                    Some(other) => Err(ParseError::UnexpectedToken(describe(&other))),
                    None => Err(ParseError::UnexpectedEnd),
                }
            }
            Some(Token::Flag(expected)) => {
                let expected = *expected;
                self.next();
                let key = Key::from_word(&word).ok_or_else(|| ParseError::UnknownKey(word.clone()))?;
                if !key.is_flag() {
                    return Err(ParseError::InvalidValue {
                        key: key.name().to_string(),
                        value: if expected { "+" } else { "-" }.to_string(),
                    });
                }
                Ok(Filter::Flag { key, expected })
            }
            _ => Ok(Filter::Name(word.to_lowercase())),
        }
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Word(w) => format!("'{}'", w),
        Token::Op(op) => format!("'{}'", op.symbol()),
        Token::Flag(true) => "'+'".to_string(),
        Token::Flag(false) => "'-'".to_string(),
        Token::And => "'&'".to_string(),
        Token::Or => "'|'".to_string(),
        Token::Not => "'!'".to_string(),
        Token::Open => "'('".to_string(),
        Token::Close => "')'".to_string(),
    }
}

/// Parse a complete filter expression.
pub fn parse(input: &str) -> Result<Filter, ParseError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0, depth: 0 };
    let filter = parser.expr()?;
    match parser.next() {
        None => Ok(filter),
        Some(Token::Close) => Err(ParseError::Unbalanced),
        Some(other) => Err(ParseError::UnexpectedToken(describe(&other))),
    }
}

/// Split at `separator` characters that sit outside parentheses and are not
/// escaped. Never fails; unbalanced input just ends up in the last piece.
pub fn split_top_level(input: &str, separator: char) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                current.push(c);
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            c if c == separator && depth == 0 => {
                pieces.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    pieces.push(current);

    pieces
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence_and_grouping() {
        let filter = parse("drivers>0 & (full- | favourite+) & !password+").unwrap();
        assert_eq!(
            filter,
            Filter::And(vec![
                Filter::Number { key: Key::Drivers, op: Op::Gt, value: 0 },
                Filter::Or(vec![
                    Filter::Flag { key: Key::Full, expected: false },
                    Filter::Flag { key: Key::Favourite, expected: true },
                ]),
                Filter::Not(Box::new(Filter::Flag { key: Key::Password, expected: true })),
            ])
        );
    }

    #[test]
    fn test_bare_words_keep_spaces_and_hyphens() {
        assert_eq!(parse("  Touge-Club Japan ").unwrap(), Filter::Name("touge-club japan".to_string()));
        assert_eq!(parse(r"a\&b").unwrap(), Filter::Name("a&b".to_string()));
    }

    #[test]
    fn test_whitespace_is_insignificant_around_operators() {
        assert_eq!(parse("( drivers >= 2 )").unwrap(), parse("(drivers>=2)").unwrap());
        assert_eq!(parse("full -").unwrap(), parse("full-").unwrap());
    }

    #[test]
    fn test_nesting_is_bounded() {
        let nested = |n: usize| format!("{}drivers>0{}", "(".repeat(n), ")".repeat(n));
        assert!(parse(&nested(MAX_DEPTH)).is_ok());
        assert_eq!(parse(&nested(MAX_DEPTH + 1)), Err(ParseError::TooDeep));
        assert_eq!(parse(&nested(200_000)), Err(ParseError::TooDeep));
        assert_eq!(parse(&format!("{}full-", "!".repeat(100_000))), Err(ParseError::TooDeep));

        // Depth is nesting, not the number of groups
        let siblings = vec!["(drivers>0)"; 500].join(" & ");
        assert!(parse(&siblings).is_ok());
    }

    #[test]
    fn test_errors() {
        assert_eq!(parse("(drivers>0"), Err(ParseError::Unbalanced));
        assert_eq!(parse("drivers>0)"), Err(ParseError::Unbalanced));
        assert_eq!(parse("drivers>"), Err(ParseError::UnexpectedEnd));
        assert_eq!(parse("colour=red"), Err(ParseError::UnknownKey("colour".to_string())));
        assert!(matches!(parse("drivers>lots"), Err(ParseError::InvalidValue { .. })));
        assert!(matches!(parse("drivers+"), Err(ParseError::InvalidValue { .. })));
        assert!(parse("").is_err());
    }

    #[test]
    fn test_split_top_level_respects_brackets_and_escapes() {
        assert_eq!(
            split_top_level("(drivers>0)&(full-|name:a\\&b)& (password-)", '&'),
            vec!["(drivers>0)", "(full-|name:a\\&b)", "(password-)"]
        );
        assert_eq!(split_top_level("((a&b)&c)", '&'), vec!["((a&b)&c)"]);
        assert!(split_top_level("", '&').is_empty());
    }
}
