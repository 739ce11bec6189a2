//! Statement dialect for the embedded store
//!
//! Parses the small SQL subset the data nodes accept, over the fixed
//! `data(sensor_id, measurement)` table:
//!
//! - `INSERT INTO data VALUES (<sensor_id>, <measurement>)`
//! - `UPDATE data SET measurement = <v> WHERE sensor_id = <k>`
//! - `DELETE FROM data WHERE sensor_id = <k>`
//!
//! Values are quoted strings, integers, or `$n` placeholders resolved
//! against the positional argument list (1-based, like the wire protocol's
//! `args`).

use crate::types::SqlValue;
use thiserror::Error;

pub const TABLE_NAME: &str = "data";
pub const KEY_COLUMN: &str = "sensor_id";
pub const VALUE_COLUMN: &str = "measurement";

#[derive(Debug, Error, PartialEq)]
pub enum SqlError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("unknown table '{0}'")]
    UnknownTable(String),
    #[error("unknown column '{0}'")]
    UnknownColumn(String),
    #[error("placeholder ${0} has no matching argument")]
    MissingArgument(usize),
    #[error("{column} expects a {expected} value")]
    TypeMismatch {
        column: &'static str,
        expected: &'static str,
    },
}

/// A parsed statement with all placeholders resolved
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Insert { sensor_id: String, measurement: i64 },
    Update { sensor_id: String, measurement: i64 },
    Delete { sensor_id: String },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Str(String),
    Int(i64),
    Placeholder(usize),
    LParen,
    RParen,
    Comma,
    Equals,
}

fn tokenize(input: &str) -> Result<Vec<Token>, SqlError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Equals);
            }
            ';' => {
                // Optional statement terminator
                chars.next();
            }
            '\'' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => s.push(c),
                        None => return Err(SqlError::Syntax("unterminated string".to_string())),
                    }
                }
                tokens.push(Token::Str(s));
            }
            '$' => {
                chars.next();
                let mut digits = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        digits.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let index = digits
                    .parse::<usize>()
                    .map_err(|_| SqlError::Syntax("bad placeholder".to_string()))?;
                if index == 0 {
                    return Err(SqlError::Syntax("placeholders start at $1".to_string()));
                }
                tokens.push(Token::Placeholder(index));
            }
            c if c.is_ascii_digit() || c == '-' => {
                chars.next();
                let mut digits = String::new();
                digits.push(c);
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        digits.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = digits
                    .parse::<i64>()
                    .map_err(|_| SqlError::Syntax(format!("bad integer literal: {}", digits)))?;
                tokens.push(Token::Int(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut word = String::new();
                while let Some(&w) = chars.peek() {
                    if w.is_alphanumeric() || w == '_' {
                        word.push(w);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Word(word.to_lowercase()));
            }
            other => {
                return Err(SqlError::Syntax(format!("unexpected character '{}'", other)));
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    args: &'a [SqlValue],
}

impl<'a> Parser<'a> {
    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect_word(&mut self, word: &str) -> Result<(), SqlError> {
        match self.next() {
            Some(Token::Word(w)) if w == word => Ok(()),
            other => Err(SqlError::Syntax(format!(
                "expected '{}', found {:?}",
                word, other
            ))),
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), SqlError> {
        match self.next() {
            Some(t) if t == token => Ok(()),
            other => Err(SqlError::Syntax(format!(
                "expected {:?}, found {:?}",
                token, other
            ))),
        }
    }

    fn expect_table(&mut self) -> Result<(), SqlError> {
        match self.next() {
            Some(Token::Word(w)) if w == TABLE_NAME => Ok(()),
            Some(Token::Word(w)) => Err(SqlError::UnknownTable(w)),
            other => Err(SqlError::Syntax(format!(
                "expected table name, found {:?}",
                other
            ))),
        }
    }

    fn expect_column(&mut self, column: &'static str) -> Result<(), SqlError> {
        match self.next() {
            Some(Token::Word(w)) if w == column => Ok(()),
            Some(Token::Word(w)) => Err(SqlError::UnknownColumn(w)),
            other => Err(SqlError::Syntax(format!(
                "expected column name, found {:?}",
                other
            ))),
        }
    }

    /// A literal or placeholder, resolved to a concrete value
    fn value(&mut self) -> Result<SqlValue, SqlError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(SqlValue::Text(s)),
            Some(Token::Int(v)) => Ok(SqlValue::Int(v)),
            Some(Token::Placeholder(index)) => self
                .args
                .get(index - 1)
                .cloned()
                .ok_or(SqlError::MissingArgument(index)),
            other => Err(SqlError::Syntax(format!(
                "expected a value, found {:?}",
                other
            ))),
        }
    }

    fn key_value(&mut self) -> Result<String, SqlError> {
        match self.value()? {
            SqlValue::Text(s) => Ok(s),
            _ => Err(SqlError::TypeMismatch {
                column: KEY_COLUMN,
                expected: "text",
            }),
        }
    }

    fn int_value(&mut self) -> Result<i64, SqlError> {
        match self.value()? {
            SqlValue::Int(v) => Ok(v),
            _ => Err(SqlError::TypeMismatch {
                column: VALUE_COLUMN,
                expected: "integer",
            }),
        }
    }

    fn end(&mut self) -> Result<(), SqlError> {
        match self.next() {
            None => Ok(()),
            Some(t) => Err(SqlError::Syntax(format!(
                "unexpected trailing input: {:?}",
                t
            ))),
        }
    }
}

/// Parse a statement, resolving `$n` placeholders against `args`.
pub fn parse(query: &str, args: &[SqlValue]) -> Result<Statement, SqlError> {
    let tokens = tokenize(query)?;
    let mut p = Parser {
        tokens,
        pos: 0,
        args,
    };

    let statement = match p.next() {
        Some(Token::Word(w)) if w == "insert" => {
            p.expect_word("into")?;
            p.expect_table()?;
            p.expect_word("values")?;
            p.expect(Token::LParen)?;
            let sensor_id = p.key_value()?;
            p.expect(Token::Comma)?;
            let measurement = p.int_value()?;
            p.expect(Token::RParen)?;
            Statement::Insert {
                sensor_id,
                measurement,
            }
        }
        Some(Token::Word(w)) if w == "update" => {
            p.expect_table()?;
            p.expect_word("set")?;
            p.expect_column(VALUE_COLUMN)?;
            p.expect(Token::Equals)?;
            let measurement = p.int_value()?;
            p.expect_word("where")?;
            p.expect_column(KEY_COLUMN)?;
            p.expect(Token::Equals)?;
            let sensor_id = p.key_value()?;
            Statement::Update {
                sensor_id,
                measurement,
            }
        }
        Some(Token::Word(w)) if w == "delete" => {
            p.expect_word("from")?;
            p.expect_table()?;
            p.expect_word("where")?;
            p.expect_column(KEY_COLUMN)?;
            p.expect(Token::Equals)?;
            let sensor_id = p.key_value()?;
            Statement::Delete { sensor_id }
        }
        other => {
            return Err(SqlError::Syntax(format!(
                "expected INSERT, UPDATE or DELETE, found {:?}",
                other
            )))
        }
    };

    p.end()?;
    Ok(statement)
}
