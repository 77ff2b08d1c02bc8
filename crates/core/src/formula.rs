//! Arithmetic over decimal bindings.
//!
//! The grammar is deliberately closed: numeric literals, identifiers bound by
//! the caller, `+ - * / %` and parentheses. Anything else, including function
//! call syntax, is rejected before evaluation starts. Evaluation is pure and
//! uses fixed-point decimals throughout.

use std::collections::BTreeMap;
use std::str::FromStr;

use rust_decimal::Decimal;
use thiserror::Error;

const MAX_EXPRESSION_LEN: usize = 1024;
const MAX_NESTING_DEPTH: usize = 64;

pub type Bindings = BTreeMap<String, Decimal>;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FormulaError {
    #[error("formula is empty")]
    Empty,
    #[error("formula exceeds {MAX_EXPRESSION_LEN} characters")]
    TooLong,
    #[error("disallowed syntax `{token}` at position {position}")]
    DisallowedSyntax { token: String, position: usize },
    #[error("function calls are not allowed (`{name}(` at position {position})")]
    FunctionCall { name: String, position: usize },
    #[error("invalid number literal `{literal}`")]
    InvalidNumber { literal: String },
    #[error("unknown identifier `{0}`")]
    UnknownIdentifier(String),
    #[error("unexpected end of formula")]
    UnexpectedEnd,
    #[error("unexpected token `{token}` at position {position}")]
    UnexpectedToken { token: String, position: usize },
    #[error("formula nesting exceeds {MAX_NESTING_DEPTH} levels")]
    TooDeep,
    #[error("division by zero")]
    DivisionByZero,
    #[error("arithmetic overflow")]
    Overflow,
}

/// Evaluates `expression` against `bindings`.
///
/// Identical inputs always yield identical outputs; the evaluator keeps no
/// state between calls.
pub fn evaluate(expression: &str, bindings: &Bindings) -> Result<Decimal, FormulaError> {
    let tokens = tokenize(expression)?;
    let mut parser = Parser { tokens: &tokens, position: 0, depth: 0, bindings };
    let value = parser.expression()?;
    match parser.peek() {
        None => Ok(value),
        Some(token) => {
            Err(FormulaError::UnexpectedToken { token: token.kind.describe(), position: token.at })
        }
    }
}

/// Identifiers referenced by `expression`, in order of first appearance.
pub fn identifiers(expression: &str) -> Result<Vec<String>, FormulaError> {
    let mut names = Vec::new();
    for token in tokenize(expression)? {
        if let TokenKind::Ident(name) = token.kind {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    Ok(names)
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum TokenKind {
    Number(Decimal),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
}

impl TokenKind {
    fn describe(&self) -> String {
        match self {
            Self::Number(value) => value.to_string(),
            Self::Ident(name) => name.clone(),
            Self::Plus => "+".to_string(),
            Self::Minus => "-".to_string(),
            Self::Star => "*".to_string(),
            Self::Slash => "/".to_string(),
            Self::Percent => "%".to_string(),
            Self::LParen => "(".to_string(),
            Self::RParen => ")".to_string(),
        }
    }
}

#[derive(Clone, Debug)]
struct Token {
    kind: TokenKind,
    at: usize,
}

fn tokenize(expression: &str) -> Result<Vec<Token>, FormulaError> {
    if expression.len() > MAX_EXPRESSION_LEN {
        return Err(FormulaError::TooLong);
    }
    if expression.trim().is_empty() {
        return Err(FormulaError::Empty);
    }

    let chars: Vec<char> = expression.chars().collect();
    let mut tokens = Vec::new();
    let mut index = 0;

    while index < chars.len() {
        let ch = chars[index];
        let start = index;

        if ch.is_whitespace() {
            index += 1;
            continue;
        }

        let simple = match ch {
            '+' => Some(TokenKind::Plus),
            '-' => Some(TokenKind::Minus),
            '*' => Some(TokenKind::Star),
            '/' => Some(TokenKind::Slash),
            '%' => Some(TokenKind::Percent),
            '(' => Some(TokenKind::LParen),
            ')' => Some(TokenKind::RParen),
            _ => None,
        };
        if let Some(kind) = simple {
            tokens.push(Token { kind, at: start });
            index += 1;
            continue;
        }

        if ch.is_ascii_digit() || ch == '.' {
            while index < chars.len() && (chars[index].is_ascii_digit() || chars[index] == '.') {
                index += 1;
            }
            let literal: String = chars[start..index].iter().collect();
            let value = Decimal::from_str(&literal)
                .map_err(|_| FormulaError::InvalidNumber { literal: literal.clone() })?;
            tokens.push(Token { kind: TokenKind::Number(value), at: start });
            continue;
        }

        if ch.is_ascii_alphabetic() || ch == '_' {
            while index < chars.len()
                && (chars[index].is_ascii_alphanumeric() || matches!(chars[index], '_' | '.' | '-'))
            {
                // `-` only continues a dotted path such as `ops-account.balance`;
                // `rate-bonus` stays subtraction.
                if chars[index] == '-' && !is_path_hyphen(&chars, index) {
                    break;
                }
                index += 1;
            }
            let name: String = chars[start..index].iter().collect();
            if name.ends_with('.') {
                return Err(FormulaError::DisallowedSyntax { token: name, position: start });
            }

            let mut lookahead = index;
            while lookahead < chars.len() && chars[lookahead].is_whitespace() {
                lookahead += 1;
            }
            if lookahead < chars.len() && chars[lookahead] == '(' {
                return Err(FormulaError::FunctionCall { name, position: start });
            }

            tokens.push(Token { kind: TokenKind::Ident(name), at: start });
            continue;
        }

        return Err(FormulaError::DisallowedSyntax { token: ch.to_string(), position: start });
    }

    Ok(tokens)
}

fn is_path_hyphen(chars: &[char], index: usize) -> bool {
    let previous_is_word = index > 0 && chars[index - 1].is_ascii_alphanumeric();
    let next_is_letter = chars.get(index + 1).is_some_and(|next| next.is_ascii_alphabetic());
    previous_is_word
        && next_is_letter
        && chars[index + 1..]
            .iter()
            .take_while(|c| c.is_ascii_alphanumeric() || matches!(**c, '_' | '-' | '.'))
            .any(|c| *c == '.')
}

struct Parser<'a> {
    tokens: &'a [Token],
    position: usize,
    depth: usize,
    bindings: &'a Bindings,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.position);
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn expression(&mut self) -> Result<Decimal, FormulaError> {
        let mut value = self.term()?;
        while let Some(token) = self.peek() {
            match token.kind {
                TokenKind::Plus => {
                    self.advance();
                    let rhs = self.term()?;
                    value = value.checked_add(rhs).ok_or(FormulaError::Overflow)?;
                }
                TokenKind::Minus => {
                    self.advance();
                    let rhs = self.term()?;
                    value = value.checked_sub(rhs).ok_or(FormulaError::Overflow)?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<Decimal, FormulaError> {
        let mut value = self.unary()?;
        while let Some(token) = self.peek() {
            match token.kind {
                TokenKind::Star => {
                    self.advance();
                    let rhs = self.unary()?;
                    value = value.checked_mul(rhs).ok_or(FormulaError::Overflow)?;
                }
                TokenKind::Slash => {
                    self.advance();
                    let rhs = self.unary()?;
                    if rhs.is_zero() {
                        return Err(FormulaError::DivisionByZero);
                    }
                    value = value.checked_div(rhs).ok_or(FormulaError::Overflow)?;
                }
                TokenKind::Percent => {
                    self.advance();
                    let rhs = self.unary()?;
                    if rhs.is_zero() {
                        return Err(FormulaError::DivisionByZero);
                    }
                    value = value.checked_rem(rhs).ok_or(FormulaError::Overflow)?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn unary(&mut self) -> Result<Decimal, FormulaError> {
        match self.peek().map(|token| &token.kind) {
            Some(TokenKind::Minus) => {
                self.advance();
                self.nested(|parser| parser.unary()).map(|value| -value)
            }
            Some(TokenKind::Plus) => {
                self.advance();
                self.nested(|parser| parser.unary())
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Decimal, FormulaError> {
        let token = self.advance().ok_or(FormulaError::UnexpectedEnd)?;
        match &token.kind {
            TokenKind::Number(value) => Ok(*value),
            TokenKind::Ident(name) => self
                .bindings
                .get(name)
                .copied()
                .ok_or_else(|| FormulaError::UnknownIdentifier(name.clone())),
            TokenKind::LParen => {
                let value = self.nested(|parser| parser.expression())?;
                match self.advance() {
                    Some(Token { kind: TokenKind::RParen, .. }) => Ok(value),
                    Some(other) => Err(FormulaError::UnexpectedToken {
                        token: other.kind.describe(),
                        position: other.at,
                    }),
                    None => Err(FormulaError::UnexpectedEnd),
                }
            }
            other => {
                Err(FormulaError::UnexpectedToken { token: other.describe(), position: token.at })
            }
        }
    }

    fn nested(
        &mut self,
        inner: impl FnOnce(&mut Self) -> Result<Decimal, FormulaError>,
    ) -> Result<Decimal, FormulaError> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(FormulaError::TooDeep);
        }
        let result = inner(self);
        self.depth -= 1;
        result
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::{evaluate, identifiers, Bindings, FormulaError};

    fn bindings(pairs: &[(&str, Decimal)]) -> Bindings {
        pairs.iter().map(|(name, value)| (name.to_string(), *value)).collect()
    }

    #[test]
    fn evaluates_precedence_and_parentheses() {
        let empty = Bindings::new();
        assert_eq!(evaluate("2 + 3 * 4", &empty), Ok(Decimal::new(14, 0)));
        assert_eq!(evaluate("(2 + 3) * 4", &empty), Ok(Decimal::new(20, 0)));
        assert_eq!(evaluate("-(10 - 4) / 3", &empty), Ok(Decimal::new(-2, 0)));
        assert_eq!(evaluate("17 % 5", &empty), Ok(Decimal::new(2, 0)));
    }

    #[test]
    fn decimal_arithmetic_does_not_drift() {
        let empty = Bindings::new();
        assert_eq!(evaluate("0.1 + 0.2", &empty), Ok(Decimal::new(3, 1)));
        assert_eq!(evaluate("1000.10 * 3", &empty), Ok(Decimal::new(300_030, 2)));
    }

    #[test]
    fn resolves_bound_identifiers_including_dotted_paths() {
        let vars = bindings(&[
            ("rate", Decimal::new(45, 0)),
            ("hours", Decimal::new(160, 0)),
            ("treasury.total_balance", Decimal::new(1_000_000, 0)),
            ("ops-account.balance", Decimal::new(500, 0)),
        ]);
        assert_eq!(evaluate("rate * hours", &vars), Ok(Decimal::new(7200, 0)));
        assert_eq!(
            evaluate("treasury.total_balance * 0.05", &vars),
            Ok(Decimal::new(5_000_000, 2))
        );
        assert_eq!(evaluate("ops-account.balance / 2", &vars), Ok(Decimal::new(250, 0)));
        assert_eq!(evaluate("rate-hours", &vars), Ok(Decimal::new(-115, 0)));
    }

    #[test]
    fn rejects_unknown_identifiers_and_division_by_zero() {
        let vars = bindings(&[("rate", Decimal::ONE)]);
        assert_eq!(
            evaluate("rate * bonus", &vars),
            Err(FormulaError::UnknownIdentifier("bonus".to_string()))
        );
        assert_eq!(evaluate("rate / (1 - 1)", &vars), Err(FormulaError::DivisionByZero));
        assert_eq!(evaluate("rate % 0", &vars), Err(FormulaError::DivisionByZero));
    }

    #[test]
    fn rejects_code_like_syntax() {
        let empty = Bindings::new();
        assert!(matches!(evaluate("max(1, 2)", &empty), Err(FormulaError::FunctionCall { .. })));
        assert!(matches!(
            evaluate("2 ** 3", &empty),
            Err(FormulaError::UnexpectedToken { .. })
        ));
        assert!(matches!(
            evaluate("1; drop", &empty),
            Err(FormulaError::DisallowedSyntax { .. })
        ));
        assert!(matches!(evaluate("a = 1", &empty), Err(FormulaError::DisallowedSyntax { .. })));
        assert_eq!(evaluate("   ", &empty), Err(FormulaError::Empty));
        assert_eq!(evaluate("(1 + 2", &empty), Err(FormulaError::UnexpectedEnd));
    }

    #[test]
    fn deep_nesting_is_bounded() {
        let expression = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(evaluate(&expression, &Bindings::new()), Err(FormulaError::TooDeep));
    }

    #[test]
    fn repeated_evaluation_is_identical() {
        let vars = bindings(&[("salary", Decimal::new(523_333, 2))]);
        let first = evaluate("salary * 0.1 + 12.5", &vars);
        let second = evaluate("salary * 0.1 + 12.5", &vars);
        assert_eq!(first, second);
        assert_eq!(first, Ok(Decimal::new(535_833, 3)));
    }

    #[test]
    fn lists_identifiers_in_order() {
        assert_eq!(
            identifiers("rate * hours + rate").expect("identifiers"),
            vec!["rate".to_string(), "hours".to_string()]
        );
    }
}
