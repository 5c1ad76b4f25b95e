//! Conditional evaluator (§4.H): a small boolean expression language over the
//! variable map, used for a step's `if` predicate.
//!
//! Grammar (lowest to highest precedence):
//!
//! ```text
//! or_expr    := and_expr ('||' and_expr)*
//! and_expr   := unary ('&&' unary)*
//! unary      := '!' unary | comparison
//! comparison := operand (cmp_op operand)?
//! cmp_op     := '==' | '!=' | '<=' | '>=' | '<' | '>'
//! operand    := '(' or_expr ')' | literal | path
//! literal    := 'true' | 'false' | 'null' | number | '"' ... '"'
//! path       := dotted/bracketed identifier, resolved against the variable map
//! ```
//!
//! A missing `steps.X` reference (e.g. referring to a step skipped earlier)
//! resolves as an unresolved path and becomes a permanent step error, per the
//! documented resolution of the spec's open question on that behavior. A
//! well-formed expression that doesn't ultimately evaluate to a boolean is
//! also a permanent step error.

use cadence_kernel::{resolve_path, KernelError, Value};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    OrOr,
    AndAnd,
    Bang,
    Eq,
    Ne,
    Le,
    Ge,
    Lt,
    Gt,
    LParen,
    RParen,
    True,
    False,
    Null,
    Number(f64),
    Str(String),
    Path(String),
}

fn tokenize(input: &str) -> Result<Vec<Token>, KernelError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Bang);
                    i += 1;
                }
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::AndAnd);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::OrOr);
                i += 2;
            }
            '"' => {
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != '"' {
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(KernelError::Validation(format!(
                        "unterminated string literal in predicate `{input}`"
                    )));
                }
                i += 1;
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text.parse().map_err(|_| {
                    KernelError::Validation(format!("bad number literal `{text}` in predicate"))
                })?;
                tokens.push(Token::Number(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.' || chars[i] == '[' || chars[i] == ']')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                match text.as_str() {
                    "true" => tokens.push(Token::True),
                    "false" => tokens.push(Token::False),
                    "null" => tokens.push(Token::Null),
                    _ => tokens.push(Token::Path(text)),
                }
            }
            other => {
                return Err(KernelError::Validation(format!(
                    "unexpected character `{other}` in predicate `{input}`"
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    vars: &'a Value,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        self.pos += 1;
        t
    }

    fn or_expr(&mut self) -> Result<Value, KernelError> {
        let mut left = self.and_expr()?;
        while matches!(self.peek(), Some(Token::OrOr)) {
            self.advance();
            let right = self.and_expr()?;
            left = Value::Bool(as_bool(&left)? || as_bool(&right)?);
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Value, KernelError> {
        let mut left = self.unary()?;
        while matches!(self.peek(), Some(Token::AndAnd)) {
            self.advance();
            let right = self.unary()?;
            left = Value::Bool(as_bool(&left)? && as_bool(&right)?);
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Value, KernelError> {
        if matches!(self.peek(), Some(Token::Bang)) {
            self.advance();
            let inner = self.unary()?;
            return Ok(Value::Bool(!as_bool(&inner)?));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Value, KernelError> {
        let left = self.operand()?;
        let op = match self.peek() {
            Some(Token::Eq) => Some(Token::Eq),
            Some(Token::Ne) => Some(Token::Ne),
            Some(Token::Le) => Some(Token::Le),
            Some(Token::Ge) => Some(Token::Ge),
            Some(Token::Lt) => Some(Token::Lt),
            Some(Token::Gt) => Some(Token::Gt),
            _ => None,
        };
        let Some(op) = op else {
            return Ok(left);
        };
        self.advance();
        let right = self.operand()?;
        let result = match op {
            Token::Eq => values_equal(&left, &right),
            Token::Ne => !values_equal(&left, &right),
            Token::Le | Token::Ge | Token::Lt | Token::Gt => {
                let (a, b) = (as_number(&left)?, as_number(&right)?);
                match op {
                    Token::Le => a <= b,
                    Token::Ge => a >= b,
                    Token::Lt => a < b,
                    Token::Gt => a > b,
                    _ => unreachable!(),
                }
            }
            _ => unreachable!(),
        };
        Ok(Value::Bool(result))
    }

    fn operand(&mut self) -> Result<Value, KernelError> {
        match self.advance() {
            Some(Token::LParen) => {
                let inner = self.or_expr()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(KernelError::Validation("unbalanced parentheses in predicate".into())),
                }
            }
            Some(Token::True) => Ok(Value::Bool(true)),
            Some(Token::False) => Ok(Value::Bool(false)),
            Some(Token::Null) => Ok(Value::Null),
            Some(Token::Number(n)) => Ok(serde_json::json!(*n)),
            Some(Token::Str(s)) => Ok(Value::String(s.clone())),
            Some(Token::Path(p)) => resolve_path(self.vars, p).cloned(),
            other => Err(KernelError::Validation(format!(
                "unexpected token in predicate: {other:?}"
            ))),
        }
    }
}

fn as_bool(value: &Value) -> Result<bool, KernelError> {
    value
        .as_bool()
        .ok_or_else(|| KernelError::Validation(format!("predicate operand `{value}` is not boolean")))
}

fn as_number(value: &Value) -> Result<f64, KernelError> {
    value
        .as_f64()
        .ok_or_else(|| KernelError::Validation(format!("predicate operand `{value}` is not numeric")))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    a == b
}

/// Evaluates `predicate` against `vars`. Errors (malformed syntax, unresolved
/// path, non-boolean result) are all permanent step errors per §4.J/§4.H.
pub fn evaluate(predicate: &str, vars: &Value) -> Result<bool, KernelError> {
    let tokens = tokenize(predicate)?;
    if tokens.is_empty() {
        return Err(KernelError::Validation("empty predicate".into()));
    }
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        vars,
    };
    let result = parser.or_expr()?;
    if parser.pos != tokens.len() {
        return Err(KernelError::Validation(format!(
            "trailing tokens in predicate `{predicate}`"
        )));
    }
    as_bool(&result)
}
