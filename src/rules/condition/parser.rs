//! Recursive-descent parser for rule conditions.

use super::ast::{BinaryOp, Expr, Function, FunctionKind, UnaryOp};
use super::lexer::{tokenize, Token, TokenKind};
use crate::dataset::Value;
use crate::error::ConditionError;

/// Deepest syntax tree a condition may produce.
pub const MAX_DEPTH: usize = 128;

/// Parses condition text into a syntax tree.
///
/// Function names, arities, aggregate arguments and regex patterns are
/// checked here, so a condition that parses is structurally valid
/// regardless of the dataset it later runs against.
pub fn parse(source: &str) -> Result<Expr, ConditionError> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(ConditionError::Syntax {
            offset: 0,
            message: "empty condition".to_string(),
        });
    }
    Parser {
        tokens,
        cursor: 0,
        end: source.len(),
        depth: 0,
    }
    .parse()
}

struct Parser {
    tokens: Vec<Token>,
    cursor: usize,
    end: usize,
    /// Nesting of the node being parsed; bounds recursion here and in the interpreter.
    depth: usize,
}

impl Parser {
    fn parse(mut self) -> Result<Expr, ConditionError> {
        let expr = self.parse_or()?;
        if let Some(token) = self.tokens.get(self.cursor) {
            return Err(self.error_at(token.offset, "unexpected trailing tokens"));
        }
        Ok(expr)
    }

    /// Enters one more level of nesting.
    fn deepen(&mut self) -> Result<(), ConditionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            let offset = self.tokens.get(self.cursor).map_or(self.end, |t| t.offset);
            return Err(self.error_at(
                offset,
                format!("condition nests deeper than {} levels", MAX_DEPTH),
            ));
        }
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Expr, ConditionError> {
        let base = self.depth;
        let mut expr = self.parse_and()?;
        while self.consume(|k| matches!(k, TokenKind::Or)) {
            self.deepen()?;
            let right = self.parse_and()?;
            expr = binary(BinaryOp::Or, expr, right);
        }
        self.depth = base;
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionError> {
        let base = self.depth;
        let mut expr = self.parse_not()?;
        while self.consume(|k| matches!(k, TokenKind::And)) {
            self.deepen()?;
            let right = self.parse_not()?;
            expr = binary(BinaryOp::And, expr, right);
        }
        self.depth = base;
        Ok(expr)
    }

    fn parse_not(&mut self) -> Result<Expr, ConditionError> {
        if self.consume(|k| matches!(k, TokenKind::Not)) {
            self.deepen()?;
            let expr = self.parse_not()?;
            self.depth -= 1;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(expr),
            });
        }
        self.parse_predicate()
    }

    fn parse_predicate(&mut self) -> Result<Expr, ConditionError> {
        let base = self.depth;
        let left = self.parse_additive()?;
        let expr = self.parse_predicate_tail(left);
        self.depth = base;
        expr
    }

    fn parse_predicate_tail(&mut self, left: Expr) -> Result<Expr, ConditionError> {
        if !self.peek_is(|k| {
            matches!(
                k,
                TokenKind::Is
                    | TokenKind::Not
                    | TokenKind::In
                    | TokenKind::Between
                    | TokenKind::Eq
                    | TokenKind::NotEq
                    | TokenKind::Lt
                    | TokenKind::Lte
                    | TokenKind::Gt
                    | TokenKind::Gte
            )
        }) {
            return Ok(left);
        }
        self.deepen()?;

        if self.consume(|k| matches!(k, TokenKind::Is)) {
            let negated = self.consume(|k| matches!(k, TokenKind::Not));
            self.expect(|k| matches!(k, TokenKind::Null), "expected 'null' after 'is'")?;
            return Ok(Expr::IsNull {
                expr: Box::new(left),
                negated,
            });
        }

        if self.peek_is(|k| matches!(k, TokenKind::Not))
            && self.peek_nth_is(1, |k| matches!(k, TokenKind::In))
        {
            self.cursor += 2;
            return self.parse_in_list(left, true);
        }
        if self.consume(|k| matches!(k, TokenKind::In)) {
            return self.parse_in_list(left, false);
        }

        if self.consume(|k| matches!(k, TokenKind::Between)) {
            let low = self.parse_additive()?;
            self.expect(
                |k| matches!(k, TokenKind::And),
                "expected 'and' in between expression",
            )?;
            let high = self.parse_additive()?;
            return Ok(Expr::Between {
                expr: Box::new(left),
                low: Box::new(low),
                high: Box::new(high),
            });
        }

        let op = match self.peek() {
            Some(TokenKind::Eq) => BinaryOp::Eq,
            Some(TokenKind::NotEq) => BinaryOp::NotEq,
            Some(TokenKind::Lt) => BinaryOp::Lt,
            Some(TokenKind::Lte) => BinaryOp::Lte,
            Some(TokenKind::Gt) => BinaryOp::Gt,
            Some(TokenKind::Gte) => BinaryOp::Gte,
            _ => return Ok(left),
        };
        self.cursor += 1;
        let right = self.parse_additive()?;
        Ok(binary(op, left, right))
    }

    fn parse_in_list(&mut self, expr: Expr, negated: bool) -> Result<Expr, ConditionError> {
        let close_bracket = if self.consume(|k| matches!(k, TokenKind::LParen)) {
            false
        } else if self.consume(|k| matches!(k, TokenKind::LBracket)) {
            true
        } else {
            return Err(self.error_here("expected '(' after 'in'"));
        };

        let mut list = Vec::new();
        loop {
            list.push(self.parse_additive()?);
            if self.consume(|k| matches!(k, TokenKind::Comma)) {
                continue;
            }
            let closed = if close_bracket {
                self.consume(|k| matches!(k, TokenKind::RBracket))
            } else {
                self.consume(|k| matches!(k, TokenKind::RParen))
            };
            if closed {
                break;
            }
            return Err(self.error_here("expected ',' or closing bracket in list"));
        }

        Ok(Expr::InList {
            expr: Box::new(expr),
            list,
            negated,
        })
    }

    fn parse_additive(&mut self) -> Result<Expr, ConditionError> {
        let base = self.depth;
        let mut expr = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::Plus) => BinaryOp::Add,
                Some(TokenKind::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.cursor += 1;
            self.deepen()?;
            let right = self.parse_term()?;
            expr = binary(op, expr, right);
        }
        self.depth = base;
        Ok(expr)
    }

    fn parse_term(&mut self) -> Result<Expr, ConditionError> {
        let base = self.depth;
        let mut expr = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::Star) => BinaryOp::Mul,
                Some(TokenKind::Slash) => BinaryOp::Div,
                Some(TokenKind::Percent) => BinaryOp::Mod,
                _ => break,
            };
            self.cursor += 1;
            self.deepen()?;
            let right = self.parse_unary()?;
            expr = binary(op, expr, right);
        }
        self.depth = base;
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<Expr, ConditionError> {
        if self.consume(|k| matches!(k, TokenKind::Minus)) {
            self.deepen()?;
            let expr = self.parse_unary()?;
            self.depth -= 1;
            // Fold negative numeric literals so `-5` prints and compares as a literal.
            return Ok(match expr {
                Expr::Literal(Value::Int(i)) => Expr::Literal(Value::Int(-i)),
                Expr::Literal(Value::Float(f)) => Expr::Literal(Value::Float(-f)),
                other => Expr::Unary {
                    op: UnaryOp::Neg,
                    expr: Box::new(other),
                },
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ConditionError> {
        if self.consume(|k| matches!(k, TokenKind::LParen)) {
            self.deepen()?;
            let expr = self.parse_or()?;
            self.depth -= 1;
            self.expect(|k| matches!(k, TokenKind::RParen), "missing closing ')'")?;
            return Ok(expr);
        }

        let Some(token) = self.tokens.get(self.cursor).cloned() else {
            return Err(self.error_at(self.end, "unexpected end of condition"));
        };
        self.cursor += 1;

        match token.kind {
            TokenKind::Number(raw) => parse_number(&raw)
                .map(Expr::Literal)
                .ok_or_else(|| self.error_at(token.offset, format!("invalid number '{}'", raw))),
            TokenKind::Str(s) => Ok(Expr::Literal(Value::Str(s))),
            TokenKind::True => Ok(Expr::Literal(Value::Bool(true))),
            TokenKind::False => Ok(Expr::Literal(Value::Bool(false))),
            TokenKind::Null => Ok(Expr::Literal(Value::Null)),
            TokenKind::QuotedIdentifier(name) => Ok(Expr::Column(name)),
            TokenKind::Identifier(name) => {
                if self.consume(|k| matches!(k, TokenKind::LParen)) {
                    return self.parse_call(&name, token.offset);
                }
                if self.peek_is(|k| matches!(k, TokenKind::LBracket)) {
                    return self.parse_subscript(token.offset);
                }
                Ok(Expr::Column(name))
            }
            _ => Err(self.error_at(token.offset, "expected a value, column or function")),
        }
    }

    /// `df['column']` is accepted as a column reference.
    fn parse_subscript(&mut self, offset: usize) -> Result<Expr, ConditionError> {
        self.cursor += 1;
        let name = match self.tokens.get(self.cursor).map(|t| &t.kind) {
            Some(TokenKind::Str(name)) => name.clone(),
            _ => return Err(self.error_at(offset, "expected a quoted column name inside '[ ]'")),
        };
        self.cursor += 1;
        self.expect(|k| matches!(k, TokenKind::RBracket), "missing closing ']'")?;
        Ok(Expr::Column(name))
    }

    fn parse_call(&mut self, name: &str, offset: usize) -> Result<Expr, ConditionError> {
        let function =
            Function::lookup(name).ok_or_else(|| ConditionError::UnknownFunction(name.to_string()))?;

        let mut args = Vec::new();
        if !self.consume(|k| matches!(k, TokenKind::RParen)) {
            self.deepen()?;
            loop {
                args.push(self.parse_or()?);
                if self.consume(|k| matches!(k, TokenKind::Comma)) {
                    continue;
                }
                if self.consume(|k| matches!(k, TokenKind::RParen)) {
                    break;
                }
                return Err(self.error_here("expected ',' or ')' in function call"));
            }
            self.depth -= 1;
        }

        let (min, max) = function.arity();
        if args.len() < min || max.is_some_and(|m| args.len() > m) {
            return Err(ConditionError::Arity {
                name: function.name().to_string(),
                expected: function.arity_text(),
                actual: args.len(),
            });
        }

        let needs_column = function.kind() == FunctionKind::Aggregate || function == Function::IsUnique;
        if needs_column && args.iter().any(|a| !matches!(a, Expr::Column(_))) {
            return Err(self.error_at(
                offset,
                format!("{}() takes a column name", function.name()),
            ));
        }

        if function == Function::Matches {
            match &args[1] {
                Expr::Literal(Value::Str(pattern)) => {
                    regex::Regex::new(pattern).map_err(|e| {
                        self.error_at(offset, format!("invalid regex pattern: {}", e))
                    })?;
                }
                _ => {
                    return Err(self.error_at(offset, "matches() pattern must be a string literal"))
                }
            }
        }

        Ok(Expr::Call { function, args })
    }

    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.cursor).map(|t| &t.kind)
    }

    fn peek_is(&self, predicate: impl FnOnce(&TokenKind) -> bool) -> bool {
        self.peek().is_some_and(predicate)
    }

    fn peek_nth_is(&self, n: usize, predicate: impl FnOnce(&TokenKind) -> bool) -> bool {
        self.tokens
            .get(self.cursor + n)
            .is_some_and(|t| predicate(&t.kind))
    }

    fn consume(&mut self, predicate: impl FnOnce(&TokenKind) -> bool) -> bool {
        if self.peek_is(predicate) {
            self.cursor += 1;
            return true;
        }
        false
    }

    fn expect(
        &mut self,
        predicate: impl FnOnce(&TokenKind) -> bool,
        message: &str,
    ) -> Result<(), ConditionError> {
        if self.consume(predicate) {
            Ok(())
        } else {
            Err(self.error_here(message))
        }
    }

    fn error_here(&self, message: impl Into<String>) -> ConditionError {
        let offset = self
            .tokens
            .get(self.cursor)
            .map(|t| t.offset)
            .unwrap_or(self.end);
        self.error_at(offset, message)
    }

    fn error_at(&self, offset: usize, message: impl Into<String>) -> ConditionError {
        ConditionError::Syntax {
            offset,
            message: message.into(),
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

fn parse_number(raw: &str) -> Option<Value> {
    if let Ok(i) = raw.parse::<i64>() {
        return Some(Value::Int(i));
    }
    raw.parse::<f64>().ok().map(Value::Float)
}
