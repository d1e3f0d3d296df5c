use anyhow::Result;
use serde_json::Value;

use crate::error::EngineError;
use crate::eval::MAX_DEPTH;
use crate::eval::ast::{BinOp, Expr, UnaryOp};
use crate::eval::lexer::Token;

/// Recursive-descent parser over the restricted grammar. Precedence,
/// lowest first: ternary, `||`, `&&`, equality, relational, additive,
/// multiplicative, unary, postfix (member/call), primary.
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    pub fn parse(mut self) -> Result<Expr> {
        let expr = self.ternary(0)?;
        if self.pos < self.tokens.len() {
            return Err(EngineError::Config(format!(
                "unexpected token after expression: {:?}",
                self.tokens[self.pos]
            ))
            .into());
        }
        Ok(expr)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, expected: &Token) -> Result<()> {
        match self.advance() {
            Some(ref t) if t == expected => Ok(()),
            other => Err(EngineError::Config(format!(
                "expected {:?}, found {:?}",
                expected, other
            ))
            .into()),
        }
    }

    fn guard_depth(&self, depth: usize) -> Result<()> {
        if depth >= MAX_DEPTH {
            return Err(
                EngineError::Guard(format!("expression nesting exceeds {}", MAX_DEPTH)).into(),
            );
        }
        Ok(())
    }

    fn ternary(&mut self, depth: usize) -> Result<Expr> {
        self.guard_depth(depth)?;
        let cond = self.or(depth + 1)?;
        if self.peek() == Some(&Token::Question) {
            self.advance();
            let then = self.ternary(depth + 1)?;
            self.expect(&Token::Colon)?;
            let alt = self.ternary(depth + 1)?;
            return Ok(Expr::Ternary(Box::new(cond), Box::new(then), Box::new(alt)));
        }
        Ok(cond)
    }

    fn or(&mut self, depth: usize) -> Result<Expr> {
        self.guard_depth(depth)?;
        let mut left = self.and(depth + 1)?;
        while self.peek() == Some(&Token::OrOr) {
            self.advance();
            let right = self.and(depth + 1)?;
            left = Expr::Binary(BinOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self, depth: usize) -> Result<Expr> {
        self.guard_depth(depth)?;
        let mut left = self.equality(depth + 1)?;
        while self.peek() == Some(&Token::AndAnd) {
            self.advance();
            let right = self.equality(depth + 1)?;
            left = Expr::Binary(BinOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn equality(&mut self, depth: usize) -> Result<Expr> {
        self.guard_depth(depth)?;
        let mut left = self.relational(depth + 1)?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinOp::Eq,
                Some(Token::NotEq) => BinOp::Ne,
                _ => break,
            };
            self.advance();
            let right = self.relational(depth + 1)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn relational(&mut self, depth: usize) -> Result<Expr> {
        self.guard_depth(depth)?;
        let mut left = self.additive(depth + 1)?;
        loop {
            let op = match self.peek() {
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                _ => break,
            };
            self.advance();
            let right = self.additive(depth + 1)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn additive(&mut self, depth: usize) -> Result<Expr> {
        self.guard_depth(depth)?;
        let mut left = self.multiplicative(depth + 1)?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.multiplicative(depth + 1)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn multiplicative(&mut self, depth: usize) -> Result<Expr> {
        self.guard_depth(depth)?;
        let mut left = self.unary(depth + 1)?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => break,
            };
            self.advance();
            let right = self.unary(depth + 1)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self, depth: usize) -> Result<Expr> {
        self.guard_depth(depth)?;
        match self.peek() {
            Some(Token::Bang) => {
                self.advance();
                let operand = self.unary(depth + 1)?;
                Ok(Expr::Unary(UnaryOp::Not, Box::new(operand)))
            }
            Some(Token::Minus) => {
                self.advance();
                let operand = self.unary(depth + 1)?;
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(operand)))
            }
            _ => self.postfix(depth + 1),
        }
    }

    fn postfix(&mut self, depth: usize) -> Result<Expr> {
        self.guard_depth(depth)?;
        let mut expr = self.primary(depth + 1)?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    match self.advance() {
                        Some(Token::Ident(name)) => {
                            expr = Expr::Member(Box::new(expr), name);
                        }
                        other => {
                            return Err(EngineError::Config(format!(
                                "expected property name after '.', found {:?}",
                                other
                            ))
                            .into());
                        }
                    }
                }
                Some(Token::LParen) => {
                    self.advance();
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.ternary(depth + 1)?);
                            if self.peek() == Some(&Token::Comma) {
                                self.advance();
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(&Token::RParen)?;
                    expr = Expr::Call(Box::new(expr), args);
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn primary(&mut self, depth: usize) -> Result<Expr> {
        self.guard_depth(depth)?;
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Literal(number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ => Ok(Expr::Ident(name)),
            },
            Some(Token::LParen) => {
                let inner = self.ternary(depth + 1)?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            other => {
                Err(EngineError::Config(format!("unexpected token: {:?}", other)).into())
            }
        }
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        Value::Number((n as i64).into())
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::lexer::tokenize;
    use serde_json::json;

    fn parse(src: &str) -> Result<Expr> {
        Parser::new(tokenize(src)?).parse()
    }

    #[test]
    fn parses_precedence() {
        let expr = parse("1 + 2 * 3 > 6 && true").unwrap();
        // ((1 + (2 * 3)) > 6) && true
        match expr {
            Expr::Binary(BinOp::And, left, right) => {
                assert!(matches!(*left, Expr::Binary(BinOp::Gt, _, _)));
                assert_eq!(*right, Expr::Literal(json!(true)));
            }
            other => panic!("unexpected tree: {:?}", other),
        }
    }

    #[test]
    fn parses_ternary_and_member_call() {
        let expr = parse("Math.abs(x) > 1 ? 'big' : 'small'").unwrap();
        assert!(matches!(expr, Expr::Ternary(_, _, _)));
    }

    #[test]
    fn rejects_trailing_tokens() {
        assert!(parse("1 2").is_err());
    }

    #[test]
    fn rejects_deep_nesting() {
        let src = format!("{}1{}", "(".repeat(200), ")".repeat(200));
        assert!(parse(&src).is_err());
    }
}
