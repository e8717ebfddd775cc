//! Arithmetic expressions of equation nodes.
//!
//! Supports `+ - * /`, `^` (right associative), unary minus, parentheses and
//! the functions `abs sqrt log exp pow min max`. Variables are collected in
//! order of first occurrence and bound positionally at evaluation time.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct ExprError(String);

#[derive(Debug, Clone)]
enum Expr {
    Number(f64),
    Var(usize),
    Neg(Box<Expr>),
    BinOp(BinOp, Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
}

#[derive(Debug, Clone, Copy)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, Copy)]
enum Func {
    Abs,
    Sqrt,
    Log,
    Exp,
    Pow,
    Min,
    Max,
}

impl Func {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "abs" => Func::Abs,
            "sqrt" => Func::Sqrt,
            "log" => Func::Log,
            "exp" => Func::Exp,
            "pow" => Func::Pow,
            "min" => Func::Min,
            "max" => Func::Max,
            _ => return None,
        })
    }

    fn arity(&self) -> usize {
        match self {
            Func::Abs | Func::Sqrt | Func::Log | Func::Exp => 1,
            Func::Pow | Func::Min | Func::Max => 2,
        }
    }
}

/// A parsed expression ready for repeated evaluation.
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    ast: Expr,
    variables: Vec<String>,
}

impl CompiledExpr {
    pub fn compile(input: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(ExprError("empty expression".to_string()));
        }
        let mut parser = Parser::new(&tokens);
        let ast = parser.parse_add()?;
        if let Some(tok) = parser.peek() {
            return Err(ExprError(format!(
                "unexpected token after expression: {:?}",
                tok
            )));
        }
        let variables = std::mem::take(&mut parser.variables);
        Ok(CompiledExpr { ast, variables })
    }

    /// Names referenced by the expression, in order of first occurrence.
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    /// Evaluate with `values` bound to [`Self::variables`] by position.
    pub fn eval(&self, values: &[f64]) -> f64 {
        assert_eq!(values.len(), self.variables.len());
        eval_expr(&self.ast, values)
    }
}

fn eval_expr(e: &Expr, vals: &[f64]) -> f64 {
    match e {
        Expr::Number(n) => *n,
        Expr::Var(i) => vals[*i],
        Expr::Neg(a) => -eval_expr(a, vals),
        Expr::BinOp(op, a, b) => {
            let lhs = eval_expr(a, vals);
            let rhs = eval_expr(b, vals);
            match op {
                BinOp::Add => lhs + rhs,
                BinOp::Sub => lhs - rhs,
                BinOp::Mul => lhs * rhs,
                BinOp::Div => lhs / rhs,
                BinOp::Pow => lhs.powf(rhs),
            }
        }
        Expr::Call(f, args) => {
            let a0 = || eval_expr(&args[0], vals);
            let a1 = || eval_expr(&args[1], vals);
            match f {
                Func::Abs => a0().abs(),
                Func::Sqrt => a0().sqrt(),
                Func::Log => a0().ln(),
                Func::Exp => a0().exp(),
                Func::Pow => a0().powf(a1()),
                Func::Min => a0().min(a1()),
                Func::Max => a0().max(a1()),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let single = match c {
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '*' => Some(Token::Star),
            '/' => Some(Token::Slash),
            '^' => Some(Token::Caret),
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            ',' => Some(Token::Comma),
            _ => None,
        };
        if let Some(tok) = single {
            tokens.push(tok);
            i += 1;
            continue;
        }

        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() || c == '.' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_ascii_digit()
                    || chars[i] == '.'
                    || chars[i] == 'e'
                    || chars[i] == 'E'
                    || ((chars[i] == '+' || chars[i] == '-')
                        && i > start
                        && (chars[i - 1] == 'e' || chars[i - 1] == 'E')))
            {
                i += 1;
            }
            let s: String = chars[start..i].iter().collect();
            let n: f64 = s
                .parse()
                .map_err(|_| ExprError(format!("invalid number: '{}'", s)))?;
            tokens.push(Token::Num(n));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
            {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else {
            return Err(ExprError(format!("unexpected character: '{}'", c)));
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    variables: Vec<String>,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Self {
            tokens,
            pos: 0,
            variables: Vec::new(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, expected: &Token) -> Result<(), ExprError> {
        match self.advance() {
            Some(t) if t == expected => Ok(()),
            other => Err(ExprError(format!(
                "expected {:?}, got {:?}",
                expected, other
            ))),
        }
    }

    fn resolve_var(&mut self, name: &str) -> usize {
        if let Some(i) = self.variables.iter().position(|v| v == name) {
            i
        } else {
            self.variables.push(name.to_string());
            self.variables.len() - 1
        }
    }

    fn parse_add(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_mul()?;
            lhs = Expr::BinOp(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_mul(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::BinOp(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if matches!(self.peek(), Some(Token::Minus)) {
            self.advance();
            let e = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(e)));
        }
        self.parse_pow()
    }

    // -x^2 parses as -(x^2)
    fn parse_pow(&mut self) -> Result<Expr, ExprError> {
        let base = self.parse_atom()?;
        if matches!(self.peek(), Some(Token::Caret)) {
            self.advance();
            let exponent = self.parse_unary()?;
            return Ok(Expr::BinOp(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_atom(&mut self) -> Result<Expr, ExprError> {
        match self.advance().cloned() {
            Some(Token::Num(n)) => Ok(Expr::Number(n)),
            Some(Token::LParen) => {
                let e = self.parse_add()?;
                self.expect(&Token::RParen)?;
                Ok(e)
            }
            Some(Token::Ident(name)) => {
                if !matches!(self.peek(), Some(Token::LParen)) {
                    return Ok(Expr::Var(self.resolve_var(&name)));
                }
                self.advance();
                let func = Func::from_name(&name)
                    .ok_or_else(|| ExprError(format!("unknown function: '{}'", name)))?;
                let mut args = vec![self.parse_add()?];
                while matches!(self.peek(), Some(Token::Comma)) {
                    self.advance();
                    args.push(self.parse_add()?);
                }
                self.expect(&Token::RParen)?;
                if args.len() != func.arity() {
                    return Err(ExprError(format!(
                        "function '{}' takes {} arguments, got {}",
                        name,
                        func.arity(),
                        args.len()
                    )));
                }
                Ok(Expr::Call(func, args))
            }
            other => Err(ExprError(format!(
                "expected number, identifier, or '(', got {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn arithmetic_precedence() {
        let e = CompiledExpr::compile("2 + 3 * 4 - 6 / 2").unwrap();
        assert!(e.variables().is_empty());
        assert_relative_eq!(e.eval(&[]), 11.0);
    }

    #[test]
    fn variables_in_first_occurrence_order() {
        let e = CompiledExpr::compile("CL_pop * (WT / 70) ^ 0.75 + CL_pop").unwrap();
        assert_eq!(e.variables(), ["CL_pop", "WT"]);
        assert_relative_eq!(e.eval(&[2.0, 70.0]), 4.0);
    }

    #[test]
    fn power_is_right_associative_and_binds_tighter_than_minus() {
        let e = CompiledExpr::compile("2 ^ 3 ^ 2").unwrap();
        assert_relative_eq!(e.eval(&[]), 512.0);
        let e = CompiledExpr::compile("-x ^ 2").unwrap();
        assert_relative_eq!(e.eval(&[3.0]), -9.0);
    }

    #[test]
    fn functions() {
        let e = CompiledExpr::compile("exp(log(x)) + max(a, b) + sqrt(16)").unwrap();
        assert_eq!(e.variables(), ["x", "a", "b"]);
        assert_relative_eq!(e.eval(&[2.5, 1.0, 3.0]), 9.5, epsilon = 1e-12);
    }

    #[test]
    fn dotted_identifiers_are_single_variables() {
        let e = CompiledExpr::compile("central.V * 2").unwrap();
        assert_eq!(e.variables(), ["central.V"]);
    }

    #[test]
    fn scientific_notation() {
        let e = CompiledExpr::compile("1.5e2 + 3.0E-1").unwrap();
        assert_relative_eq!(e.eval(&[]), 150.3, epsilon = 1e-10);
    }

    #[test]
    fn malformed_input_is_an_error() {
        assert!(CompiledExpr::compile("").is_err());
        assert!(CompiledExpr::compile("1 +").is_err());
        assert!(CompiledExpr::compile("(a + b").is_err());
        assert!(CompiledExpr::compile("a $ b").is_err());
        assert!(CompiledExpr::compile("foo(1)").is_err());
        assert!(CompiledExpr::compile("pow(1)").is_err());
        assert!(CompiledExpr::compile("a b").is_err());
    }
}
