//! Calculator 工具：受限算术表达式求值
//!
//! 只接受数字、`+ - * / ^`（`**` 视为 `^`）、括号、白名单函数与常量 pi / e；
//! 其它任何字符或标识符都会被拒绝，从不执行任意代码。递归下降解析，`^` 右结合。

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::tools::{Tool, ToolSpec};

const MAX_EXPRESSION_CHARS: usize = 500;
const MAX_DEPTH: usize = 64;

/// 白名单函数：名称与允许的参数个数
const FUNCTIONS: &[(&str, usize, usize)] = &[
    ("sqrt", 1, 1),
    ("sin", 1, 1),
    ("cos", 1, 1),
    ("tan", 1, 1),
    ("log", 1, 2),
    ("log10", 1, 1),
    ("exp", 1, 1),
    ("abs", 1, 1),
    ("round", 1, 2),
    ("pow", 2, 2),
];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalcError {
    #[error("empty expression")]
    Empty,
    #[error("expression too long (max 500 chars)")]
    TooLong,
    #[error("unexpected character '{0}'")]
    UnexpectedChar(char),
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    #[error("unknown identifier '{0}' (allowed: sqrt, sin, cos, tan, log, log10, exp, abs, round, pow, pi, e)")]
    UnknownIdentifier(String),
    #[error("function {name} takes {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: String,
        got: usize,
    },
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unexpected token {0}")]
    UnexpectedToken(String),
    #[error("expression nested too deeply")]
    TooDeep,
    #[error("division by zero")]
    DivisionByZero,
    #[error("math domain error in {0}")]
    Domain(String),
    #[error("result is not a finite number")]
    NonFinite,
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

fn tokenize(input: &str) -> Result<Vec<Token>, CalcError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // 科学计数法：1e3、2.5E-4
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        while j < chars.len() && chars[j].is_ascii_digit() {
                            j += 1;
                        }
                        i = j;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| CalcError::InvalidNumber(text.clone()))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_ascii_alphabetic() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect::<String>().to_lowercase()));
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    tokens.push(Token::Caret);
                    i += 2;
                } else {
                    tokens.push(Token::Star);
                    i += 1;
                }
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '^' => {
                tokens.push(Token::Caret);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            other => return Err(CalcError::UnexpectedChar(other)),
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
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, want: Token) -> Result<(), CalcError> {
        match self.next() {
            Some(t) if t == want => Ok(()),
            Some(t) => Err(CalcError::UnexpectedToken(format!("{t:?}"))),
            None => Err(CalcError::UnexpectedEnd),
        }
    }

    fn expr(&mut self) -> Result<f64, CalcError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(CalcError::TooDeep);
        }
        let mut value = self.term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    value += self.term()?;
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    value -= self.term()?;
                }
                _ => break,
            }
        }
        self.depth -= 1;
        Ok(value)
    }

    fn term(&mut self) -> Result<f64, CalcError> {
        let mut value = self.unary()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.pos += 1;
                    value *= self.unary()?;
                }
                Some(Token::Slash) => {
                    self.pos += 1;
                    let rhs = self.unary()?;
                    if rhs == 0.0 {
                        return Err(CalcError::DivisionByZero);
                    }
                    value /= rhs;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn unary(&mut self) -> Result<f64, CalcError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                self.enter()?;
                let v = self.unary()?;
                self.depth -= 1;
                Ok(-v)
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    fn enter(&mut self) -> Result<(), CalcError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            Err(CalcError::TooDeep)
        } else {
            Ok(())
        }
    }

    fn power(&mut self) -> Result<f64, CalcError> {
        let base = self.primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.pos += 1;
            self.enter()?;
            let exp = self.unary()?;
            self.depth -= 1;
            return Ok(base.powf(exp));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<f64, CalcError> {
        match self.next() {
            Some(Token::Num(n)) => Ok(n),
            Some(Token::LParen) => {
                let v = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(v)
            }
            Some(Token::Ident(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.pos += 1;
                    let args = self.call_args()?;
                    apply_function(&name, &args)
                } else {
                    match name.as_str() {
                        "pi" => Ok(std::f64::consts::PI),
                        "e" => Ok(std::f64::consts::E),
                        _ => Err(CalcError::UnknownIdentifier(name)),
                    }
                }
            }
            Some(t) => Err(CalcError::UnexpectedToken(format!("{t:?}"))),
            None => Err(CalcError::UnexpectedEnd),
        }
    }

    fn call_args(&mut self) -> Result<Vec<f64>, CalcError> {
        let mut args = Vec::new();
        if let Some(Token::RParen) = self.peek() {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                Some(t) => return Err(CalcError::UnexpectedToken(format!("{t:?}"))),
                None => return Err(CalcError::UnexpectedEnd),
            }
        }
    }
}

fn apply_function(name: &str, args: &[f64]) -> Result<f64, CalcError> {
    let (_, min, max) = FUNCTIONS
        .iter()
        .find(|(n, _, _)| *n == name)
        .ok_or_else(|| CalcError::UnknownIdentifier(name.to_string()))?;
    if args.len() < *min || args.len() > *max {
        let expected = if min == max {
            min.to_string()
        } else {
            format!("{min}-{max}")
        };
        return Err(CalcError::Arity {
            name: name.to_string(),
            expected,
            got: args.len(),
        });
    }
    let x = args[0];
    let domain = || CalcError::Domain(name.to_string());
    let v = match name {
        "sqrt" if x < 0.0 => return Err(domain()),
        "sqrt" => x.sqrt(),
        "sin" => x.sin(),
        "cos" => x.cos(),
        "tan" => x.tan(),
        "log" => {
            if x <= 0.0 {
                return Err(domain());
            }
            match args.get(1) {
                Some(&base) if base <= 0.0 || base == 1.0 => return Err(domain()),
                Some(&base) => x.ln() / base.ln(),
                None => x.ln(),
            }
        }
        "log10" if x <= 0.0 => return Err(domain()),
        "log10" => x.log10(),
        "exp" => x.exp(),
        "abs" => x.abs(),
        "round" => {
            let digits = args.get(1).copied().unwrap_or(0.0).trunc();
            let factor = 10f64.powf(digits);
            (x * factor).round() / factor
        }
        "pow" => x.powf(args[1]),
        _ => return Err(CalcError::UnknownIdentifier(name.to_string())),
    };
    Ok(v)
}

/// 求值受限表达式
pub fn evaluate(expression: &str) -> Result<f64, CalcError> {
    let expression = expression.trim();
    if expression.is_empty() {
        return Err(CalcError::Empty);
    }
    if expression.chars().count() > MAX_EXPRESSION_CHARS {
        return Err(CalcError::TooLong);
    }
    let tokens = tokenize(expression)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let value = parser.expr()?;
    if let Some(t) = parser.peek() {
        return Err(CalcError::UnexpectedToken(format!("{t:?}")));
    }
    if !value.is_finite() {
        return Err(CalcError::NonFinite);
    }
    Ok(value)
}

/// 整数结果不带小数点；其它保留至多 10 位小数并去掉尾随 0
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        return format!("{}", value as i64);
    }
    let s = format!("{value:.10}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s == "-0" {
        "0".to_string()
    } else {
        s.to_string()
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct CalculatorArgs {
    /// Mathematical expression to evaluate (e.g., '2 + 2', 'sqrt(16)', '10 ^ 2', 'sin(pi / 2)')
    expression: String,
}

/// Calculator 工具
#[derive(Debug, Default)]
pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::from_args::<CalculatorArgs>(
            "calculator",
            "Evaluate mathematical expressions. Supports + - * / ^, parentheses, \
             and the functions sqrt, sin, cos, tan, log, log10, exp, abs, round, pow \
             plus the constants pi and e.",
        )
        .unwrap_or_else(|_| ToolSpec::new("calculator", "Evaluate mathematical expressions."))
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: CalculatorArgs = serde_json::from_value(args).map_err(|e| e.to_string())?;
        evaluate(&args.expression)
            .map(format_number)
            .map_err(|e| format!("Calculation error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sqrt_plus_power() {
        assert_eq!(evaluate("sqrt(144) + 10^2").unwrap(), 112.0);
        assert_eq!(format_number(evaluate("sqrt(144) + 10^2").unwrap()), "112");
    }

    #[test]
    fn test_precedence_and_associativity() {
        assert_eq!(evaluate("2 + 3 * 4").unwrap(), 14.0);
        assert_eq!(evaluate("(2 + 3) * 4").unwrap(), 20.0);
        assert_eq!(evaluate("2 ^ 3 ^ 2").unwrap(), 512.0);
        assert_eq!(evaluate("-2 ^ 2").unwrap(), -4.0);
        assert_eq!(evaluate("2 ** 10").unwrap(), 1024.0);
        assert_eq!(evaluate("1e3 / 4").unwrap(), 250.0);
    }

    #[test]
    fn test_functions_and_constants() {
        assert!((evaluate("sin(pi / 2)").unwrap() - 1.0).abs() < 1e-12);
        assert_eq!(evaluate("log10(1000)").unwrap(), 3.0);
        assert!((evaluate("log(8, 2)").unwrap() - 3.0).abs() < 1e-12);
        assert_eq!(evaluate("round(2.346, 2)").unwrap(), 2.35);
        assert_eq!(evaluate("pow(2, 5) + abs(-1)").unwrap(), 33.0);
    }

    #[test]
    fn test_rejects_tokens_outside_whitelist() {
        assert!(matches!(
            evaluate("__import__('os')"),
            Err(CalcError::UnexpectedChar('_'))
        ));
        assert!(matches!(
            evaluate("system(1)"),
            Err(CalcError::UnknownIdentifier(name)) if name == "system"
        ));
        assert!(matches!(evaluate("2; 3"), Err(CalcError::UnexpectedChar(';'))));
    }

    #[test]
    fn test_errors() {
        assert_eq!(evaluate("1 / 0"), Err(CalcError::DivisionByZero));
        assert!(matches!(evaluate("sqrt(-1)"), Err(CalcError::Domain(_))));
        assert!(matches!(evaluate("(1 + 2"), Err(CalcError::UnexpectedEnd)));
        assert!(matches!(evaluate("pow(2)"), Err(CalcError::Arity { .. })));
        assert_eq!(evaluate("   "), Err(CalcError::Empty));
        assert_eq!(evaluate("10 ^ 400"), Err(CalcError::NonFinite));
        let deep = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(evaluate(&deep), Err(CalcError::TooDeep));
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0.1 + 0.2), "0.3");
        assert_eq!(format_number(-7.0), "-7");
        assert_eq!(format_number(2.5), "2.5");
    }

    #[tokio::test]
    async fn test_tool_execute() {
        let tool = CalculatorTool;
        assert_eq!(
            tool.execute(json!({"expression": "sqrt(144) + 10^2"})).await.unwrap(),
            "112"
        );
        let err = tool.execute(json!({"expression": "rm -rf"})).await.unwrap_err();
        assert!(err.starts_with("Calculation error"));
        assert_eq!(tool.spec().name, "calculator");
        assert!(tool.spec().get_param("expression").unwrap().required);
    }
}
