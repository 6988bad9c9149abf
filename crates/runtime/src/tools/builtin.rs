//! Builtin local tools.
//!
//! These stay deliberately small; they exist so a bare install has something
//! to dispatch and so the local-tool contract has in-tree implementations.

use super::{LocalTool, ToolError};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::iter::Peekable;
use std::str::Chars;
use std::sync::Arc;

/// All builtin tools, in registration order.
pub fn builtin_tools() -> Vec<Arc<dyn LocalTool>> {
    vec![Arc::new(Calculator), Arc::new(Clock)]
}

/// Arithmetic expression evaluator (`+`, `-`, `*`, `/`, parentheses).
pub struct Calculator;

#[async_trait]
impl LocalTool for Calculator {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Evaluate an arithmetic expression, e.g. \"(2 + 3) * 4\"."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "expression": {
                    "type": "string",
                    "description": "The arithmetic expression to evaluate"
                }
            },
            "required": ["expression"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let expression = args
            .get("expression")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidInput("missing expression".into()))?;

        let value = evaluate(expression)?;
        if !value.is_finite() {
            return Err(ToolError::Execution("result is not finite".into()));
        }
        Ok(json!({ "expression": expression, "result": value }))
    }
}

/// Current time in UTC.
pub struct Clock;

#[async_trait]
impl LocalTool for Clock {
    fn name(&self) -> &str {
        "clock"
    }

    fn description(&self) -> &str {
        "Get the current date and time (UTC)."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {}
        })
    }

    async fn execute(&self, _args: Value) -> Result<Value, ToolError> {
        let now = chrono::Utc::now();
        Ok(json!({
            "utc": now.to_rfc3339(),
            "unix": now.timestamp(),
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Expression parsing
// ─────────────────────────────────────────────────────────────────────────────

fn evaluate(expression: &str) -> Result<f64, ToolError> {
    let mut parser = Parser {
        chars: expression.chars().peekable(),
    };
    let value = parser.expr()?;
    parser.skip_whitespace();
    match parser.chars.next() {
        None => Ok(value),
        Some(c) => Err(ToolError::InvalidInput(format!(
            "unexpected character '{c}'"
        ))),
    }
}

struct Parser<'a> {
    chars: Peekable<Chars<'a>>,
}

impl Parser<'_> {
    fn skip_whitespace(&mut self) {
        while self.chars.peek().is_some_and(|c| c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn expr(&mut self) -> Result<f64, ToolError> {
        let mut value = self.term()?;
        loop {
            self.skip_whitespace();
            match self.chars.peek() {
                Some('+') => {
                    self.chars.next();
                    value += self.term()?;
                }
                Some('-') => {
                    self.chars.next();
                    value -= self.term()?;
                }
                _ => return Ok(value),
            }
        }
    }

    fn term(&mut self) -> Result<f64, ToolError> {
        let mut value = self.factor()?;
        loop {
            self.skip_whitespace();
            match self.chars.peek() {
                Some('*') => {
                    self.chars.next();
                    value *= self.factor()?;
                }
                Some('/') => {
                    self.chars.next();
                    let divisor = self.factor()?;
                    if divisor == 0.0 {
                        return Err(ToolError::Execution("division by zero".into()));
                    }
                    value /= divisor;
                }
                _ => return Ok(value),
            }
        }
    }

    fn factor(&mut self) -> Result<f64, ToolError> {
        self.skip_whitespace();
        match self.chars.peek() {
            Some('(') => {
                self.chars.next();
                let value = self.expr()?;
                self.skip_whitespace();
                match self.chars.next() {
                    Some(')') => Ok(value),
                    _ => Err(ToolError::InvalidInput("missing closing paren".into())),
                }
            }
            Some('-') => {
                self.chars.next();
                Ok(-self.factor()?)
            }
            _ => self.number(),
        }
    }

    fn number(&mut self) -> Result<f64, ToolError> {
        let mut literal = String::new();
        while let Some(&c) = self.chars.peek() {
            if !c.is_ascii_digit() && c != '.' {
                break;
            }
            literal.push(c);
            self.chars.next();
        }
        literal
            .parse()
            .map_err(|_| ToolError::InvalidInput(format!("expected a number, got '{literal}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn calculator_evaluates_expressions() {
        let result = Calculator
            .execute(json!({"expression": "(2 + 3) * 4 - 6 / 2"}))
            .await
            .unwrap();
        assert_eq!(result["result"], 17.0);
    }

    #[tokio::test]
    async fn calculator_handles_unary_minus() {
        let result = Calculator
            .execute(json!({"expression": "-3 + 5"}))
            .await
            .unwrap();
        assert_eq!(result["result"], 2.0);
    }

    #[tokio::test]
    async fn calculator_rejects_garbage() {
        let err = Calculator
            .execute(json!({"expression": "2 + banana"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn calculator_rejects_division_by_zero() {
        let err = Calculator
            .execute(json!({"expression": "1 / 0"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Execution(_)));
    }

    #[tokio::test]
    async fn clock_reports_utc() {
        let result = Clock.execute(json!({})).await.unwrap();
        assert!(result["utc"].as_str().is_some());
        assert!(result["unix"].as_i64().is_some());
    }

    #[test]
    fn builtin_schemas_are_objects() {
        for tool in builtin_tools() {
            assert_eq!(tool.schema()["type"], "object", "{}", tool.name());
        }
    }
}
