//! Lexer, parser and JSON-Logic compiler for the condition DSL.
//!
//! Grammar (loosest binding first):
//!
//! ```text
//! expr       := and ( '||' and )*
//! and        := unary ( '&&' unary )*
//! unary      := '!' unary | comparison
//! comparison := operand ( ('=='|'!='|'>='|'<='|'>'|'<'|'in') operand )?
//! operand    := literal | variable | '(' expr ')'
//! variable   := ident ( '.' (ident | integer) )*
//! literal    := string | number | true | false | null | '[' literal, ... ']'
//! ```
//!
//! Variables of the form `facets.<facet>.<path...>` compile to a `var` path
//! rooted at the run-context snapshot; anything else is used as written.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};

use super::{CompiledCondition, ConditionError};

/// Prefix every facet reference resolves under at evaluation time.
pub(crate) const FACET_VAR_ROOT: &str = "metadata.runContextSnapshot.facets";

static TOKEN_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"^\s*(?:(\|\||&&|==|!=|>=|<=|[><!(),\[\].])|([A-Za-z_][A-Za-z0-9_-]*)|(-?[0-9]+(?:\.[0-9]+)?)|'([^']*)'|"([^"]*)")"#,
    )
    .expect("invalid TOKEN_PATTERN regex")
});

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Op(String),
    Ident(String),
    Number(Value),
    Str(String),
}

fn lex(dsl: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut rest = dsl;

    loop {
        let trimmed = rest.trim_start();
        if trimmed.is_empty() {
            break;
        }
        let caps = TOKEN_PATTERN
            .captures(rest)
            .ok_or_else(|| format!("unexpected input at {:?}", truncate(trimmed)))?;
        let whole = caps.get(0).expect("regex always has group 0");

        if let Some(op) = caps.get(1) {
            tokens.push(Token::Op(op.as_str().to_string()));
        } else if let Some(ident) = caps.get(2) {
            tokens.push(Token::Ident(ident.as_str().to_string()));
        } else if let Some(number) = caps.get(3) {
            tokens.push(Token::Number(parse_number(number.as_str())?));
        } else if let Some(single) = caps.get(4) {
            tokens.push(Token::Str(single.as_str().to_string()));
        } else if let Some(double) = caps.get(5) {
            tokens.push(Token::Str(double.as_str().to_string()));
        }

        rest = &rest[whole.end()..];
    }

    Ok(tokens)
}

fn parse_number(text: &str) -> Result<Value, String> {
    if text.contains('.') {
        let parsed: f64 = text
            .parse()
            .map_err(|_| format!("bad number literal {:?}", text))?;
        serde_json::Number::from_f64(parsed)
            .map(Value::Number)
            .ok_or_else(|| format!("non-finite number literal {:?}", text))
    } else {
        let parsed: i64 = text
            .parse()
            .map_err(|_| format!("bad number literal {:?}", text))?;
        Ok(Value::Number(parsed.into()))
    }
}

fn truncate(text: &str) -> String {
    text.chars().take(24).collect()
}

// ============================================================================
// AST
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Var(Vec<String>),
    Literal(Value),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Cmp(String, Box<Expr>, Box<Expr>),
}

// Precedence levels for canonical rendering.
const PREC_OR: u8 = 1;
const PREC_AND: u8 = 2;
const PREC_NOT: u8 = 3;
const PREC_CMP: u8 = 4;
const PREC_PRIMARY: u8 = 5;

impl Expr {
    fn precedence(&self) -> u8 {
        match self {
            Expr::Or(_) => PREC_OR,
            Expr::And(_) => PREC_AND,
            Expr::Not(_) => PREC_NOT,
            Expr::Cmp(..) => PREC_CMP,
            Expr::Var(_) | Expr::Literal(_) => PREC_PRIMARY,
        }
    }

    fn render(&self, parent_prec: u8) -> String {
        let own = self.precedence();
        let body = match self {
            Expr::Var(path) => path.join("."),
            Expr::Literal(value) => render_literal(value),
            Expr::Not(inner) => format!("!{}", inner.render(PREC_NOT + 1)),
            Expr::And(parts) => parts
                .iter()
                .map(|p| p.render(PREC_AND))
                .collect::<Vec<_>>()
                .join(" && "),
            Expr::Or(parts) => parts
                .iter()
                .map(|p| p.render(PREC_OR))
                .collect::<Vec<_>>()
                .join(" || "),
            Expr::Cmp(op, left, right) => format!(
                "{} {} {}",
                left.render(PREC_CMP + 1),
                op,
                right.render(PREC_CMP + 1)
            ),
        };
        if own < parent_prec {
            format!("({})", body)
        } else {
            body
        }
    }

    fn to_json_logic(&self) -> Value {
        match self {
            Expr::Var(path) => json!({ "var": var_path(path) }),
            Expr::Literal(value) => value.clone(),
            Expr::Not(inner) => json!({ "!": [inner.to_json_logic()] }),
            Expr::And(parts) => {
                json!({ "and": parts.iter().map(Expr::to_json_logic).collect::<Vec<_>>() })
            }
            Expr::Or(parts) => {
                json!({ "or": parts.iter().map(Expr::to_json_logic).collect::<Vec<_>>() })
            }
            Expr::Cmp(op, left, right) => {
                json!({ op.as_str(): [left.to_json_logic(), right.to_json_logic()] })
            }
        }
    }
}

fn render_literal(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// Map a DSL variable chain to its evaluation-time `var` path.
fn var_path(path: &[String]) -> String {
    if path.len() >= 2 && path[0] == "facets" {
        let facet = &path[1];
        let mut full = format!("{}.{}.value", FACET_VAR_ROOT, facet);
        for segment in &path[2..] {
            full.push('.');
            full.push_str(segment);
        }
        full
    } else {
        path.join(".")
    }
}

// ============================================================================
// Parser
// ============================================================================

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Some(Token::Op(o)) if o == op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> Result<(), String> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(format!("expected {:?}", op))
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, String> {
        let first = self.parse_and()?;
        let mut parts = vec![first];
        while self.eat_op("||") {
            parts.push(self.parse_and()?);
        }
        if parts.len() == 1 {
            Ok(parts.pop().expect("non-empty"))
        } else {
            Ok(Expr::Or(parts))
        }
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let first = self.parse_unary()?;
        let mut parts = vec![first];
        while self.eat_op("&&") {
            parts.push(self.parse_unary()?);
        }
        if parts.len() == 1 {
            Ok(parts.pop().expect("non-empty"))
        } else {
            Ok(Expr::And(parts))
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if self.eat_op("!") {
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let left = self.parse_operand()?;

        let op = match self.peek() {
            Some(Token::Op(o))
                if matches!(o.as_str(), "==" | "!=" | ">" | ">=" | "<" | "<=") =>
            {
                o.clone()
            }
            Some(Token::Ident(word)) if word == "in" => "in".to_string(),
            _ => return Ok(left),
        };
        self.pos += 1;

        let right = self.parse_operand().map_err(|e| {
            format!("missing right-hand operand for {:?}: {}", op, e)
        })?;
        Ok(Expr::Cmp(op, Box::new(left), Box::new(right)))
    }

    fn parse_operand(&mut self) -> Result<Expr, String> {
        if self.eat_op("(") {
            let inner = self.parse_expr()?;
            self.expect_op(")")?;
            return Ok(inner);
        }
        if self.eat_op("[") {
            return self.parse_array();
        }

        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(n)),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ => self.parse_variable_tail(word),
            },
            Some(Token::Op(op)) => Err(format!("unexpected operator {:?}", op)),
            None => Err("unexpected end of expression".to_string()),
        }
    }

    fn parse_variable_tail(&mut self, head: String) -> Result<Expr, String> {
        let mut path = vec![head];
        while self.eat_op(".") {
            match self.next() {
                Some(Token::Ident(segment)) => path.push(segment),
                Some(Token::Number(n)) if n.is_u64() => path.push(n.to_string()),
                other => {
                    return Err(format!(
                        "expected path segment after '.', found {:?}",
                        other
                    ));
                }
            }
        }
        Ok(Expr::Var(path))
    }

    fn parse_array(&mut self) -> Result<Expr, String> {
        let mut items = Vec::new();
        if self.eat_op("]") {
            return Ok(Expr::Literal(Value::Array(items)));
        }
        loop {
            match self.parse_operand()? {
                Expr::Literal(value) => items.push(value),
                other => return Err(format!("array literals may only contain literals, found {:?}", other)),
            }
            if self.eat_op("]") {
                break;
            }
            self.expect_op(",")?;
        }
        Ok(Expr::Literal(Value::Array(items)))
    }
}

/// Compile a DSL expression into its canonical form and JSON-Logic.
pub fn compile_dsl(dsl: &str) -> Result<CompiledCondition, ConditionError> {
    let invalid = |message: String| ConditionError::InvalidDsl {
        dsl: dsl.to_string(),
        message,
    };

    let tokens = lex(dsl).map_err(&invalid)?;
    if tokens.is_empty() {
        return Err(invalid("empty expression".to_string()));
    }

    let mut parser = Parser::new(tokens);
    let expr = parser.parse_expr().map_err(&invalid)?;
    if parser.pos != parser.tokens.len() {
        return Err(invalid(format!(
            "trailing tokens after expression (at token {})",
            parser.pos
        )));
    }

    Ok(CompiledCondition {
        dsl: dsl.to_string(),
        canonical_dsl: expr.render(0),
        json_logic: expr.to_json_logic(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_simple_comparison() {
        let compiled = compile_dsl(r#"facets.post_copy.status == "ready""#).unwrap();
        assert_eq!(
            compiled.json_logic,
            json!({ "==": [
                { "var": "metadata.runContextSnapshot.facets.post_copy.value.status" },
                "ready"
            ]})
        );
        assert_eq!(
            compiled.canonical_dsl,
            r#"facets.post_copy.status == "ready""#
        );
    }

    #[test]
    fn test_compile_boolean_combinators() {
        let compiled =
            compile_dsl("facets.qaFindings.score >= 0.8 && !facets.planKnobs.strict").unwrap();
        let logic = compiled.json_logic;
        assert!(logic.get("and").is_some());
        assert_eq!(logic["and"].as_array().unwrap().len(), 2);
        assert!(logic["and"][1].get("!").is_some());
    }

    #[test]
    fn test_or_binds_looser_than_and() {
        let compiled = compile_dsl("a.x == 1 || b.y == 2 && c.z == 3").unwrap();
        // && groups first, so the top operator is ||.
        assert!(compiled.json_logic.get("or").is_some());
        let or_args = compiled.json_logic["or"].as_array().unwrap();
        assert!(or_args[1].get("and").is_some());
    }

    #[test]
    fn test_parenthesized_grouping() {
        let compiled = compile_dsl("(a.x == 1 || b.y == 2) && c.z == 3").unwrap();
        assert!(compiled.json_logic.get("and").is_some());
        assert_eq!(
            compiled.canonical_dsl,
            "(a.x == 1 || b.y == 2) && c.z == 3"
        );
    }

    #[test]
    fn test_membership() {
        let compiled = compile_dsl(r#"facets.planKnobs.variant in ["a", "b"]"#).unwrap();
        assert_eq!(
            compiled.json_logic,
            json!({ "in": [
                { "var": "metadata.runContextSnapshot.facets.planKnobs.value.variant" },
                ["a", "b"]
            ]})
        );
    }

    #[test]
    fn test_non_facet_variables_pass_through() {
        let compiled = compile_dsl("run.id == \"r1\"").unwrap();
        assert_eq!(compiled.json_logic["=="][0], json!({ "var": "run.id" }));
    }

    #[test]
    fn test_integer_and_float_literals() {
        let compiled = compile_dsl("facets.planKnobs.count == 2").unwrap();
        assert_eq!(compiled.json_logic["=="][1], json!(2));
        let compiled = compile_dsl("facets.planKnobs.ratio > 0.5").unwrap();
        assert_eq!(compiled.json_logic[">"][1], json!(0.5));
    }

    #[test]
    fn test_single_quoted_strings_normalize_to_double() {
        let compiled = compile_dsl("facets.post_copy.status == 'ready'").unwrap();
        assert_eq!(
            compiled.canonical_dsl,
            r#"facets.post_copy.status == "ready""#
        );
    }

    #[test]
    fn test_dangling_operator_rejected() {
        let err = compile_dsl("facets.planKnobs.hookIntensity <").unwrap_err();
        let ConditionError::InvalidDsl { message, .. } = err;
        assert!(message.contains("missing right-hand operand"));
    }

    #[test]
    fn test_empty_expression_rejected() {
        assert!(compile_dsl("   ").is_err());
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        assert!(compile_dsl("a.x == 1 b.y").is_err());
    }

    #[test]
    fn test_unexpected_character_rejected() {
        assert!(compile_dsl("a.x == @").is_err());
    }
}
