//! Boolean expressions over variable references.
//!
//! Used by edge conditions, loop break conditions and the `if_else` node.
//! Expressions are parsed once when a graph is published and evaluated many
//! times against a resolver that maps references to pool values.
//!
//! ```text
//! fetch.status == 200 && (inputs.mode == "fast" || not cache.hit)
//! score.value >= 0.5 and tags.list contains "urgent"
//! ```

use std::fmt;

use serde_json::Value;

/// A dotted variable reference such as `node.key` or `node.key.field.0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VarRef {
    segments: Vec<String>,
}

impl VarRef {
    /// Parse a dotted reference. Fails on empty segments.
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty reference".into());
        }
        let segments: Vec<String> = s.split('.').map(|p| p.trim().to_string()).collect();
        if segments.iter().any(|p| p.is_empty()) {
            return Err(format!("malformed reference '{}'", s));
        }
        Ok(Self { segments })
    }

    /// Scope the reference points into (a node id, `inputs` or `iteration`).
    pub fn root(&self) -> &str {
        &self.segments[0]
    }

    /// Output key within the root scope, if any.
    pub fn key(&self) -> Option<&str> {
        self.segments.get(1).map(String::as_str)
    }

    /// Path below the key, navigated into objects and arrays.
    pub fn path(&self) -> &[String] {
        self.segments.get(2..).unwrap_or(&[])
    }

    /// Segments after the root.
    pub fn tail(&self) -> &[String] {
        &self.segments[1..]
    }

    /// A single identifier with no key (a local input name).
    pub fn is_bare(&self) -> bool {
        self.segments.len() == 1
    }
}

impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

/// Follow `path` into `value`. Numeric segments index arrays.
pub fn navigate<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
    In,
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Var(VarRef),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn parse(source: &str) -> Result<Self, String> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        match parser.peek() {
            None => Ok(expr),
            Some(tok) => Err(format!("unexpected token {}", tok)),
        }
    }

    /// Every variable reference in the expression, in source order.
    pub fn references(&self) -> Vec<&VarRef> {
        let mut refs = Vec::new();
        self.collect_refs(&mut refs);
        refs
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a VarRef>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Var(r) => out.push(r),
            Expr::Not(e) => e.collect_refs(out),
            Expr::And(a, b) | Expr::Or(a, b) | Expr::Compare(_, a, b) => {
                a.collect_refs(out);
                b.collect_refs(out);
            }
        }
    }

    /// Evaluate to a value. Unresolvable references evaluate to `null`.
    pub fn eval<F>(&self, resolve: &F) -> Value
    where
        F: Fn(&VarRef) -> Option<Value>,
    {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::Var(r) => resolve(r).unwrap_or(Value::Null),
            Expr::Not(e) => Value::Bool(!truthy(&e.eval(resolve))),
            Expr::And(a, b) => {
                Value::Bool(truthy(&a.eval(resolve)) && truthy(&b.eval(resolve)))
            }
            Expr::Or(a, b) => Value::Bool(truthy(&a.eval(resolve)) || truthy(&b.eval(resolve))),
            Expr::Compare(op, a, b) => Value::Bool(compare(*op, &a.eval(resolve), &b.eval(resolve))),
        }
    }

    /// Evaluate and test truthiness.
    pub fn is_true<F>(&self, resolve: &F) -> bool
    where
        F: Fn(&VarRef) -> Option<Value>,
    {
        truthy(&self.eval(resolve))
    }
}

/// `null`, `false`, `0`, `""`, `[]` and `{}` are false; everything else is true.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> bool {
    use std::cmp::Ordering;

    let ordering = || -> Option<Ordering> {
        match (left, right) {
            (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
            (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
            _ => None,
        }
    };

    match op {
        CmpOp::Eq => loose_eq(left, right),
        CmpOp::Ne => !loose_eq(left, right),
        CmpOp::Lt => ordering() == Some(Ordering::Less),
        CmpOp::Le => matches!(ordering(), Some(Ordering::Less | Ordering::Equal)),
        CmpOp::Gt => ordering() == Some(Ordering::Greater),
        CmpOp::Ge => matches!(ordering(), Some(Ordering::Greater | Ordering::Equal)),
        CmpOp::Contains => contains(left, right),
        CmpOp::In => contains(right, left),
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::String(h), Value::String(n)) => h.contains(n.as_str()),
        (Value::Array(items), n) => items.iter().any(|item| loose_eq(item, n)),
        (Value::Object(map), Value::String(k)) => map.contains_key(k),
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(Value),
    Ident(String),
    Op(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Literal(v) => write!(f, "{}", v),
            Token::Ident(s) => write!(f, "'{}'", s),
            Token::Op(op) => write!(f, "{:?}", op),
            Token::And => f.write_str("'&&'"),
            Token::Or => f.write_str("'||'"),
            Token::Not => f.write_str("'!'"),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')
}

fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".into()),
                        Some('\\') => {
                            let escaped = chars.get(i + 1).ok_or("dangling escape")?;
                            s.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => *other,
                            });
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Literal(Value::String(s)));
            }
            '=' | '!' | '<' | '>' | '&' | '|' => {
                let next = chars.get(i + 1).copied();
                let (tok, width) = match (c, next) {
                    ('=', Some('=')) => (Token::Op(CmpOp::Eq), 2),
                    ('!', Some('=')) => (Token::Op(CmpOp::Ne), 2),
                    ('<', Some('=')) => (Token::Op(CmpOp::Le), 2),
                    ('>', Some('=')) => (Token::Op(CmpOp::Ge), 2),
                    ('&', Some('&')) => (Token::And, 2),
                    ('|', Some('|')) => (Token::Or, 2),
                    ('!', _) => (Token::Not, 1),
                    ('<', _) => (Token::Op(CmpOp::Lt), 1),
                    ('>', _) => (Token::Op(CmpOp::Gt), 1),
                    _ => return Err(format!("unexpected character '{}' at {}", c, i)),
                };
                tokens.push(tok);
                i += width;
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || matches!(chars[i], '.' | 'e' | 'E')) {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number: serde_json::Number = text
                    .parse::<i64>()
                    .map(serde_json::Number::from)
                    .ok()
                    .or_else(|| text.parse::<f64>().ok().and_then(serde_json::Number::from_f64))
                    .ok_or_else(|| format!("invalid number '{}'", text))?;
                tokens.push(Token::Literal(Value::Number(number)));
            }
            c if is_ident_start(c) => {
                let start = i;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::Literal(Value::Bool(true)),
                    "false" => Token::Literal(Value::Bool(false)),
                    "null" => Token::Literal(Value::Null),
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "contains" => Token::Op(CmpOp::Contains),
                    "in" => Token::Op(CmpOp::In),
                    _ => Token::Ident(word),
                });
            }
            other => return Err(format!("unexpected character '{}' at {}", other, i)),
        }
    }

    if tokens.is_empty() {
        return Err("empty expression".into());
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let left = self.parse_primary()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.parse_primary()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Literal(v)) => Ok(Expr::Literal(v)),
            Some(Token::Ident(name)) => Ok(Expr::Var(VarRef::parse(&name)?)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected ')'".into()),
                }
            }
            Some(tok) => Err(format!("unexpected token {}", tok)),
            None => Err("unexpected end of expression".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval_with(expr: &str, vars: Value) -> bool {
        let parsed = Expr::parse(expr).unwrap();
        parsed.is_true(&|r: &VarRef| {
            let root = vars.get(r.root())?;
            navigate(root, r.tail()).cloned()
        })
    }

    #[test]
    fn test_numeric_comparison() {
        let vars = json!({"start": {"x": 10}});
        assert!(eval_with("start.x > 5", vars.clone()));
        assert!(!eval_with("start.x <= 5", vars.clone()));
        assert!(eval_with("start.x == 10.0", vars));
    }

    #[test]
    fn test_boolean_operators_and_precedence() {
        let vars = json!({"a": {"v": 1}, "b": {"v": "on"}});
        assert!(eval_with(r#"a.v == 2 || b.v == "on" && a.v == 1"#, vars.clone()));
        assert!(!eval_with(r#"(a.v == 2 || b.v == "on") && a.v == 3"#, vars.clone()));
        assert!(eval_with(r#"not a.v == 2 and b.v != 'off'"#, vars.clone()));
        assert!(eval_with("!(a.v > 1)", vars));
    }

    #[test]
    fn test_contains_and_in() {
        let vars = json!({"n": {"tags": ["x", "y"], "text": "hello world", "obj": {"k": 1}}});
        assert!(eval_with(r#"n.tags contains "y""#, vars.clone()));
        assert!(eval_with(r#""x" in n.tags"#, vars.clone()));
        assert!(eval_with(r#"n.text contains "world""#, vars.clone()));
        assert!(eval_with(r#"n.obj contains "k""#, vars.clone()));
        assert!(!eval_with(r#"n.tags contains "z""#, vars));
    }

    #[test]
    fn test_missing_reference_is_null() {
        let vars = json!({});
        assert!(eval_with("ghost.value == null", vars.clone()));
        assert!(!eval_with("ghost.value", vars.clone()));
        assert!(!eval_with("ghost.value > 1", vars));
    }

    #[test]
    fn test_nested_paths_and_indexes() {
        let vars = json!({"fetch": {"body": {"items": [{"id": 7}]}}});
        assert!(eval_with("fetch.body.items.0.id == 7", vars));
    }

    #[test]
    fn test_mismatched_ordering_is_false() {
        let vars = json!({"a": {"v": "10"}});
        assert!(!eval_with("a.v > 5", vars.clone()));
        assert!(!eval_with("a.v < 5", vars));
    }

    #[test]
    fn test_references_in_order() {
        let expr = Expr::parse("a.x > 1 && (b.y == c.z || inputs.flag)").unwrap();
        let refs: Vec<String> = expr.references().iter().map(|r| r.to_string()).collect();
        assert_eq!(refs, vec!["a.x", "b.y", "c.z", "inputs.flag"]);
    }

    #[test]
    fn test_hyphenated_node_ids() {
        let expr = Expr::parse("fetch-data.status == -1").unwrap();
        let refs = expr.references();
        assert_eq!(refs[0].root(), "fetch-data");
        assert_eq!(refs[0].key(), Some("status"));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Expr::parse("").is_err());
        assert!(Expr::parse("a.x ==").is_err());
        assert!(Expr::parse("(a.x == 1").is_err());
        assert!(Expr::parse("a.x = 1").is_err());
        assert!(Expr::parse(r#"a.x == "open"#).is_err());
        assert!(Expr::parse("a..x").is_err());
    }

    #[test]
    fn test_truthiness() {
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!([])));
        assert!(!truthy(&json!({})));
        assert!(truthy(&json!(0.5)));
        assert!(truthy(&json!([0])));
    }
}
