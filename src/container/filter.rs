//! Requirement filter evaluation
//!
//! Evaluates the `filter` directive of a requirement against capability
//! attributes. The syntax is an RFC 1960 subset: `(key=value)`,
//! `(key>=value)`, `(key<=value)`, presence `(key=*)`, substring
//! `(key=ab*cd)`, and the composites `(&...)`, `(|...)`, `(!(...))`.
//!
//! Version-typed attributes compare by semantic-version order, numeric
//! attributes numerically, everything else lexically on the rendered string.

use std::cmp::Ordering;

use semver::Version;
use thiserror::Error;

use crate::container::revision::{AttrValue, Attributes};

/// Filter parse failure
#[derive(Debug, Clone, Error)]
#[error("invalid filter '{filter}': {reason}")]
pub struct FilterError {
    pub filter: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
enum Node {
    And(Vec<Node>),
    Or(Vec<Node>),
    Not(Box<Node>),
    Present(String),
    Compare {
        key: String,
        op: CompareOp,
        value: String,
    },
    Substring {
        key: String,
        parts: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Equal,
    GreaterEq,
    LessEq,
}

/// A parsed filter expression
#[derive(Debug, Clone)]
pub struct Filter {
    source: String,
    root: Node,
}

impl Filter {
    /// Parse a filter expression
    pub fn parse(filter: &str) -> Result<Self, FilterError> {
        let trimmed = filter.trim();
        let mut parser = Parser {
            source: trimmed,
            bytes: trimmed.as_bytes(),
            pos: 0,
        };
        let root = parser.parse_filter()?;
        parser.skip_whitespace();
        if parser.pos != parser.bytes.len() {
            return Err(parser.error("trailing characters after filter"));
        }
        Ok(Self {
            source: filter.to_string(),
            root,
        })
    }

    /// Evaluate the filter against capability attributes
    pub fn matches(&self, attributes: &Attributes) -> bool {
        eval(&self.root, attributes)
    }

    /// The original filter string
    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Parse `filter` and evaluate it against `attributes` in one step
pub fn matches(filter: &str, attributes: &Attributes) -> Result<bool, FilterError> {
    Ok(Filter::parse(filter)?.matches(attributes))
}

struct Parser<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, reason: &str) -> FilterError {
        FilterError {
            filter: self.source.to_string(),
            reason: format!("{} at position {}", reason, self.pos),
        }
    }

    fn skip_whitespace(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn expect(&mut self, byte: u8) -> Result<(), FilterError> {
        self.skip_whitespace();
        if self.pos < self.bytes.len() && self.bytes[self.pos] == byte {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", byte as char)))
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_whitespace();
        self.bytes.get(self.pos).copied()
    }

    fn parse_filter(&mut self) -> Result<Node, FilterError> {
        self.expect(b'(')?;
        let node = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Node::And(self.parse_list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                Node::Or(self.parse_list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                Node::Not(Box::new(self.parse_filter()?))
            }
            Some(_) => self.parse_item()?,
            None => return Err(self.error("unexpected end of filter")),
        };
        self.expect(b')')?;
        Ok(node)
    }

    fn parse_list(&mut self) -> Result<Vec<Node>, FilterError> {
        let mut nodes = Vec::new();
        while self.peek() == Some(b'(') {
            nodes.push(self.parse_filter()?);
        }
        if nodes.is_empty() {
            return Err(self.error("empty composite"));
        }
        Ok(nodes)
    }

    fn parse_item(&mut self) -> Result<Node, FilterError> {
        self.skip_whitespace();
        let key_start = self.pos;
        while self.pos < self.bytes.len() && !matches!(self.bytes[self.pos], b'=' | b'<' | b'>' | b'(' | b')') {
            self.pos += 1;
        }
        let key = self.source[key_start..self.pos].trim().to_string();
        if key.is_empty() {
            return Err(self.error("empty attribute key"));
        }
        let op = match self.bytes.get(self.pos) {
            Some(b'=') => {
                self.pos += 1;
                CompareOp::Equal
            }
            Some(b'>') => {
                self.pos += 1;
                self.expect(b'=')?;
                CompareOp::GreaterEq
            }
            Some(b'<') => {
                self.pos += 1;
                self.expect(b'=')?;
                CompareOp::LessEq
            }
            _ => return Err(self.error("expected comparison operator")),
        };
        let value_start = self.pos;
        while self.pos < self.bytes.len() && self.bytes[self.pos] != b')' {
            self.pos += 1;
        }
        let value = self.source[value_start..self.pos].to_string();
        if op == CompareOp::Equal {
            if value == "*" {
                return Ok(Node::Present(key));
            }
            if value.contains('*') {
                let parts = value.split('*').map(str::to_string).collect();
                return Ok(Node::Substring { key, parts });
            }
        }
        Ok(Node::Compare { key, op, value })
    }
}

fn eval(node: &Node, attributes: &Attributes) -> bool {
    match node {
        Node::And(nodes) => nodes.iter().all(|n| eval(n, attributes)),
        Node::Or(nodes) => nodes.iter().any(|n| eval(n, attributes)),
        Node::Not(inner) => !eval(inner, attributes),
        Node::Present(key) => attributes.contains_key(key),
        Node::Compare { key, op, value } => attributes
            .get(key)
            .map(|attr| compare(attr, *op, value))
            .unwrap_or(false),
        Node::Substring { key, parts } => attributes
            .get(key)
            .map(|attr| substring_match(&attr.to_string(), parts))
            .unwrap_or(false),
    }
}

fn compare(attr: &AttrValue, op: CompareOp, value: &str) -> bool {
    let ordering = match attr {
        AttrValue::Version(v) => match Version::parse(value.trim()) {
            Ok(other) => v.cmp(&other),
            Err(_) => return false,
        },
        AttrValue::Long(n) => match value.trim().parse::<i64>() {
            Ok(other) => n.cmp(&other),
            Err(_) => return false,
        },
        AttrValue::Double(d) => match value.trim().parse::<f64>() {
            Ok(other) => match d.partial_cmp(&other) {
                Some(ordering) => ordering,
                None => return false,
            },
            Err(_) => return false,
        },
        AttrValue::String(s) => s.as_str().cmp(value),
        AttrValue::List(items) => {
            return items.iter().any(|item| compare(item, op, value));
        }
    };
    match op {
        CompareOp::Equal => ordering == Ordering::Equal,
        CompareOp::GreaterEq => ordering != Ordering::Less,
        CompareOp::LessEq => ordering != Ordering::Greater,
    }
}

fn substring_match(value: &str, parts: &[String]) -> bool {
    let mut remaining = value;
    for (index, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if index == 0 {
            match remaining.strip_prefix(part.as_str()) {
                Some(rest) => remaining = rest,
                None => return false,
            }
        } else if index == parts.len() - 1 {
            return remaining.ends_with(part.as_str());
        } else {
            match remaining.find(part.as_str()) {
                Some(found) => remaining = &remaining[found + part.len()..],
                None => return false,
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(entries: &[(&str, AttrValue)]) -> Attributes {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_equality() {
        let attributes = attrs(&[("package", AttrValue::from("util"))]);
        assert!(matches("(package=util)", &attributes).unwrap());
        assert!(!matches("(package=other)", &attributes).unwrap());
        assert!(!matches("(missing=util)", &attributes).unwrap());
    }

    #[test]
    fn test_version_ordering() {
        let attributes = attrs(&[(
            "version",
            AttrValue::Version(Version::new(1, 5, 0)),
        )]);
        assert!(matches("(version>=1.0.0)", &attributes).unwrap());
        assert!(matches("(version<=2.0.0)", &attributes).unwrap());
        assert!(!matches("(version>=2.0.0)", &attributes).unwrap());
    }

    #[test]
    fn test_composites() {
        let attributes = attrs(&[
            ("package", AttrValue::from("util")),
            ("vendor", AttrValue::from("acme")),
        ]);
        assert!(matches("(&(package=util)(vendor=acme))", &attributes).unwrap());
        assert!(!matches("(&(package=util)(vendor=other))", &attributes).unwrap());
        assert!(matches("(|(package=other)(vendor=acme))", &attributes).unwrap());
        assert!(matches("(!(package=other))", &attributes).unwrap());
    }

    #[test]
    fn test_presence_and_substring() {
        let attributes = attrs(&[("package", AttrValue::from("util.text"))]);
        assert!(matches("(package=*)", &attributes).unwrap());
        assert!(matches("(package=util*)", &attributes).unwrap());
        assert!(matches("(package=*text)", &attributes).unwrap());
        assert!(matches("(package=u*l*xt)", &attributes).unwrap());
        assert!(!matches("(package=util*z)", &attributes).unwrap());
    }

    #[test]
    fn test_numeric_comparison() {
        let attributes = attrs(&[("rank", AttrValue::Long(10))]);
        assert!(matches("(rank>=5)", &attributes).unwrap());
        assert!(!matches("(rank<=5)", &attributes).unwrap());
    }

    #[test]
    fn test_parse_errors() {
        assert!(Filter::parse("package=util").is_err());
        assert!(Filter::parse("(package=util").is_err());
        assert!(Filter::parse("(&)").is_err());
        assert!(Filter::parse("(=util)").is_err());
        assert!(Filter::parse("(a=b)garbage").is_err());
    }

    #[test]
    fn test_list_attribute_any_match() {
        let attributes = attrs(&[(
            "uses",
            AttrValue::List(vec![AttrValue::from("a"), AttrValue::from("b")]),
        )]);
        assert!(matches("(uses=b)", &attributes).unwrap());
        assert!(!matches("(uses=c)", &attributes).unwrap());
    }
}
