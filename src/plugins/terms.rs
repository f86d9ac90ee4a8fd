//! Parser for the Erlang term subset that application descriptors use:
//! atoms, strings, integers, lists and tuples, with `%` comments.

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    Atom(String),
    Str(String),
    Int(i64),
    List(Vec<Term>),
    Tuple(Vec<Term>),
}

impl Term {
    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Term::Atom(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Term::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Term]> {
        match self {
            Term::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Term]> {
        match self {
            Term::Tuple(items) => Some(items),
            _ => None,
        }
    }
}

/// Parses a single term followed by its terminating full stop.
pub fn parse_term(input: &str) -> Result<Term> {
    let mut parser = Parser {
        bytes: input.as_bytes(),
        pos: 0,
    };
    let term = parser.term()?;
    parser.skip_ws();
    if !parser.eat(b'.') {
        return Err(bad("expected terminating '.'"));
    }
    Ok(term)
}

fn bad(msg: &str) -> Error {
    Error::BadDescriptor(msg.to_string())
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while let Some(b) = self.peek() {
            match b {
                b' ' | b'\t' | b'\r' | b'\n' => self.pos += 1,
                b'%' => {
                    while let Some(b) = self.peek() {
                        self.pos += 1;
                        if b == b'\n' {
                            break;
                        }
                    }
                }
                _ => break,
            }
        }
    }

    fn term(&mut self) -> Result<Term> {
        self.skip_ws();
        match self.peek() {
            Some(b'{') => self.sequence(b'{', b'}').map(Term::Tuple),
            Some(b'[') => self.sequence(b'[', b']').map(Term::List),
            Some(b'"') => self.string(),
            Some(b'\'') => self.quoted_atom(),
            Some(b) if b.is_ascii_digit() || b == b'-' => self.integer(),
            Some(b) if b.is_ascii_lowercase() => self.atom(),
            _ => Err(bad("unexpected input")),
        }
    }

    fn sequence(&mut self, open: u8, close: u8) -> Result<Vec<Term>> {
        if !self.eat(open) {
            return Err(bad("expected sequence opener"));
        }
        let mut items = Vec::new();
        self.skip_ws();
        if self.eat(close) {
            return Ok(items);
        }
        loop {
            items.push(self.term()?);
            self.skip_ws();
            if self.eat(b',') {
                continue;
            }
            if self.eat(close) {
                return Ok(items);
            }
            return Err(bad("expected ',' or sequence closer"));
        }
    }

    fn string(&mut self) -> Result<Term> {
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(bad("unterminated string")),
                Some(b'"') => {
                    self.pos += 1;
                    return Ok(Term::Str(out));
                }
                Some(b'\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some(b'n') => out.push('\n'),
                        Some(b't') => out.push('\t'),
                        Some(b) => out.push(b as char),
                        None => return Err(bad("unterminated escape")),
                    }
                    self.pos += 1;
                }
                Some(b) => {
                    out.push(b as char);
                    self.pos += 1;
                }
            }
        }
    }

    fn quoted_atom(&mut self) -> Result<Term> {
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(bad("unterminated quoted atom")),
                Some(b'\'') => {
                    self.pos += 1;
                    return Ok(Term::Atom(out));
                }
                Some(b) => {
                    out.push(b as char);
                    self.pos += 1;
                }
            }
        }
    }

    fn integer(&mut self) -> Result<Term> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos]).expect("ascii digits");
        text.parse()
            .map(Term::Int)
            .map_err(|_| bad("invalid integer"))
    }

    fn atom(&mut self) -> Result<Term> {
        let start = self.pos;
        while matches!(self.peek(), Some(b) if b.is_ascii_alphanumeric() || b == b'_' || b == b'@')
        {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos]).expect("ascii atom");
        Ok(Term::Atom(text.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_an_app_descriptor() {
        let input = r#"
            %% A descriptor.
            {application, my_plugin,
             [{vsn, "1.2.3"},
              {description, "does things"},
              {applications, [kernel, stdlib, other_plugin]},
              {modules, []},
              {env, [{depth, -2}]}]}.
        "#;
        let term = parse_term(input).unwrap();
        let tuple = term.as_tuple().unwrap();
        assert_eq!(tuple[0].as_atom(), Some("application"));
        assert_eq!(tuple[1].as_atom(), Some("my_plugin"));
        let props = tuple[2].as_list().unwrap();
        assert_eq!(props.len(), 5);
        let vsn = props[0].as_tuple().unwrap();
        assert_eq!(vsn[1].as_str(), Some("1.2.3"));
    }

    #[test]
    fn parses_enabled_list() {
        let term = parse_term("[plugin_a, 'plugin-b'].").unwrap();
        let list = term.as_list().unwrap();
        assert_eq!(list[0].as_atom(), Some("plugin_a"));
        assert_eq!(list[1].as_atom(), Some("plugin-b"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_term("{unterminated").is_err());
        assert!(parse_term("no_stop").is_err());
        assert!(parse_term("[a b].").is_err());
    }
}
