//! Query-string parsing.
//!
//! # Grammar
//!
//! ```text
//! query    := or_expr EOF
//! or_expr  := xor_expr (OR xor_expr)*
//! xor_expr := and_expr (XOR and_expr)*
//! and_expr := unary ((AND | NOT)? unary)*
//! unary    := ('+' | '-' | NOT)? primary
//! primary  := '(' or_expr ')' | PHRASE | WORD
//! ```
//!
//! Adjacent terms are combined with AND. A `WORD` may carry a field prefix
//! (`title:rust`, `model:Article`, `modelid:Article-3`), a trailing `*`
//! wildcard, or a `lo..hi` value range (`created_at:20240101..20241231`,
//! `price:10..20`, or an unprefixed date/string range).

use std::ops::Bound;

use tantivy::query::{
    AllQuery, BooleanQuery, Occur, PhraseQuery, Query, RangeQuery, RegexQuery, TermQuery,
};
use tantivy::schema::{IndexRecordOption, Term};

use crate::error::{Error, Result};
use crate::schema::{FieldMap, ValueKind};
use crate::search::tantivy::{Analyzer, Fields, slot_term};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Word(String),
    Phrase { field: Option<String>, text: String },
    And,
    Or,
    Not,
    Xor,
    Plus,
    Minus,
    LeftParen,
    RightParen,
    Eof,
}

pub struct Lexer {
    input: Vec<char>,
    position: usize,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            position: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.input.get(self.position).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.input.get(self.position + offset).copied()
    }

    pub fn next_token(&mut self) -> Token {
        while self.peek().is_some_and(char::is_whitespace) {
            self.position += 1;
        }
        let Some(ch) = self.peek() else {
            return Token::Eof;
        };
        match ch {
            '(' => {
                self.position += 1;
                Token::LeftParen
            }
            ')' => {
                self.position += 1;
                Token::RightParen
            }
            '"' => {
                self.position += 1;
                Token::Phrase {
                    field: None,
                    text: self.read_quoted(),
                }
            }
            '+' | '-' if self.peek_at(1).is_some_and(|c| !c.is_whitespace()) => {
                self.position += 1;
                if ch == '+' { Token::Plus } else { Token::Minus }
            }
            _ => self.read_word(),
        }
    }

    fn read_quoted(&mut self) -> String {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            self.position += 1;
            if c == '"' {
                break;
            }
            text.push(c);
        }
        text
    }

    fn read_word(&mut self) -> Token {
        let mut word = String::new();
        while let Some(c) = self.peek() {
            if c.is_whitespace() || matches!(c, '(' | ')' | '"') {
                break;
            }
            word.push(c);
            self.position += 1;
        }
        if word.len() > 1 && word.ends_with(':') && self.peek() == Some('"') {
            self.position += 1;
            word.pop();
            return Token::Phrase {
                field: Some(word),
                text: self.read_quoted(),
            };
        }
        match word.as_str() {
            "AND" => Token::And,
            "OR" => Token::Or,
            "NOT" => Token::Not,
            "XOR" => Token::Xor,
            _ => Token::Word(word),
        }
    }
}

/// Parsed, not yet resolved against a field map.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryNode {
    Word { field: Option<String>, text: String },
    Wildcard { field: Option<String>, prefix: String },
    Phrase { field: Option<String>, text: String },
    Range {
        field: Option<String>,
        low: String,
        high: String,
    },
    Model(String),
    ModelId(String),
    And(Vec<(Occur, QueryNode)>),
    Or(Vec<QueryNode>),
    Xor(Vec<QueryNode>),
}

pub struct QueryStringParser {
    lexer: Lexer,
    current: Token,
}

impl QueryStringParser {
    pub fn new(input: &str) -> Self {
        let mut lexer = Lexer::new(input);
        let current = lexer.next_token();
        Self { lexer, current }
    }

    /// `Ok(None)` for an empty query string.
    pub fn parse(mut self) -> Result<Option<QueryNode>> {
        if self.current == Token::Eof {
            return Ok(None);
        }
        let node = self.parse_or()?;
        if self.current != Token::Eof {
            return Err(Error::InvalidQuery(format!(
                "unexpected {:?} after query",
                self.current
            )));
        }
        Ok(Some(node))
    }

    fn advance(&mut self) {
        self.current = self.lexer.next_token();
    }

    fn parse_or(&mut self) -> Result<QueryNode> {
        let mut nodes = vec![self.parse_xor()?];
        while self.current == Token::Or {
            self.advance();
            nodes.push(self.parse_xor()?);
        }
        Ok(collapse(nodes, QueryNode::Or))
    }

    fn parse_xor(&mut self) -> Result<QueryNode> {
        let mut nodes = vec![self.parse_and()?];
        while self.current == Token::Xor {
            self.advance();
            nodes.push(self.parse_and()?);
        }
        Ok(collapse(nodes, QueryNode::Xor))
    }

    fn parse_and(&mut self) -> Result<QueryNode> {
        let mut clauses = vec![self.parse_unary()?];
        loop {
            match self.current {
                Token::And => {
                    self.advance();
                    clauses.push(self.parse_unary()?);
                }
                Token::Not => {
                    self.advance();
                    let (_, node) = self.parse_unary()?;
                    clauses.push((Occur::MustNot, node));
                }
                Token::Word(_)
                | Token::Phrase { .. }
                | Token::Plus
                | Token::Minus
                | Token::LeftParen => clauses.push(self.parse_unary()?),
                _ => break,
            }
        }
        if clauses.len() == 1 && clauses[0].0 == Occur::Must {
            return Ok(clauses.remove(0).1);
        }
        Ok(QueryNode::And(clauses))
    }

    fn parse_unary(&mut self) -> Result<(Occur, QueryNode)> {
        let occur = match self.current {
            Token::Plus => Occur::Must,
            Token::Minus | Token::Not => Occur::MustNot,
            _ => return Ok((Occur::Must, self.parse_primary()?)),
        };
        self.advance();
        Ok((occur, self.parse_primary()?))
    }

    fn parse_primary(&mut self) -> Result<QueryNode> {
        match std::mem::replace(&mut self.current, Token::Eof) {
            Token::LeftParen => {
                self.advance();
                let inner = self.parse_or()?;
                if self.current != Token::RightParen {
                    return Err(Error::InvalidQuery("unbalanced parenthesis".into()));
                }
                self.advance();
                Ok(inner)
            }
            Token::Phrase { field, text } => {
                self.advance();
                Ok(QueryNode::Phrase { field, text })
            }
            Token::Word(word) => {
                self.advance();
                Ok(classify_word(word))
            }
            other => Err(Error::InvalidQuery(format!(
                "expected a term but found {other:?}"
            ))),
        }
    }
}

fn collapse(mut nodes: Vec<QueryNode>, combine: fn(Vec<QueryNode>) -> QueryNode) -> QueryNode {
    if nodes.len() == 1 {
        nodes.remove(0)
    } else {
        combine(nodes)
    }
}

fn classify_word(word: String) -> QueryNode {
    let (field, text) = match word.split_once(':') {
        Some((name, rest)) if !name.is_empty() && !rest.is_empty() => {
            (Some(name.to_string()), rest.to_string())
        }
        _ => (None, word),
    };
    match field.as_deref() {
        Some("model") => return QueryNode::Model(text),
        Some("modelid") => return QueryNode::ModelId(text),
        _ => {}
    }
    if let Some((low, high)) = text.split_once("..") {
        return QueryNode::Range {
            field,
            low: low.to_string(),
            high: high.to_string(),
        };
    }
    if text.len() > 1
        && let Some(prefix) = text.strip_suffix('*')
    {
        return QueryNode::Wildcard {
            field,
            prefix: prefix.to_string(),
        };
    }
    QueryNode::Word { field, text }
}

/// Lowers a [`QueryNode`] into an engine query for one field map.
pub struct QueryCompiler<'a> {
    fields: &'a Fields,
    map: &'a FieldMap,
    analyzer: &'a mut Analyzer,
    /// Unprefixed single words, in order, for spelling correction.
    pub words: Vec<String>,
}

impl<'a> QueryCompiler<'a> {
    pub fn new(fields: &'a Fields, map: &'a FieldMap, analyzer: &'a mut Analyzer) -> Self {
        Self {
            fields,
            map,
            analyzer,
            words: Vec::new(),
        }
    }

    /// `Ok(None)` when nothing indexable remains (e.g. punctuation only).
    pub fn compile(&mut self, node: &QueryNode) -> Result<Option<Box<dyn Query>>> {
        match node {
            QueryNode::Word { field: None, text } => Ok(self.free_text(None, text, true)),
            QueryNode::Word {
                field: Some(name),
                text,
            } => {
                if let Some(code) = self.map.prefix_for(name) {
                    let code = code.to_string();
                    return Ok(self.free_text(Some(&code), text, true));
                }
                if let Some(slot) = self.map.slot_for(name) {
                    let kind = self.map.kind_for_slot(slot).unwrap_or(ValueKind::String);
                    let encoded = kind.encode_bound(text).ok_or_else(|| {
                        Error::InvalidQuery(format!("`{text}` is not a valid {} for `{name}`", kind.as_str()))
                    })?;
                    let term = Term::from_field_text(self.fields.slots, &slot_term(slot, &encoded));
                    return Ok(Some(term_query(term)));
                }
                Ok(self.free_text(None, &format!("{name}:{text}"), true))
            }
            QueryNode::Phrase { field, text } => {
                let code = self.resolve_prefix(field.as_deref())?;
                Ok(self.free_text(code.as_deref(), text, false))
            }
            QueryNode::Wildcard { field, prefix } => {
                let code = self.resolve_prefix(field.as_deref())?;
                self.wildcard(code.as_deref(), prefix)
            }
            QueryNode::Range { field, low, high } => match self.range(field.as_deref(), low, high)? {
                Some(query) => Ok(Some(query)),
                // Unprefixed text that merely contains `..`.
                None => Ok(self.free_text(None, &format!("{low}..{high}"), true)),
            },
            QueryNode::Model(name) => Ok(Some(term_query(Term::from_field_text(
                self.fields.model,
                name,
            )))),
            QueryNode::ModelId(key) => Ok(Some(term_query(Term::from_field_text(
                self.fields.key,
                key,
            )))),
            QueryNode::And(clauses) => {
                let mut compiled = Vec::with_capacity(clauses.len());
                for (occur, node) in clauses {
                    if let Some(query) = self.compile(node)? {
                        compiled.push((*occur, query));
                    }
                }
                if compiled.is_empty() {
                    return Ok(None);
                }
                if compiled.iter().all(|(occur, _)| *occur == Occur::MustNot) {
                    compiled.push((Occur::Must, Box::new(AllQuery)));
                }
                Ok(Some(Box::new(BooleanQuery::new(compiled))))
            }
            QueryNode::Or(nodes) => {
                let mut compiled = Vec::with_capacity(nodes.len());
                for node in nodes {
                    if let Some(query) = self.compile(node)? {
                        compiled.push(query);
                    }
                }
                Ok(union(compiled))
            }
            QueryNode::Xor(nodes) => {
                let mut acc: Option<Box<dyn Query>> = None;
                for node in nodes {
                    let Some(next) = self.compile(node)? else {
                        continue;
                    };
                    acc = Some(match acc {
                        None => next,
                        Some(prev) => exclusive_or(prev, next),
                    });
                }
                Ok(acc)
            }
        }
    }

    fn resolve_prefix(&self, field: Option<&str>) -> Result<Option<String>> {
        match field {
            None => Ok(None),
            Some(name) => self
                .map
                .prefix_for(name)
                .map(|code| Some(code.to_string()))
                .ok_or_else(|| Error::InvalidQuery(format!("`{name}` is not a searchable field"))),
        }
    }

    /// One word becomes a term (stemmed unless capitalised or quoted); more
    /// words become a phrase over their exact forms.
    fn free_text(&mut self, code: Option<&str>, text: &str, allow_stem: bool) -> Option<Box<dyn Query>> {
        let tokens = self.analyzer.tokens(text);
        let render = |word: &str| match code {
            Some(code) => format!("{code}:{word}"),
            None => word.to_string(),
        };
        let exact_field = if code.is_some() {
            self.fields.prefixed
        } else {
            self.fields.body
        };
        match tokens.as_slice() {
            [] => None,
            [token] => {
                if code.is_none() && allow_stem {
                    self.words.push(token.text.clone());
                }
                let capitalised = text
                    .trim_start_matches(|c: char| !c.is_alphanumeric())
                    .starts_with(char::is_uppercase);
                if allow_stem && !capitalised {
                    Some(term_query(Term::from_field_text(
                        self.fields.stemmed,
                        &render(&token.stem),
                    )))
                } else {
                    Some(term_query(Term::from_field_text(exact_field, &render(&token.text))))
                }
            }
            many => {
                let terms = many
                    .iter()
                    .map(|t| Term::from_field_text(exact_field, &render(&t.text)))
                    .collect();
                Some(Box::new(PhraseQuery::new(terms)))
            }
        }
    }

    fn wildcard(&mut self, code: Option<&str>, prefix: &str) -> Result<Option<Box<dyn Query>>> {
        let lowered = prefix.to_lowercase();
        if lowered.is_empty() || !lowered.chars().all(char::is_alphanumeric) {
            return Ok(self.free_text(code, prefix, true));
        }
        let (field, pattern) = match code {
            Some(code) => (
                self.fields.prefixed,
                format!("{}.*", regex::escape(&format!("{code}:{lowered}"))),
            ),
            None => (self.fields.body, format!("{}.*", regex::escape(&lowered))),
        };
        let query = RegexQuery::from_pattern(&pattern, field)?;
        Ok(Some(Box::new(query)))
    }

    /// `Ok(None)` when the range is unprefixed and no range processor
    /// accepts it.
    fn range(&self, field: Option<&str>, low: &str, high: &str) -> Result<Option<Box<dyn Query>>> {
        let (slot, kind) = match field {
            Some(name) => {
                let slot = self.map.slot_for(name).ok_or_else(|| {
                    Error::InvalidQuery(format!("`{name}` is not a value field"))
                })?;
                (slot, self.map.kind_for_slot(slot).unwrap_or(ValueKind::String))
            }
            None => {
                let processor = self
                    .map
                    .ranges
                    .iter()
                    .filter(|r| r.kind != ValueKind::Number)
                    .find(|r| accepts(r.kind, low) && accepts(r.kind, high));
                match processor {
                    Some(r) => (r.slot, r.kind),
                    None => return Ok(None),
                }
            }
        };

        let encode = |raw: &str| {
            kind.encode_bound(raw).ok_or_else(|| {
                Error::InvalidQuery(format!("`{raw}` is not a valid {} bound", kind.as_str()))
            })
        };
        let slots = self.fields.slots;
        let lower = if low.is_empty() {
            Bound::Included(Term::from_field_text(slots, &slot_term(slot, "")))
        } else {
            Bound::Included(Term::from_field_text(slots, &slot_term(slot, &encode(low)?)))
        };
        let upper = if high.is_empty() {
            // `;` sorts directly after the `:` separator.
            Bound::Excluded(Term::from_field_text(slots, &format!("{slot};")))
        } else {
            Bound::Included(Term::from_field_text(slots, &slot_term(slot, &encode(high)?)))
        };
        Ok(Some(Box::new(RangeQuery::new(lower, upper))))
    }
}

fn accepts(kind: ValueKind, raw: &str) -> bool {
    raw.is_empty() || kind.encode_bound(raw).is_some()
}

pub fn term_query(term: Term) -> Box<dyn Query> {
    Box::new(TermQuery::new(term, IndexRecordOption::WithFreqs))
}

/// OR of `queries`; `None` when empty.
pub fn union(mut queries: Vec<Box<dyn Query>>) -> Option<Box<dyn Query>> {
    match queries.len() {
        0 => None,
        1 => queries.pop(),
        _ => Some(Box::new(BooleanQuery::new(
            queries.into_iter().map(|q| (Occur::Should, q)).collect(),
        ))),
    }
}

fn exclusive_or(a: Box<dyn Query>, b: Box<dyn Query>) -> Box<dyn Query> {
    let both = BooleanQuery::new(vec![
        (Occur::Must, a.box_clone()),
        (Occur::Must, b.box_clone()),
    ]);
    let either = BooleanQuery::new(vec![(Occur::Should, a), (Occur::Should, b)]);
    Box::new(BooleanQuery::new(vec![
        (Occur::Must, Box::new(either)),
        (Occur::MustNot, Box::new(both)),
    ]))
}

/// Every word of `input` ANDed together, operators and punctuation dropped.
fn plain_words(input: &str, analyzer: &mut Analyzer) -> Option<QueryNode> {
    let mut words: Vec<(Occur, QueryNode)> = analyzer
        .tokens(input)
        .into_iter()
        .filter(|token| {
            !matches!(
                input.get(token.offset_from..token.offset_to),
                Some("AND" | "OR" | "NOT" | "XOR")
            )
        })
        .map(|token| {
            let node = QueryNode::Word {
                field: None,
                text: token.text,
            };
            (Occur::Must, node)
        })
        .collect();
    match words.len() {
        0 => None,
        1 => words.pop().map(|(_, node)| node),
        _ => Some(QueryNode::And(words)),
    }
}

/// Parse and compile `input`. Returns the query (or `None` for an empty
/// query) and the plain words it contained. Input the grammar rejects is
/// searched as its plain words.
pub fn parse_query(
    input: &str,
    fields: &Fields,
    map: &FieldMap,
    analyzer: &mut Analyzer,
) -> Result<(Option<Box<dyn Query>>, Vec<String>)> {
    let parsed = match QueryStringParser::new(input).parse() {
        Ok(parsed) => parsed,
        Err(err) => {
            debug!(query = input, error = %err, "query syntax rejected; searching plain words");
            plain_words(input, analyzer)
        }
    };
    let Some(node) = parsed else {
        return Ok((None, Vec::new()));
    };
    let mut compiler = QueryCompiler::new(fields, map, analyzer);
    let query = compiler.compile(&node)?;
    Ok((query, compiler.words))
}
