use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tantivy::schema::*;
use tantivy::tokenizer::{
    Language, LowerCaser, PreTokenizedString, RemoveLongFilter, SimpleTokenizer, Stemmer,
    TextAnalyzer, Token, TokenStream,
};
use tantivy::{Index, TantivyDocument};

use crate::error::{Error, Result};
use crate::model::types::{DocKey, Record};
use crate::schema::{FieldDescriptor, MAX_TERM_WEIGHT, RecordSchema};

pub const SCHEMA_VERSION: &str = "v1";

/// File whose presence marks a directory as a search index.
pub const FORMAT_MARKER: &str = "meta.json";

/// Gap inserted between fields so phrases never straddle two of them.
const FIELD_POSITION_GAP: usize = 100;

#[derive(Clone, Copy, Debug)]
pub struct Fields {
    /// Unique-id tag, `"{type}-{id}"`.
    pub key: Field,
    /// Record type tag.
    pub model: Field,
    pub body: Field,
    pub prefixed: Field,
    pub stemmed: Field,
    /// `"{slot}:{encoded}"` terms for range filtering.
    pub slots: Field,
    /// Stored JSON map slot -> encoded value.
    pub values: Field,
    /// Stored JSON map term -> within-document frequency.
    pub termvec: Field,
}

impl Fields {
    /// Field holding the exact (unstemmed) form of `term`.
    pub fn exact_field_for(&self, term: &str) -> Field {
        if term.contains(':') {
            self.prefixed
        } else {
            self.body
        }
    }
}

pub fn build_schema() -> Schema {
    let positions = TextFieldIndexing::default()
        .set_tokenizer("raw")
        .set_index_option(IndexRecordOption::WithFreqsAndPositions);
    let freqs = TextFieldIndexing::default()
        .set_tokenizer("raw")
        .set_index_option(IndexRecordOption::WithFreqs);

    let mut schema_builder = Schema::builder();
    schema_builder.add_text_field("key", STRING | STORED);
    schema_builder.add_text_field("model", STRING);
    schema_builder.add_text_field(
        "body",
        TextOptions::default().set_indexing_options(positions.clone()),
    );
    schema_builder.add_text_field(
        "prefixed",
        TextOptions::default().set_indexing_options(positions),
    );
    schema_builder.add_text_field("stemmed", TextOptions::default().set_indexing_options(freqs));
    schema_builder.add_text_field("slots", STRING);
    schema_builder.add_text_field("values", STORED);
    schema_builder.add_text_field("termvec", STORED);
    schema_builder.build()
}

pub fn fields_from_schema(schema: &Schema) -> Result<Fields> {
    let field = |name: &str| {
        schema.get_field(name).map_err(|_| {
            Error::Configuration(format!(
                "index schema is missing `{name}`; rebuild the index with schema {SCHEMA_VERSION}"
            ))
        })
    };
    Ok(Fields {
        key: field("key")?,
        model: field("model")?,
        body: field("body")?,
        prefixed: field("prefixed")?,
        stemmed: field("stemmed")?,
        slots: field("slots")?,
        values: field("values")?,
        termvec: field("termvec")?,
    })
}

/// Whether `path` holds an index this crate created.
pub fn is_index_dir(path: &Path) -> bool {
    path.is_dir() && path.join(FORMAT_MARKER).exists()
}

/// `base` with `suffix` appended to its final component, e.g.
/// `/data/indexes/production` + `.new`.
pub fn suffixed(base: &Path, suffix: &str) -> PathBuf {
    let mut os = base.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

pub fn open_or_create(path: &Path) -> Result<Index> {
    std::fs::create_dir_all(path)?;
    if path.join(FORMAT_MARKER).exists() {
        Ok(Index::open_in_dir(path)?)
    } else {
        Ok(Index::create_in_dir(path, build_schema())?)
    }
}

pub fn open_existing(path: &Path) -> Result<Index> {
    if !is_index_dir(path) {
        return Err(Error::Configuration(format!(
            "no search index at {}; run a rebuild first",
            path.display()
        )));
    }
    Ok(Index::open_in_dir(path)?)
}

/// A token with both its exact and stemmed spelling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzedToken {
    pub text: String,
    pub stem: String,
    pub position: usize,
    pub offset_from: usize,
    pub offset_to: usize,
}

/// Word splitting shared by indexing and query parsing.
#[derive(Clone)]
pub struct Analyzer {
    exact: TextAnalyzer,
    stemming: TextAnalyzer,
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer {
    pub fn new() -> Self {
        let exact = TextAnalyzer::builder(SimpleTokenizer::default())
            .filter(RemoveLongFilter::limit(40))
            .filter(LowerCaser)
            .build();
        let stemming = TextAnalyzer::builder(SimpleTokenizer::default())
            .filter(RemoveLongFilter::limit(40))
            .filter(LowerCaser)
            .filter(Stemmer::new(Language::English))
            .build();
        Self { exact, stemming }
    }

    pub fn tokens(&mut self, text: &str) -> Vec<AnalyzedToken> {
        let mut out = Vec::new();
        let mut exact = self.exact.token_stream(text);
        while exact.advance() {
            let token = exact.token();
            out.push(AnalyzedToken {
                text: token.text.clone(),
                stem: token.text.clone(),
                position: token.position,
                offset_from: token.offset_from,
                offset_to: token.offset_to,
            });
        }
        let mut stems = self.stemming.token_stream(text);
        let mut idx = 0;
        while stems.advance() {
            if let Some(slot) = out.get_mut(idx) {
                slot.stem = stems.token().text.clone();
            }
            idx += 1;
        }
        out
    }

    pub fn stem(&mut self, word: &str) -> Option<String> {
        self.tokens(word).into_iter().next().map(|t| t.stem)
    }
}

/// Accumulates the pre-tokenized stream for one tantivy field, keeping
/// positions monotonic across source fields.
#[derive(Default)]
struct StreamBuilder {
    text: String,
    tokens: Vec<Token>,
    next_position: usize,
}

impl StreamBuilder {
    fn push(
        &mut self,
        source: &str,
        tokens: &[AnalyzedToken],
        render: impl Fn(&AnalyzedToken) -> String,
        weight: u32,
    ) {
        if tokens.is_empty() {
            return;
        }
        if !self.text.is_empty() {
            self.text.push(' ');
        }
        let base_offset = self.text.len();
        self.text.push_str(source);

        let start = self.next_position;
        let mut last = start;
        for token in tokens {
            let position = start + token.position;
            for _ in 0..weight {
                self.tokens.push(Token {
                    offset_from: base_offset + token.offset_from,
                    offset_to: base_offset + token.offset_to,
                    position,
                    text: render(token),
                    position_length: 1,
                });
            }
            last = position;
        }
        self.next_position = last + FIELD_POSITION_GAP;
    }

    fn finish(self) -> Option<PreTokenizedString> {
        if self.tokens.is_empty() {
            return None;
        }
        Some(PreTokenizedString {
            text: self.text,
            tokens: self.tokens,
        })
    }
}

/// Build the document for `record`. Fails when a value cannot be coerced
/// to its declared kind.
pub fn encode_record(
    fields: &Fields,
    analyzer: &mut Analyzer,
    schema: &RecordSchema,
    record: &Record,
) -> Result<TantivyDocument> {
    let key = record.key();
    let mut body = StreamBuilder::default();
    let mut prefixed = StreamBuilder::default();
    let mut stemmed = StreamBuilder::default();
    let mut values: BTreeMap<String, String> = BTreeMap::new();
    let mut termvec: BTreeMap<String, u32> = BTreeMap::new();
    let mut slot_terms = Vec::new();

    for descriptor in &schema.fields {
        match descriptor {
            FieldDescriptor::Term {
                field,
                prefix,
                weight,
            } => {
                let text = schema.extract(record, field).as_text();
                let tokens = analyzer.tokens(&text);
                let weight = (*weight).clamp(1, MAX_TERM_WEIGHT);
                prefixed.push(&text, &tokens, |t| format!("{prefix}:{}", t.text), weight);
                body.push(&text, &tokens, |t| t.text.clone(), weight);
                stemmed.push(&text, &tokens, |t| format!("{prefix}:{}", t.stem), weight);
                stemmed.push(&text, &tokens, |t| t.stem.clone(), weight);
                for token in &tokens {
                    *termvec.entry(format!("{prefix}:{}", token.text)).or_default() += weight;
                    *termvec.entry(token.text.clone()).or_default() += weight;
                }
            }
            FieldDescriptor::Text { field } => {
                let text = schema.extract(record, field).as_text();
                let tokens = analyzer.tokens(&text);
                body.push(&text, &tokens, |t| t.text.clone(), 1);
                stemmed.push(&text, &tokens, |t| t.stem.clone(), 1);
                for token in &tokens {
                    *termvec.entry(token.text.clone()).or_default() += 1;
                }
            }
            FieldDescriptor::Value { field, slot, kind } => {
                let encoded = kind.encode(field, &schema.extract(record, field))?;
                if encoded.is_empty() {
                    continue;
                }
                slot_terms.push(slot_term(*slot, &encoded));
                values.insert(slot.to_string(), encoded);
            }
        }
    }

    let mut doc = TantivyDocument::default();
    doc.add_text(fields.key, key.to_string());
    doc.add_text(fields.model, &key.record_type);
    for (field, stream) in [
        (fields.body, body),
        (fields.prefixed, prefixed),
        (fields.stemmed, stemmed),
    ] {
        if let Some(pre_tokenized) = stream.finish() {
            doc.add_pre_tokenized_text(field, pre_tokenized);
        }
    }
    for term in slot_terms {
        doc.add_text(fields.slots, term);
    }
    doc.add_text(fields.values, serde_json::to_string(&values)?);
    doc.add_text(fields.termvec, serde_json::to_string(&termvec)?);
    Ok(doc)
}

pub fn slot_term(slot: u32, encoded: &str) -> String {
    format!("{slot}:{encoded}")
}

pub fn key_term(fields: &Fields, key: &DocKey) -> Term {
    Term::from_field_text(fields.key, &key.to_string())
}

pub fn model_term(fields: &Fields, record_type: &str) -> Term {
    Term::from_field_text(fields.model, record_type)
}

pub fn stored_key(fields: &Fields, doc: &TantivyDocument) -> Option<DocKey> {
    doc.get_first(fields.key)
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
}

pub fn stored_values(fields: &Fields, doc: &TantivyDocument) -> BTreeMap<u32, String> {
    doc.get_first(fields.values)
        .and_then(|v| v.as_str())
        .and_then(|s| serde_json::from_str::<BTreeMap<u32, String>>(s).ok())
        .unwrap_or_default()
}

pub fn stored_termvec(fields: &Fields, doc: &TantivyDocument) -> BTreeMap<String, u32> {
    doc.get_first(fields.termvec)
        .and_then(|v| v.as_str())
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ValueKind;
    use tempfile::TempDir;

    #[test]
    fn analyzer_pairs_exact_words_with_stems() {
        let mut analyzer = Analyzer::new();
        let tokens = analyzer.tokens("Running dogs");
        let pairs: Vec<_> = tokens
            .iter()
            .map(|t| (t.text.as_str(), t.stem.as_str(), t.position))
            .collect();
        assert_eq!(pairs, vec![("running", "run", 0), ("dogs", "dog", 1)]);
        assert_eq!(analyzer.stem("Ponies").as_deref(), Some("poni"));
        assert!(analyzer.stem("  ").is_none());
    }

    #[test]
    fn suffixed_paths_extend_the_last_component() {
        let base = Path::new("/var/idx/production");
        assert_eq!(suffixed(base, ".new"), PathBuf::from("/var/idx/production.new"));
    }

    #[test]
    fn only_directories_with_a_marker_are_indexes() -> Result<()> {
        let dir = TempDir::new()?;
        assert!(!is_index_dir(dir.path()));
        let index_path = dir.path().join("idx");
        open_or_create(&index_path)?;
        assert!(is_index_dir(&index_path));
        assert!(matches!(
            open_existing(&dir.path().join("missing")),
            Err(Error::Configuration(_))
        ));
        Ok(())
    }

    #[test]
    fn encoded_documents_carry_tags_values_and_term_vectors() -> Result<()> {
        let fields = fields_from_schema(&build_schema())?;
        let schema = RecordSchema::new("Article")
            .term("title", "S", 3)
            .value("created_at", 0, ValueKind::Date)
            .text("body");
        let record = Record::new("Article", 9)
            .with("title", "Rust ownership")
            .with("created_at", "2024-01-02")
            .with("body", "borrow checker rules");

        let doc = encode_record(&fields, &mut Analyzer::new(), &schema, &record)?;
        assert_eq!(stored_key(&fields, &doc), Some(DocKey::new("Article", 9)));
        assert_eq!(stored_values(&fields, &doc).get(&0).map(String::as_str), Some("20240102"));
        let termvec = stored_termvec(&fields, &doc);
        assert_eq!(termvec.get("S:rust"), Some(&3));
        assert_eq!(termvec.get("rust"), Some(&3));
        assert_eq!(termvec.get("borrow"), Some(&1));
        Ok(())
    }

    #[test]
    fn uncoercible_values_fail_encoding() {
        let fields = fields_from_schema(&build_schema()).unwrap();
        let schema = RecordSchema::new("Event").value("starts", 0, ValueKind::Date);
        let record = Record::new("Event", 1).with("starts", "not a date");
        assert!(matches!(
            encode_record(&fields, &mut Analyzer::new(), &schema, &record),
            Err(Error::Coercion { .. })
        ));
    }
}
