use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Serialize;
use tantivy::collector::{Count, TopDocs};
use tantivy::query::{AllQuery, BooleanQuery, Occur, Query};
use tantivy::schema::{Field, Term};
use tantivy::{Searcher, TantivyDocument};
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::types::{DocKey, Record};
use crate::search::query_parser::{parse_query, term_query, union};
use crate::search::readable::ReadableIndex;
use crate::search::tantivy::{Fields, key_term, model_term, stored_key, stored_termvec, stored_values};
use crate::storage::{FindOptions, RecordStore};

/// Size of the relevance set used to characterise seed documents.
pub const RELEVANCE_SET_SIZE: usize = 100;
/// Number of expansion terms a similarity query is built from.
pub const EXPANSION_TERMS: usize = 40;

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub offset: usize,
    /// `None` is unbounded.
    pub limit: Option<usize>,
    /// Accepted for callers that tune estimate accuracy. The engine always
    /// counts matches exactly, so it never lowers accuracy.
    pub check_at_least: usize,
    /// Value field to sort by; relevance when `None`.
    pub sort_by: Option<String>,
    pub sort_ascending: bool,
    /// Value field whose repeated values are collapsed into one hit.
    pub collapse_by: Option<String>,
    pub find: FindOptions,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: None,
            check_at_least: 100,
            sort_by: None,
            sort_ascending: true,
            collapse_by: None,
            find: FindOptions::default(),
        }
    }
}

impl SearchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>, ascending: bool) -> Self {
        self.sort_by = Some(field.into());
        self.sort_ascending = ascending;
        self
    }

    pub fn collapse_by(mut self, field: impl Into<String>) -> Self {
        self.collapse_by = Some(field.into());
        self
    }

    pub fn find(mut self, find: FindOptions) -> Self {
        self.find = find;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hit {
    pub key: DocKey,
    pub weight: f32,
    pub percent: u8,
    pub collapse_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchSet {
    pub hits: Vec<Hit>,
    pub estimated: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub key: DocKey,
    pub weight: f32,
    pub percent: u8,
    pub collapse_count: usize,
    /// `None` when the record disappeared after it was indexed.
    pub record: Option<Record>,
}

struct RankPlan {
    offset: usize,
    limit: Option<usize>,
    sort_slot: Option<u32>,
    sort_ascending: bool,
    collapse_slot: Option<u32>,
    /// Rank the whole match set and leave windowing to the caller.
    whole_set: bool,
}

/// State shared by [`Search`] and [`Similar`]: the compiled query, paging
/// options and the lazily computed match set and results.
pub struct QuerySession<'a> {
    index: &'a mut ReadableIndex,
    records: &'a dyn RecordStore,
    query: Box<dyn Query>,
    options: SearchOptions,
    sort_slot: Option<u32>,
    collapse_slot: Option<u32>,
    eager_load: BTreeMap<String, Vec<String>>,
    log_description: String,
    matches: Option<MatchSet>,
    filtered_estimate: Option<usize>,
    results: Option<Vec<SearchResult>>,
    runtime: Duration,
}

impl<'a> QuerySession<'a> {
    pub(crate) fn new(
        index: &'a mut ReadableIndex,
        records: &'a dyn RecordStore,
        query: Box<dyn Query>,
        options: SearchOptions,
        eager_load: BTreeMap<String, Vec<String>>,
        log_description: String,
    ) -> Result<Self> {
        let slot_of = |field: &Option<String>| -> Result<Option<u32>> {
            match field {
                None => Ok(None),
                Some(name) => index
                    .field_map()
                    .slot_for(name)
                    .map(Some)
                    .ok_or_else(|| Error::InvalidQuery(format!("`{name}` is not a value field"))),
            }
        };
        let sort_slot = slot_of(&options.sort_by)?;
        let collapse_slot = slot_of(&options.collapse_by)?;
        Ok(Self {
            index,
            records,
            query,
            options,
            sort_slot,
            collapse_slot,
            eager_load,
            log_description,
            matches: None,
            filtered_estimate: None,
            results: None,
            runtime: Duration::ZERO,
        })
    }

    /// Engine-level rendering of the compiled query.
    pub fn description(&self) -> String {
        format!("{:?}", self.query)
    }

    pub fn log_description(&self) -> &str {
        &self.log_description
    }

    pub fn runtime(&self) -> Duration {
        self.runtime
    }

    fn postpones_limit(&self) -> bool {
        self.options.find.is_filtering()
    }

    /// The ranked match set, computed on first use.
    pub fn matches(&mut self) -> Result<&MatchSet> {
        if self.matches.is_none() {
            let ranked = self.rank()?;
            self.matches = Some(ranked);
        }
        Ok(self.matches.get_or_insert_with(MatchSet::default))
    }

    /// Re-run ranking against a freshly reopened snapshot.
    pub fn reload_matches(&mut self) -> Result<&MatchSet> {
        self.index.reopen()?;
        self.matches = None;
        self.filtered_estimate = None;
        self.results = None;
        self.matches()
    }

    /// Total matches. Under a relational filter this is the number of
    /// qualifying records, which requires materializing results.
    pub fn matches_estimated(&mut self) -> Result<usize> {
        if self.postpones_limit() {
            self.results()?;
            if let Some(estimate) = self.filtered_estimate {
                return Ok(estimate);
            }
        }
        Ok(self.matches()?.estimated)
    }

    fn rank(&mut self) -> Result<MatchSet> {
        let started = Instant::now();
        let plan = RankPlan {
            offset: self.options.offset,
            limit: self.options.limit,
            sort_slot: self.sort_slot,
            sort_ascending: self.options.sort_ascending,
            collapse_slot: self.collapse_slot,
            whole_set: self.postpones_limit(),
        };
        let query = self.query.as_ref();
        let ranked = self
            .index
            .with_retry(|searcher, fields| rank_matches(searcher, fields, query, &plan))?;
        self.runtime += started.elapsed();
        Ok(ranked)
    }

    /// The page of results with records attached, computed once.
    pub fn results(&mut self) -> Result<&[SearchResult]> {
        if self.results.is_none() {
            let results = self.materialize()?;
            self.results = Some(results);
        }
        Ok(self.results.as_deref().unwrap_or_default())
    }

    fn materialize(&mut self) -> Result<Vec<SearchResult>> {
        let mut hits = self.matches()?.hits.clone();
        debug!(
            "query ({:.5}s) {}",
            self.runtime.as_secs_f64(),
            self.log_description
        );

        if self.postpones_limit() {
            let started = Instant::now();
            let mut qualifying: HashSet<DocKey> = HashSet::new();
            for (record_type, ids) in group_by_type(&hits) {
                for id in self.records.filter_ids(&record_type, &ids, &self.options.find)? {
                    qualifying.insert(DocKey::new(record_type.clone(), id));
                }
            }
            hits.retain(|hit| qualifying.remove(&hit.key));
            self.filtered_estimate = Some(hits.len());
            hits = window(hits, self.options.offset, self.options.limit);
            self.runtime += started.elapsed();
        }

        let mut fetched: HashMap<DocKey, Record> = HashMap::new();
        for (record_type, ids) in group_by_type(&hits) {
            let mut find = self.options.find.clone();
            if let Some(extra) = self.eager_load.get(&record_type) {
                for association in extra {
                    if !find.include.contains(association) {
                        find.include.push(association.clone());
                    }
                }
            }
            for record in self.records.find(&record_type, &ids, &find)? {
                fetched.insert(record.key(), record);
            }
        }

        Ok(hits
            .into_iter()
            .map(|hit| SearchResult {
                record: fetched.remove(&hit.key),
                key: hit.key,
                weight: hit.weight,
                percent: hit.percent,
                collapse_count: hit.collapse_count,
            })
            .collect())
    }
}

fn group_by_type(hits: &[Hit]) -> BTreeMap<String, Vec<i64>> {
    let mut grouped: BTreeMap<String, Vec<i64>> = BTreeMap::new();
    for hit in hits {
        grouped
            .entry(hit.key.record_type.clone())
            .or_default()
            .push(hit.key.id);
    }
    grouped
}

fn window<T>(items: Vec<T>, offset: usize, limit: Option<usize>) -> Vec<T> {
    let limit = limit.unwrap_or(usize::MAX);
    items.into_iter().skip(offset).take(limit).collect()
}

fn percent(weight: f32, best: f32) -> u8 {
    if best <= 0.0 {
        return 100;
    }
    ((weight / best) * 100.0).round().clamp(0.0, 100.0) as u8
}

struct Ranked {
    hit: Hit,
    sort_value: String,
    collapse_value: String,
}

fn rank_matches(
    searcher: &Searcher,
    fields: &Fields,
    query: &dyn Query,
    plan: &RankPlan,
) -> Result<MatchSet> {
    let total = searcher.search(query, &Count)?;
    let whole = plan.whole_set || plan.sort_slot.is_some() || plan.collapse_slot.is_some();
    let (offset, limit) = if whole {
        (0, total)
    } else {
        let remaining = total.saturating_sub(plan.offset);
        (plan.offset, plan.limit.map_or(remaining, |l| l.min(remaining)))
    };
    if limit == 0 {
        return Ok(MatchSet {
            hits: Vec::new(),
            estimated: total,
        });
    }

    let top = searcher.search(query, &TopDocs::with_limit(limit).and_offset(offset))?;
    let best = if offset == 0 {
        top.first().map(|(score, _)| *score)
    } else {
        searcher
            .search(query, &TopDocs::with_limit(1))?
            .first()
            .map(|(score, _)| *score)
    }
    .unwrap_or(0.0);

    let mut ranked = Vec::with_capacity(top.len());
    for (score, addr) in top {
        let doc: TantivyDocument = searcher.doc(addr)?;
        let Some(key) = stored_key(fields, &doc) else {
            continue;
        };
        let (sort_value, collapse_value) = if plan.sort_slot.is_some() || plan.collapse_slot.is_some() {
            let values = stored_values(fields, &doc);
            let pick = |slot: Option<u32>| {
                slot.and_then(|s| values.get(&s).cloned())
                    .unwrap_or_default()
            };
            (pick(plan.sort_slot), pick(plan.collapse_slot))
        } else {
            (String::new(), String::new())
        };
        ranked.push(Ranked {
            hit: Hit {
                key,
                weight: score,
                percent: percent(score, best),
                collapse_count: 0,
            },
            sort_value,
            collapse_value,
        });
    }

    if plan.sort_slot.is_some() {
        ranked.sort_by(|a, b| {
            let by_value = a.sort_value.cmp(&b.sort_value);
            let by_value = if plan.sort_ascending {
                by_value
            } else {
                by_value.reverse()
            };
            by_value.then_with(|| b.hit.weight.total_cmp(&a.hit.weight))
        });
    }

    let mut hits: Vec<Hit> = Vec::with_capacity(ranked.len());
    if plan.collapse_slot.is_some() {
        let mut kept_at: HashMap<String, usize> = HashMap::new();
        for entry in ranked {
            if entry.collapse_value.is_empty() {
                hits.push(entry.hit);
                continue;
            }
            match kept_at.get(&entry.collapse_value) {
                Some(&idx) => hits[idx].collapse_count += 1,
                None => {
                    kept_at.insert(entry.collapse_value, hits.len());
                    hits.push(entry.hit);
                }
            }
        }
    } else {
        hits.extend(ranked.into_iter().map(|r| r.hit));
    }

    if !whole {
        return Ok(MatchSet {
            hits,
            estimated: total,
        });
    }
    let estimated = hits.len();
    if plan.whole_set {
        return Ok(MatchSet { hits, estimated });
    }
    Ok(MatchSet {
        hits: window(hits, plan.offset, plan.limit),
        estimated,
    })
}

/// `(OR of type tags) AND inner`.
pub(crate) fn restrict_to_types<S: AsRef<str>>(
    fields: &Fields,
    record_types: &[S],
    inner: Option<Box<dyn Query>>,
) -> Box<dyn Query> {
    let models = record_types
        .iter()
        .map(|t| term_query(model_term(fields, t.as_ref())))
        .collect();
    let model_query: Box<dyn Query> = union(models).unwrap_or_else(|| Box::new(AllQuery));
    match inner {
        None => model_query,
        Some(inner) => Box::new(BooleanQuery::new(vec![
            (Occur::Must, model_query),
            (Occur::Must, inner),
        ])),
    }
}

/// Free-text search over a set of record types.
pub struct Search<'a> {
    session: QuerySession<'a>,
    query_string: String,
    spelling_correction: Option<String>,
}

impl<'a> Search<'a> {
    pub(crate) fn new<S: AsRef<str>>(
        index: &'a mut ReadableIndex,
        records: &'a dyn RecordStore,
        record_types: &[S],
        query_string: &str,
        options: SearchOptions,
        eager_load: BTreeMap<String, Vec<String>>,
        extra_filter: Option<Box<dyn Query>>,
    ) -> Result<Self> {
        let (compiled, spelling_correction) = {
            let (searcher, fields, map, analyzer) = index.parts();
            let (user_query, words) = parse_query(query_string, fields, map, analyzer)?;
            let correction = corrected_query_string(searcher, fields.body, query_string, &words)?;
            let inner = match (user_query, extra_filter) {
                (q, None) => q,
                (None, Some(filter)) => Some(filter),
                (Some(q), Some(filter)) => Some(Box::new(BooleanQuery::new(vec![
                    (Occur::Must, q),
                    (Occur::Must, filter),
                ])) as Box<dyn Query>),
            };
            (restrict_to_types(fields, record_types, inner), correction)
        };
        let session = QuerySession::new(
            index,
            records,
            compiled,
            options,
            eager_load,
            format!("Search: {query_string}"),
        )?;
        Ok(Self {
            session,
            query_string: query_string.to_string(),
            spelling_correction,
        })
    }

    pub fn query_string(&self) -> &str {
        &self.query_string
    }

    /// The query string with unknown words replaced by their closest
    /// indexed spelling, if any replacement was made.
    pub fn spelling_correction(&self) -> Option<&str> {
        self.spelling_correction.as_deref()
    }

    /// Plain words of the query, for cheap highlighting.
    pub fn words_to_highlight(&self) -> Vec<String> {
        words_to_highlight(&self.query_string)
    }

    pub fn session(&mut self) -> &mut QuerySession<'a> {
        &mut self.session
    }

    pub fn results(&mut self) -> Result<&[SearchResult]> {
        self.session.results()
    }

    pub fn matches(&mut self) -> Result<&MatchSet> {
        self.session.matches()
    }

    pub fn matches_estimated(&mut self) -> Result<usize> {
        self.session.matches_estimated()
    }

    pub fn description(&self) -> String {
        self.session.description()
    }

    pub fn log_description(&self) -> &str {
        self.session.log_description()
    }

    pub fn runtime(&self) -> Duration {
        self.session.runtime()
    }
}

/// Documents resembling a set of seed documents.
pub struct Similar<'a> {
    session: QuerySession<'a>,
    seeds: Vec<DocKey>,
    expansion_terms: Vec<String>,
}

impl<'a> Similar<'a> {
    pub(crate) fn new<S: AsRef<str>>(
        index: &'a mut ReadableIndex,
        records: &'a dyn RecordStore,
        record_types: &[S],
        seeds: Vec<DocKey>,
        options: SearchOptions,
        eager_load: BTreeMap<String, Vec<String>>,
    ) -> Result<Self> {
        let started = Instant::now();
        let seed_keys: Vec<Term> = {
            let fields = index.fields();
            seeds.iter().map(|key| key_term(fields, key)).collect()
        };
        let seed_query = union(seed_keys.iter().cloned().map(term_query).collect());

        let expansion_terms = match &seed_query {
            None => Vec::new(),
            Some(seed_query) => {
                let excluded: HashSet<String> = seeds.iter().map(DocKey::to_string).collect();
                index.with_retry(|searcher, fields| {
                    relevance_feedback_terms(searcher, fields, seed_query.as_ref(), &excluded)
                })?
            }
        };

        let inner: Option<Box<dyn Query>> = {
            let fields = index.fields();
            let similar = union(
                expansion_terms
                    .iter()
                    .map(|t| term_query(Term::from_field_text(fields.exact_field_for(t), t)))
                    .collect(),
            );
            Some(match (similar, seed_query) {
                (None, _) => Box::new(tantivy::query::EmptyQuery),
                (Some(similar), None) => similar,
                (Some(similar), Some(seed)) => Box::new(BooleanQuery::new(vec![
                    (Occur::Must, similar),
                    (Occur::MustNot, seed),
                ])),
            })
        };
        let query = restrict_to_types(index.fields(), record_types, inner);

        let description = format!(
            "Similar: {}",
            seeds.iter().map(DocKey::to_string).collect::<Vec<_>>().join(", ")
        );
        let mut session = QuerySession::new(index, records, query, options, eager_load, description)?;
        session.runtime += started.elapsed();
        Ok(Self {
            session,
            seeds,
            expansion_terms,
        })
    }

    pub fn seeds(&self) -> &[DocKey] {
        &self.seeds
    }

    /// Terms the similarity query was expanded from, best first.
    pub fn expansion_terms(&self) -> &[String] {
        &self.expansion_terms
    }

    pub fn session(&mut self) -> &mut QuerySession<'a> {
        &mut self.session
    }

    pub fn results(&mut self) -> Result<&[SearchResult]> {
        self.session.results()
    }

    pub fn matches(&mut self) -> Result<&MatchSet> {
        self.session.matches()
    }

    pub fn matches_estimated(&mut self) -> Result<usize> {
        self.session.matches_estimated()
    }

    pub fn description(&self) -> String {
        self.session.description()
    }

    pub fn log_description(&self) -> &str {
        self.session.log_description()
    }

    pub fn runtime(&self) -> Duration {
        self.session.runtime()
    }
}

/// Terms that best separate the documents matching `seed_query` from the
/// rest of the index, weighted by the Robertson/Sparck Jones relevance
/// weight times the number of relevant documents containing the term.
fn relevance_feedback_terms(
    searcher: &Searcher,
    fields: &Fields,
    seed_query: &dyn Query,
    excluded: &HashSet<String>,
) -> Result<Vec<String>> {
    let relevant = searcher.search(seed_query, &TopDocs::with_limit(RELEVANCE_SET_SIZE))?;
    if relevant.is_empty() {
        return Ok(Vec::new());
    }
    let mut containing: HashMap<String, usize> = HashMap::new();
    for (_, addr) in &relevant {
        let doc: TantivyDocument = searcher.doc(*addr)?;
        for term in stored_termvec(fields, &doc).into_keys() {
            *containing.entry(term).or_default() += 1;
        }
    }

    let total_docs = searcher.num_docs() as f64;
    let relevant_docs = relevant.len() as f64;
    let mut weighted = Vec::with_capacity(containing.len());
    for (term, r) in containing {
        if excluded.contains(&term) {
            continue;
        }
        let r = r as f64;
        let n = (searcher.doc_freq(&Term::from_field_text(fields.exact_field_for(&term), &term))? as f64).max(r);
        let ratio = ((r + 0.5) * (total_docs - n - relevant_docs + r + 0.5))
            / ((n - r + 0.5) * (relevant_docs - r + 0.5));
        if ratio <= 1.0 {
            continue;
        }
        weighted.push((r * ratio.ln(), term));
    }
    weighted.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    weighted.truncate(EXPANSION_TERMS);
    Ok(weighted.into_iter().map(|(_, term)| term).collect())
}

/// Closest indexed spelling of `word` within a small edit distance,
/// preferring nearer and then more frequent terms.
pub fn suggest_spelling(searcher: &Searcher, field: Field, word: &str) -> Result<Option<String>> {
    let max_distance = if word.chars().count() <= 4 { 1 } else { 2 };
    let mut best: Option<(usize, u64, String)> = None;
    for segment in searcher.segment_readers() {
        let inverted = segment.inverted_index(field)?;
        let mut stream = inverted.terms().stream()?;
        while stream.advance() {
            let Ok(candidate) = std::str::from_utf8(stream.key()) else {
                continue;
            };
            if candidate.len().abs_diff(word.len()) > max_distance {
                continue;
            }
            let distance = strsim::levenshtein(word, candidate);
            if distance == 0 || distance > max_distance {
                continue;
            }
            let freq = searcher.doc_freq(&Term::from_field_text(field, candidate))?;
            let better = match &best {
                None => true,
                Some((d, f, c)) => (distance, std::cmp::Reverse(freq), candidate) < (*d, std::cmp::Reverse(*f), c.as_str()),
            };
            if better {
                best = Some((distance, freq, candidate.to_string()));
            }
        }
    }
    Ok(best.map(|(_, _, candidate)| candidate))
}

fn corrected_query_string(
    searcher: &Searcher,
    field: Field,
    query_string: &str,
    words: &[String],
) -> Result<Option<String>> {
    let mut corrected = query_string.to_string();
    let mut changed = false;
    for word in words {
        if word.chars().any(|c| c.is_ascii_digit()) {
            continue;
        }
        if searcher.doc_freq(&Term::from_field_text(field, word))? > 0 {
            continue;
        }
        let Some(suggestion) = suggest_spelling(searcher, field, word)? else {
            continue;
        };
        let pattern = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(word)))
            .map_err(|e| Error::InvalidQuery(e.to_string()))?;
        corrected = pattern
            .replace_all(&corrected, suggestion.as_str())
            .into_owned();
        changed = true;
    }
    Ok(changed.then_some(corrected))
}

static NON_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^\w:./]+").expect("query word separator regex")
});

/// Plain words of a query string: operators, field-prefixed terms, ranges
/// and paths are dropped.
pub fn words_to_highlight(query_string: &str) -> Vec<String> {
    NON_WORD
        .replace_all(query_string, " ")
        .split_whitespace()
        .filter(|w| !w.contains([':', '.', '/']))
        .filter(|w| !matches!(*w, "AND" | "NOT" | "OR" | "XOR"))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highlight_words_skip_operators_prefixes_and_ranges() {
        assert_eq!(
            words_to_highlight(r#"rust AND "borrow checker" NOT title:java 2020..2021 src/main.rs (lifetimes)"#),
            vec!["rust", "borrow", "checker", "lifetimes"]
        );
        assert!(words_to_highlight("  ").is_empty());
    }

    #[test]
    fn percent_is_relative_to_the_best_hit() {
        assert_eq!(percent(2.0, 4.0), 50);
        assert_eq!(percent(4.0, 4.0), 100);
        assert_eq!(percent(1.0, 0.0), 100);
    }

    #[test]
    fn windows_apply_offset_then_limit() {
        assert_eq!(window(vec![1, 2, 3, 4], 1, Some(2)), vec![2, 3]);
        assert_eq!(window(vec![1, 2, 3], 5, None), Vec::<i32>::new());
        assert_eq!(window(vec![1, 2, 3], 0, None), vec![1, 2, 3]);
    }

    #[test]
    fn default_options_match_the_documented_defaults() {
        let options = SearchOptions::default();
        assert_eq!(options.offset, 0);
        assert_eq!(options.limit, None);
        assert_eq!(options.check_at_least, 100);
        assert!(options.sort_ascending);
        assert!(!options.find.is_filtering());
    }
}
