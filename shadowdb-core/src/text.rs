// src/text.rs
//! Text search over a collection's text index
//!
//! The search string is split into positive terms, quoted phrases and
//! `-`-negated terms or phrases. A term index (token to posting list) is
//! built over the text-indexed fields of the candidate documents, and every
//! document matching at least one positive item and no negated item is
//! returned, best score first.

use ahash::{AHashMap, AHashSet};
use serde::Serialize;
use std::collections::BTreeSet;

use crate::document::Document;
use crate::error::{codes, Result, ShadowDbError};
use crate::path;
use crate::projection::Projection;
use crate::query::matches_filter;
use crate::value::Value;
use crate::log_trace;

/// Weight of a single matched token
const TOKEN_WEIGHT: f64 = 0.75;

/// Lower-case and split on anything that is not a letter or digit
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// One search item: a single term or a quoted phrase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextItem {
    tokens: Vec<String>,
}

impl TextItem {
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn score(&self) -> f64 {
        TOKEN_WEIGHT * self.tokens.len() as f64
    }
}

/// Parsed search string
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextQuery {
    positive: Vec<TextItem>,
    negated: Vec<TextItem>,
}

impl TextQuery {
    /// Parse `aaa -bbb "a phrase" -"negated phrase"`
    pub fn parse(search: &str) -> Self {
        let mut query = TextQuery::default();
        let mut chars = search.chars().peekable();

        while let Some(&c) = chars.peek() {
            if c.is_whitespace() {
                chars.next();
                continue;
            }
            let negated = c == '-';
            if negated {
                chars.next();
            }
            let raw: String = if chars.peek() == Some(&'"') {
                chars.next();
                let phrase: String = chars.by_ref().take_while(|&c| c != '"').collect();
                phrase
            } else {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                word
            };

            let tokens = tokenize(&raw);
            if tokens.is_empty() {
                continue;
            }
            let item = TextItem { tokens };
            let bucket = if negated { &mut query.negated } else { &mut query.positive };
            if !bucket.contains(&item) {
                bucket.push(item);
            }
        }

        query
    }

    pub fn positive(&self) -> &[TextItem] {
        &self.positive
    }

    pub fn negated(&self) -> &[TextItem] {
        &self.negated
    }
}

/// Inverted index over the text fields of a document set
///
/// Token sequences are kept per field value so phrases never match across
/// two separate strings.
#[derive(Debug, Default)]
pub struct TermIndex {
    postings: AHashMap<String, BTreeSet<usize>>,
    sequences: Vec<Vec<Vec<String>>>,
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

impl TermIndex {
    pub fn build<'a>(docs: impl IntoIterator<Item = &'a Document>, fields: &[String]) -> Self {
        let mut index = TermIndex::default();
        for (position, doc) in docs.into_iter().enumerate() {
            let mut strings = Vec::new();
            for field in fields {
                for value in path::resolve(doc, field) {
                    collect_strings(value, &mut strings);
                }
            }
            let sequences: Vec<Vec<String>> = strings.into_iter().map(tokenize).collect();
            for token in sequences.iter().flatten() {
                index.postings.entry(token.clone()).or_default().insert(position);
            }
            index.sequences.push(sequences);
        }
        index
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Positions of documents containing the item
    pub fn matching(&self, item: &TextItem) -> BTreeSet<usize> {
        let mut tokens = item.tokens.iter();
        let Some(first) = tokens.next() else {
            return BTreeSet::new();
        };
        let mut candidates = self.postings.get(first).cloned().unwrap_or_default();
        for token in tokens {
            let postings = self.postings.get(token);
            candidates.retain(|pos| postings.is_some_and(|p| p.contains(pos)));
        }
        if item.tokens.len() == 1 {
            return candidates;
        }
        candidates
            .into_iter()
            .filter(|&pos| {
                self.sequences[pos]
                    .iter()
                    .any(|seq| seq.windows(item.tokens.len()).any(|w| w == item.tokens.as_slice()))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TextStats {
    pub nscanned_objects: i64,
    pub nscanned: i64,
    pub n: i64,
    pub time_micros: i32,
}

/// Result of a text search, in the server's reply shape
#[derive(Debug, Clone, PartialEq)]
pub struct TextSearchResult {
    pub language: String,
    pub results: Vec<(f64, Document)>,
    pub stats: TextStats,
}

impl TextSearchResult {
    /// `{language, results: [{score, obj}], stats, ok: 1}`
    pub fn to_document(&self) -> Document {
        let results = self
            .results
            .iter()
            .map(|(score, obj)| {
                let mut entry = Document::new();
                entry.insert("score", *score);
                entry.insert("obj", obj.clone());
                Value::Object(entry)
            })
            .collect::<Vec<_>>();

        let mut stats = Document::new();
        stats.insert("nscannedObjects", self.stats.nscanned_objects);
        stats.insert("nscanned", self.stats.nscanned);
        stats.insert("n", self.stats.n);
        stats.insert("timeMicros", self.stats.time_micros);

        let mut reply = Document::new();
        reply.insert("language", self.language.clone());
        reply.insert("results", results);
        reply.insert("stats", stats);
        reply.insert("ok", 1);
        reply
    }
}

/// Options of one text search call
#[derive(Debug, Clone, Default)]
pub struct TextSearchOptions {
    pub filter: Option<Document>,
    /// 0 means unlimited
    pub limit: usize,
    pub projection: Option<Document>,
}

/// Run a text search over `docs`
///
/// `fields` are the text-indexed paths; `None` means the collection has no
/// text index, which is a command failure.
pub fn search<'a>(
    docs: impl IntoIterator<Item = &'a Document>,
    fields: Option<&[String]>,
    search: &str,
    options: &TextSearchOptions,
) -> Result<TextSearchResult> {
    let fields = fields.ok_or_else(|| {
        ShadowDbError::command(codes::TEXT_INDEX_REQUIRED, "text index required for $text query")
    })?;
    let projection = options.projection.as_ref().map(Projection::parse).transpose()?;

    let mut candidates = Vec::new();
    for doc in docs {
        let keep = match &options.filter {
            Some(filter) => matches_filter(doc, filter)?,
            None => true,
        };
        if keep {
            candidates.push(doc);
        }
    }

    let query = TextQuery::parse(search);
    let index = TermIndex::build(candidates.iter().copied(), fields);

    let mut stats = TextStats {
        time_micros: 1,
        ..TextStats::default()
    };
    let mut scores: Vec<Option<f64>> = vec![None; index.len()];
    for item in &query.positive {
        let matched = index.matching(item);
        stats.nscanned += matched.len() as i64;
        for pos in matched {
            let score = scores[pos].get_or_insert(0.0);
            *score = score.max(item.score());
        }
    }
    stats.nscanned_objects = stats.nscanned;

    let mut excluded = AHashSet::new();
    for item in &query.negated {
        let matched = index.matching(item);
        stats.nscanned_objects += matched.len() as i64;
        excluded.extend(matched);
    }

    let mut ranked: Vec<(usize, f64)> = scores
        .into_iter()
        .enumerate()
        .filter_map(|(pos, score)| score.map(|s| (pos, s)))
        .filter(|(pos, _)| !excluded.contains(pos))
        .collect();
    // Stable: equal scores keep collection order
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    if options.limit > 0 {
        ranked.truncate(options.limit);
    }
    log_trace!("text search '{}' ranked {} documents", search, ranked.len());

    let mut results = Vec::with_capacity(ranked.len());
    for (pos, score) in ranked {
        let doc = candidates[pos];
        let obj = match &projection {
            Some(p) => p.apply(doc)?,
            None => doc.clone(),
        };
        results.push((score, obj));
    }
    stats.n = results.len() as i64;

    Ok(TextSearchResult {
        language: "english".to_string(),
        results,
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn docs(values: serde_json::Value) -> Vec<Document> {
        values
            .as_array()
            .unwrap()
            .iter()
            .map(|v| Document::from_json(v).unwrap())
            .collect()
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("Tomorrow, and  TOMORROW!"), vec!["tomorrow", "and", "tomorrow"]);
        assert_eq!(tokenize("яяя-abc"), vec!["яяя", "abc"]);
        assert!(tokenize(" ,. ").is_empty());
    }

    #[test]
    fn test_parse_query() {
        let q = TextQuery::parse(r#"aaa bbb -ccc "abc def" -"x y" aaa"#);
        let pos: Vec<_> = q.positive().iter().map(|i| i.tokens().join(" ")).collect();
        let neg: Vec<_> = q.negated().iter().map(|i| i.tokens().join(" ")).collect();
        assert_eq!(pos, vec!["aaa", "bbb", "abc def"]);
        assert_eq!(neg, vec!["ccc", "x y"]);
    }

    #[test]
    fn test_phrase_requires_consecutive_tokens() {
        let d = docs(json!([
            {"t": "abc def"},
            {"t": "def abc"},
            {"t": ["abc", "def"]}
        ]));
        let index = TermIndex::build(&d, &["t".to_string()]);
        let phrase = TextQuery::parse(r#""abc def""#).positive()[0].clone();
        assert_eq!(index.matching(&phrase).into_iter().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_whole_word_only() {
        let d = docs(json!([{"t": "aaaaaaa"}, {"t": "aaa"}]));
        let index = TermIndex::build(&d, &["t".to_string()]);
        let term = TextQuery::parse("aaa").positive()[0].clone();
        assert_eq!(index.matching(&term).into_iter().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_search_requires_text_index() {
        let d = docs(json!([{"t": "x"}]));
        let err = search(&d, None, "x", &TextSearchOptions::default()).unwrap_err();
        assert_eq!(err.code(), 17007);
    }

    #[test]
    fn test_filter_and_limit() {
        let d = docs(json!([
            {"_id": 1, "t": "apple pie", "k": 1},
            {"_id": 2, "t": "apple tart", "k": 2},
            {"_id": 3, "t": "apple crumble", "k": 2}
        ]));
        let fields = vec!["t".to_string()];
        let options = TextSearchOptions {
            filter: Some(Document::from_json(&json!({"k": 2})).unwrap()),
            limit: 1,
            projection: None,
        };
        let result = search(&d, Some(&fields), "apple", &options).unwrap();
        assert_eq!(result.results.len(), 1);
        assert_eq!(result.results[0].1.id(), Some(&Value::Int32(2)));
        assert_eq!(result.stats.nscanned, 2);
        assert_eq!(result.stats.n, 1);
    }

    #[test]
    fn test_reply_shape() {
        let result = TextSearchResult {
            language: "english".into(),
            results: vec![(0.75, Document::from_json(&json!({"_id": 1})).unwrap())],
            stats: TextStats { nscanned_objects: 1, nscanned: 1, n: 1, time_micros: 1 },
        };
        assert_eq!(
            result.to_document().to_json(),
            json!({
                "language": "english",
                "results": [{"score": 0.75, "obj": {"_id": 1}}],
                "stats": {"nscannedObjects": 1, "nscanned": 1, "n": 1, "timeMicros": 1},
                "ok": 1
            })
        );
        assert_eq!(
            serde_json::to_value(result.stats).unwrap(),
            json!({"nscannedObjects": 1, "nscanned": 1, "n": 1, "timeMicros": 1})
        );
    }
}
