//! Request bodies and response shapes for the handful of search endpoints the
//! sync flows touch.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use qbank_sync_core::{BookId, IndexedDocument, ScanFilter, UNRESOLVED_ATTRIBUTE};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const FIELD_BOOK_ID: &str = "KitapId";
pub const FIELD_TEST_ID: &str = "TestId";
pub const FIELD_QUESTION_NO: &str = "SoruNo";
pub const FIELD_COURSE_ID: &str = "DersId";
pub const FIELD_QUESTION_TEXT: &str = "SoruMetin";
pub const FIELD_ATTRIBUTE: &str = "KazanimId";

const BOOK_KEYS_AGG: &str = "book_ids";

const SCAN_SOURCE_FIELDS: [&str; 6] = [
    FIELD_COURSE_ID,
    FIELD_BOOK_ID,
    FIELD_TEST_ID,
    FIELD_QUESTION_NO,
    FIELD_QUESTION_TEXT,
    FIELD_ATTRIBUTE,
];

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Query {
    Bool(BoolQuery),
    Term(BTreeMap<&'static str, i64>),
    Exists { field: &'static str },
}

impl Query {
    fn term(field: &'static str, value: i64) -> Self {
        Self::Term(BTreeMap::from([(field, value)]))
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct BoolQuery {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub filter: Vec<Query>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub should: Vec<Query>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub must_not: Vec<Query>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum_should_match: Option<u32>,
}

/// Attribute is zero or absent, narrowed by the optional course and book.
#[must_use]
pub fn missing_attribute_query(filter: &ScanFilter) -> Query {
    let mut narrowing = Vec::new();
    if let Some(course_id) = filter.course_id {
        narrowing.push(Query::term(FIELD_COURSE_ID, course_id));
    }
    if let Some(book_id) = filter.book_id {
        narrowing.push(Query::term(FIELD_BOOK_ID, book_id.0));
    }

    Query::Bool(BoolQuery {
        filter: narrowing,
        should: vec![
            Query::term(FIELD_ATTRIBUTE, UNRESOLVED_ATTRIBUTE),
            Query::Bool(BoolQuery {
                must_not: vec![Query::Exists {
                    field: FIELD_ATTRIBUTE,
                }],
                ..BoolQuery::default()
            }),
        ],
        minimum_should_match: Some(1),
        ..BoolQuery::default()
    })
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ScanRequest {
    pub size: usize,
    pub sort: [&'static str; 1],
    #[serde(rename = "_source")]
    pub source: [&'static str; 6],
    pub query: Query,
}

impl ScanRequest {
    #[must_use]
    pub fn new(filter: &ScanFilter, batch_size: usize) -> Self {
        Self {
            size: batch_size,
            sort: ["_doc"],
            source: SCAN_SOURCE_FIELDS,
            query: missing_attribute_query(filter),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ScrollRequest<'a> {
    pub scroll: &'a str,
    pub scroll_id: &'a str,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ClearScrollRequest<'a> {
    pub scroll_id: [&'a str; 1],
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CompositeRequest {
    pub size: usize,
    pub aggs: BTreeMap<&'static str, CompositeAggregation>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CompositeAggregation {
    pub composite: CompositeBody,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CompositeBody {
    pub size: usize,
    pub sources: Vec<BTreeMap<&'static str, TermsSource>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<BTreeMap<&'static str, i64>>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TermsSource {
    pub terms: TermsField,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TermsField {
    pub field: &'static str,
}

impl CompositeRequest {
    /// Distinct book ids, `page_size` at a time, resuming after `after`.
    #[must_use]
    pub fn book_keys(after: Option<BookId>, page_size: usize) -> Self {
        let body = CompositeBody {
            size: page_size,
            sources: vec![BTreeMap::from([(
                FIELD_BOOK_ID,
                TermsSource {
                    terms: TermsField {
                        field: FIELD_BOOK_ID,
                    },
                },
            )])],
            after: after.map(|key| BTreeMap::from([(FIELD_BOOK_ID, key.0)])),
        };
        Self {
            size: 0,
            aggs: BTreeMap::from([(BOOK_KEYS_AGG, CompositeAggregation { composite: body })]),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompositeResponse {
    #[serde(default)]
    aggregations: BTreeMap<String, CompositeResult>,
}

#[derive(Debug, Clone, Deserialize)]
struct CompositeResult {
    #[serde(default)]
    buckets: Vec<CompositeBucket>,
    after_key: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Deserialize)]
struct CompositeBucket {
    key: Map<String, Value>,
}

impl CompositeResponse {
    /// Bucket keys in response order plus the continuation key.
    pub fn into_page(self) -> Result<(Vec<BookId>, Option<BookId>)> {
        let Some(result) = self.aggregations.get(BOOK_KEYS_AGG) else {
            return Err(anyhow!("composite response has no '{BOOK_KEYS_AGG}' aggregation"));
        };

        let keys = result
            .buckets
            .iter()
            .map(|bucket| {
                bucket
                    .key
                    .get(FIELD_BOOK_ID)
                    .and_then(lenient_i64)
                    .map(BookId)
                    .ok_or_else(|| anyhow!("composite bucket without a numeric {FIELD_BOOK_ID}"))
            })
            .collect::<Result<Vec<_>>>()?;

        let after_key = match &result.after_key {
            Some(after) => Some(
                after
                    .get(FIELD_BOOK_ID)
                    .and_then(lenient_i64)
                    .map(BookId)
                    .ok_or_else(|| anyhow!("composite after_key without a numeric {FIELD_BOOK_ID}"))?,
            ),
            None => None,
        };
        Ok((keys, after_key))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchResponse {
    #[serde(rename = "_scroll_id")]
    pub scroll_id: Option<String>,
    pub hits: HitsEnvelope,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HitsEnvelope {
    #[serde(default)]
    pub hits: Vec<Hit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Hit {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_source", default)]
    pub source: Map<String, Value>,
}

impl Hit {
    #[must_use]
    pub fn into_document(self) -> IndexedDocument {
        let field = |name: &str| self.source.get(name).and_then(lenient_i64);
        IndexedDocument {
            book_id: field(FIELD_BOOK_ID).map(BookId),
            test_id: field(FIELD_TEST_ID),
            question_no: field(FIELD_QUESTION_NO),
            course_id: field(FIELD_COURSE_ID),
            attribute: field(FIELD_ATTRIBUTE),
            question_text: self
                .source
                .get(FIELD_QUESTION_TEXT)
                .and_then(Value::as_str)
                .map(str::to_string),
            doc_id: self.id,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PartialUpdate {
    pub doc: BTreeMap<&'static str, i64>,
}

impl PartialUpdate {
    #[must_use]
    pub fn attribute(attribute_id: i64) -> Self {
        Self {
            doc: BTreeMap::from([(FIELD_ATTRIBUTE, attribute_id)]),
        }
    }
}

/// Integer view of a source field. Indexed data carries ids as numbers,
/// integral floats or numeric strings depending on the ingest path.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn lenient_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|float| float.fract() == 0.0 && float.abs() < 9.0e15)
                .map(|float| float as i64)
        }),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }
}
