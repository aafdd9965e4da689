// src/index.rs
// Secondary and text indexes over in-memory collections

use crate::dates;
use crate::error::{Result, StoreLensError};
use crate::value_utils::{canonical_json_string, lookup_field};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Name of the implicit unique index on `_id`
pub const ID_INDEX_NAME: &str = "_id_";

// ============================================================================
// KEYS
// ============================================================================

/// Index key - one field value as stored in an index tree
///
/// Numbers share one variant so `1` and `1.0` collide like they do in
/// queries. Timestamp strings are kept as epoch milliseconds so they order
/// chronologically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IndexKey {
    Null,
    Bool(bool),
    Number(OrderedFloat),
    Date(i64),
    String(String),
    /// Objects and nested arrays, by canonical JSON
    Object(String),
}

/// OrderedFloat wrapper for f64 to enable Ord
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderedFloat(pub f64);

impl PartialEq for OrderedFloat {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for OrderedFloat {}

impl std::hash::Hash for OrderedFloat {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        // -0.0 and 0.0 are equal, so they must hash alike
        let normalized = if self.0 == 0.0 { 0.0f64 } else { self.0 };
        normalized.to_bits().hash(state);
    }
}

impl PartialOrd for OrderedFloat {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedFloat {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (self.0.is_nan(), other.0.is_nan()) {
            (true, true) => std::cmp::Ordering::Equal,
            (true, false) => std::cmp::Ordering::Greater,
            (false, true) => std::cmp::Ordering::Less,
            (false, false) => self
                .0
                .partial_cmp(&other.0)
                .unwrap_or(std::cmp::Ordering::Equal),
        }
    }
}

impl From<&Value> for IndexKey {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => IndexKey::Null,
            Value::Bool(b) => IndexKey::Bool(*b),
            Value::Number(n) => n
                .as_f64()
                .map(|f| IndexKey::Number(OrderedFloat(f)))
                .unwrap_or(IndexKey::Null),
            Value::String(s) => match dates::parse_timestamp(s) {
                Some(dt) => IndexKey::Date(dt.timestamp_millis()),
                None => IndexKey::String(s.clone()),
            },
            other => IndexKey::Object(canonical_json_string(other)),
        }
    }
}

impl IndexKey {
    /// Comparison bracket: range predicates only match keys of their own bracket
    fn bracket(&self) -> u8 {
        match self {
            IndexKey::Null => 0,
            IndexKey::Bool(_) => 1,
            IndexKey::Number(_) => 2,
            IndexKey::Date(_) | IndexKey::String(_) => 3,
            IndexKey::Object(_) => 4,
        }
    }

    fn is_date(&self) -> bool {
        matches!(self, IndexKey::Date(_))
    }
}

/// Keys a document contributes for one field: array elements are indexed
/// individually; a missing field indexes as null
fn field_keys(doc: &Value, field: &str) -> Vec<IndexKey> {
    match lookup_field(doc, field).as_deref() {
        None => vec![IndexKey::Null],
        Some(Value::Array(items)) if items.is_empty() => vec![IndexKey::Null],
        Some(Value::Array(items)) => {
            let unique: BTreeSet<IndexKey> = items.iter().map(IndexKey::from).collect();
            unique.into_iter().collect()
        }
        Some(value) => vec![IndexKey::from(value)],
    }
}

/// Tokens for text indexes and `$text` searches: lowercase runs of
/// alphanumeric characters
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}

// ============================================================================
// DEFINITIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    Ascending,
    Descending,
    Text,
    Hashed,
}

impl KeyKind {
    fn from_json(value: &Value) -> Option<KeyKind> {
        match value {
            Value::String(s) if s == "text" => Some(KeyKind::Text),
            Value::String(s) if s == "hashed" => Some(KeyKind::Hashed),
            Value::Number(n) => match n.as_i64() {
                Some(1) => Some(KeyKind::Ascending),
                Some(-1) => Some(KeyKind::Descending),
                _ => None,
            },
            _ => None,
        }
    }

    fn to_json(self) -> Value {
        match self {
            KeyKind::Ascending => json!(1),
            KeyKind::Descending => json!(-1),
            KeyKind::Text => json!("text"),
            KeyKind::Hashed => json!("hashed"),
        }
    }

    fn name_suffix(self) -> &'static str {
        match self {
            KeyKind::Ascending => "1",
            KeyKind::Descending => "-1",
            KeyKind::Text => "text",
            KeyKind::Hashed => "hashed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexField {
    pub field: String,
    pub kind: KeyKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub fields: Vec<IndexField>,
    pub unique: bool,
    pub sparse: bool,
}

impl IndexDefinition {
    /// Index over `[(field, 1 | -1)]`, named like `customer_id_1_order_status_1`
    pub fn new(keys: &[(&str, i32)]) -> Self {
        let fields = keys
            .iter()
            .map(|(field, dir)| IndexField {
                field: field.to_string(),
                kind: if *dir < 0 {
                    KeyKind::Descending
                } else {
                    KeyKind::Ascending
                },
            })
            .collect();
        Self::from_fields(fields)
    }

    /// Text index over string (or string array) fields
    pub fn text(fields: &[&str]) -> Self {
        Self::from_fields(
            fields
                .iter()
                .map(|field| IndexField {
                    field: field.to_string(),
                    kind: KeyKind::Text,
                })
                .collect(),
        )
    }

    pub fn hashed(field: &str) -> Self {
        Self::from_fields(vec![IndexField {
            field: field.to_string(),
            kind: KeyKind::Hashed,
        }])
    }

    fn from_fields(fields: Vec<IndexField>) -> Self {
        IndexDefinition {
            name: default_index_name(&fields),
            fields,
            unique: false,
            sparse: false,
        }
    }

    /// Parse a key pattern such as `{"customer_id": 1, "order_status": 1}`
    /// or `{"product_category_name": "text"}`
    pub fn from_json(keys: &Value) -> Result<Self> {
        let obj = keys.as_object().ok_or_else(|| {
            StoreLensError::IndexError("Index key pattern must be an object".to_string())
        })?;
        if obj.is_empty() {
            return Err(StoreLensError::IndexError(
                "Index key pattern must have at least one field".to_string(),
            ));
        }
        let fields = obj
            .iter()
            .map(|(field, kind)| {
                let kind = KeyKind::from_json(kind).ok_or_else(|| {
                    StoreLensError::IndexError(format!(
                        "Invalid index direction for '{}': {}",
                        field, kind
                    ))
                })?;
                Ok(IndexField {
                    field: field.clone(),
                    kind,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let definition = Self::from_fields(fields);
        definition.validate()?;
        Ok(definition)
    }

    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    pub fn sparse(mut self, sparse: bool) -> Self {
        self.sparse = sparse;
        self
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn is_text(&self) -> bool {
        self.fields.iter().any(|f| f.kind == KeyKind::Text)
    }

    pub fn is_hashed(&self) -> bool {
        self.fields.iter().any(|f| f.kind == KeyKind::Hashed)
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.field.as_str()).collect()
    }

    /// Key pattern as JSON, in field order
    pub fn key_pattern(&self) -> Value {
        let mut keys = Map::new();
        for field in &self.fields {
            keys.insert(field.field.clone(), field.kind.to_json());
        }
        Value::Object(keys)
    }

    pub fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "key": self.key_pattern(),
            "unique": self.unique,
            "sparse": self.sparse,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.fields.iter().any(|f| f.field.is_empty()) {
            return Err(StoreLensError::IndexError(
                "Index field names must not be empty".to_string(),
            ));
        }
        let text_fields = self.fields.iter().filter(|f| f.kind == KeyKind::Text).count();
        if text_fields > 0 && text_fields != self.fields.len() {
            return Err(StoreLensError::IndexError(
                "Text indexes cannot mix text and ordered fields".to_string(),
            ));
        }
        if self.is_hashed() && self.fields.len() > 1 {
            return Err(StoreLensError::IndexError(
                "Hashed indexes take exactly one field".to_string(),
            ));
        }
        if self.is_hashed() && self.unique {
            return Err(StoreLensError::IndexError(
                "Hashed indexes cannot be unique".to_string(),
            ));
        }
        Ok(())
    }

    fn same_keys(&self, other: &IndexDefinition) -> bool {
        self.fields == other.fields
    }
}

fn default_index_name(fields: &[IndexField]) -> String {
    fields
        .iter()
        .map(|f| format!("{}_{}", f.field, f.kind.name_suffix()))
        .collect::<Vec<_>>()
        .join("_")
}

// ============================================================================
// USAGE STATISTICS
// ============================================================================

/// Access counter shared by every scan through one index
#[derive(Debug)]
pub struct UsageStats {
    ops: AtomicU64,
    since: String,
}

impl UsageStats {
    fn new() -> Self {
        UsageStats {
            ops: AtomicU64::new(0),
            since: dates::now_string(),
        }
    }

    pub fn record(&self) {
        self.ops.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn ops(&self) -> u64 {
        self.ops.load(AtomicOrdering::Relaxed)
    }

    pub fn since(&self) -> &str {
        &self.since
    }
}

/// One row of `$indexStats`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexUsage {
    pub name: String,
    pub key: Value,
    pub ops: u64,
    pub since: String,
}

impl IndexUsage {
    pub fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "key": self.key,
            "accesses": {"ops": self.ops, "since": self.since},
        })
    }
}

// ============================================================================
// SECONDARY (ORDERED / HASHED) INDEX
// ============================================================================

/// Predicate on one index field, as produced by the query planner
#[derive(Debug, Clone, PartialEq)]
pub enum KeyPredicate {
    /// Field equals any of these keys
    Eq(Vec<IndexKey>),
    Range {
        lower: Bound<IndexKey>,
        upper: Bound<IndexKey>,
    },
}

/// Record ids (insertion sequence numbers) found by a scan
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanOutcome {
    pub record_ids: BTreeSet<u64>,
    pub keys_examined: u64,
}

fn within(key: &IndexKey, lower: &Bound<IndexKey>, upper: &Bound<IndexKey>) -> bool {
    let bound_key = match (lower, upper) {
        (Bound::Included(k) | Bound::Excluded(k), _) => Some(k),
        (_, Bound::Included(k) | Bound::Excluded(k)) => Some(k),
        _ => None,
    };
    let Some(bound_key) = bound_key else {
        return true;
    };
    if key.bracket() != bound_key.bracket() {
        return false;
    }
    // A date bound against a plain string (or vice versa) is left to the
    // document filter
    if key.is_date() != bound_key.is_date() {
        return true;
    }
    let above = match lower {
        Bound::Included(k) => key >= k,
        Bound::Excluded(k) => key > k,
        Bound::Unbounded => true,
    };
    let below = match upper {
        Bound::Included(k) => key <= k,
        Bound::Excluded(k) => key < k,
        Bound::Unbounded => true,
    };
    above && below
}

#[derive(Debug)]
pub struct SecondaryIndex {
    definition: IndexDefinition,
    entries: BTreeMap<Vec<IndexKey>, BTreeSet<u64>>,
    usage: UsageStats,
}

impl SecondaryIndex {
    pub fn new(definition: IndexDefinition) -> Self {
        SecondaryIndex {
            definition,
            entries: BTreeMap::new(),
            usage: UsageStats::new(),
        }
    }

    /// Every compound key a document contributes (cartesian product over
    /// multikey fields). Sparse indexes skip documents missing all fields.
    fn document_keys(&self, doc: &Value) -> Vec<Vec<IndexKey>> {
        if self.definition.sparse
            && self
                .definition
                .fields
                .iter()
                .all(|f| lookup_field(doc, &f.field).is_none())
        {
            return Vec::new();
        }
        let mut keys: Vec<Vec<IndexKey>> = vec![Vec::new()];
        for field in &self.definition.fields {
            let values = field_keys(doc, &field.field);
            keys = keys
                .into_iter()
                .flat_map(|prefix| {
                    values.iter().map(move |value| {
                        let mut key = prefix.clone();
                        key.push(value.clone());
                        key
                    })
                })
                .collect();
        }
        keys
    }

    /// Unique-constraint check without modifying the index
    pub fn check(&self, record_id: u64, doc: &Value) -> Result<()> {
        if !self.definition.unique {
            return Ok(());
        }
        for key in self.document_keys(doc) {
            if let Some(ids) = self.entries.get(&key) {
                if ids.iter().any(|id| *id != record_id) {
                    return Err(StoreLensError::ConstraintViolation(format!(
                        "E11000 duplicate key error index: {} dup key: {}",
                        self.definition.name,
                        describe_key(&self.definition, doc)
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn insert(&mut self, record_id: u64, doc: &Value) -> Result<()> {
        self.check(record_id, doc)?;
        for key in self.document_keys(doc) {
            self.entries.entry(key).or_default().insert(record_id);
        }
        Ok(())
    }

    pub fn remove(&mut self, record_id: u64, doc: &Value) {
        for key in self.document_keys(doc) {
            if let Some(ids) = self.entries.get_mut(&key) {
                ids.remove(&record_id);
                if ids.is_empty() {
                    self.entries.remove(&key);
                }
            }
        }
    }

    /// Scan with predicates on a leading run of the index fields: equality
    /// predicates first, optionally ending with one range predicate
    pub fn scan(&self, predicates: &[KeyPredicate]) -> ScanOutcome {
        self.usage.record();
        let mut outcome = ScanOutcome::default();

        let mut prefixes: Vec<Vec<IndexKey>> = vec![Vec::new()];
        let mut range = None;
        for predicate in predicates {
            match predicate {
                KeyPredicate::Eq(keys) if range.is_none() => {
                    prefixes = prefixes
                        .into_iter()
                        .flat_map(|prefix| {
                            keys.iter().map(move |key| {
                                let mut next = prefix.clone();
                                next.push(key.clone());
                                next
                            })
                        })
                        .collect();
                }
                KeyPredicate::Range { lower, upper } if range.is_none() => {
                    range = Some((lower, upper));
                }
                _ => break,
            }
        }

        for prefix in prefixes {
            let start = Bound::Included(prefix.clone());
            for (key, ids) in self.entries.range((start, Bound::Unbounded)) {
                if !key.starts_with(&prefix) {
                    break;
                }
                outcome.keys_examined += 1;
                if let Some((lower, upper)) = range {
                    match key.get(prefix.len()) {
                        Some(component) if within(component, lower, upper) => {}
                        _ => continue,
                    }
                }
                outcome.record_ids.extend(ids.iter().copied());
            }
        }
        outcome
    }

    /// Record ids in index order, for sort-covered scans
    pub fn ordered_ids(&self) -> Vec<u64> {
        self.usage.record();
        let mut seen = BTreeSet::new();
        let mut ordered = Vec::new();
        for ids in self.entries.values() {
            for id in ids {
                if seen.insert(*id) {
                    ordered.push(*id);
                }
            }
        }
        ordered
    }

    pub fn definition(&self) -> &IndexDefinition {
        &self.definition
    }

    pub fn key_count(&self) -> usize {
        self.entries.len()
    }
}

fn describe_key(definition: &IndexDefinition, doc: &Value) -> String {
    let mut parts = Map::new();
    for field in &definition.fields {
        let value = lookup_field(doc, &field.field)
            .map(|v| v.into_owned())
            .unwrap_or(Value::Null);
        parts.insert(field.field.clone(), value);
    }
    Value::Object(parts).to_string()
}

// ============================================================================
// TEXT INDEX
// ============================================================================

#[derive(Debug)]
pub struct TextIndex {
    definition: IndexDefinition,
    postings: HashMap<String, BTreeSet<u64>>,
    usage: UsageStats,
}

impl TextIndex {
    pub fn new(definition: IndexDefinition) -> Self {
        TextIndex {
            definition,
            postings: HashMap::new(),
            usage: UsageStats::new(),
        }
    }

    fn document_tokens(&self, doc: &Value) -> BTreeSet<String> {
        let mut tokens = BTreeSet::new();
        for field in &self.definition.fields {
            let Some(value) = lookup_field(doc, &field.field) else {
                continue;
            };
            let texts: Vec<&str> = match value.as_ref() {
                Value::String(s) => vec![s.as_str()],
                Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
                _ => Vec::new(),
            };
            for text in texts {
                tokens.extend(tokenize(text));
            }
        }
        tokens
    }

    pub fn insert(&mut self, record_id: u64, doc: &Value) {
        for token in self.document_tokens(doc) {
            self.postings.entry(token).or_default().insert(record_id);
        }
    }

    pub fn remove(&mut self, record_id: u64, doc: &Value) {
        for token in self.document_tokens(doc) {
            if let Some(ids) = self.postings.get_mut(&token) {
                ids.remove(&record_id);
                if ids.is_empty() {
                    self.postings.remove(&token);
                }
            }
        }
    }

    /// Documents containing any of the terms
    pub fn search(&self, terms: &[String]) -> ScanOutcome {
        self.usage.record();
        let mut outcome = ScanOutcome::default();
        for term in terms {
            if let Some(ids) = self.postings.get(term) {
                outcome.keys_examined += ids.len() as u64;
                outcome.record_ids.extend(ids.iter().copied());
            }
        }
        outcome
    }

    pub fn definition(&self) -> &IndexDefinition {
        &self.definition
    }
}

// ============================================================================
// INDEX MANAGER
// ============================================================================

#[derive(Debug)]
pub enum CollectionIndex {
    Secondary(SecondaryIndex),
    Text(TextIndex),
}

impl CollectionIndex {
    fn new(definition: IndexDefinition) -> Self {
        if definition.is_text() {
            CollectionIndex::Text(TextIndex::new(definition))
        } else {
            CollectionIndex::Secondary(SecondaryIndex::new(definition))
        }
    }

    pub fn definition(&self) -> &IndexDefinition {
        match self {
            CollectionIndex::Secondary(index) => index.definition(),
            CollectionIndex::Text(index) => index.definition(),
        }
    }

    fn usage_stats(&self) -> &UsageStats {
        match self {
            CollectionIndex::Secondary(index) => &index.usage,
            CollectionIndex::Text(index) => &index.usage,
        }
    }

    fn check(&self, record_id: u64, doc: &Value) -> Result<()> {
        match self {
            CollectionIndex::Secondary(index) => index.check(record_id, doc),
            CollectionIndex::Text(_) => Ok(()),
        }
    }

    fn insert(&mut self, record_id: u64, doc: &Value) -> Result<()> {
        match self {
            CollectionIndex::Secondary(index) => index.insert(record_id, doc),
            CollectionIndex::Text(index) => {
                index.insert(record_id, doc);
                Ok(())
            }
        }
    }

    fn remove(&mut self, record_id: u64, doc: &Value) {
        match self {
            CollectionIndex::Secondary(index) => index.remove(record_id, doc),
            CollectionIndex::Text(index) => index.remove(record_id, doc),
        }
    }
}

/// Index Manager - all indexes of one collection, in creation order
#[derive(Debug)]
pub struct IndexManager {
    indexes: Vec<CollectionIndex>,
}

impl IndexManager {
    /// Starts with the unique `_id_` index
    pub fn new() -> Self {
        let id_index = IndexDefinition::new(&[("_id", 1)])
            .named(ID_INDEX_NAME)
            .unique(true);
        IndexManager {
            indexes: vec![CollectionIndex::new(id_index)],
        }
    }

    /// Create and build an index over existing documents
    ///
    /// Returns `false` when an identical index already exists. Fails when the
    /// name or key pattern is taken by a different index, when a second
    /// text index is requested, or when existing documents violate a unique
    /// constraint (nothing is created in that case).
    pub fn create<'a>(
        &mut self,
        definition: IndexDefinition,
        documents: impl Iterator<Item = (u64, &'a Value)>,
    ) -> Result<bool> {
        definition.validate()?;
        for existing in &self.indexes {
            let current = existing.definition();
            if current.name == definition.name {
                if current == &definition {
                    return Ok(false);
                }
                return Err(StoreLensError::IndexError(format!(
                    "An index named '{}' already exists with different options",
                    definition.name
                )));
            }
            if current.same_keys(&definition) {
                return Err(StoreLensError::IndexError(format!(
                    "Index with key pattern {} already exists as '{}'",
                    definition.key_pattern(),
                    current.name
                )));
            }
            if current.is_text() && definition.is_text() {
                return Err(StoreLensError::IndexError(format!(
                    "Collection already has a text index '{}'",
                    current.name
                )));
            }
        }

        let mut index = CollectionIndex::new(definition);
        for (record_id, doc) in documents {
            index.insert(record_id, doc)?;
        }
        self.indexes.push(index);
        Ok(true)
    }

    pub fn drop(&mut self, name: &str) -> Result<IndexDefinition> {
        if name == ID_INDEX_NAME {
            return Err(StoreLensError::IndexError(
                "cannot drop _id index".to_string(),
            ));
        }
        let position = self
            .indexes
            .iter()
            .position(|index| index.definition().name == name)
            .ok_or_else(|| {
                StoreLensError::IndexError(format!("index not found with name [{}]", name))
            })?;
        Ok(self.indexes.remove(position).definition().clone())
    }

    pub fn definitions(&self) -> Vec<IndexDefinition> {
        self.indexes.iter().map(|i| i.definition().clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&CollectionIndex> {
        self.indexes.iter().find(|i| i.definition().name == name)
    }

    pub fn secondary_indexes(&self) -> impl Iterator<Item = &SecondaryIndex> {
        self.indexes.iter().filter_map(|index| match index {
            CollectionIndex::Secondary(secondary) => Some(secondary),
            CollectionIndex::Text(_) => None,
        })
    }

    pub fn text_index(&self) -> Option<&TextIndex> {
        self.indexes.iter().find_map(|index| match index {
            CollectionIndex::Text(text) => Some(text),
            CollectionIndex::Secondary(_) => None,
        })
    }

    pub fn usage(&self) -> Vec<IndexUsage> {
        self.indexes
            .iter()
            .map(|index| {
                let stats = index.usage_stats();
                IndexUsage {
                    name: index.definition().name.clone(),
                    key: index.definition().key_pattern(),
                    ops: stats.ops(),
                    since: stats.since().to_string(),
                }
            })
            .collect()
    }

    /// Check every unique constraint for a new document version
    pub fn check_document(&self, record_id: u64, doc: &Value) -> Result<()> {
        for index in &self.indexes {
            index.check(record_id, doc)?;
        }
        Ok(())
    }

    /// Add a document to every index; nothing is indexed if any check fails
    pub fn insert_document(&mut self, record_id: u64, doc: &Value) -> Result<()> {
        self.check_document(record_id, doc)?;
        for index in &mut self.indexes {
            index.insert(record_id, doc)?;
        }
        Ok(())
    }

    pub fn remove_document(&mut self, record_id: u64, doc: &Value) {
        for index in &mut self.indexes {
            index.remove(record_id, doc);
        }
    }

    /// Swap a document version; on a constraint failure the old version
    /// stays indexed
    pub fn update_document(&mut self, record_id: u64, old: &Value, new: &Value) -> Result<()> {
        self.remove_document(record_id, old);
        if let Err(e) = self.insert_document(record_id, new) {
            // old keys were indexed a moment ago, so re-adding cannot conflict
            let _ = self.insert_document(record_id, old);
            return Err(e);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }
}

impl Default for IndexManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs() -> Vec<(u64, Value)> {
        vec![
            (0, json!({"_id": "a", "customer_id": "c1", "order_status": "delivered", "total": 10})),
            (1, json!({"_id": "b", "customer_id": "c1", "order_status": "canceled", "total": 25.5})),
            (2, json!({"_id": "c", "customer_id": "c2", "order_status": "delivered", "total": 40})),
            (3, json!({"_id": "d", "customer_id": "c3", "tags": ["gift", "promo"]})),
        ]
    }

    fn manager_with(definition: IndexDefinition) -> IndexManager {
        let docs = docs();
        let mut manager = IndexManager::new();
        for (id, doc) in &docs {
            manager.insert_document(*id, doc).unwrap();
        }
        manager
            .create(definition, docs.iter().map(|(id, d)| (*id, d)))
            .unwrap();
        manager
    }

    fn secondary<'a>(manager: &'a IndexManager, name: &str) -> &'a SecondaryIndex {
        match manager.get(name) {
            Some(CollectionIndex::Secondary(index)) => index,
            _ => panic!("missing secondary index {}", name),
        }
    }

    #[test]
    fn test_default_names_and_pattern() {
        let def = IndexDefinition::new(&[("customer_id", 1), ("order_status", -1)]);
        assert_eq!(def.name, "customer_id_1_order_status_-1");
        assert_eq!(def.key_pattern(), json!({"customer_id": 1, "order_status": -1}));
        assert_eq!(IndexDefinition::text(&["product_category_name"]).name, "product_category_name_text");
        assert_eq!(IndexDefinition::hashed("_id").name, "_id_hashed");
    }

    #[test]
    fn test_from_json() {
        let def = IndexDefinition::from_json(&json!({"order_id": 1, "order_item_id": 1})).unwrap();
        assert_eq!(def.field_names(), vec!["order_id", "order_item_id"]);
        assert!(IndexDefinition::from_json(&json!({"a": 2})).is_err());
        assert!(IndexDefinition::from_json(&json!({})).is_err());
        assert!(IndexDefinition::from_json(&json!({"a": "text", "b": 1})).is_err());
    }

    #[test]
    fn test_compound_equality_scan() {
        let manager = manager_with(IndexDefinition::new(&[("customer_id", 1), ("order_status", 1)]));
        let index = secondary(&manager, "customer_id_1_order_status_1");
        let outcome = index.scan(&[
            KeyPredicate::Eq(vec![IndexKey::from(&json!("c1"))]),
            KeyPredicate::Eq(vec![IndexKey::from(&json!("delivered"))]),
        ]);
        assert_eq!(outcome.record_ids.into_iter().collect::<Vec<_>>(), vec![0]);
        assert_eq!(outcome.keys_examined, 1);
        assert_eq!(index.usage.ops(), 1);
    }

    #[test]
    fn test_prefix_and_range_scan() {
        let manager = manager_with(IndexDefinition::new(&[("total", 1)]));
        let index = secondary(&manager, "total_1");
        let outcome = index.scan(&[KeyPredicate::Range {
            lower: Bound::Excluded(IndexKey::from(&json!(10))),
            upper: Bound::Unbounded,
        }]);
        assert_eq!(outcome.record_ids.into_iter().collect::<Vec<_>>(), vec![1, 2]);

        // Numbers and strings live in different brackets
        let outcome = index.scan(&[KeyPredicate::Range {
            lower: Bound::Unbounded,
            upper: Bound::Included(IndexKey::from(&json!(100))),
        }]);
        assert_eq!(outcome.record_ids.len(), 3);
    }

    #[test]
    fn test_multikey_and_missing_fields() {
        let manager = manager_with(IndexDefinition::new(&[("tags", 1)]));
        let index = secondary(&manager, "tags_1");
        let outcome = index.scan(&[KeyPredicate::Eq(vec![IndexKey::from(&json!("promo"))])]);
        assert_eq!(outcome.record_ids.into_iter().collect::<Vec<_>>(), vec![3]);
        let outcome = index.scan(&[KeyPredicate::Eq(vec![IndexKey::Null])]);
        assert_eq!(outcome.record_ids.len(), 3);
    }

    #[test]
    fn test_unique_violation_on_create_and_insert() {
        let docs = docs();
        let mut manager = IndexManager::new();
        let result = manager.create(
            IndexDefinition::new(&[("customer_id", 1)]).unique(true),
            docs.iter().map(|(id, d)| (*id, d)),
        );
        assert!(matches!(result, Err(StoreLensError::ConstraintViolation(_))));
        assert_eq!(manager.len(), 1);

        manager.insert_document(0, &docs[0].1).unwrap();
        let dup = json!({"_id": "a", "customer_id": "zz"});
        let err = manager.insert_document(9, &dup).unwrap_err();
        assert!(err.to_string().contains("duplicate key"));
    }

    #[test]
    fn test_update_document_restores_on_failure() {
        let docs = docs();
        let mut manager = IndexManager::new();
        manager
            .create(IndexDefinition::new(&[("customer_id", 1)]).unique(true).named("cust"), std::iter::empty())
            .unwrap();
        manager.insert_document(0, &docs[0].1).unwrap();
        manager.insert_document(2, &docs[2].1).unwrap();

        let clash = json!({"_id": "a", "customer_id": "c2"});
        assert!(manager.update_document(0, &docs[0].1, &clash).is_err());
        let outcome = secondary(&manager, "cust").scan(&[KeyPredicate::Eq(vec![IndexKey::from(&json!("c1"))])]);
        assert_eq!(outcome.record_ids.len(), 1);
    }

    #[test]
    fn test_create_is_idempotent_and_rejects_conflicts() {
        let mut manager = IndexManager::new();
        let def = IndexDefinition::new(&[("order_id", 1)]);
        assert!(manager.create(def.clone(), std::iter::empty()).unwrap());
        assert!(!manager.create(def.clone(), std::iter::empty()).unwrap());
        assert!(manager.create(def.clone().unique(true), std::iter::empty()).is_err());
        assert!(manager.create(def.named("other"), std::iter::empty()).is_err());
    }

    #[test]
    fn test_drop_index() {
        let mut manager = IndexManager::new();
        manager.create(IndexDefinition::new(&[("a", 1)]), std::iter::empty()).unwrap();
        assert_eq!(manager.drop("a_1").unwrap().name, "a_1");
        assert!(manager.drop("a_1").unwrap_err().to_string().contains("index not found"));
        assert!(manager.drop(ID_INDEX_NAME).is_err());
    }

    #[test]
    fn test_text_index_search() {
        let mut manager = IndexManager::new();
        manager
            .create(IndexDefinition::text(&["product_category_name"]), std::iter::empty())
            .unwrap();
        manager.insert_document(0, &json!({"_id": 1, "product_category_name": "cama_mesa_banho"})).unwrap();
        manager.insert_document(1, &json!({"_id": 2, "product_category_name": "esporte_lazer"})).unwrap();

        let text = manager.text_index().unwrap();
        let outcome = text.search(&tokenize("Banho lazer"));
        assert_eq!(outcome.record_ids.into_iter().collect::<Vec<_>>(), vec![0, 1]);
        assert!(manager.create(IndexDefinition::text(&["other"]), std::iter::empty()).is_err());
    }

    #[test]
    fn test_dates_are_chronological_keys() {
        let a = IndexKey::from(&json!("2018-01-02 00:00:00"));
        let b = IndexKey::from(&json!("2018-01-10T00:00:00Z"));
        assert!(a < b);
        assert_eq!(IndexKey::from(&json!(1)), IndexKey::from(&json!(1.0)));
    }
}
