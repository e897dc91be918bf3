//! Query terms, reference-counted queries and compiled matchers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An AND-expression: a value matches when every key equals the term's value.
///
/// The empty term matches everything.
pub type Term = serde_json::Map<String, Value>;

/// Returns true if `value` satisfies every key of `term`.
#[must_use]
pub fn term_matches(term: &Term, value: &Value) -> bool {
    if term.is_empty() {
        return true;
    }
    let Some(object) = value.as_object() else {
        return false;
    };
    term.iter().all(|(key, expected)| object.get(key) == Some(expected))
}

/// A subscription diff: terms removed, then terms added.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryChanges {
    /// Terms no longer wanted.
    #[serde(default)]
    pub removes: Vec<Term>,
    /// Terms newly wanted.
    #[serde(default)]
    pub adds: Vec<Term>,
}

impl QueryChanges {
    /// Creates a diff.
    #[must_use]
    pub fn new(removes: Vec<Term>, adds: Vec<Term>) -> Self {
        Self { removes, adds }
    }

    /// A diff that only adds terms.
    #[must_use]
    pub fn adding(adds: Vec<Term>) -> Self {
        Self::new(Vec::new(), adds)
    }

    /// A diff that only removes terms.
    #[must_use]
    pub fn removing(removes: Vec<Term>) -> Self {
        Self::new(removes, Vec::new())
    }

    /// Returns true if the diff changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.removes.is_empty() && self.adds.is_empty()
    }

    /// Returns the diff undoing this one.
    #[must_use]
    pub fn inverse(&self) -> Self {
        Self::new(self.adds.clone(), self.removes.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
struct CountedTerm {
    term: Term,
    count: usize,
}

/// An ordered OR of AND-terms with reference counts.
///
/// Adding a term already present only bumps its count, and removing only
/// retracts it once the count drops to zero. The changes that actually
/// altered the set of terms accumulate until [`Query::discard_operations`]
/// returns them as a minimal diff.
#[derive(Debug, Clone, Default)]
pub struct Query {
    terms: Vec<CountedTerm>,
    pending: QueryChanges,
}

impl Query {
    /// Creates an empty query, matching nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The query matching everything.
    #[must_use]
    pub fn pass_all() -> Self {
        Self::from_terms(vec![Term::new()])
    }

    /// Builds a query from terms, with no pending operations.
    #[must_use]
    pub fn from_terms(terms: Vec<Term>) -> Self {
        let mut query = Self::new();
        query.add(&terms);
        query.discard_operations();
        query
    }

    /// Adds terms.
    pub fn add(&mut self, terms: &[Term]) -> &mut Self {
        for term in terms {
            if let Some(existing) = self.terms.iter_mut().find(|t| &t.term == term) {
                existing.count += 1;
                continue;
            }
            self.terms.push(CountedTerm {
                term: term.clone(),
                count: 1,
            });
            if let Some(pos) = self.pending.removes.iter().position(|t| t == term) {
                self.pending.removes.remove(pos);
            } else {
                self.pending.adds.push(term.clone());
            }
        }
        self
    }

    /// Removes terms. Terms not present are ignored.
    pub fn remove(&mut self, terms: &[Term]) -> &mut Self {
        for term in terms {
            let Some(pos) = self.terms.iter().position(|t| &t.term == term) else {
                tracing::trace!(term = %serde_json::Value::Object(term.clone()), "removing absent query term");
                continue;
            };
            self.terms[pos].count -= 1;
            if self.terms[pos].count > 0 {
                continue;
            }
            self.terms.remove(pos);
            if let Some(pending) = self.pending.adds.iter().position(|t| t == term) {
                self.pending.adds.remove(pending);
            } else {
                self.pending.removes.push(term.clone());
            }
        }
        self
    }

    /// Applies a diff: adds first, so a same-batch replacement never drops
    /// a term to zero.
    pub fn apply(&mut self, changes: &QueryChanges) -> &mut Self {
        self.add(&changes.adds);
        self.remove(&changes.removes)
    }

    /// Returns the net changes since the last call, and resets them.
    pub fn discard_operations(&mut self) -> QueryChanges {
        std::mem::take(&mut self.pending)
    }

    /// ANDs two queries: every pair of terms merged, conflicting pairs dropped.
    #[must_use]
    pub fn and(&self, other: &Self) -> Self {
        let mut merged = Vec::new();
        for left in &self.terms {
            for right in &other.terms {
                let conflict = right
                    .term
                    .iter()
                    .any(|(key, value)| left.term.get(key).is_some_and(|v| v != value));
                if conflict {
                    continue;
                }
                let mut term = left.term.clone();
                term.extend(right.term.clone());
                if !merged.contains(&term) {
                    merged.push(term);
                }
            }
        }
        Self::from_terms(merged)
    }

    /// Returns the diff turning `self` into `other`.
    #[must_use]
    pub fn differences(&self, other: &Self) -> QueryChanges {
        let removes = self
            .terms
            .iter()
            .filter(|t| !other.contains(&t.term))
            .map(|t| t.term.clone())
            .collect();
        let adds = other
            .terms
            .iter()
            .filter(|t| !self.contains(&t.term))
            .map(|t| t.term.clone())
            .collect();
        QueryChanges::new(removes, adds)
    }

    /// Compiles the query into a matcher.
    #[must_use]
    pub fn generate(&self) -> Matcher {
        Matcher {
            terms: self.terms(),
        }
    }

    /// Returns the distinct terms, in insertion order.
    #[must_use]
    pub fn terms(&self) -> Vec<Term> {
        self.terms.iter().map(|t| t.term.clone()).collect()
    }

    /// Returns every term repeated by its reference count.
    ///
    /// Removing these terms empties the query.
    #[must_use]
    pub fn counted_terms(&self) -> Vec<Term> {
        self.terms
            .iter()
            .flat_map(|t| std::iter::repeat(t.term.clone()).take(t.count))
            .collect()
    }

    /// Returns true if the term is present.
    #[must_use]
    pub fn contains(&self, term: &Term) -> bool {
        self.terms.iter().any(|t| &t.term == term)
    }

    /// Returns the reference count of a term.
    #[must_use]
    pub fn count(&self, term: &Term) -> usize {
        self.terms.iter().find(|t| &t.term == term).map_or(0, |t| t.count)
    }

    /// Returns the number of distinct terms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.terms.len()
    }

    /// Returns true if the query matches nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Returns true if the query contains the empty term.
    #[must_use]
    pub fn is_pass_all(&self) -> bool {
        self.terms.iter().any(|t| t.term.is_empty())
    }

    /// Renders the distinct terms as JSON, for diagnostics.
    #[must_use]
    pub fn describe(&self) -> String {
        Value::Array(self.terms().into_iter().map(Value::Object).collect()).to_string()
    }
}

impl PartialEq for Query {
    /// Structural equality: same terms with the same counts, in any order.
    fn eq(&self, other: &Self) -> bool {
        self.terms.len() == other.terms.len()
            && self.terms.iter().all(|t| other.count(&t.term) == t.count)
    }
}

/// A compiled query, testing values for membership.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Matcher {
    terms: Vec<Term>,
}

impl Matcher {
    /// Returns true if the value matches any term.
    #[must_use]
    pub fn matches(&self, value: &Value) -> bool {
        self.terms.iter().any(|term| term_matches(term, value))
    }

    /// Returns the matching values.
    #[must_use]
    pub fn filter(&self, values: &[Value]) -> Vec<Value> {
        values.iter().filter(|v| self.matches(v)).cloned().collect()
    }

    /// Keeps the matching values, consuming the input.
    #[must_use]
    pub fn retain(&self, mut values: Vec<Value>) -> Vec<Value> {
        values.retain(|v| self.matches(v));
        values
    }

    /// Returns true if nothing can match.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn term(value: Value) -> Term {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_term_matching() {
        assert!(term_matches(&term(json!({})), &json!(42)));
        assert!(term_matches(&term(json!({"type": "a"})), &json!({"type": "a", "id": 1})));
        assert!(!term_matches(&term(json!({"type": "a"})), &json!({"type": "b"})));
        assert!(!term_matches(&term(json!({"type": "a"})), &json!("a")));
    }

    #[test]
    fn test_add_reports_minimal_diff() {
        let mut query = Query::new();
        query.add(&[term(json!({"type": "a"}))]);
        query.add(&[term(json!({"type": "a"})), term(json!({"type": "b"}))]);

        let changes = query.discard_operations();
        assert_eq!(changes.adds, vec![term(json!({"type": "a"})), term(json!({"type": "b"}))]);
        assert!(changes.removes.is_empty());
        assert_eq!(query.count(&term(json!({"type": "a"}))), 2);
    }

    #[test]
    fn test_remove_only_at_zero_count() {
        let mut query = Query::from_terms(vec![term(json!({"type": "a"})), term(json!({"type": "a"}))]);

        query.remove(&[term(json!({"type": "a"}))]);
        assert!(query.discard_operations().is_empty());

        query.remove(&[term(json!({"type": "a"}))]);
        assert_eq!(query.discard_operations().removes, vec![term(json!({"type": "a"}))]);
        assert!(query.is_empty());
    }

    #[test]
    fn test_add_then_remove_cancels_out() {
        let mut query = Query::new();
        query.add(&[term(json!({"x": 1}))]);
        query.remove(&[term(json!({"x": 1}))]);
        assert!(query.discard_operations().is_empty());
    }

    #[test]
    fn test_remove_absent_is_ignored() {
        let mut query = Query::new();
        query.remove(&[term(json!({"x": 1}))]);
        assert!(query.discard_operations().is_empty());
    }

    #[test]
    fn test_apply_replacement_keeps_term() {
        let mut query = Query::from_terms(vec![term(json!({"x": 1}))]);
        query.apply(&QueryChanges::new(vec![term(json!({"x": 1}))], vec![term(json!({"x": 1}))]));
        assert!(query.discard_operations().is_empty());
        assert_eq!(query.count(&term(json!({"x": 1}))), 1);
    }

    #[test]
    fn test_and_merges_and_drops_conflicts() {
        let left = Query::from_terms(vec![term(json!({"type": "a"})), term(json!({"type": "b"}))]);
        let right = Query::from_terms(vec![term(json!({"type": "a", "v": 1}))]);

        let and = left.and(&right);
        assert_eq!(and.terms(), vec![term(json!({"type": "a", "v": 1}))]);
    }

    #[test]
    fn test_differences() {
        let left = Query::from_terms(vec![term(json!({"a": 1})), term(json!({"b": 1}))]);
        let right = Query::from_terms(vec![term(json!({"b": 1})), term(json!({"c": 1}))]);

        let diff = left.differences(&right);
        assert_eq!(diff.removes, vec![term(json!({"a": 1}))]);
        assert_eq!(diff.adds, vec![term(json!({"c": 1}))]);
    }

    #[test]
    fn test_generate_filter() {
        let matcher = Query::from_terms(vec![term(json!({"type": "a"}))]).generate();
        let values = vec![json!({"type": "a"}), json!({"type": "b"})];
        assert_eq!(matcher.filter(&values), vec![json!({"type": "a"})]);
        assert!(Query::new().generate().is_empty());
        assert!(Query::pass_all().generate().matches(&json!({"anything": true})));
    }

    #[test]
    fn test_structural_equality_ignores_order() {
        let left = Query::from_terms(vec![term(json!({"a": 1})), term(json!({"b": 1}))]);
        let right = Query::from_terms(vec![term(json!({"b": 1})), term(json!({"a": 1}))]);
        assert_eq!(left, right);
        assert_ne!(left, Query::pass_all());
    }

    #[test]
    fn test_counted_terms_empty_the_query() {
        let mut query = Query::from_terms(vec![term(json!({"a": 1})), term(json!({"a": 1})), term(json!({"b": 2}))]);
        let all = query.counted_terms();
        assert_eq!(all.len(), 3);
        query.remove(&all);
        assert!(query.is_empty());
    }
}
