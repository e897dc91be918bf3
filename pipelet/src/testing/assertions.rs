//! Test assertions for graph state and recorded deliveries.

use super::Recording;
use crate::core::StageId;
use crate::graph::Graph;
use serde_json::Value;

/// Asserts that a stage's acknowledged query caught up with its future
/// query.
pub fn assert_query_settled(graph: &Graph, stage: StageId) {
    let (Ok(query), Ok(future)) = (graph.query(stage), graph.future_query(stage)) else {
        panic!("unknown stage {stage}");
    };
    assert!(
        query == future,
        "query of {stage} not settled: acknowledged {}, wanted {}",
        query.describe(),
        future.describe()
    );
}

/// Asserts that exactly one delivery ended a transaction.
pub fn assert_single_terminal(recording: &Recording) {
    let terminals = recording.terminal_count();
    assert_eq!(terminals, 1, "expected one terminal delivery, got {terminals}");
}

/// Asserts the values added to a recorder, in any order.
pub fn assert_added(recording: &Recording, expected: &[Value]) {
    assert_unordered_eq(&recording.added(), expected);
}

/// Asserts two value lists hold the same values, ignoring order.
pub fn assert_unordered_eq(actual: &[Value], expected: &[Value]) {
    let mut actual: Vec<String> = actual.iter().map(Value::to_string).collect();
    let mut expected: Vec<String> = expected.iter().map(Value::to_string).collect();
    actual.sort();
    expected.sort();
    assert_eq!(actual, expected, "values differ");
}
