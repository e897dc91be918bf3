//! Union controllet: fan-in of several sources without a routing hop.

use crate::core::StageId;
use crate::errors::Result;
use crate::graph::{Graph, StageSpec};
use crate::plug::SourceOptions;
use crate::transactions::ForkTag;

/// Adds a controllet merging `sources`.
///
/// With a `tag`, stages downstream of the union join transactions forked
/// with that tag, completing them once every source branch has terminated.
pub fn union(graph: &mut Graph, name: impl Into<String>, sources: &[StageId], tag: Option<ForkTag>) -> Result<StageId> {
    let id = graph.add_stage_with(StageSpec::controllet(name));
    if tag.is_some() {
        graph.set_join_tag(id, tag)?;
    }
    for &source in sources {
        graph.add_source(id, source, SourceOptions::default())?;
    }
    Ok(id)
}
