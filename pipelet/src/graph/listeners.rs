//! Local listeners attached to plugs.

use super::Graph;
use crate::core::{Operation, OperationKind, Options, PlugRef, StageId};
use crate::errors::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a listener is notified of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlugEventKind {
    /// An output emitted added values.
    Add,
    /// An output emitted removed values.
    Remove,
    /// An output emitted updates.
    Update,
    /// An output emitted a clear.
    Clear,
    /// An output emitted the terminal step of a transaction.
    Complete,
    /// An input is about to detach a source.
    RemoveSource,
    /// An output lost its last destination.
    Disconnected,
}

impl From<OperationKind> for PlugEventKind {
    fn from(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Add => Self::Add,
            OperationKind::Remove => Self::Remove,
            OperationKind::Update => Self::Update,
            OperationKind::Clear => Self::Clear,
        }
    }
}

/// A notification delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct PlugEvent {
    /// The plug the event happened on.
    pub plug: PlugRef,
    /// The event kind.
    pub kind: PlugEventKind,
    /// The emitted operation, for operation events.
    pub operation: Option<Operation>,
    /// Options of the emission.
    pub options: Options,
    /// The other end, for source and destination events.
    pub peer: Option<StageId>,
}

impl PlugEvent {
    pub(crate) fn operation(plug: PlugRef, operation: &Operation, options: &Options) -> Self {
        Self {
            plug,
            kind: operation.kind().into(),
            operation: Some(operation.clone()),
            options: options.clone(),
            peer: None,
        }
    }

    pub(crate) fn lifecycle(plug: PlugRef, kind: PlugEventKind, peer: Option<StageId>) -> Self {
        Self {
            plug,
            kind,
            operation: None,
            options: Options::new(),
            peer,
        }
    }
}

/// Listener callback.
pub type Listener = Box<dyn FnMut(&mut Graph, &PlugEvent) -> Result<()>>;

/// Handle to remove a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

struct Entry {
    plug: PlugRef,
    kind: PlugEventKind,
    callback: Option<Listener>,
}

#[derive(Default)]
pub(crate) struct ListenerRegistry {
    next: u64,
    entries: BTreeMap<ListenerId, Entry>,
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry").field("len", &self.entries.len()).finish()
    }
}

impl Graph {
    /// Registers a listener for `kind` events on `plug`.
    pub fn on(
        &mut self,
        plug: PlugRef,
        kind: PlugEventKind,
        listener: impl FnMut(&mut Graph, &PlugEvent) -> Result<()> + 'static,
    ) -> ListenerId {
        let registry = &mut self.listeners;
        let id = ListenerId(registry.next);
        registry.next += 1;
        registry.entries.insert(
            id,
            Entry {
                plug,
                kind,
                callback: Some(Box::new(listener)),
            },
        );
        id
    }

    /// Removes a listener. Returns false if it was already removed.
    pub fn off(&mut self, id: ListenerId) -> bool {
        self.listeners.entries.remove(&id).is_some()
    }

    /// Notifies every listener registered for this event, in registration
    /// order. A listener removed by an earlier one is skipped.
    pub(crate) fn fire(&mut self, event: &PlugEvent) -> Result<()> {
        let ids: Vec<ListenerId> = self
            .listeners
            .entries
            .iter()
            .filter(|(_, entry)| entry.plug == event.plug && entry.kind == event.kind)
            .map(|(id, _)| *id)
            .collect();

        for id in ids {
            let Some(mut callback) = self.listeners.entries.get_mut(&id).and_then(|e| e.callback.take()) else {
                continue;
            };
            let result = callback(self, event);
            if let Some(entry) = self.listeners.entries.get_mut(&id) {
                entry.callback = Some(callback);
            }
            result?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Graph, GraphConfig};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_listener_fires_for_matching_plug_only() {
        let mut graph = Graph::new(GraphConfig::default()).unwrap();
        let seen = Rc::new(RefCell::new(0));
        let plug = PlugRef::Output(StageId::new(0));

        let counter = seen.clone();
        graph.on(plug, PlugEventKind::Disconnected, move |_, _| {
            *counter.borrow_mut() += 1;
            Ok(())
        });

        graph.fire(&PlugEvent::lifecycle(plug, PlugEventKind::Disconnected, None)).unwrap();
        graph
            .fire(&PlugEvent::lifecycle(PlugRef::Output(StageId::new(1)), PlugEventKind::Disconnected, None))
            .unwrap();
        assert_eq!(*seen.borrow(), 1);
    }

    #[test]
    fn test_listener_removing_itself() {
        let mut graph = Graph::new(GraphConfig::default()).unwrap();
        let plug = PlugRef::Input(StageId::new(0));
        let own_id = Rc::new(RefCell::new(None));

        let slot = own_id.clone();
        let id = graph.on(plug, PlugEventKind::RemoveSource, move |graph, _| {
            if let Some(id) = *slot.borrow() {
                graph.off(id);
            }
            Ok(())
        });
        *own_id.borrow_mut() = Some(id);

        let event = PlugEvent::lifecycle(plug, PlugEventKind::RemoveSource, None);
        graph.fire(&event).unwrap();
        assert!(!graph.off(id));
    }

    #[test]
    fn test_operation_kind_maps_to_event_kind() {
        assert_eq!(PlugEventKind::from(OperationKind::Update), PlugEventKind::Update);
    }
}
