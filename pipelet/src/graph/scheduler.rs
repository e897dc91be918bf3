//! Cooperative task queue driving asynchronous completions.
//!
//! The graph itself is single-threaded. Work arriving from elsewhere (a
//! deferred fetch answered from an I/O task, a timer) is posted through a
//! [`Spawner`] and runs when the graph drains its queue.

use super::Graph;
use crate::errors::Result;
use tokio::sync::mpsc;

/// A unit of work run against the graph.
pub type Task = Box<dyn FnOnce(&mut Graph) -> Result<()> + Send>;

/// Cloneable, `Send` handle posting tasks to a graph.
#[derive(Debug, Clone)]
pub struct Spawner {
    tx: mpsc::UnboundedSender<Task>,
}

impl Spawner {
    /// Posts a task. Returns false if the graph is gone.
    pub fn schedule(&self, task: impl FnOnce(&mut Graph) -> Result<()> + Send + 'static) -> bool {
        self.tx.send(Box::new(task)).is_ok()
    }
}

#[derive(Debug)]
pub(crate) struct TaskQueue {
    rx: mpsc::UnboundedReceiver<Task>,
}

pub(crate) fn channel() -> (Spawner, TaskQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Spawner { tx }, TaskQueue { rx })
}

impl Graph {
    /// Runs queued tasks until none is left, without waiting.
    ///
    /// Returns the number of tasks run. The first failing task stops the
    /// drain and its error is returned.
    pub fn run_until_stalled(&mut self) -> Result<usize> {
        let mut ran = 0;
        while let Ok(task) = self.tasks.rx.try_recv() {
            task(self)?;
            ran += 1;
        }
        if ran > 0 {
            tracing::trace!(tasks = ran, pending_fetches = self.active_fetches(), "graph stalled");
        }
        Ok(ran)
    }

    /// Runs tasks until no fetch is outstanding.
    ///
    /// Waits for posted tasks while fetches are still open. A fetch nobody
    /// will ever answer keeps this pending; dropping its
    /// [`PendingFetch`](crate::plug::PendingFetch) ends it.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            self.run_until_stalled()?;
            if self.active_fetches() == 0 {
                return Ok(());
            }
            match self.tasks.rx.recv().await {
                Some(task) => task(self)?,
                None => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::graph::{Graph, GraphConfig};

    #[test]
    fn test_run_until_stalled_drains_in_order() {
        let mut graph = Graph::new(GraphConfig::default()).unwrap();
        let spawner = graph.spawner();
        let order = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            assert!(spawner.schedule(move |_graph| {
                order.lock().push(i);
                Ok(())
            }));
        }

        assert_eq!(graph.run_until_stalled().unwrap(), 3);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(graph.run_until_stalled().unwrap(), 0);
    }

    #[test]
    fn test_failing_task_stops_drain() {
        let mut graph = Graph::new(GraphConfig::default()).unwrap();
        let spawner = graph.spawner();
        spawner.schedule(|_graph| Err(crate::errors::PipeletError::InvalidConfig("boom".into())));
        spawner.schedule(|_graph| Ok(()));

        assert!(graph.run_until_stalled().is_err());
        assert_eq!(graph.run_until_stalled().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_returns_when_idle() {
        let mut graph = Graph::new(GraphConfig::default()).unwrap();
        graph.run().await.unwrap();
    }

    #[test]
    fn test_run_drains_tasks_scheduled_before_start() {
        let mut graph = Graph::new(GraphConfig::default()).unwrap();
        let spawner = graph.spawner();
        let hits = std::sync::Arc::new(parking_lot::Mutex::new(0));
        let counter = hits.clone();
        spawner.schedule(move |_graph| {
            *counter.lock() += 1;
            Ok(())
        });

        tokio_test::block_on(graph.run()).unwrap();
        assert_eq!(*hits.lock(), 1);
    }
}
