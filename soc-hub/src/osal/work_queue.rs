use std::thread::{self, JoinHandle, ThreadId};

use crossbeam::channel::{bounded, Receiver, Select, Sender, TrySendError};
use parking_lot::Mutex;

use crate::error::WorkQueueFull;

/// Bounded deferred-work queue drained by one dedicated task.
///
/// This is the "pended function call" of the RTOS timer service made
/// explicit: interrupt context calls [`pend`](Self::pend), which never
/// blocks. When the queue is full the item is handed back so the caller
/// decides whether to drop it or undo its side effects.
pub struct WorkQueue<W> {
    tx: Sender<W>,
    /// Stop requests travel beside the work so a full queue cannot hold
    /// them up.
    stop: Sender<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

fn drain<W>(rx: Receiver<W>, stop: Receiver<()>, mut handler: impl FnMut(W)) {
    let mut sel = Select::new();
    let work_op = sel.recv(&rx);
    let stop_op = sel.recv(&stop);
    loop {
        let op = sel.select();
        match op.index() {
            i if i == work_op => match op.recv(&rx) {
                Ok(work) => handler(work),
                Err(_) => return,
            },
            i if i == stop_op => {
                let _ = op.recv(&stop);
                rx.try_iter().for_each(&mut handler);
                return;
            }
            _ => unreachable!("only two operations are registered"),
        }
    }
}

impl<W: Send + 'static> WorkQueue<W> {
    /// Start the worker thread. `handler` runs once per pended item, in
    /// task context, where it may block.
    pub fn spawn<F>(name: &str, depth: usize, handler: F) -> std::io::Result<Self>
    where
        F: FnMut(W) + Send + 'static,
    {
        let (tx, rx) = bounded::<W>(depth);
        let (stop, stop_rx) = bounded::<()>(1);
        let worker = thread::Builder::new().name(name.into()).spawn(move || {
            drain(rx, stop_rx, handler);
            log::debug!("work queue {:?} stopped", thread::current().name());
        })?;
        let worker_id = worker.thread().id();
        Ok(WorkQueue {
            tx,
            stop,
            worker: Mutex::new(Some(worker)),
            worker_id,
        })
    }

    /// Queue `work` without blocking.
    pub fn pend(&self, work: W) -> Result<(), WorkQueueFull<W>> {
        self.tx.try_send(work).map_err(|e| match e {
            TrySendError::Full(w) | TrySendError::Disconnected(w) => WorkQueueFull(w),
        })
    }

    /// Items waiting to run.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    /// Whether the caller is running on the worker thread.
    pub fn is_worker(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    /// Stop the worker after the items already queued have run. Never
    /// waits for queue space; called from the worker itself it returns at
    /// once.
    pub fn shutdown(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        let _ = self.stop.try_send(());
        if self.is_worker() {
            return;
        }
        if worker.join().is_err() {
            log::error!("work queue worker panicked");
        }
    }
}

impl<W> Drop for WorkQueue<W> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            let _ = self.stop.try_send(());
            if thread::current().id() != self.worker_id {
                let _ = worker.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::{unbounded, RecvTimeoutError};
    use std::sync::{Arc, OnceLock};
    use std::time::Duration;

    #[test]
    fn runs_items_in_order() {
        let (done_tx, done_rx) = unbounded();
        let q = WorkQueue::spawn("test-wq", 4, move |n: u32| done_tx.send(n).unwrap()).unwrap();
        q.pend(1).unwrap();
        q.pend(2).unwrap();
        q.pend(3).unwrap();
        let got: Vec<u32> = (0..3)
            .map(|_| done_rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(got, vec![1, 2, 3]);
        q.shutdown();
    }

    #[test]
    fn full_queue_returns_item() {
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let q = WorkQueue::spawn("test-wq-full", 1, move |_: u32| {
            let _ = gate_rx.recv();
        })
        .unwrap();
        // First item is taken by the worker and parks on the gate.
        q.pend(1).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        q.pend(2).unwrap();
        match q.pend(3) {
            Err(WorkQueueFull(item)) => assert_eq!(item, 3),
            Ok(()) => panic!("queue should be full"),
        }
        gate_tx.send(()).unwrap();
        gate_tx.send(()).unwrap();
        q.shutdown();
    }

    #[test]
    fn worker_can_stop_its_own_full_queue() {
        let slot: Arc<OnceLock<WorkQueue<u32>>> = Arc::new(OnceLock::new());
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let (done_tx, done_rx) = unbounded();
        let inner = slot.clone();
        let q = WorkQueue::spawn("test-wq-self-stop", 1, move |n: u32| {
            let _ = gate_rx.recv();
            if n == 1 {
                if let Some(q) = inner.get() {
                    q.shutdown();
                }
            }
            done_tx.send(n).unwrap();
        })
        .unwrap();
        assert!(slot.set(q).is_ok());
        let q = slot.get().unwrap();

        q.pend(1).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        q.pend(2).unwrap();
        assert!(q.pend(3).is_err());
        // Item 1 asks for shutdown while item 2 still fills the queue.
        drop(gate_tx);

        let got: Vec<u32> = (0..2)
            .map(|_| done_rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(got, vec![1, 2]);
        // The worker exits, dropping the handler and its sender.
        assert_eq!(
            done_rx.recv_timeout(Duration::from_secs(5)),
            Err(RecvTimeoutError::Disconnected)
        );
    }

    #[test]
    fn shutdown_runs_queued_items_first() {
        let (done_tx, done_rx) = unbounded();
        let q = WorkQueue::spawn("test-wq-drain", 4, move |n: u32| {
            std::thread::sleep(Duration::from_millis(5));
            done_tx.send(n).unwrap();
        })
        .unwrap();
        for n in 0..4 {
            q.pend(n).unwrap();
        }
        q.shutdown();
        assert_eq!(done_rx.try_iter().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }
}
