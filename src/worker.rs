// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-core worker threads.
//!
//! Forced migrations are decided on the tick path but carried out later by
//! the worker bound to the source core. Decisions travel as [`Intent`]s over
//! a bounded channel; a full channel drops the intent and the sender is
//! expected to undo whatever it reserved for it.

use std::sync::Weak;
use std::thread;
use std::thread::JoinHandle;

use anyhow::Context;
use anyhow::Result;
use crossbeam::channel::bounded;
use crossbeam::channel::Receiver;
use crossbeam::channel::Sender;
use log::debug;

use crate::balance::RotationPlan;
use crate::types::CpuId;
use crate::types::TaskId;

const INTENT_QUEUE_DEPTH: usize = 8;

#[derive(Debug)]
pub enum Intent {
    /// Push the misfit `task` running on `src` to the bigger `dst`.
    ActiveBalance {
        src: CpuId,
        dst: CpuId,
        task: TaskId,
    },
    Rotation(RotationPlan),
    /// Acknowledge once every intent queued before it was handled.
    Barrier(Sender<()>),
}

pub trait IntentHandler: Send + Sync + 'static {
    fn handle_intent(&self, worker: CpuId, intent: Intent);
}

#[derive(Debug)]
pub struct Workers {
    senders: Vec<Sender<Intent>>,
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    pub fn spawn<H: IntentHandler>(nr_cpus: usize, handler: Weak<H>) -> Result<Workers> {
        let mut senders = Vec::with_capacity(nr_cpus);
        let mut handles = Vec::with_capacity(nr_cpus);

        for cpu in 0..nr_cpus {
            let (tx, rx) = bounded(INTENT_QUEUE_DEPTH);
            let handler = handler.clone();
            let handle = thread::Builder::new()
                .name(format!("walt-worker/{cpu}"))
                .spawn(move || worker_loop(CpuId(cpu), rx, handler))
                .with_context(|| format!("Failed to spawn worker for CPU {cpu}"))?;
            senders.push(tx);
            handles.push(handle);
        }

        Ok(Workers { senders, handles })
    }

    /// Queue `intent` on `cpu`'s worker. The intent is handed back when the
    /// queue is full or the worker is gone.
    pub fn send(&self, cpu: CpuId, intent: Intent) -> std::result::Result<(), Intent> {
        match self.senders.get(cpu.0) {
            Some(tx) => tx.try_send(intent).map_err(|e| e.into_inner()),
            None => Err(intent),
        }
    }

    /// Wait until every worker has drained its queue. Must not be called
    /// from a worker.
    pub fn barrier(&self) {
        let mut acks = Vec::with_capacity(self.senders.len());
        for tx in self.senders.iter() {
            let (ack_tx, ack_rx) = bounded(1);
            if tx.send(Intent::Barrier(ack_tx)).is_ok() {
                acks.push(ack_rx);
            }
        }
        for ack in acks {
            let _ = ack.recv();
        }
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        // Closing the channels ends the worker loops.
        self.senders.clear();

        let me = thread::current().id();
        for handle in self.handles.drain(..) {
            if handle.thread().id() == me {
                continue;
            }
            let _ = handle.join();
        }
    }
}

fn worker_loop<H: IntentHandler>(cpu: CpuId, rx: Receiver<Intent>, handler: Weak<H>) {
    debug!("walt-worker/{} started", cpu.0);

    for intent in rx.iter() {
        match intent {
            Intent::Barrier(ack) => {
                let _ = ack.send(());
            }
            intent => {
                let Some(handler) = handler.upgrade() else {
                    break;
                };
                handler.handle_intent(cpu, intent);
            }
        }
    }

    debug!("walt-worker/{} exiting", cpu.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(usize, u64)>>,
    }

    impl IntentHandler for Recorder {
        fn handle_intent(&self, worker: CpuId, intent: Intent) {
            if let Intent::ActiveBalance { task, .. } = intent {
                self.seen.lock().unwrap().push((worker.0, task.0));
            }
        }
    }

    #[test]
    fn test_intents_run_on_their_worker() {
        let recorder = Arc::new(Recorder::default());
        let workers = Workers::spawn(2, Arc::downgrade(&recorder)).unwrap();

        for task in 0..3 {
            workers
                .send(
                    CpuId(1),
                    Intent::ActiveBalance {
                        src: CpuId(1),
                        dst: CpuId(0),
                        task: TaskId(task),
                    },
                )
                .unwrap();
        }
        workers.barrier();

        assert_eq!(*recorder.seen.lock().unwrap(), vec![(1, 0), (1, 1), (1, 2)]);
        assert!(workers
            .send(
                CpuId(5),
                Intent::ActiveBalance {
                    src: CpuId(5),
                    dst: CpuId(0),
                    task: TaskId(9),
                },
            )
            .is_err());
    }
}
