use std::{
    panic::{self, AssertUnwindSafe},
    thread::JoinHandle,
};

use crossbeam::channel::{Receiver, Sender};
use thiserror::Error;

use crate::gpu::CommandBuffer;

pub type RecordJob = Box<dyn FnOnce(&mut CommandBuffer) + Send>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkerError {
    #[error("recording job {0} did not complete")]
    JobLost(usize),
    #[error("worker pool has shut down")]
    Disconnected,
}

pub enum Task {
    Record {
        index: usize,
        label: String,
        job: RecordJob,
        reply: Sender<RecordResponse>,
    },
}

pub struct RecordResponse {
    pub index: usize,
    pub cmd: CommandBuffer,
}

fn run_record(label: &str, job: RecordJob) -> Option<CommandBuffer> {
    let mut cmd = CommandBuffer::secondary(label);
    match panic::catch_unwind(AssertUnwindSafe(|| job(&mut cmd))) {
        Ok(()) => Some(cmd),
        Err(_) => {
            log::error!("Recording job '{label}' panicked");
            None
        }
    }
}

fn worker_loop(rx: Receiver<Task>) {
    while let Ok(task) = rx.recv() {
        match task {
            Task::Record {
                index,
                label,
                job,
                reply,
            } => {
                if let Some(cmd) = run_record(&label, job) {
                    let _ = reply.send(RecordResponse { index, cmd });
                }
            }
        }
    }
}

/// Fixed set of threads recording secondary command buffers.
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    task_tx: Option<Sender<Task>>,
}

impl WorkerPool {
    /// With zero workers jobs run inline on the calling thread.
    pub fn init(count: usize) -> std::io::Result<Self> {
        let (task_tx, task_rx) = crossbeam::channel::unbounded::<Task>();
        let mut workers = Vec::with_capacity(count);
        for i in 0..count {
            let rx = task_rx.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn(move || worker_loop(rx))?,
            );
        }
        log::debug!("Started {count} workers");
        Ok(Self {
            workers,
            task_tx: Some(task_tx),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Runs every job on whichever worker is free and returns the recorded
    /// buffers in job order, however the jobs finish.
    pub fn record_secondary(&self, label: &str, jobs: Vec<RecordJob>) -> Result<Vec<CommandBuffer>, WorkerError> {
        if self.workers.is_empty() {
            return jobs
                .into_iter()
                .enumerate()
                .map(|(index, job)| run_record(&format!("{label}[{index}]"), job).ok_or(WorkerError::JobLost(index)))
                .collect();
        }
        let task_tx = self.task_tx.as_ref().ok_or(WorkerError::Disconnected)?;

        let count = jobs.len();
        let (reply_tx, reply_rx) = crossbeam::channel::unbounded::<RecordResponse>();
        for (index, job) in jobs.into_iter().enumerate() {
            task_tx
                .send(Task::Record {
                    index,
                    label: format!("{label}[{index}]"),
                    job,
                    reply: reply_tx.clone(),
                })
                .map_err(|_| WorkerError::Disconnected)?;
        }
        drop(reply_tx);

        let mut slots: Vec<Option<CommandBuffer>> = (0..count).map(|_| None).collect();
        // Ends early once every reply sender is gone, i.e. a job panicked.
        for _ in 0..count {
            match reply_rx.recv() {
                Ok(response) => slots[response.index] = Some(response.cmd),
                Err(_) => break,
            }
        }
        slots
            .into_iter()
            .enumerate()
            .map(|(index, cmd)| cmd.ok_or(WorkerError::JobLost(index)))
            .collect()
    }

    pub fn shutdown(&mut self) {
        self.task_tx = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::gpu::Command;

    fn jobs(count: u32) -> Vec<RecordJob> {
        (0..count)
            .map(|i| {
                Box::new(move |cmd: &mut CommandBuffer| {
                    // Later jobs finish first.
                    std::thread::sleep(Duration::from_millis(u64::from(count - i) * 5));
                    cmd.draw(3, i + 1);
                }) as RecordJob
            })
            .collect()
    }

    #[test]
    fn results_come_back_in_dispatch_order() {
        let pool = WorkerPool::init(4).unwrap();
        let buffers = pool.record_secondary("draws", jobs(6)).unwrap();
        let instances: Vec<u32> = buffers
            .iter()
            .map(|b| match b.commands() {
                [Command::Draw { instances, .. }] => *instances,
                other => panic!("unexpected commands {other:?}"),
            })
            .collect();
        assert_eq!(instances, vec![1, 2, 3, 4, 5, 6]);
        assert!(buffers.iter().all(|b| b.is_secondary()));
    }

    #[test]
    fn inline_pool_records_on_caller() {
        let pool = WorkerPool::init(0).unwrap();
        let buffers = pool.record_secondary("inline", jobs(2)).unwrap();
        assert_eq!(buffers.len(), 2);
        assert_eq!(buffers[0].label(), "inline[0]");
    }

    #[test]
    fn panicking_job_is_reported() {
        let pool = WorkerPool::init(2).unwrap();
        let mut work = jobs(2);
        work.push(Box::new(|_cmd: &mut CommandBuffer| panic!("boom")));
        assert_eq!(pool.record_secondary("mixed", work).unwrap_err(), WorkerError::JobLost(2));
        // Workers survive the panic.
        assert_eq!(pool.record_secondary("after", jobs(1)).unwrap().len(), 1);
    }
}
