use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{trace, warn};

use crate::error::{GraphError, Result};

type Job = Box<dyn FnOnce() -> Result<()> + Send>;

enum Message {
    Run(Job),
    Barrier(Sender<()>),
}

/// In-order command queue served by one worker thread.
///
/// Jobs run in submission order. After a job fails the remaining jobs are
/// skipped and the error is reported by the next [`DeviceQueue::finish`].
pub struct DeviceQueue {
    sender: Option<Sender<Message>>,
    worker: Option<JoinHandle<()>>,
    failure: Arc<Mutex<Option<GraphError>>>,
}

impl DeviceQueue {
    pub fn new() -> Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let failure = Arc::new(Mutex::new(None));
        let worker_failure = Arc::clone(&failure);
        let worker = thread::Builder::new()
            .name("opgraph-queue".to_string())
            .spawn(move || serve(receiver, worker_failure))
            .map_err(|err| GraphError::execution(format!("failed to spawn queue worker: {err}")))?;
        Ok(DeviceQueue {
            sender: Some(sender),
            worker: Some(worker),
            failure,
        })
    }

    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.send(Message::Run(Box::new(job)))
    }

    /// Blocks until every submitted job has run; returns the first failure.
    pub fn finish(&self) -> Result<()> {
        let (reply, done) = mpsc::channel();
        self.send(Message::Barrier(reply))?;
        done.recv()
            .map_err(|_| GraphError::execution("device queue worker stopped"))?;
        match self
            .failure
            .lock()
            .expect("device queue failure slot poisoned")
            .take()
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn send(&self, message: Message) -> Result<()> {
        self.sender
            .as_ref()
            .ok_or_else(|| GraphError::execution("device queue is shut down"))?
            .send(message)
            .map_err(|_| GraphError::execution("device queue worker stopped"))
    }
}

fn serve(receiver: Receiver<Message>, failure: Arc<Mutex<Option<GraphError>>>) {
    for message in receiver {
        match message {
            Message::Run(job) => {
                if failure
                    .lock()
                    .expect("device queue failure slot poisoned")
                    .is_some()
                {
                    trace!("skipping queued job after failure");
                    continue;
                }
                if let Err(err) = job() {
                    warn!(error = %err, "queued job failed");
                    *failure.lock().expect("device queue failure slot poisoned") = Some(err);
                }
            }
            Message::Barrier(reply) => {
                let _ = reply.send(());
            }
        }
    }
}

impl Drop for DeviceQueue {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for DeviceQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceQueue").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_run_in_submission_order() {
        let queue = DeviceQueue::new().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = Arc::clone(&log);
            queue
                .submit(move || {
                    log.lock().unwrap().push(i);
                    Ok(())
                })
                .unwrap();
        }
        queue.finish().unwrap();
        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn failure_skips_later_jobs_and_is_reported_once() {
        let queue = DeviceQueue::new().unwrap();
        let ran = Arc::new(Mutex::new(false));
        queue.submit(|| Err(GraphError::execution("boom"))).unwrap();
        let flag = Arc::clone(&ran);
        queue
            .submit(move || {
                *flag.lock().unwrap() = true;
                Ok(())
            })
            .unwrap();
        assert_eq!(queue.finish(), Err(GraphError::execution("boom")));
        assert!(!*ran.lock().unwrap());
        assert!(queue.finish().is_ok());
    }
}
