use crate::error::ReportError;
use crossbeam_channel::{bounded, select, tick, unbounded, Receiver, Sender};
use log::{error, trace, warn};
use std::{
    mem,
    panic::{self, AssertUnwindSafe},
    thread,
    time::Duration,
};

/// Shortest flush interval a worker will tick at.
pub const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Sink that delivers one flushed batch.
pub trait Reporter<T>: Send + 'static {
    fn submit(&self, records: Vec<T>) -> Result<(), ReportError>;
}

impl<T, F> Reporter<T> for F
where
    F: Fn(Vec<T>) -> Result<(), ReportError> + Send + 'static,
{
    fn submit(&self, records: Vec<T>) -> Result<(), ReportError> {
        self(records)
    }
}

enum BatchCommand<T> {
    Push(T),
    Flush(Sender<usize>),
}

/// Time-windowed queue flushing to a [`Reporter`] from its own worker thread.
///
/// `push` only enqueues onto a channel, so it never blocks the caller. Each
/// tick of the interval hands everything pushed since the previous flush to
/// the reporter in push order; quiet intervals produce no delivery. Dropping
/// the batcher delivers what is left and joins the worker.
pub struct Batcher<T> {
    name: String,
    sender: Option<Sender<BatchCommand<T>>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl<T: Send + 'static> Batcher<T> {
    pub fn new<R>(name: impl Into<String>, interval: Duration, reporter: R) -> Batcher<T>
    where
        R: Reporter<T>,
    {
        let name = name.into();
        let interval = checked_interval(&name, interval);
        let (sender, receiver) = unbounded();
        let loop_name = name.clone();
        let worker = thread::Builder::new()
            .name(format!("appenlight-{}", name))
            .spawn(move || batch_loop(&loop_name, interval, receiver, reporter));
        match worker {
            Ok(worker) => Batcher {
                name,
                sender: Some(sender),
                worker: Some(worker),
            },
            Err(e) => {
                error!("Couldn't start {} batch worker, records will be dropped: {}", name, e);
                Batcher {
                    name,
                    sender: None,
                    worker: None,
                }
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn push(&self, record: T) {
        let sent = self
            .sender
            .as_ref()
            .map(|s| s.send(BatchCommand::Push(record)).is_ok())
            .unwrap_or(false);
        if !sent {
            warn!("{} batch worker is gone, dropping record", self.name);
        }
    }

    /// Deliver pending records now. Returns how many were handed to the reporter.
    pub fn flush(&self) -> usize {
        let sender = match self.sender {
            Some(ref sender) => sender,
            None => return 0,
        };
        let (ack, done) = bounded(1);
        if sender.send(BatchCommand::Flush(ack)).is_err() {
            return 0;
        }
        done.recv().unwrap_or(0)
    }
}

impl<T> Drop for Batcher<T> {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("{} batch worker panicked", self.name);
            }
        }
    }
}

fn checked_interval(name: &str, interval: Duration) -> Duration {
    if interval < MIN_INTERVAL {
        warn!(
            "{} batch interval {:?} is below {:?}, using {:?}",
            name, interval, MIN_INTERVAL, MIN_INTERVAL
        );
        MIN_INTERVAL
    } else {
        interval
    }
}

fn batch_loop<T, R>(
    name: &str,
    interval: Duration,
    receiver: Receiver<BatchCommand<T>>,
    reporter: R,
) where
    R: Reporter<T>,
{
    let ticker = tick(interval);
    let mut pending = Vec::new();
    loop {
        select! {
            recv(receiver) -> command => match command {
                Ok(BatchCommand::Push(record)) => pending.push(record),
                Ok(BatchCommand::Flush(ack)) => {
                    let delivered = deliver(name, &reporter, &mut pending);
                    let _ = ack.send(delivered);
                }
                Err(_) => {
                    deliver(name, &reporter, &mut pending);
                    trace!("{} batch channel closed, exiting", name);
                    return;
                }
            },
            recv(ticker) -> _ => {
                deliver(name, &reporter, &mut pending);
            }
        }
    }
}

fn deliver<T, R>(name: &str, reporter: &R, pending: &mut Vec<T>) -> usize
where
    R: Reporter<T>,
{
    if pending.is_empty() {
        return 0;
    }
    let batch = mem::take(pending);
    let count = batch.len();
    // A panicking reporter must not take the worker down with it.
    match panic::catch_unwind(AssertUnwindSafe(|| reporter.submit(batch))) {
        Ok(Ok(())) => trace!("Sent {} {} records", count, name),
        Ok(Err(e)) => error!("Dropping {} {} records: {}", count, name, e),
        Err(_) => error!("Dropping {} {} records: reporter panicked", count, name),
    }
    count
}
