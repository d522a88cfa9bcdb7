//! Bounded worker pool for per-disk jobs.
//!
//! Disk workers are I/O bound and independent, plain OS threads with a
//! channel fit better than an async runtime here. The first failing
//! job marks the batch as aborted: queued jobs are dropped and running
//! jobs observe the cancellation flag at their next chunk boundary.

use std::sync::Mutex;

use anyhow::{format_err, Error};
use crossbeam_channel::bounded;

use super::signals;

/// Run `handler` over all items on `threads` worker threads and
/// collect the results. Returns the first error if any job failed.
pub fn run_parallel<I, T, F>(
    name: &str,
    threads: usize,
    items: Vec<I>,
    handler: F,
) -> Result<Vec<T>, Error>
where
    I: Send,
    T: Send,
    F: Fn(I) -> Result<T, Error> + Send + Sync,
{
    let threads = threads.clamp(1, items.len().max(1));
    let (input_tx, input_rx) = bounded::<I>(items.len().max(1));
    for item in items {
        input_tx
            .send(item)
            .map_err(|_| format_err!("worker pool input channel closed"))?;
    }
    drop(input_tx);

    let results = Mutex::new(Vec::new());
    let first_error: Mutex<Option<Error>> = Mutex::new(None);

    std::thread::scope(|scope| {
        for i in 0..threads {
            let input_rx = input_rx.clone();
            let handler = &handler;
            let results = &results;
            let first_error = &first_error;
            let builder = std::thread::Builder::new().name(format!("{} ({})", name, i));
            builder
                .spawn_scoped(scope, move || {
                    while let Ok(item) = input_rx.recv() {
                        if signals::cancelled() {
                            return;
                        }
                        match handler(item) {
                            Ok(result) => results.lock().unwrap().push(result),
                            Err(err) => {
                                let mut guard = first_error.lock().unwrap();
                                if guard.is_none() {
                                    *guard = Some(err);
                                }
                                // running workers stop at their next
                                // chunk boundary
                                signals::cancel();
                                return;
                            }
                        }
                    }
                })
                .expect("unable to spawn worker thread");
        }
    });

    if let Some(err) = first_error.into_inner().unwrap() {
        return Err(err);
    }
    signals::check()?;
    Ok(results.into_inner().unwrap())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn collects_all_results() {
        let results = run_parallel("test", 3, vec![1u64, 2, 3, 4, 5], |n| Ok(n * 2)).unwrap();
        let sum: u64 = results.iter().sum();
        assert_eq!(sum, 30);
    }
}
