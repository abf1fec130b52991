//! Per-sheet run queue.
//!
//! A [`Tablespace`] owns a [`Sheet`] on a dedicated worker thread. Jobs are
//! queued on a bounded channel and run one at a time in arrival order, so
//! transactions on one sheet never interleave.
//!
//! A job that panics is dropped and its caller sees [`SheetError::Closed`];
//! the worker keeps serving later jobs with the sheet as the panic left it.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use crate::error::{Result, SheetError};
use crate::sheet::Sheet;
use objsheet_engine::engine::Value;

const QUEUE_DEPTH: usize = 256;

type Job = Box<dyn FnOnce(&mut Sheet) + Send>;

pub struct Tablespace {
    id: String,
    tx: Option<SyncSender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl Tablespace {
    /// Move `sheet` onto a new worker thread.
    pub fn new(id: impl Into<String>, sheet: Sheet) -> Result<Self> {
        let id = id.into();
        let (tx, rx) = mpsc::sync_channel(QUEUE_DEPTH);
        let worker = thread::Builder::new()
            .name(format!("tablespace-{}", id))
            .spawn({
                let id = id.clone();
                move || run_queue(&id, sheet, rx)
            })?;
        debug!(tablespace = %id, "started");
        Ok(Tablespace {
            id,
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue `f` and block until it has run.
    pub fn run<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Sheet) -> Result<R> + Send + 'static,
    {
        let response_rx = self.submit(f)?;
        response_rx.recv().map_err(|_| SheetError::Closed)?
    }

    /// Queue `f` without waiting. The result arrives on the returned channel.
    pub fn submit<R, F>(&self, f: F) -> Result<Receiver<Result<R>>>
    where
        R: Send + 'static,
        F: FnOnce(&mut Sheet) -> Result<R> + Send + 'static,
    {
        let tx = self.tx.as_ref().ok_or(SheetError::Closed)?;
        let (response_tx, response_rx) = mpsc::sync_channel(1);
        let job: Job = Box::new(move |sheet| {
            let _ = response_tx.send(f(sheet));
        });
        tx.send(job).map_err(|_| SheetError::Closed)?;
        Ok(response_rx)
    }

    /// Run a canned transaction on the worker.
    pub fn call(&self, name: &str, args: BTreeMap<String, Vec<Value>>) -> Result<()> {
        let name = name.to_string();
        self.run(move |sheet| sheet.execute_canned_transaction(&name, args))
    }
}

impl Drop for Tablespace {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!(tablespace = %self.id, "worker panicked");
            }
        }
        debug!(tablespace = %self.id, "stopped");
    }
}

fn run_queue(id: &str, mut sheet: Sheet, rx: Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        if panic::catch_unwind(AssertUnwindSafe(|| job(&mut sheet))).is_err() {
            error!(tablespace = %id, "job panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sheet::ColumnSpec;
    use objsheet_engine::engine::{CellId, ColumnId, Type};

    fn counter_sheet() -> Sheet {
        let mut sheet = Sheet::new();
        let n = sheet
            .define_column(&ColumnId::root(), 0, ColumnSpec::field("n", Type::Number))
            .unwrap();
        sheet
            .write_state_family(&n, &CellId::root(), [Value::number(0.0)].into_iter().collect())
            .unwrap();
        sheet.define_procedure("bump", &[], "$n := $n + 1").unwrap();
        sheet
    }

    #[test]
    fn test_calls_run_in_order() {
        let tablespace = Tablespace::new("t", counter_sheet()).unwrap();
        let pending: Vec<_> = (0..10)
            .map(|_| {
                tablespace
                    .submit(|sheet| sheet.execute_canned_transaction("bump", BTreeMap::new()))
                    .unwrap()
            })
            .collect();
        for rx in pending {
            rx.recv().unwrap().unwrap();
        }
        let text = tablespace
            .run(|sheet| sheet.evaluate_formula_text("n").map(|(_, text)| text))
            .unwrap();
        assert_eq!(text, "10");
    }

    #[test]
    fn test_errors_come_back() {
        let tablespace = Tablespace::new("t", counter_sheet()).unwrap();
        assert!(matches!(
            tablespace.call("missing", BTreeMap::new()),
            Err(SheetError::NoSuchProcedure(_))
        ));
        tablespace.call("bump", BTreeMap::new()).unwrap();
    }

    #[test]
    fn test_worker_survives_panicking_job() {
        let tablespace = Tablespace::new("t", counter_sheet()).unwrap();
        let result: Result<()> = tablespace.run(|_| panic!("job failed"));
        assert!(matches!(result, Err(SheetError::Closed)));

        tablespace.call("bump", BTreeMap::new()).unwrap();
        let text = tablespace
            .run(|sheet| sheet.evaluate_formula_text("n").map(|(_, text)| text))
            .unwrap();
        assert_eq!(text, "1");
    }
}
