use log::info;
use parking_lot::Mutex;
use std::collections::{BTreeMap as Map, VecDeque};
use std::io;

use super::{KernelBackend, Output, Tool};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CallKind {
    Restore,
    Exec,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Restore { tool: Tool, batch: String },
    Exec { tool: Tool, args: Vec<String> },
}

/// In-memory backend: records every call and answers with scripted outputs, or success when
/// nothing is scripted.
#[derive(Default)]
pub struct Recorder {
    log_calls: bool,
    calls: Mutex<Vec<Call>>,
    scripted: Mutex<Map<(CallKind, Tool), VecDeque<Output>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A recorder that logs what it would run; used by `--dry-run`.
    pub fn dry_run() -> Self {
        Self {
            log_calls: true,
            ..Default::default()
        }
    }

    /// Queue the output of the next call of the given kind on the given tool.
    pub fn script(&self, kind: CallKind, tool: Tool, output: Output) {
        (self.scripted.lock().entry((kind, tool)).or_default()).push_back(output);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut *self.calls.lock())
    }

    /// Batches submitted to the given tool since the last `take_calls`.
    pub fn batches(&self, tool: Tool) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                Call::Restore { tool: t, batch } if *t == tool => Some(batch.clone()),
                _ => None,
            })
            .collect()
    }

    fn answer(&self, kind: CallKind, tool: Tool) -> Output {
        (self.scripted.lock().get_mut(&(kind, tool)))
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| Output::ok(""))
    }
}

impl KernelBackend for Recorder {
    fn restore(&self, tool: Tool, batch: &str) -> io::Result<Output> {
        if self.log_calls {
            info!("{tool} restore:\n{batch}");
        }
        self.calls.lock().push(Call::Restore {
            tool,
            batch: batch.to_string(),
        });
        Ok(self.answer(CallKind::Restore, tool))
    }

    fn exec(&self, tool: Tool, args: &[&str]) -> io::Result<Output> {
        if self.log_calls {
            info!("{tool} {}", args.join(" "));
        }
        self.calls.lock().push(Call::Exec {
            tool,
            args: args.iter().map(|s| s.to_string()).collect(),
        });
        Ok(self.answer(CallKind::Exec, tool))
    }
}
