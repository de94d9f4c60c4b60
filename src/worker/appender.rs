use std::{io, sync::Arc, thread};

use crossbeam_channel::Receiver;
use log::{debug, warn};

use crate::manager::chain_store::TaskChainStore;
use crate::models::{
    error::ChainError,
    message::{OutputStream, StreamInput},
    task::{TaskChainId, TerminalStatus},
};

/// Turns arbitrarily cut output fragments into complete lines.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: String,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a fragment and returns every line it completed.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = fragment;
        while let Some(pos) = rest.find('\n') {
            self.pending.push_str(&rest[..pos]);
            let mut line = std::mem::take(&mut self.pending);
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
            rest = &rest[pos + 1..];
        }
        self.pending.push_str(rest);
        lines
    }

    pub fn pending(&self) -> &str {
        &self.pending
    }

    /// Takes the trailing partial line, if there is one.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

/// Write path from a command's output streams into one chain's log.
///
/// Each stream keeps its own partial line so interleaved stdout and stderr
/// chunks never get glued together.
pub struct LogAppender {
    store: Arc<TaskChainStore>,
    id: TaskChainId,
    stdout: LineSplitter,
    stderr: LineSplitter,
    stream_prefixes: bool,
}

impl LogAppender {
    pub fn new(store: Arc<TaskChainStore>, id: TaskChainId) -> Self {
        Self {
            store,
            id,
            stdout: LineSplitter::new(),
            stderr: LineSplitter::new(),
            stream_prefixes: false,
        }
    }

    pub fn with_stream_prefixes(mut self, enabled: bool) -> Self {
        self.stream_prefixes = enabled;
        self
    }

    pub fn chain_id(&self) -> TaskChainId {
        self.id
    }

    pub fn push(&mut self, stream: OutputStream, fragment: &str) -> Result<(), ChainError> {
        let lines = self.splitter(stream).push(fragment);
        for line in lines {
            self.emit(stream, line)?;
        }
        Ok(())
    }

    /// Flushes both partial lines and closes the chain with `status`.
    pub fn finish(&mut self, status: TerminalStatus) -> Result<(), ChainError> {
        for stream in [OutputStream::Stdout, OutputStream::Stderr] {
            if let Some(line) = self.splitter(stream).finish() {
                self.emit(stream, line)?;
            }
        }
        self.store.mark_completed(self.id, status)
    }

    fn splitter(&mut self, stream: OutputStream) -> &mut LineSplitter {
        match stream {
            OutputStream::Stdout => &mut self.stdout,
            OutputStream::Stderr => &mut self.stderr,
        }
    }

    fn emit(&self, stream: OutputStream, line: String) -> Result<(), ChainError> {
        if self.stream_prefixes {
            self.store.append(self.id, format!("{}{}", stream.prefix(), line))
        } else {
            self.store.append(self.id, line)
        }
    }
}

/// Runs `appender` on its own thread, draining `inputs` until the process
/// exit notification arrives or every sender is gone.
pub fn spawn_appender_thread(
    mut appender: LogAppender,
    inputs: Receiver<StreamInput>,
) -> io::Result<thread::JoinHandle<()>> {
    let id = appender.chain_id();
    thread::Builder::new()
        .name(format!("appender-{id}"))
        .spawn(move || {
            let mut exit = None;
            for input in inputs.iter() {
                match input {
                    StreamInput::Fragment(stream, text) => {
                        if let Err(e) = appender.push(stream, &text) {
                            warn!("Dropping output for task chain '{}': {}", id, e);
                        }
                    }
                    StreamInput::Exit { killed, code } => {
                        exit = Some((killed, code));
                        break;
                    }
                }
            }

            let status = match exit {
                Some((true, _)) => TerminalStatus::Killed,
                Some((false, code)) => {
                    debug!("Task chain '{}' exited with code {:?}.", id, code);
                    TerminalStatus::Completed
                }
                None => {
                    warn!("Output channel of task chain '{}' closed without exit notice.", id);
                    TerminalStatus::Completed
                }
            };
            if let Err(e) = appender.finish(status) {
                warn!("Failed to close task chain '{}': {}", id, e);
            }
        })
}
