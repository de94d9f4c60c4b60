use std::{
    collections::HashMap,
    io::{self, Read},
    os::unix::process::CommandExt,
    process::{Child, Command, Stdio},
    sync::Arc,
    thread,
    time::SystemTime,
};

use crossbeam_channel::Sender;
use log::{error, info, warn};
use parking_lot::Mutex;

use crate::models::{
    error::RegistryError,
    message::{OutputStream, StreamInput},
    task::ProcessKey,
};

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub command: String,
    pub started_at: SystemTime,
}

/// Authority over the external commands that are currently running.
pub trait CommandRegistry: Send + Sync {
    fn list_running(&self) -> Result<HashMap<ProcessKey, ProcessInfo>, RegistryError>;

    fn kill(&self, key: &ProcessKey) -> Result<(), RegistryError>;
}

struct RunningCommand {
    info: ProcessInfo,
    kill_requested: bool,
}

/// Runs commands through a local shell and reports their output and exit
/// on a per-command channel.
pub struct LocalCommandRegistry {
    shell: String,
    running: Arc<Mutex<HashMap<ProcessKey, RunningCommand>>>,
}

impl LocalCommandRegistry {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts `command` and streams its output into `output`.
    ///
    /// The last message sent is always `StreamInput::Exit`, after both
    /// output streams reached EOF and the command left the running map.
    pub fn spawn(
        &self,
        command: &str,
        output: Sender<StreamInput>,
    ) -> Result<ProcessKey, RegistryError> {
        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(RegistryError::Spawn)?;

        let pid = child.id();
        let key = ProcessKey::new(pid.to_string());
        info!("Command '{}' started as process {}.", command, key);

        // Registered before any thread can observe the exit.
        self.running.lock().insert(
            key.clone(),
            RunningCommand {
                info: ProcessInfo {
                    pid,
                    command: command.to_string(),
                    started_at: SystemTime::now(),
                },
                kill_requested: false,
            },
        );

        let readers = spawn_readers(&mut child, &output);
        let running = Arc::clone(&self.running);
        let waiter_key = key.clone();
        let waiter = thread::Builder::new()
            .name(format!("waiter-{key}"))
            .spawn(move || wait_for_exit(child, readers, waiter_key, running, output));
        if let Err(e) = waiter {
            // Nothing would ever report this command's exit.
            self.running.lock().remove(&key);
            return Err(RegistryError::Spawn(e));
        }

        Ok(key)
    }
}

impl CommandRegistry for LocalCommandRegistry {
    fn list_running(&self) -> Result<HashMap<ProcessKey, ProcessInfo>, RegistryError> {
        Ok(self
            .running
            .lock()
            .iter()
            .map(|(key, command)| (key.clone(), command.info.clone()))
            .collect())
    }

    fn kill(&self, key: &ProcessKey) -> Result<(), RegistryError> {
        let mut running = self.running.lock();
        let command = running
            .get_mut(key)
            .ok_or_else(|| RegistryError::UnknownProcess(key.clone()))?;

        let pid = libc::pid_t::try_from(command.info.pid)
            .map_err(|_| RegistryError::UnknownProcess(key.clone()))?;
        // While the entry is in the map the child is unreaped, so neither its
        // pid nor its process group can have been recycled.
        let result = unsafe { libc::kill(-pid, libc::SIGTERM) };
        if result != 0 {
            let source = io::Error::last_os_error();
            error!("Failed to signal process {}: {}", key, source);
            return Err(RegistryError::Signal { key: key.clone(), source });
        }

        command.kill_requested = true;
        info!("Sent SIGTERM to process {}.", key);
        Ok(())
    }
}

fn spawn_readers(child: &mut Child, output: &Sender<StreamInput>) -> Vec<thread::JoinHandle<()>> {
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, OutputStream::Stdout, output.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, OutputStream::Stderr, output.clone()));
    }
    readers.into_iter().flatten().collect()
}

fn spawn_reader<R: Read + Send + 'static>(
    mut source: R,
    stream: OutputStream,
    output: Sender<StreamInput>,
) -> Option<thread::JoinHandle<()>> {
    let spawned = thread::Builder::new().spawn(move || {
        let mut decoder = Utf8Carry::default();
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let text = decoder.decode(&buf[..n]);
                    if !text.is_empty() && output.send(StreamInput::Fragment(stream, text)).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Failed to read {:?}: {}", stream, e);
                    break;
                }
            }
        }
        let rest = decoder.finish();
        if !rest.is_empty() {
            let _ = output.send(StreamInput::Fragment(stream, rest));
        }
    });
    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            error!("Failed to start {:?} reader: {}", stream, e);
            None
        }
    }
}

fn wait_for_exit(
    mut child: Child,
    readers: Vec<thread::JoinHandle<()>>,
    key: ProcessKey,
    running: Arc<Mutex<HashMap<ProcessKey, RunningCommand>>>,
    output: Sender<StreamInput>,
) {
    if let Err(e) = wait_unreaped(child.id()) {
        warn!("Failed to wait for process {} without reaping: {}", key, e);
    }
    // Background children of the shell may still hold the output pipes. The
    // entry stays listed, and the unreaped leader keeps the process group
    // signalable, until both streams reach EOF.
    for reader in readers {
        if reader.join().is_err() {
            warn!("Output reader of process {} panicked.", key);
        }
    }
    // Leaves the map before it is reaped, see `kill`.
    let killed = running
        .lock()
        .remove(&key)
        .map(|command| command.kill_requested)
        .unwrap_or(false);

    let code = match child.wait() {
        Ok(status) => status.code(),
        Err(e) => {
            error!("Failed to wait for process {}: {}", key, e);
            None
        }
    };

    info!("Process {} exited (code {:?}, killed: {}).", key, code, killed);
    let _ = output.send(StreamInput::Exit { killed, code });
}

/// Blocks until the child exits, leaving it as a zombie.
fn wait_unreaped(pid: u32) -> io::Result<()> {
    let pid = libc::id_t::from(pid);
    loop {
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let result = unsafe {
            libc::waitid(libc::P_PID, pid, &mut info, libc::WEXITED | libc::WNOWAIT)
        };
        if result == 0 {
            return Ok(());
        }
        let e = io::Error::last_os_error();
        if e.kind() != io::ErrorKind::Interrupted {
            return Err(e);
        }
    }
}

/// Decodes UTF-8 across read boundaries, holding back an incomplete
/// trailing sequence until the next chunk.
#[derive(Default)]
struct Utf8Carry {
    carry: Vec<u8>,
}

impl Utf8Carry {
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.carry.extend_from_slice(chunk);
        let keep = incomplete_tail(&self.carry);
        let tail = self.carry.split_off(self.carry.len() - keep);
        let text = String::from_utf8_lossy(&self.carry).into_owned();
        self.carry = tail;
        text
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.carry).into_owned();
        self.carry.clear();
        text
    }
}

/// Length of an unfinished UTF-8 sequence at the end of `bytes`. Invalid
/// bytes before it do not matter.
fn incomplete_tail(bytes: &[u8]) -> usize {
    let mut rest = bytes;
    loop {
        match std::str::from_utf8(rest) {
            Ok(_) => return 0,
            Err(e) => match e.error_len() {
                None => return rest.len() - e.valid_up_to(),
                Some(invalid) => rest = &rest[e.valid_up_to() + invalid..],
            },
        }
    }
}
