use std::sync::{Condvar, Mutex};

use anyhow::Result;
use thiserror::Error;
use tracing::debug;

/// Classified failure from channel setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    ConnectionError,
    UnknownHost,
    BadPassword,
    UnknownError,
}

#[derive(Debug, Clone, Error)]
#[error("connection fault ({kind:?}): {message}")]
pub struct ConnectionFault {
    pub kind: FaultKind,
    pub message: String,
}

impl ConnectionFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

/// Login details for the remote execution host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub host: String,
    pub username: String,
    pub password: Option<String>,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// One exclusive remote execution channel. Checked-out channels are used
/// without holding the pool lock.
pub trait RemoteChannel: Send {
    fn exec(&mut self, command: &str) -> Result<ExecOutput>;
    fn upload_text(&mut self, remote_path: &str, contents: &str) -> Result<()>;
    fn download_text(&mut self, remote_path: &str) -> Result<String>;
    fn mkdir_all(&mut self, remote_path: &str) -> Result<()>;
}

/// Opens authenticated channels. The production factory shells out to the
/// system ssh client; tests install an in-memory implementation.
pub trait ChannelFactory: Send + Sync {
    fn connect(&self, creds: &Credentials) -> Result<Box<dyn RemoteChannel>, ConnectionFault>;

    /// Hash of the host key most recently seen during a failed connect.
    fn server_key_hash(&self, creds: &Credentials) -> Option<String>;

    /// Persists the host's current key to the user's known-hosts file.
    fn trust_server_key(&self, creds: &Credentials) -> bool;
}

struct PoolState {
    idle: Vec<Box<dyn RemoteChannel>>,
    outstanding: usize,
    valid: bool,
    closing: bool,
}

/// Fixed-size bag of exclusive remote-exec channels.
///
/// `get_free_connection` parks on a condition variable until a channel is
/// home; every return notifies it, including during teardown, which waits
/// for all outstanding channels instead of spinning.
pub struct ConnectionPool {
    factory: Box<dyn ChannelFactory>,
    capacity: usize,
    state: Mutex<PoolState>,
    available: Condvar,
    credentials: Mutex<Option<Credentials>>,
    server_key: Mutex<String>,
}

impl ConnectionPool {
    pub fn new(capacity: usize, factory: Box<dyn ChannelFactory>) -> Self {
        Self {
            factory,
            capacity,
            state: Mutex::new(PoolState {
                idle: Vec::with_capacity(capacity),
                outstanding: 0,
                valid: false,
                closing: false,
            }),
            available: Condvar::new(),
            credentials: Mutex::new(None),
            server_key: Mutex::new(String::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_valid(&self) -> bool {
        self.state.lock().unwrap().valid
    }

    /// Opens every channel eagerly. On any failure the pool becomes
    /// invalid and the classified fault is returned.
    pub fn make_connections(&self, creds: &Credentials) -> Result<(), ConnectionFault> {
        let mut state = self.state.lock().unwrap();
        state.valid = false;
        state.idle.clear();
        *self.credentials.lock().unwrap() = Some(creds.clone());

        for i in 0..self.capacity {
            match self.factory.connect(creds) {
                Ok(chan) => state.idle.push(chan),
                Err(fault) => {
                    state.idle.clear();
                    if let Some(hash) = self.factory.server_key_hash(creds) {
                        *self.server_key.lock().unwrap() = hash;
                    }
                    debug!(channel = i, kind = ?fault.kind, "channel setup failed");
                    return Err(fault);
                }
            }
        }

        state.valid = true;
        self.available.notify_all();
        Ok(())
    }

    /// Blocks until a channel is free. Returns None when the pool is
    /// invalid or tearing down.
    pub fn get_free_connection(&self) -> Option<PooledChannel<'_>> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.closing || !state.valid {
                return None;
            }
            if let Some(chan) = state.idle.pop() {
                state.outstanding += 1;
                return Some(PooledChannel { chan: Some(chan), pool: self });
            }
            state = self.available.wait(state).unwrap();
        }
    }

    fn unlock_connection(&self, chan: Box<dyn RemoteChannel>) {
        let mut state = self.state.lock().unwrap();
        state.outstanding -= 1;
        if !state.closing {
            state.idle.push(chan);
        }
        self.available.notify_all();
    }

    /// Refuses new checkouts and waits for every channel to come home.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.closing = true;
        self.available.notify_all();
        while state.outstanding > 0 {
            state = self.available.wait(state).unwrap();
        }
        state.idle.clear();
        state.valid = false;
    }

    pub fn server_key_hash(&self) -> String {
        self.server_key.lock().unwrap().clone()
    }

    pub fn set_server_key(&self, hex: impl Into<String>) {
        *self.server_key.lock().unwrap() = hex.into();
    }

    /// Trust-on-first-use: records the host key in known-hosts.
    pub fn validate_server_key(&self) -> bool {
        match self.credentials.lock().unwrap().as_ref() {
            Some(creds) => self.factory.trust_server_key(creds),
            None => false,
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Exclusive checkout handle; returning it to the pool happens on drop.
pub struct PooledChannel<'a> {
    chan: Option<Box<dyn RemoteChannel>>,
    pool: &'a ConnectionPool,
}

impl PooledChannel<'_> {
    pub fn channel(&mut self) -> &mut dyn RemoteChannel {
        self.chan.as_deref_mut().expect("channel present until drop")
    }
}

impl Drop for PooledChannel<'_> {
    fn drop(&mut self) {
        if let Some(chan) = self.chan.take() {
            self.pool.unlock_connection(chan);
        }
    }
}
