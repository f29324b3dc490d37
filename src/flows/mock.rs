//! Recording device doubles for flow tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::device::{Connector, DeviceSession};
use crate::error::{IsyncError, Result};
use crate::ssh::output::{present, OutputEvent, OutputSink};
use crate::ssh::RemoteExecutor;
use crate::transfer::memory::MemoryFs;
use crate::transfer::RemoteFs;

/// Shared state behind every session the mock connector hands out
#[derive(Default)]
pub struct MockDevice {
    pub fs: MemoryFs,
    commands: Mutex<Vec<String>>,
    /// (substring, exit code, stdout); first match wins
    script: Mutex<Vec<(String, u32, String)>>,
    pub closed: AtomicUsize,
}

impl MockDevice {
    pub fn new(fs: MemoryFs) -> Arc<Self> {
        Arc::new(Self {
            fs,
            ..Self::default()
        })
    }

    /// Commands containing `pattern` exit with `code`
    pub fn respond(&self, pattern: &str, code: u32, stdout: &str) {
        self.script
            .lock()
            .unwrap()
            .push((pattern.to_string(), code, stdout.to_string()));
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

pub struct MockSession(Arc<MockDevice>);

#[async_trait]
impl RemoteExecutor for MockSession {
    async fn exec(&self, command: &str, sink: &mut dyn OutputSink) -> Result<u32> {
        present(sink, OutputEvent::Command(command.to_string()));
        self.0.commands.lock().unwrap().push(command.to_string());

        let scripted = self
            .0
            .script
            .lock()
            .unwrap()
            .iter()
            .find(|(pattern, _, _)| command.contains(pattern.as_str()))
            .map(|(_, code, out)| (*code, out.clone()));
        let (code, stdout) = scripted.unwrap_or((0, String::new()));

        if !stdout.is_empty() {
            present(sink, OutputEvent::Stdout(stdout));
        }
        present(sink, OutputEvent::Exit(code));
        Ok(code)
    }
}

#[async_trait]
impl DeviceSession for MockSession {
    async fn fs(&self) -> Result<&dyn RemoteFs> {
        Ok(&self.0.fs)
    }

    async fn close(&self) {
        self.0.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn as_executor(&self) -> &dyn RemoteExecutor {
        self
    }
}

pub struct MockConnector {
    pub device: Arc<MockDevice>,
    pub connects: AtomicUsize,
    /// Fail the n-th connection attempt (1-based)
    fail_on: Option<usize>,
}

impl MockConnector {
    pub fn new(device: Arc<MockDevice>) -> Arc<Self> {
        Arc::new(Self {
            device,
            connects: AtomicUsize::new(0),
            fail_on: None,
        })
    }

    pub fn unreachable(device: Arc<MockDevice>) -> Arc<Self> {
        Arc::new(Self {
            device,
            connects: AtomicUsize::new(0),
            fail_on: Some(1),
        })
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn DeviceSession>> {
        let n = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on == Some(n) {
            return Err(IsyncError::connect("connection refused"));
        }
        Ok(Box::new(MockSession(Arc::clone(&self.device))))
    }

    fn target(&self) -> String {
        "root@mock:22".to_string()
    }
}
