#![allow(dead_code)]

use parking_lot::Mutex;
use sockloop::config::RuntimeConfig;
use sockloop::{IoHandler, IoSession, Message, Runtime};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(5);

/// Runtime that shuts down when the test ends.
pub struct TestRuntime(pub Arc<Runtime>);

impl TestRuntime {
    pub fn new() -> Self {
        let config = RuntimeConfig {
            accept_threads: 1,
            io_threads: 2,
            worker_threads: 2,
            worker_queue: 256,
            poll_interval_ms: 20,
        };
        Self(Runtime::new(&config).unwrap())
    }

    pub fn handle(&self) -> Arc<Runtime> {
        Arc::clone(&self.0)
    }
}

impl Drop for TestRuntime {
    fn drop(&mut self) {
        self.0.shutdown();
    }
}

/// Counts callbacks and optionally echoes what it receives.
#[derive(Default)]
pub struct Tally {
    echo: bool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    received: AtomicUsize,
    idles: AtomicUsize,
    exceptions: Mutex<Vec<String>>,
}

impl Tally {
    pub fn echo() -> Arc<Self> {
        Arc::new(Self {
            echo: true,
            ..Default::default()
        })
    }

    pub fn silent() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }

    pub fn idles(&self) -> usize {
        self.idles.load(Ordering::SeqCst)
    }

    pub fn exceptions(&self) -> Vec<String> {
        self.exceptions.lock().clone()
    }
}

impl IoHandler for Tally {
    fn on_connect(&self, _session: &Arc<IoSession>) -> Option<Message> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        None
    }

    fn on_disconnect(&self, _session: &Arc<IoSession>) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_receive(&self, _session: &Arc<IoSession>, message: Message) -> Option<Message> {
        self.received.fetch_add(1, Ordering::SeqCst);
        self.echo.then_some(message)
    }

    fn on_exception(&self, _session: &Arc<IoSession>, error: &sockloop::Error) {
        self.exceptions.lock().push(error.to_string());
    }

    fn on_idle(&self, _session: &Arc<IoSession>) {
        self.idles.fetch_add(1, Ordering::SeqCst);
    }
}

/// Self-signed certificate for "localhost" written to PEM files.
pub struct TestCert {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl TestCert {
    pub fn generate(tag: &str) -> Self {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let dir = std::env::temp_dir();
        let id = std::process::id();
        let cert_path = dir.join(format!("sockloop-{}-{}-cert.pem", tag, id));
        let key_path = dir.join(format!("sockloop-{}-{}-key.pem", tag, id));
        std::fs::write(&cert_path, certified.cert.pem()).unwrap();
        std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();
        Self {
            cert_path,
            key_path,
        }
    }

    pub fn cert(&self) -> String {
        self.cert_path.display().to_string()
    }

    pub fn key(&self) -> String {
        self.key_path.display().to_string()
    }
}

impl Drop for TestCert {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.cert_path);
        let _ = std::fs::remove_file(&self.key_path);
    }
}
