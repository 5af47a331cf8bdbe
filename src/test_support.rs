//! In-memory remote used by the sync, release and scheduler tests.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::remote::{RemoteListing, RemoteSession, RemoteSource, TransportError};

#[derive(Default)]
struct FakeState {
    /// remote dir -> filename -> (timestamp, content)
    dirs: BTreeMap<String, BTreeMap<String, (String, Vec<u8>)>>,
    connects: usize,
    fetches: Vec<String>,
    fail_connects_remaining: usize,
    fail_all_connects: bool,
    failing_fetches: HashSet<String>,
    on_fetch: Option<(String, FetchHook)>,
}

type FetchHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone, Default)]
pub(crate) struct FakeRemote {
    state: Arc<Mutex<FakeState>>,
}

impl FakeRemote {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn put(&self, dir: &str, name: &str, ts: &str, content: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .dirs
            .entry(dir.to_string())
            .or_default()
            .insert(name.to_string(), (ts.to_string(), content.to_vec()));
    }

    pub(crate) fn remove(&self, dir: &str, name: &str) {
        if let Some(files) = self.state.lock().unwrap().dirs.get_mut(dir) {
            files.remove(name);
        }
    }

    pub(crate) fn fail_all_connects(&self) {
        self.state.lock().unwrap().fail_all_connects = true;
    }

    pub(crate) fn fail_next_connects(&self, n: usize) {
        self.state.lock().unwrap().fail_connects_remaining = n;
    }

    pub(crate) fn fail_fetch_of(&self, remote_path: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_fetches
            .insert(remote_path.to_string());
    }

    /// Run `hook` when `remote_path` is fetched, then stall that fetch.
    pub(crate) fn on_fetch(&self, remote_path: &str, hook: impl Fn() + Send + Sync + 'static) {
        self.state.lock().unwrap().on_fetch = Some((remote_path.to_string(), Arc::new(hook)));
    }

    /// Cancel `token` when `remote_path` is fetched, then stall that fetch.
    pub(crate) fn cancel_when_fetching(&self, remote_path: &str, token: CancellationToken) {
        self.on_fetch(remote_path, move || token.cancel());
    }

    pub(crate) fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub(crate) fn fetches(&self) -> Vec<String> {
        self.state.lock().unwrap().fetches.clone()
    }

    pub(crate) fn reset_counters(&self) {
        let mut state = self.state.lock().unwrap();
        state.connects = 0;
        state.fetches.clear();
    }
}

#[async_trait]
impl RemoteSource for FakeRemote {
    async fn connect(&self) -> Result<Box<dyn RemoteSession>, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        if state.fail_all_connects || state.fail_connects_remaining > 0 {
            state.fail_connects_remaining = state.fail_connects_remaining.saturating_sub(1);
            return Err(TransportError::Connect {
                addr: "fake:21".into(),
                message: "connection refused".into(),
            });
        }
        Ok(Box::new(FakeSession {
            state: Arc::clone(&self.state),
        }))
    }

    fn describe(&self) -> String {
        "fake://remote".to_string()
    }
}

struct FakeSession {
    state: Arc<Mutex<FakeState>>,
}

impl FakeSession {
    fn content(&self, remote_path: &str) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.fetches.push(remote_path.to_string());
        if state.failing_fetches.contains(remote_path) {
            return Err(TransportError::Transfer {
                path: remote_path.to_string(),
                message: "426 transfer aborted".into(),
            });
        }
        let (dir, name) = remote_path
            .rsplit_once('/')
            .unwrap_or(("", remote_path));
        state
            .dirs
            .get(dir)
            .and_then(|files| files.get(name))
            .map(|(_, content)| content.clone())
            .ok_or_else(|| TransportError::Transfer {
                path: remote_path.to_string(),
                message: "550 no such file".into(),
            })
    }

    fn fetch_hook(&self, remote_path: &str) -> bool {
        let hook = match &self.state.lock().unwrap().on_fetch {
            Some((path, hook)) if path == remote_path => Arc::clone(hook),
            _ => return false,
        };
        hook();
        true
    }
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn list(&mut self, remote_dir: &str) -> Result<RemoteListing, TransportError> {
        let state = self.state.lock().unwrap();
        let files = state.dirs.get(remote_dir).ok_or_else(|| TransportError::List {
            path: remote_dir.to_string(),
            message: "550 no such directory".into(),
        })?;
        Ok(files
            .iter()
            .map(|(name, (ts, _))| (name.clone(), ts.clone()))
            .collect())
    }

    async fn fetch(&mut self, remote_path: &str) -> Result<Vec<u8>, TransportError> {
        self.content(remote_path)
    }

    async fn fetch_to(
        &mut self,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<(), TransportError> {
        if self.fetch_hook(remote_path) {
            std::future::pending::<()>().await;
        }
        let content = self.content(remote_path)?;
        std::fs::write(local_path, content).map_err(|e| TransportError::LocalWrite {
            path: local_path.display().to_string(),
            source: e,
        })
    }

    async fn close(&mut self) {}
}
