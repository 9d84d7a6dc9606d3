//! In-memory fake collaborators.
//!
//! Every fake records the calls it receives so tests can assert not just on
//! outcomes but on how much work the scheduler actually performed (dedup,
//! candidate order, concurrency high watermarks).

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use builddag::capability::Machine;
use builddag::store::{
    BuildExecutor, BuildLog, BuildResult, BuildStatus, Derivation, LogChannel, OutputMapping,
    PathInfo, Store, StoreError, Substituter,
};
use builddag::types::{BuildMode, DrvOutputId, OutputName, StorePath};

#[derive(Default)]
struct FakeStoreInner {
    valid: HashSet<StorePath>,
    derivations: HashMap<StorePath, Derivation>,
    infos: HashMap<StorePath, PathInfo>,
    io_failures: HashSet<StorePath>,
    validity_checks: Vec<StorePath>,
    derivation_reads: Vec<StorePath>,
}

/// An in-memory store: a validity set plus registered derivations.
#[derive(Clone, Default)]
pub struct FakeStore {
    inner: Arc<Mutex<FakeStoreInner>>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_valid(&self, path: &StorePath) {
        self.inner.lock().unwrap().valid.insert(path.clone());
    }

    pub fn is_marked_valid(&self, path: &StorePath) -> bool {
        self.inner.lock().unwrap().valid.contains(path)
    }

    pub fn add_derivation(&self, path: StorePath, drv: Derivation) {
        self.inner.lock().unwrap().derivations.insert(path, drv);
    }

    pub fn add_path_info(&self, info: PathInfo) {
        self.inner
            .lock()
            .unwrap()
            .infos
            .insert(info.path.clone(), info);
    }

    /// Make every store operation on `path` fail with an I/O error.
    pub fn break_path(&self, path: &StorePath) {
        self.inner.lock().unwrap().io_failures.insert(path.clone());
    }

    pub fn validity_checks(&self) -> Vec<StorePath> {
        self.inner.lock().unwrap().validity_checks.clone()
    }

    pub fn derivation_reads(&self) -> Vec<StorePath> {
        self.inner.lock().unwrap().derivation_reads.clone()
    }
}

#[async_trait]
impl Store for FakeStore {
    async fn query_path_info(&self, path: &StorePath) -> Result<Option<PathInfo>, StoreError> {
        let inner = self.inner.lock().unwrap();
        if inner.io_failures.contains(path) {
            return Err(StoreError::Io(format!("simulated I/O failure on '{path}'")));
        }
        Ok(inner.infos.get(path).cloned())
    }

    async fn is_valid_path(&self, path: &StorePath) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.validity_checks.push(path.clone());
        if inner.io_failures.contains(path) {
            return Err(StoreError::Io(format!("simulated I/O failure on '{path}'")));
        }
        Ok(inner.valid.contains(path))
    }

    async fn read_derivation(&self, path: &StorePath) -> Result<Derivation, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.derivation_reads.push(path.clone());
        if inner.io_failures.contains(path) {
            return Err(StoreError::Io(format!("simulated I/O failure on '{path}'")));
        }
        inner
            .derivations
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::InvalidPath(path.clone()))
    }
}

#[derive(Default)]
struct FakeSubstituterInner {
    infos: HashMap<StorePath, PathInfo>,
    mappings: HashMap<DrvOutputId, OutputMapping>,
    down: bool,
    broken_fetches: HashSet<StorePath>,
    info_queries: Vec<StorePath>,
    mapping_queries: Vec<DrvOutputId>,
    fetches: Vec<StorePath>,
}

/// A fake binary cache. Successful fetches mark the destination valid in
/// the backing [`FakeStore`], like a real substitution would.
#[derive(Clone)]
pub struct FakeSubstituter {
    uri: String,
    priority: u32,
    store: FakeStore,
    inner: Arc<Mutex<FakeSubstituterInner>>,
}

impl FakeSubstituter {
    pub fn new(uri: impl Into<String>, priority: u32, store: FakeStore) -> Self {
        Self {
            uri: uri.into(),
            priority,
            store,
            inner: Arc::new(Mutex::new(FakeSubstituterInner::default())),
        }
    }

    /// Advertise `path` with no references.
    pub fn provide(&self, path: &StorePath) {
        self.provide_with_refs(path, &[]);
    }

    pub fn provide_with_refs(&self, path: &StorePath, references: &[StorePath]) {
        let info = PathInfo {
            path: path.clone(),
            references: references.iter().cloned().collect::<BTreeSet<_>>(),
            nar_size: 1024,
            download_size: Some(256),
        };
        self.inner.lock().unwrap().infos.insert(path.clone(), info);
    }

    pub fn add_mapping(&self, id: DrvOutputId, output_path: StorePath) {
        self.inner
            .lock()
            .unwrap()
            .mappings
            .insert(id.clone(), OutputMapping { id, output_path });
    }

    /// Simulate the whole endpoint being unreachable.
    pub fn set_down(&self) {
        self.inner.lock().unwrap().down = true;
    }

    /// Make fetching `path` fail with a connection-level error even though
    /// the path is advertised.
    pub fn break_fetch(&self, path: &StorePath) {
        self.inner
            .lock()
            .unwrap()
            .broken_fetches
            .insert(path.clone());
    }

    pub fn info_queries(&self) -> Vec<StorePath> {
        self.inner.lock().unwrap().info_queries.clone()
    }

    pub fn mapping_queries(&self) -> Vec<DrvOutputId> {
        self.inner.lock().unwrap().mapping_queries.clone()
    }

    pub fn fetches(&self) -> Vec<StorePath> {
        self.inner.lock().unwrap().fetches.clone()
    }
}

#[async_trait]
impl Substituter for FakeSubstituter {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    async fn query_path_info(&self, path: &StorePath) -> Result<Option<PathInfo>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.info_queries.push(path.clone());
        if inner.down {
            return Err(StoreError::Unavailable(format!("'{}' is down", self.uri)));
        }
        Ok(inner.infos.get(path).cloned())
    }

    async fn query_output_mapping(
        &self,
        id: &DrvOutputId,
    ) -> Result<Option<OutputMapping>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.mapping_queries.push(id.clone());
        if inner.down {
            return Err(StoreError::Unavailable(format!("'{}' is down", self.uri)));
        }
        Ok(inner.mappings.get(id).cloned())
    }

    async fn fetch_to(
        &self,
        path: &StorePath,
        destination: &StorePath,
    ) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.fetches.push(path.clone());
            if inner.down {
                return Err(StoreError::Unavailable(format!("'{}' is down", self.uri)));
            }
            if inner.broken_fetches.contains(path) {
                return Err(StoreError::Io(format!(
                    "connection to '{}' broke while fetching '{path}'",
                    self.uri
                )));
            }
            if !inner.infos.contains_key(path) {
                return Err(StoreError::InvalidPath(path.clone()));
            }
        }
        self.store.mark_valid(destination);
        Ok(())
    }
}

#[derive(Default)]
struct FakeExecutorInner {
    started: Vec<String>,
    running: usize,
    max_running: usize,
    failures: HashMap<String, String>,
    hanging: HashSet<String>,
}

/// A fake builder. Successful builds mark the wanted outputs valid in the
/// backing [`FakeStore`] and report `Built`.
#[derive(Clone)]
pub struct FakeExecutor {
    store: FakeStore,
    delay: Duration,
    inner: Arc<Mutex<FakeExecutorInner>>,
}

impl FakeExecutor {
    pub fn new(store: FakeStore) -> Self {
        Self {
            store,
            delay: Duration::from_millis(5),
            inner: Arc::new(Mutex::new(FakeExecutorInner::default())),
        }
    }

    /// How long each fake build "runs"; long enough by default for
    /// concurrent builds to overlap.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make builds of the derivation named `name` fail permanently.
    pub fn fail_build(&self, name: &str, message: &str) {
        self.inner
            .lock()
            .unwrap()
            .failures
            .insert(name.to_string(), message.to_string());
    }

    /// Make builds of the derivation named `name` never complete.
    pub fn hang_build(&self, name: &str) {
        self.inner.lock().unwrap().hanging.insert(name.to_string());
    }

    /// Derivation names in the order their builds started.
    pub fn started(&self) -> Vec<String> {
        self.inner.lock().unwrap().started.clone()
    }

    /// Highest number of builds that were ever in flight at once.
    pub fn max_concurrent(&self) -> usize {
        self.inner.lock().unwrap().max_running
    }
}

#[async_trait]
impl BuildExecutor for FakeExecutor {
    async fn build(
        &self,
        drv: &Derivation,
        wanted: &[OutputName],
        _mode: BuildMode,
        _machine: &Machine,
        log: BuildLog,
    ) -> Result<BuildResult, StoreError> {
        let (hang, failure) = {
            let mut inner = self.inner.lock().unwrap();
            inner.started.push(drv.name.clone());
            inner.running += 1;
            inner.max_running = inner.max_running.max(inner.running);
            (
                inner.hanging.contains(&drv.name),
                inner.failures.get(&drv.name).cloned(),
            )
        };

        log.line(LogChannel::Stdout, format!("building {}", drv.name))
            .await;

        if hang {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(self.delay).await;

        {
            let mut inner = self.inner.lock().unwrap();
            inner.running -= 1;
        }

        if let Some(message) = failure {
            log.line(LogChannel::Stderr, message.clone()).await;
            return Ok(BuildResult {
                status: BuildStatus::PermanentFailure,
                output_paths: BTreeMap::new(),
                error_msg: Some(message),
            });
        }

        let mut output_paths = BTreeMap::new();
        for (name, path) in &drv.outputs {
            if wanted.contains(name) {
                self.store.mark_valid(path);
                output_paths.insert(name.clone(), path.clone());
            }
        }
        Ok(BuildResult {
            status: BuildStatus::Built,
            output_paths,
            error_msg: None,
        })
    }
}
