use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use modpack_core::manifest::{DeferredModule, RuntimeManifest};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{ChunkLoadError, LoadFailureKind};
use crate::registry::{ModuleBody, ModuleRegistry};

/// Transport abstraction for loading a chunk artifact. Production fetchers
/// hit the network; tests substitute in-memory stubs.
#[async_trait]
pub trait ChunkFetcher: Send + Sync {
  async fn fetch(&self, chunk_id: &str, url: &str) -> anyhow::Result<ChunkPayload>;
}

/// What a fetched chunk artifact contributes: the chunks it installs (an
/// artifact may carry several), the module bodies it registers, and entry
/// modules to execute once their gates open.
#[derive(Clone, Default)]
pub struct ChunkPayload {
  pub chunk_ids: Vec<String>,
  pub modules: Vec<(String, ModuleBody)>,
  pub execute: Vec<DeferredModule>,
}

/// Maps a chunk id to its fetch target, replacing the built-in scheme.
pub type UrlResolver = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Loader configuration.
#[derive(Clone)]
pub struct LoaderOptions {
  /// Prefix prepended to every chunk filename.
  pub public_path: String,

  /// Ceiling on a single chunk fetch.
  pub timeout: Duration,

  /// Per-chunk filename overrides for chunks that do not follow the
  /// `<id>.js` scheme.
  pub chunk_filenames: HashMap<String, String>,

  /// Full replacement for the URL scheme; wins over `public_path` and
  /// `chunk_filenames` when set.
  pub resolver: Option<UrlResolver>,
}

impl std::fmt::Debug for LoaderOptions {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LoaderOptions")
      .field("public_path", &self.public_path)
      .field("timeout", &self.timeout)
      .field("chunk_filenames", &self.chunk_filenames)
      .field("resolver", &self.resolver.as_ref().map(|_| "custom"))
      .finish()
  }
}

impl Default for LoaderOptions {
  fn default() -> Self {
    Self {
      public_path: String::new(),
      timeout: Duration::from_secs(120),
      chunk_filenames: HashMap::new(),
      resolver: None,
    }
  }
}

impl LoaderOptions {
  /// Resolve the URL a chunk is fetched from.
  pub fn script_src(&self, chunk_id: &str) -> String {
    if let Some(resolver) = &self.resolver {
      return resolver(chunk_id);
    }
    let filename = self
      .chunk_filenames
      .get(chunk_id)
      .cloned()
      .unwrap_or_else(|| format!("{chunk_id}.js"));
    format!("{}{}", self.public_path, filename)
  }
}

/// Lifecycle of a chunk. A chunk that was never requested has no state at
/// all; `Failed` is kept only until the next request, which retries.
enum LoadState {
  Pending(Vec<oneshot::Sender<Result<(), ChunkLoadError>>>),
  Installed,
  Failed(ChunkLoadError),
}

struct LoaderState {
  chunks: HashMap<String, LoadState>,
  deferred: Vec<DeferredModule>,
}

/// A single chunk request. Dropping the handle does not cancel the load.
pub struct ChunkLoadHandle {
  chunk_id: String,
  outcome: HandleOutcome,
}

enum HandleOutcome {
  Ready(Result<(), ChunkLoadError>),
  Waiting(oneshot::Receiver<Result<(), ChunkLoadError>>),
}

impl ChunkLoadHandle {
  fn ready(chunk_id: &str, result: Result<(), ChunkLoadError>) -> Self {
    Self {
      chunk_id: chunk_id.to_string(),
      outcome: HandleOutcome::Ready(result),
    }
  }

  fn waiting(chunk_id: &str, rx: oneshot::Receiver<Result<(), ChunkLoadError>>) -> Self {
    Self {
      chunk_id: chunk_id.to_string(),
      outcome: HandleOutcome::Waiting(rx),
    }
  }

  pub async fn wait(self) -> Result<(), ChunkLoadError> {
    match self.outcome {
      HandleOutcome::Ready(result) => result,
      HandleOutcome::Waiting(rx) => match rx.await {
        Ok(result) => result,
        // The loader was dropped while the fetch was in flight.
        Err(_) => Err(ChunkLoadError {
          chunk_id: self.chunk_id,
          kind: LoadFailureKind::Network,
          url: String::new(),
        }),
      },
    }
  }
}

/// Async chunk loader.
///
/// Concurrent requests for the same chunk coalesce onto one in-flight fetch;
/// every caller gets the same outcome. A failed chunk stays failed only until
/// the next request for it, which starts a fresh fetch. Installing a chunk
/// re-scans the deferred entry modules and executes those whose chunk
/// dependencies are now all installed.
pub struct ChunkLoader {
  options: LoaderOptions,
  fetcher: Arc<dyn ChunkFetcher>,
  registry: Arc<ModuleRegistry>,
  state: Mutex<LoaderState>,
}

impl ChunkLoader {
  pub fn new(options: LoaderOptions, fetcher: Arc<dyn ChunkFetcher>) -> Arc<Self> {
    Arc::new(Self {
      options,
      fetcher,
      registry: Arc::new(ModuleRegistry::new()),
      state: Mutex::new(LoaderState {
        chunks: HashMap::new(),
        deferred: Vec::new(),
      }),
    })
  }

  pub fn registry(&self) -> &Arc<ModuleRegistry> {
    &self.registry
  }

  pub fn is_installed(&self, chunk_id: &str) -> bool {
    matches!(
      self.state.lock().chunks.get(chunk_id),
      Some(LoadState::Installed)
    )
  }

  /// Mark the chunks inlined into the initial artifact as installed and
  /// register the deferred entry modules, then run any that are already
  /// unblocked.
  pub fn seed_manifest(&self, manifest: RuntimeManifest) {
    {
      let mut state = self.state.lock();
      for chunk in manifest.installed {
        state.chunks.insert(chunk, LoadState::Installed);
      }
      state.deferred.extend(manifest.deferred);
    }
    self.check_deferred();
  }

  /// Request a chunk. The fetch starts immediately; the returned handle is
  /// awaited for the outcome. Requesting an installed chunk resolves
  /// immediately, requesting an in-flight chunk joins the pending fetch.
  pub fn request(self: &Arc<Self>, chunk_id: &str) -> ChunkLoadHandle {
    let mut state = self.state.lock();
    match state.chunks.get_mut(chunk_id) {
      Some(LoadState::Installed) => ChunkLoadHandle::ready(chunk_id, Ok(())),
      Some(LoadState::Pending(waiters)) => {
        let (tx, rx) = oneshot::channel();
        waiters.push(tx);
        ChunkLoadHandle::waiting(chunk_id, rx)
      }
      Some(LoadState::Failed(_)) | None => {
        let (tx, rx) = oneshot::channel();
        state
          .chunks
          .insert(chunk_id.to_string(), LoadState::Pending(vec![tx]));
        let loader = self.clone();
        let id = chunk_id.to_string();
        tokio::spawn(async move {
          loader.fetch_and_install(id).await;
        });
        ChunkLoadHandle::waiting(chunk_id, rx)
      }
    }
  }

  /// Request several chunks, failing fast on the first error in request
  /// order. All fetches start up front and run concurrently.
  pub async fn request_chunks(self: &Arc<Self>, chunk_ids: &[&str]) -> Result<(), ChunkLoadError> {
    let handles: Vec<ChunkLoadHandle> = chunk_ids.iter().map(|id| self.request(id)).collect();
    for handle in handles {
      handle.wait().await?;
    }
    Ok(())
  }

  async fn fetch_and_install(&self, chunk_id: String) {
    let url = self.options.script_src(&chunk_id);
    debug!(chunk = %chunk_id, %url, "fetching chunk");

    let fetched = timeout(self.options.timeout, self.fetcher.fetch(&chunk_id, &url)).await;
    let payload = match fetched {
      Err(_) => {
        self.fail(&chunk_id, LoadFailureKind::Timeout, &url);
        return;
      }
      Ok(Err(error)) => {
        warn!(chunk = %chunk_id, %error, "chunk fetch failed");
        self.fail(&chunk_id, LoadFailureKind::Network, &url);
        return;
      }
      Ok(Ok(payload)) => payload,
    };

    // A payload may install several chunks, but it must install the one that
    // was asked for.
    let installs_requested = payload.chunk_ids.iter().any(|c| c == &chunk_id);
    self.install(payload);
    if !installs_requested {
      self.fail(&chunk_id, LoadFailureKind::Missing, &url);
    }
  }

  /// Apply a chunk payload: register its modules, mark its chunks installed,
  /// wake the waiters and re-scan the deferred entry modules. Also the entry
  /// point for payloads that arrive outside a fetch, e.g. artifacts evaluated
  /// eagerly by the host.
  pub fn install(&self, payload: ChunkPayload) {
    let ChunkPayload {
      chunk_ids,
      modules,
      execute,
    } = payload;

    for (id, body) in modules {
      self.registry.register(id, body);
    }

    let waiters: Vec<oneshot::Sender<Result<(), ChunkLoadError>>> = {
      let mut state = self.state.lock();
      let mut waiters = Vec::new();
      for chunk_id in &chunk_ids {
        if let Some(LoadState::Pending(pending)) = state
          .chunks
          .insert(chunk_id.clone(), LoadState::Installed)
        {
          waiters.extend(pending);
        }
      }
      state.deferred.extend(execute);
      waiters
    };

    debug!(chunks = ?chunk_ids, "installed chunks");
    for waiter in waiters {
      let _ = waiter.send(Ok(()));
    }

    self.check_deferred();
  }

  /// Execute every deferred entry module whose chunk dependencies are all
  /// installed, in registration order, repeating until none is ready.
  fn check_deferred(&self) {
    loop {
      let ready = {
        let mut state = self.state.lock();
        let mut ready_index = None;
        for (index, entry) in state.deferred.iter().enumerate() {
          let mut fulfilled = true;
          for dep in &entry.depends_on {
            match state.chunks.get(dep) {
              Some(LoadState::Installed) => {}
              Some(_) => fulfilled = false,
              None => {
                fulfilled = false;
                warn!(
                  module = %entry.module,
                  chunk = %dep,
                  "deferred module depends on a chunk that was never requested"
                );
              }
            }
          }
          if fulfilled {
            ready_index = Some(index);
            break;
          }
        }
        ready_index.map(|index| state.deferred.remove(index))
      };

      let Some(entry) = ready else { break };
      debug!(module = %entry.module, "deferred module gate opened");
      if let Err(error) = self.registry.install(&entry.module) {
        warn!(module = %entry.module, %error, "deferred module failed to execute");
      }
    }
  }

  /// Record a failure and wake the waiters with it. The failed state is
  /// cleared by the next request, which retries from scratch.
  fn fail(&self, chunk_id: &str, kind: LoadFailureKind, url: &str) {
    let error = ChunkLoadError {
      chunk_id: chunk_id.to_string(),
      kind,
      url: url.to_string(),
    };
    warn!(%error, "chunk load failed");

    let waiters = {
      let mut state = self.state.lock();
      match state
        .chunks
        .insert(chunk_id.to_string(), LoadState::Failed(error.clone()))
      {
        Some(LoadState::Pending(pending)) => pending,
        _ => Vec::new(),
      }
    };
    for waiter in waiters {
      let _ = waiter.send(Err(error.clone()));
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

  use pretty_assertions::assert_eq;
  use serde_json::json;

  use super::*;

  /// Serves payloads from a map after an optional delay, counting calls.
  struct StubFetcher {
    payloads: HashMap<String, ChunkPayload>,
    calls: AtomicUsize,
    delay: Duration,
    fail_first: AtomicUsize,
  }

  impl StubFetcher {
    fn new(payloads: HashMap<String, ChunkPayload>) -> Self {
      Self {
        payloads,
        calls: AtomicUsize::new(0),
        delay: Duration::ZERO,
        fail_first: AtomicUsize::new(0),
      }
    }
  }

  #[async_trait]
  impl ChunkFetcher for StubFetcher {
    async fn fetch(&self, chunk_id: &str, _url: &str) -> anyhow::Result<ChunkPayload> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(self.delay).await;
      if self
        .fail_first
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
      {
        anyhow::bail!("connection reset");
      }
      self
        .payloads
        .get(chunk_id)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("no artifact for chunk {chunk_id}"))
    }
  }

  fn bare_payload(chunk_id: &str) -> ChunkPayload {
    ChunkPayload {
      chunk_ids: vec![chunk_id.to_string()],
      ..ChunkPayload::default()
    }
  }

  fn marker_module(flag: Arc<AtomicBool>) -> ModuleBody {
    Arc::new(move |_| {
      flag.store(true, Ordering::SeqCst);
      json!(null)
    })
  }

  #[test]
  fn script_src_applies_public_path_and_overrides() {
    let options = LoaderOptions {
      public_path: "/assets/".to_string(),
      chunk_filenames: HashMap::from([("app".to_string(), "app.abc123.js".to_string())]),
      ..LoaderOptions::default()
    };
    assert_eq!(options.script_src("vendors"), "/assets/vendors.js");
    assert_eq!(options.script_src("app"), "/assets/app.abc123.js");

    let custom = LoaderOptions {
      resolver: Some(Arc::new(|chunk_id| format!("https://cdn/{chunk_id}.mjs"))),
      ..options
    };
    assert_eq!(custom.script_src("app"), "https://cdn/app.mjs");
  }

  #[tokio::test(start_paused = true)]
  async fn concurrent_requests_coalesce_onto_one_fetch() {
    let mut fetcher = StubFetcher::new(HashMap::from([(
      "vendors".to_string(),
      bare_payload("vendors"),
    )]));
    fetcher.delay = Duration::from_millis(100);
    let fetcher = Arc::new(fetcher);
    let loader = ChunkLoader::new(LoaderOptions::default(), fetcher.clone());

    let first = loader.request("vendors");
    let second = loader.request("vendors");
    let (first, second) = tokio::join!(first.wait(), second.wait());
    first.unwrap();
    second.unwrap();

    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    assert!(loader.is_installed("vendors"));

    // Already installed: resolves without another fetch.
    loader.request("vendors").wait().await.unwrap();
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn failed_chunk_is_retried_on_the_next_request() {
    let fetcher = StubFetcher::new(HashMap::from([("app".to_string(), bare_payload("app"))]));
    fetcher.fail_first.store(1, Ordering::SeqCst);
    let fetcher = Arc::new(fetcher);
    let loader = ChunkLoader::new(LoaderOptions::default(), fetcher.clone());

    let error = loader.request("app").wait().await.unwrap_err();
    assert_eq!(error.kind, LoadFailureKind::Network);
    assert_eq!(error.chunk_id, "app");
    assert!(!loader.is_installed("app"));

    loader.request("app").wait().await.unwrap();
    assert!(loader.is_installed("app"));
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn slow_fetches_time_out() {
    let mut fetcher = StubFetcher::new(HashMap::from([(
      "vendors".to_string(),
      bare_payload("vendors"),
    )]));
    fetcher.delay = Duration::from_secs(3600);
    let loader = ChunkLoader::new(
      LoaderOptions {
        timeout: Duration::from_secs(5),
        ..LoaderOptions::default()
      },
      Arc::new(fetcher),
    );

    let error = loader.request("vendors").wait().await.unwrap_err();
    assert_eq!(error.kind, LoadFailureKind::Timeout);
  }

  #[tokio::test]
  async fn payload_without_the_requested_chunk_is_a_missing_failure() {
    // The artifact loads fine but registers a different chunk.
    let fetcher = StubFetcher::new(HashMap::from([("app".to_string(), bare_payload("other"))]));
    let loader = ChunkLoader::new(LoaderOptions::default(), Arc::new(fetcher));

    let error = loader.request("app").wait().await.unwrap_err();
    assert_eq!(error.kind, LoadFailureKind::Missing);
    // Whatever the payload did carry is still installed.
    assert!(loader.is_installed("other"));
  }

  #[tokio::test]
  async fn deferred_module_runs_once_all_dependencies_install() {
    let executed = Arc::new(AtomicBool::new(false));
    let app_payload = ChunkPayload {
      chunk_ids: vec!["app".to_string()],
      modules: vec![("./main.js".to_string(), marker_module(executed.clone()))],
      execute: Vec::new(),
    };
    let fetcher = StubFetcher::new(HashMap::from([
      ("vendors".to_string(), bare_payload("vendors")),
      ("app".to_string(), app_payload),
    ]));
    let loader = ChunkLoader::new(LoaderOptions::default(), Arc::new(fetcher));

    loader.seed_manifest(RuntimeManifest {
      deferred: vec![DeferredModule {
        module: "./main.js".to_string(),
        depends_on: vec!["vendors".to_string(), "app".to_string()],
      }],
      installed: Vec::new(),
    });

    loader.request("vendors").wait().await.unwrap();
    assert!(!executed.load(Ordering::SeqCst));

    loader.request("app").wait().await.unwrap();
    assert!(executed.load(Ordering::SeqCst));
    assert!(loader.registry().is_installed("./main.js"));
  }

  #[tokio::test]
  async fn manifest_installed_chunks_resolve_without_fetching() {
    let fetcher = Arc::new(StubFetcher::new(HashMap::new()));
    let loader = ChunkLoader::new(LoaderOptions::default(), fetcher.clone());

    loader.seed_manifest(RuntimeManifest {
      deferred: Vec::new(),
      installed: vec!["runtime".to_string()],
    });

    loader.request("runtime").wait().await.unwrap();
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn request_chunks_fails_fast_in_request_order() {
    let fetcher = StubFetcher::new(HashMap::from([("a".to_string(), bare_payload("a"))]));
    let loader = ChunkLoader::new(LoaderOptions::default(), Arc::new(fetcher));

    loader.request_chunks(&["a"]).await.unwrap();

    let error = loader.request_chunks(&["a", "ghost"]).await.unwrap_err();
    assert_eq!(error.chunk_id, "ghost");
    assert_eq!(error.kind, LoadFailureKind::Network);
  }

  #[tokio::test]
  async fn payload_execute_entries_join_the_deferred_gate() {
    let executed = Arc::new(AtomicBool::new(false));
    let app_payload = ChunkPayload {
      chunk_ids: vec!["app".to_string()],
      modules: vec![("./entry.js".to_string(), marker_module(executed.clone()))],
      execute: vec![DeferredModule {
        module: "./entry.js".to_string(),
        depends_on: vec!["app".to_string()],
      }],
    };
    let fetcher = StubFetcher::new(HashMap::from([("app".to_string(), app_payload)]));
    let loader = ChunkLoader::new(LoaderOptions::default(), Arc::new(fetcher));

    loader.request("app").wait().await.unwrap();
    assert!(executed.load(Ordering::SeqCst));
  }
}
