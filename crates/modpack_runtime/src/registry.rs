use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::InstallError;

/// What a module evaluates to.
pub type Exports = Value;

/// A registered but not yet installed module. Receives the registry so it can
/// install its own dependencies while evaluating.
pub type ModuleBody = Arc<dyn Fn(&ModuleRegistry) -> Exports + Send + Sync>;

/// Registry of module bodies and the install cache.
///
/// Installation is lazy: registering a module stores its body, the first
/// [`ModuleRegistry::install`] runs it and caches the exports, every later
/// install is a pure cache hit. Bodies may install other modules
/// re-entrantly; a dependency cycle resolves to an empty object for the
/// module that is still mid-install instead of recursing forever.
#[derive(Default)]
pub struct ModuleRegistry {
  factories: Mutex<HashMap<String, ModuleBody>>,
  cache: Mutex<HashMap<String, Exports>>,
  in_progress: Mutex<HashSet<String>>,
}

impl ModuleRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Store a module body. Re-registering an id replaces the body but leaves
  /// an already cached installation untouched.
  pub fn register(&self, id: impl Into<String>, body: ModuleBody) {
    self.factories.lock().insert(id.into(), body);
  }

  pub fn is_registered(&self, id: &str) -> bool {
    self.factories.lock().contains_key(id)
  }

  pub fn is_installed(&self, id: &str) -> bool {
    self.cache.lock().contains_key(id)
  }

  /// Install a module (once) and return its exports.
  ///
  /// Locks are never held across the body call, so bodies are free to
  /// install further modules.
  pub fn install(&self, id: &str) -> Result<Exports, InstallError> {
    if let Some(exports) = self.cache.lock().get(id) {
      return Ok(exports.clone());
    }

    if !self.in_progress.lock().insert(id.to_string()) {
      // Mid-install re-entry: the cycle partner observes an empty export
      // object rather than re-running the body.
      debug!(module = id, "circular install resolved to empty exports");
      return Ok(Value::Object(Map::new()));
    }

    let factory = self.factories.lock().get(id).cloned();
    let Some(factory) = factory else {
      self.in_progress.lock().remove(id);
      return Err(InstallError::MissingModule(id.to_string()));
    };

    let exports = factory(self);
    self.in_progress.lock().remove(id);
    self
      .cache
      .lock()
      .insert(id.to_string(), exports.clone());
    Ok(exports)
  }
}
