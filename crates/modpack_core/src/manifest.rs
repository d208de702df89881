use serde::{Deserialize, Serialize};

/// An entry module whose execution is gated on chunks finishing load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredModule {
  /// Identifier of the module to install once the gate opens.
  pub module: String,

  /// Chunk ids that must all be installed first, in load order.
  pub depends_on: Vec<String>,
}

/// Static manifest emitted by the optimizer and baked into the generated
/// bootstrap. The runtime loader consumes it at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeManifest {
  /// Deferred entry modules, in registration order.
  pub deferred: Vec<DeferredModule>,

  /// Chunk ids already installed at startup because they are inlined into
  /// the initial artifact.
  pub installed: Vec<String>,
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn manifest_round_trips_through_json() {
    let manifest = RuntimeManifest {
      deferred: vec![DeferredModule {
        module: "./index.js".into(),
        depends_on: vec!["runtime".into(), "vendors".into()],
      }],
      installed: vec!["runtime".into()],
    };

    let encoded = serde_json::to_string(&manifest).unwrap();
    let decoded: RuntimeManifest = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, manifest);
  }
}
