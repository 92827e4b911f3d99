//! Model registry: the catalog of known models and their declared metadata.
//!
//! The registry holds an immutable snapshot of the model catalog behind an
//! atomic swap. [`ModelRegistry::refresh`] replaces the snapshot without
//! touching in-flight tasks; models removed from the new catalog are kept
//! but marked disabled so they disappear from planning while tasks already
//! running on them finish undisturbed.

use crate::config::ModelSpec;
use crate::OrchestratorError;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::info;

/// One catalog generation. Immutable once built.
struct Snapshot {
    models: HashMap<String, Arc<ModelSpec>>,
    aliases: HashMap<String, String>,
    disabled: HashSet<String>,
}

/// Filter criteria for [`ModelRegistry::list`].
#[derive(Debug, Clone, Default)]
pub struct ModelFilter {
    /// Only models carrying this capability tag.
    pub capability: Option<String>,
    /// Only models of this family.
    pub family: Option<String>,
    /// Only models requiring at most this much memory.
    pub max_memory_bytes: Option<u64>,
    /// Only models with at least this context length.
    pub min_context_length: Option<u32>,
}

impl ModelFilter {
    fn matches(&self, spec: &ModelSpec) -> bool {
        if let Some(cap) = &self.capability {
            if !spec.capabilities.iter().any(|c| c == cap) {
                return false;
            }
        }
        if let Some(family) = &self.family {
            if &spec.family != family {
                return false;
            }
        }
        if let Some(max) = self.max_memory_bytes {
            if spec.memory_bytes > max {
                return false;
            }
        }
        if let Some(min) = self.min_context_length {
            if spec.context_length < min {
                return false;
            }
        }
        true
    }
}

/// A catalog entry as reported by [`ModelRegistry::list`] and
/// [`ModelRegistry::info`].
#[derive(Debug, Clone)]
pub struct ModelInfo {
    /// The model's declared spec.
    pub spec: Arc<ModelSpec>,
    /// False when the model was removed from config on a refresh.
    pub enabled: bool,
}

/// Registry for model metadata and availability.
pub struct ModelRegistry {
    snapshot: RwLock<Arc<Snapshot>>,
}

impl ModelRegistry {
    /// Build a registry from the initial catalog.
    pub fn new(models: &[ModelSpec], aliases: HashMap<String, String>) -> Self {
        let snapshot = Snapshot {
            models: models
                .iter()
                .map(|m| (m.id.clone(), Arc::new(m.clone())))
                .collect(),
            aliases,
            disabled: HashSet::new(),
        };
        Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Resolve an alias to its canonical model id; unknown names pass
    /// through unchanged.
    pub fn resolve(&self, name: &str) -> String {
        let snap = self.snapshot.read().clone();
        snap.aliases.get(name).cloned().unwrap_or_else(|| name.to_string())
    }

    /// Get an *enabled* model by id or alias.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::ModelNotFound`] for unknown or disabled
    /// models. Disabled models are invisible here so that planning never
    /// picks them up.
    pub fn get(&self, name: &str) -> Result<Arc<ModelSpec>, OrchestratorError> {
        let snap = self.snapshot.read().clone();
        let id = snap.aliases.get(name).map(String::as_str).unwrap_or(name);
        match snap.models.get(id) {
            Some(spec) if !snap.disabled.contains(id) => Ok(Arc::clone(spec)),
            _ => Err(OrchestratorError::ModelNotFound(name.to_string())),
        }
    }

    /// Get catalog info for a model, including disabled ones.
    pub fn info(&self, name: &str) -> Option<ModelInfo> {
        let snap = self.snapshot.read().clone();
        let id = snap.aliases.get(name).map(String::as_str).unwrap_or(name);
        snap.models.get(id).map(|spec| ModelInfo {
            spec: Arc::clone(spec),
            enabled: !snap.disabled.contains(id),
        })
    }

    /// Whether a model id is known and enabled.
    pub fn is_enabled(&self, id: &str) -> bool {
        let snap = self.snapshot.read().clone();
        snap.models.contains_key(id) && !snap.disabled.contains(id)
    }

    /// List catalog entries, optionally filtered, sorted by ascending id.
    pub fn list(&self, filter: Option<&ModelFilter>) -> Vec<ModelInfo> {
        let snap = self.snapshot.read().clone();
        let mut out: Vec<ModelInfo> = snap
            .models
            .values()
            .filter(|spec| filter.map_or(true, |f| f.matches(spec)))
            .map(|spec| ModelInfo {
                spec: Arc::clone(spec),
                enabled: !snap.disabled.contains(&spec.id),
            })
            .collect();
        out.sort_by(|a, b| a.spec.id.cmp(&b.spec.id));
        out
    }

    /// Enabled model ids carrying the given capability tag, ascending.
    pub fn ids_with_capability(&self, capability: &str) -> Vec<String> {
        let snap = self.snapshot.read().clone();
        let mut ids: Vec<String> = snap
            .models
            .values()
            .filter(|spec| {
                !snap.disabled.contains(&spec.id)
                    && spec.capabilities.iter().any(|c| c == capability)
            })
            .map(|spec| spec.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Replace the catalog with a new generation.
    ///
    /// Models present in the old catalog but absent from the new one are
    /// carried over disabled instead of dropped, so tasks already running
    /// on them keep a valid spec while planning stops offering them.
    pub fn refresh(&self, models: &[ModelSpec], aliases: HashMap<String, String>) {
        let mut next_models: HashMap<String, Arc<ModelSpec>> = models
            .iter()
            .map(|m| (m.id.clone(), Arc::new(m.clone())))
            .collect();
        let mut disabled = HashSet::new();

        {
            let old = self.snapshot.read().clone();
            for (id, spec) in &old.models {
                if !next_models.contains_key(id) {
                    next_models.insert(id.clone(), Arc::clone(spec));
                    disabled.insert(id.clone());
                }
            }
        }

        if !disabled.is_empty() {
            info!(disabled = ?disabled, "registry refresh: models disabled");
        }
        info!(models = next_models.len(), "registry refreshed");

        *self.snapshot.write() = Arc::new(Snapshot {
            models: next_models,
            aliases,
            disabled,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeKind;

    fn spec(id: &str, family: &str, caps: &[&str]) -> ModelSpec {
        ModelSpec {
            id: id.into(),
            family: family.into(),
            size: "7b".into(),
            context_length: 8192,
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            memory_bytes: 4_000_000_000,
            recommended_runtimes: vec![RuntimeKind::Mock],
        }
    }

    fn registry() -> ModelRegistry {
        let aliases = HashMap::from([("coder".to_string(), "deepseek-coder".to_string())]);
        ModelRegistry::new(
            &[
                spec("mistral", "mistral", &["general", "fast"]),
                spec("deepseek-coder", "deepseek", &["code"]),
            ],
            aliases,
        )
    }

    #[test]
    fn test_get_by_id() {
        let reg = registry();
        let model = reg.get("mistral").expect("test: known model");
        assert_eq!(model.family, "mistral");
    }

    #[test]
    fn test_get_resolves_alias() {
        let reg = registry();
        let model = reg.get("coder").expect("test: alias resolves");
        assert_eq!(model.id, "deepseek-coder");
    }

    #[test]
    fn test_get_unknown_is_not_found() {
        let reg = registry();
        let err = reg.get("ghost").expect_err("test: unknown model");
        assert!(matches!(err, OrchestratorError::ModelNotFound(_)));
    }

    #[test]
    fn test_list_sorted_ascending() {
        let reg = registry();
        let ids: Vec<_> = reg.list(None).iter().map(|m| m.spec.id.clone()).collect();
        assert_eq!(ids, vec!["deepseek-coder", "mistral"]);
    }

    #[test]
    fn test_list_filters_by_capability() {
        let reg = registry();
        let filter = ModelFilter {
            capability: Some("code".into()),
            ..ModelFilter::default()
        };
        let infos = reg.list(Some(&filter));
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].spec.id, "deepseek-coder");
    }

    #[test]
    fn test_refresh_disables_removed_models() {
        let reg = registry();
        reg.refresh(&[spec("mistral", "mistral", &["general"])], HashMap::new());

        // Removed from config: invisible in get(), but info() still knows it.
        assert!(reg.get("deepseek-coder").is_err());
        let info = reg.info("deepseek-coder").expect("test: still in catalog");
        assert!(!info.enabled);
        assert!(reg.get("mistral").is_ok());
    }

    #[test]
    fn test_refresh_reenables_restored_model() {
        let reg = registry();
        reg.refresh(&[spec("mistral", "mistral", &[])], HashMap::new());
        assert!(!reg.is_enabled("deepseek-coder"));

        reg.refresh(
            &[
                spec("mistral", "mistral", &[]),
                spec("deepseek-coder", "deepseek", &["code"]),
            ],
            HashMap::new(),
        );
        assert!(reg.is_enabled("deepseek-coder"));
    }

    #[test]
    fn test_ids_with_capability_sorted() {
        let reg = ModelRegistry::new(
            &[
                spec("zeta", "z", &["fast"]),
                spec("alpha", "a", &["fast"]),
                spec("mid", "m", &["slow"]),
            ],
            HashMap::new(),
        );
        assert_eq!(reg.ids_with_capability("fast"), vec!["alpha", "zeta"]);
    }
}
