//! Name-keyed registry for orchestrations and activities
//!
//! `Registry<H>` stores handler trait objects by name. Both registries are immutable once
//! built and cheap to clone; the builder collects duplicate registrations as errors instead
//! of silently replacing a handler.

use super::{ActivityHandler, FnActivity, FnOrchestration, OrchestrationHandler};
use crate::_typed_codec::{Codec, Json};
use crate::{ActivityContext, Error, OrchestrationContext};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

pub struct Registry<H: ?Sized> {
    pub(crate) inner: Arc<HashMap<String, Arc<H>>>,
}

// Manual Clone impl since H: ?Sized doesn't auto-derive Clone
impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
        }
    }
}

pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, Arc<H>>,
    errors: Vec<String>,
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

// ============================================================================
// Generic Registry Implementation
// ============================================================================

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn builder_from(reg: &Registry<H>) -> RegistryBuilder<H> {
        RegistryBuilder {
            map: reg.inner.as_ref().clone(),
            errors: Vec::new(),
        }
    }

    /// Look up a handler by name. Misses are logged with the registry contents.
    pub fn get(&self, name: &str) -> Option<Arc<H>> {
        let found = self.inner.get(name).cloned();
        if found.is_none() {
            self.log_registry_miss(name);
        }
        found
    }

    /// Registered names, sorted.
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }

    fn log_registry_miss(&self, name: &str) {
        tracing::debug!(
            target: "agentflow::runtime::registry",
            requested_name = %name,
            registered_count = self.inner.len(),
            registered_names = ?self.list_names(),
            "Registry lookup miss"
        );
    }
}

// ============================================================================
// Generic Builder Implementation
// ============================================================================

impl<H: ?Sized> RegistryBuilder<H> {
    pub fn build(self) -> Registry<H> {
        if !self.errors.is_empty() {
            tracing::warn!(
                target: "agentflow::runtime::registry",
                errors = %self.errors.join("; "),
                "Registry built with registration errors; first registration wins"
            );
        }
        Registry {
            inner: Arc::new(self.map),
        }
    }

    /// Build the registry, returning an error if there were any registration errors.
    ///
    /// # Errors
    ///
    /// Returns every registration error joined with `"; "`.
    pub fn build_result(self) -> Result<Registry<H>, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }

    fn merge_registry(mut self, other: Registry<H>, error_prefix: &str) -> Self {
        for (name, handler) in other.inner.iter() {
            if self.map.contains_key(name) {
                self.errors.push(format!("duplicate {error_prefix} in merge: {name}"));
            } else {
                self.map.insert(name.clone(), handler.clone());
            }
        }
        self
    }

    fn insert(&mut self, name: String, handler: Arc<H>, error_prefix: &str) {
        if self.map.contains_key(&name) {
            self.errors
                .push(format!("duplicate {error_prefix} registration: {name}"));
        } else {
            self.map.insert(name, handler);
        }
    }
}

// ============================================================================
// Orchestration Builder - Specialized Methods
// ============================================================================

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, Error>> + Send + 'static,
    {
        self.insert(name.into(), Arc::new(FnOrchestration(f)), "orchestration");
        self
    }

    /// Register an orchestration with serde-typed input and output. Input that fails to
    /// decode fails the instance with `InvalidInput`.
    pub fn register_typed<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, Error>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: OrchestrationContext, input_s: String| {
            let f_inner = Arc::clone(&f);
            async move {
                let input: In = Json::decode(&input_s)?;
                let out: Out = f_inner(ctx, input).await?;
                Json::encode(&out)
            }
        };
        self.insert(name.into(), Arc::new(FnOrchestration(wrapper)), "orchestration");
        self
    }

    pub fn merge(self, other: OrchestrationRegistry) -> Self {
        self.merge_registry(other, "orchestration")
    }
}

// ============================================================================
// Activity Builder - Specialized Methods
// ============================================================================

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, Error>> + Send + 'static,
    {
        self.insert(name.into(), Arc::new(FnActivity(f)), "activity");
        self
    }

    /// Register an activity with serde-typed input and output. Undecodable input raises
    /// `InvalidInput` without calling `f`.
    pub fn register_typed<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, Error>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: ActivityContext, input_s: String| {
            let f_inner = Arc::clone(&f);
            async move {
                let input: In = Json::decode(&input_s)?;
                let out: Out = f_inner(ctx, input).await?;
                Json::encode(&out)
            }
        };
        self.insert(name.into(), Arc::new(FnActivity(wrapper)), "activity");
        self
    }

    pub fn merge(self, other: ActivityRegistry) -> Self {
        self.merge_registry(other, "activity")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Doubled {
        value: u32,
    }

    fn ctx() -> ActivityContext {
        ActivityContext::new("inst", "double", 2, 1)
    }

    #[test]
    fn duplicate_names_are_reported() {
        let result = ActivityRegistry::builder()
            .register("a", |_ctx, s: String| async move { Ok(s) })
            .register("a", |_ctx, s: String| async move { Ok(s) })
            .build_result();
        let err = result.err().unwrap();
        assert!(err.contains("duplicate activity registration: a"));
    }

    #[test]
    fn merge_detects_collisions() {
        let first = OrchestrationRegistry::builder()
            .register("o", |_ctx, s: String| async move { Ok(s) })
            .build();
        let err = OrchestrationRegistry::builder()
            .register("o", |_ctx, s: String| async move { Ok(s) })
            .merge(first)
            .build_result()
            .err()
            .unwrap();
        assert!(err.contains("duplicate orchestration in merge: o"));
    }

    #[test]
    fn lookup_and_listing() {
        let reg = ActivityRegistry::builder()
            .register("b", |_ctx, s: String| async move { Ok(s) })
            .register("a", |_ctx, s: String| async move { Ok(s) })
            .build();
        assert!(reg.has("a"));
        assert!(reg.get("missing").is_none());
        assert_eq!(reg.list_names(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(reg.count(), 2);
    }

    #[tokio::test]
    async fn typed_activity_decodes_and_encodes() {
        let reg = ActivityRegistry::builder()
            .register_typed("double", |_ctx, input: Doubled| async move {
                Ok(Doubled { value: input.value * 2 })
            })
            .build();
        let handler = reg.get("double").unwrap();
        let out = handler.invoke(ctx(), r#"{"value":21}"#.to_string()).await.unwrap();
        assert_eq!(out, r#"{"value":42}"#);

        let err = handler.invoke(ctx(), r#"{"nope":1}"#.to_string()).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidInput");
    }
}
