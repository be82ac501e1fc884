use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::contracts::{Configurable, Initializer, Module, PostStarter, Routable};

/// A module as handed to the controller: the mandatory core plus the
/// capability slots it fills.
pub struct ModuleDef {
    core: Arc<dyn Module>,
    config: Option<Arc<dyn Configurable>>,
    init: Option<Arc<dyn Initializer>>,
    post_start: Option<Arc<dyn PostStarter>>,
    routes: Option<Arc<dyn Routable>>,
}

impl ModuleDef {
    /// A module without optional capabilities.
    pub fn new(core: Arc<dyn Module>) -> Self {
        Self {
            core,
            config: None,
            init: None,
            post_start: None,
            routes: None,
        }
    }

    /// Typed builder: capability setters exist only for traits `M` implements.
    pub fn builder<M: Module>(module: Arc<M>) -> ModuleBuilder<M> {
        ModuleBuilder {
            def: ModuleDef::new(module.clone()),
            module,
        }
    }
}

impl<M: Module> From<Arc<M>> for ModuleDef {
    fn from(module: Arc<M>) -> Self {
        ModuleDef::new(module)
    }
}

pub struct ModuleBuilder<M> {
    module: Arc<M>,
    def: ModuleDef,
}

impl<M: Module> ModuleBuilder<M> {
    #[must_use]
    pub fn configurable(mut self) -> Self
    where
        M: Configurable,
    {
        self.def.config = Some(self.module.clone());
        self
    }

    #[must_use]
    pub fn initializer(mut self) -> Self
    where
        M: Initializer,
    {
        self.def.init = Some(self.module.clone());
        self
    }

    #[must_use]
    pub fn post_starter(mut self) -> Self
    where
        M: PostStarter,
    {
        self.def.post_start = Some(self.module.clone());
        self
    }

    #[must_use]
    pub fn routable(mut self) -> Self
    where
        M: Routable,
    {
        self.def.routes = Some(self.module.clone());
        self
    }

    pub fn build(self) -> ModuleDef {
        self.def
    }
}

impl<M: Module> From<ModuleBuilder<M>> for ModuleDef {
    fn from(b: ModuleBuilder<M>) -> Self {
        b.build()
    }
}

/// Registration entry: `{name, module}` plus the capability slots.
pub struct ModuleEntry {
    pub name: String,
    pub core: Arc<dyn Module>,
    pub config: Option<Arc<dyn Configurable>>,
    pub init: Option<Arc<dyn Initializer>>,
    pub post_start: Option<Arc<dyn PostStarter>>,
    pub routes: Option<Arc<dyn Routable>>,
}

impl std::fmt::Debug for ModuleEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleEntry")
            .field("name", &self.name)
            .field("is_configurable", &self.config.is_some())
            .field("is_initializer", &self.init.is_some())
            .field("is_post_starter", &self.post_start.is_some())
            .field("is_routable", &self.routes.is_some())
            .finish()
    }
}

/// Ordered, named registry of modules.
///
/// Registration order is the order of every forward phase; stop runs in
/// reverse. Iteration works on a snapshot, so a visitor may call back into the
/// controller without deadlocking.
#[derive(Default)]
pub struct Controller {
    modules: RwLock<Vec<Arc<ModuleEntry>>>,
    sealed: AtomicBool,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("modules", &self.names())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

impl Controller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a module. Names must be non-empty and unique.
    pub fn add(&self, name: impl Into<String>, def: impl Into<ModuleDef>) -> Result<(), RegistryError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }

        let def = def.into();
        let mut modules = self.modules.write();
        // Checked under the write lock so a concurrent `seal` can't slip between.
        if self.is_sealed() {
            return Err(RegistryError::Sealed(name));
        }
        if modules.iter().any(|e| e.name == name) {
            return Err(RegistryError::Duplicate(name));
        }

        tracing::debug!(module = %name, "module registered");
        modules.push(Arc::new(ModuleEntry {
            name,
            core: def.core,
            config: def.config,
            init: def.init,
            post_start: def.post_start,
            routes: def.routes,
        }));
        Ok(())
    }

    /// Visit modules in registration order until `visitor` returns `false`.
    pub fn range<F>(&self, mut visitor: F)
    where
        F: FnMut(&ModuleEntry) -> bool,
    {
        for e in self.snapshot() {
            if !visitor(&e) {
                break;
            }
        }
    }

    /// Visit modules in registration order, stopping at the first error.
    pub fn try_range<F, E>(&self, mut visitor: F) -> Result<(), E>
    where
        F: FnMut(&ModuleEntry) -> Result<(), E>,
    {
        for e in self.snapshot() {
            visitor(&e)?;
        }
        Ok(())
    }

    /// Entries in registration order, taken under a read lock.
    pub fn snapshot(&self) -> Vec<Arc<ModuleEntry>> {
        self.modules.read().clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ModuleEntry>> {
        self.modules.read().iter().find(|e| e.name == name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.modules.read().iter().map(|e| e.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.modules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.read().is_empty()
    }

    pub fn configurables(&self) -> Vec<Arc<ModuleEntry>> {
        self.filtered(|e| e.config.is_some())
    }

    pub fn initializers(&self) -> Vec<Arc<ModuleEntry>> {
        self.filtered(|e| e.init.is_some())
    }

    pub fn post_starters(&self) -> Vec<Arc<ModuleEntry>> {
        self.filtered(|e| e.post_start.is_some())
    }

    pub fn routables(&self) -> Vec<Arc<ModuleEntry>> {
        self.filtered(|e| e.routes.is_some())
    }

    fn filtered(&self, pred: impl Fn(&ModuleEntry) -> bool) -> Vec<Arc<ModuleEntry>> {
        self.modules
            .read()
            .iter()
            .filter(|e| pred(e))
            .cloned()
            .collect()
    }

    /// Refuse further registrations; called when a run begins.
    pub(crate) fn seal(&self) {
        let _guard = self.modules.write();
        self.sealed.store(true, Ordering::Release);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }
}

/// Structured errors for module registration.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("module name must not be empty")]
    EmptyName,
    #[error("Module '{0}' is already registered")]
    Duplicate(String),
    #[error("cannot register module '{0}': the application is already running")]
    Sealed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigCell, ConfigTarget};
    use crate::context::AppContext;
    use axum::Router;

    /* --------------------------- Test helpers ------------------------- */
    #[derive(Default)]
    struct DummyCore;
    #[async_trait::async_trait]
    impl Module for DummyCore {
        async fn start(&self, _ctx: &AppContext) -> anyhow::Result<()> {
            Ok(())
        }
        async fn stop(&self, _ctx: &AppContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct FullModule {
        cfg: ConfigCell<serde_json::Value>,
    }
    #[async_trait::async_trait]
    impl Module for FullModule {
        async fn start(&self, _ctx: &AppContext) -> anyhow::Result<()> {
            Ok(())
        }
        async fn stop(&self, _ctx: &AppContext) -> anyhow::Result<()> {
            Ok(())
        }
    }
    impl Configurable for FullModule {
        fn config(&self) -> anyhow::Result<&dyn ConfigTarget> {
            Ok(&self.cfg)
        }
    }
    impl Routable for FullModule {
        fn route(&self, _ctx: &AppContext, router: Router) -> anyhow::Result<Router> {
            Ok(router)
        }
    }

    /* ------------------------------- Tests ---------------------------- */

    #[test]
    fn preserves_registration_order() {
        let c = Controller::new();
        for name in ["c", "a", "b"] {
            c.add(name, Arc::new(DummyCore)).unwrap();
        }
        assert_eq!(c.names(), vec!["c", "a", "b"]);
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let c = Controller::new();
        c.add("a", Arc::new(DummyCore)).unwrap();
        let err = c.add("a", Arc::new(DummyCore)).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(ref n) if n == "a"));
        assert!(err.to_string().contains("already registered"));
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn empty_name_is_rejected() {
        let c = Controller::new();
        assert!(matches!(
            c.add("  ", Arc::new(DummyCore)),
            Err(RegistryError::EmptyName)
        ));
        assert!(c.is_empty());
    }

    #[test]
    fn sealed_controller_rejects_add() {
        let c = Controller::new();
        c.seal();
        assert!(matches!(
            c.add("late", Arc::new(DummyCore)),
            Err(RegistryError::Sealed(_))
        ));
    }

    #[test]
    fn range_stops_at_first_false() {
        let c = Controller::new();
        for name in ["a", "b", "c"] {
            c.add(name, Arc::new(DummyCore)).unwrap();
        }

        let mut seen = Vec::new();
        c.range(|e| {
            seen.push(e.name.clone());
            e.name != "b"
        });
        assert_eq!(seen, vec!["a", "b"]);
    }

    #[test]
    fn try_range_propagates_first_error() {
        let c = Controller::new();
        for name in ["a", "b", "c"] {
            c.add(name, Arc::new(DummyCore)).unwrap();
        }

        let mut seen = Vec::new();
        let res: Result<(), String> = c.try_range(|e| {
            seen.push(e.name.clone());
            if e.name == "b" {
                Err(format!("boom at {}", e.name))
            } else {
                Ok(())
            }
        });
        assert_eq!(res.unwrap_err(), "boom at b");
        assert_eq!(seen, vec!["a", "b"]);
    }

    #[test]
    fn visitor_may_call_back_into_controller() {
        let c = Controller::new();
        c.add("a", Arc::new(DummyCore)).unwrap();
        c.add("b", Arc::new(DummyCore)).unwrap();

        let mut lens = Vec::new();
        c.range(|e| {
            lens.push((e.name.clone(), c.len(), c.get(&e.name).is_some()));
            true
        });
        assert_eq!(
            lens,
            vec![("a".to_string(), 2, true), ("b".to_string(), 2, true)]
        );
    }

    #[test]
    fn builder_fills_only_declared_capabilities() {
        let c = Controller::new();
        let full = Arc::new(FullModule {
            cfg: ConfigCell::new("full", serde_json::json!({})),
        });
        c.add("full", ModuleDef::builder(full).configurable().routable())
            .unwrap();
        c.add("plain", Arc::new(DummyCore)).unwrap();

        let e = c.get("full").unwrap();
        assert!(e.config.is_some());
        assert!(e.routes.is_some());
        assert!(e.init.is_none());
        assert!(e.post_start.is_none());

        let names = |v: Vec<Arc<ModuleEntry>>| v.iter().map(|e| e.name.clone()).collect::<Vec<_>>();
        assert_eq!(names(c.configurables()), vec!["full"]);
        assert_eq!(names(c.routables()), vec!["full"]);
        assert!(c.initializers().is_empty());
        assert!(c.post_starters().is_empty());
    }
}
