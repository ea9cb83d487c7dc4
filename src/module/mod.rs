//! Module host: boot/init of the modules that register rules, target
//! types, and variables.
//!
//! A module is addressable by name. `boot` performs the minimum
//! registration needed before any of its variables can be read and runs
//! during load before the first real buildfile declaration; `init` is the
//! full initialization and may load other modules, passing configuration
//! hints. An optional module that is not configured returns false from
//! `init` instead of failing; its `<name>.configured` variable records
//! the outcome for dependent code.

pub mod config;
pub mod gen;
pub mod testm;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{bail, Result};

use crate::core::scope::{Scope, ScopeId};
use crate::core::variable::{Value, Visibility};
use crate::engine::Engine;
use crate::util::diagnostic::Location;
use crate::util::Symbol;

/// Configuration hints passed from a loading module to the loaded one
/// (e.g. a target platform the first module already extracted).
pub type ConfigHints = BTreeMap<Symbol, Value>;

/// A module.
pub trait Module: Send + Sync {
    fn name(&self) -> &'static str;

    /// Minimum registration; called during load before the first real
    /// buildfile declaration of the project.
    fn boot(&self, engine: &Engine, root: &Arc<Scope>, loc: &Location) -> Result<()>;

    /// Full initialization. Returns false (only when `optional`) to say
    /// "not configured yet".
    fn init(
        &self,
        engine: &Engine,
        root: &Arc<Scope>,
        base: &Arc<Scope>,
        first: bool,
        optional: bool,
        hints: &ConfigHints,
    ) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, Default)]
struct ModuleEntry {
    booted: bool,
    inited: bool,
    configured: bool,
}

/// Loaded-module state per project root scope, plus the registry of
/// modules that are compiled in.
pub struct ModuleHost {
    registry: RwLock<HashMap<&'static str, Arc<dyn Module>>>,
    state: Mutex<HashMap<(ScopeId, String), ModuleEntry>>,
}

impl ModuleHost {
    /// An empty host (no modules available).
    pub fn new() -> Self {
        ModuleHost { registry: RwLock::new(HashMap::new()), state: Mutex::new(HashMap::new()) }
    }

    /// A host with the builtin modules registered.
    pub fn with_builtins() -> Self {
        let host = Self::new();
        host.register(Arc::new(config::ConfigModule));
        host.register(Arc::new(testm::TestModule));
        host.register(Arc::new(gen::GenModule));
        host
    }

    pub fn register(&self, m: Arc<dyn Module>) {
        self.registry.write().unwrap().insert(m.name(), m);
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.registry.read().unwrap().get(name).cloned()
    }

    /// Boot a module for a project (idempotent).
    pub fn boot(
        &self,
        engine: &Engine,
        root: &Arc<Scope>,
        name: &str,
        loc: &Location,
    ) -> Result<()> {
        let Some(module) = self.find(name) else {
            bail!("{}: unknown module {}", loc, name);
        };

        {
            let state = self.state.lock().unwrap();
            if state.get(&(root.id, name.to_string())).is_some_and(|e| e.booted) {
                return Ok(());
            }
        }

        module.boot(engine, root, loc)?;

        let mut state = self.state.lock().unwrap();
        state.entry((root.id, name.to_string())).or_default().booted = true;
        Ok(())
    }

    /// Load (boot if needed) and initialize a module. Returns whether the
    /// module is configured; false is possible only for optional loads.
    pub fn load(
        &self,
        engine: &Engine,
        root: &Arc<Scope>,
        base: &Arc<Scope>,
        name: &str,
        optional: bool,
        hints: &ConfigHints,
    ) -> Result<bool> {
        {
            let state = self.state.lock().unwrap();
            if let Some(e) = state.get(&(root.id, name.to_string())) {
                if e.inited {
                    return Ok(e.configured);
                }
            }
        }

        let Some(module) = self.find(name) else {
            if optional {
                tracing::debug!(module = name, "optional module not found");
                return Ok(false);
            }
            bail!("unknown module {}", name);
        };

        let booted = {
            let state = self.state.lock().unwrap();
            state.get(&(root.id, name.to_string())).is_some_and(|e| e.booted)
        };
        if !booted {
            module.boot(engine, root, &Location::default())?;
        }

        let configured = module.init(engine, root, base, true, optional, hints)?;

        if !configured && !optional {
            bail!("module {} failed to configure", name);
        }

        // Record <name>.configured for dependent code.
        let var = engine
            .var_pool
            .insert(format!("{}.configured", name), None, Visibility::Project, false)
            .expect("untyped insertion cannot conflict");
        root.vars()
            .write()
            .unwrap()
            .assign(
                &var,
                Some(Value::Bool(configured)),
                engine.load_generation(),
            )
            .ok();

        let mut state = self.state.lock().unwrap();
        let entry = state.entry((root.id, name.to_string())).or_default();
        entry.booted = true;
        entry.inited = true;
        entry.configured = configured;

        Ok(configured)
    }

    /// Whether a module was loaded and configured for a project.
    pub fn configured(&self, root: ScopeId, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .get(&(root, name.to_string()))
            .is_some_and(|e| e.configured)
    }

    /// Drop all per-project module state (engine reset).
    pub fn clear(&self) {
        self.state.lock().unwrap().clear();
    }
}

impl Default for ModuleHost {
    fn default() -> Self {
        Self::new()
    }
}
