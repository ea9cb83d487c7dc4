//! The config module: persisted project configuration.
//!
//! Boot brings the saved `config.*` values from `build/config.build` into
//! the project root scope and materializes command-line values for
//! variables that are not configured yet. Saving and removing the
//! persisted state belongs to the configure/disfigure meta-operations.

use std::sync::Arc;

use anyhow::Result;

use crate::core::scope::Scope;
use crate::core::variable::{OverrideKind, Value, Visibility};
use crate::engine::Engine;
use crate::module::{ConfigHints, Module};
use crate::util::diagnostic::Location;

pub struct ConfigModule;

impl Module for ConfigModule {
    fn name(&self) -> &'static str {
        "config"
    }

    fn boot(&self, engine: &Engine, root: &Arc<Scope>, _loc: &Location) -> Result<()> {
        crate::ops::configure::load_config(engine, root)?;

        // Command-line values win for variables that are not configured
        // yet; a previously configured value is kept (the configure
        // save path warns about the difference).
        for o in &engine.overrides {
            if o.kind != OverrideKind::Assign || !o.name.starts_with("config.") {
                continue;
            }

            let var = engine
                .var_pool
                .insert(o.name, None, Visibility::Project, true)
                .expect("untyped insertion cannot conflict");

            let mut vars = root.vars().write().unwrap();
            if vars.get(&o.name).is_none() {
                vars.assign_override(
                    &var,
                    Some(Value::Untyped(o.value.clone())),
                    engine.load_generation(),
                )?;
            }
        }

        Ok(())
    }

    fn init(
        &self,
        _engine: &Engine,
        _root: &Arc<Scope>,
        _base: &Arc<Scope>,
        _first: bool,
        _optional: bool,
        _hints: &ConfigHints,
    ) -> Result<bool> {
        Ok(true)
    }
}
