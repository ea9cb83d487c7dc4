//! The `configure` and `disfigure` meta-operations and the persisted
//! project state they manage.
//!
//! Two files live under `build/` inside the out-tree project root:
//! `build/config.build` with the saved `config.*` variables, and
//! `build/bootstrap/src-root.build` carrying the src root for
//! out-of-source builds. Disfigure removes them and prunes the emptied
//! directories.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::core::action::{Action, MetaOperationId, OperationId};
use crate::core::scope::Scope;
use crate::core::target::TargetState;
use crate::engine::Engine;
use crate::ops::{ActionTarget, MetaOperation, MID_CONFIGURE, MID_DISFIGURE, OP_DEFAULT};
use crate::util::diagnostic::{text, Diagnostic};
use crate::util::fs::{self, RmdirStatus};

const BUILD_DIR: &str = "build";
const BOOTSTRAP_DIR: &str = "build/bootstrap";
const CONFIG_FILE: &str = "build/config.build";
const SRC_ROOT_FILE: &str = "build/bootstrap/src-root.build";

/// Read the persisted src root of an out-tree project root, if any.
pub fn read_src_root(out_root: &Path) -> Result<Option<PathBuf>> {
    let f = out_root.join(SRC_ROOT_FILE);
    if !fs::exists(&f) {
        return Ok(None);
    }

    let content = fs::read(&f)?;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("src_root") {
            let rest = rest.trim_start();
            if let Some(v) = rest.strip_prefix('=') {
                let v = v.trim();
                return Ok(Some(PathBuf::from(v.trim_end_matches('/'))));
            }
        }
    }

    bail!("invalid {}", f.display())
}

fn save_src_root(out_root: &Path, src_root: &Path) -> Result<()> {
    let f = out_root.join(SRC_ROOT_FILE);
    if crate::util::diagnostic::verbosity() >= 2 {
        text(2, format!("cat >{}", f.display()));
    } else {
        text(1, format!("save {}", f.display()));
    }

    fs::write(
        &f,
        &format!(
            "# Created automatically by the config module.\n#\nsrc_root = {}/\n",
            src_root.display()
        ),
    )
}

/// Persist the `config.*` namespace of a project root scope.
fn save_config(e: &Engine, root: &Arc<Scope>) -> Result<()> {
    let f = root.out_path.join(CONFIG_FILE);
    if crate::util::diagnostic::verbosity() >= 2 {
        text(2, format!("cat >{}", f.display()));
    } else {
        text(1, format!("save {}", f.display()));
    }

    let mut out = String::from("# Created automatically by the config module.\n#\n");

    let vars = root.vars().read().unwrap();
    for (name, entry) in vars.namespace("config") {
        // Warn when the value being saved differs from the one on the
        // command line (a previously configured value wins).
        if let Some(o) = e.overrides.iter().find(|o| o.name == name) {
            let ours = entry.value.as_ref().map(|v| v.to_names());
            if ours.as_deref() != Some(&o.value[..]) {
                Diagnostic::warning(format!(
                    "variable {} configured value differs from command line value",
                    name
                ))
                .note("reconfigure the project to use the command line value")
                .emit();
            }
        }

        match &entry.value {
            Some(v) => out.push_str(&format!("{} = {}\n", name, v)),
            None => out.push_str(&format!("{} =\n", name)),
        }
    }
    drop(vars);

    fs::write(&f, &out)
}

/// Parse a `config.build` file into a project root scope. Used during
/// project bootstrap by the config module.
pub fn load_config(e: &Engine, root: &Arc<Scope>) -> Result<()> {
    let f = root.out_path.join(CONFIG_FILE);
    if !fs::exists(&f) {
        return Ok(());
    }

    let content = fs::read(&f)?;
    for (n, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((name, value)) = line.split_once('=') else {
            bail!("{}:{}: expected variable assignment", f.display(), n + 1);
        };
        let name = name.trim();

        let var = e
            .var_pool
            .insert(name, None, crate::core::variable::Visibility::Project, true)
            .with_context(|| format!("{}:{}", f.display(), n + 1))?;

        let names: Vec<crate::core::variable::Name> = value
            .split_whitespace()
            .map(crate::core::variable::Name::simple)
            .collect();
        let value = if names.is_empty() {
            None
        } else {
            Some(crate::core::variable::Value::Untyped(names))
        };

        root.vars()
            .write()
            .unwrap()
            .assign(&var, value, e.load_generation())
            .with_context(|| format!("{}:{}", f.display(), n + 1))?;
    }

    Ok(())
}

/// `configure`: a normal load and match, then persist the configuration
/// instead of executing recipes.
pub struct Configure;

impl MetaOperation for Configure {
    fn id(&self) -> MetaOperationId {
        MID_CONFIGURE
    }

    fn name(&self) -> &'static str {
        "configure"
    }

    fn operation_pre(&self, _e: &Arc<Engine>, o: OperationId) -> Result<OperationId> {
        // Don't translate default to update: unspecified means configure
        // everything.
        Ok(o)
    }

    fn execute(
        &self,
        e: &Arc<Engine>,
        a: Action,
        roots: &[ActionTarget],
    ) -> Result<TargetState> {
        for r in roots {
            let ActionTarget::Target(id) = r else { continue };
            let t = e.targets.get(*id);

            let scope = e.scopes.scope_of(&t.key.out_dir);
            let Some(root) = e.scopes.root_of(scope.id) else {
                bail!("out of project target {}", t);
            };

            // Operation-specific configure intentionally does nothing,
            // silently (matching the original behavior).
            if a.operation != OP_DEFAULT {
                continue;
            }

            tracing::debug!(out_root = %root.out_path.display(), "configuring");

            if e.dry_run {
                continue;
            }

            let out_of_source = !root.out_eq_src();
            if out_of_source {
                fs::mkdir(&root.out_path)?;
                fs::mkdir(&root.out_path.join(BUILD_DIR))?;
                fs::mkdir(&root.out_path.join(BOOTSTRAP_DIR))?;
                save_src_root(&root.out_path, root.src_path())?;
            } else {
                fs::mkdir(&root.out_path.join(BUILD_DIR))?;
            }

            save_config(e, &root)?;
        }

        Ok(TargetState::Changed)
    }
}

/// `disfigure`: remove the persisted configuration. Buildfiles are not
/// loaded (anything loadable under the old configuration is suspect) and
/// nothing is matched; the roots are the project scopes themselves.
pub struct Disfigure;

impl MetaOperation for Disfigure {
    fn id(&self) -> MetaOperationId {
        MID_DISFIGURE
    }

    fn name(&self) -> &'static str {
        "disfigure"
    }

    fn operation_pre(&self, _e: &Arc<Engine>, o: OperationId) -> Result<OperationId> {
        Ok(o)
    }

    fn wants_load(&self) -> bool {
        false
    }

    fn wants_match(&self) -> bool {
        false
    }

    fn execute(
        &self,
        e: &Arc<Engine>,
        a: Action,
        roots: &[ActionTarget],
    ) -> Result<TargetState> {
        let mut state = TargetState::Unchanged;

        for r in roots {
            let ActionTarget::Scope(sid) = r else { continue };
            let root = e.scopes.get(*sid);
            let out_root = root.out_path.clone();

            // Operation-specific disfigure intentionally does nothing,
            // silently (matching the original behavior).
            if a.operation != OP_DEFAULT {
                continue;
            }

            if e.dry_run {
                continue;
            }

            let mut m = false;

            m = fs::rmfile(&out_root.join(CONFIG_FILE))? || m;

            if !root.out_eq_src() {
                m = fs::rmfile(&out_root.join(SRC_ROOT_FILE))? || m;

                m = matches!(
                    fs::rmdir(&out_root.join(BOOTSTRAP_DIR))?,
                    RmdirStatus::Removed
                ) || m;
                m = matches!(fs::rmdir(&out_root.join(BUILD_DIR))?, RmdirStatus::Removed)
                    || m;

                if out_root == e.work_dir {
                    Diagnostic::warning(format!(
                        "directory {} is current working directory, not removing",
                        out_root.display()
                    ))
                    .emit();
                } else {
                    match fs::rmdir(&out_root)? {
                        RmdirStatus::Removed => m = true,
                        RmdirStatus::NotEmpty => {
                            Diagnostic::warning(format!(
                                "directory {} is not empty, not removing",
                                out_root.display()
                            ))
                            .emit();
                        }
                        RmdirStatus::NotFound => {}
                    }
                }
            } else {
                m = matches!(fs::rmdir(&out_root.join(BUILD_DIR))?, RmdirStatus::Removed)
                    || m;
            }

            if m {
                state |= TargetState::Changed;
            } else {
                Diagnostic::info(format!(
                    "{}/ is already disfigured",
                    out_root.display()
                ))
                .emit();
            }
        }

        Ok(state)
    }

    fn post(&self, e: &Arc<Engine>) -> Result<()> {
        // Anything loaded earlier used a configuration that no longer
        // exists.
        e.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_src_root_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");
        fs::mkdir(&out.join(BOOTSTRAP_DIR)).unwrap();

        save_src_root(&out, Path::new("/work/src/proj")).unwrap();

        let read = read_src_root(&out).unwrap();
        assert_eq!(read, Some(PathBuf::from("/work/src/proj")));

        let content = fs::read(&out.join(SRC_ROOT_FILE)).unwrap();
        assert!(content.contains("src_root = /work/src/proj/"));
        assert!(content.starts_with("# Created automatically by the config module."));
    }

    #[test]
    fn test_read_src_root_missing() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(read_src_root(tmp.path()).unwrap(), None);
    }
}
