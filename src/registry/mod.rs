//! The unit registry: ownership of every unit and all bulk orchestration.
//!
//! A registry is rooted at one directory; every direct subdirectory is a
//! unit. All mutating operations must be serialized onto one logical thread
//! — the registry holds no locks, the dominant cost is the blocking external
//! compiler, and none of the structures here are built for concurrent
//! mutation. No operation supports cancellation once started: a hung
//! compile or a hung hook blocks the calling thread.

mod recompile;
mod report;

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use indicatif::ProgressBar;

pub use recompile::DependentsPolicy;
pub use report::{LoadReport, RecompileReport, SyncReport, UnloadReport};

use crate::error::{
    LoadError, RegistryError, StructuralError, UnitError, UnitErrorKind, UnloadError,
};
use crate::graph::DependencyGraph;
use crate::host::{ModuleHost, StateListener};
use crate::namespace::{Namespace, Resolver};
use crate::unit::{DescriptorView, Env, Unit};
use crate::util::{PROGRESS_STYLE, as_overhead};

/// How [`Registry::unload_unit`] treats loaded dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadMode {
    /// Refuse to unload while loaded dependents exist.
    Strict,
    /// Unload loaded dependents first, recursively.
    Recursive,
    /// Unload just this unit; the caller guarantees ordering.
    Unchecked,
}

/// A builder for a [`Registry`] with specified platform boundaries.
pub struct RegistryConfig {
    root: Utf8PathBuf,
    compiler: Box<dyn crate::compiler::Compiler>,
    host: Box<dyn ModuleHost>,
    listener: Option<Box<dyn StateListener>>,
    search_path: Vec<Utf8PathBuf>,
    runtime_bundle: Option<Utf8PathBuf>,
    delegate: Option<Arc<Namespace>>,
    core: Option<Arc<Namespace>>,
}

impl RegistryConfig {
    /// Paths every compile sees on its search path, ahead of dependency
    /// bundles — the process's own bundle locations.
    pub fn search_path(mut self, paths: impl IntoIterator<Item = impl Into<Utf8PathBuf>>) -> Self {
        self.search_path.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Location of this library's own packaged bundle, appended to every
    /// compile search path.
    pub fn runtime_bundle(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.runtime_bundle = Some(path.into());
        self
    }

    pub fn listener(mut self, listener: Box<dyn StateListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Delegate namespace tried after unit dependencies, before the core
    /// namespace.
    pub fn delegate(mut self, namespace: Arc<Namespace>) -> Self {
        self.delegate = Some(namespace);
        self
    }

    /// Resolver backing the core namespace, the final stage of every unit's
    /// chain. Shared framework types resolve here even when the delegate is
    /// narrow or absent. Defaults to resolving nothing.
    pub fn core_resolver(mut self, resolver: Box<dyn Resolver>) -> Self {
        self.core = Some(Namespace::of("core", resolver));
        self
    }

    pub fn finish(self) -> Registry {
        Registry {
            root: self.root,
            units: BTreeMap::new(),
            compiler: self.compiler,
            host: self.host,
            listener: self.listener,
            search_path: self.search_path,
            runtime_bundle: self.runtime_bundle,
            delegate: self.delegate,
            core: self.core.unwrap_or_else(|| Namespace::empty("core")),
        }
    }
}

/// Owns the set of units and drives every bulk operation over them.
pub struct Registry {
    root: Utf8PathBuf,
    units: BTreeMap<String, Unit>,
    compiler: Box<dyn crate::compiler::Compiler>,
    host: Box<dyn ModuleHost>,
    listener: Option<Box<dyn StateListener>>,
    search_path: Vec<Utf8PathBuf>,
    runtime_bundle: Option<Utf8PathBuf>,
    delegate: Option<Arc<Namespace>>,
    core: Arc<Namespace>,
}

impl Registry {
    pub fn config(
        root: impl Into<Utf8PathBuf>,
        compiler: Box<dyn crate::compiler::Compiler>,
        host: Box<dyn ModuleHost>,
    ) -> RegistryConfig {
        RegistryConfig {
            root: root.into(),
            compiler,
            host,
            listener: None,
            search_path: Vec::new(),
            runtime_bundle: None,
            delegate: None,
            core: None,
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Registered unit names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.units.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&Unit> {
        self.units.get(name)
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.units.get(name).is_some_and(Unit::is_loaded)
    }

    pub fn version_of(&self, name: &str) -> Option<&str> {
        self.units.get(name).and_then(Unit::version)
    }

    /// Register the unit directory `<root>/<name>`. Idempotent.
    pub fn register(&mut self, name: &str) -> Result<(), RegistryError> {
        if self.units.contains_key(name) {
            return Ok(());
        }

        let dir = self.root.join(name);
        if !dir.is_dir() {
            return Err(RegistryError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no unit directory at '{dir}'"),
            )));
        }

        tracing::debug!(unit = name, "registered");
        self.units.insert(name.to_owned(), Unit::open(name, dir));
        Ok(())
    }

    /// Scan the root directory and register every unit not yet known.
    /// Returns the added names, sorted.
    pub fn discover(&mut self) -> io::Result<Vec<String>> {
        let mut added = Vec::new();

        for entry in self.root.read_dir_utf8()? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }

            let name = entry.file_name();
            if name.starts_with('.') || self.units.contains_key(name) {
                continue;
            }

            self.units
                .insert(name.to_owned(), Unit::open(name, entry.path().to_owned()));
            added.push(name.to_owned());
        }

        added.sort();
        if !added.is_empty() {
            tracing::info!(count = added.len(), "discovered new units");
        }
        Ok(added)
    }

    /// Persist the disabled flag of a unit (marker file in its source tree).
    pub fn set_disabled(&mut self, name: &str, disabled: bool) -> Result<(), RegistryError> {
        let unit = self
            .units
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownUnit(name.to_owned()))?;
        unit.set_disabled(disabled)?;
        Ok(())
    }

    /// Unregister a unit and delete its source tree. Refused while loaded.
    pub fn remove(&mut self, name: &str) -> Result<(), RegistryError> {
        let unit = self
            .units
            .get(name)
            .ok_or_else(|| RegistryError::UnknownUnit(name.to_owned()))?;
        if unit.is_loaded() {
            return Err(RegistryError::UnitLoaded(name.to_owned()));
        }

        let dir = unit.dir().to_owned();
        self.units.remove(name);
        if dir.is_dir() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Single-unit load/unload
    // ------------------------------------------------------------------

    pub fn load_unit(&mut self, name: &str) -> Result<(), RegistryError> {
        if !self.units.contains_key(name) {
            return Err(RegistryError::UnknownUnit(name.to_owned()));
        }
        self.load_one(name).map_err(|error| RegistryError::Load {
            unit: name.to_owned(),
            error,
        })
    }

    /// Unload one unit. Returns the full ordered list of units actually
    /// unloaded: the unit first, then any recursively unloaded dependents.
    /// Hook failures stream into `errors`; only a refused `Strict` unload
    /// is raised.
    pub fn unload_unit(
        &mut self,
        name: &str,
        mode: UnloadMode,
        errors: &mut dyn FnMut(UnitError),
    ) -> Result<Vec<String>, RegistryError> {
        let unit = self
            .units
            .get(name)
            .ok_or_else(|| RegistryError::UnknownUnit(name.to_owned()))?;
        if !unit.is_loaded() {
            return Ok(Vec::new());
        }

        let graph = self.loaded_graph();
        let dependents = graph.dependents_closure([&name.to_owned()]);

        match mode {
            UnloadMode::Strict if !dependents.is_empty() => {
                return Err(RegistryError::Unload {
                    unit: name.to_owned(),
                    error: UnloadError::LoadedDependents(dependents),
                });
            }
            UnloadMode::Strict | UnloadMode::Unchecked => {
                let mut sink = Vec::new();
                self.unload_one(name, &mut sink);
                sink.into_iter().for_each(errors);
                Ok(vec![name.to_owned()])
            }
            UnloadMode::Recursive => {
                // Dependents come down before the unit they depend on; the
                // report lists the unit first, then its dependents.
                let mut scope: HashSet<String> = dependents.iter().cloned().collect();
                scope.insert(name.to_owned());

                let mut order = Vec::new();
                let mut walk = graph.dependent_order();
                while let Some(n) = walk.next() {
                    if scope.contains(&n) {
                        order.push(n);
                    }
                }

                let mut sink = Vec::new();
                for n in &order {
                    self.unload_one(n, &mut sink);
                }
                sink.into_iter().for_each(errors);

                let mut report = vec![name.to_owned()];
                report.extend(order.into_iter().filter(|n| n != name));
                Ok(report)
            }
        }
    }

    // ------------------------------------------------------------------
    // Bulk load/unload
    // ------------------------------------------------------------------

    /// Load every registered, enabled, not-yet-loaded unit in dependency
    /// order. A unit failure cuts off everything depending on it with
    /// synthetic blocked errors; unrelated units keep loading.
    pub fn load_all(&mut self) -> LoadReport {
        let s = Instant::now();
        let mut report = LoadReport::default();

        let (graph, mut error_units) = self.analyze_candidates(&mut report.errors);

        let bar = ProgressBar::new(graph.len() as u64);
        bar.set_style(PROGRESS_STYLE.clone());

        let mut walk = graph.dependency_order();
        while let Some(name) = walk.next() {
            bar.set_message(name.clone());

            let failed = if error_units.contains(&name) {
                true
            } else {
                match self.load_one(&name) {
                    Ok(()) => {
                        report.loaded.push(name.clone());
                        false
                    }
                    Err(e) => {
                        report.errors.push(UnitError::new(&name, e));
                        error_units.insert(name.clone());
                        true
                    }
                }
            };

            if failed {
                for blocked in walk.cut_from_last() {
                    bar.inc(1);
                    if error_units.insert(blocked.clone()) {
                        report
                            .errors
                            .push(UnitError::new(blocked, UnitErrorKind::Blocked(name.clone())));
                    }
                }
            }

            bar.inc(1);
        }

        bar.finish_with_message(format!(
            "Loaded {} units {}",
            report.loaded.len(),
            as_overhead(s)
        ));

        report
    }

    /// Unload every loaded unit, dependents first. Hook failures are
    /// collected, never fatal.
    pub fn unload_all(&mut self) -> UnloadReport {
        let mut report = UnloadReport::default();

        let graph = self.loaded_graph();
        let mut walk = graph.dependent_order();
        while let Some(name) = walk.next() {
            report.unloaded.push(name);
        }
        drop(walk);

        for name in report.unloaded.clone() {
            self.unload_one(&name, &mut report.errors);
        }

        report
    }

    // ------------------------------------------------------------------
    // Internals shared with recompile.rs
    // ------------------------------------------------------------------

    fn env(&self) -> Env<'_> {
        Env {
            compiler: self.compiler.as_ref(),
            host: self.host.as_ref(),
            listener: self.listener.as_deref(),
            search_path: &self.search_path,
            runtime_bundle: self.runtime_bundle.as_deref(),
            delegate: self.delegate.as_ref(),
            core: &self.core,
            peers: &self.units,
        }
    }

    /// Run `unit.load` with the unit lifted out of the map, so the env can
    /// hand the remaining units over as peers.
    fn load_one(&mut self, name: &str) -> Result<(), LoadError> {
        let mut unit = self.units.remove(name).expect("unit is registered");
        let result = {
            let env = self.env();
            unit.load(&env)
        };
        self.units.insert(name.to_owned(), unit);
        result
    }

    fn unload_one(&mut self, name: &str, errors: &mut Vec<UnitError>) -> bool {
        let Some(mut unit) = self.units.remove(name) else {
            return false;
        };
        let was_loaded = unit.unload(self.listener.as_deref(), &mut |e| {
            errors.push(UnitError::new(name, e));
        });
        self.units.insert(name.to_owned(), unit);
        was_loaded
    }

    fn compile_one(
        &mut self,
        name: &str,
        view: DescriptorView,
        sink: &mut dyn FnMut(crate::compiler::Diagnostic),
    ) -> Result<(), crate::error::CompileError> {
        let unit = self.units.remove(name).expect("unit is registered");
        let result = {
            let env = self.env();
            unit.compile(&env, view, sink)
        };
        self.units.insert(name.to_owned(), unit);
        result
    }

    /// Graph over the currently loaded units, edges from their frozen
    /// load-time descriptors.
    fn loaded_graph(&self) -> DependencyGraph<String> {
        let mut graph = DependencyGraph::new();

        for unit in self.units.values().filter(|u| u.is_loaded()) {
            graph.add_node(unit.name().to_owned());
        }
        for unit in self.units.values().filter(|u| u.is_loaded()) {
            for dep in unit.frozen_unit_deps() {
                if graph.contains(&dep) {
                    graph.add_edge(unit.name().to_owned(), dep);
                }
            }
        }

        graph
    }

    /// Build the load-all candidate graph from frozen load-time descriptors
    /// and run the full cycle analysis. Every descriptor failure, cycle
    /// member, self-dependency and cycle-tainted unit lands in `errors` and
    /// in the returned error set.
    fn analyze_candidates(
        &self,
        errors: &mut Vec<UnitError>,
    ) -> (DependencyGraph<String>, HashSet<String>) {
        let candidates: Vec<String> = self
            .units
            .values()
            .filter(|u| !u.is_loaded() && !u.is_disabled())
            .map(|u| u.name().to_owned())
            .collect();

        let mut graph = DependencyGraph::new();
        let mut error_units = HashSet::new();

        for name in &candidates {
            graph.add_node(name.clone());
        }

        let bundle_ext = self.compiler.bundle_extension();
        for name in &candidates {
            let descriptor = match self.units[name].load_time_descriptor(bundle_ext) {
                Ok(d) => d,
                Err(e) => {
                    error_units.insert(name.clone());
                    errors.push(UnitError::new(name, e));
                    continue;
                }
            };

            for dep in descriptor.unit_names() {
                let dep = dep.to_owned();
                if self.units.get(&dep).is_some_and(Unit::is_loaded) {
                    // Already satisfied; no ordering constraint.
                    continue;
                }
                if graph.contains(&dep) {
                    graph.add_edge(name.clone(), dep);
                } else {
                    let e = if self.units.contains_key(&dep) {
                        LoadError::DependencyNotLoaded(dep)
                    } else {
                        LoadError::UnknownDependency(dep)
                    };
                    error_units.insert(name.clone());
                    errors.push(UnitError::new(name, e));
                }
            }
        }

        self.flag_cycles(&graph, &mut error_units, errors);
        (graph, error_units)
    }

    /// Mark every cycle member, self-dependency and unit transitively
    /// depending on a cycle as an error unit, each with a distinct message.
    fn flag_cycles(
        &self,
        graph: &DependencyGraph<String>,
        error_units: &mut HashSet<String>,
        errors: &mut Vec<UnitError>,
    ) {
        let cycles = graph.cycles();
        let mut members = Vec::new();

        for cycle in &cycles {
            for member in cycle {
                let e = if cycle.len() == 1 {
                    StructuralError::SelfDependency
                } else {
                    StructuralError::Cycle(cycle.clone())
                };
                error_units.insert(member.clone());
                errors.push(UnitError::new(member, e));
                members.push(member.clone());
            }
        }

        for tainted in graph.dependents_closure(&members) {
            if !error_units.insert(tainted.clone()) {
                continue;
            }
            let reachable = graph.dependencies_closure([&tainted]);
            let member = members
                .iter()
                .find(|m| reachable.contains(m))
                .or(members.first())
                .cloned()
                .expect("taint implies at least one cycle member");
            errors.push(UnitError::new(tainted, StructuralError::DependsOnCycle(member)));
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("root", &self.root)
            .field("units", &self.units.len())
            .finish()
    }
}
