//! Programmable platform fakes shared by the unit and registry tests.
//!
//! The fakes hand out `Clone` handles over `Rc<RefCell<_>>` state, so a test
//! keeps a handle after moving a boxed copy into the registry and can both
//! reprogram behavior and inspect what happened.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::rc::Rc;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::compiler::{CompileJob, Compiler, Diagnostic};
use crate::error::CompilerFailure;
use crate::host::{
    BUNDLE_GENERATION, BundleManifest, DiscoveryError, EntryPoint, Extension, InstantiateError,
    ModuleHost, StateListener,
};
use crate::namespace::{Namespace, Resolver, TypeRef};

// ----------------------------------------------------------------------
// Compiler
// ----------------------------------------------------------------------

#[derive(Default)]
struct CompilerState {
    fail: HashSet<String>,
    diagnostics: HashMap<String, Vec<String>>,
    payload: HashMap<String, String>,
    generation: HashMap<String, u32>,
    entries: HashMap<String, Vec<String>>,
    invocations: Vec<String>,
}

/// A compiler that writes a one-file bundle (`unit.o` plus manifest) or
/// fails on command.
#[derive(Clone, Default)]
pub(crate) struct FakeCompiler {
    inner: Rc<RefCell<CompilerState>>,
}

impl FakeCompiler {
    pub fn fail_unit(&self, unit: &str) {
        self.inner.borrow_mut().fail.insert(unit.to_owned());
    }

    pub fn clear_failures(&self) {
        self.inner.borrow_mut().fail.clear();
    }

    /// Content written to `unit.o` on the next successful compile.
    pub fn set_payload(&self, unit: &str, payload: &str) {
        self.inner
            .borrow_mut()
            .payload
            .insert(unit.to_owned(), payload.to_owned());
    }

    pub fn set_generation(&self, unit: &str, generation: u32) {
        self.inner
            .borrow_mut()
            .generation
            .insert(unit.to_owned(), generation);
    }

    pub fn set_entries(&self, unit: &str, entries: &[&str]) {
        self.inner.borrow_mut().entries.insert(
            unit.to_owned(),
            entries.iter().map(|s| s.to_string()).collect(),
        );
    }

    pub fn add_diagnostic(&self, unit: &str, text: &str) {
        self.inner
            .borrow_mut()
            .diagnostics
            .entry(unit.to_owned())
            .or_default()
            .push(text.to_owned());
    }

    pub fn invocations(&self) -> Vec<String> {
        self.inner.borrow().invocations.clone()
    }
}

impl Compiler for FakeCompiler {
    fn source_extension(&self) -> &str {
        "unit"
    }

    fn bundle_extension(&self) -> &str {
        "so"
    }

    fn compile(
        &self,
        job: &CompileJob<'_>,
        sink: &mut dyn FnMut(Diagnostic),
    ) -> Result<(), CompilerFailure> {
        let mut state = self.inner.borrow_mut();
        state.invocations.push(job.unit.to_owned());

        for text in state.diagnostics.get(job.unit).cloned().unwrap_or_default() {
            sink(Diagnostic { text });
        }

        if state.fail.contains(job.unit) {
            sink(Diagnostic {
                text: format!("{}: synthetic compile error", job.unit),
            });
            return Err(CompilerFailure::Exit { code: Some(1) });
        }

        let payload = state
            .payload
            .get(job.unit)
            .cloned()
            .unwrap_or_else(|| "v1".to_owned());
        fs::write(job.out_dir.join("unit.o"), payload)?;

        let manifest = BundleManifest {
            generation: state
                .generation
                .get(job.unit)
                .copied()
                .unwrap_or(BUNDLE_GENERATION),
            entries: state
                .entries
                .get(job.unit)
                .cloned()
                .unwrap_or_else(|| vec![format!("{}.Main", job.unit)]),
        };
        manifest
            .store(job.out_dir)
            .map_err(|e| CompilerFailure::Output(io::Error::other(e)))?;

        Ok(())
    }
}

// ----------------------------------------------------------------------
// Host
// ----------------------------------------------------------------------

#[derive(Default)]
struct HostState {
    versions: HashMap<String, String>,
    construct_fail: HashMap<String, ConstructFailure>,
    version_fail: HashSet<String>,
    load_hook_fail: HashSet<String>,
    unload_hook_fail: HashSet<String>,
    events: Vec<String>,
}

#[derive(Clone, Copy)]
pub(crate) enum ConstructFailure {
    Stale,
    MissingDependency,
    Other,
}

/// A host that reads manifests for discovery and hands out scripted
/// extensions, recording every hook invocation.
#[derive(Clone, Default)]
pub(crate) struct FakeHost {
    inner: Rc<RefCell<HostState>>,
}

impl FakeHost {
    pub fn set_version(&self, unit: &str, version: &str) {
        self.inner
            .borrow_mut()
            .versions
            .insert(unit.to_owned(), version.to_owned());
    }

    pub fn fail_construction(&self, unit: &str, failure: ConstructFailure) {
        self.inner
            .borrow_mut()
            .construct_fail
            .insert(unit.to_owned(), failure);
    }

    pub fn fail_version(&self, unit: &str) {
        self.inner.borrow_mut().version_fail.insert(unit.to_owned());
    }

    pub fn fail_load_hook(&self, unit: &str) {
        self.inner
            .borrow_mut()
            .load_hook_fail
            .insert(unit.to_owned());
    }

    pub fn clear_load_hook_failures(&self) {
        self.inner.borrow_mut().load_hook_fail.clear();
    }

    pub fn fail_unload_hook(&self, unit: &str) {
        self.inner
            .borrow_mut()
            .unload_hook_fail
            .insert(unit.to_owned());
    }

    /// Hook invocations in order, as `load:<unit>` / `unload:<unit>`.
    pub fn events(&self) -> Vec<String> {
        self.inner.borrow().events.clone()
    }

    pub fn clear_events(&self) {
        self.inner.borrow_mut().events.clear();
    }
}

struct NullResolver;

impl Resolver for NullResolver {
    fn resolve(&self, _name: &str) -> Option<TypeRef> {
        None
    }
}

impl ModuleHost for FakeHost {
    fn open_dir(&self, _dir: &Utf8Path) -> anyhow::Result<Box<dyn Resolver>> {
        Ok(Box::new(NullResolver))
    }

    fn open_artifact(&self, _path: &Utf8Path) -> anyhow::Result<Box<dyn Resolver>> {
        Ok(Box::new(NullResolver))
    }

    fn entry_points(&self, dir: &Utf8Path) -> Result<Vec<EntryPoint>, DiscoveryError> {
        let manifest = BundleManifest::load(dir)?;
        Ok(manifest
            .entries
            .into_iter()
            .map(|type_name| EntryPoint { type_name })
            .collect())
    }

    fn instantiate(
        &self,
        entry: &EntryPoint,
        _namespace: &Arc<Namespace>,
    ) -> Result<Box<dyn Extension>, InstantiateError> {
        // The fake compiler writes entries as `<unit>.Main`.
        let unit = entry
            .type_name
            .split('.')
            .next()
            .unwrap_or_default()
            .to_owned();

        let state = self.inner.borrow();
        match state.construct_fail.get(&unit) {
            Some(ConstructFailure::Stale) => Err(InstantiateError::StaleBinaries(
                anyhow::anyhow!("synthetic construction failure"),
            )),
            Some(ConstructFailure::MissingDependency) => Err(InstantiateError::MissingDependency(
                anyhow::anyhow!("synthetic construction failure"),
            )),
            Some(ConstructFailure::Other) => Err(InstantiateError::Other(anyhow::anyhow!(
                "synthetic construction failure"
            ))),
            None => Ok(Box::new(FakeExtension {
                unit,
                host: self.clone(),
            })),
        }
    }
}

pub(crate) struct FakeExtension {
    unit: String,
    host: FakeHost,
}

impl Extension for FakeExtension {
    fn version(&self) -> anyhow::Result<String> {
        let state = self.host.inner.borrow();
        if state.version_fail.contains(&self.unit) {
            anyhow::bail!("synthetic version failure");
        }
        Ok(state
            .versions
            .get(&self.unit)
            .cloned()
            .unwrap_or_else(|| "1.0".to_owned()))
    }

    fn on_load(&mut self) -> anyhow::Result<()> {
        let mut state = self.host.inner.borrow_mut();
        state.events.push(format!("load:{}", self.unit));
        if state.load_hook_fail.contains(&self.unit) {
            anyhow::bail!("synthetic load hook failure");
        }
        Ok(())
    }

    fn on_unload(&mut self) -> anyhow::Result<()> {
        let mut state = self.host.inner.borrow_mut();
        state.events.push(format!("unload:{}", self.unit));
        if state.unload_hook_fail.contains(&self.unit) {
            anyhow::bail!("synthetic unload hook failure");
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Listener
// ----------------------------------------------------------------------

#[derive(Default)]
struct ListenerState {
    events: Vec<String>,
    refuse_load: HashSet<String>,
    fail_unload: HashSet<String>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeListener {
    inner: Rc<RefCell<ListenerState>>,
}

impl FakeListener {
    pub fn refuse_load(&self, unit: &str) {
        self.inner.borrow_mut().refuse_load.insert(unit.to_owned());
    }

    pub fn fail_unload(&self, unit: &str) {
        self.inner.borrow_mut().fail_unload.insert(unit.to_owned());
    }

    /// Listener notifications in order, as `load:<unit>:<version>` /
    /// `unload:<unit>`.
    pub fn events(&self) -> Vec<String> {
        self.inner.borrow().events.clone()
    }

    pub fn clear_events(&self) {
        self.inner.borrow_mut().events.clear();
    }
}

impl StateListener for FakeListener {
    fn on_load(&self, unit: &str, version: &str) -> anyhow::Result<()> {
        let mut state = self.inner.borrow_mut();
        state.events.push(format!("load:{unit}:{version}"));
        if state.refuse_load.contains(unit) {
            anyhow::bail!("synthetic listener rejection");
        }
        Ok(())
    }

    fn on_unload(&self, unit: &str) -> anyhow::Result<()> {
        let mut state = self.inner.borrow_mut();
        state.events.push(format!("unload:{unit}"));
        if state.fail_unload.contains(unit) {
            anyhow::bail!("synthetic listener unload failure");
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------
// On-disk scaffolding
// ----------------------------------------------------------------------

/// A temp directory holding a registry root with unit trees.
pub(crate) struct Scaffold {
    _tmp: tempfile::TempDir,
    pub root: Utf8PathBuf,
}

impl Scaffold {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(tmp.path()).unwrap().join("units");
        fs::create_dir_all(&root).unwrap();
        Self { _tmp: tmp, root }
    }

    /// Create a unit directory with one source file and `project` lines for
    /// each named dependency.
    pub fn add_unit(&self, name: &str, deps: &[&str]) {
        let dir = self.root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("main.unit"), format!("unit {name}\n")).unwrap();

        if !deps.is_empty() {
            self.write_descriptor(name, &descriptor_text(deps));
        }
    }

    pub fn write_descriptor(&self, name: &str, text: &str) {
        let dir = self.root.join(name);
        fs::write(dir.join(crate::descriptor::DESCRIPTOR_FILE), text).unwrap();
    }
}

pub(crate) fn descriptor_text(deps: &[&str]) -> String {
    deps.iter()
        .map(|dep| format!("project {dep}\n"))
        .collect::<String>()
}
