//! One managed source unit and its compile/load/unload state machine.
//!
//! A unit is a directory of sources plus a dependency descriptor. Compiling
//! produces a binary bundle in the unit's output directory; loading builds a
//! namespace over that bundle, finds the extension entry point, constructs
//! it and runs the load hooks. The unit itself never reaches across to other
//! units — everything it needs from the outside world arrives through
//! [`Env`], threaded in by the owning registry.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::compiler::{CompileJob, Compiler, Diagnostic};
use crate::descriptor::{Dependency, DependencyScope, Descriptor, resolved_path};
use crate::error::{CompileError, ConfigError, LoadError, UnloadError};
use crate::host::{DiscoveryError, Extension, InstantiateError, ModuleHost, StateListener};
use crate::namespace::{Namespace, Stage};

/// Fixed name of a unit's stable binary-output directory.
pub const BINARY_DIR: &str = "bin";

/// Output name while a compile is in flight; swapped over `bin` on success.
pub const STAGING_DIR: &str = "bin.staged";

/// Marker file whose presence persists the disabled flag across restarts.
pub const DISABLED_MARKER: &str = ".disabled";

/// Which descriptor a compile reads: the live one from the source tree, or
/// the frozen copy the previous compile left in the stable bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DescriptorView {
    Live,
    Frozen,
}

/// Platform services and peer visibility for one unit operation, built by
/// the registry per call. This replaces any unit-to-registry back-reference.
pub(crate) struct Env<'a> {
    pub compiler: &'a dyn Compiler,
    pub host: &'a dyn ModuleHost,
    pub listener: Option<&'a dyn StateListener>,
    pub search_path: &'a [Utf8PathBuf],
    pub runtime_bundle: Option<&'a Utf8Path>,
    pub delegate: Option<&'a Arc<Namespace>>,
    pub core: &'a Arc<Namespace>,
    pub peers: &'a BTreeMap<String, Unit>,
}

pub struct Unit {
    name: String,
    dir: Utf8PathBuf,
    output_dir_name: &'static str,
    disabled: bool,
    loaded: bool,
    /// Load-time dependency list, read once per unload-to-load cycle and
    /// frozen while loaded.
    frozen: Option<Descriptor>,
    version: Option<String>,
    namespace: Option<Arc<Namespace>>,
    instance: Option<Box<dyn Extension>>,
}

impl Unit {
    /// Attach to a unit directory, picking up the persisted disabled flag.
    pub(crate) fn open(name: impl Into<String>, dir: Utf8PathBuf) -> Self {
        let disabled = dir.join(DISABLED_MARKER).exists();
        Self {
            name: name.into(),
            dir,
            output_dir_name: BINARY_DIR,
            disabled,
            loaded: false,
            frozen: None,
            version: None,
            namespace: None,
            instance: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Cached version string; populated only while loaded.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// The live namespace; present only while loaded.
    pub fn namespace(&self) -> Option<&Arc<Namespace>> {
        self.namespace.as_ref()
    }

    pub fn is_compiled(&self) -> bool {
        self.stable_dir().is_dir()
    }

    pub(crate) fn stable_dir(&self) -> Utf8PathBuf {
        self.dir.join(BINARY_DIR)
    }

    pub(crate) fn staging_dir(&self) -> Utf8PathBuf {
        self.dir.join(STAGING_DIR)
    }

    pub(crate) fn output_dir(&self) -> Utf8PathBuf {
        self.dir.join(self.output_dir_name)
    }

    pub(crate) fn uses_stable_output(&self) -> bool {
        self.output_dir_name == BINARY_DIR
    }

    pub(crate) fn set_disabled(&mut self, disabled: bool) -> io::Result<()> {
        let marker = self.dir.join(DISABLED_MARKER);
        if disabled {
            fs::write(&marker, "")?;
        } else if marker.exists() {
            fs::remove_file(&marker)?;
        }
        self.disabled = disabled;
        Ok(())
    }

    /// Unit names in the frozen load-time descriptor. Empty when not loaded.
    pub(crate) fn frozen_unit_deps(&self) -> Vec<String> {
        self.frozen
            .as_ref()
            .map(|d| d.unit_names().map(str::to_owned).collect())
            .unwrap_or_default()
    }

    /// The descriptor a load would use: the frozen copy in the stable
    /// bundle. Fails like a load would if the unit was never compiled.
    pub(crate) fn load_time_descriptor(&self, bundle_ext: &str) -> Result<Descriptor, LoadError> {
        if !self.is_compiled() {
            return Err(LoadError::NotCompiled);
        }
        Ok(Descriptor::load(&self.stable_dir(), bundle_ext)?)
    }

    /// The descriptor as currently written in the source tree.
    pub(crate) fn live_descriptor(&self, bundle_ext: &str) -> Result<Descriptor, ConfigError> {
        Descriptor::load(&self.dir, bundle_ext)
    }

    // ------------------------------------------------------------------
    // Staging protocol
    // ------------------------------------------------------------------

    /// Redirect compile output to the staging name. The stable bundle on
    /// disk is left untouched until [`Self::swap_staging`].
    pub(crate) fn begin_staging(&mut self) {
        assert!(
            self.uses_stable_output(),
            "unit '{}' already has a compile in flight",
            self.name
        );
        self.output_dir_name = STAGING_DIR;
    }

    /// Drop staged output (if any) and restore the fixed output name.
    pub(crate) fn discard_staging(&mut self) -> io::Result<()> {
        self.output_dir_name = BINARY_DIR;
        let staging = self.staging_dir();
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        Ok(())
    }

    /// Replace the stable bundle with the staged one: remove old, rename
    /// new. The fixed output name is restored first, so even a failed swap
    /// leaves the unit on the invariant name (with the staging directory
    /// still on disk for diagnosis).
    pub(crate) fn swap_staging(&mut self) -> io::Result<()> {
        assert!(
            self.output_dir_name == STAGING_DIR,
            "unit '{}' has no staged binaries to swap",
            self.name
        );
        self.output_dir_name = BINARY_DIR;

        let stable = self.stable_dir();
        if stable.exists() {
            fs::remove_dir_all(&stable)?;
        }
        fs::rename(self.staging_dir(), stable)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Compile
    // ------------------------------------------------------------------

    /// Compile the unit into its current output directory, streaming
    /// diagnostics to `sink` as the compiler produces them.
    ///
    /// The descriptor is re-read on every call (per `view`); every declared
    /// dependency must resolve to an existing artifact before the compiler
    /// is invoked. On failure, partial output is left in the output
    /// directory for the caller's staging protocol to clean up.
    pub(crate) fn compile(
        &self,
        env: &Env<'_>,
        view: DescriptorView,
        sink: &mut dyn FnMut(Diagnostic),
    ) -> Result<(), CompileError> {
        if self.disabled {
            return Err(CompileError::Disabled);
        }

        let ext = env.compiler.bundle_extension();
        let descriptor = match view {
            DescriptorView::Live => Descriptor::load(&self.dir, ext)?,
            DescriptorView::Frozen => Descriptor::load(&self.stable_dir(), ext)?,
        };

        let mut search: Vec<Utf8PathBuf> = env.search_path.to_vec();
        if let Some(runtime) = env.runtime_bundle {
            search.push(runtime.to_owned());
        }

        for entry in &descriptor.entries {
            match entry {
                Dependency::Artifact { path, .. } => {
                    let path = resolved_path(path, &self.dir);
                    if !path.exists() {
                        return Err(CompileError::MissingArtifact(path));
                    }
                    search.push(path);
                }
                Dependency::Unit { name } => {
                    // The dependency's current output directory: the stable
                    // bundle normally, the staged one when the dependency is
                    // part of the same in-flight batch (compiled first).
                    let binaries = env
                        .peers
                        .get(name)
                        .map(Unit::output_dir)
                        .filter(|dir| dir.is_dir());
                    let Some(dir) = binaries else {
                        return Err(CompileError::MissingUnitBinaries(name.clone()));
                    };
                    search.push(dir);
                }
            }
        }

        let sources = self.sources(env.compiler.source_extension())?;
        if sources.is_empty() {
            return Err(CompileError::NoSources(self.dir.clone()));
        }

        let out = self.output_dir();
        if out.exists() {
            fs::remove_dir_all(&out)?;
        }
        fs::create_dir_all(&out)?;

        tracing::debug!(unit = %self.name, sources = sources.len(), "compiling");

        let job = CompileJob {
            unit: &self.name,
            sources: &sources,
            out_dir: &out,
            search_path: &search,
            deprecations: true,
        };
        env.compiler.compile(&job, sink)?;

        // Freeze the descriptor that produced these binaries, decoupled
        // from later source-tree edits.
        descriptor.store(&out)?;

        Ok(())
    }

    /// Source files under the unit tree, skipping binary output and
    /// dot-prefixed entries.
    pub(crate) fn sources(&self, ext: &str) -> Result<Vec<Utf8PathBuf>, CompileError> {
        let pattern = format!("{}/**/*.{}", self.dir, ext);
        let mut out = Vec::new();

        for entry in glob::glob(&pattern)? {
            let path = entry.map_err(|e| CompileError::Io(e.into_error()))?;
            let path = Utf8PathBuf::try_from(path)
                .map_err(|e| CompileError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;

            let rel = path.strip_prefix(&self.dir).unwrap_or(&path);
            let skip = rel.components().any(|c| {
                let s = c.as_str();
                s == BINARY_DIR || s == STAGING_DIR || s.starts_with('.')
            });
            if !skip {
                out.push(path);
            }
        }

        out.sort();
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Load
    // ------------------------------------------------------------------

    /// Load the unit: build the namespace, find and construct the extension
    /// point, run the hooks. No-op when already loaded. On any failure past
    /// namespace construction the namespace is released before returning.
    pub(crate) fn load(&mut self, env: &Env<'_>) -> Result<(), LoadError> {
        if self.loaded {
            return Ok(());
        }
        if self.disabled {
            return Err(LoadError::Disabled);
        }

        let stable = self.stable_dir();
        if !stable.is_dir() {
            return Err(LoadError::NotCompiled);
        }

        let descriptor = Descriptor::load(&stable, env.compiler.bundle_extension())?;

        for name in descriptor.unit_names() {
            match env.peers.get(name) {
                None => return Err(LoadError::UnknownDependency(name.to_owned())),
                Some(peer) if !peer.is_loaded() => {
                    return Err(LoadError::DependencyNotLoaded(name.to_owned()));
                }
                Some(_) => {}
            }
        }

        let namespace = self.build_namespace(env, &stable, &descriptor)?;

        match self.construct(env, &stable, &namespace) {
            Ok((instance, version)) => {
                tracing::info!(unit = %self.name, %version, "loaded");
                self.loaded = true;
                self.frozen = Some(descriptor);
                self.version = Some(version);
                self.namespace = Some(namespace);
                self.instance = Some(instance);
                Ok(())
            }
            Err(e) => {
                namespace.release();
                Err(e)
            }
        }
    }

    /// Assemble the resolution chain: own bundle, INCLUDE artifacts,
    /// unit-dependency namespaces in declared order, delegate, core.
    fn build_namespace(
        &self,
        env: &Env<'_>,
        stable: &Utf8Path,
        descriptor: &Descriptor,
    ) -> Result<Arc<Namespace>, LoadError> {
        let mut stages = Vec::new();

        let own = env.host.open_dir(stable).map_err(|source| LoadError::Bundle {
            path: stable.to_owned(),
            source,
        })?;
        stages.push(Stage::Local(own));

        for (path, scope) in descriptor.artifacts() {
            if scope != DependencyScope::Include {
                continue;
            }
            let path = resolved_path(path, &self.dir);
            if !path.exists() {
                return Err(LoadError::MissingArtifact(path));
            }
            let resolver = env
                .host
                .open_artifact(&path)
                .map_err(|source| LoadError::Bundle { path, source })?;
            stages.push(Stage::Local(resolver));
        }

        for name in descriptor.unit_names() {
            let peer = &env.peers[name];
            let ns = peer
                .namespace
                .clone()
                .unwrap_or_else(|| panic!("loaded unit '{name}' has no namespace"));
            stages.push(Stage::Peer(ns));
        }

        if let Some(delegate) = env.delegate {
            stages.push(Stage::Peer(delegate.clone()));
        }
        stages.push(Stage::Peer(env.core.clone()));

        Ok(Namespace::build(&self.name, stages))
    }

    fn construct(
        &self,
        env: &Env<'_>,
        stable: &Utf8Path,
        namespace: &Arc<Namespace>,
    ) -> Result<(Box<dyn Extension>, String), LoadError> {
        let entries = env.host.entry_points(stable).map_err(|e| match e {
            DiscoveryError::IncompatibleGeneration { found, supported } => {
                LoadError::IncompatibleBinaries { found, supported }
            }
            DiscoveryError::Unreadable(e) => LoadError::Discovery(e),
        })?;

        let entry = match entries.as_slice() {
            [] => return Err(LoadError::NoEntryPoint),
            [one] => one,
            many => {
                let names = many.iter().map(|e| e.type_name.clone()).collect();
                return Err(LoadError::AmbiguousEntryPoint(names));
            }
        };

        let mut instance = env.host.instantiate(entry, namespace).map_err(|e| match e {
            InstantiateError::StaleBinaries(e) => LoadError::StaleConstruction(e),
            InstantiateError::MissingDependency(e) => LoadError::MissingAtConstruction(e),
            InstantiateError::Other(e) => LoadError::Construction(e),
        })?;

        // Version must be known before any listener hears about the unit.
        let version = instance.version().map_err(LoadError::Version)?;

        if let Some(listener) = env.listener {
            listener
                .on_load(&self.name, &version)
                .map_err(LoadError::Listener)?;
        }
        instance.on_load().map_err(LoadError::Hook)?;

        Ok((instance, version))
    }

    // ------------------------------------------------------------------
    // Unload
    // ------------------------------------------------------------------

    /// Tear the unit down: listener hook, instance hook, namespace release,
    /// state reset. Hook failures flow into `errors`; teardown always runs
    /// to completion. Returns whether the unit was loaded at all.
    pub(crate) fn unload(
        &mut self,
        listener: Option<&dyn StateListener>,
        errors: &mut dyn FnMut(UnloadError),
    ) -> bool {
        if !self.loaded {
            return false;
        }

        if let Some(listener) = listener {
            if let Err(e) = listener.on_unload(&self.name) {
                errors(UnloadError::Listener(e));
            }
        }

        if let Some(instance) = self.instance.as_mut() {
            if let Err(e) = instance.on_unload() {
                errors(UnloadError::Hook(e));
            }
        }

        if let Some(namespace) = self.namespace.take() {
            namespace.release();
        }

        tracing::info!(unit = %self.name, "unloaded");

        self.instance = None;
        self.loaded = false;
        self.version = None;
        self.frozen = None;
        true
    }
}

impl std::fmt::Debug for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unit")
            .field("name", &self.name)
            .field("disabled", &self.disabled)
            .field("loaded", &self.loaded)
            .field("version", &self.version)
            .finish()
    }
}
