use camino::Utf8PathBuf;
use thiserror::Error;

/// Failure to read or parse a dependency descriptor.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("couldn't read dependency descriptor.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("descriptor line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("descriptor line {line}: artifact path '{path}' must end in '.{ext}'")]
    BadExtension {
        line: usize,
        path: String,
        ext: String,
    },
}

/// Failure while invoking the platform compiler itself.
#[derive(Debug, Error)]
pub enum CompilerFailure {
    #[error("couldn't spawn compiler '{program}'.\n{source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("couldn't read compiler output.\n{0}")]
    Output(#[from] std::io::Error),

    #[error("compiler exited with {}", .code.map_or_else(|| "a signal".to_owned(), |c| format!("status {c}")))]
    Exit { code: Option<i32> },
}

/// Failure of a single unit compile.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("unit is disabled")]
    Disabled,

    #[error(transparent)]
    Descriptor(#[from] ConfigError),

    #[error("dependency artifact '{0}' does not exist")]
    MissingArtifact(Utf8PathBuf),

    #[error("dependency unit '{0}' has no compiled binaries")]
    MissingUnitBinaries(String),

    #[error("no source files found under '{0}'")]
    NoSources(Utf8PathBuf),

    #[error("couldn't build source glob.\n{0}")]
    Pattern(#[from] glob::PatternError),

    #[error(transparent)]
    Compiler(#[from] CompilerFailure),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure of a single unit load.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("unit is disabled")]
    Disabled,

    #[error("unit has never been compiled")]
    NotCompiled,

    #[error(transparent)]
    Descriptor(#[from] ConfigError),

    #[error("dependency unit '{0}' is not registered")]
    UnknownDependency(String),

    #[error("dependency unit '{0}' is not loaded")]
    DependencyNotLoaded(String),

    #[error("dependency artifact '{0}' does not exist")]
    MissingArtifact(Utf8PathBuf),

    #[error("couldn't open bundle '{path}'.\n{source}")]
    Bundle {
        path: Utf8PathBuf,
        source: anyhow::Error,
    },

    #[error("no extension entry point found in the compiled output")]
    NoEntryPoint,

    #[error("multiple extension entry points found: {}", .0.join(", "))]
    AmbiguousEntryPoint(Vec<String>),

    #[error(
        "binaries were produced by toolchain generation {found}, \
         but this host supports up to {supported}; recompile the unit"
    )]
    IncompatibleBinaries { found: u32, supported: u32 },

    #[error("couldn't inspect the compiled output.\n{0}")]
    Discovery(anyhow::Error),

    #[error("construction failed, binaries are likely stale; recompile the unit.\n{0}")]
    StaleConstruction(anyhow::Error),

    #[error("construction failed, a dependency is likely missing.\n{0}")]
    MissingAtConstruction(anyhow::Error),

    #[error("construction failed.\n{0}")]
    Construction(anyhow::Error),

    #[error("version query failed.\n{0}")]
    Version(anyhow::Error),

    #[error("state listener rejected the load.\n{0}")]
    Listener(anyhow::Error),

    #[error("load hook failed.\n{0}")]
    Hook(anyhow::Error),
}

/// Failure of a single unit unload. Hook failures are captured through the
/// caller's error sink, never raised, so teardown always completes.
#[derive(Debug, Error)]
pub enum UnloadError {
    #[error("loaded dependents present: {}", .0.join(", "))]
    LoadedDependents(Vec<String>),

    #[error("state listener unload hook failed.\n{0}")]
    Listener(anyhow::Error),

    #[error("unload hook failed.\n{0}")]
    Hook(anyhow::Error),
}

/// Recompile was refused because loaded dependents exist and the chosen
/// policy does not handle them. Nothing was touched.
#[derive(Debug, Error)]
#[error("loaded dependents present: {}", .dependents.join(", "))]
pub struct OrderingViolation {
    pub dependents: Vec<String>,
}

/// A defect in the dependency structure itself.
#[derive(Debug, Error)]
pub enum StructuralError {
    #[error("unit depends on itself")]
    SelfDependency,

    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("transitively depends on dependency cycle member '{0}'")]
    DependsOnCycle(String),
}

/// One per-unit failure reported by a bulk operation.
#[derive(Debug, Error)]
#[error("unit '{unit}': {kind}")]
pub struct UnitError {
    pub unit: String,
    pub kind: UnitErrorKind,
}

impl UnitError {
    pub(crate) fn new(unit: impl Into<String>, kind: impl Into<UnitErrorKind>) -> Self {
        Self {
            unit: unit.into(),
            kind: kind.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum UnitErrorKind {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Unload(#[from] UnloadError),

    #[error(transparent)]
    Structure(#[from] StructuralError),

    /// Synthetic cascade error: the unit itself was fine, but a unit it
    /// depends on failed earlier in the same bulk operation.
    #[error("blocked by failed dependency '{0}'")]
    Blocked(String),

    /// Freshly compiled binaries could not be swapped into place. The
    /// compile itself succeeded; the staging directory is left on disk.
    #[error("couldn't activate freshly compiled binaries.\n{0}")]
    Swap(std::io::Error),
}

/// Failure of a synchronous single-unit registry operation.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown unit '{0}'")]
    UnknownUnit(String),

    #[error("unit '{0}' is loaded")]
    UnitLoaded(String),

    #[error(transparent)]
    Ordering(#[from] OrderingViolation),

    #[error("unit '{unit}': {error}")]
    Structural {
        unit: String,
        error: StructuralError,
    },

    #[error("unit '{unit}': {error}")]
    Compile { unit: String, error: CompileError },

    #[error("unit '{unit}': {error}")]
    Load { unit: String, error: LoadError },

    #[error("unit '{unit}': {error}")]
    Unload { unit: String, error: UnloadError },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
