//! Dependency descriptors: what a unit needs at compile time and load time.
//!
//! Descriptors are persisted as line-oriented text (`depend.txt`) in the
//! unit's source tree. The compiled bundle keeps a frozen copy of the
//! descriptor that produced it, so later source edits don't change what an
//! already-built bundle claims to need.

use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::ConfigError;
use crate::util::normalize_separators;

/// File name of the persisted descriptor, in the unit directory and in the
/// compiled bundle (frozen copy).
pub const DESCRIPTOR_FILE: &str = "depend.txt";

/// Whether a dependency's artifact must be present at compile time only
/// (`Provided`) or also resolvable at load time (`Include`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyScope {
    Include,
    Provided,
}

/// One declared dependency of a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependency {
    /// A bundle artifact on disk (`lib` line). Scope is user-chosen and
    /// defaults to [`DependencyScope::Include`].
    Artifact {
        path: Utf8PathBuf,
        scope: DependencyScope,
    },
    /// Another managed unit (`project` line). Satisfied by referencing the
    /// target's live namespace, never by copying files, so the scope is
    /// always [`DependencyScope::Provided`] and not user-settable.
    Unit { name: String },
}

impl Dependency {
    pub fn scope(&self) -> DependencyScope {
        match self {
            Dependency::Artifact { scope, .. } => *scope,
            Dependency::Unit { .. } => DependencyScope::Provided,
        }
    }
}

/// A parsed descriptor together with its original text, so the frozen copy
/// written next to compiled binaries is byte-for-byte what was used.
#[derive(Debug, Clone, Default)]
pub struct Descriptor {
    pub entries: Vec<Dependency>,
    source: String,
}

impl Descriptor {
    /// Parse descriptor text. `bundle_ext` is the platform's binary-bundle
    /// extension, which every artifact path must carry.
    pub fn parse(text: &str, bundle_ext: &str) -> Result<Self, ConfigError> {
        let mut entries = Vec::new();

        for (i, raw) in text.lines().enumerate() {
            let line = i + 1;

            let mut stripped = raw;
            for marker in ["//", "#"] {
                if let Some(at) = stripped.find(marker) {
                    stripped = &stripped[..at];
                }
            }

            let mut tokens = stripped.split_whitespace();
            let Some(keyword) = tokens.next() else {
                continue;
            };

            match keyword {
                "project" => {
                    let name = match (tokens.next(), tokens.next()) {
                        (Some(name), None) if !name.starts_with('-') => name,
                        (Some(flag), _) if flag.starts_with('-') => {
                            return Err(ConfigError::Syntax {
                                line,
                                message: format!(
                                    "'project' takes no scope flag (got '{flag}'); \
                                     unit dependencies are always provided"
                                ),
                            });
                        }
                        _ => {
                            return Err(ConfigError::Syntax {
                                line,
                                message: "expected 'project <name>'".into(),
                            });
                        }
                    };

                    entries.push(Dependency::Unit { name: name.into() });
                }
                "lib" => {
                    let (scope, path) = match (tokens.next(), tokens.next(), tokens.next()) {
                        (Some("-include"), Some(path), None) => (DependencyScope::Include, path),
                        (Some("-provided"), Some(path), None) => (DependencyScope::Provided, path),
                        (Some(path), None, None) if !path.starts_with('-') => {
                            (DependencyScope::Include, path)
                        }
                        _ => {
                            return Err(ConfigError::Syntax {
                                line,
                                message: "expected 'lib [-include|-provided] <path>'".into(),
                            });
                        }
                    };

                    let path = normalize_separators(path);
                    if !path.ends_with(&format!(".{bundle_ext}")) {
                        return Err(ConfigError::BadExtension {
                            line,
                            path,
                            ext: bundle_ext.into(),
                        });
                    }

                    entries.push(Dependency::Artifact {
                        path: Utf8PathBuf::from(path),
                        scope,
                    });
                }
                other => {
                    return Err(ConfigError::Syntax {
                        line,
                        message: format!("unknown keyword '{other}'"),
                    });
                }
            }
        }

        Ok(Self {
            entries,
            source: text.into(),
        })
    }

    /// Read the descriptor from `dir`. A missing file is an empty
    /// descriptor, not an error.
    pub fn load(dir: &Utf8Path, bundle_ext: &str) -> Result<Self, ConfigError> {
        match fs::read_to_string(dir.join(DESCRIPTOR_FILE)) {
            Ok(text) => Self::parse(&text, bundle_ext),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    /// Write the frozen copy into `dir`, byte-for-byte as parsed.
    pub fn store(&self, dir: &Utf8Path) -> io::Result<()> {
        fs::write(dir.join(DESCRIPTOR_FILE), &self.source)
    }

    /// Names of all unit dependencies, in declared order.
    pub fn unit_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter_map(|dep| match dep {
            Dependency::Unit { name } => Some(name.as_str()),
            Dependency::Artifact { .. } => None,
        })
    }

    /// Artifact dependencies, in declared order.
    pub fn artifacts(&self) -> impl Iterator<Item = (&Utf8Path, DependencyScope)> {
        self.entries.iter().filter_map(|dep| match dep {
            Dependency::Artifact { path, scope } => Some((path.as_path(), *scope)),
            Dependency::Unit { .. } => None,
        })
    }
}

/// Resolve an artifact path against the unit directory: a leading `.`
/// component anchors it to the unit's own tree, anything else is taken as
/// written.
pub fn resolved_path(path: &Utf8Path, unit_dir: &Utf8Path) -> Utf8PathBuf {
    match path.strip_prefix(".") {
        Ok(rest) => unit_dir.join(rest),
        Err(_) => path.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comments_blanks_and_entries() {
        let text = "\
// leading comment
# another

project analytics
lib ./vendor/util.so   # trailing comment
lib -provided /opt/shared/frame.so
";
        let d = Descriptor::parse(text, "so").unwrap();

        assert_eq!(
            d.entries,
            vec![
                Dependency::Unit {
                    name: "analytics".into()
                },
                Dependency::Artifact {
                    path: "./vendor/util.so".into(),
                    scope: DependencyScope::Include,
                },
                Dependency::Artifact {
                    path: "/opt/shared/frame.so".into(),
                    scope: DependencyScope::Provided,
                },
            ]
        );
    }

    #[test]
    fn unit_dependency_scope_is_always_provided() {
        let d = Descriptor::parse("project core", "so").unwrap();
        assert_eq!(d.entries[0].scope(), DependencyScope::Provided);

        let err = Descriptor::parse("project -include core", "so").unwrap_err();
        assert!(matches!(err, ConfigError::Syntax { line: 1, .. }));
    }

    #[test]
    fn artifact_extension_is_checked() {
        let err = Descriptor::parse("lib ./vendor/util.zip", "so").unwrap_err();
        assert!(matches!(err, ConfigError::BadExtension { line: 1, .. }));
    }

    #[test]
    fn unknown_keyword_is_rejected() {
        let err = Descriptor::parse("jarfile thing.so", "so").unwrap_err();
        assert!(matches!(err, ConfigError::Syntax { line: 1, .. }));
    }

    #[test]
    fn backslash_separators_are_normalized() {
        let d = Descriptor::parse("lib .\\vendor\\util.so", "so").unwrap();
        assert_eq!(
            d.entries[0],
            Dependency::Artifact {
                path: "./vendor/util.so".into(),
                scope: DependencyScope::Include,
            }
        );
    }

    #[test]
    fn leading_dot_resolves_into_unit_dir() {
        let unit = Utf8Path::new("/srv/units/analytics");

        let rel = resolved_path(Utf8Path::new("./vendor/util.so"), unit);
        assert_eq!(rel, "/srv/units/analytics/vendor/util.so");

        let abs = resolved_path(Utf8Path::new("/opt/shared/frame.so"), unit);
        assert_eq!(abs, "/opt/shared/frame.so");
    }

    #[test]
    fn store_preserves_source_text() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(dir.path()).unwrap();

        let text = "// keep me\nproject core\n";
        let d = Descriptor::parse(text, "so").unwrap();
        d.store(dir).unwrap();

        let copied = std::fs::read_to_string(dir.join(DESCRIPTOR_FILE)).unwrap();
        assert_eq!(copied, text);

        let reloaded = Descriptor::load(dir, "so").unwrap();
        assert_eq!(reloaded.entries, d.entries);
    }

    #[test]
    fn missing_descriptor_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(dir.path()).unwrap();

        let d = Descriptor::load(dir, "so").unwrap();
        assert!(d.entries.is_empty());
    }
}
