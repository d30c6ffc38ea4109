//! Per-unit type resolution scopes.
//!
//! Every loaded unit owns exactly one [`Namespace`]. A namespace is nothing
//! but an explicit, ordered list of resolution stages — its own bundle, its
//! include-scope artifacts, the namespaces of the units it depends on, an
//! optional delegate, and finally the core namespace — tried strictly in
//! order. Keeping the chain explicit (instead of delegating implicitly to
//! some ambient loader) is what makes the resolution order testable on its
//! own.
//!
//! Hot-swap hinges on stage ordering: the own-bundle stage always defines
//! types fresh from the current binaries, never reusing a prior generation,
//! so releasing the namespace is enough to make the old generation
//! reclaimable once nothing references it.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A type-erased resolved type, shared between namespaces.
pub type TypeRef = Arc<dyn Any + Send + Sync>;

/// Outcome of a namespace lookup.
#[derive(Clone)]
pub enum Resolution {
    Found(TypeRef),
    Missing,
    /// The namespace has been released; nothing resolves through it anymore.
    Closed,
}

impl Resolution {
    pub fn is_found(&self) -> bool {
        matches!(self, Resolution::Found(_))
    }
}

/// One stage of a resolution chain: resolve a type by name, or miss.
///
/// Host adapters implement this over compiled bundle directories and
/// standalone artifacts. A resolver must not resolve back through the
/// namespace that owns it.
pub trait Resolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<TypeRef>;
}

pub(crate) enum Stage {
    Local(Box<dyn Resolver>),
    Peer(Arc<Namespace>),
}

struct Inner {
    closed: bool,
    stages: Vec<Stage>,
    cache: HashMap<String, Option<TypeRef>>,
}

/// An isolated type-resolution scope. See the module docs for the chain.
pub struct Namespace {
    label: String,
    inner: Mutex<Inner>,
}

impl Namespace {
    pub(crate) fn build(label: impl Into<String>, stages: Vec<Stage>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            inner: Mutex::new(Inner {
                closed: false,
                stages,
                cache: HashMap::new(),
            }),
        })
    }

    /// A namespace backed by a single resolver. This is how delegate and
    /// core namespaces are supplied from outside the registry.
    pub fn of(label: impl Into<String>, resolver: Box<dyn Resolver>) -> Arc<Self> {
        Self::build(label, vec![Stage::Local(resolver)])
    }

    /// A namespace that resolves nothing.
    pub fn empty(label: impl Into<String>) -> Arc<Self> {
        Self::build(label, Vec::new())
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Look a type up by name through the stage chain.
    ///
    /// The per-namespace cache is consulted first and populated only once
    /// the full chain has answered — a hit and an exhausted chain are both
    /// remembered. A `Closed` answer from a peer stage counts as a miss for
    /// this chain; only this namespace's own release produces `Closed` here.
    pub fn resolve(&self, name: &str) -> Resolution {
        let mut inner = self.inner.lock().unwrap();

        if inner.closed {
            return Resolution::Closed;
        }

        if let Some(cached) = inner.cache.get(name) {
            return match cached {
                Some(found) => Resolution::Found(found.clone()),
                None => Resolution::Missing,
            };
        }

        let mut found = None;
        for stage in &inner.stages {
            let answer = match stage {
                Stage::Local(resolver) => resolver.resolve(name),
                Stage::Peer(ns) => match ns.resolve(name) {
                    Resolution::Found(t) => Some(t),
                    Resolution::Missing | Resolution::Closed => None,
                },
            };

            if answer.is_some() {
                found = answer;
                break;
            }
        }

        inner.cache.insert(name.to_owned(), found.clone());
        match found {
            Some(t) => Resolution::Found(t),
            None => Resolution::Missing,
        }
    }

    /// Close the namespace: clear the cache, drop every stage (releasing
    /// delegate and peer references), and make all further lookups answer
    /// [`Resolution::Closed`]. Previously resolved types become reclaimable
    /// once their last outside reference is gone.
    pub fn release(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.cache.clear();
        inner.stages.clear();
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("Namespace")
            .field("label", &self.label)
            .field("closed", &inner.closed)
            .field("stages", &inner.stages.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct MapResolver {
        entries: Vec<&'static str>,
        calls: Arc<AtomicUsize>,
    }

    impl MapResolver {
        fn new(entries: Vec<&'static str>) -> (Box<Self>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let resolver = Box::new(Self {
                entries,
                calls: calls.clone(),
            });
            (resolver, calls)
        }
    }

    impl Resolver for MapResolver {
        fn resolve(&self, name: &str) -> Option<TypeRef> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.entries
                .contains(&name)
                .then(|| Arc::new(name.to_owned()) as TypeRef)
        }
    }

    #[test]
    fn stages_are_tried_in_order() {
        let (first, first_calls) = MapResolver::new(vec!["Shared"]);
        let (second, second_calls) = MapResolver::new(vec!["Shared", "Deep"]);
        let ns = Namespace::build("test", vec![Stage::Local(first), Stage::Local(second)]);

        assert!(ns.resolve("Shared").is_found());
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);

        assert!(ns.resolve("Deep").is_found());
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hits_and_exhaustion_are_both_cached() {
        let (resolver, calls) = MapResolver::new(vec!["Known"]);
        let ns = Namespace::build("test", vec![Stage::Local(resolver)]);

        assert!(ns.resolve("Known").is_found());
        assert!(ns.resolve("Known").is_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(matches!(ns.resolve("Unknown"), Resolution::Missing));
        assert!(matches!(ns.resolve("Unknown"), Resolution::Missing));
        // One extra call, not two: the miss was cached after exhaustion.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn released_namespace_answers_closed() {
        let (resolver, _) = MapResolver::new(vec!["Known"]);
        let ns = Namespace::build("test", vec![Stage::Local(resolver)]);

        assert!(ns.resolve("Known").is_found());
        ns.release();

        assert!(ns.is_closed());
        assert!(matches!(ns.resolve("Known"), Resolution::Closed));
        assert!(matches!(ns.resolve("Unknown"), Resolution::Closed));
    }

    #[test]
    fn peer_namespaces_resolve_through_their_own_chain() {
        let (dep_resolver, _) = MapResolver::new(vec!["FromDep"]);
        let dep = Namespace::build("dep", vec![Stage::Local(dep_resolver)]);

        let (own, _) = MapResolver::new(vec!["Own"]);
        let ns = Namespace::build("unit", vec![Stage::Local(own), Stage::Peer(dep)]);

        assert!(ns.resolve("Own").is_found());
        assert!(ns.resolve("FromDep").is_found());
        assert!(matches!(ns.resolve("Nowhere"), Resolution::Missing));
    }

    #[test]
    fn closed_peer_counts_as_miss() {
        let (dep_resolver, _) = MapResolver::new(vec!["Shadowed"]);
        let dep = Namespace::build("dep", vec![Stage::Local(dep_resolver)]);

        let (fallback, _) = MapResolver::new(vec!["Shadowed"]);
        let ns = Namespace::build(
            "unit",
            vec![Stage::Peer(dep.clone()), Stage::Local(fallback)],
        );

        dep.release();
        assert!(ns.resolve("Shadowed").is_found());
    }
}
