//! Recompilation with staged binary swaps.
//!
//! Both the single-unit and the registry-wide paths follow the same
//! protocol: redirect each unit's output to its staging name and compile
//! there, leaving the stable bundles untouched; only once the compiles are
//! in do units come down (dependents first), staged bundles replace stable
//! ones, and everything goes back up (dependencies first). A compile
//! failure before the unload phase discards all staging and leaves the
//! system exactly as it was.

use std::collections::HashSet;
use std::time::Instant;

use console::style;
use indicatif::ProgressBar;

use crate::compiler::Diagnostic;
use crate::error::{
    CompileError, OrderingViolation, RegistryError, StructuralError, UnitError, UnitErrorKind,
};
use crate::graph::DependencyGraph;
use crate::registry::{Registry, report::RecompileReport, report::SyncReport};
use crate::unit::{DescriptorView, Unit};
use crate::util::{PROGRESS_STYLE, as_overhead};

/// How [`Registry::recompile`] treats loaded dependents of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependentsPolicy {
    /// Refuse with an [`OrderingViolation`] naming every loaded dependent.
    Forbid,
    /// Recompile only the target (against its frozen descriptor), but
    /// unload and reload every loaded transitive dependent around the swap.
    /// The dependents keep their old binaries and may come back
    /// binary-incompatible with the fresh target.
    Reload,
    /// Recompile the target and every loaded transitive dependent from
    /// their live descriptors, picking up structural changes.
    Recompile,
}

impl Registry {
    /// Recompile one unit, handling loaded dependents per `policy`.
    ///
    /// With no loaded dependents (or an unloaded target) the recompile,
    /// unload and load sets are all just the target. Compiler diagnostics
    /// stream into `sink`; a compile failure is raised after discarding all
    /// staging, with nothing unloaded and the stable bundles untouched.
    /// Failures in the later phases (swap, reload) are reported through the
    /// returned [`RecompileReport`] without blocking the remaining units.
    pub fn recompile(
        &mut self,
        name: &str,
        policy: DependentsPolicy,
        sink: &mut dyn FnMut(Diagnostic),
    ) -> Result<RecompileReport, RegistryError> {
        let unit = self
            .units
            .get(name)
            .ok_or_else(|| RegistryError::UnknownUnit(name.to_owned()))?;

        let loaded_graph = self.loaded_graph();
        let loaded_dependents = if unit.is_loaded() {
            loaded_graph.dependents_closure([&name.to_owned()])
        } else {
            Vec::new()
        };

        // Compile plan (unit, descriptor view) and the unload/load set.
        let (plan, touch) = if loaded_dependents.is_empty() {
            (
                vec![(name.to_owned(), DescriptorView::Live)],
                vec![name.to_owned()],
            )
        } else {
            match policy {
                DependentsPolicy::Forbid => {
                    return Err(OrderingViolation {
                        dependents: loaded_dependents,
                    }
                    .into());
                }
                DependentsPolicy::Reload => {
                    let touch: Vec<String> = std::iter::once(name.to_owned())
                        .chain(loaded_dependents)
                        .collect();
                    (vec![(name.to_owned(), DescriptorView::Frozen)], touch)
                }
                DependentsPolicy::Recompile => {
                    let set: Vec<String> = std::iter::once(name.to_owned())
                        .chain(loaded_dependents)
                        .collect();

                    // The set's own induced graph must be acyclic before
                    // any compilation starts.
                    let induced = self.live_graph(&set)?;
                    if let Some(cycle) = induced.cycles().into_iter().next() {
                        let error = if cycle.len() == 1 {
                            StructuralError::SelfDependency
                        } else {
                            StructuralError::Cycle(cycle.clone())
                        };
                        return Err(RegistryError::Structural {
                            unit: cycle[0].clone(),
                            error,
                        });
                    }

                    let mut plan = Vec::new();
                    let mut walk = induced.dependency_order();
                    while let Some(n) = walk.next() {
                        plan.push((n, DescriptorView::Live));
                    }
                    (plan, set)
                }
            }
        };

        tracing::info!(unit = name, batch = plan.len(), "recompiling");

        // Stage and compile. On failure everything staged so far is
        // discarded; nothing has been unloaded, so the system is unchanged.
        let mut staged: Vec<String> = Vec::new();
        for (n, view) in &plan {
            self.unit_mut(n).begin_staging();
            staged.push(n.clone());

            if let Err(error) = self.compile_one(n, *view, sink) {
                for s in &staged {
                    self.discard_staging_of(s);
                }
                return Err(RegistryError::Compile {
                    unit: n.clone(),
                    error,
                });
            }
        }

        let mut report = RecompileReport::default();

        // Unload the touch set, dependents first.
        let scope: HashSet<&String> = touch.iter().collect();
        let mut unload_order = Vec::new();
        let mut walk = loaded_graph.dependent_order();
        while let Some(n) = walk.next() {
            if scope.contains(&n) {
                unload_order.push(n);
            }
        }
        drop(walk);

        for n in &unload_order {
            if self.unload_one(n, &mut report.errors) {
                report.unloaded.push(n.clone());
            }
        }

        // Swap: remove old stable bundle, move the staged one over. A swap
        // failure does not retroactively fail the compile; the unit is
        // reported and left diagnosable.
        for n in &staged {
            match self.unit_mut(n).swap_staging() {
                Ok(()) => report.compiled.push(n.clone()),
                Err(e) => report.errors.push(UnitError::new(n, UnitErrorKind::Swap(e))),
            }
        }

        // Load the touch set, dependencies first, against the fresh frozen
        // descriptors. Per-unit failures don't block the rest.
        for n in self.frozen_order(&touch, &mut report.errors) {
            match self.load_one(&n) {
                Ok(()) => report.loaded.push(n),
                Err(e) => report.errors.push(UnitError::new(n, e)),
            }
        }

        Ok(report)
    }

    /// Recompile the whole registry with the same staged-swap protocol:
    /// discover new units, compile everything dependency-first, take every
    /// loaded unit down, drop units whose source tree vanished, swap, and
    /// bring everything back up.
    pub fn recompile_all(
        &mut self,
        sink: &mut dyn FnMut(Diagnostic),
    ) -> Result<SyncReport, RegistryError> {
        let s = Instant::now();
        eprintln!(
            "Running {} {}",
            style("kiln").red(),
            style("recompile-all").blue()
        );

        let mut report = SyncReport {
            added: self.discover()?,
            ..Default::default()
        };

        // No unit may be mid-staging outside an in-flight compile.
        for unit in self.units.values() {
            assert!(
                unit.uses_stable_output(),
                "unit '{}' is unexpectedly mid-compile",
                unit.name()
            );
        }

        let vanished: Vec<String> = self
            .units
            .values()
            .filter(|u| !u.dir().is_dir())
            .map(|u| u.name().to_owned())
            .collect();

        let (graph, mut error_units) = self.analyze_live(&mut report.errors);

        // Compile dependency-first, staging each unit, cutting off the
        // dependents of anything that fails.
        let bar = ProgressBar::new(graph.len() as u64);
        bar.set_style(PROGRESS_STYLE.clone());

        let mut staged: Vec<String> = Vec::new();
        let mut walk = graph.dependency_order();
        while let Some(n) = walk.next() {
            bar.set_message(n.clone());

            let failed = if error_units.contains(&n) {
                true
            } else {
                self.unit_mut(&n).begin_staging();
                match self.compile_one(&n, DescriptorView::Live, sink) {
                    Ok(()) => {
                        staged.push(n.clone());
                        false
                    }
                    Err(error) => {
                        self.discard_staging_of(&n);
                        report.errors.push(UnitError::new(&n, error));
                        error_units.insert(n.clone());
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
                            .push(UnitError::new(blocked, UnitErrorKind::Blocked(n.clone())));
                    }
                }
            }

            bar.inc(1);
        }
        drop(walk);

        bar.finish_with_message(format!(
            "Compiled {} units {}",
            staged.len(),
            as_overhead(s)
        ));

        // Everything loaded comes down, dependents first.
        let unloaded = self.unload_all();
        report.unloaded = unloaded.unloaded;
        report.errors.extend(unloaded.errors);

        // Units whose source tree vanished leave the registry. They are all
        // unloaded by now, which is the only state removal is legal in.
        for name in vanished {
            self.units.remove(&name);
            tracing::info!(unit = %name, "removed, source tree vanished");
            report.removed.push(name);
        }

        for n in &staged {
            match self.unit_mut(n).swap_staging() {
                Ok(()) => report.compiled.push(n.clone()),
                Err(e) => report.errors.push(UnitError::new(n, UnitErrorKind::Swap(e))),
            }
        }

        let loaded = self.load_all();
        report.loaded = loaded.loaded;
        report.errors.extend(loaded.errors);

        Ok(report)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn unit_mut(&mut self, name: &str) -> &mut Unit {
        self.units.get_mut(name).expect("planned unit is registered")
    }

    fn discard_staging_of(&mut self, name: &str) {
        if let Err(e) = self.unit_mut(name).discard_staging() {
            tracing::warn!(unit = name, error = %e, "couldn't discard staging directory");
        }
    }

    /// Graph over `set` from live source descriptors, edges within the set
    /// only. A malformed descriptor fails the whole operation.
    fn live_graph(&self, set: &[String]) -> Result<DependencyGraph<String>, RegistryError> {
        let mut graph = DependencyGraph::new();
        for n in set {
            graph.add_node(n.clone());
        }

        let ext = self.compiler.bundle_extension();
        for n in set {
            let descriptor =
                self.units[n]
                    .live_descriptor(ext)
                    .map_err(|e| RegistryError::Compile {
                        unit: n.clone(),
                        error: CompileError::Descriptor(e),
                    })?;

            for dep in descriptor.unit_names() {
                let dep = dep.to_owned();
                if graph.contains(&dep) {
                    graph.add_edge(n.clone(), dep);
                }
            }
        }

        Ok(graph)
    }

    /// Dependency-first order over `set` from the frozen descriptors in the
    /// stable bundles. Units whose descriptor can't be read are reported
    /// and excluded.
    fn frozen_order(&self, set: &[String], errors: &mut Vec<UnitError>) -> Vec<String> {
        let mut graph = DependencyGraph::new();
        for n in set {
            graph.add_node(n.clone());
        }

        let ext = self.compiler.bundle_extension();
        for n in set {
            match self.units[n].load_time_descriptor(ext) {
                Ok(descriptor) => {
                    for dep in descriptor.unit_names() {
                        let dep = dep.to_owned();
                        if graph.contains(&dep) {
                            graph.add_edge(n.clone(), dep);
                        }
                    }
                }
                Err(e) => {
                    errors.push(UnitError::new(n, e));
                    graph.remove_node(n);
                }
            }
        }

        let mut order = Vec::new();
        let mut walk = graph.dependency_order();
        while let Some(n) = walk.next() {
            order.push(n);
        }
        order
    }

    /// Candidate graph for `recompile_all`, from live descriptors: every
    /// enabled unit whose source tree still exists, with the same cycle
    /// flagging as `load_all`.
    fn analyze_live(
        &self,
        errors: &mut Vec<UnitError>,
    ) -> (DependencyGraph<String>, HashSet<String>) {
        let candidates: Vec<String> = self
            .units
            .values()
            .filter(|u| !u.is_disabled() && u.dir().is_dir())
            .map(|u| u.name().to_owned())
            .collect();

        let mut graph = DependencyGraph::new();
        let mut error_units = HashSet::new();

        for n in &candidates {
            graph.add_node(n.clone());
        }

        let ext = self.compiler.bundle_extension();
        for n in &candidates {
            let descriptor = match self.units[n].live_descriptor(ext) {
                Ok(d) => d,
                Err(e) => {
                    error_units.insert(n.clone());
                    errors.push(UnitError::new(n, e));
                    continue;
                }
            };

            for dep in descriptor.unit_names() {
                let dep = dep.to_owned();
                if graph.contains(&dep) {
                    graph.add_edge(n.clone(), dep);
                } else if !self.units.contains_key(&dep) {
                    error_units.insert(n.clone());
                    errors.push(UnitError::new(
                        n,
                        CompileError::MissingUnitBinaries(dep),
                    ));
                }
                // A registered non-candidate dependency constrains nothing
                // here; the compile itself checks its binaries exist.
            }
        }

        self.flag_cycles(&graph, &mut error_units, errors);
        (graph, error_units)
    }
}
