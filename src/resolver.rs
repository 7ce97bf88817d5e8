//! Dependency closure over the catalog.
//!
//! Traversal is an iterative depth-first walk with an explicit stack, so deep
//! or cyclic graphs cannot blow the call stack. Packages are emitted in
//! post-order: every package's dependencies appear before it in the plan.

use crate::catalog::{CatalogIndex, PackageDescriptor};
use serde::Serialize;
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallPlan {
    /// Install order, dependencies first, no id twice.
    pub packages: Vec<PackageDescriptor>,
    /// Requested or referenced ids the catalog does not know, in discovery order.
    pub unresolved: Vec<String>,
    /// The roots the plan was built from, deduplicated.
    pub requested: Vec<String>,
}

impl InstallPlan {
    /// Entries pulled in only because something requested depends on them.
    pub fn added_dependencies(&self) -> Vec<&PackageDescriptor> {
        self.packages
            .iter()
            .filter(|package| !self.requested.contains(&package.id))
            .collect()
    }

    /// The plan restricted to what the user picked, keeping plan order.
    pub fn only_requested(&self) -> InstallPlan {
        InstallPlan {
            packages: self
                .packages
                .iter()
                .filter(|package| self.requested.contains(&package.id))
                .cloned()
                .collect(),
            unresolved: self
                .unresolved
                .iter()
                .filter(|id| self.requested.contains(id))
                .cloned()
                .collect(),
            requested: self.requested.clone(),
        }
    }
}

pub struct DependencyResolver<'a> {
    catalog: &'a CatalogIndex,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(catalog: &'a CatalogIndex) -> Self {
        Self { catalog }
    }

    pub fn resolve<I, S>(&self, requested: I) -> InstallPlan
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut plan = InstallPlan::default();
        let mut visited: HashSet<String> = HashSet::new();

        for root in requested {
            let root = root.as_ref().trim();
            if root.is_empty() || plan.requested.iter().any(|id| id == root) {
                continue;
            }
            plan.requested.push(root.to_string());
            self.walk(root, &mut visited, &mut plan);
        }

        debug!(
            requested = plan.requested.len(),
            planned = plan.packages.len(),
            unresolved = plan.unresolved.len(),
            "dependencies resolved"
        );
        plan
    }

    fn walk(&self, root: &str, visited: &mut HashSet<String>, plan: &mut InstallPlan) {
        let Some(root) = self.enter(root, visited, plan) else {
            return;
        };

        let mut stack: Vec<(&'a PackageDescriptor, usize)> = vec![(root, 0)];
        while let Some(frame) = stack.last_mut() {
            let package: &'a PackageDescriptor = frame.0;
            match package.dependency_ids.get(frame.1) {
                Some(dependency) => {
                    frame.1 += 1;
                    if let Some(next) = self.enter(dependency.trim(), visited, plan) {
                        stack.push((next, 0));
                    }
                }
                None => {
                    stack.pop();
                    plan.packages.push(package.clone());
                }
            }
        }
    }

    /// Marks `id` visited. Returns the descriptor to expand, or `None` when
    /// the id was already seen or is missing from the catalog.
    fn enter(
        &self,
        id: &str,
        visited: &mut HashSet<String>,
        plan: &mut InstallPlan,
    ) -> Option<&'a PackageDescriptor> {
        if id.is_empty() || !visited.insert(id.to_string()) {
            return None;
        }
        match self.catalog.lookup_by_id(id) {
            Some(package) => Some(package),
            None => {
                plan.unresolved.push(id.to_string());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{tests::record, CatalogRecord};
    use proptest::prelude::*;

    fn catalog(entries: &[(&str, &[&str])]) -> CatalogIndex {
        CatalogIndex::load(entries.iter().map(|(id, deps)| record(id, deps))).unwrap()
    }

    fn ids(plan: &InstallPlan) -> Vec<&str> {
        plan.packages.iter().map(|package| package.id.as_str()).collect()
    }

    fn planned(plan: &InstallPlan, id: &str) -> bool {
        plan.packages.iter().any(|package| package.id == id)
    }

    #[test]
    fn dependencies_come_first() {
        let catalog = catalog(&[
            ("a-Mod", &["b-Lib"]),
            ("b-Lib", &["c-Core"]),
            ("c-Core", &[]),
        ]);
        let plan = DependencyResolver::new(&catalog).resolve(["a-Mod"]);
        assert_eq!(ids(&plan), vec!["c-Core", "b-Lib", "a-Mod"]);
        assert!(plan.unresolved.is_empty());
        assert_eq!(plan.added_dependencies().len(), 2);
    }

    #[test]
    fn diamond_collapses_to_one_entry() {
        let catalog = catalog(&[
            ("a-A", &["c-C"]),
            ("b-B", &["c-C"]),
            ("c-C", &[]),
        ]);
        let plan = DependencyResolver::new(&catalog).resolve(["a-A", "b-B"]);
        assert_eq!(ids(&plan), vec!["c-C", "a-A", "b-B"]);
    }

    #[test]
    fn cycles_terminate() {
        let catalog = catalog(&[("a-A", &["b-B"]), ("b-B", &["a-A"])]);
        let plan = DependencyResolver::new(&catalog).resolve(["a-A"]);
        assert_eq!(ids(&plan), vec!["b-B", "a-A"]);

        let self_loop = self::catalog(&[("s-S", &["s-S"])]);
        let plan = DependencyResolver::new(&self_loop).resolve(["s-S"]);
        assert_eq!(ids(&plan), vec!["s-S"]);
    }

    #[test]
    fn missing_dependency_is_reported_not_fatal() {
        let catalog = catalog(&[("a-A", &["z-Z", "b-B"]), ("b-B", &[])]);
        let plan = DependencyResolver::new(&catalog).resolve(["a-A", "ghost-Mod"]);
        assert_eq!(ids(&plan), vec!["b-B", "a-A"]);
        assert_eq!(plan.unresolved, vec!["z-Z".to_string(), "ghost-Mod".to_string()]);
    }

    #[test]
    fn repeated_requests_are_ignored() {
        let catalog = catalog(&[("a-A", &[])]);
        let plan = DependencyResolver::new(&catalog).resolve(["a-A", " a-A ", ""]);
        assert_eq!(plan.requested, vec!["a-A".to_string()]);
        assert_eq!(ids(&plan), vec!["a-A"]);
    }

    #[test]
    fn deep_chains_do_not_recurse() {
        let depth = 20_000;
        let records: Vec<CatalogRecord> = (0..depth)
            .map(|i| {
                let id = format!("n-{i}");
                let dep = format!("n-{}", i + 1);
                if i + 1 < depth {
                    record(&id, &[dep.as_str()])
                } else {
                    record(&id, &[])
                }
            })
            .collect();
        let catalog = CatalogIndex::load(records).unwrap();
        let plan = DependencyResolver::new(&catalog).resolve(["n-0"]);
        assert_eq!(plan.packages.len(), depth);
        assert_eq!(plan.packages[0].id, format!("n-{}", depth - 1));
        assert_eq!(plan.packages[depth - 1].id, "n-0");
    }

    #[test]
    fn only_requested_keeps_plan_order() {
        let catalog = catalog(&[("a-A", &["c-C"]), ("b-B", &["c-C", "x-X"]), ("c-C", &[])]);
        let plan = DependencyResolver::new(&catalog).resolve(["b-B", "a-A"]);
        let trimmed = plan.only_requested();
        assert_eq!(ids(&trimmed), vec!["b-B", "a-A"]);
        assert!(trimmed.unresolved.is_empty());
    }

    /// Random graphs: node `i` depends on the listed indices; indices past the
    /// catalog size are ids the catalog does not contain.
    fn graph_strategy() -> impl Strategy<Value = (Vec<Vec<usize>>, Vec<usize>)> {
        (1usize..12).prop_flat_map(|n| {
            (
                prop::collection::vec(prop::collection::vec(0..n + 3, 0..4), n),
                prop::collection::vec(0..n + 2, 1..5),
            )
        })
    }

    fn build(edges: &[Vec<usize>]) -> CatalogIndex {
        let names: Vec<String> = (0..edges.len() + 3).map(|i| format!("p-{i}")).collect();
        let records: Vec<CatalogRecord> = edges
            .iter()
            .enumerate()
            .map(|(i, deps)| {
                let deps: Vec<&str> = deps.iter().map(|&d| names[d].as_str()).collect();
                record(&names[i], &deps)
            })
            .collect();
        CatalogIndex::load(records).unwrap()
    }

    proptest! {
        #[test]
        fn plans_have_no_duplicates_and_cover_requests((edges, roots) in graph_strategy()) {
            let catalog = build(&edges);
            let requested: Vec<String> = roots.iter().map(|i| format!("p-{i}")).collect();
            let plan = DependencyResolver::new(&catalog).resolve(&requested);

            let unique: HashSet<&str> = ids(&plan).into_iter().collect();
            prop_assert_eq!(unique.len(), plan.packages.len());

            for id in &requested {
                prop_assert!(planned(&plan, id) || plan.unresolved.contains(id));
            }

            // Closure: every catalog edge out of a planned package is covered.
            for package in &plan.packages {
                for dep in &package.dependency_ids {
                    prop_assert!(planned(&plan, dep) || plan.unresolved.contains(dep));
                }
            }

            let again = DependencyResolver::new(&catalog).resolve(&requested);
            prop_assert_eq!(&plan, &again);
        }

        #[test]
        fn acyclic_graphs_install_dependencies_first((edges, roots) in graph_strategy()) {
            // Keep only edges to lower indices so the graph is a DAG.
            let dag: Vec<Vec<usize>> = edges
                .iter()
                .enumerate()
                .map(|(i, deps)| deps.iter().copied().filter(|&d| d < i).collect())
                .collect();
            let catalog = build(&dag);
            let requested: Vec<String> = roots.iter().map(|i| format!("p-{i}")).collect();
            let plan = DependencyResolver::new(&catalog).resolve(&requested);

            for (position, package) in plan.packages.iter().enumerate() {
                for dep in &package.dependency_ids {
                    let dep_position = plan.packages.iter().position(|p| &p.id == dep);
                    prop_assert!(matches!(dep_position, Some(p) if p < position));
                }
            }
        }
    }
}
