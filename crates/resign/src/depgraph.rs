use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::{macho, Result};

/// The order binaries must be signed in. A dependency always precedes its
/// dependents, either position-wise in the flat sequence or layer-wise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningPlan {
    /// Serial order, leaves first, main executable last.
    Flat(Vec<PathBuf>),
    /// Groups of mutually independent binaries; a group may be signed
    /// concurrently once every earlier group has completed. The final layer
    /// is the main executable.
    Layered(Vec<Vec<PathBuf>>),
}

impl SigningPlan {
    /// Every binary in the plan, dependency order preserved.
    pub fn binaries(&self) -> Vec<&PathBuf> {
        match self {
            SigningPlan::Flat(order) => order.iter().collect(),
            SigningPlan::Layered(layers) => layers.iter().flatten().collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SigningPlan::Flat(order) => order.len(),
            SigningPlan::Layered(layers) => layers.iter().map(Vec::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Compute the signing order for a bundle's binaries by reading each
/// candidate's dylib load commands and resolving them against the bundle.
pub fn signing_plan(
    appdir: &Path,
    main: &Path,
    candidates: &[PathBuf],
    parallel: bool,
) -> Result<SigningPlan> {
    let members: BTreeSet<PathBuf> = candidates
        .iter()
        .cloned()
        .chain([main.to_path_buf()])
        .collect();

    let mut deps: BTreeMap<PathBuf, BTreeSet<PathBuf>> = BTreeMap::new();
    for binary in &members {
        let resolved = macho::linked_libraries(binary)?
            .iter()
            .filter_map(|reference| resolve_reference(appdir, reference, &members))
            .filter(|dep| dep != binary)
            .collect();
        deps.insert(binary.clone(), resolved);
    }

    Ok(plan_from_deps(main, &deps, parallel))
}

/// Map one load-command reference to a bundle member, if it names one.
/// References into the system (`/usr/lib`, `/System`) resolve to nothing.
fn resolve_reference(
    appdir: &Path,
    reference: &str,
    members: &BTreeSet<PathBuf>,
) -> Option<PathBuf> {
    let rest = reference
        .strip_prefix("@rpath/")
        .or_else(|| reference.strip_prefix("@executable_path/"))
        .or_else(|| reference.strip_prefix("@loader_path/"));

    if let Some(rest) = rest {
        for candidate in [appdir.join(rest), appdir.join("Frameworks").join(rest)] {
            if members.contains(&candidate) {
                return Some(candidate);
            }
        }
        return members.iter().find(|m| m.ends_with(rest)).cloned();
    }

    let path = Path::new(reference);
    if path.is_absolute() && path.starts_with(appdir) && members.contains(path) {
        return Some(path.to_path_buf());
    }
    None
}

// Kahn-style layering: each round removes the binaries whose remaining
// dependencies are all satisfied. Leftover nodes mean a dependency cycle,
// which falls back to the flat lexicographic order.
fn plan_from_deps(
    main: &Path,
    deps: &BTreeMap<PathBuf, BTreeSet<PathBuf>>,
    parallel: bool,
) -> SigningPlan {
    let mut remaining: BTreeMap<&PathBuf, BTreeSet<&PathBuf>> = deps
        .iter()
        .filter(|(binary, _)| binary.as_path() != main)
        .map(|(binary, d)| {
            let within: BTreeSet<&PathBuf> =
                d.iter().filter(|dep| dep.as_path() != main).collect();
            (binary, within)
        })
        .collect();

    let mut layers: Vec<Vec<PathBuf>> = Vec::new();
    let mut satisfied: BTreeSet<&PathBuf> = BTreeSet::new();

    while !remaining.is_empty() {
        let ready: Vec<&PathBuf> = remaining
            .iter()
            .filter(|(_, d)| d.iter().all(|dep| satisfied.contains(dep)))
            .map(|(binary, _)| *binary)
            .collect();
        if ready.is_empty() {
            // cycle: sign everything serially, main last
            let mut order: Vec<PathBuf> = deps
                .keys()
                .filter(|binary| binary.as_path() != main)
                .cloned()
                .collect();
            order.push(main.to_path_buf());
            return SigningPlan::Flat(order);
        }
        for binary in &ready {
            remaining.remove(*binary);
            satisfied.insert(*binary);
        }
        layers.push(ready.into_iter().cloned().collect());
    }

    if parallel {
        layers.push(vec![main.to_path_buf()]);
        SigningPlan::Layered(layers)
    } else {
        let mut order: Vec<PathBuf> = layers.into_iter().flatten().collect();
        order.push(main.to_path_buf());
        SigningPlan::Flat(order)
    }
}
