// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Discovery of nested code items within a bundle.

use {
    crate::{
        classifier::{main_executable_name, Candidate, Classifier, SignatureInspector},
        code_item::{CodeItem, CodeItemTree, ItemId},
        error::{DeepSignError, InspectionError},
        signing_settings::SigningSettings,
    },
    log::{debug, warn},
    serde::Serialize,
    std::{
        collections::{HashSet, VecDeque},
        path::{Path, PathBuf},
    },
};

/// Directories, relative to a bundle content root, that may hold nested code.
///
/// Searched in this order.
pub const NESTED_CODE_LOCATIONS: &[&str] = &[
    "Frameworks",
    "PlugIns",
    "XPCServices",
    "Helpers",
    "Library/QuickLook",
    "Library/Automator",
    "Library/Spotlight",
    "Library/LoginItems",
    "Library/LaunchServices",
    "MacOS",
    ".",
];

/// A code item whose structure could not be interpreted.
#[derive(Clone, Debug, Serialize)]
pub struct InspectionFailure {
    pub path: PathBuf,
    pub relative_path: String,
    #[serde(serialize_with = "serialize_display")]
    pub error: InspectionError,
}

fn serialize_display<S: serde::Serializer>(
    v: &InspectionError,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(v)
}

/// Everything discovered under one root.
#[derive(Clone, Debug, Default, Serialize)]
pub struct WalkResult {
    pub tree: CodeItemTree,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub inspection_failures: Vec<InspectionFailure>,
    /// Relative paths removed by exclusion patterns.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub excluded: Vec<String>,
}

/// Ensure a root path exists and is something that can be signed.
pub fn validate_root(path: &Path) -> Result<(), DeepSignError> {
    if std::fs::symlink_metadata(path).is_err() {
        return Err(DeepSignError::PathNotFound(path.to_path_buf()));
    }

    match Candidate::from_path(path) {
        Ok(Candidate::Bundle | Candidate::Executable) => Ok(()),
        Ok(Candidate::Other) => Err(DeepSignError::NotSignable(path.to_path_buf())),
        // Dangling symlinks.
        Err(_) => Err(DeepSignError::PathNotFound(path.to_path_buf())),
    }
}

/// Sorted paths of the entries of a directory.
fn sorted_entries(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut paths = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    paths.sort();

    Ok(paths)
}

/// Recursively enumerates the code items of a bundle.
pub struct Walker<'a> {
    settings: &'a SigningSettings,
    classifier: Classifier<'a>,
}

impl<'a> Walker<'a> {
    pub fn new(settings: &'a SigningSettings, inspector: &'a dyn SignatureInspector) -> Self {
        Self {
            settings,
            classifier: Classifier::new(inspector, settings.identity()),
        }
    }

    /// Discover every code item under `root`.
    ///
    /// Fails only on usage errors. Items that cannot be inspected are
    /// recorded in [WalkResult::inspection_failures] and not descended into.
    pub fn walk(&self, root: &Path) -> Result<WalkResult, DeepSignError> {
        validate_root(root)?;

        let mut state = WalkState {
            walker: self,
            root: root.to_path_buf(),
            canonical_root: root.canonicalize()?,
            result: WalkResult::default(),
            visited_dirs: HashSet::new(),
            folded: HashSet::new(),
            failed: HashSet::new(),
            excluded: HashSet::new(),
            links: VecDeque::new(),
        };

        match self.classifier.classify(root, true) {
            Ok(Some(classification)) => {
                let is_bundle = classification.kind.is_bundle();
                let item = CodeItem::new(
                    root.to_path_buf(),
                    String::new(),
                    state.canonical_root.clone(),
                    std::fs::symlink_metadata(root)?.file_type().is_symlink(),
                    classification,
                );

                if let Ok(id) = state.result.tree.insert(item, None) {
                    if is_bundle {
                        state.walk_bundle(id, root);
                        state.walk_links();
                    }
                }
            }
            Ok(None) => return Err(DeepSignError::NotSignable(root.to_path_buf())),
            Err(error) => {
                warn!("unable to inspect {}: {}", root.display(), error);
                state.result.inspection_failures.push(InspectionFailure {
                    path: root.to_path_buf(),
                    relative_path: String::new(),
                    error,
                });
            }
        }

        debug!(
            "discovered {} code items under {}",
            state.result.tree.len(),
            root.display()
        );

        Ok(state.result)
    }
}

struct WalkState<'w, 'a> {
    walker: &'w Walker<'a>,
    root: PathBuf,
    canonical_root: PathBuf,
    result: WalkResult,
    /// Canonical paths of directories already enumerated.
    visited_dirs: HashSet<PathBuf>,
    /// Canonical paths of main executables sealed by their bundle's signature.
    folded: HashSet<PathBuf>,
    /// Canonical paths that failed inspection.
    failed: HashSet<PathBuf>,
    /// Canonical paths removed by exclusion patterns, along with their subtrees.
    excluded: HashSet<PathBuf>,
    /// Symlinks found while walking, visited once every real entry has been.
    links: VecDeque<PendingLink>,
}

/// A symlink whose visit is postponed until the real tree is known.
struct PendingLink {
    parent: ItemId,
    path: PathBuf,
    canonical: PathBuf,
    recurse_plain: bool,
}

impl<'w, 'a> WalkState<'w, 'a> {
    fn relative_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string()
    }

    fn canonical_relative_path(&self, canonical: &Path) -> String {
        canonical
            .strip_prefix(&self.canonical_root)
            .unwrap_or(canonical)
            .to_string_lossy()
            .to_string()
    }

    fn walk_bundle(&mut self, id: ItemId, bundle: &Path) {
        let contents = bundle.join("Contents");
        let versions = bundle.join("Versions");

        if contents.is_dir() {
            let nested_versions = contents.join("Versions");
            if nested_versions.is_dir() {
                self.walk_versions(id, bundle, &nested_versions);
            }

            self.fold_main_executable(&contents, bundle, &contents.join("MacOS"));
            self.walk_content_root(id, &contents);
        } else if versions.is_dir() {
            self.walk_versions(id, bundle, &versions);
        } else {
            debug!(
                "{} has neither Contents nor Versions; walking it shallowly",
                bundle.display()
            );
            self.fold_main_executable(bundle, bundle, bundle);
            self.walk_content_root(id, bundle);
        }
    }

    /// Walk every real version directory. `Current` and other symlinks are skipped.
    fn walk_versions(&mut self, id: ItemId, bundle: &Path, versions: &Path) {
        let entries = match sorted_entries(versions) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("unable to read {}: {}", versions.display(), e);
                return;
            }
        };

        for version in entries {
            if version.is_symlink() || !version.is_dir() {
                continue;
            }

            self.fold_main_executable(&version, bundle, &version);
            self.walk_content_root(id, &version);
        }
    }

    fn fold_main_executable(&mut self, content_root: &Path, bundle: &Path, exe_dir: &Path) {
        if let Some(name) = main_executable_name(content_root, bundle) {
            if let Ok(canonical) = exe_dir.join(name).canonicalize() {
                debug!("{} is sealed by its bundle", canonical.display());
                self.folded.insert(canonical);
            }
        }
    }

    fn walk_content_root(&mut self, parent: ItemId, content_root: &Path) {
        for location in NESTED_CODE_LOCATIONS {
            let dir = if *location == "." {
                content_root.to_path_buf()
            } else {
                content_root.join(location)
            };

            if dir.is_dir() {
                self.walk_dir(parent, &dir, *location != ".");
            }
        }
    }

    fn walk_dir(&mut self, parent: ItemId, dir: &Path, recurse_plain: bool) {
        let canonical_dir = match dir.canonicalize() {
            Ok(p) => p,
            Err(e) => {
                warn!("unable to resolve {}: {}", dir.display(), e);
                return;
            }
        };

        if !self.visited_dirs.insert(canonical_dir.clone()) {
            debug!("{} already walked", dir.display());
            return;
        }

        let entries = match sorted_entries(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("unable to read {}: {}", dir.display(), e);
                return;
            }
        };

        for path in entries {
            let is_symlink = path.is_symlink();

            let canonical = match path.canonicalize() {
                Ok(p) => p,
                Err(_) => {
                    debug!("ignoring dangling symlink {}", path.display());
                    continue;
                }
            };

            if is_symlink {
                if !canonical.starts_with(&self.canonical_root) {
                    warn!(
                        "{} points outside of the bundle; ignoring",
                        self.relative_path(&path)
                    );
                    continue;
                }

                if canonical_dir.starts_with(&canonical) {
                    warn!(
                        "{} points to an ancestor directory; ignoring",
                        self.relative_path(&path)
                    );
                    continue;
                }

                // Real entries claim their items first, so containment always
                // reflects where an item actually lives.
                self.links.push_back(PendingLink {
                    parent,
                    path,
                    canonical,
                    recurse_plain,
                });
                continue;
            }

            self.visit_entry(parent, &path, canonical, false, recurse_plain);
        }
    }

    /// Visit postponed symlinks, including any found while visiting them.
    fn walk_links(&mut self) {
        while let Some(link) = self.links.pop_front() {
            self.visit_entry(
                link.parent,
                &link.path,
                link.canonical,
                true,
                link.recurse_plain,
            );
        }
    }

    fn visit_entry(
        &mut self,
        parent: ItemId,
        path: &Path,
        canonical: PathBuf,
        is_symlink: bool,
        recurse_plain: bool,
    ) {
        let candidate = match Candidate::from_path(path) {
            Ok(c) => c,
            Err(e) => {
                warn!("unable to stat {}: {}", path.display(), e);
                return;
            }
        };

        match candidate {
            Candidate::Bundle => {
                if !self.visit_item(parent, path, canonical, is_symlink) && recurse_plain {
                    self.walk_dir(parent, path, true);
                }
            }
            Candidate::Executable => {
                if !self.folded.contains(&canonical) {
                    self.visit_item(parent, path, canonical, is_symlink);
                }
            }
            Candidate::Other if recurse_plain && path.is_dir() => {
                self.walk_dir(parent, path, true);
            }
            Candidate::Other => {}
        }
    }

    /// Classify and record one candidate, descending into bundles.
    ///
    /// The item is attached to the deepest discovered bundle containing its
    /// canonical path, which is `parent` unless it was reached through a
    /// symlink. Returns false if the candidate turned out not to be a code item.
    fn visit_item(
        &mut self,
        parent: ItemId,
        path: &Path,
        canonical: PathBuf,
        is_symlink: bool,
    ) -> bool {
        if self.result.tree.contains_canonical(&canonical) || self.failed.contains(&canonical) {
            debug!(
                "{} resolves to an already discovered item",
                self.relative_path(path)
            );
            return true;
        }

        if self.excluded.iter().any(|e| canonical.starts_with(e)) {
            debug!(
                "{} resolves to an excluded item",
                self.relative_path(path)
            );
            return true;
        }

        let relative_path = self.relative_path(path);
        let settings = self.walker.settings;

        if settings.path_exclusion_pattern_matches(&relative_path)
            || settings.path_exclusion_pattern_matches(&self.canonical_relative_path(&canonical))
        {
            warn!("excluding {} from signing", relative_path);
            self.result.excluded.push(relative_path);
            self.excluded.insert(canonical);
            return true;
        }

        let classification = match self.walker.classifier.classify(path, false) {
            Ok(Some(c)) => c,
            Ok(None) => {
                debug!("{} is not a code item", relative_path);
                return false;
            }
            Err(error) => {
                warn!("unable to inspect {}: {}", relative_path, error);
                self.failed.insert(canonical);
                self.result.inspection_failures.push(InspectionFailure {
                    path: path.to_path_buf(),
                    relative_path,
                    error,
                });
                return true;
            }
        };

        let parent = self
            .result
            .tree
            .containing_bundle(&canonical)
            .unwrap_or(parent);

        let is_bundle = classification.kind.is_bundle();
        let item = CodeItem::new(
            path.to_path_buf(),
            relative_path,
            canonical,
            is_symlink,
            classification,
        );

        if let Ok(id) = self.result.tree.insert(item, Some(parent)) {
            if is_bundle {
                self.walk_bundle(id, path);
            }
        }

        true
    }
}
