// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Discovered code items and the containment tree holding them.

use {
    crate::entitlements::Entitlements,
    serde::{Deserialize, Serialize},
    std::{
        collections::HashMap,
        path::{Path, PathBuf},
    },
};

/// Index of a [CodeItem] within a [CodeItemTree].
pub type ItemId = usize;

/// The kind of a signable entity.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CodeItemKind {
    /// An application bundle (`.app`), including embedded helper applications.
    ApplicationBundle,
    /// A framework bundle (`.framework`).
    Framework,
    /// Plug-ins, app extensions, XPC services and other loadable bundles.
    PluginBundle,
    /// A loadable executable file: dylibs, shared objects, helper tools, scripts.
    LoadableExecutable,
    /// A bare executable given as the root of a signing operation.
    MainExecutable,
}

impl CodeItemKind {
    /// Whether this kind is a directory bundle.
    pub fn is_bundle(&self) -> bool {
        matches!(
            self,
            Self::ApplicationBundle | Self::Framework | Self::PluginBundle
        )
    }
}

impl std::fmt::Display for CodeItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::ApplicationBundle => "application",
            Self::Framework => "framework",
            Self::PluginBundle => "plugin",
            Self::LoadableExecutable => "executable",
            Self::MainExecutable => "main executable",
        })
    }
}

/// Summary of an item's existing signature relative to the target identity.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignatureState {
    /// No signature is present.
    Absent,
    /// A valid signature made by the identity we are signing with.
    ValidMatchesTarget,
    /// A valid signature made by some other identity.
    ValidOtherIdentity,
    /// A signature is present but does not verify.
    Invalid,
    /// A valid ad-hoc signature while the target is a real identity.
    AdHoc,
}

/// How demanding an item's existing designated requirement is.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequirementStrictness {
    /// No requirement, or one satisfied by any signature over the same code
    /// (e.g. a `cdhash` requirement).
    #[default]
    Relaxed,
    /// The requirement names a certificate chain or anchor. An ad-hoc
    /// signature can never satisfy it.
    CertificateChain,
}

impl RequirementStrictness {
    /// Derive strictness from designated requirement text.
    pub fn from_requirement(requirement: Option<&str>) -> Self {
        match requirement {
            Some(req)
                if req.contains("anchor")
                    || req.contains("certificate")
                    || req.contains("leaf") =>
            {
                Self::CertificateChain
            }
            _ => Self::Relaxed,
        }
    }
}

/// What a classifier learned about one filesystem entry.
#[derive(Clone, Debug, PartialEq)]
pub struct Classification {
    pub kind: CodeItemKind,
    pub current_signature: SignatureState,
    /// Common name of the leaf signing certificate, if any.
    pub signer: Option<String>,
    pub designated_requirement: Option<String>,
    pub requirement_strictness: RequirementStrictness,
    pub has_resource_envelope: bool,
    /// Resource forks, Finder info or AppleDouble files are present.
    pub has_detritus: bool,
    pub entitlements: Option<Entitlements>,
}

/// A discovered signable filesystem entity.
#[derive(Clone, Debug, Serialize)]
pub struct CodeItem {
    /// Path as discovered during traversal.
    pub path: PathBuf,
    /// Path relative to the root item. Empty for the root.
    pub relative_path: String,
    /// Fully resolved path used for deduplication.
    #[serde(skip)]
    pub canonical_path: PathBuf,
    pub kind: CodeItemKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<ItemId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ItemId>,
    pub is_symlink: bool,
    pub current_signature: SignatureState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub designated_requirement: Option<String>,
    pub requirement_strictness: RequirementStrictness,
    pub has_resource_envelope: bool,
    pub has_detritus: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entitlements: Option<Entitlements>,
}

impl CodeItem {
    pub fn new(
        path: PathBuf,
        relative_path: String,
        canonical_path: PathBuf,
        is_symlink: bool,
        classification: Classification,
    ) -> Self {
        Self {
            path,
            relative_path,
            canonical_path,
            kind: classification.kind,
            parent: None,
            children: vec![],
            is_symlink,
            current_signature: classification.current_signature,
            signer: classification.signer,
            designated_requirement: classification.designated_requirement,
            requirement_strictness: classification.requirement_strictness,
            has_resource_envelope: classification.has_resource_envelope,
            has_detritus: classification.has_detritus,
            entitlements: classification.entitlements,
        }
    }

    /// Whether the item carries a non-empty entitlements set.
    pub fn has_entitlements(&self) -> bool {
        self.entitlements
            .as_ref()
            .map(|e| !e.is_empty())
            .unwrap_or(false)
    }

    /// A name suitable for display: the relative path, or the file name for the root.
    pub fn display_name(&self) -> String {
        if self.relative_path.is_empty() {
            self.path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| self.path.display().to_string())
        } else {
            self.relative_path.clone()
        }
    }
}

/// Arena of [CodeItem] records with parent/child links stored as indices.
///
/// The first inserted item is the root.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CodeItemTree {
    items: Vec<CodeItem>,
    #[serde(skip)]
    by_canonical: HashMap<PathBuf, ItemId>,
}

impl CodeItemTree {
    /// Insert an item under `parent`, returning its id.
    ///
    /// Items are deduplicated by canonical path: if an item with the same
    /// canonical path exists, nothing is inserted and the existing id is
    /// returned as an error.
    pub fn insert(&mut self, mut item: CodeItem, parent: Option<ItemId>) -> Result<ItemId, ItemId> {
        if let Some(existing) = self.by_canonical.get(&item.canonical_path) {
            return Err(*existing);
        }

        let id = self.items.len();
        item.parent = parent;
        self.by_canonical.insert(item.canonical_path.clone(), id);
        self.items.push(item);

        if let Some(parent) = parent {
            self.items[parent].children.push(id);
        }

        Ok(id)
    }

    /// The root item id, if any item exists.
    pub fn root(&self) -> Option<ItemId> {
        if self.items.is_empty() {
            None
        } else {
            Some(0)
        }
    }

    pub fn get(&self, id: ItemId) -> Option<&CodeItem> {
        self.items.get(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterate items in insertion (discovery) order.
    pub fn iter(&self) -> impl Iterator<Item = (ItemId, &CodeItem)> {
        self.items.iter().enumerate()
    }

    /// Whether an item already resolves to the given canonical path.
    pub fn contains_canonical(&self, path: &Path) -> bool {
        self.by_canonical.contains_key(path)
    }

    /// The deepest bundle whose canonical path strictly contains `path`.
    pub fn containing_bundle(&self, path: &Path) -> Option<ItemId> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, item)| {
                item.kind.is_bundle()
                    && item.canonical_path != path
                    && path.starts_with(&item.canonical_path)
            })
            .max_by_key(|(_, item)| item.canonical_path.components().count())
            .map(|(id, _)| id)
    }

    /// All transitive children of an item.
    pub fn descendants(&self, id: ItemId) -> Vec<ItemId> {
        let mut res = vec![];
        let mut stack = self
            .items
            .get(id)
            .map(|item| item.children.clone())
            .unwrap_or_default();

        while let Some(child) = stack.pop() {
            res.push(child);
            if let Some(item) = self.items.get(child) {
                stack.extend(item.children.iter().copied());
            }
        }

        res
    }

    #[cfg(test)]
    pub(crate) fn items_mut(&mut self) -> &mut Vec<CodeItem> {
        &mut self.items
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    pub fn classification(kind: CodeItemKind, state: SignatureState) -> Classification {
        Classification {
            kind,
            current_signature: state,
            signer: None,
            designated_requirement: None,
            requirement_strictness: RequirementStrictness::Relaxed,
            has_resource_envelope: kind.is_bundle(),
            has_detritus: false,
            entitlements: None,
        }
    }

    pub fn item(path: &str, kind: CodeItemKind, state: SignatureState) -> CodeItem {
        let relative = path
            .split_once('/')
            .map(|(_, rest)| rest.to_string())
            .unwrap_or_default();

        CodeItem::new(
            PathBuf::from(path),
            relative,
            PathBuf::from("/canonical").join(path),
            false,
            classification(kind, state),
        )
    }
}
