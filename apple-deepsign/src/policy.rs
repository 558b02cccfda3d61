// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-item signing decisions.

use {
    crate::{
        code_item::{
            CodeItem, CodeItemKind, CodeItemTree, ItemId, RequirementStrictness, SignatureState,
        },
        signing_settings::SigningSettings,
    },
    serde::{Deserialize, Serialize},
};

/// What to do with a single code item.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    SignWithTargetIdentity,
    SkipAlreadyValid,
    /// Replace an existing signature even though doing so downgrades its requirement.
    ForceResign,
    /// Re-sign, carrying the existing entitlements into the new signature.
    ResignPreserveEntitlements,
    /// Leave the item alone because the downgrade toggle forbids replacing
    /// a certificate-chain requirement with an ad-hoc signature.
    RefuseRequirementDowngrade,
}

impl Action {
    /// Whether performing this action writes a new signature.
    pub fn writes(&self) -> bool {
        matches!(
            self,
            Self::SignWithTargetIdentity | Self::ForceResign | Self::ResignPreserveEntitlements
        )
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::SignWithTargetIdentity => "sign",
            Self::SkipAlreadyValid => "skip",
            Self::ForceResign => "force-resign",
            Self::ResignPreserveEntitlements => "resign-preserve-entitlements",
            Self::RefuseRequirementDowngrade => "refuse",
        })
    }
}

/// A decided unit of work.
#[derive(Clone, Debug, Serialize)]
pub struct PlanEntry {
    #[serde(skip)]
    pub item: ItemId,
    pub path: String,
    pub kind: CodeItemKind,
    pub action: Action,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// The ordered work list for one root, decided before anything is signed.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SigningPlan {
    pub entries: Vec<PlanEntry>,
}

impl SigningPlan {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries that will write a signature.
    pub fn write_count(&self) -> usize {
        self.entries.iter().filter(|e| e.action.writes()).count()
    }
}

impl std::fmt::Display for SigningPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for entry in &self.entries {
            writeln!(f, "{:<30} {} ({})", entry.action, entry.path, entry.kind)?;
            for warning in &entry.warnings {
                writeln!(f, "{:<30}   warning: {}", "", warning)?;
            }
        }

        Ok(())
    }
}

/// Decides the [Action] of each code item.
pub struct EdgeCasePolicy<'a> {
    settings: &'a SigningSettings,
}

impl<'a> EdgeCasePolicy<'a> {
    pub fn new(settings: &'a SigningSettings) -> Self {
        Self { settings }
    }

    /// Decide the action for one item.
    ///
    /// `subtree_writes` says whether anything nested inside the item will be
    /// signed before it.
    pub fn decide(&self, item: &CodeItem, subtree_writes: bool) -> (Action, Vec<String>) {
        let identity = self.settings.identity();
        let mut warnings = vec![];

        let strip = item.has_entitlements()
            && self
                .settings
                .entitlements_strip_pattern_matches(&item.relative_path);
        if strip {
            warnings.push("existing entitlements will be removed".to_string());
        }

        if item.has_detritus {
            warnings.push("extended attributes and resource forks will be stripped".to_string());
        }

        let envelope_intact = !item.kind.is_bundle() || item.has_resource_envelope;

        if item.current_signature == SignatureState::ValidMatchesTarget
            && envelope_intact
            && !strip
            && !subtree_writes
            && !self.settings.force()
        {
            return (Action::SkipAlreadyValid, warnings);
        }

        if identity.is_adhoc()
            && item.requirement_strictness == RequirementStrictness::CertificateChain
        {
            warnings.push(
                "designated requirement names a certificate chain; an ad-hoc signature may \
                 cause the code or its peers to reject it at runtime"
                    .to_string(),
            );

            let action = if self.settings.allow_requirement_downgrade() {
                Action::ForceResign
            } else {
                Action::RefuseRequirementDowngrade
            };

            return (action, warnings);
        }

        if item.has_entitlements() && !strip && !identity.matches_signer(item.signer.as_deref()) {
            return (Action::ResignPreserveEntitlements, warnings);
        }

        (Action::SignWithTargetIdentity, warnings)
    }

    /// Build the plan for items in resolved order.
    pub fn plan(&self, tree: &CodeItemTree, order: &[ItemId]) -> SigningPlan {
        let mut subtree_writes = vec![false; tree.len()];
        let mut entries = Vec::with_capacity(order.len());

        for id in order {
            let item = match tree.get(*id) {
                Some(item) => item,
                None => continue,
            };

            let children_write = item
                .children
                .iter()
                .any(|child| subtree_writes.get(*child).copied().unwrap_or(false));

            let (action, warnings) = self.decide(item, children_write);
            subtree_writes[*id] = children_write || action.writes();

            entries.push(PlanEntry {
                item: *id,
                path: item.display_name(),
                kind: item.kind,
                action,
                warnings,
            });
        }

        SigningPlan { entries }
    }
}
