// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Invoking the signing primitive for planned items.

use {
    crate::{
        code_item::{CodeItem, SignatureState},
        error::{FailureKind, SigningFailure},
        policy::{Action, PlanEntry},
        report::ExecutionRecord,
        signing_settings::SigningSettings,
    },
    log::{debug, info, warn},
    std::path::Path,
};

/// Everything the signing primitive needs to sign one item.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SignParameters {
    /// Identity string. `-` for ad-hoc.
    pub identity: String,
    /// Entitlements blob to embed, verbatim.
    pub entitlements: Option<Vec<u8>>,
    /// Replace an existing signature.
    pub force: bool,
    /// Let the primitive recurse into nested code on its own.
    pub deep: bool,
    /// The item is a bundle whose resource envelope must be rebuilt.
    pub regenerate_resource_envelope: bool,
    pub strip_disallowed_xattrs: bool,
    pub preserve_metadata: Vec<String>,
    pub timestamp: Option<bool>,
}

/// An external primitive that writes code signatures.
pub trait SigningPrimitive {
    /// Sign the entity at `path`, returning the primitive's diagnostic output.
    fn sign(&self, path: &Path, params: &SignParameters) -> Result<String, SigningFailure>;
}

/// Performs one plan entry at a time.
pub struct SigningExecutor<'a> {
    settings: &'a SigningSettings,
    primitive: &'a dyn SigningPrimitive,
}

impl<'a> SigningExecutor<'a> {
    pub fn new(settings: &'a SigningSettings, primitive: &'a dyn SigningPrimitive) -> Self {
        Self {
            settings,
            primitive,
        }
    }

    /// Assemble signing parameters for an item.
    pub fn parameters(&self, item: &CodeItem, action: Action) -> SignParameters {
        let identity = self.settings.identity();

        let entitlements = if self
            .settings
            .entitlements_strip_pattern_matches(&item.relative_path)
        {
            None
        } else {
            item.entitlements
                .as_ref()
                .filter(|e| !e.is_empty())
                .map(|e| e.blob().to_vec())
        };

        SignParameters {
            identity: identity.as_str().to_string(),
            entitlements,
            force: item.current_signature != SignatureState::Absent
                || action == Action::ForceResign
                || self.settings.force(),
            deep: self.settings.deep(),
            regenerate_resource_envelope: item.kind.is_bundle(),
            strip_disallowed_xattrs: item.has_detritus,
            preserve_metadata: self.settings.preserve_metadata().to_vec(),
            timestamp: if identity.is_adhoc() {
                None
            } else {
                self.settings.timestamp()
            },
        }
    }

    /// Carry out a plan entry.
    ///
    /// Failures are captured in the returned record and never propagate.
    pub fn execute(&self, item: &CodeItem, entry: &PlanEntry) -> ExecutionRecord {
        let name = item.display_name();

        match entry.action {
            Action::SkipAlreadyValid => {
                info!("{} is already validly signed; skipping", name);
                ExecutionRecord::success(item, entry)
            }
            Action::RefuseRequirementDowngrade => {
                warn!(
                    "refusing to replace the certificate-chain requirement of {} with an ad-hoc signature",
                    name
                );
                ExecutionRecord::failure(
                    item,
                    entry,
                    SigningFailure {
                        kind: FailureKind::PolicyRefused,
                        diagnostic: format!(
                            "{} has a designated requirement naming a certificate chain and requirement downgrades are disallowed",
                            name
                        ),
                    },
                )
            }
            action => {
                let params = self.parameters(item, action);

                warn!("signing {} ({})", name, action);
                if let (Some(_), Some(entitlements)) = (&params.entitlements, &item.entitlements) {
                    let exceptions = entitlements.runtime_exceptions();

                    if exceptions.is_empty() {
                        info!("carrying existing entitlements forward for {}", name);
                    } else {
                        info!(
                            "carrying existing entitlements forward for {} (runtime exceptions: {:?})",
                            name, exceptions
                        );
                    }
                }

                match self.primitive.sign(&item.canonical_path, &params) {
                    Ok(output) => {
                        if !output.trim().is_empty() {
                            debug!("{}", output.trim());
                        }
                        ExecutionRecord::success(item, entry)
                    }
                    Err(failure) => {
                        warn!("failed to sign {}: {}", name, failure);
                        ExecutionRecord::failure(item, entry, failure)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use {
        super::*,
        crate::classifier::{testutil::FakeInspector, SignatureInfo, SignatureStatus},
        std::{
            collections::HashMap,
            path::PathBuf,
            sync::Mutex,
        },
    };

    /// A signer that records calls and, when bound to a [FakeInspector],
    /// makes newly signed items inspect as validly signed.
    #[derive(Default)]
    pub struct FakeSigner<'a> {
        pub inspector: Option<&'a FakeInspector>,
        pub calls: Mutex<Vec<(PathBuf, SignParameters)>>,
        pub failures: HashMap<PathBuf, String>,
    }

    impl<'a> FakeSigner<'a> {
        pub fn bound(inspector: &'a FakeInspector) -> Self {
            Self {
                inspector: Some(inspector),
                ..Default::default()
            }
        }

        pub fn fail(&mut self, path: &Path, diagnostic: &str) {
            let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
            self.failures.insert(path, diagnostic.to_string());
        }

        pub fn signed_paths(&self) -> Vec<PathBuf> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(p, _)| p.clone())
                .collect()
        }

        pub fn params_for(&self, path: &Path) -> Option<SignParameters> {
            let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
            self.calls
                .lock()
                .unwrap()
                .iter()
                .find(|(p, _)| *p == path)
                .map(|(_, params)| params.clone())
        }
    }

    impl<'a> SigningPrimitive for FakeSigner<'a> {
        fn sign(&self, path: &Path, params: &SignParameters) -> Result<String, SigningFailure> {
            self.calls
                .lock()
                .unwrap()
                .push((path.to_path_buf(), params.clone()));

            if let Some(diagnostic) = self.failures.get(path) {
                return Err(SigningFailure::from_diagnostic(diagnostic));
            }

            if let Some(inspector) = self.inspector {
                let adhoc = params.identity == "-";

                inspector.set(
                    path,
                    SignatureInfo {
                        status: SignatureStatus::Valid,
                        adhoc,
                        authorities: if adhoc {
                            vec![]
                        } else {
                            vec![params.identity.clone()]
                        },
                        team_identifier: None,
                        designated_requirement: None,
                        has_resource_envelope: params.regenerate_resource_envelope,
                        entitlements: params.entitlements.clone(),
                    },
                );
            }

            Ok(format!("{}: replacing existing signature", path.display()))
        }
    }
}
