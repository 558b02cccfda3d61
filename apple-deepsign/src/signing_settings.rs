// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deep signing settings.

use {
    crate::error::DeepSignError,
    glob::Pattern,
    serde::{Serialize, Serializer},
    std::str::FromStr,
};

/// Metadata kinds `codesign --preserve-metadata` accepts.
pub const PRESERVABLE_METADATA: &[&str] = &[
    "identifier",
    "entitlements",
    "requirements",
    "flags",
    "runtime",
    "launch-constraints",
    "library-constraints",
];

/// The identity new signatures are made with.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SigningIdentity {
    /// Ad-hoc signing, spelled `-`.
    AdHoc,
    /// A named identity: a certificate common name (or a whole-word part of one)
    /// or a SHA-1 certificate fingerprint.
    Named(String),
}

impl SigningIdentity {
    pub fn is_adhoc(&self) -> bool {
        matches!(self, Self::AdHoc)
    }

    /// The string form passed to the signing primitive.
    pub fn as_str(&self) -> &str {
        match self {
            Self::AdHoc => "-",
            Self::Named(name) => name,
        }
    }

    /// Whether a signature made by `signer` was made with this identity.
    ///
    /// `signer` is the common name of the leaf certificate of an existing
    /// non ad-hoc signature. Names match either exactly or as a part of the
    /// common name that isn't glued to surrounding letters or digits, so
    /// `Foo` matches `Developer ID Application: Foo (X)` but not `Foobar`.
    pub fn matches_signer(&self, signer: Option<&str>) -> bool {
        match (self, signer) {
            (Self::Named(name), Some(signer)) => {
                signer == name
                    || signer.match_indices(name.as_str()).any(|(start, _)| {
                        let before = signer[..start].chars().next_back();
                        let after = signer[start + name.len()..].chars().next();

                        !before.map_or(false, char::is_alphanumeric)
                            && !after.map_or(false, char::is_alphanumeric)
                    })
            }
            _ => false,
        }
    }
}

impl FromStr for SigningIdentity {
    type Err = DeepSignError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "-" {
            Ok(Self::AdHoc)
        } else if s.trim().is_empty() || s.starts_with('-') || s.chars().any(|c| c.is_control())
        {
            Err(DeepSignError::BadIdentity(s.to_string()))
        } else {
            Ok(Self::Named(s.to_string()))
        }
    }
}

impl std::fmt::Display for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AdHoc => f.write_str("ad-hoc"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

impl Serialize for SigningIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Represents deep signing settings.
///
/// An instance is bound to a single invocation and is shared by every
/// component of the signing pipeline.
#[derive(Clone, Debug)]
pub struct SigningSettings {
    identity: SigningIdentity,
    force: bool,
    deep: bool,
    allow_requirement_downgrade: bool,
    path_exclusion_patterns: Vec<Pattern>,
    entitlements_strip_patterns: Vec<Pattern>,
    preserve_metadata: Vec<String>,
    timestamp: Option<bool>,
}

impl SigningSettings {
    /// Construct default settings for an identity.
    pub fn new(identity: SigningIdentity) -> Self {
        Self {
            identity,
            force: false,
            deep: false,
            allow_requirement_downgrade: true,
            path_exclusion_patterns: vec![],
            entitlements_strip_patterns: vec![],
            preserve_metadata: vec![],
            timestamp: None,
        }
    }

    /// The identity to sign with.
    pub fn identity(&self) -> &SigningIdentity {
        &self.identity
    }

    /// Whether items whose signature is already valid are re-signed anyway.
    pub fn force(&self) -> bool {
        self.force
    }

    pub fn set_force(&mut self, v: bool) {
        self.force = v;
    }

    /// Whether to ask the signing primitive to also sign nested code itself.
    ///
    /// Nested items are always discovered and signed individually. This only
    /// affects the flags handed to the primitive.
    pub fn deep(&self) -> bool {
        self.deep
    }

    pub fn set_deep(&mut self, v: bool) {
        self.deep = v;
    }

    /// Whether ad-hoc signing may replace a signature whose designated
    /// requirement demands a certificate chain.
    pub fn allow_requirement_downgrade(&self) -> bool {
        self.allow_requirement_downgrade
    }

    pub fn set_allow_requirement_downgrade(&mut self, v: bool) {
        self.allow_requirement_downgrade = v;
    }

    /// Whether a root-relative path matches a path exclusion pattern.
    pub fn path_exclusion_pattern_matches(&self, path: &str) -> bool {
        self.path_exclusion_patterns
            .iter()
            .any(|pattern| pattern.matches(path))
    }

    /// Add a path to the exclusions list.
    pub fn add_path_exclusion(&mut self, v: &str) -> Result<(), DeepSignError> {
        self.path_exclusion_patterns.push(Pattern::new(v)?);
        Ok(())
    }

    /// Whether existing entitlements should be dropped for a root-relative path.
    pub fn entitlements_strip_pattern_matches(&self, path: &str) -> bool {
        self.entitlements_strip_patterns
            .iter()
            .any(|pattern| pattern.matches(path))
    }

    /// Request removal of entitlements for paths matching a glob.
    pub fn add_entitlements_strip(&mut self, v: &str) -> Result<(), DeepSignError> {
        self.entitlements_strip_patterns.push(Pattern::new(v)?);
        Ok(())
    }

    /// Metadata to preserve from existing signatures.
    pub fn preserve_metadata(&self) -> &[String] {
        &self.preserve_metadata
    }

    pub fn add_preserve_metadata(&mut self, v: &str) -> Result<(), DeepSignError> {
        if !PRESERVABLE_METADATA.contains(&v) {
            return Err(DeepSignError::UnknownPreserveMetadata(v.to_string()));
        }

        if !self.preserve_metadata.iter().any(|x| x == v) {
            self.preserve_metadata.push(v.to_string());
        }

        Ok(())
    }

    /// Whether to request a secure timestamp. `None` leaves the tool default.
    pub fn timestamp(&self) -> Option<bool> {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, v: Option<bool>) {
        self.timestamp = v;
    }
}
