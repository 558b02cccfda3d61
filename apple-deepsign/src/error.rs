// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    serde::{Deserialize, Serialize},
    std::path::PathBuf,
    thiserror::Error,
};

/// Unified error type for deep signing.
#[derive(Debug, Error)]
pub enum DeepSignError {
    #[error("{0}")]
    CliGeneralError(String),

    #[error("path does not exist: {0}")]
    PathNotFound(PathBuf),

    #[error("path is not suitable for being signed: {0}")]
    NotSignable(PathBuf),

    #[error("invalid signing identity: {0:?}")]
    BadIdentity(String),

    #[error("unknown metadata kind to preserve: {0}")]
    UnknownPreserveMetadata(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad glob pattern: {0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("YAML serialization error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),

    #[error("signing plan is inconsistent: {0}")]
    Planning(String),

    #[error("{0}")]
    Signing(#[from] SigningFailure),

    #[error("{incomplete} of {total} bundles were not fully signed")]
    SigningIncomplete { incomplete: usize, total: usize },
}

impl DeepSignError {
    /// Whether this error stems from bad user input rather than from the run itself.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::CliGeneralError(_)
                | Self::PathNotFound(_)
                | Self::NotSignable(_)
                | Self::BadIdentity(_)
                | Self::UnknownPreserveMetadata(_)
                | Self::GlobPattern(_)
                | Self::Config(_)
        )
    }
}

/// Failure to interpret the structure or signature of a single code item.
///
/// These are recorded against the item and never abort the whole run.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum InspectionError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("malformed Info.plist at {path}: {message}")]
    MalformedInfoPlist { path: PathBuf, message: String },

    #[error("malformed entitlements: {0}")]
    MalformedEntitlements(String),

    #[error("signature inspection tool failed: {0}")]
    Tool(String),
}

impl From<std::io::Error> for InspectionError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Coarse classification of a signing failure.
///
/// Derived from the diagnostic text emitted by the signing primitive.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// The requested signing identity could not be found.
    NoIdentity,
    /// The requested identity matched multiple certificates.
    AmbiguousIdentity,
    /// The resource envelope of a bundle is missing or invalid.
    ResourceEnvelope,
    /// Extended attributes or resource forks prevent signing.
    Detritus,
    /// A nested component is not signed.
    UnsignedSubcomponent,
    /// The signing tool could not be executed.
    ToolUnavailable,
    /// The policy refused to sign the item.
    PolicyRefused,
    /// Anything else.
    Other,
}

impl FailureKind {
    /// Classify a signing tool diagnostic.
    pub fn classify(diagnostic: &str) -> Self {
        let lower = diagnostic.to_ascii_lowercase();

        if lower.contains("no identity found") {
            Self::NoIdentity
        } else if lower.contains("ambiguous") {
            Self::AmbiguousIdentity
        } else if lower.contains("detritus") {
            Self::Detritus
        } else if lower.contains("in subcomponent") || lower.contains("not signed at all") {
            Self::UnsignedSubcomponent
        } else if lower.contains("resource envelope") || lower.contains("sealed resource") {
            Self::ResourceEnvelope
        } else {
            Self::Other
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::NoIdentity => "no identity found",
            Self::AmbiguousIdentity => "ambiguous identity",
            Self::ResourceEnvelope => "resource envelope invalid",
            Self::Detritus => "disallowed extended attributes",
            Self::UnsignedSubcomponent => "unsigned subcomponent",
            Self::ToolUnavailable => "signing tool unavailable",
            Self::PolicyRefused => "refused by policy",
            Self::Other => "signing failed",
        })
    }
}

/// A failure reported by the signing primitive for a single item.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{kind}: {diagnostic}")]
pub struct SigningFailure {
    pub kind: FailureKind,
    /// Diagnostic text from the primitive, passed through verbatim.
    pub diagnostic: String,
}

impl SigningFailure {
    /// Construct an instance by classifying diagnostic text.
    pub fn from_diagnostic(diagnostic: impl ToString) -> Self {
        let diagnostic = diagnostic.to_string();

        Self {
            kind: FailureKind::classify(&diagnostic),
            diagnostic,
        }
    }
}
