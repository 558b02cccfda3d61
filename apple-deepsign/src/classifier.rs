// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deciding whether a filesystem entry is a code item.

use {
    crate::{
        code_item::{Classification, CodeItemKind, RequirementStrictness, SignatureState},
        entitlements::Entitlements,
        error::InspectionError,
        signing_settings::SigningIdentity,
    },
    log::debug,
    simple_file_manifest::is_executable,
    std::path::{Path, PathBuf},
};

/// Directory extensions of bundles that can carry code even without an `Info.plist`.
const CODE_BUNDLE_EXTENSIONS: &[&str] = &[
    "app",
    "appex",
    "bundle",
    "dext",
    "framework",
    "kext",
    "mdimporter",
    "plugin",
    "prefpane",
    "qlgenerator",
    "saver",
    "systemextension",
    "xpc",
    "action",
];

/// Validity of an existing signature as reported by an inspection primitive.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SignatureStatus {
    Unsigned,
    Valid,
    /// The signature does not verify. Holds the verifier's diagnostic.
    Invalid(String),
}

/// Everything an inspection primitive reports about one path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SignatureInfo {
    pub status: SignatureStatus,
    pub adhoc: bool,
    /// Certificate common names of the signing chain, leaf first.
    pub authorities: Vec<String>,
    pub team_identifier: Option<String>,
    pub designated_requirement: Option<String>,
    pub has_resource_envelope: bool,
    /// Raw entitlements blob, if any are attached.
    pub entitlements: Option<Vec<u8>>,
}

impl SignatureInfo {
    pub fn unsigned() -> Self {
        Self {
            status: SignatureStatus::Unsigned,
            adhoc: false,
            authorities: vec![],
            team_identifier: None,
            designated_requirement: None,
            has_resource_envelope: false,
            entitlements: None,
        }
    }
}

/// An external primitive that reads existing code signatures.
pub trait SignatureInspector {
    /// Inspect the signature of the entity at `path`.
    fn inspect(&self, path: &Path) -> Result<SignatureInfo, InspectionError>;
}

/// The shape of a filesystem entry, before any signature inspection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Candidate {
    /// A directory whose name carries a file extension.
    Bundle,
    /// A regular file marked executable.
    Executable,
    Other,
}

impl Candidate {
    /// Determine the candidate type of a path, following symlinks.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;

        Ok(if metadata.is_dir() {
            // Don't require `Contents` or `Versions`: poorly structured bundles can lack both.
            match path.extension() {
                Some(ext) if !ext.is_empty() => Self::Bundle,
                _ => Self::Other,
            }
        } else if metadata.is_file() && is_executable(&metadata) {
            // Anything executable can be signed, scripts included.
            Self::Executable
        } else {
            Self::Other
        })
    }
}

/// Locate the `Info.plist` of a bundle directory.
pub fn find_info_plist(bundle: &Path) -> Option<PathBuf> {
    let mut candidates = vec![
        bundle.join("Contents").join("Info.plist"),
        bundle.join("Resources").join("Info.plist"),
        bundle
            .join("Versions")
            .join("Current")
            .join("Resources")
            .join("Info.plist"),
        bundle.join("Info.plist"),
    ];

    if let Ok(entries) = std::fs::read_dir(bundle.join("Versions")) {
        let mut versions = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| !p.is_symlink() && p.is_dir())
            .collect::<Vec<_>>();
        versions.sort();

        candidates.extend(
            versions
                .into_iter()
                .map(|v| v.join("Resources").join("Info.plist")),
        );
    }

    candidates.into_iter().find(|p| p.is_file())
}

fn read_info_plist(path: &Path) -> Result<plist::Dictionary, InspectionError> {
    plist::Value::from_file(path)
        .map_err(|e| InspectionError::MalformedInfoPlist {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?
        .into_dictionary()
        .ok_or_else(|| InspectionError::MalformedInfoPlist {
            path: path.to_path_buf(),
            message: "not a dictionary".into(),
        })
}

/// Resolve the main executable name of a bundle content root.
///
/// `content_root` is the directory holding `Info.plist` (or `Resources/Info.plist`).
/// Falls back to the bundle name without its extension.
pub fn main_executable_name(content_root: &Path, bundle: &Path) -> Option<String> {
    [
        content_root.join("Info.plist"),
        content_root.join("Resources").join("Info.plist"),
    ]
    .into_iter()
    .filter(|p| p.is_file())
    .find_map(|p| {
        read_info_plist(&p).ok().and_then(|d| {
            d.get("CFBundleExecutable")
                .and_then(|v| v.as_string())
                .map(|s| s.to_string())
        })
    })
    .or_else(|| {
        bundle
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
    })
}

/// Determine the kind of a bundle directory.
///
/// Returns `None` for directories that look like bundles but cannot carry code.
pub fn bundle_kind(path: &Path) -> Result<Option<CodeItemKind>, InspectionError> {
    let extension = match path.extension() {
        Some(ext) => ext.to_string_lossy().to_ascii_lowercase(),
        None => return Ok(None),
    };

    let by_extension = || match extension.as_str() {
        "app" => CodeItemKind::ApplicationBundle,
        "framework" => CodeItemKind::Framework,
        _ => CodeItemKind::PluginBundle,
    };

    let package_type = if let Some(plist_path) = find_info_plist(path) {
        let info = read_info_plist(&plist_path)?;

        Some(
            info.get("CFBundlePackageType")
                .and_then(|v| v.as_string())
                .unwrap_or_default()
                .to_string(),
        )
    } else {
        None
    };

    match package_type.as_deref() {
        Some("dSYM") => Ok(None),
        _ if extension == "dsym" => Ok(None),
        Some("APPL") => Ok(Some(CodeItemKind::ApplicationBundle)),
        Some("FMWK") => Ok(Some(CodeItemKind::Framework)),
        Some(_) => Ok(Some(by_extension())),
        None if CODE_BUNDLE_EXTENSIONS.contains(&extension.as_str()) => Ok(Some(by_extension())),
        None => {
            debug!(
                "{} has no Info.plist and an unknown extension; not a code bundle",
                path.display()
            );
            Ok(None)
        }
    }
}

/// Whether a file or any file inside a directory carries a resource fork.
///
/// Resource forks and similar detritus make signing fail unless stripped.
pub fn has_detritus(path: &Path) -> bool {
    fn file_has_detritus(path: &Path) -> bool {
        let is_apple_double = path
            .file_name()
            .map(|n| n.to_string_lossy().starts_with("._"))
            .unwrap_or(false);

        is_apple_double || resource_fork_len(path) > 0
    }

    let metadata = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(_) => return false,
    };

    if !metadata.is_dir() {
        return file_has_detritus(path);
    }

    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(_) => continue,
            };

            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() && file_has_detritus(&entry.path()) {
                return true;
            }
        }
    }

    false
}

#[cfg(target_os = "macos")]
fn resource_fork_len(path: &Path) -> u64 {
    std::fs::metadata(path.join("..namedfork").join("rsrc"))
        .map(|m| m.len())
        .unwrap_or(0)
}

#[cfg(not(target_os = "macos"))]
fn resource_fork_len(_path: &Path) -> u64 {
    0
}

/// Inspects filesystem entries and decides whether they are code items.
pub struct Classifier<'a> {
    inspector: &'a dyn SignatureInspector,
    identity: &'a SigningIdentity,
}

impl<'a> Classifier<'a> {
    pub fn new(inspector: &'a dyn SignatureInspector, identity: &'a SigningIdentity) -> Self {
        Self {
            inspector,
            identity,
        }
    }

    /// Classify an existing path.
    ///
    /// `is_root` selects [CodeItemKind::MainExecutable] for bare executables
    /// given as the signing root. Returns `Ok(None)` for entries that are not
    /// code items.
    pub fn classify(
        &self,
        path: &Path,
        is_root: bool,
    ) -> Result<Option<Classification>, InspectionError> {
        let kind = match Candidate::from_path(path)? {
            Candidate::Bundle => match bundle_kind(path)? {
                Some(kind) => kind,
                None => return Ok(None),
            },
            Candidate::Executable if is_root => CodeItemKind::MainExecutable,
            Candidate::Executable => CodeItemKind::LoadableExecutable,
            Candidate::Other => return Ok(None),
        };

        let info = self.inspector.inspect(path)?;

        let entitlements = match info.entitlements {
            Some(blob) if !blob.iter().all(|b| b.is_ascii_whitespace()) => {
                Some(Entitlements::from_blob(blob)?)
            }
            _ => None,
        };

        let signer = if info.adhoc {
            None
        } else {
            info.authorities.first().cloned()
        };

        let current_signature = self.signature_state(&info.status, info.adhoc, signer.as_deref());

        debug!(
            "classified {} as {} with signature state {:?}",
            path.display(),
            kind,
            current_signature
        );

        Ok(Some(Classification {
            kind,
            current_signature,
            requirement_strictness: RequirementStrictness::from_requirement(
                info.designated_requirement.as_deref(),
            ),
            signer,
            designated_requirement: info.designated_requirement,
            has_resource_envelope: info.has_resource_envelope,
            has_detritus: has_detritus(path),
            entitlements,
        }))
    }

    fn signature_state(
        &self,
        status: &SignatureStatus,
        adhoc: bool,
        signer: Option<&str>,
    ) -> SignatureState {
        match status {
            SignatureStatus::Unsigned => SignatureState::Absent,
            SignatureStatus::Invalid(_) => SignatureState::Invalid,
            SignatureStatus::Valid if adhoc => {
                if self.identity.is_adhoc() {
                    SignatureState::ValidMatchesTarget
                } else {
                    SignatureState::AdHoc
                }
            }
            SignatureStatus::Valid => {
                if self.identity.matches_signer(signer) {
                    SignatureState::ValidMatchesTarget
                } else {
                    SignatureState::ValidOtherIdentity
                }
            }
        }
    }
}


#[cfg(test)]
mod test {
    use {
        super::{testutil::*, *},
        crate::testutil::*,
        std::fs::create_dir_all,
    };

    #[test]
    fn candidates() -> std::io::Result<()> {
        let (_temp, td) = temp_dir()?;

        let bundle = td.join("Foo.app");
        create_dir_all(&bundle)?;
        let plain = td.join("Resources");
        create_dir_all(&plain)?;
        let exe = td.join("tool");
        write_executable(&exe)?;
        let data = td.join("data.txt");
        std::fs::write(&data, b"data")?;

        assert_eq!(Candidate::from_path(&bundle)?, Candidate::Bundle);
        assert_eq!(Candidate::from_path(&plain)?, Candidate::Other);
        assert_eq!(Candidate::from_path(&exe)?, Candidate::Executable);
        assert_eq!(Candidate::from_path(&data)?, Candidate::Other);

        Ok(())
    }

    #[test]
    fn bundle_kinds() -> Result<(), Box<dyn std::error::Error>> {
        let (_temp, td) = temp_dir()?;

        let app = td.join("Foo.app");
        write_info_plist(&app.join("Contents"), "APPL", Some("Foo"))?;
        assert_eq!(bundle_kind(&app)?, Some(CodeItemKind::ApplicationBundle));

        let framework = td.join("Bar.framework");
        write_info_plist(
            &framework.join("Versions").join("A").join("Resources"),
            "FMWK",
            None,
        )?;
        assert_eq!(bundle_kind(&framework)?, Some(CodeItemKind::Framework));

        let xpc = td.join("Service.xpc");
        write_info_plist(&xpc.join("Contents"), "XPC!", None)?;
        assert_eq!(bundle_kind(&xpc)?, Some(CodeItemKind::PluginBundle));

        // Known extension without Info.plist is still a code bundle.
        let naked = td.join("Naked.framework");
        create_dir_all(&naked)?;
        assert_eq!(bundle_kind(&naked)?, Some(CodeItemKind::Framework));

        // Unknown extension without Info.plist is not.
        let lproj = td.join("en.lproj");
        create_dir_all(&lproj)?;
        assert_eq!(bundle_kind(&lproj)?, None);

        let dsym = td.join("Foo.app.dSYM");
        write_info_plist(&dsym.join("Contents"), "dSYM", None)?;
        assert_eq!(bundle_kind(&dsym)?, None);

        let broken = td.join("Broken.app");
        create_dir_all(broken.join("Contents"))?;
        std::fs::write(broken.join("Contents").join("Info.plist"), b"not a plist")?;
        assert!(matches!(
            bundle_kind(&broken),
            Err(InspectionError::MalformedInfoPlist { .. })
        ));

        Ok(())
    }

    #[test]
    fn executable_names() -> Result<(), Box<dyn std::error::Error>> {
        let (_temp, td) = temp_dir()?;

        let app = td.join("Foo.app");
        let contents = app.join("Contents");
        write_info_plist(&contents, "APPL", Some("RealName"))?;
        assert_eq!(
            main_executable_name(&contents, &app),
            Some("RealName".to_string())
        );

        let framework = td.join("Bar.framework");
        let version = framework.join("Versions").join("A");
        create_dir_all(&version)?;
        assert_eq!(
            main_executable_name(&version, &framework),
            Some("Bar".to_string())
        );

        Ok(())
    }

    #[test]
    fn classify_signature_states() -> Result<(), Box<dyn std::error::Error>> {
        let (_temp, td) = temp_dir()?;
        let exe = td.join("libfoo.dylib");
        write_executable(&exe)?;

        let inspector = FakeInspector::default();
        let adhoc = SigningIdentity::AdHoc;
        let named = SigningIdentity::Named("Developer ID Application: Foo".into());

        // Unsigned.
        let c = Classifier::new(&inspector, &adhoc)
            .classify(&exe, false)?
            .unwrap();
        assert_eq!(c.kind, CodeItemKind::LoadableExecutable);
        assert_eq!(c.current_signature, SignatureState::Absent);

        // Root executables are main executables.
        let c = Classifier::new(&inspector, &adhoc)
            .classify(&exe, true)?
            .unwrap();
        assert_eq!(c.kind, CodeItemKind::MainExecutable);

        // Valid ad-hoc signature.
        inspector.set(&exe, valid_signature(None));
        let c = Classifier::new(&inspector, &adhoc)
            .classify(&exe, false)?
            .unwrap();
        assert_eq!(c.current_signature, SignatureState::ValidMatchesTarget);
        let c = Classifier::new(&inspector, &named)
            .classify(&exe, false)?
            .unwrap();
        assert_eq!(c.current_signature, SignatureState::AdHoc);

        // Valid named signature.
        inspector.set(
            &exe,
            valid_signature(Some("Developer ID Application: Foo (ABCDE12345)")),
        );
        let c = Classifier::new(&inspector, &named)
            .classify(&exe, false)?
            .unwrap();
        assert_eq!(c.current_signature, SignatureState::ValidMatchesTarget);
        assert_eq!(
            c.signer.as_deref(),
            Some("Developer ID Application: Foo (ABCDE12345)")
        );
        let c = Classifier::new(&inspector, &adhoc)
            .classify(&exe, false)?
            .unwrap();
        assert_eq!(c.current_signature, SignatureState::ValidOtherIdentity);

        // Broken signature.
        let mut info = valid_signature(None);
        info.status = SignatureStatus::Invalid("invalid signature (code or signature have been modified)".into());
        inspector.set(&exe, info);
        let c = Classifier::new(&inspector, &adhoc)
            .classify(&exe, false)?
            .unwrap();
        assert_eq!(c.current_signature, SignatureState::Invalid);

        Ok(())
    }

    #[test]
    fn classify_non_code() -> Result<(), Box<dyn std::error::Error>> {
        let (_temp, td) = temp_dir()?;
        let data = td.join("Info.plist");
        std::fs::write(&data, b"<plist/>")?;

        let inspector = FakeInspector::default();
        let identity = SigningIdentity::AdHoc;

        assert_eq!(
            Classifier::new(&inspector, &identity).classify(&data, false)?,
            None
        );

        Ok(())
    }

    #[test]
    fn detritus() -> Result<(), Box<dyn std::error::Error>> {
        let (_temp, td) = temp_dir()?;
        let app = td.join("Foo.app");
        let macos = app.join("Contents").join("MacOS");
        create_dir_all(&macos)?;
        write_executable(&macos.join("Foo"))?;

        assert!(!has_detritus(&app));

        std::fs::write(macos.join("._Foo"), b"apple double")?;
        assert!(has_detritus(&app));

        Ok(())
    }
}
