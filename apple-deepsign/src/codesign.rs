// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Signing and inspection primitives backed by the `codesign` tool.

These shell out to `codesign(1)` and translate its output into
[SignatureInfo] and [SigningFailure] values. Parsing is kept in pure
functions so it can be tested without the tool being present.
*/

use {
    crate::{
        classifier::{SignatureInfo, SignatureInspector, SignatureStatus},
        error::{FailureKind, InspectionError, SigningFailure},
        executor::{SignParameters, SigningPrimitive},
    },
    log::debug,
    std::{
        ffi::OsString,
        io::Write,
        path::{Path, PathBuf},
        process::Output,
    },
};

const DEFAULT_PROGRAM: &str = "codesign";

/// Combined stderr and stdout of a process, in that order.
fn output_text(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stderr).to_string();
    text.push_str(&String::from_utf8_lossy(&output.stdout));
    text
}

/// Parse `codesign --display --verbose=4 -r-` output.
///
/// The returned status is always [SignatureStatus::Valid]; validity is
/// established separately by verification.
pub fn parse_display_output(text: &str) -> SignatureInfo {
    let mut info = SignatureInfo {
        status: SignatureStatus::Valid,
        ..SignatureInfo::unsigned()
    };

    for line in text.lines() {
        let line = line.trim();

        if line == "Signature=adhoc"
            || (line.starts_with("CodeDirectory ") && line.contains("(adhoc"))
        {
            info.adhoc = true;
        } else if let Some(authority) = line.strip_prefix("Authority=") {
            info.authorities.push(authority.to_string());
        } else if let Some(team) = line.strip_prefix("TeamIdentifier=") {
            if team != "not set" {
                info.team_identifier = Some(team.to_string());
            }
        } else if line.starts_with("Sealed Resources version=") {
            info.has_resource_envelope = true;
        } else if let Some(requirement) = line
            .strip_prefix("# designated => ")
            .or_else(|| line.strip_prefix("designated => "))
        {
            info.designated_requirement = Some(requirement.to_string());
        }
    }

    info
}

/// Drives the `codesign` executable.
#[derive(Clone, Debug)]
pub struct CodesignTool {
    program: PathBuf,
}

impl Default for CodesignTool {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRAM)
    }
}

impl CodesignTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn run(&self, args: Vec<OsString>) -> std::io::Result<Output> {
        debug!(
            "running {} {}",
            self.program.display(),
            args.iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );

        duct::cmd(&self.program, args)
            .stdout_capture()
            .stderr_capture()
            .unchecked()
            .run()
    }

    /// Arguments for signing `path`.
    pub fn sign_arguments(
        path: &Path,
        params: &SignParameters,
        entitlements_path: Option<&Path>,
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["--sign".into(), params.identity.clone().into()];

        if params.force {
            args.push("--force".into());
        }
        if params.deep {
            args.push("--deep".into());
        }
        if params.strip_disallowed_xattrs {
            args.push("--strip-disallowed-xattrs".into());
        }
        if let Some(p) = entitlements_path {
            args.push("--entitlements".into());
            args.push(p.as_os_str().to_os_string());
        }
        if !params.preserve_metadata.is_empty() {
            args.push(format!("--preserve-metadata={}", params.preserve_metadata.join(",")).into());
        }
        match params.timestamp {
            Some(true) => args.push("--timestamp".into()),
            Some(false) => args.push("--timestamp=none".into()),
            None => {}
        }

        args.push(path.as_os_str().to_os_string());

        args
    }
}

impl SignatureInspector for CodesignTool {
    fn inspect(&self, path: &Path) -> Result<SignatureInfo, InspectionError> {
        let spawn_error = |e: std::io::Error| {
            InspectionError::Tool(format!("unable to run {}: {}", self.program.display(), e))
        };

        let display = self
            .run(vec![
                "--display".into(),
                "--verbose=4".into(),
                "-r-".into(),
                path.as_os_str().to_os_string(),
            ])
            .map_err(spawn_error)?;
        let text = output_text(&display);

        if !display.status.success() {
            return if text.contains("not signed at all") {
                Ok(SignatureInfo::unsigned())
            } else {
                Err(InspectionError::Tool(text.trim().to_string()))
            };
        }

        let mut info = parse_display_output(&text);

        let verify = self
            .run(vec![
                "--verify".into(),
                "--strict".into(),
                path.as_os_str().to_os_string(),
            ])
            .map_err(spawn_error)?;
        if !verify.status.success() {
            info.status = SignatureStatus::Invalid(output_text(&verify).trim().to_string());
        }

        let entitlements = self
            .run(vec![
                "--display".into(),
                "--entitlements".into(),
                ":-".into(),
                path.as_os_str().to_os_string(),
            ])
            .map_err(spawn_error)?;
        if entitlements.status.success() && !entitlements.stdout.is_empty() {
            info.entitlements = Some(entitlements.stdout);
        }

        Ok(info)
    }
}

impl SigningPrimitive for CodesignTool {
    fn sign(&self, path: &Path, params: &SignParameters) -> Result<String, SigningFailure> {
        let write_failure = |e: std::io::Error| SigningFailure {
            kind: FailureKind::Other,
            diagnostic: format!("unable to write entitlements file: {}", e),
        };

        let entitlements_file = match &params.entitlements {
            Some(blob) => {
                let mut f = tempfile::Builder::new()
                    .prefix("deepsign-entitlements-")
                    .suffix(".plist")
                    .tempfile()
                    .map_err(write_failure)?;
                f.write_all(blob).map_err(write_failure)?;
                f.flush().map_err(write_failure)?;
                Some(f)
            }
            None => None,
        };

        let args = Self::sign_arguments(
            path,
            params,
            entitlements_file.as_ref().map(|f| f.path()),
        );

        let output = self.run(args).map_err(|e| SigningFailure {
            kind: FailureKind::ToolUnavailable,
            diagnostic: format!("unable to run {}: {}", self.program.display(), e),
        })?;
        let text = output_text(&output);

        if output.status.success() {
            Ok(text)
        } else {
            Err(SigningFailure::from_diagnostic(text.trim()))
        }
    }
}
