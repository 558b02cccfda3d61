// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Filesystem fixtures shared by unit tests.

use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

/// Create a temporary directory, returning the guard and its canonical path.
pub fn temp_dir() -> std::io::Result<(tempfile::TempDir, PathBuf)> {
    let temp = tempfile::Builder::new().prefix("deepsign-").tempdir()?;
    let path = temp.path().canonicalize()?;

    Ok((temp, path))
}

/// Write a small file marked executable, creating parent directories.
pub fn write_executable(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(path, b"\xcf\xfa\xed\xfe")?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

/// Write an `Info.plist` into `dir`.
pub fn write_info_plist(
    dir: &Path,
    package_type: &str,
    executable: Option<&str>,
) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;

    let executable = executable
        .map(|e| format!("    <key>CFBundleExecutable</key>\n    <string>{}</string>\n", e))
        .unwrap_or_default();

    let data = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <plist version=\"1.0\">\n\
         <dict>\n\
         {}    <key>CFBundlePackageType</key>\n    <string>{}</string>\n\
         </dict>\n\
         </plist>\n",
        executable, package_type
    );

    std::fs::write(dir.join("Info.plist"), data)
}

/// Create a minimal application bundle with a main executable.
///
/// Returns the bundle path.
pub fn make_app(parent: &Path, name: &str) -> std::io::Result<PathBuf> {
    let app = parent.join(format!("{}.app", name));
    let contents = app.join("Contents");
    write_info_plist(&contents, "APPL", Some(name))?;
    write_executable(&contents.join("MacOS").join(name))?;

    Ok(app)
}

/// Create a versioned framework with its binary and the usual symlinks.
///
/// Returns the framework path.
pub fn make_framework(parent: &Path, name: &str) -> std::io::Result<PathBuf> {
    let framework = parent.join(format!("{}.framework", name));
    let version = framework.join("Versions").join("A");
    write_info_plist(&version.join("Resources"), "FMWK", Some(name))?;
    write_executable(&version.join(name))?;

    std::os::unix::fs::symlink("A", framework.join("Versions").join("Current"))?;
    std::os::unix::fs::symlink(
        PathBuf::from("Versions").join("Current").join(name),
        framework.join(name),
    )?;
    std::os::unix::fs::symlink(
        PathBuf::from("Versions").join("Current").join("Resources"),
        framework.join("Resources"),
    )?;

    Ok(framework)
}
