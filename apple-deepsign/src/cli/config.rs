// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::{codesign::CodesignTool, error::DeepSignError, signing_settings::SigningSettings},
    figment::{
        providers::{Env, Format, Serialized, Toml},
        Figment,
    },
    log::debug,
    serde::{Deserialize, Serialize},
    std::{
        ops::{Deref, DerefMut},
        path::{Path, PathBuf},
    },
};

/// Configuration file profile definition.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    /// Configuration for the sign and inspect commands.
    #[serde(default)]
    pub sign: SignConfig,
}

/// Configuration for the sign command.
///
/// Unset values are left out when serializing so that merging a command's
/// arguments doesn't clobber values from config files.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SignConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deep: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_requirement_downgrade: Option<bool>,

    /// Glob patterns of root-relative paths to leave alone.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,

    /// Glob patterns of root-relative paths whose entitlements are dropped.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub strip_entitlements: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preserve_metadata: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<bool>,

    /// Path to the `codesign` executable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codesign_path: Option<PathBuf>,
}

impl SignConfig {
    /// Apply config values to signing settings.
    pub fn apply_to_settings(&self, settings: &mut SigningSettings) -> Result<(), DeepSignError> {
        if let Some(v) = self.force {
            settings.set_force(v);
        }
        if let Some(v) = self.deep {
            settings.set_deep(v);
        }
        if let Some(v) = self.allow_requirement_downgrade {
            settings.set_allow_requirement_downgrade(v);
        }
        for pattern in &self.exclude {
            settings.add_path_exclusion(pattern)?;
        }
        for pattern in &self.strip_entitlements {
            settings.add_entitlements_strip(pattern)?;
        }
        for v in &self.preserve_metadata {
            settings.add_preserve_metadata(v)?;
        }
        settings.set_timestamp(self.timestamp);

        Ok(())
    }

    /// The signing and inspection primitives to use.
    pub fn codesign_tool(&self) -> CodesignTool {
        match &self.codesign_path {
            Some(path) => CodesignTool::new(path),
            None => CodesignTool::default(),
        }
    }
}

/// Used to instantiate [Config] instances.
#[derive(Clone)]
pub struct ConfigBuilder {
    loader: Figment,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            loader: Figment::new(),
        }
    }
}

impl Deref for ConfigBuilder {
    type Target = Figment;

    fn deref(&self) -> &Self::Target {
        &self.loader
    }
}

impl DerefMut for ConfigBuilder {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.loader
    }
}

impl ConfigBuilder {
    /// Add the $XDG_CONFIG/deepsign/deepsign.toml user config file if it exists.
    pub fn with_user_config_file(mut self) -> Self {
        if let Some(base) = dirs::config_dir() {
            let p = base.join("deepsign").join("deepsign.toml");
            debug!("registering user config file: {}", p.display());

            self.loader = self.loader.merge(Toml::file(p).nested());
        }

        self
    }

    /// Merge a config file from `pwd`/deepsign.toml.
    pub fn with_cwd_config_file(mut self) -> Self {
        if let Ok(cwd) = std::env::current_dir() {
            let p = cwd.join("deepsign.toml");
            debug!("registering cwd config file: {}", p.display());

            self.loader = self.loader.merge(Toml::file(p).nested());
        }

        self
    }

    /// Merge with environment variables.
    ///
    /// Must be called after [Self::profile()] so environment variables map to
    /// the current profile. Nesting uses a double underscore, e.g.
    /// `DEEPSIGN_SIGN__DRY_RUN=true`.
    pub fn with_env_prefix(mut self) -> Self {
        debug!("registering DEEPSIGN_ environment variable config source");
        let env = Env::prefixed("DEEPSIGN_")
            .split("__")
            .profile(self.loader.profile().to_string());

        self.loader = self.loader.merge(env);
        self
    }

    /// Add a TOML config file to this instance.
    pub fn toml_file(mut self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        debug!("registering custom config file: {}", path.display());
        self.loader = self.loader.merge(Toml::file(path).nested());
        self
    }

    /// Add a TOML string config to this instance.
    pub fn toml_string(mut self, data: &str) -> Self {
        debug!("registering TOML string config data");
        self.loader = self.loader.merge(Toml::string(data).nested());
        self
    }

    /// Merge a [Config] struct into this builder
    pub fn with_config_struct(mut self, config: Config) -> Self {
        debug!("registering config struct");
        let serialized = Serialized::defaults(config).profile(self.loader.profile().to_string());

        self.loader = self.loader.merge(serialized);
        self
    }

    /// Load the named profile instead of the `[default]` profile.
    pub fn profile(mut self, profile: String) -> Self {
        self.loader = self.loader.select(profile);
        self
    }

    /// Obtain a config profile.
    pub fn config(self) -> Result<Config, DeepSignError> {
        Ok(self.loader.extract()?)
    }
}
