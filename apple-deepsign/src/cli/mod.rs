// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod config;

use {
    crate::{
        cli::config::{Config, ConfigBuilder, SignConfig},
        deep_signer::{DeepSigner, PreparedRoot},
        error::DeepSignError,
        policy::SigningPlan,
        signing_settings::{SigningIdentity, SigningSettings},
        walker::{validate_root, InspectionFailure, WalkResult},
    },
    clap::{ArgAction, Args, Parser, Subcommand},
    log::LevelFilter,
    serde::Serialize,
    std::{
        path::{Path, PathBuf},
        str::FromStr,
    },
};

/// Holds state to pass to CLI commands.
pub struct Context {
    pub config: Config,
}

pub trait CliCommand {
    /// Obtain the current command arguments normalized to a [Config] instance.
    fn as_config(&self) -> Result<Option<Config>, DeepSignError> {
        Ok(None)
    }

    /// Runs the command.
    fn run(&self, context: &Context) -> Result<(), DeepSignError>;
}

#[derive(Args, Clone)]
struct SigningTarget {
    /// Identity to sign with, or `-` for ad-hoc signing
    ///
    /// Named identities are matched against existing signatures by
    /// certificate common name.
    identity: String,

    /// Bundles or executables to process
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

impl SigningTarget {
    /// Resolve settings, failing on any usage error before traversal begins.
    fn settings(&self, config: &SignConfig) -> Result<SigningSettings, DeepSignError> {
        let identity = SigningIdentity::from_str(&self.identity)?;

        for path in &self.paths {
            validate_root(path)?;
        }

        let mut settings = SigningSettings::new(identity);
        config.apply_to_settings(&mut settings)?;

        Ok(settings)
    }
}

#[derive(Serialize)]
struct PlanView<'a> {
    root: &'a Path,
    plan: &'a SigningPlan,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    inspection_failures: &'a [InspectionFailure],
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    excluded: &'a [String],
}

impl<'a> From<&'a PreparedRoot> for PlanView<'a> {
    fn from(prepared: &'a PreparedRoot) -> Self {
        Self {
            root: &prepared.root,
            plan: &prepared.plan,
            inspection_failures: &prepared.walk.inspection_failures,
            excluded: &prepared.walk.excluded,
        }
    }
}

fn print_plan_text(prepared: &PreparedRoot) {
    println!(
        "{}: {} code items, {} to sign",
        prepared.root.display(),
        prepared.plan.len(),
        prepared.plan.write_count()
    );
    print!("{}", prepared.plan);

    for failure in &prepared.walk.inspection_failures {
        println!(
            "{:<30} {}: {}",
            "inspection-failed", failure.relative_path, failure.error
        );
    }
    for excluded in &prepared.walk.excluded {
        println!("{:<30} {}", "excluded", excluded);
    }
}

#[derive(Args)]
struct Sign {
    #[command(flatten)]
    target: SigningTarget,

    /// Re-sign items even if they already carry a valid signature for the identity
    #[arg(long)]
    force: bool,

    /// Also pass --deep to the signing tool
    #[arg(long)]
    deep: bool,

    /// Print the signing plan without signing anything
    #[arg(long)]
    dry_run: bool,

    /// Output format for the plan and report
    #[arg(long, value_parser = ["text", "yaml"], default_value = "text")]
    format: String,

    /// Glob of root-relative paths to exclude from signing
    #[arg(long, value_name = "GLOB")]
    exclude: Vec<String>,

    /// Glob of root-relative paths whose existing entitlements are dropped
    #[arg(long, value_name = "GLOB")]
    strip_entitlements: Vec<String>,

    /// Signature metadata to preserve when re-signing
    #[arg(long, value_delimiter = ',')]
    preserve_metadata: Vec<String>,

    /// Refuse to replace certificate-chain requirements with ad-hoc signatures
    #[arg(long)]
    no_requirement_downgrade: bool,

    /// Request a secure timestamp
    #[arg(long, conflicts_with = "no_timestamp")]
    timestamp: bool,

    /// Do not request a secure timestamp
    #[arg(long)]
    no_timestamp: bool,

    /// Path to the codesign executable
    #[arg(long, value_name = "PATH")]
    codesign_path: Option<PathBuf>,
}

impl CliCommand for Sign {
    fn as_config(&self) -> Result<Option<Config>, DeepSignError> {
        Ok(Some(Config {
            sign: SignConfig {
                force: self.force.then_some(true),
                deep: self.deep.then_some(true),
                dry_run: self.dry_run.then_some(true),
                allow_requirement_downgrade: self.no_requirement_downgrade.then_some(false),
                exclude: self.exclude.clone(),
                strip_entitlements: self.strip_entitlements.clone(),
                preserve_metadata: self.preserve_metadata.clone(),
                timestamp: if self.timestamp {
                    Some(true)
                } else if self.no_timestamp {
                    Some(false)
                } else {
                    None
                },
                codesign_path: self.codesign_path.clone(),
            },
        }))
    }

    fn run(&self, context: &Context) -> Result<(), DeepSignError> {
        let sign_config = &context.config.sign;
        let settings = self.target.settings(sign_config)?;
        let tool = sign_config.codesign_tool();
        let signer = DeepSigner::new(&settings, &tool, &tool);
        let yaml = self.format == "yaml";

        if sign_config.dry_run.unwrap_or(false) {
            for path in &self.target.paths {
                let prepared = signer.prepare(path)?;

                if yaml {
                    print!("{}", serde_yaml::to_string(&PlanView::from(&prepared))?);
                } else {
                    print_plan_text(&prepared);
                }
            }

            return Ok(());
        }

        let mut incomplete = 0;

        for path in &self.target.paths {
            let report = signer.sign(path)?;

            if yaml {
                print!("{}", serde_yaml::to_string(&report)?);
            } else {
                print!("{}", report);
            }

            if !report.is_fully_signed() {
                incomplete += 1;
            }
        }

        if incomplete > 0 {
            Err(DeepSignError::SigningIncomplete {
                incomplete,
                total: self.target.paths.len(),
            })
        } else {
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct InspectView<'a> {
    root: &'a Path,
    #[serde(flatten)]
    walk: &'a WalkResult,
}

#[derive(Args)]
struct Inspect {
    #[command(flatten)]
    target: SigningTarget,
}

impl CliCommand for Inspect {
    fn run(&self, context: &Context) -> Result<(), DeepSignError> {
        let sign_config = &context.config.sign;
        let settings = self.target.settings(sign_config)?;
        let tool = sign_config.codesign_tool();
        let signer = DeepSigner::new(&settings, &tool, &tool);

        for path in &self.target.paths {
            let walk = signer.discover(path)?;

            print!(
                "{}",
                serde_yaml::to_string(&InspectView { root: path, walk: &walk })?
            );
        }

        Ok(())
    }
}

#[derive(Subcommand)]
enum Subcommands {
    /// Sign a bundle and every code component nested inside it
    ///
    /// Nested components are signed before the bundles containing them.
    /// Components already validly signed by the requested identity are left
    /// untouched unless --force is given.
    Sign(Sign),

    /// Print the code components discovered inside a bundle
    ///
    /// Shows each component's kind and current signature state as YAML.
    /// Nothing is modified.
    Inspect(Inspect),
}

impl Subcommands {
    fn as_cli_command(&self) -> &dyn CliCommand {
        match self {
            Subcommands::Sign(c) => c,
            Subcommands::Inspect(c) => c,
        }
    }
}

/// Recursively sign Apple bundles and all code nested inside them
#[derive(Parser)]
#[command(author, version, arg_required_else_help = true)]
struct Cli {
    /// Explicit configuration file to load.
    ///
    /// If provided, the default configuration files are not loaded, even
    /// if they exist.
    ///
    /// Can be specified multiple times. Files are loaded/merged in the order
    /// given.
    ///
    /// The special value `/dev/null` can be used to specify an empty/null
    /// config file. It can be used to short-circuit loading of default config
    /// files.
    #[arg(short = 'C', long = "config-file", global = true)]
    config_path: Vec<PathBuf>,

    /// Configuration profile to load.
    ///
    /// If not specified, the implicit "default" profile is loaded.
    #[arg(short = 'P', long, global = true)]
    profile: Option<String>,

    /// Increase logging verbosity. Can be specified multiple times
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Subcommands,
}

impl Cli {
    pub fn config_builder(&self) -> ConfigBuilder {
        let mut config = ConfigBuilder::default();

        config = if self.config_path.is_empty() {
            config.with_user_config_file().with_cwd_config_file()
        } else {
            for path in &self.config_path {
                if path.display().to_string() == "/dev/null" {
                    break;
                }

                config = config.toml_file(path);
            }

            config
        };

        if let Some(profile) = &self.profile {
            config = config.profile(profile.to_string());
        }

        // Environment variables override everything.
        config = config.with_env_prefix();

        config
    }
}

pub fn main_impl() -> Result<(), DeepSignError> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    // Disable log context except at higher log levels.
    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
    }

    builder.init();

    let mut config_builder = cli.config_builder();

    let command = cli.command.as_cli_command();

    if let Some(config) = command.as_config()? {
        config_builder = config_builder.with_config_struct(config);
    }

    let config = config_builder.config()?;

    let context = Context { config };

    command.run(&context)
}
