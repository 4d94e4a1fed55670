//! obsgit command-line tool.
//!
//! Exports an Open Build Service project into a git repository, imports a
//! repository back into a (possibly different) project, and writes the
//! configuration file both commands read.

mod report;
mod style;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use obsgit_core::config::{ServiceConfig, StorageConfig, StorageType};
use obsgit_core::file_policy::FilePolicy;
use obsgit_core::planner::SyncFlags;
use obsgit_core::revisions::RevisionTable;
use obsgit_core::storage::{self, lfs};
use obsgit_core::{
    BuildService, ExportOptions, Exporter, GitTree, ImportOptions, Importer, LinkPolicy,
    LinkResolver, ObsClient, ObsGitConfig, StorageBackend,
};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// Move Open Build Service projects in and out of git repositories.
#[derive(Parser, Debug)]
#[command(name = "obsgit", version, about)]
struct Cli {
    /// Path to the TOML configuration file [default: ~/.obsgit.toml].
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter (e.g. `info`, `debug`, `obsgit_core=trace`). Falls back
    /// to RUST_LOG, then `warn`.
    #[arg(long, global = true)]
    level: Option<String>,

    /// Do not verify TLS certificates of the build services.
    #[arg(long, global = true)]
    disable_verify_ssl: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a configuration file.
    CreateConfig {
        /// API root of the build service.
        #[arg(long, default_value = "https://api.opensuse.org")]
        api: String,

        #[arg(long)]
        username: String,

        /// Environment variable holding the password.
        #[arg(long, default_value = "OBS_PASSWORD")]
        password_env: String,

        /// How linked packages are exported: never, always or auto.
        #[arg(long, default_value_t = LinkPolicy::Never)]
        link: LinkPolicy,

        /// Large-file storage: lfs or obs.
        #[arg(long, default_value = "lfs", value_parser = parse_storage_type)]
        storage: StorageType,

        /// Directory holding the packages inside the repository.
        #[arg(long, default_value = "packages")]
        prefix: String,
    },

    /// Export a project into a git repository.
    Export {
        project: String,

        /// Repository directory, created when missing.
        #[arg(default_value = ".")]
        repository: PathBuf,

        /// Only write the revision of every package to FILE.
        #[arg(long, value_name = "FILE")]
        only_export_revisions: Option<PathBuf>,

        /// Fail packages whose kept link points to another project.
        #[arg(long)]
        strict_links: bool,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Import a git repository into a project.
    Import {
        /// `[REPOSITORY] PROJECT`; the repository defaults to `.`.
        #[arg(value_name = "ARGS", num_args = 1..=2, required = true)]
        targets: Vec<String>,

        /// Strip persons and groups from the project `_meta`.
        #[arg(long)]
        remove_role_project_meta: bool,

        /// Strip persons and groups from package `_meta` files.
        #[arg(long)]
        remove_role_package_meta: bool,

        /// Revision table used to fill `Release:` placeholders.
        #[arg(long, value_name = "FILE")]
        adjust_release: Option<PathBuf>,

        /// Do not prepend the git synchronization entry to `.changes` files.
        #[arg(long)]
        skip_changes_commit_hash: bool,

        #[command(flatten)]
        common: CommonArgs,
    },
}

/// Options shared by `export` and `import`.
#[derive(Args, Debug)]
struct CommonArgs {
    /// Process a single package.
    #[arg(long)]
    package: Option<String>,

    #[arg(long)]
    skip_project_meta: bool,

    /// Skip project metadata when the destination already has it.
    #[arg(long)]
    skip_all_project_meta: bool,

    #[arg(long)]
    skip_package_meta: bool,

    /// Skip package metadata when the destination already has it.
    #[arg(long)]
    skip_all_package_meta: bool,

    /// Stop starting packages after the first failure.
    #[arg(long)]
    fail_fast: bool,

    /// Packages processed concurrently [default: from the configuration].
    #[arg(short, long)]
    jobs: Option<usize>,
}

impl CommonArgs {
    fn flags(&self) -> SyncFlags {
        SyncFlags {
            skip_project_meta: self.skip_project_meta,
            skip_all_project_meta: self.skip_all_project_meta,
            skip_package_meta: self.skip_package_meta,
            skip_all_package_meta: self.skip_all_package_meta,
            only_revisions: false,
        }
    }
}

fn parse_storage_type(value: &str) -> Result<StorageType, String> {
    match value {
        "lfs" => Ok(StorageType::Lfs),
        "obs" => Ok(StorageType::Obs),
        other => Err(format!("unknown storage type '{}' (use lfs or obs)", other)),
    }
}

/// Split `[REPOSITORY] PROJECT`.
fn split_import_targets(targets: &[String]) -> Result<(PathBuf, String)> {
    match targets {
        [project] => Ok((PathBuf::from("."), project.clone())),
        [repository, project] => Ok((PathBuf::from(repository), project.clone())),
        _ => anyhow::bail!("expected [REPOSITORY] PROJECT"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.level {
        Some(ref level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", style::error(&format!("Error: {:#}", e)));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let verify_ssl = !cli.disable_verify_ssl;

    match cli.command {
        Commands::CreateConfig {
            api,
            username,
            password_env,
            link,
            storage,
            prefix,
        } => {
            let config =
                ObsGitConfig::template(&api, &username, &password_env, link, storage, &prefix);
            cmd_create_config(&config_path, &config)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Export {
            project,
            repository,
            only_export_revisions,
            strict_links,
            common,
        } => {
            let config = load_config(&config_path)?;
            cmd_export(
                &config,
                verify_ssl,
                &project,
                &repository,
                only_export_revisions,
                strict_links,
                &common,
            )
            .await
        }
        Commands::Import {
            targets,
            remove_role_project_meta,
            remove_role_package_meta,
            adjust_release,
            skip_changes_commit_hash,
            common,
        } => {
            let (repository, project) = split_import_targets(&targets)?;
            let config = load_config(&config_path)?;
            let revisions = match adjust_release {
                Some(ref path) => Some(
                    RevisionTable::load(path)
                        .with_context(|| format!("failed to read {}", path.display()))?,
                ),
                None => None,
            };
            let options = ImportOptions {
                flags: common.flags(),
                package: common.package.clone(),
                jobs: common.jobs.unwrap_or(config.run.jobs),
                fail_fast: common.fail_fast || config.run.fail_fast,
                remove_role_project_meta,
                remove_role_package_meta,
                skip_changes_commit_hash,
                revisions,
            };
            cmd_import(&config, verify_ssl, &repository, &project, options).await
        }
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn default_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("cannot determine the home directory")?;
    Ok(home.join(".obsgit.toml"))
}

fn load_config(path: &Path) -> Result<ObsGitConfig> {
    ObsGitConfig::load_and_resolve(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

fn cmd_create_config(path: &Path, config: &ObsGitConfig) -> Result<()> {
    if path.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            path.display()
        );
    }
    config.validate().context("generated configuration is invalid")?;
    config
        .write_to_file(path)
        .context("failed to write config file")?;

    println!("{}", style::success(&format!("Configuration written to {}", path.display())));
    println!();
    println!("Next steps:");
    println!(
        "  1. Set the password variable: export {}=...",
        config.export.password_env
    );
    println!("  2. Export a project: obsgit export <project> <repository>");
    Ok(())
}

fn service_client(service: &ServiceConfig, verify_ssl: bool) -> Result<Arc<dyn BuildService>> {
    let mut client = ObsClient::new(
        &service.url,
        service.username.clone(),
        service.password.clone().unwrap_or_default(),
        verify_ssl,
    )
    .with_context(|| format!("failed to create client for {}", service.url))?;
    if let Some(ref key) = service.ssh_key {
        client = client.with_ssh_key(key);
    }
    Ok(Arc::new(client))
}

async fn open_storage(
    config: &StorageConfig,
    tree: Arc<GitTree>,
    verify_ssl: bool,
) -> Result<Arc<dyn StorageBackend>> {
    let storage_obs = match config.storage_type {
        StorageType::Lfs => {
            match lfs::preflight_check() {
                Ok(version) => info!(version = %version, "git-lfs available"),
                Err(e) => warn!(
                    error = %e,
                    "git-lfs is not available; objects are still written, but the repository cannot be pushed with LFS"
                ),
            }
            None
        }
        StorageType::Obs => {
            let url = config.url.as_deref().unwrap_or_default();
            let mut client = ObsClient::new(
                url,
                config.username.clone().unwrap_or_default(),
                config.password.clone().unwrap_or_default(),
                verify_ssl,
            )
            .with_context(|| format!("failed to create storage client for {}", url))?;
            if let Some(ref key) = config.ssh_key {
                client = client.with_ssh_key(key);
            }
            Some(Arc::new(client) as Arc<dyn BuildService>)
        }
    };
    storage::from_config(config, tree, storage_obs)
        .await
        .context("failed to open large-file storage")
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

/// Storage for an export. A revisions-only run stores no file, so it never
/// contacts the configured backend and uses the tree's own LFS store.
async fn export_storage(
    config: &StorageConfig,
    tree: Arc<GitTree>,
    verify_ssl: bool,
    revisions_only: bool,
) -> Result<Arc<dyn StorageBackend>> {
    if revisions_only {
        let storage = lfs::LfsStorage::open(tree).context("failed to read .gitattributes")?;
        return Ok(Arc::new(storage));
    }
    open_storage(config, tree, verify_ssl).await
}

async fn cmd_export(
    config: &ObsGitConfig,
    verify_ssl: bool,
    project: &str,
    repository: &Path,
    revisions_out: Option<PathBuf>,
    strict_links: bool,
    common: &CommonArgs,
) -> Result<ExitCode> {
    let obs = service_client(&config.export, verify_ssl)?;
    let tree = Arc::new(GitTree::new(repository, &config.git.prefix));
    tree.ensure_repo().context("failed to prepare the repository")?;
    let storage = export_storage(
        &config.storage,
        tree.clone(),
        verify_ssl,
        revisions_out.is_some(),
    )
    .await?;
    let resolver = LinkResolver::new(
        obs.clone(),
        config.export.link,
        strict_links || config.export.strict_links,
    );

    let mut flags = common.flags();
    flags.only_revisions = revisions_out.is_some();
    let options = ExportOptions {
        flags,
        package: common.package.clone(),
        jobs: common.jobs.unwrap_or(config.run.jobs),
        fail_fast: common.fail_fast || config.run.fail_fast,
        revisions_out,
    };

    println!(
        "{}",
        style::direction(project, &repository.display().to_string())
    );
    let exporter = Exporter::new(
        obs,
        tree,
        storage,
        resolver,
        FilePolicy::from(&config.files),
        options,
    );
    let report = exporter
        .export(project)
        .await
        .with_context(|| format!("export of {} failed", project))?;

    report::print_report(&format!("Export of {}", project), &report);
    Ok(report::exit_status(report.outcome()))
}

async fn cmd_import(
    config: &ObsGitConfig,
    verify_ssl: bool,
    repository: &Path,
    project: &str,
    options: ImportOptions,
) -> Result<ExitCode> {
    let obs = service_client(&config.import, verify_ssl)?;
    let tree = Arc::new(GitTree::new(repository, &config.git.prefix));
    if !tree.exists() {
        anyhow::bail!("{} is not a git repository", repository.display());
    }
    let storage = open_storage(&config.storage, tree.clone(), verify_ssl).await?;

    println!(
        "{}",
        style::direction(&repository.display().to_string(), project)
    );
    let importer = Importer::new(obs, tree, storage, options);
    let report = importer
        .import(project)
        .await
        .with_context(|| format!("import into {} failed", project))?;

    report::print_report(&format!("Import into {}", project), &report);
    Ok(report::exit_status(report.outcome()))
}
