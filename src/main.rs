// src/main.rs

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Result};
use clap::{ArgAction, ArgGroup, Parser, Subcommand};
use pkgutils::engine::{shield_signals, Engine};
use pkgutils::lock::DbLock;
use pkgutils::{archive, check, footprint, rules, Error};
use regex::Regex;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pkg")]
#[command(version, propagate_version = true)]
#[command(about = "Install, remove and query software packages", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install or upgrade a package archive
    Install {
        /// Alternate root directory
        #[arg(short = 'r', long = "root", default_value = "")]
        root: String,
        /// Alternate rule configuration file
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Upgrade the package with the same name
        #[arg(short = 'u', long = "upgrade")]
        upgrade: bool,
        /// Force install, overwrite conflicting files
        #[arg(short = 'f', long = "force")]
        force: bool,
        /// Explain what is being done
        #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
        verbose: u8,
        /// Package archive
        package: PathBuf,
    },
    /// Remove an installed package
    Remove {
        /// Alternate root directory
        #[arg(short = 'r', long = "root", default_value = "")]
        root: String,
        /// Explain what is being done
        #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
        verbose: u8,
        /// Package name
        package: String,
    },
    /// Display package information
    #[command(group(ArgGroup::new("mode").required(true).args(["footprint", "installed", "list", "owner"])))]
    Query {
        /// Alternate root directory
        #[arg(short = 'r', long = "root", default_value = "")]
        root: String,
        /// Print a package archive's footprint
        #[arg(short = 'f', long = "footprint", value_name = "ARCHIVE")]
        footprint: Option<PathBuf>,
        /// List installed packages and their versions
        #[arg(short = 'i', long = "installed")]
        installed: bool,
        /// List files owned by an installed package or contained in an archive
        #[arg(short = 'l', long = "list", value_name = "PKG|FILE")]
        list: Option<String>,
        /// List packages owning files matching a pattern
        #[arg(short = 'o', long = "owner", value_name = "PATTERN")]
        owner: Option<String>,
    },
    /// Check package integrity
    #[command(group(ArgGroup::new("mode").required(true).args(["links", "disappeared", "audit"])))]
    Check {
        /// Alternate root directory
        #[arg(short = 'r', long = "root", default_value = "")]
        root: String,
        /// Check symlinks
        #[arg(short = 'l', long = "links")]
        links: bool,
        /// Check for disappeared files
        #[arg(short = 'd', long = "disappeared")]
        disappeared: bool,
        /// Run all checks
        #[arg(short = 'a', long = "audit")]
        audit: bool,
        /// Increase verbosity
        #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
        verbose: u8,
        /// Package names (all installed packages when omitted)
        packages: Vec<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let verbosity = match &cli.command {
        Commands::Install { verbose, .. }
        | Commands::Remove { verbose, .. }
        | Commands::Check { verbose, .. } => *verbose,
        Commands::Query { .. } => 0,
    };
    init_tracing(verbosity);

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("pkg: error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbosity: u8) {
    let default = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Install {
            root,
            config,
            upgrade,
            force,
            package,
            ..
        } => {
            require_root("install/upgrade")?;
            shield_signals();

            let _lock = DbLock::exclusive(&root)?;
            let mut engine = Engine::open(&root)?;
            let config_rules = rules::read_config(&root, config.as_deref())?;

            engine.install(&package, &config_rules, upgrade, force)?;
            Ok(())
        }
        Commands::Remove { root, package, .. } => {
            require_root("remove")?;
            shield_signals();

            let _lock = DbLock::exclusive(&root)?;
            let mut engine = Engine::open(&root)?;

            engine.remove(&package)?;
            Ok(())
        }
        Commands::Query {
            root,
            footprint: footprint_arg,
            installed,
            list,
            owner,
        } => {
            // The footprint never touches the database.
            if let Some(archive_path) = footprint_arg {
                let stdout = io::stdout();
                footprint::footprint(&archive_path, &mut stdout.lock())?;
                return Ok(());
            }

            let _lock = DbLock::shared(&root)?;
            let engine = Engine::open(&root)?;

            if installed {
                let stdout = io::stdout();
                let mut out = stdout.lock();
                for (name, meta) in engine.packages() {
                    writeln!(out, "{} {}", name, meta.version)?;
                }
            } else if let Some(arg) = list {
                list_files(&engine, &arg)?;
            } else if let Some(pattern) = owner {
                list_owners(&engine, &pattern)?;
            }
            Ok(())
        }
        Commands::Check {
            root,
            links,
            disappeared,
            audit,
            verbose,
            packages,
        } => {
            let _lock = DbLock::shared(&root)?;
            let engine = Engine::open(&root)?;

            let names: Vec<String> = if packages.is_empty() {
                engine.packages().keys().cloned().collect()
            } else {
                packages
            };

            for name in &names {
                if !engine.is_installed(name) {
                    eprintln!("pkg: package not found: {}", name);
                    continue;
                }
                if links || audit {
                    report_links(&engine, name, verbose);
                }
                if disappeared || audit {
                    report_disappeared(&engine, name, verbose);
                }
            }
            Ok(())
        }
    }
}

fn require_root(action: &'static str) -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        return Err(Error::PermissionDenied(action).into());
    }
    Ok(())
}

/// List the files of an installed package, or of a package archive
/// when no package by that name is installed.
fn list_files(engine: &Engine, arg: &str) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();

    if let Some(files) = engine.files_of(arg) {
        for file in files {
            writeln!(out, "{}", file)?;
        }
    } else if Path::new(arg).exists() {
        let (_, info) = archive::open_pkg(Path::new(arg))?;
        for file in &info.files {
            writeln!(out, "{}", file)?;
        }
    } else {
        bail!("{} is neither an installed package nor a package file", arg);
    }
    Ok(())
}

fn list_owners(engine: &Engine, pattern: &str) -> Result<()> {
    let Ok(regex) = Regex::new(pattern) else {
        bail!("failed to compile regular expression '{}', aborting", pattern);
    };

    let mut rows = vec![("Package".to_string(), "File".to_string())];
    let mut width = rows[0].0.len();
    for (name, meta) in engine.packages() {
        for file in &meta.files {
            if regex.is_match(&format!("/{}", file)) {
                width = width.max(name.len());
                rows.push((name.clone(), file.clone()));
            }
        }
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    if rows.len() > 1 {
        for (package, file) in &rows {
            writeln!(out, "{:<pad$}{}", package, file, pad = width + 2)?;
        }
    } else {
        writeln!(out, "pkg: no owner(s) found")?;
    }
    Ok(())
}

fn report_links(engine: &Engine, name: &str, verbose: u8) {
    println!("Symlink check for {}...", name);
    for finding in check::check_links(engine, name) {
        match finding.kind {
            check::LinkKind::Broken => {
                println!("ERROR: {} -> {} (broken)", finding.path, finding.target);
            }
            check::LinkKind::Foreign {
                immediate_owners,
                resolved_owners,
            } => {
                if verbose > 0 {
                    println!(
                        "WARNING: {} -> {} (points to {}, resolves into {})",
                        finding.path,
                        finding.target,
                        check::join_owners(&immediate_owners),
                        check::join_owners(&resolved_owners),
                    );
                } else {
                    println!("WARNING: {} -> {}", finding.path, finding.target);
                }
            }
        }
    }
}

fn report_disappeared(engine: &Engine, name: &str, verbose: u8) {
    println!("Disappeared file check for {}...", name);
    for finding in check::check_disappeared(engine, name) {
        println!("ERROR: disappeared file {}", finding.path);
        if verbose > 0 && !finding.claimed_by.is_empty() {
            println!("  Claimed by: {}", check::join_owners(&finding.claimed_by));
        }
    }
}
