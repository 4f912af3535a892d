// build.rs

use std::env;
use std::fs;
use std::path::PathBuf;

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;

fn build_cli() -> Command {
    let root = Arg::new("root")
        .short('r')
        .long("root")
        .value_name("DIR")
        .help("Use an alternate root directory");
    let verbose = Arg::new("verbose")
        .short('v')
        .long("verbose")
        .action(ArgAction::Count)
        .help("Explain what is being done");

    Command::new("pkg")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Install, remove and query software packages")
        .subcommand(
            Command::new("install")
                .about("Install or upgrade a package archive")
                .arg(root.clone())
                .arg(
                    Arg::new("config")
                        .short('c')
                        .long("config")
                        .value_name("FILE")
                        .help("Use an alternate rule configuration file"),
                )
                .arg(
                    Arg::new("upgrade")
                        .short('u')
                        .long("upgrade")
                        .action(ArgAction::SetTrue)
                        .help("Upgrade the package with the same name"),
                )
                .arg(
                    Arg::new("force")
                        .short('f')
                        .long("force")
                        .action(ArgAction::SetTrue)
                        .help("Force install, overwrite conflicting files"),
                )
                .arg(verbose.clone())
                .arg(Arg::new("package").required(true).help("Package archive")),
        )
        .subcommand(
            Command::new("remove")
                .about("Remove an installed package")
                .arg(root.clone())
                .arg(verbose.clone())
                .arg(Arg::new("package").required(true).help("Package name")),
        )
        .subcommand(
            Command::new("query")
                .about("Display package information")
                .arg(root.clone())
                .arg(
                    Arg::new("footprint")
                        .short('f')
                        .long("footprint")
                        .value_name("ARCHIVE")
                        .help("Print a package archive's footprint"),
                )
                .arg(
                    Arg::new("installed")
                        .short('i')
                        .long("installed")
                        .action(ArgAction::SetTrue)
                        .help("List installed packages and their versions"),
                )
                .arg(
                    Arg::new("list")
                        .short('l')
                        .long("list")
                        .value_name("PKG|FILE")
                        .help("List files owned by a package or archive"),
                )
                .arg(
                    Arg::new("owner")
                        .short('o')
                        .long("owner")
                        .value_name("PATTERN")
                        .help("List packages owning files matching a pattern"),
                ),
        )
        .subcommand(
            Command::new("check")
                .about("Check package integrity")
                .arg(root)
                .arg(
                    Arg::new("links")
                        .short('l')
                        .long("links")
                        .action(ArgAction::SetTrue)
                        .help("Check symlinks"),
                )
                .arg(
                    Arg::new("disappeared")
                        .short('d')
                        .long("disappeared")
                        .action(ArgAction::SetTrue)
                        .help("Check for disappeared files"),
                )
                .arg(
                    Arg::new("audit")
                        .short('a')
                        .long("audit")
                        .action(ArgAction::SetTrue)
                        .help("Run all checks"),
                )
                .arg(verbose)
                .arg(Arg::new("packages").num_args(0..).help("Package names")),
        )
}

fn main() -> std::io::Result<()> {
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo")).join("man");
    fs::create_dir_all(&out_dir)?;

    let cli = build_cli();

    let mut page = Vec::new();
    Man::new(cli.clone()).render(&mut page)?;
    fs::write(out_dir.join("pkg.1"), &page)?;

    for sub in cli.get_subcommands() {
        let mut page = Vec::new();
        Man::new(sub.clone()).render(&mut page)?;
        fs::write(out_dir.join(format!("pkg-{}.1", sub.get_name())), &page)?;
    }

    println!("cargo:rerun-if-changed=build.rs");
    Ok(())
}
