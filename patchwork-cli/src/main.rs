use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use patchwork_core::{run, HostVersion, MethodBody, RunReport, RunSettings};

#[derive(Debug, Parser)]
#[command(name = "patchwork", version, about = "Apply mod patches to a host image")]
struct Args {
    /// Host image (JSON) describing version, capabilities and method bodies.
    #[arg(long)]
    host: PathBuf,

    /// Directory scanned recursively for module manifests.
    #[arg(long)]
    mods: PathBuf,

    #[arg(long)]
    config: Option<PathBuf>,

    /// Pretend the host runs this version.
    #[arg(long, value_name = "X.Y.Z")]
    host_version: Option<HostVersion>,

    /// Assume a capability is present. Repeatable.
    #[arg(long = "capability", value_name = "NAME")]
    capabilities: Vec<String>,

    /// Print every patched method body after installation.
    #[arg(long, default_value_t = false)]
    dump_bodies: bool,

    #[arg(long, default_value_t = false)]
    debug: bool,
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn dump_bodies(report: &RunReport) {
    for info in report.host.methods() {
        let Some(raw) = report.host.installed_body(&info.signature) else {
            continue;
        };
        println!("{}:", info.signature);
        match MethodBody::from_raw(info.signature.clone(), raw) {
            Ok(body) => {
                for (index, instr) in body.instructions().iter().enumerate() {
                    println!("  {:>4}  {}", index, instr);
                }
            }
            Err(e) => println!("  <unreadable body: {}>", e),
        }
    }
}

fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    let settings = RunSettings {
        host_image: args.host,
        mods_dir: args.mods,
        config_path: args.config,
        host_version: args.host_version,
        capabilities: args.capabilities.into_iter().collect(),
    };

    let report = match run(settings) {
        Ok(report) => report,
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    };

    report.session.for_each_outcome(|outcome| {
        if outcome.is_applied() || outcome.is_reportable() {
            println!("{}", outcome);
        }
    });
    println!("{}", report.session.summary());

    if args.dump_bodies {
        dump_bodies(&report);
    }

    if report.has_failures() {
        std::process::exit(1);
    }
}
