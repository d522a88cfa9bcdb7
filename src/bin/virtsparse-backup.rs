use std::path::PathBuf;

use anyhow::{bail, Error};
use clap::Parser;
use log::error;

use virtsparse::backup::{self, BackupOptions};
use virtsparse::host::qemu::QemuHost;
use virtsparse::host::virsh::VirshControl;
use virtsparse::host::HostControl;
use virtsparse::tools::signals;
use virtsparse::{Level, StreamType};

#[derive(Parser)]
#[command(
    name = "virtsparse-backup",
    about = "Backup libvirt/QEMU disks into sparse streams over NBD",
    version
)]
struct Args {
    /// Domain to backup.
    #[arg(short, long)]
    domain: String,

    /// Target directory, or '-' (unsupported, see --help).
    #[arg(short, long)]
    output: String,

    /// Backup level: copy, full, inc or diff.
    #[arg(short, long, default_value = "copy")]
    level: String,

    /// Output format: stream or raw.
    #[arg(short = 't', long = "type", default_value = "stream")]
    backup_type: String,

    /// Only backup these disks (comma separated target names).
    #[arg(short, long)]
    include: Option<String>,

    /// Skip these disks (comma separated target names).
    #[arg(short = 'x', long)]
    exclude: Option<String>,

    /// Compress data blocks with lz4.
    #[arg(long)]
    compress: bool,

    /// Worker threads, default one per disk.
    #[arg(short, long)]
    worker: Option<usize>,

    /// Include raw format disks (full and copy only).
    #[arg(long)]
    raw: bool,

    /// Domain is shut off: export disks with qemu-nbd directly.
    #[arg(long)]
    qemu: bool,

    /// NBD unix socket used by the backup job.
    #[arg(short = 'a', long)]
    socketfile: Option<PathBuf>,

    /// Scratch directory for job state files.
    #[arg(long, default_value = "/var/tmp")]
    scratchdir: PathBuf,

    /// Exit with code 2 when warnings occurred.
    #[arg(long)]
    strict: bool,

    /// Start the backup job and exit, leaving the exports running.
    #[arg(long)]
    startonly: bool,

    /// Stop an active backup job and exit.
    #[arg(long)]
    killonly: bool,

    /// Show the disk list and exit without backing up.
    #[arg(long)]
    printonly: bool,
}

fn split_list(raw: &Option<String>) -> Vec<String> {
    raw.as_deref()
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn run(args: Args) -> Result<i32, Error> {
    signals::register()?;

    if args.output == "-" {
        // zip streaming to stdout is handled by external tooling
        bail!("writing to stdout is not supported, specify a target directory");
    }

    let level: Level = args.level.parse()?;
    let stream_type: StreamType = args.backup_type.parse()?;

    std::fs::create_dir_all(&args.scratchdir)?;
    let socketfile = args
        .socketfile
        .unwrap_or_else(|| args.scratchdir.join(format!("virtsparse.{}.sock", args.domain)));

    let opts = BackupOptions {
        domain: args.domain.clone(),
        output: PathBuf::from(&args.output),
        level,
        stream_type,
        include: split_list(&args.include),
        exclude: split_list(&args.exclude),
        compress: args.compress,
        worker: args.worker,
        backup_raw_disks: args.raw,
        socketfile,
        scratchdir: args.scratchdir.clone(),
        strict: args.strict,
        start_only: args.startonly,
        kill_only: args.killonly,
        print_only: args.printonly,
    };

    let mut host: Box<dyn HostControl> = if args.qemu {
        Box::new(QemuHost::new(&args.domain, &args.scratchdir))
    } else {
        Box::new(VirshControl::new(&args.domain, &args.scratchdir))
    };

    backup::run(host.as_mut(), &opts)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let code = match run(args) {
        Ok(code) => code,
        Err(err) => {
            error!("{:#}", err);
            1
        }
    };
    std::process::exit(code);
}
