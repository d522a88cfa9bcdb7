use std::path::PathBuf;

use anyhow::Error;
use clap::Parser;
use log::error;

use virtsparse::restore::{self, Action, RestoreOptions};
use virtsparse::tools::signals;

#[derive(Parser)]
#[command(
    name = "virtsparse-restore",
    about = "Restore sparse stream backups into new disk images",
    version
)]
struct Args {
    /// dump: print stream contents; restore: rebuild the disks.
    #[arg(short, long, default_value = "restore")]
    action: String,

    /// Directory holding the backup set.
    #[arg(short, long)]
    input: PathBuf,

    /// Directory for the restored images.
    #[arg(short, long)]
    output: PathBuf,

    /// Stop the chain after this checkpoint has been applied.
    #[arg(long)]
    until: Option<String>,

    /// Explicit comma separated chain of data files, first entry must
    /// be a full or copy backup.
    #[arg(long)]
    sequence: Option<String>,

    /// Restore only this disk (target name).
    #[arg(short, long)]
    disk: Option<String>,

    /// NBD unix socket for the destination writer.
    #[arg(long)]
    socketfile: Option<PathBuf>,

    /// Force raw destination images.
    #[arg(long)]
    raw: bool,
}

fn run(args: Args) -> Result<(), Error> {
    signals::register()?;

    let action: Action = args.action.parse()?;
    let socketfile = args
        .socketfile
        .unwrap_or_else(|| std::env::temp_dir().join("virtsparse.restore.sock"));

    let sequence = args
        .sequence
        .as_deref()
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    let opts = RestoreOptions {
        action,
        input: args.input,
        output: args.output,
        until: args.until,
        sequence,
        disk: args.disk,
        socketfile,
        raw: args.raw,
    };

    restore::run(&opts)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let code = match run(args) {
        Ok(()) => 0,
        Err(err) => {
            error!("{:#}", err);
            1
        }
    };
    std::process::exit(code);
}
