use std::net::TcpListener;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{format_err, Error};
use clap::Parser;
use log::{error, info, warn};

use nbd_io::NbdServer;
use virtsparse::map::MappedDisk;
use virtsparse::tools::signals;

#[derive(Parser)]
#[command(
    name = "virtsparse-map",
    about = "Map an uncompressed full or copy backup as a read-only block device",
    version
)]
struct Args {
    /// Backup file to map.
    #[arg(short, long)]
    file: PathBuf,

    /// Attach the export to this NBD device node (spawns nbd-client).
    #[arg(short, long)]
    device: Option<PathBuf>,

    /// Maximum request size advertised to clients. Kept at or below
    /// the smallest block of the stream.
    #[arg(short, long, default_value_t = 4096)]
    blocksize: u32,

    /// Export name.
    #[arg(short, long, default_value = "sda")]
    export_name: String,

    /// Handler threads serving client connections.
    #[arg(short, long, default_value_t = 4)]
    threads: usize,

    /// Listen address.
    #[arg(short, long, default_value = "127.0.0.1")]
    listen_address: String,

    /// Listen port.
    #[arg(short, long, default_value_t = 10809)]
    port: u16,
}

fn attach_device(args: &Args, device: &PathBuf) -> Result<(), Error> {
    let status = Command::new("nbd-client")
        .arg(&args.listen_address)
        .arg(args.port.to_string())
        .arg(device)
        .arg("-N")
        .arg(&args.export_name)
        .arg("-b")
        .arg(args.blocksize.to_string())
        .status()
        .map_err(|err| format_err!("unable to run nbd-client - {}", err))?;
    if !status.success() {
        return Err(format_err!("nbd-client failed with {}", status));
    }
    info!("backup mapped to {:?}", device);
    Ok(())
}

fn detach_device(device: &PathBuf) {
    match Command::new("nbd-client").arg("-d").arg(device).status() {
        Ok(status) if status.success() => info!("{:?} disconnected", device),
        Ok(status) => warn!("nbd-client -d failed with {}", status),
        Err(err) => warn!("unable to run nbd-client -d: {}", err),
    }
}

fn run(args: Args) -> Result<(), Error> {
    signals::register()?;

    let disk = MappedDisk::open(&args.file, &args.export_name, args.blocksize)?;
    info!(
        "serving '{}' from {:?} on {}:{}",
        args.export_name,
        disk.path(),
        args.listen_address,
        args.port
    );

    let listener = TcpListener::bind((args.listen_address.as_str(), args.port))?;
    let server = NbdServer::new(disk, args.threads);

    let device = args.device.clone();
    let serve = std::thread::spawn(move || server.serve(listener, signals::flag()));

    if let Some(device) = &device {
        // give the accept loop a moment before attaching
        std::thread::sleep(Duration::from_millis(500));
        if let Err(err) = attach_device(&args, device) {
            signals::cancel();
            let _ = serve.join();
            return Err(err);
        }
    }

    while !signals::cancelled() {
        std::thread::sleep(Duration::from_millis(200));
    }

    if let Some(device) = &device {
        detach_device(device);
    }

    serve
        .join()
        .map_err(|_| format_err!("server thread panicked"))??;
    Ok(())
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
