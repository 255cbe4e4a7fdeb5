use clap::Parser;
use log::{error, info, LevelFilter};
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mtpfs::device::raw::{detect_raw_devices, DeviceSelector};
use mtpfs::fs::MtpFs;
use mtpfs::internals::{set_debug, DebugLevel};
use mtpfs::logging;
use mtpfs::session::{MtpSession, SessionConfig};

/// Mount an MTP device (phone, camera, watch) as a FUSE filesystem.
///
/// If no device is specified the first available device is mounted.
#[derive(Debug, Parser)]
#[command(name = "mtpfs", version, about)]
struct Cli {
    /// Verbose
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Debug mode (also enables libmtp PTP/USB debug output)
    #[arg(short = 'D', long)]
    debug: bool,

    /// No logging whatsoever (not even errors)
    #[arg(short = 'N', long)]
    nolog: bool,

    /// Logging options: filename,maxsize-in-Mb,count
    /// e.g. -L logs/mtpfs.log,8,5 keeps up to 5 files of 8Mb each
    #[arg(short = 'L', long, value_name = "LOG")]
    log: Option<String>,

    /// Log level, one of DEBUG, INFO, WARNING, ERROR
    #[arg(short = 'e', long, value_name = "LOGLEVEL", default_value = "ERROR")]
    loglevel: String,

    /// List available MTP devices and exit
    #[arg(short = 'l', long)]
    list: bool,

    /// [device] mountpoint; device is a decimal index or vvvv:pppp hex
    /// vendor:product id
    #[arg(value_name = "ARGS")]
    args: Vec<String>,
}

static STOPPED: AtomicBool = AtomicBool::new(false);

extern "C" fn stop_handler(signal: libc::c_int) {
    let _ = signal;
    STOPPED.store(true, Ordering::SeqCst);
}

fn install_stop_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, stop_handler as libc::sighandler_t);
        libc::signal(libc::SIGQUIT, stop_handler as libc::sighandler_t);
        libc::signal(libc::SIGINT, stop_handler as libc::sighandler_t);
    }
}

fn list_devices() -> ExitCode {
    match detect_raw_devices() {
        Ok(devices) if devices.is_empty() => {
            eprintln!("No MTP devices connected");
            ExitCode::FAILURE
        }
        Ok(devices) => {
            for (index, device) in devices.iter().enumerate() {
                println!("{}: {}", index, device);
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("MTP error ({})", err);
            ExitCode::FAILURE
        }
    }
}

fn validate_mountpoint(mountpoint: &PathBuf) -> Result<(), String> {
    if !mountpoint.exists() {
        return Err(format!("Mount point {} does not exist", mountpoint.display()));
    }
    if !mountpoint.is_dir() {
        return Err(format!("Mount point {} is not a directory", mountpoint.display()));
    }
    match std::fs::read_dir(mountpoint) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                return Err(format!("Mount point {} is not empty", mountpoint.display()));
            }
        }
        Err(err) => return Err(format!("Cannot read mount point {}: {}", mountpoint.display(), err)),
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.debug {
        LevelFilter::Debug
    } else {
        match logging::parse_level(&cli.loglevel) {
            Ok(level) => level,
            Err(err) => {
                eprintln!("Argument error for -e (--loglevel): {}", err);
                return ExitCode::FAILURE;
            }
        }
    };

    let rotate = match cli.log.as_deref().map(logging::parse_log_spec) {
        Some(Ok(spec)) => Some(spec),
        Some(Err(err)) => {
            eprintln!("Argument error for -L (--log): {}", err);
            return ExitCode::FAILURE;
        }
        None => None,
    };

    if let Err(err) = logging::init(level, cli.nolog, rotate) {
        eprintln!("Could not configure logging: {}", err);
        return ExitCode::FAILURE;
    }

    if cli.list {
        return list_devices();
    }

    let (device_arg, mountpoint) = match cli.args.len() {
        1 => (None, PathBuf::from(&cli.args[0])),
        2 => (Some(cli.args[0].as_str()), PathBuf::from(&cli.args[1])),
        _ => {
            eprintln!("Usage: mtpfs [-vDNLel] [device] mountpoint");
            return ExitCode::FAILURE;
        }
    };

    let mountpoint = match std::fs::canonicalize(&mountpoint) {
        Ok(path) => path,
        Err(_) => mountpoint,
    };
    if let Err(err) = validate_mountpoint(&mountpoint) {
        eprintln!("{}", err);
        return ExitCode::FAILURE;
    }

    let selector = match device_arg {
        Some(arg) => match arg.parse::<DeviceSelector>() {
            Ok(selector) => selector,
            Err(_) => {
                eprintln!(
                    "Could not parse device {}. Expected an index or vvvv:pppp; \
                     try running with -l to list devices",
                    arg
                );
                return ExitCode::FAILURE;
            }
        },
        None => DeviceSelector::First,
    };

    if cli.debug {
        set_debug(DebugLevel::PTP | DebugLevel::USB);
    }

    let session = match MtpSession::open(selector, SessionConfig::default()) {
        Ok(session) => session,
        Err(err) => {
            eprintln!("Could not open MTP device: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let banner = format!("Mounted {} on {}", session.describe(), mountpoint.display());
    if cli.verbose {
        println!("{}", banner);
    }
    info!("{}", banner);

    let filesystem = match MtpFs::new(session) {
        Ok(filesystem) => filesystem,
        Err(err) => {
            eprintln!("Could not create scratch directory: {}", err);
            return ExitCode::FAILURE;
        }
    };

    install_stop_handlers();

    // A single worker keeps every callback serialised on top of the state
    // lock; the MTP session cannot handle concurrent requests.
    let fuse = fuse_mt::FuseMT::new(filesystem, 1);
    let options: Vec<OsString> = vec![OsString::from("-o"), OsString::from("fsname=mtpfs")];

    let mount_point = mountpoint.clone();
    let mount_thread = std::thread::spawn(move || {
        let option_refs: Vec<&OsStr> = options.iter().map(OsString::as_os_str).collect();
        fuse_mt::mount(fuse, &mount_point, &option_refs)
    });

    while !STOPPED.load(Ordering::SeqCst) && !mount_thread.is_finished() {
        std::thread::sleep(Duration::from_millis(250));
    }

    if STOPPED.load(Ordering::SeqCst) && !mount_thread.is_finished() {
        info!("received stop signal, unmounting {}", mountpoint.display());
        let _ = std::process::Command::new("fusermount")
            .arg("-u")
            .arg(&mountpoint)
            .status();
    }

    match mount_thread.join() {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(err)) => {
            error!("mount failed: {}", err);
            eprintln!("Mount failed: {}", err);
            ExitCode::FAILURE
        }
        Err(_) => {
            error!("mount thread panicked");
            ExitCode::FAILURE
        }
    }
}
