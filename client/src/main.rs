use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use clap::Parser;
use fuser::MountOption;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use client::config;
use client::fs::{FsDispatch, Invalidator, RemoteFs};

#[derive(Parser, Debug)]
#[command(name = "vaultfs", version, about = "Mount a remote encrypted tree")]
struct Args {
    /// Where to mount.
    mountpoint: PathBuf,

    /// Configuration file (TOML); flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Server base URL.
    #[arg(long)]
    server: Option<String>,

    /// Mounting user, name@domain.
    #[arg(long)]
    user: Option<String>,

    /// Local cache directory.
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Byte budget for closed cache files.
    #[arg(long)]
    cache_size: Option<u64>,

    /// Log filter, e.g. "client=debug".
    #[arg(long)]
    log: Option<String>,

    /// Push writes remotely as they happen instead of on close.
    #[arg(long)]
    write_through: bool,

    /// Let other local users through the mount.
    #[arg(long)]
    allow_other: bool,

    /// Detach and run in the background.
    #[arg(long)]
    daemon: bool,
}

struct FuseInvalidator {
    notifier: fuser::Notifier,
}

impl Invalidator for FuseInvalidator {
    fn invalidate_attr(&self, ino: u64) {
        if let Err(e) = self.notifier.inval_inode(ino, 0, 0) {
            tracing::debug!(ino, error = %e, "attr invalidation failed");
        }
    }

    fn invalidate_data(&self, ino: u64) {
        if let Err(e) = self.notifier.inval_inode(ino, 0, 0) {
            tracing::debug!(ino, error = %e, "data invalidation failed");
        }
    }
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let args = Args::parse();

    let mut config = config::load(args.config.as_deref());
    if let Some(server) = args.server {
        config.server_url = server;
    }
    if let Some(user) = args.user {
        config.user = user;
    }
    if let Some(dir) = args.cache_dir {
        config.cache_dir = dir;
    }
    if let Some(size) = args.cache_size {
        config.cache_size = size;
    }
    if let Some(log) = args.log {
        config.log = log;
    }
    if args.write_through {
        config.write_through = true;
    }
    if args.allow_other {
        config.allow_other = true;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.daemon {
        if let Err(e) = daemonize::Daemonize::new().start() {
            eprintln!("cannot daemonize: {}", e);
            return 1;
        }
    }

    let allow_other = config.allow_other;
    let fs = match RemoteFs::new(config, &args.mountpoint) {
        Ok(fs) => fs,
        Err(e) => {
            eprintln!("startup failed: {}", e);
            return 1;
        }
    };
    fs.startup();

    let mut options = vec![
        MountOption::FSName("vaultfs".to_string()),
        MountOption::AutoUnmount,
    ];
    if allow_other {
        options.push(MountOption::AllowOther);
    }

    let mut session = match fuser::Session::new(FsDispatch(fs.clone()), &args.mountpoint, &options)
    {
        Ok(session) => session,
        Err(e) => {
            eprintln!("mount failed: {}", e);
            return 1;
        }
    };
    fs.set_invalidator(Arc::new(FuseInvalidator { notifier: session.notifier() }));

    // Best-effort unmount on interrupt; the session loop then winds down.
    let mountpoint = args.mountpoint.clone();
    fs.runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, unmounting");
            let _ = Command::new("fusermount").arg("-u").arg(&mountpoint).status();
        }
    });

    match session.run() {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("session failed: {}", e);
            1
        }
    }
}
