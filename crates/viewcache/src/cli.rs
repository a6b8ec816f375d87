//! Exposes the command line application.
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio::time::Instant;

use viewcache_service::caching::{ImageKey, ImageRecord, RaceLoader};
use viewcache_service::config::Config;
use viewcache_service::loaders::{FullImageLoader, QuickImageLoader};
use viewcache_service::{logging, metrics};

use crate::output;

/// viewcache commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Load images in order, printing every image that would be shown.
    ///
    /// A quick preview is printed as soon as it is available, followed by the full image. Only
    /// the last image is upgraded on screen, the ones before it are skimmed.
    Load {
        /// The image files to load.
        #[arg(required = true, value_name = "PATH")]
        paths: Vec<PathBuf>,
    },

    /// Print the effective configuration.
    Config,
}

/// Command line interface parser.
#[derive(Parser, Debug)]
#[command(bin_name = "viewcache", version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: The runtime is not started yet, so this is still single-threaded.
    unsafe { logging::init_logging(&config) };
    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd,
            config.metrics.custom_tags.clone(),
        )?;
    }

    match cli.command {
        Command::Load { paths } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .thread_name("viewcache-worker")
                .enable_all()
                .build()
                .context("failed to start the runtime")?;
            let mut stdout = std::io::stdout().lock();
            runtime.block_on(load_all(&config, &paths, &mut stdout))
        }
        Command::Config => {
            println!("{config:#?}");
            Ok(())
        }
    }
}

/// Requests all `paths` one after the other, the way a user flipping through images would.
///
/// Every image handed to the viewer is printed to `out`. After the last request, this waits for
/// the full version of the last image, at most for the configured `upgrade_timeout`.
async fn load_all(config: &Config, paths: &[PathBuf], out: &mut impl Write) -> Result<()> {
    let (sender, mut receiver) = mpsc::unbounded_channel();
    let loader = RaceLoader::new(
        FullImageLoader::new(),
        QuickImageLoader::new(config.thumbnails.clone()),
        sender,
        config.cache.capacity,
    );

    let mut failed = 0;
    let mut pending_upgrade = None;
    for path in paths {
        let key = ImageKey::new(path);
        pending_upgrade = None;

        let record = match loader.get_or_load(key.clone()).await {
            Ok(record) => record,
            Err(err) => {
                failed += 1;
                tracing::error!(
                    path = %path.display(),
                    error = &err as &dyn std::error::Error,
                    "Failed to load image"
                );
                continue;
            }
        };

        let drained = drain_notifications(&mut receiver, &key, out)?;
        // Cached images are returned without a notification.
        if !drained.shown {
            output::print_record(out, &record)?;
        }
        if !record.is_full_resolution() && !drained.upgraded {
            pending_upgrade = Some(key);
        }
    }

    if let Some(key) = pending_upgrade {
        let deadline = Instant::now() + config.upgrade_timeout;
        loop {
            match tokio::time::timeout_at(deadline, receiver.recv()).await {
                Ok(Some(record)) => {
                    output::print_record(out, &record)?;
                    if record.key() == &key && record.is_full_resolution() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(%key, "Timed out waiting for the full image");
                    break;
                }
            }
        }
    }
    out.flush()?;

    if failed > 0 {
        bail!("failed to load {failed} of {} images", paths.len());
    }
    Ok(())
}

/// What [`drain_notifications`] printed for the requested key.
#[derive(Debug, Default, PartialEq, Eq)]
struct Drained {
    /// Any record for the key was printed.
    shown: bool,
    /// The full record for the key was printed.
    upgraded: bool,
}

/// Prints all records that are already waiting in `receiver`.
fn drain_notifications(
    receiver: &mut mpsc::UnboundedReceiver<Arc<ImageRecord>>,
    key: &ImageKey,
    out: &mut impl Write,
) -> Result<Drained> {
    let mut drained = Drained::default();
    while let Ok(notified) = receiver.try_recv() {
        if notified.key() == key {
            drained.shown = true;
            drained.upgraded |= notified.is_full_resolution();
        }
        output::print_record(out, &notified)?;
    }
    Ok(drained)
}
