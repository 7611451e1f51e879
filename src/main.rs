use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::info;

use marionette::cli::{Cli, Command};
use marionette::clock::SystemClock;
use marionette::config::ProfileStore;
use marionette::controller::{Backends, Controller};
use marionette::dialog::classify::{ExpectationList, classify};
use marionette::ports::Region;
use marionette::safety::SafetyLevel;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "marionette=info",
        1 => "marionette=debug",
        _ => "marionette=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Command::Run {
            profile,
            safety_level,
            dry_run,
            profiles_dir,
            logs_dir,
        } => run(&profile, &safety_level, dry_run, profiles_dir, logs_dir),
        Command::Init {
            profile,
            profiles_dir,
        } => {
            let store = ProfileStore::new(profiles_dir);
            let path = store.create_default(
                &profile,
                Region {
                    x: 0,
                    y: 0,
                    width: 1920,
                    height: 1080,
                },
            )?;
            println!("created {}", path.display());
            Ok(())
        }
        Command::List { profiles_dir } => {
            let names = ProfileStore::new(profiles_dir).list();
            if names.is_empty() {
                println!("no profiles found");
            }
            for name in names {
                println!("{name}");
            }
            Ok(())
        }
        Command::Classify { title, content } => {
            let kind = classify(&title, &content);
            let expected = ExpectationList::new(Vec::new()).is_expected(&title, &content);
            println!("classification: {}", kind.as_str());
            println!("expected: {expected}");
            Ok(())
        }
    }
}

fn run(
    profile: &str,
    safety_level: &str,
    dry_run: bool,
    profiles_dir: PathBuf,
    logs_dir: PathBuf,
) -> Result<()> {
    if !dry_run {
        bail!(
            "no platform backend is compiled into this binary; rerun with --dry-run, \
             or embed the marionette library with your own Capture/Vision/Input backends"
        );
    }
    let level: SafetyLevel = safety_level
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    println!("supervised automation starting; keep hands off mouse and keyboard");
    println!("touching either stops automation; the emergency key or Ctrl-C ends the session");

    let controller = Controller::new(
        ProfileStore::new(profiles_dir),
        logs_dir,
        level,
        Arc::new(SystemClock),
    );
    controller
        .start(profile, Backends::dry_run())
        .with_context(|| format!("failed to start profile '{profile}'"))?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupted_flag = interrupted.clone();
    ctrlc::set_handler(move || {
        interrupted_flag.store(true, Ordering::Relaxed);
    })
    .ok();

    loop {
        std::thread::sleep(Duration::from_millis(200));
        if interrupted.load(Ordering::Relaxed) {
            info!("interrupt received; stopping session");
            break;
        }
        let status = controller.status();
        if !status.is_running {
            break;
        }
        if status.stop_reason.is_some_and(|r| r.is_terminal()) {
            info!(reason = ?status.stop_reason, "terminal stop; shutting down");
            break;
        }
    }
    controller.stop();

    let status = controller.status();
    println!(
        "session over: {} observations, {} actions, {} errors ({})",
        status.stats.observations_made,
        status.stats.actions_executed,
        status.stats.errors_count,
        status
            .stop_reason
            .map(|r| r.as_str())
            .unwrap_or("still idle"),
    );
    Ok(())
}
