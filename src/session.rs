//! One counting session: attach, run until told to stop, report.
//!
//! The main loop sleeps on a channel. Background threads feed it: a ticker
//! for interval output, a waiter for the launched command, a watcher for an
//! attached pid, and the Ctrl-C handler.

use std::io::{self, Write};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::command::{self, ChildCommand};
use crate::config::StatConfig;
use crate::event_list::EventList;
use crate::output::print_values;
use crate::pmu::EventResolver;

/// Why the main loop woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    Tick,
    ChildExited(i32),
    /// The attached process went away.
    TargetExited,
    Interrupted,
}

/// How long an interrupted command gets to exit on its own.
const CHILD_GRACE: Duration = Duration::from_secs(5);

const PID_POLL: Duration = Duration::from_millis(100);

fn spawn_ticker(tx: Sender<Wakeup>, interval: Duration) -> Result<()> {
    thread::Builder::new()
        .name("interval_ticker".to_string())
        .spawn(move || {
            let mut next = Instant::now() + interval;
            loop {
                thread::sleep(next.saturating_duration_since(Instant::now()));
                next += interval;
                if tx.send(Wakeup::Tick).is_err() {
                    break;
                }
            }
        })?;
    Ok(())
}

fn process_exists(pid: i32) -> bool {
    let ret = unsafe { libc::kill(pid, 0) };
    ret == 0 || io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

fn spawn_pid_watcher(tx: Sender<Wakeup>, pid: i32) -> Result<()> {
    thread::Builder::new()
        .name("pid_watcher".to_string())
        .spawn(move || {
            while process_exists(pid) {
                thread::sleep(PID_POLL);
            }
            let _ = tx.send(Wakeup::TargetExited);
        })?;
    Ok(())
}

/// Wait for the next wakeup that ends the session, printing on every tick.
///
/// Returns the launched command's exit code, when it is known.
fn wait_loop(
    rx: &Receiver<Wakeup>,
    mut on_tick: impl FnMut() -> Result<()>,
    child: Option<&ChildCommand>,
) -> Result<Option<i32>> {
    loop {
        match rx.recv() {
            Ok(Wakeup::Tick) => on_tick()?,
            Ok(Wakeup::ChildExited(code)) => return Ok(Some(code)),
            Ok(Wakeup::TargetExited) => {
                tracing::info!("measured process exited");
                return Ok(None);
            }
            Ok(Wakeup::Interrupted) => break,
            Err(_) => return Ok(None),
        }
    }

    // Give an interrupted command the chance to finish its own cleanup
    if child.is_some() {
        let deadline = Instant::now() + CHILD_GRACE;
        loop {
            match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                Ok(Wakeup::ChildExited(code)) => return Ok(Some(code)),
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }
    Ok(None)
}

/// Run a full session for `config` and return the exit code for evstat.
pub fn run(config: &StatConfig) -> Result<i32> {
    config.validate()?;

    let resolver = EventResolver::from_system().load_event_map(config.event_file.clone())?;
    let mut list = EventList::new();
    for spec in config.event_specs() {
        list.parse_events(spec, &resolver)?;
    }
    tracing::debug!("measuring {}", list.spec_string());

    // Forked before any thread exists
    let mut child = if config.command.is_empty() {
        None
    } else {
        Some(command::spawn_stopped(&config.command)?)
    };

    let target = config.target_spec(child.as_ref().map(|c| c.pid));
    list.setup_events(&target)?;

    let mut stdout = io::stdout().lock();
    if config.verbosity > 0 {
        list.write_attrs(&mut stdout)
            .context("Failed to write counter attributes")?;
        stdout.flush()?;
    }

    let (tx, rx) = channel();
    let forward = child.as_ref().map(ChildCommand::signaller);
    let interrupt_tx = tx.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        if let Some(signal) = &forward {
            signal(libc::SIGINT);
        }
        let _ = interrupt_tx.send(Wakeup::Interrupted);
    }) {
        tracing::warn!("could not install the Ctrl-C handler: {}", e);
    }

    if let Some(child) = child.as_mut() {
        child.release()?;
        child.wait_for_exec()?;
        child.spawn_waiter(tx.clone(), Wakeup::ChildExited)?;
    }
    if let Some(pid) = config.pid {
        spawn_pid_watcher(tx.clone(), pid)?;
    }
    if let Some(interval) = config.interval {
        spawn_ticker(tx.clone(), interval)?;
    }
    drop(tx);

    let start = Instant::now();
    let ts = |interval: Option<Duration>| interval.map(|_| start.elapsed());
    let status = wait_loop(
        &rx,
        || {
            list.read_all_events();
            print_values(&mut stdout, &list, ts(config.interval), config.no_aggr)?;
            Ok(())
        },
        child.as_ref(),
    )?;

    list.read_all_events();
    for err in list.read_errors() {
        tracing::debug!("{}", err);
    }
    print_values(&mut stdout, &list, ts(config.interval), config.no_aggr)?;

    if let Some(code) = status {
        tracing::info!("command exited with {}", code);
    }
    Ok(status.unwrap_or(0))
}
