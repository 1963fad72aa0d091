use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use bytesize::ByteSize;
use clap::Parser;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};
use sysvipc::{Disposal, Key, Mode, Semaphore, SharedSegment};
use tracing_subscriber::EnvFilter;

/// Forks workers that take turns on a semaphore, then fill and sum an array
/// of `f64` living in a shared segment.
#[derive(Debug, Parser)]
struct Args {
    /// Key of both the semaphore and the segment. Check `ipcs` that it is free.
    #[arg(long, default_value_t = 0x823, value_parser = parse_key)]
    key: Key,
    /// Child processes to fork.
    #[arg(long, default_value_t = 8)]
    workers: usize,
    /// Leave the segment behind for inspection with `ipcs -m`.
    #[arg(long)]
    keep: bool,
}

fn parse_key(s: &str) -> Result<Key, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => Key::from_str_radix(hex, 16),
        None => s.parse(),
    };
    match parsed {
        Ok(key) if key > 0 => Ok(key),
        Ok(key) => Err(format!("key must be positive, got {key}")),
        Err(e) => Err(e.to_string()),
    }
}

fn who(index: usize) -> String {
    if index == 0 {
        "Parent".to_string()
    } else {
        format!("Child {index}")
    }
}

/// Forks `n` children. Returns this process' index (`0` for the parent) and,
/// in the parent, the children's pids.
fn fork_n(n: usize) -> nix::Result<(usize, Vec<Pid>)> {
    let mut children = Vec::with_capacity(n);
    for i in 1..=n {
        match unsafe { fork() }? {
            ForkResult::Child => return Ok((i, Vec::new())),
            ForkResult::Parent { child } => {
                tracing::debug!("[fork-sum]: forked child {} as {}", i, child);
                children.push(child);
            }
        }
    }
    Ok((0, children))
}

fn run(args: &Args) -> sysvipc::Result<ExitCode> {
    let slots = args.workers + 1;
    let size = slots * size_of::<f64>();

    println!(
        "max segment size: {}",
        ByteSize::b(SharedSegment::max_size() as u64)
    );

    // Everything the children rely on exists before the first fork. The
    // parent's segment handle is `Retain` so the copies inherited by the
    // children do nothing when they go out of scope.
    let mut sem = Semaphore::new(args.key, Mode::default())?;
    sem.set_value(0)?;
    let mut segment = SharedSegment::with_disposal(args.key, Disposal::Retain);
    segment.attach(size, Mode::default())?;
    if let Some(bytes) = unsafe { segment.as_bytes_mut() } {
        bytes.fill(0);
    }

    let (index, children) = match fork_n(args.workers) {
        Ok(forked) => forked,
        Err(err) => {
            eprintln!("Fork failed: {err}");
            // Wakes the children already blocked in `acquire`.
            sem.destroy()?;
            return Ok(ExitCode::FAILURE);
        }
    };

    if index == 0 {
        println!("Parent releases semaphore in 1 second ... ");
        thread::sleep(Duration::from_secs(1));
        sem.release(1)?;
    } else {
        sem.acquire(1)?;
        println!("{} has the semaphore now", who(index));
        sem.release(1)?;
    }

    // Each process maps the segment on its own.
    let shm = segment.reopen()?;
    let array = shm.as_ptr().cast::<f64>();
    unsafe { array.add(index).write_volatile(index as f64) };

    // Poll until every process has filled in its slot.
    let read = |i: usize| unsafe { array.add(i).read_volatile() };
    while !(0..slots).all(|i| read(i) == i as f64) {
        std::hint::spin_loop();
    }
    let sum: f64 = (0..slots).map(read).sum();
    println!("{} array sum (shm) = {}", who(index), sum);

    if index != 0 {
        return Ok(ExitCode::SUCCESS);
    }

    let mut code = ExitCode::SUCCESS;
    for pid in children {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, 0)) => {}
            Ok(status) => {
                eprintln!("Child {pid} terminated with status {status:?}");
                code = ExitCode::FAILURE;
            }
            Err(err) => {
                eprintln!("Waiting for child {pid} failed: {err}");
                code = ExitCode::FAILURE;
            }
        }
    }

    // The semaphore has no disposal of its own; the parent removes it.
    sem.destroy()?;
    drop(shm);
    if !args.keep {
        segment.destroy()?;
    }
    println!("Bye");
    Ok(code)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("fork-sum: {err}");
            ExitCode::FAILURE
        }
    }
}
