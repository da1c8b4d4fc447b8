use std::env;
use std::fs;
use std::process;
use std::time::Instant;

use anyhow::Context as _;
use log::{info, warn};
use nix::sys::ptrace;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
use callstack_ctx::capture::UserTask;
use callstack_ctx::record::read_callstack;
use callstack_ctx::{
    CALLSTACK_KERNEL, CALLSTACK_USER, CallstackConfig, Context, MAX_ENTRIES, NestingTracker,
    RecordBuffer, RecordContext, add_callstack_to_ctx, remove_callstack,
};

// Architecture info helper
fn get_architecture_info() -> &'static str {
    #[cfg(target_arch = "x86_64")]
    return "x86_64";
    #[cfg(target_arch = "aarch64")]
    return "aarch64";
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    return "unsupported (kernel callstack only)";
}

#[derive(Debug)]
struct ThreadRecord {
    tid: i32,
    thread_name: String,
    record: RecordBuffer,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let (pid, max_depth) = match args.as_slice() {
        [_] => (None, MAX_ENTRIES),
        [_, pid] => (Some(pid.parse::<i32>()?), MAX_ENTRIES),
        [_, pid, depth] => (Some(pid.parse::<i32>()?), depth.parse::<usize>()?),
        _ => {
            eprintln!("Usage: {} [pid [max-depth]]", args[0]);
            process::exit(1);
        }
    };

    println!("callstack-ctx v0.1.0 - callstack context recorder");
    println!("Target architecture: {}", get_architecture_info());

    let config = CallstackConfig::with_max_depth(max_depth);
    let tracker = NestingTracker::new(config.nr_cpus);
    let mut ctx = Context::new();
    let mut registered = vec![add_callstack_to_ctx(&mut ctx, CALLSTACK_KERNEL, &config)?];
    if pid.is_some() {
        registered.push(
            add_callstack_to_ctx(&mut ctx, CALLSTACK_USER, &config)
                .context("userspace callstacks are unavailable on this platform")?,
        );
    }

    println!("\n=== Context metadata ===");
    print!("{ctx}");

    match pid {
        None => {
            let guard = tracker.enter();
            let rec = guard.record_context();
            let record = record_event(&ctx, &rec);
            print_record("callstack_kernel", &record, 1);
        }
        Some(pid) => {
            println!("Attaching to process {pid}");
            let start_time = Instant::now();
            let thread_ids = discover_threads(pid)?;
            println!("Found {} threads", thread_ids.len());

            let records = record_all_threads(&ctx, &tracker, pid, thread_ids);
            println!("Process was stopped for: {:?}", start_time.elapsed());

            for (i, thread) in records.iter().enumerate() {
                println!(
                    "\n=== Thread {} (TID: {}, Name: '{}') ===",
                    i + 1,
                    thread.tid,
                    thread.thread_name
                );
                print_record("callstack_kernel / callstack_user", &thread.record, 2);
            }
        }
    }

    for fields in &registered {
        remove_callstack(&mut ctx, fields);
    }
    Ok(())
}

/// Records one event occurrence carrying every context field.
fn record_event(ctx: &Context, rec: &RecordContext<'_>) -> RecordBuffer {
    let size = ctx.get_size(0, rec);
    let mut record = RecordBuffer::with_capacity(size);
    ctx.record(rec, &mut record);
    record
}

fn print_record(label: &str, record: &RecordBuffer, nr_contexts: usize) {
    println!("  {label}: {} bytes", record.as_bytes().len());
    let mut offset = 0;
    for _ in 0..nr_contexts {
        let Some((entries, next)) = read_callstack(record.as_bytes(), offset) else {
            warn!("truncated callstack record at offset {offset}");
            return;
        };
        println!("  {} entries", entries.len());
        for (frame_idx, addr) in entries.iter().enumerate() {
            println!("    #{frame_idx}: 0x{addr:016x}");
        }
        offset = next;
    }
}

fn discover_threads(pid: i32) -> anyhow::Result<Vec<i32>> {
    let task_dir = format!("/proc/{pid}/task");
    let mut thread_ids = Vec::new();

    for entry in fs::read_dir(&task_dir).with_context(|| format!("reading {task_dir}"))? {
        let entry = entry?;
        if let Ok(tid) = entry.file_name().to_string_lossy().parse::<i32>() {
            thread_ids.push(tid);
        }
    }

    thread_ids.sort();
    Ok(thread_ids)
}

fn get_thread_name(pid: i32, tid: i32) -> String {
    let comm_path = format!("/proc/{pid}/task/{tid}/comm");
    match fs::read_to_string(&comm_path) {
        Ok(name) => name.trim().to_string(),
        Err(_) => "<unknown>".to_string(),
    }
}

fn record_all_threads(ctx: &Context, tracker: &NestingTracker, pid: i32, thread_ids: Vec<i32>) -> Vec<ThreadRecord> {
    let mut attached_tids = Vec::new();

    // Attach to all threads first
    for &tid in &thread_ids {
        match ptrace::attach(Pid::from_raw(tid)) {
            Ok(_) => match waitpid(Pid::from_raw(tid), None) {
                Ok(WaitStatus::Stopped(_, _)) => attached_tids.push(tid),
                Ok(status) => warn!("unexpected wait status for TID {tid}: {status:?}"),
                Err(e) => warn!("failed to wait for TID {tid}: {e}"),
            },
            Err(e) => warn!("failed to attach to TID {tid}: {e}"),
        }
    }

    // One event occurrence per stopped thread, with that thread as the
    // current task
    let mut records = Vec::new();
    for &tid in &attached_tids {
        match record_thread(ctx, tracker, pid, tid) {
            Ok(record) => records.push(record),
            Err(e) => warn!("failed to record TID {tid}: {e:#}"),
        }
    }

    // Detach from all threads to resume the process
    for &tid in &attached_tids {
        if let Err(e) = ptrace::detach(Pid::from_raw(tid), None) {
            warn!("failed to detach from TID {tid}: {e}");
        }
    }

    info!("recorded {} of {} threads", records.len(), thread_ids.len());
    records
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
fn record_thread(ctx: &Context, tracker: &NestingTracker, pid: i32, tid: i32) -> anyhow::Result<ThreadRecord> {
    let task = UserTask::stopped(Pid::from_raw(tid)).context("reading registers")?;
    let guard = tracker.enter();
    let rec = guard.record_context().with_task(&task);
    Ok(ThreadRecord {
        tid,
        thread_name: get_thread_name(pid, tid),
        record: record_event(ctx, &rec),
    })
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn record_thread(_ctx: &Context, _tracker: &NestingTracker, _pid: i32, _tid: i32) -> anyhow::Result<ThreadRecord> {
    anyhow::bail!("userspace callstacks are unsupported on this architecture")
}
