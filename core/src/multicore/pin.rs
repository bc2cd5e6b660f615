use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use nix::Error;

// Pin current thread to specific CPU core
pub fn pin_thread_to_core(core: usize) -> Result<(), Error> {
    let mut cpu_set = CpuSet::new();
    cpu_set.set(core)?;
    sched_setaffinity(Pid::from_raw(0), &cpu_set)?;
    Ok(())
}

/// Pins the current thread if a core is given. Failures are logged and the thread keeps running
/// unpinned.
pub(crate) fn maybe_pin(core: Option<usize>, thread_name: &str) {
    if let Some(core) = core {
        match pin_thread_to_core(core) {
            Ok(()) => log::debug!("{} pinned to core {}", thread_name, core),
            Err(e) => log::warn!("Failed to pin {} to core {}: {}", thread_name, core, e),
        }
    }
}
