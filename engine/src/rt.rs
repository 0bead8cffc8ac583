use crate::error::{Error, Result};
#[cfg(unix)]
use nix::libc;
use tracing::{info, warn};

pub const WORKER_STACK_SIZE: usize = 100_000;

#[cfg(unix)]
const RT_POLICY: i32 = libc::SCHED_FIFO;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduling {
    /// Time-shared, whatever the process already runs with.
    Default,
    /// FIFO at `offset` below the policy maximum.
    Realtime { offset: i32 },
}

impl Scheduling {
    /// Negative priorities ask for realtime scheduling.
    pub fn from_priority(priority: i32) -> Self {
        if priority < 0 {
            Self::Realtime { offset: priority }
        } else {
            Self::Default
        }
    }
}

pub fn realtime_priority(offset: i32, min: i32, max: i32) -> i32 {
    max.saturating_add(offset).clamp(min, max)
}

#[cfg(unix)]
fn fifo_priority(offset: i32) -> Result<i32> {
    let (min, max) = unsafe {
        (
            libc::sched_get_priority_min(RT_POLICY),
            libc::sched_get_priority_max(RT_POLICY),
        )
    };
    if min < 0 || max < 0 || min > max {
        return Err(Error::Scheduling(format!(
            "no priority range for SCHED_FIFO: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(realtime_priority(offset, min, max))
}

#[cfg(not(unix))]
fn fifo_priority(_offset: i32) -> Result<i32> {
    Err(Error::Scheduling(
        "realtime scheduling is not supported on this platform".to_string(),
    ))
}

fn configure_rt_thread(priority: i32) -> std::result::Result<(), String> {
    #[cfg(unix)]
    {
        let thread = unsafe { libc::pthread_self() };
        let param = unsafe {
            let mut p = std::mem::zeroed::<libc::sched_param>();
            p.sched_priority = priority;
            p
        };
        let rc = unsafe { libc::pthread_setschedparam(thread, RT_POLICY, &param) };
        if rc != 0 {
            return Err(format!(
                "pthread_setschedparam(SCHED_FIFO, prio {}) failed: {}",
                priority,
                std::io::Error::from_raw_os_error(rc)
            ));
        }

        let mut actual_policy = 0_i32;
        let mut actual_param = unsafe { std::mem::zeroed::<libc::sched_param>() };
        let rc =
            unsafe { libc::pthread_getschedparam(thread, &mut actual_policy, &mut actual_param) };
        if rc != 0 {
            return Err(format!(
                "pthread_getschedparam failed: {}",
                std::io::Error::from_raw_os_error(rc)
            ));
        }
        if actual_policy != RT_POLICY || actual_param.sched_priority != priority {
            return Err(format!(
                "realtime verification failed: policy {}, prio {}",
                actual_policy, actual_param.sched_priority
            ));
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = priority;
        Err("realtime thread priority is not supported on this platform".to_string())
    }
}

fn lock_memory_pages() -> std::result::Result<(), String> {
    #[cfg(unix)]
    {
        let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
        if rc == 0 {
            Ok(())
        } else {
            Err(format!(
                "mlockall(MCL_CURRENT|MCL_FUTURE) failed: {}",
                std::io::Error::last_os_error()
            ))
        }
    }
    #[cfg(not(unix))]
    {
        Err("mlockall is not supported on this platform".to_string())
    }
}

/// Runs `work` on a dedicated thread and waits for it.
///
/// With realtime scheduling the thread applies and verifies its policy
/// before running `work`; if either fails `work` never runs.
pub fn launch<T, F>(name: &str, scheduling: Scheduling, work: F) -> Result<T>
where
    T: Send,
    F: FnOnce() -> T + Send,
{
    let priority = match scheduling {
        Scheduling::Default => None,
        Scheduling::Realtime { offset } => {
            if let Err(e) = lock_memory_pages() {
                warn!("{e}");
            }
            Some(fifo_priority(offset)?)
        }
    };

    std::thread::scope(|scope| -> Result<T> {
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .stack_size(WORKER_STACK_SIZE)
            .spawn_scoped(scope, move || -> Result<T> {
                if let Some(priority) = priority {
                    configure_rt_thread(priority).map_err(Error::Scheduling)?;
                    info!("worker running SCHED_FIFO at priority {priority}");
                }
                Ok(work())
            })?;
        handle
            .join()
            .map_err(|_| Error::Scheduling(format!("{name} panicked")))?
    })
}
