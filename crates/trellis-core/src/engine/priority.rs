//! Time-critical scheduling for engine threads
//!
//! Worker and fifo-writer threads ask the OS for realtime scheduling so a
//! busy desktop cannot starve a period. Failure is non-fatal: the engine
//! runs at default priority and merely risks xruns under load.

/// Request time-critical scheduling for the current thread.
///
/// Returns whether the request was honored.
#[cfg(target_os = "linux")]
pub fn set_time_critical() -> bool {
    // SCHED_FIFO needs CAP_SYS_NICE or an rtprio limit; a plain desktop
    // session often has neither.
    let param = libc::sched_param { sched_priority: 70 };
    let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if rc == 0 {
        log::debug!("scheduling: thread promoted to SCHED_FIFO");
        true
    } else {
        log::debug!("scheduling: SCHED_FIFO unavailable (rc={}), staying at default", rc);
        false
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn set_time_critical() -> bool {
    let param = libc::sched_param { sched_priority: 70 };
    let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    rc == 0
}

#[cfg(not(unix))]
pub fn set_time_critical() -> bool {
    false
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_request_does_not_panic() {
        // Outcome depends on process privileges; only the call itself is
        // under test.
        let _ = super::set_time_critical();
    }
}
