//! Small cross-platform helper to query whether a given PID is currently alive.
//!
//! Both implementations treat "exists but I can't inspect it" as alive, not
//! dead: a stale-owner reclamation that got this wrong would let one user
//! steal a lock that is legitimately held by another user's live process,
//! breaking the cross-user mutual exclusion §4.1 requires.

#[cfg(unix)]
pub(crate) fn process_is_alive(pid: u32) -> bool {
    // Safety: kill with signal 0 sends no signal, only performs error
    // checking. ESRCH means the pid is gone; EPERM means it exists but is
    // owned by another user, which still counts as alive.
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if result == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(windows)]
pub(crate) fn process_is_alive(pid: u32) -> bool {
    // If we cannot open the process at all (e.g. access denied because it
    // runs as another user) we cannot confirm it has exited, so treat it as
    // alive rather than dead.
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{
        OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION, WaitForSingleObject,
    };

    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle == 0 {
            return true;
        }
        // Query immediately whether the process has already exited.
        const WAIT_TIMEOUT: u32 = 0x0000_0102;
        let status = WaitForSingleObject(handle, 0);
        let alive = status == WAIT_TIMEOUT;
        CloseHandle(handle);
        alive
    }
}
