//! Process naming for `ps`, `top`, and friends.
use std::io;

use tracing::{debug, warn};

/// Longest name the kernel keeps, excluding the trailing NUL.
pub const MAX_TITLE_LEN: usize = 15;

/// Renames the calling thread, which for the main thread is the process name.
///
/// Titles longer than [`MAX_TITLE_LEN`] bytes are cut at a character boundary.
#[cfg(target_os = "linux")]
pub fn set_process_title(title: &str) -> io::Result<()> {
    use std::ffi::CString;

    let name = CString::new(truncate(title)).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "process title contains a NUL byte",
        )
    })?;

    // SAFETY: PR_SET_NAME reads at most 16 bytes from a valid NUL-terminated buffer.
    let rc = unsafe { libc::prctl(libc::PR_SET_NAME, name.as_ptr() as libc::c_ulong, 0, 0, 0) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_process_title(_title: &str) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process titles are only supported on Linux",
    ))
}

/// Sets the title, logging instead of failing.
pub(crate) fn apply_process_title(title: &str) {
    match set_process_title(title) {
        Ok(()) => debug!("Process title set to {title:?}"),
        Err(err) => warn!("Unable to set process title {title:?}: {err}"),
    }
}

fn truncate(title: &str) -> &str {
    if title.len() <= MAX_TITLE_LEN {
        return title;
    }
    let mut end = MAX_TITLE_LEN;
    while !title.is_char_boundary(end) {
        end -= 1;
    }
    &title[..end]
}
