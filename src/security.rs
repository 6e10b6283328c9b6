//! Process-level safety checks.

use anyhow::{Result, bail};
use nix::unistd::{Uid, getuid, geteuid};

/// Refuses to start with root privileges, real or effective. The server
/// writes below `DATA_ROOT` and runs ffmpeg and yt-dlp on user supplied media.
pub fn ensure_not_root(process: &str) -> Result<()> {
    check_uids(process, getuid(), geteuid())
}

fn check_uids(process: &str, real: Uid, effective: Uid) -> Result<()> {
    if real.is_root() || effective.is_root() {
        bail!(
            "{process} must not run with root privileges (uid {real}, euid {effective}); \
             start it as the videolens service user"
        );
    }
    Ok(())
}
