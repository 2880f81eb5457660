//! Host architecture detection with the Android image naming scheme.

use std::fs;

use anyhow::{Result, bail};
use nix::sys::utsname::uname;

/// Map the host machine to an image architecture tag, applying the CPU
/// capability downgrades Android images require (SSSE3 mandatory on x86,
/// SSE4.2 for 64-bit, AArch32 support for plain arm64).
pub fn host() -> Result<String> {
    let uts = uname()?;
    let machine = uts.machine().to_string_lossy().into_owned();

    let target = match machine.as_str() {
        "i686" => "x86",
        "x86_64" => "x86_64",
        "aarch64" => "arm64",
        "armv7l" | "armv8l" => "arm",
        other => bail!("machine architecture \"{other}\" is not supported"),
    };

    let cpuinfo = fs::read_to_string("/proc/cpuinfo").unwrap_or_default();
    remap(target, &cpuinfo)
}

fn remap(target: &str, cpuinfo: &str) -> Result<String> {
    if target.starts_with("x86") {
        if !cpuinfo.contains("ssse3") {
            bail!("x86/x86_64 CPU must support SSSE3");
        }
        if target == "x86_64" && !cpuinfo.contains("sse4_2") {
            tracing::info!("x86_64 CPU does not support SSE4.2, falling back to x86");
            return Ok("x86".into());
        }
    } else if target == "arm64" && !is_32bit_capable() {
        tracing::info!("AArch64 CPU does not support AArch32, assuming arm64_only");
        return Ok("arm64_only".into());
    }
    Ok(target.into())
}

/// Probe whether the kernel can run 32-bit personalities (man 2 personality).
fn is_32bit_capable() -> bool {
    const PER_LINUX32: nix::libc::c_ulong = 0x0008;
    // Switching persona succeeds only when the kernel supports it; revert
    // to the previous persona immediately on success.
    let prev = unsafe { nix::libc::personality(PER_LINUX32) };
    if prev != -1 {
        unsafe { nix::libc::personality(prev as nix::libc::c_ulong) };
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x86_requires_ssse3() {
        assert!(remap("x86", "flags : fpu sse2").is_err());
        assert_eq!(remap("x86", "flags : ssse3 sse4_2").unwrap(), "x86");
    }

    #[test]
    fn x86_64_downgrades_without_sse42() {
        assert_eq!(remap("x86_64", "flags : ssse3").unwrap(), "x86");
        assert_eq!(remap("x86_64", "flags : ssse3 sse4_2").unwrap(), "x86_64");
    }

    #[test]
    fn arm_is_passed_through() {
        assert_eq!(remap("arm", "").unwrap(), "arm");
    }
}
