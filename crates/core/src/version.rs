//! Tool and kernel version probes.

use nix::sys::utsname::uname;

/// Version recorded in the base props file; the upgrader compares it to
/// decide whether migration fixups must run.
pub const TOOLS_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Running kernel version as (major, minor). Unparseable release strings
/// count as (0, 0) so feature gates stay off.
pub fn kernel_version() -> (u32, u32) {
    match uname() {
        Ok(uts) => parse_release(&uts.release().to_string_lossy()),
        Err(_) => (0, 0),
    }
}

fn parse_release(release: &str) -> (u32, u32) {
    let mut parts = release.split(['.', '-']);
    let major = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (major, minor)
}

/// Compare two dotted version strings numerically, component by component.
pub fn compare(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |v: &str| -> Vec<u32> {
        v.split('.').map(|p| p.parse().unwrap_or(0)).collect()
    };
    parse(a).cmp(&parse(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn release_strings_parse() {
        assert_eq!(parse_release("6.8.0-41-generic"), (6, 8));
        assert_eq!(parse_release("4.17"), (4, 17));
        assert_eq!(parse_release("unknown"), (0, 0));
    }

    #[test]
    fn version_compare_is_numeric() {
        assert_eq!(compare("1.10.0", "1.9.3"), Ordering::Greater);
        assert_eq!(compare("1.3.3", "1.3.3"), Ordering::Equal);
        assert_eq!(compare("0.9", "1.0.0"), Ordering::Less);
    }
}
