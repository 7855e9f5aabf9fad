//! Last-resort mount-point lookup in the kernel's mount table.
//!
//! Reads `/proc/self/mountinfo` and checks whether a path is listed
//! verbatim as a mount point. The kernel escapes space, tab, newline and
//! backslash inside the mount-point field as `\NNN` three-digit octal
//! sequences, so the comparison decodes those on the fly.
//!
//! <https://man7.org/linux/man-pages/man5/proc_pid_mountinfo.5.html>

use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Checks whether `path` is listed as a mount point in the given
/// mountinfo file.
pub(crate) fn lists_mount_point(mountinfo_path: &Path, path: &Path) -> io::Result<bool> {
    let mountinfo = std::fs::read(mountinfo_path)?;
    let path = path.as_os_str().as_bytes();

    for line in mountinfo.split(|&b| b == b'\n') {
        // The fifth field is the mount point.
        let mut fields = line.splitn(6, |&b| b == b' ');
        let Some(mount_point) = fields.nth(4) else {
            continue;
        };
        if fields.next().is_none() {
            continue; // Truncated line, the fifth field wasn't terminated.
        }
        if equals_octal_unescaped(mount_point, path) {
            return Ok(true);
        }
    }

    Ok(false)
}

/// Compares `data` and `path` for equality, converting any octal escape
/// sequences of the form `\NNN` in `data` to their respective byte on
/// the fly.
///
/// Only well-formed sequences are decoded: all three digits must be
/// octal, and the value must fall within the ASCII range `[0, 0o177]`.
/// Anything else, including a trailing `\` followed by too few digits,
/// is compared literally.
fn equals_octal_unescaped(data: &[u8], path: &[u8]) -> bool {
    let (dlen, plen) = (data.len(), path.len());

    // An escape sequence takes 4 bytes, so the unescaped length of data
    // is in range [dlen/4, dlen].
    if plen < dlen / 4 || plen > dlen {
        return false;
    }

    let mut doff = 0;
    for &pb in path {
        if doff >= dlen {
            return false; // path is longer than unescaped data
        }
        let mut ch = data[doff];
        if ch == b'\\' && doff + 3 < dlen {
            let d1 = data[doff + 1].wrapping_sub(b'0');
            let d2 = data[doff + 2].wrapping_sub(b'0');
            let d3 = data[doff + 3].wrapping_sub(b'0');
            // ASCII is [0, 177] octal; check the digits are in range.
            if d1 <= 1 && d2 <= 7 && d3 <= 7 {
                ch = (d1 << 6) | (d2 << 3) | d3;
                doff += 3; // Skip the three digits.
            }
        }

        if pb != ch {
            return false;
        }
        doff += 1;
    }

    doff == dlen // Equal only if data has been fully consumed.
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn fixture() -> PathBuf {
        PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/mountinfo"))
    }

    #[test]
    fn listed_mount_points() {
        for path in [
            "/",
            "/dev",
            "/sys/fs/bpf",
            "/mnt/path with spaces",
            r"/mnt/path\with\backslashes",
        ] {
            let listed = lists_mount_point(&fixture(), Path::new(path)).unwrap();
            assert!(listed, "for {path:?}");
        }
    }

    #[test]
    fn unlisted_paths() {
        for path in [
            "",
            "/de",
            "/dev/",
            "/mnt/path with space",
            "/mnt/path with spaces/",
            r"/mnt/path\040with\040spaces",
            r"/mnt/path\with\backslash",
            r"/mnt/path\with\backslashes/",
        ] {
            let listed = lists_mount_point(&fixture(), Path::new(path)).unwrap();
            assert!(!listed, "for {path:?}");
        }
    }

    #[test]
    fn missing_mountinfo_file() {
        let err = lists_mount_point(Path::new("/nonexistent/mountinfo"), Path::new("/")).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn unescape_exact_match_only() {
        assert!(equals_octal_unescaped(
            br"\040with\040spaces",
            b" with spaces"
        ));
        assert!(!equals_octal_unescaped(
            br"\040with\040spaces",
            b"with spaces"
        ));
        assert!(!equals_octal_unescaped(
            br"\040with\040spaces",
            b" with space"
        ));
    }

    #[test]
    fn unescape_malformed_sequences_stay_literal() {
        // Too few digits at the end of data.
        assert!(equals_octal_unescaped(br"a\04", br"a\04"));
        // A digit outside the octal range.
        assert!(equals_octal_unescaped(br"a\09b", br"a\09b"));
        // First digit above 1 would decode to a non-ASCII byte.
        assert!(equals_octal_unescaped(br"a\277", br"a\277"));
    }

    #[test]
    fn unescape_sequence_followed_by_digits() {
        // The escape consumes exactly three digits; trailing digits are
        // ordinary characters.
        assert!(equals_octal_unescaped(br"a\0401", b"a 1"));
        assert!(!equals_octal_unescaped(br"a\0401", b"a  "));
    }

    #[test]
    fn unescape_backslash_escape() {
        assert!(equals_octal_unescaped(br"a\134b", br"a\b"));
        assert!(!equals_octal_unescaped(br"a\134b", b"ab"));
    }
}
