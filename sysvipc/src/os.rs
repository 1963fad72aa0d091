#![cfg(feature = "unix")]

pub mod unix;

use std::path::Path;

/// Kernel tunable holding the largest segment `shmget` will create.
pub const SHMMAX_PATH: &str = "/proc/sys/kernel/shmmax";

/// Reads the system-wide segment size ceiling.
///
/// Never cached: the administrator may change the tunable at any time.
/// Values beyond `usize` saturate, e.g. the default Linux value on 32-bit
/// targets.
pub fn shmmax() -> Option<usize> {
    read_limit(Path::new(SHMMAX_PATH))
}

fn read_limit(path: &Path) -> Option<usize> {
    let raw = std::fs::read_to_string(path).ok()?;
    let value = raw.trim().parse::<u128>().ok()?;
    Some(usize::try_from(value).unwrap_or(usize::MAX))
}

#[cfg(test)]
mod tests {
    use super::read_limit;

    #[test]
    fn limit_parse() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("sysvipc-shmmax-{}", fastrand::u32(..)));

        std::fs::write(&path, "4096\n").unwrap();
        assert_eq!(read_limit(&path), Some(4096));

        std::fs::write(&path, "340282366920938463463374607431768211455").unwrap();
        assert_eq!(read_limit(&path), Some(usize::MAX));

        std::fs::write(&path, "garbage").unwrap();
        assert_eq!(read_limit(&path), None);

        std::fs::remove_file(&path).unwrap();
        assert_eq!(read_limit(&path), None);
    }
}
