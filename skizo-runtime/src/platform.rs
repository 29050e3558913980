// Platform-dependent strings and clocks, exposed through enum-keyed
// accessors so emitted code and library modules stay platform-neutral.

use std::sync::OnceLock;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformString {
    NewLine,
    FileSeparator,
}

pub fn platform_string(key: PlatformString) -> &'static str {
    #[cfg(windows)]
    {
        match key {
            PlatformString::NewLine => "\r\n",
            PlatformString::FileSeparator => "\\",
        }
    }
    #[cfg(not(windows))]
    {
        match key {
            PlatformString::NewLine => "\n",
            PlatformString::FileSeparator => "/",
        }
    }
}

/// Milliseconds since process start; the profiling helpers accumulate
/// deltas of this clock.
pub fn tick_count() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// OS page size, for backends that allocate executable memory.
pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE).max(4096) as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_strings() {
        #[cfg(not(windows))]
        {
            assert_eq!(platform_string(PlatformString::NewLine), "\n");
            assert_eq!(platform_string(PlatformString::FileSeparator), "/");
        }
        #[cfg(windows)]
        {
            assert_eq!(platform_string(PlatformString::NewLine), "\r\n");
            assert_eq!(platform_string(PlatformString::FileSeparator), "\\");
        }
    }

    #[test]
    fn test_tick_count_monotonic() {
        let a = tick_count();
        let b = tick_count();
        assert!(b >= a);
    }
}
