#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error(core::ffi::c_int);

impl Error {
    #[inline]
    pub fn as_isize(self) -> isize {
        self.0 as isize
    }

    /// 错误的名称与描述，用于日志
    #[inline]
    pub fn info(self) -> &'static str {
        errno::error_info(self.as_isize())
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} ({})", self.info(), self.0)
    }
}

pub type KResult<T = isize> = core::result::Result<T, Error>;

pub mod errno {
    macro_rules! declare_errno {
        ($($name:tt, $errno:literal, $desc:literal,)*) => {
            $(#[doc = $desc]
            pub const $name: super::Error = super::Error($errno);)*
            pub fn error_info(errno: isize) -> &'static str {
                match errno {
                    $($errno => ::core::concat!(stringify!($name), ", ", $desc),)*
                    _ => "Unknown error",
                }
            }
        };
    }

    #[rustfmt::skip]
    declare_errno!(
        EIO,            -5,     "I/O error.",
        ENXIO,          -6,     "No such device or address.",
        EBADF,          -9,     "Bad file number.",
        EAGAIN,         -11,    "Try again.",
        ENOMEM,         -12,    "Out of memory",
        EFAULT,         -14,    "Bad address.",
        EEXIST,         -17,    "File exists.",
        EINVAL,         -22,    "Invalid argument.",
    );
}

#[cfg(test)]
mod tests {
    use super::errno;

    #[test]
    fn errno_values_match_linux() {
        assert_eq!(errno::EAGAIN.as_isize(), -11);
        assert_eq!(errno::ENOMEM.as_isize(), -12);
        assert_eq!(errno::EFAULT.as_isize(), -14);
        assert_eq!(errno::EINVAL.as_isize(), -22);
    }

    #[test]
    fn error_info_names_errno() {
        assert_eq!(errno::EIO.info(), "EIO, I/O error.");
        assert_eq!(errno::error_info(-4096), "Unknown error");
        assert_eq!(std::format!("{}", errno::EEXIST), "EEXIST, File exists. (-17)");
    }
}
