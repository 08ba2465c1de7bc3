use std::fmt;

/// Library version, packed as `major << 16 | minor << 8 | patch` in `ver`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    pub ver: u32,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

fn component(raw: &str) -> u8 {
    raw.parse().unwrap_or(0)
}

pub fn version() -> Version {
    let major = component(env!("CARGO_PKG_VERSION_MAJOR"));
    let minor = component(env!("CARGO_PKG_VERSION_MINOR"));
    let patch = component(env!("CARGO_PKG_VERSION_PATCH"));
    Version {
        major,
        minor,
        patch,
        ver: (u32::from(major) << 16) | (u32::from(minor) << 8) | u32::from(patch),
    }
}
