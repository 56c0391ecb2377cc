use std::{fmt, ops::BitOr};

use crate::stack::StackCapture;

pub const DISPLAY_ENV: &str = "OBJECT_TRACK_DISPLAY";
pub const FILTER_ENV: &str = "OBJECT_TRACK_FILTER";
pub const ORIGIN_EVICT_ENV: &str = "OBJECT_TRACK_ORIGIN_EVICT";
pub const PROPAGATE_PRELOAD_ENV: &str = "OBJECT_TRACK_PROPAGATE_LD_PRELOAD";

/// Bitmask of what gets written to the diagnostic stream as events happen.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DisplayFlags(u8);

impl DisplayFlags {
    pub const NONE: Self = Self(0);
    pub const CREATE: Self = Self(1);
    pub const REFS: Self = Self(1 << 2);
    pub const BACKTRACE: Self = Self(1 << 3);
    pub const ORIGINS: Self = Self(1 << 4);
    pub const ALL: Self = Self(Self::CREATE.0 | Self::REFS.0 | Self::BACKTRACE.0 | Self::ORIGINS.0);
    pub const DEFAULT: Self = Self::CREATE;

    const NAMES: [(&'static str, DisplayFlags); 7] = [
        ("none", Self::NONE),
        ("create", Self::CREATE),
        ("refs", Self::REFS),
        ("backtrace", Self::BACKTRACE),
        ("origin-trace", Self::ORIGINS),
        ("tracerefs", Self::ORIGINS),
        ("all", Self::ALL),
    ];

    /// Parses a comma separated token list. An absent or token-less value
    /// yields [`DisplayFlags::DEFAULT`]; unknown tokens are ignored.
    pub fn parse(value: Option<&str>) -> Self {
        let value = match value {
            Some(value) if !value.is_empty() => value,
            _ => return Self::DEFAULT,
        };
        let mut flags = Self::NONE;
        for token in value.split(',') {
            let token = token.trim();
            if let Some((_, flag)) = Self::NAMES
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(token))
            {
                flags = flags | *flag;
            }
        }
        flags
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl Default for DisplayFlags {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl BitOr for DisplayFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for DisplayFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let mut first = true;
        for (name, flag) in &Self::NAMES[1..5] {
            if self.contains(*flag) {
                if !first {
                    write!(f, ",")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        Ok(())
    }
}

/// When accumulated origin tries are dropped.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OriginEviction {
    /// Tries live for the whole process, or until `Tracker::reset_origins`.
    #[default]
    Never,
    /// Tries are cleared after every checkpoint dump.
    Checkpoint,
}

impl OriginEviction {
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some(value) if value.trim().eq_ignore_ascii_case("checkpoint") => Self::Checkpoint,
            _ => Self::Never,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub display: DisplayFlags,
    /// Only objects whose type name equals this exactly are observed.
    pub filter: Option<String>,
    pub origin_eviction: OriginEviction,
}

lazy_static::lazy_static! {
    static ref ENV_CONFIG: Config = Config::read_env();
}

impl Config {
    /// Process-wide configuration, read from the environment on first use.
    pub fn from_env() -> Config {
        ENV_CONFIG.clone()
    }

    fn read_env() -> Config {
        let var = |name| std::env::var(name).ok();
        Config {
            display: DisplayFlags::parse(var(DISPLAY_ENV).as_deref()),
            filter: var(FILTER_ENV),
            origin_eviction: OriginEviction::parse(var(ORIGIN_EVICT_ENV).as_deref()),
        }
    }

    pub fn with_display(mut self, display: DisplayFlags) -> Self {
        self.display = display;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_origin_eviction(mut self, eviction: OriginEviction) -> Self {
        self.origin_eviction = eviction;
        self
    }

    pub fn matches(&self, type_name: &str) -> bool {
        match &self.filter {
            Some(filter) => filter == type_name,
            None => true,
        }
    }

    pub fn shows(&self, flags: DisplayFlags) -> bool {
        self.display.contains(flags)
    }

    /// Turns off whatever needs a stack capture the strategy can't provide,
    /// returning one warning line per disabled capability.
    pub fn restrict_to(&mut self, capture: &dyn StackCapture) -> Vec<&'static str> {
        let mut warnings = vec![];
        if capture.is_available() {
            return warnings;
        }
        if self.display.contains(DisplayFlags::BACKTRACE) {
            self.display.remove(DisplayFlags::BACKTRACE);
            warnings.push("Warning: backtrace is not available, stack capture is not built in");
        }
        if self.display.contains(DisplayFlags::ORIGINS) {
            self.display.remove(DisplayFlags::ORIGINS);
            warnings.push("Warning: origin-trace is not available, stack capture is not built in");
        }
        warnings
    }
}
