use std::{fmt, sync::Arc};

#[cfg(feature = "backtrace")]
pub use backtrace;
#[cfg(feature = "backtrace")]
use dashmap::DashMap;

/// A single resolved stack frame.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Frame {
    pub name: Arc<str>,
    /// Distance of the instruction pointer from the start of the symbol
    pub offset: usize,
}

impl Frame {
    pub fn new(name: impl Into<Arc<str>>, offset: usize) -> Self {
        Self {
            name: name.into(),
            offset,
        }
    }
}

/// Printable numbered stack, innermost frame first.
pub struct FrameList<'a>(pub &'a [Frame]);

impl fmt::Display for FrameList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, frame) in self.0.iter().enumerate() {
            writeln!(f, "#{i}  {} + [{:#010x}]", frame.name, frame.offset)?;
        }
        Ok(())
    }
}

/// Strategy for capturing the calling thread's stack.
pub trait StackCapture: Send + Sync {
    /// Whether `capture` yields anything at all.
    fn is_available(&self) -> bool {
        true
    }

    /// Frames of the current thread, innermost first.
    fn capture(&self) -> Vec<Frame>;
}

/// The best strategy compiled into this build.
#[cfg(feature = "backtrace")]
pub fn default_capture() -> Box<dyn StackCapture> {
    Box::new(BacktraceCapture::default())
}

/// The best strategy compiled into this build.
#[cfg(not(feature = "backtrace"))]
pub fn default_capture() -> Box<dyn StackCapture> {
    Box::new(NoCapture)
}

/// Used when stack capture is not built in.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCapture;

impl StackCapture for NoCapture {
    fn is_available(&self) -> bool {
        false
    }

    fn capture(&self) -> Vec<Frame> {
        vec![]
    }
}

#[cfg(feature = "backtrace")]
const DEFAULT_MAX_DEPTH: usize = 64;

#[cfg(feature = "backtrace")]
pub struct BacktraceCapture {
    max_depth: usize,
    /// ip -> (symbol name, symbol address)
    symbols: DashMap<usize, (Arc<str>, usize)>,
}

#[cfg(feature = "backtrace")]
impl Default for BacktraceCapture {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

#[cfg(feature = "backtrace")]
impl BacktraceCapture {
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth: max_depth.max(1),
            symbols: DashMap::new(),
        }
    }

    fn resolve(&self, ip: usize) -> (Arc<str>, usize) {
        if let Some(known) = self.symbols.get(&ip) {
            return known.clone();
        }
        let mut name = None;
        let mut addr = None;
        backtrace::resolve(ip as *mut std::ffi::c_void, |symbol| {
            if name.is_none() {
                name = symbol.name().map(|x| format!("{x:#}"));
                addr = symbol.addr().map(|x| x as usize);
            }
        });
        let resolved: (Arc<str>, usize) = (
            Arc::from(name.unwrap_or_else(|| format!("{ip:#x}"))),
            addr.filter(|addr| *addr <= ip).unwrap_or(ip),
        );
        self.symbols.insert(ip, resolved.clone());
        resolved
    }
}

#[cfg(feature = "backtrace")]
fn is_internal(name: &str) -> bool {
    let name = name.strip_prefix('<').unwrap_or(name);
    name.starts_with("object_track::") || name.starts_with("backtrace::")
}

#[cfg(feature = "backtrace")]
impl StackCapture for BacktraceCapture {
    fn capture(&self) -> Vec<Frame> {
        let mut ips = Vec::with_capacity(32);
        backtrace::trace(|frame| {
            ips.push(frame.ip() as usize);
            ips.len() < self.max_depth
        });
        ips.into_iter()
            .filter_map(|ip| {
                let (name, base) = self.resolve(ip);
                if is_internal(&name) {
                    return None;
                }
                Some(Frame {
                    name,
                    offset: ip - base,
                })
            })
            .collect()
    }
}
