use std::fmt;
use std::io;

/// Errors raised while reading, resolving or linking a package. These always
/// surface to the host before any bytecode from the package runs.
#[derive(Debug)]
pub enum LoadError {
    Io(io::Error),
    UnexpectedEof,
    BadMagic,
    BadFormatVersion { major: u16, minor: u16 },
    BadUtf8,
    Malformed(&'static str),
    /// No package satisfying the dependency was found on the search paths.
    MissingDependency(String),
    /// A package was found but its version is outside the requested range.
    VersionMismatch(String),
    DependencyCycle(String),
    UnresolvedSymbol(String),
    DuplicatePackage(String),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Io(err) => write!(f, "package read failed: {err}"),
            LoadError::UnexpectedEof => f.write_str("package file is truncated"),
            LoadError::BadMagic => f.write_str("not a package file"),
            LoadError::BadFormatVersion { major, minor } => {
                write!(f, "unsupported package format version {major}.{minor}")
            }
            LoadError::BadUtf8 => f.write_str("package string is not valid utf-8"),
            LoadError::Malformed(what) => write!(f, "malformed package: {what}"),
            LoadError::MissingDependency(name) => {
                write!(f, "dependency not found: {name}")
            }
            LoadError::VersionMismatch(what) => write!(f, "version mismatch: {what}"),
            LoadError::DependencyCycle(name) => {
                write!(f, "dependency cycle through {name}")
            }
            LoadError::UnresolvedSymbol(name) => write!(f, "unresolved symbol: {name}"),
            LoadError::DuplicatePackage(name) => {
                write!(f, "package already loaded: {name}")
            }
        }
    }
}

impl std::error::Error for LoadError {}

impl From<io::Error> for LoadError {
    fn from(err: io::Error) -> LoadError {
        LoadError::Io(err)
    }
}

/// Fatal conditions of one invocation. Language-level faults (bad casts,
/// bounds, arithmetic, null, uninitialized reads) are *not* represented
/// here: they become exception blocks on the heap and are only reported as
/// [`VmError::UnhandledException`] if no handler catches them.
#[derive(Debug)]
pub enum VmError {
    Load(LoadError),
    Heap(heap::HeapError),
    UnhandledException {
        /// Defn name of the exception's runtime class.
        class_name: String,
        /// Function names from the faulting frame outward.
        trace: Vec<String>,
    },
    StackOverflow,
    /// A native function's host symbol could not be resolved.
    NativeLink { symbol: String },
    /// Host-side misuse of the API (bad argument count or type).
    BadCall(&'static str),
    /// Internal sanity check failed.
    Assertion(&'static str),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::Load(err) => write!(f, "{err}"),
            VmError::Heap(err) => write!(f, "{err}"),
            VmError::UnhandledException { class_name, trace } => {
                write!(f, "unhandled {class_name}")?;
                for function in trace {
                    write!(f, "\n  at {function}")?;
                }
                Ok(())
            }
            VmError::StackOverflow => f.write_str("stack overflow"),
            VmError::NativeLink { symbol } => {
                write!(f, "native symbol not found: {symbol}")
            }
            VmError::BadCall(what) => write!(f, "bad call: {what}"),
            VmError::Assertion(what) => write!(f, "assertion failed: {what}"),
        }
    }
}

impl std::error::Error for VmError {}

impl From<LoadError> for VmError {
    fn from(err: LoadError) -> VmError {
        VmError::Load(err)
    }
}

impl From<heap::HeapError> for VmError {
    fn from(err: heap::HeapError) -> VmError {
        VmError::Heap(err)
    }
}
