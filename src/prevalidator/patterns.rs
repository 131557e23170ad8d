//! Denylist of modules, callables and attributes.
//!
//! The registry is a living denylist. It catches the known escape routes out
//! of a Python namespace; it does not prove that code outside it is safe.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

const DEFAULT_MODULES: &[&str] = &[
    "_thread",
    "asyncio",
    "builtins",
    "code",
    "codeop",
    "ctypes",
    "fcntl",
    "ftplib",
    "gc",
    "glob",
    "http",
    "importlib",
    "inspect",
    "io",
    "marshal",
    "mmap",
    "multiprocessing",
    "nt",
    "os",
    "pathlib",
    "pickle",
    "posix",
    "pty",
    "requests",
    "resource",
    "shelve",
    "shutil",
    "signal",
    "smtplib",
    "socket",
    "subprocess",
    "sys",
    "telnetlib",
    "tempfile",
    "threading",
    "urllib",
    "webbrowser",
];

const DEFAULT_CALLABLES: &[&str] = &[
    "__import__",
    "breakpoint",
    "compile",
    "delattr",
    "eval",
    "exec",
    "exit",
    "getattr",
    "globals",
    "help",
    "input",
    "locals",
    "memoryview",
    "open",
    "quit",
    "setattr",
    "vars",
    "os.execv",
    "os.fork",
    "os.kill",
    "os.popen",
    "os.remove",
    "os.spawnl",
    "os.system",
    "pickle.load",
    "pickle.loads",
    "shutil.rmtree",
    "subprocess.Popen",
    "subprocess.call",
    "subprocess.check_call",
    "subprocess.check_output",
    "subprocess.run",
];

const DEFAULT_ATTRIBUTES: &[&str] = &[
    "__base__",
    "__bases__",
    "__builtins__",
    "__class__",
    "__closure__",
    "__code__",
    "__dict__",
    "__func__",
    "__getattribute__",
    "__globals__",
    "__loader__",
    "__mro__",
    "__reduce__",
    "__reduce_ex__",
    "__self__",
    "__spec__",
    "__subclasses__",
    "co_code",
    "cr_frame",
    "f_back",
    "f_builtins",
    "f_globals",
    "f_locals",
    "gi_code",
    "gi_frame",
    "tb_frame",
];

/// Network modules blocked at runtime when the sandbox has no network
pub const NETWORK_MODULES: &[&str] = &[
    "asyncio",
    "ftplib",
    "http",
    "smtplib",
    "socket",
    "ssl",
    "urllib",
];

fn to_set(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| (*s).to_string()).collect()
}

/// Forbidden names used by the prevalidator and the sandbox harness.
///
/// The three sets must be disjoint; see [`PatternRegistry::validate`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternRegistry {
    modules: BTreeSet<String>,
    callables: BTreeSet<String>,
    attributes: BTreeSet<String>,
}

impl Default for PatternRegistry {
    fn default() -> Self {
        Self {
            modules: to_set(DEFAULT_MODULES),
            callables: to_set(DEFAULT_CALLABLES),
            attributes: to_set(DEFAULT_ATTRIBUTES),
        }
    }
}

impl PatternRegistry {
    /// An empty registry (forbids nothing)
    #[must_use]
    pub fn empty() -> Self {
        Self {
            modules: BTreeSet::new(),
            callables: BTreeSet::new(),
            attributes: BTreeSet::new(),
        }
    }

    /// Add modules to the forbidden set
    #[must_use]
    pub fn extend_modules<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.modules.extend(names.into_iter().map(Into::into));
        self
    }

    /// Add callables to the forbidden set
    #[must_use]
    pub fn extend_callables<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.callables.extend(names.into_iter().map(Into::into));
        self
    }

    /// Add attributes to the forbidden set
    #[must_use]
    pub fn extend_attributes<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes.extend(names.into_iter().map(Into::into));
        self
    }

    /// Replace the forbidden module set
    #[must_use]
    pub fn with_modules<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.modules = names.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the forbidden callable set
    #[must_use]
    pub fn with_callables<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.callables = names.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the forbidden attribute set
    #[must_use]
    pub fn with_attributes<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = names.into_iter().map(Into::into).collect();
        self
    }

    /// Reject overlapping sets
    ///
    /// # Errors
    /// Returns the first name found in more than one set
    pub fn validate(&self) -> Result<(), ConfigError> {
        let overlap = self
            .modules
            .intersection(&self.callables)
            .chain(self.modules.intersection(&self.attributes))
            .chain(self.callables.intersection(&self.attributes))
            .next();
        match overlap {
            Some(name) => Err(ConfigError::OverlappingPatterns(name.clone())),
            None => Ok(()),
        }
    }

    /// Whether a module (or one of its parent packages) is forbidden.
    ///
    /// `os.path` matches when `os` is in the set.
    #[must_use]
    pub fn is_forbidden_module(&self, name: &str) -> bool {
        if self.modules.contains(name) {
            return true;
        }
        name.match_indices('.')
            .any(|(idx, _)| self.modules.contains(&name[..idx]))
    }

    /// Whether a bare or dotted callable name is forbidden
    #[must_use]
    pub fn is_forbidden_callable(&self, name: &str) -> bool {
        self.callables.contains(name)
    }

    /// Whether an attribute name is forbidden
    #[must_use]
    pub fn is_forbidden_attribute(&self, name: &str) -> bool {
        self.attributes.contains(name)
    }

    /// Forbidden modules, sorted
    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.modules.iter().map(String::as_str)
    }

    /// Forbidden callables, sorted
    pub fn callables(&self) -> impl Iterator<Item = &str> {
        self.callables.iter().map(String::as_str)
    }

    /// Forbidden attributes, sorted
    pub fn attributes(&self) -> impl Iterator<Item = &str> {
        self.attributes.iter().map(String::as_str)
    }

    /// Bare (undotted) callables; these are stubbed out of the sandbox builtins
    pub fn builtin_callables(&self) -> impl Iterator<Item = &str> {
        self.callables().filter(|name| !name.contains('.'))
    }
}
