use std::path::PathBuf;

/// Configuration for a [`Writer`](crate::Writer).
///
/// Mirrors the handful of knobs `hpcprof`'s `MetaDB` sink takes at
/// construction time: where to put the database, and whether referenced
/// source files should be copied alongside it.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory the `meta.db` file (and, if `copy_sources` is set, the
    /// `src/` tree of copied source files) is written into.
    ///
    /// `None` runs the writer in dry-run mode: the model is still walked in
    /// full and every invariant is still checked, but no bytes are written
    /// to disk.
    pub output_directory: Option<PathBuf>,

    /// Whether to copy referenced source files into `<output_directory>/src`
    /// the first time each file is registered.
    ///
    /// A copy failure is never fatal: it's logged and the file falls back
    /// to being recorded as uncopied, with its original path.
    pub copy_sources: bool,
}

impl Config {
    /// Creates a configuration that writes `meta.db` into `output_directory`
    /// without copying any source files.
    pub fn new(output_directory: impl Into<PathBuf>) -> Self {
        Self {
            output_directory: Some(output_directory.into()),
            copy_sources: false,
        }
    }

    /// Creates a dry-run configuration: the model is fully validated but
    /// nothing is written to disk.
    pub fn dry_run() -> Self {
        Self {
            output_directory: None,
            copy_sources: false,
        }
    }

    /// Enables copying referenced source files into `<output_directory>/src`.
    pub fn with_copy_sources(mut self, copy_sources: bool) -> Self {
        self.copy_sources = copy_sources;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::dry_run()
    }
}
