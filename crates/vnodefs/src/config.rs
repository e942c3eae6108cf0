//! Mount-time configuration for a volume.

/// Longest backend path, including the terminator slot.
pub const DEFAULT_MAX_PATH_LEN: usize = 1024;

/// Bound on ancestor walks (path building, lock chains).
pub const DEFAULT_MAX_TREE_DEPTH: usize = 1024;

/// I/O size advertised in volume info.
pub const DEFAULT_IO_SIZE: u32 = 64 * 1024;

/// Configuration consumed when a volume is mounted.
///
/// # Example
///
/// ```
/// use vnodefs::MountConfig;
///
/// let config = MountConfig::stable_ids().with_volume_name("scratch");
/// assert!(config.use_node_ids);
/// assert_eq!(config.volume_name.as_deref(), Some("scratch"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountConfig {
    /// Treat the backend's `st_ino` values as globally stable node ids.
    ///
    /// When false, ids are synthesized from a local counter. Synthesized ids
    /// are not persisted; the graph is rebuilt from scratch on every mount.
    pub use_node_ids: bool,

    pub max_tree_depth: usize,

    pub max_path_len: usize,

    /// Overrides the derived `"<fs name> Volume"` name.
    pub volume_name: Option<String>,

    pub io_size: u32,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            use_node_ids: false,
            max_tree_depth: DEFAULT_MAX_TREE_DEPTH,
            max_path_len: DEFAULT_MAX_PATH_LEN,
            volume_name: None,
            io_size: DEFAULT_IO_SIZE,
        }
    }
}

impl MountConfig {
    /// Backend ids are globally stable; use them as node ids.
    pub fn stable_ids() -> Self {
        Self {
            use_node_ids: true,
            ..Self::default()
        }
    }

    /// Synthesize node ids locally (the default).
    pub fn synthesized_ids() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_node_ids(mut self, use_node_ids: bool) -> Self {
        self.use_node_ids = use_node_ids;
        self
    }

    #[must_use]
    pub fn with_max_tree_depth(mut self, depth: usize) -> Self {
        self.max_tree_depth = depth.max(1);
        self
    }

    #[must_use]
    pub fn with_max_path_len(mut self, len: usize) -> Self {
        self.max_path_len = len.max(2);
        self
    }

    #[must_use]
    pub fn with_volume_name(mut self, name: impl Into<String>) -> Self {
        self.volume_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_io_size(mut self, io_size: u32) -> Self {
        self.io_size = io_size;
        self
    }

    /// Volume name for a filesystem called `fs_name`.
    pub fn volume_name_for(&self, fs_name: &str) -> String {
        self.volume_name
            .clone()
            .unwrap_or_else(|| format!("{fs_name} Volume"))
    }
}
