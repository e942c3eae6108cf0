//! Plain data types shared by the graph, the backends and the kernel layer.

use bitflags::bitflags;

/// Stable identity of a node as seen by the kernel.
pub type NodeId = u64;

/// Id of the root node when ids are synthesized locally (FUSE convention).
pub const ROOT_NODE_ID: NodeId = 1;

const fn mode_bits(bits: libc::mode_t) -> u32 {
    bits as u32
}

const S_IFMT: u32 = mode_bits(libc::S_IFMT);
const S_IFREG: u32 = mode_bits(libc::S_IFREG);
const S_IFDIR: u32 = mode_bits(libc::S_IFDIR);
const S_IFLNK: u32 = mode_bits(libc::S_IFLNK);
const S_IFCHR: u32 = mode_bits(libc::S_IFCHR);
const S_IFBLK: u32 = mode_bits(libc::S_IFBLK);
const S_IFIFO: u32 = mode_bits(libc::S_IFIFO);
const S_IFSOCK: u32 = mode_bits(libc::S_IFSOCK);

/// File type of a node, derived from the `S_IFMT` bits of a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    File,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
    /// Backend did not report a type; must be resolved through getattr.
    Unknown,
}

impl NodeType {
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFREG => NodeType::File,
            S_IFDIR => NodeType::Directory,
            S_IFLNK => NodeType::Symlink,
            S_IFCHR => NodeType::CharDevice,
            S_IFBLK => NodeType::BlockDevice,
            S_IFIFO => NodeType::Fifo,
            S_IFSOCK => NodeType::Socket,
            _ => NodeType::Unknown,
        }
    }

    /// The `S_IFMT` bits for this type (0 for `Unknown`).
    pub fn mode_bits(self) -> u32 {
        match self {
            NodeType::File => S_IFREG,
            NodeType::Directory => S_IFDIR,
            NodeType::Symlink => S_IFLNK,
            NodeType::CharDevice => S_IFCHR,
            NodeType::BlockDevice => S_IFBLK,
            NodeType::Fifo => S_IFIFO,
            NodeType::Socket => S_IFSOCK,
            NodeType::Unknown => 0,
        }
    }

    pub fn is_dir(self) -> bool {
        self == NodeType::Directory
    }

    pub fn is_file(self) -> bool {
        self == NodeType::File
    }

    /// Short label for listings.
    pub fn label(self) -> &'static str {
        match self {
            NodeType::File => "file",
            NodeType::Directory => "dir",
            NodeType::Symlink => "symlink",
            NodeType::CharDevice => "chr",
            NodeType::BlockDevice => "blk",
            NodeType::Fifo => "fifo",
            NodeType::Socket => "sock",
            NodeType::Unknown => "?",
        }
    }
}

/// Seconds/nanoseconds timestamp as carried in `struct stat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: u32,
}

impl Timespec {
    pub const fn new(sec: i64, nsec: u32) -> Self {
        Self { sec, nsec }
    }
}

/// Attributes of a backend object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileStat {
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub blksize: u32,
    pub blocks: u64,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
}

impl FileStat {
    pub fn node_type(&self) -> NodeType {
        NodeType::from_mode(self.mode)
    }

    /// Convenience constructor: type bits plus permission bits.
    pub fn with_type(ino: u64, node_type: NodeType, perm: u32) -> Self {
        Self {
            ino,
            mode: node_type.mode_bits() | (perm & 0o7777),
            nlink: if node_type.is_dir() { 2 } else { 1 },
            blksize: 4096,
            ..Self::default()
        }
    }
}

bitflags! {
    /// Attribute fields touched by `write_stat` or reported in a stat-changed event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StatFields: u32 {
        const MODE = 1 << 0;
        const UID = 1 << 1;
        const GID = 1 << 2;
        const SIZE = 1 << 3;
        const ATIME = 1 << 4;
        const MTIME = 1 << 5;
    }
}

/// Filesystem statistics as reported by a backend's statfs hook.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatVfs {
    pub block_size: u64,
    pub fragment_size: u64,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub name_max: u32,
}

/// Volume information handed to the kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsInfo {
    /// Backends give no durability hint; volumes are assumed persistent.
    pub persistent: bool,
    pub block_size: u64,
    pub io_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub total_nodes: u64,
    pub free_nodes: u64,
    pub volume_name: String,
}

/// One entry produced by a directory read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub node_id: NodeId,
    pub name: String,
    pub node_type: NodeType,
    /// Record length the entry occupies in a dirent buffer.
    pub reclen: u16,
}

/// Attribute holding a MIME type, per the shared-mime-info xattr convention.
pub const MIME_TYPE_ATTR: &str = "user.mime_type";

/// Kind of value an extended attribute holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrType {
    Raw,
    MimeString,
}

impl AttrType {
    pub fn for_name(name: &str) -> Self {
        if name == MIME_TYPE_ATTR {
            AttrType::MimeString
        } else {
            AttrType::Raw
        }
    }
}

/// Result of reading an open attribute's stat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrStat {
    pub size: u64,
    pub attr_type: AttrType,
}
