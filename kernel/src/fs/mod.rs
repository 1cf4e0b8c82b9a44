//! In-memory virtual filesystem.
//!
//! A tree of directories, byte-vector files, and device nodes. The core
//! consumes this surface for `open`/`read`/`write`/`readdir`, for the
//! per-thread open-file tables that fork duplicates, and for the block
//! device node under `/dev`. Whatever populates the tree at boot (an
//! initramfs unpacker, tests, the kernel itself) just adds nodes.

pub mod devfs;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

pub const O_RDONLY: u32 = 0x1;
pub const O_WRONLY: u32 = 0x2;
pub const O_RDWR: u32 = O_RDONLY | O_WRONLY;
pub const O_CREAT: u32 = 0x4;

/// Byte-offset read/write surface a device node delegates to.
pub trait DeviceOps: Send + Sync {
    fn read(&self, offset: usize, buf: &mut [u8]) -> KernelResult<usize>;
    fn write(&self, offset: usize, buf: &[u8]) -> KernelResult<usize>;
}

/// What a node is, together with its payload.
pub enum NodeKind {
    Dir(Mutex<Vec<Arc<VfsNode>>>),
    File(Mutex<Vec<u8>>),
    Device(Arc<dyn DeviceOps>),
}

pub struct VfsNode {
    pub name: String,
    pub kind: NodeKind,
}

impl VfsNode {
    pub fn new_dir(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: String::from(name),
            kind: NodeKind::Dir(Mutex::new(Vec::new())),
        })
    }

    pub fn new_file(name: &str, data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            name: String::from(name),
            kind: NodeKind::File(Mutex::new(data)),
        })
    }

    pub fn new_device(name: &str, ops: Arc<dyn DeviceOps>) -> Arc<Self> {
        Arc::new(Self {
            name: String::from(name),
            kind: NodeKind::Device(ops),
        })
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Dir(_))
    }

    /// File size in bytes (0 for directories and devices).
    pub fn size(&self) -> usize {
        match &self.kind {
            NodeKind::File(data) => data.lock().len(),
            _ => 0,
        }
    }

    pub fn find_child(&self, name: &str) -> Option<Arc<VfsNode>> {
        match &self.kind {
            NodeKind::Dir(children) => {
                children.lock().iter().find(|c| c.name == name).cloned()
            }
            _ => None,
        }
    }

    /// Child at position `index` (for readdir).
    pub fn child_at(&self, index: usize) -> Option<Arc<VfsNode>> {
        match &self.kind {
            NodeKind::Dir(children) => children.lock().get(index).cloned(),
            _ => None,
        }
    }

    pub fn add_child(&self, child: Arc<VfsNode>) -> KernelResult<()> {
        match &self.kind {
            NodeKind::Dir(children) => {
                let mut children = children.lock();
                if children.iter().any(|c| c.name == child.name) {
                    return Err(KernelError::InvalidArgument);
                }
                children.push(child);
                Ok(())
            }
            _ => Err(KernelError::InvalidArgument),
        }
    }
}

/// An open-file handle: node, byte offset, open flags. fork duplicates
/// these shallowly, so parent and child share the node but keep separate
/// offsets from the moment of the fork.
#[derive(Clone)]
pub struct OpenFile {
    pub node: Arc<VfsNode>,
    pub offset: usize,
    pub flags: u32,
}

lazy_static::lazy_static! {
    static ref ROOT: Arc<VfsNode> = VfsNode::new_dir("");
}

/// The filesystem root.
pub fn root() -> Arc<VfsNode> {
    ROOT.clone()
}

fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty() && *c != ".")
}

/// Walk a path from the root.
pub fn resolve(path: &str) -> Option<Arc<VfsNode>> {
    let mut node = root();
    for comp in components(path) {
        node = node.find_child(comp)?;
    }
    Some(node)
}

/// Split a path into its parent directory node and final component.
fn resolve_parent(path: &str) -> Option<(Arc<VfsNode>, &str)> {
    let trimmed = path.trim_end_matches('/');
    let last = components(trimmed).last()?;
    let parent_len = trimmed.len() - last.len();
    let parent = resolve(&trimmed[..parent_len])?;
    parent.is_dir().then_some((parent, last))
}

/// Create a directory (parent must exist).
pub fn mkdir(path: &str) -> KernelResult<()> {
    let (parent, name) = resolve_parent(path).ok_or(KernelError::NotFound)?;
    parent.add_child(VfsNode::new_dir(name))
}

/// Create an empty regular file (parent must exist).
pub fn create_file(path: &str) -> KernelResult<Arc<VfsNode>> {
    let (parent, name) = resolve_parent(path).ok_or(KernelError::NotFound)?;
    let node = VfsNode::new_file(name, Vec::new());
    parent.add_child(node.clone())?;
    Ok(node)
}

/// Insert a file with contents (used by whatever populates the boot
/// filesystem).
pub fn add_file(path: &str, data: Vec<u8>) -> KernelResult<Arc<VfsNode>> {
    let (parent, name) = resolve_parent(path).ok_or(KernelError::NotFound)?;
    let node = VfsNode::new_file(name, data);
    parent.add_child(node.clone())?;
    Ok(node)
}

/// Open a path. `O_CREAT` creates a missing regular file when the open is
/// for writing.
pub fn open(path: &str, flags: u32) -> KernelResult<OpenFile> {
    let flags = if flags == 0 { O_RDONLY } else { flags };
    let node = match resolve(path) {
        Some(node) => node,
        None if flags & O_CREAT != 0 && flags & O_WRONLY != 0 => create_file(path)?,
        None => return Err(KernelError::NotFound),
    };
    Ok(OpenFile {
        node,
        offset: 0,
        flags,
    })
}

/// Read from the file's current offset, advancing it.
pub fn read(file: &mut OpenFile, buf: &mut [u8]) -> KernelResult<usize> {
    if file.flags & O_RDONLY == 0 {
        return Err(KernelError::PermissionDenied);
    }
    let n = match &file.node.kind {
        NodeKind::File(data) => {
            let data = data.lock();
            if file.offset >= data.len() {
                0
            } else {
                let n = buf.len().min(data.len() - file.offset);
                buf[..n].copy_from_slice(&data[file.offset..file.offset + n]);
                n
            }
        }
        NodeKind::Device(ops) => ops.read(file.offset, buf)?,
        NodeKind::Dir(_) => return Err(KernelError::InvalidArgument),
    };
    file.offset += n;
    Ok(n)
}

/// Write at the file's current offset, advancing it. Regular files grow
/// (zero-filling any gap) as needed.
pub fn write(file: &mut OpenFile, buf: &[u8]) -> KernelResult<usize> {
    if file.flags & O_WRONLY == 0 {
        return Err(KernelError::PermissionDenied);
    }
    let n = match &file.node.kind {
        NodeKind::File(data) => {
            let mut data = data.lock();
            let end = file.offset + buf.len();
            if data.len() < end {
                data.resize(end, 0);
            }
            data[file.offset..end].copy_from_slice(buf);
            buf.len()
        }
        NodeKind::Device(ops) => ops.write(file.offset, buf)?,
        NodeKind::Dir(_) => return Err(KernelError::InvalidArgument),
    };
    file.offset += n;
    Ok(n)
}

/// Next directory entry name, using the handle's offset as the index.
/// `Ok(None)` signals end of directory.
pub fn readdir(file: &mut OpenFile) -> KernelResult<Option<String>> {
    if !file.node.is_dir() {
        return Err(KernelError::InvalidArgument);
    }
    match file.node.child_at(file.offset) {
        Some(child) => {
            file.offset += 1;
            Ok(Some(child.name.clone()))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    /// Each test builds under a uniquely named directory because the VFS
    /// root is process-global.
    fn fresh_dir(name: &str) -> String {
        let _ = mkdir(&alloc::format!("/{name}"));
        alloc::format!("/{name}")
    }

    #[test]
    fn resolve_walks_nested_directories() {
        let base = fresh_dir("t_resolve");
        mkdir(&alloc::format!("{base}/a")).unwrap();
        mkdir(&alloc::format!("{base}/a/b")).unwrap();
        add_file(&alloc::format!("{base}/a/b/f"), vec![1, 2, 3]).unwrap();

        let node = resolve(&alloc::format!("{base}/a/b/f")).unwrap();
        assert_eq!(node.size(), 3);
        assert!(resolve(&alloc::format!("{base}/a/missing")).is_none());
        // Trailing and doubled slashes are tolerated.
        assert!(resolve(&alloc::format!("{base}//a/b/")).is_some());
    }

    #[test]
    fn open_respects_flags() {
        let base = fresh_dir("t_flags");
        add_file(&alloc::format!("{base}/ro"), vec![9]).unwrap();

        let mut file = open(&alloc::format!("{base}/ro"), O_RDONLY).unwrap();
        assert!(write(&mut file, &[1]).is_err());

        let mut buf = [0u8; 4];
        let mut wr = open(&alloc::format!("{base}/ro"), O_WRONLY).unwrap();
        assert!(read(&mut wr, &mut buf).is_err());

        // Missing file without O_CREAT fails; with it (and write), created.
        assert!(open(&alloc::format!("{base}/new"), O_RDONLY).is_err());
        assert!(open(&alloc::format!("{base}/new"), O_WRONLY | O_CREAT).is_ok());
    }

    #[test]
    fn read_write_track_offsets() {
        let base = fresh_dir("t_rw");
        add_file(&alloc::format!("{base}/f"), Vec::new()).unwrap();

        let mut file = open(&alloc::format!("{base}/f"), O_RDWR).unwrap();
        assert_eq!(write(&mut file, b"hello").unwrap(), 5);
        assert_eq!(write(&mut file, b" world").unwrap(), 6);

        let mut rd = open(&alloc::format!("{base}/f"), O_RDONLY).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(read(&mut rd, &mut buf).unwrap(), 11);
        assert_eq!(&buf[..11], b"hello world");
        // EOF
        assert_eq!(read(&mut rd, &mut buf).unwrap(), 0);
    }

    #[test]
    fn sparse_write_zero_fills() {
        let base = fresh_dir("t_sparse");
        add_file(&alloc::format!("{base}/f"), Vec::new()).unwrap();
        let mut file = open(&alloc::format!("{base}/f"), O_WRONLY).unwrap();
        file.offset = 4;
        write(&mut file, &[0xFF]).unwrap();

        let mut rd = open(&alloc::format!("{base}/f"), O_RDONLY).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(read(&mut rd, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], &[0, 0, 0, 0, 0xFF]);
    }

    #[test]
    fn readdir_enumerates_in_insertion_order() {
        let base = fresh_dir("t_readdir");
        add_file(&alloc::format!("{base}/one"), Vec::new()).unwrap();
        add_file(&alloc::format!("{base}/two"), Vec::new()).unwrap();

        let mut dir = open(&base, O_RDONLY).unwrap();
        assert_eq!(readdir(&mut dir).unwrap().as_deref(), Some("one"));
        assert_eq!(readdir(&mut dir).unwrap().as_deref(), Some("two"));
        assert_eq!(readdir(&mut dir).unwrap(), None);

        let mut file = open(&alloc::format!("{base}/one"), O_RDONLY).unwrap();
        assert!(readdir(&mut file).is_err());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let base = fresh_dir("t_dup");
        add_file(&alloc::format!("{base}/f"), Vec::new()).unwrap();
        assert!(add_file(&alloc::format!("{base}/f"), Vec::new()).is_err());
        assert!(mkdir(&alloc::format!("{base}/f")).is_err());
    }

    #[test]
    fn open_file_clone_shares_node_not_offset() {
        let base = fresh_dir("t_clone");
        add_file(&alloc::format!("{base}/f"), vec![1, 2, 3, 4]).unwrap();
        let mut a = open(&alloc::format!("{base}/f"), O_RDONLY).unwrap();
        let mut buf = [0u8; 2];
        read(&mut a, &mut buf).unwrap();

        let mut b = a.clone();
        assert_eq!(b.offset, 2);
        read(&mut b, &mut buf).unwrap();
        assert_eq!(b.offset, 4);
        // The original handle's offset is unaffected by the clone's reads.
        assert_eq!(a.offset, 2);
    }
}
