//! In-memory model of one WIM image: a tree of directory entries sharing
//! inodes.
//!
//! Dentries own their children; a hard-link group's dentries share one
//! inode by index. Nothing here owns a stream — inode stream slots hold
//! [`StreamRef`]s resolved against the archive's stream table per
//! operation, so no ownership cycles arise.

use wim_dtyp::{FileTime, WideString};
use wim_fscc::{FileAttributes, ReparseTag};

use crate::Result;
use crate::backend::UnixData;
use crate::streams::StreamRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DentryId(pub(crate) u32);

impl DentryId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeId(pub(crate) u32);

impl InodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A named alternate data stream slot.
#[derive(Debug, Clone, Default)]
pub struct AdsEntry {
    pub name: WideString,
    pub stream: StreamRef,
}

impl AdsEntry {
    /// Entries with empty names carry unnamed-stream data in some WIM
    /// layouts; only actually-named entries are ADS for extraction.
    pub fn is_named(&self) -> bool {
        !self.name.is_empty()
    }
}

/// File metadata shared by every dentry in a hard-link group.
#[derive(Debug, Clone)]
pub struct Inode {
    pub attributes: FileAttributes,
    pub creation_time: FileTime,
    pub last_write_time: FileTime,
    pub last_access_time: FileTime,
    /// Index into the image's [`SecurityData`](crate::SecurityData), or -1.
    pub security_id: i32,
    pub reparse_tag: ReparseTag,
    /// Set when the archive recorded this reparse target as not
    /// root-relative, exempting it from fixup.
    pub not_rpfixed: bool,
    pub unix_data: Option<UnixData>,
    pub unnamed_stream: StreamRef,
    pub ads: Vec<AdsEntry>,
    /// Number of dentries referencing this inode; maintained by
    /// [`Image::add_child`].
    pub nlink: u32,
}

impl Default for Inode {
    fn default() -> Self {
        Self {
            attributes: FileAttributes::new(),
            creation_time: FileTime::default(),
            last_write_time: FileTime::default(),
            last_access_time: FileTime::default(),
            security_id: -1,
            reparse_tag: ReparseTag::default(),
            not_rpfixed: false,
            unix_data: None,
            unnamed_stream: StreamRef::Empty,
            ads: Vec::new(),
            nlink: 0,
        }
    }
}

impl Inode {
    pub fn is_directory(&self) -> bool {
        self.attributes.directory()
    }

    pub fn is_reparse_point(&self) -> bool {
        self.attributes.reparse_point()
    }

    /// Symbolic links and junctions both extract as symlinks on volumes
    /// without generic reparse-point support.
    pub fn is_symlink(&self) -> bool {
        self.is_reparse_point() && self.reparse_tag.is_link()
    }

    /// Encrypted directories have no unnamed data stream worth extracting.
    pub fn is_encrypted_directory(&self) -> bool {
        self.attributes.encrypted() && self.is_directory()
    }

    pub fn has_named_stream(&self) -> bool {
        self.ads.iter().any(AdsEntry::is_named)
    }
}

/// A node in the image's directory tree.
#[derive(Debug, Clone)]
pub struct Dentry {
    pub name: WideString,
    /// Short (DOS, 8.3) name, empty when absent.
    pub short_name: WideString,
    pub parent: DentryId,
    pub children: Vec<DentryId>,
    pub inode: InodeId,
    /// Siblings whose names collide with this one case-insensitively,
    /// precomputed at tree-build time for case-insensitive targets.
    pub case_conflicts: Vec<DentryId>,
}

/// One image's directory tree plus its security-descriptor table.
#[derive(Debug)]
pub struct Image {
    dentries: Vec<Dentry>,
    inodes: Vec<Inode>,
    pub security: crate::SecurityData,
}

impl Image {
    pub const ROOT: DentryId = DentryId(0);

    /// Creates an image whose root directory has the given inode
    /// metadata. The root dentry has no name.
    pub fn new(mut root_inode: Inode) -> Self {
        root_inode.nlink = 1;
        Self {
            dentries: vec![Dentry {
                name: WideString::default(),
                short_name: WideString::default(),
                parent: Self::ROOT,
                children: Vec::new(),
                inode: InodeId(0),
                case_conflicts: Vec::new(),
            }],
            inodes: vec![root_inode],
            security: crate::SecurityData::default(),
        }
    }

    pub fn root(&self) -> DentryId {
        Self::ROOT
    }

    pub fn add_inode(&mut self, inode: Inode) -> InodeId {
        let id = InodeId(self.inodes.len() as u32);
        self.inodes.push(inode);
        id
    }

    /// Adds a child dentry under `parent`, bumping the inode's link count
    /// and recording case-insensitive name conflicts among the siblings.
    pub fn add_child(
        &mut self,
        parent: DentryId,
        name: impl Into<WideString>,
        inode: InodeId,
    ) -> DentryId {
        let name = name.into();
        let id = DentryId(self.dentries.len() as u32);

        let mut conflicts = Vec::new();
        for &sibling in &self.dentries[parent.index()].children {
            if self.dentries[sibling.index()].name.eq_ignore_case(&name) {
                conflicts.push(sibling);
            }
        }
        for &sibling in &conflicts {
            self.dentries[sibling.index()].case_conflicts.push(id);
        }

        self.dentries.push(Dentry {
            name,
            short_name: WideString::default(),
            parent,
            children: Vec::new(),
            inode,
            case_conflicts: conflicts,
        });
        self.dentries[parent.index()].children.push(id);
        self.inodes[inode.index()].nlink += 1;
        id
    }

    pub fn set_short_name(&mut self, dentry: DentryId, short_name: impl Into<WideString>) {
        self.dentries[dentry.index()].short_name = short_name.into();
    }

    pub fn dentry(&self, id: DentryId) -> &Dentry {
        &self.dentries[id.index()]
    }

    pub fn inode(&self, id: InodeId) -> &Inode {
        &self.inodes[id.index()]
    }

    /// Mutable inode access, for tree builders filling in metadata after
    /// [`add_inode`](Self::add_inode).
    pub fn inode_mut(&mut self, id: InodeId) -> &mut Inode {
        &mut self.inodes[id.index()]
    }

    pub fn inode_of(&self, dentry: DentryId) -> &Inode {
        self.inode(self.dentry(dentry).inode)
    }

    pub fn dentry_count(&self) -> usize {
        self.dentries.len()
    }

    pub fn inode_count(&self) -> usize {
        self.inodes.len()
    }

    /// Resolves a canonical image-internal path. Both separators are
    /// accepted; leading and trailing separators are ignored; the empty
    /// path is the root. Name comparison is case-sensitive.
    pub fn get_dentry(&self, path: &str) -> Option<DentryId> {
        let mut current = Self::ROOT;
        for component in path.split(['/', '\\']).filter(|c| !c.is_empty()) {
            current = *self.dentries[current.index()]
                .children
                .iter()
                .find(|&&c| self.dentries[c.index()].name == component)?;
        }
        Some(current)
    }

    /// Image-internal path of a dentry, for messages.
    pub fn full_path(&self, id: DentryId) -> String {
        let mut components = Vec::new();
        let mut current = id;
        while current != Self::ROOT {
            let dentry = self.dentry(current);
            components.push(dentry.name.to_string_lossy());
            current = dentry.parent;
        }
        if components.is_empty() {
            return "/".into();
        }
        components
            .iter()
            .rev()
            .fold(String::new(), |acc, c| acc + "/" + c)
    }

    /// Pre-order walk of the subtree at `root`: every dentry before its
    /// children, so parents exist before anything inside them.
    pub fn walk_pre(
        &self,
        root: DentryId,
        f: &mut dyn FnMut(&Image, DentryId) -> Result<()>,
    ) -> Result<()> {
        f(self, root)?;
        for i in 0..self.dentry(root).children.len() {
            self.walk_pre(self.dentry(root).children[i], f)?;
        }
        Ok(())
    }

    /// Post-order walk: every dentry after its children. Finalization
    /// runs in this order so directory timestamps survive child writes.
    pub fn walk_post(
        &self,
        root: DentryId,
        f: &mut dyn FnMut(&Image, DentryId) -> Result<()>,
    ) -> Result<()> {
        for i in 0..self.dentry(root).children.len() {
            self.walk_post(self.dentry(root).children[i], f)?;
        }
        f(self, root)
    }
}
