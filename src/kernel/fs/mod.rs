// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Rendezvous Namespace
//!
//! The slice of a filesystem that Unix-domain sockets and FIFOs need: a flat
//! map from path names to nodes, where each node can carry one attached
//! kernel object (a bound socket, a FIFO's pipe).
//!
//! # Design
//!
//! - **Reader-heavy**: lookups (every connect and send-to) take the map's
//!   read lock; only `mknod`/`unlink` write
//! - **Typed attachments**: a node stores an `Arc<dyn Any>`; owners fetch
//!   it back with [`VNode::attachment`], which downcasts
//! - **Names are not objects**: unlinking a name leaves existing holders of
//!   the node untouched

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use core::any::Any;

use crate::kernel::sync::{RwLock, SpinLock};
use crate::rustux::errors::{Error, Result};

// Import logging macros
use crate::log_debug;

/// Longest accepted path, matching `sun_path`
pub const PATH_MAX: usize = 108;

/// What a node stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VNodeKind {
    /// Unix-domain socket address
    Socket,
    /// Named pipe
    Fifo,
}

type Attachment = Arc<dyn Any + Send + Sync>;

/// A named node
pub struct VNode {
    path: String,
    kind: VNodeKind,
    attachment: SpinLock<Option<Attachment>>,
}

impl VNode {
    fn new(path: &str, kind: VNodeKind) -> Self {
        Self {
            path: String::from(path),
            kind,
            attachment: SpinLock::new(None),
        }
    }

    /// Name the node was created under
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Node kind
    pub fn kind(&self) -> VNodeKind {
        self.kind
    }

    /// Attach `object`, failing if something is already attached
    pub fn attach<T: Any + Send + Sync>(&self, object: Arc<T>) -> Result {
        let mut slot = self.attachment.lock();
        if slot.is_some() {
            return Err(Error::AddrInUse);
        }
        *slot = Some(object);
        Ok(())
    }

    /// Attached object of type `T`, if any
    pub fn attachment<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let slot = self.attachment.lock();
        slot.clone().and_then(|obj| obj.downcast::<T>().ok())
    }

    /// Attached object of type `T`, creating it with `make` when absent
    ///
    /// `make` runs with the node's spinlock held and must not block.
    pub fn attachment_or_insert_with<T, F>(&self, make: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<Arc<T>>,
    {
        let mut slot = self.attachment.lock();
        if let Some(obj) = slot.clone() {
            return obj.downcast::<T>().map_err(|_| Error::WrongType);
        }
        let obj = make()?;
        *slot = Some(obj.clone());
        Ok(obj)
    }

    /// Remove the attachment if it is `object`
    pub fn detach<T: Any + Send + Sync>(&self, object: &Arc<T>) -> bool {
        let mut slot = self.attachment.lock();
        let ours = match slot.as_ref() {
            Some(current) => {
                // Compare data pointers; the vtable half may differ
                core::ptr::eq(
                    Arc::as_ptr(current) as *const u8,
                    Arc::as_ptr(object) as *const u8,
                )
            }
            None => false,
        };
        if ours {
            *slot = None;
        }
        ours
    }

    /// Whether an object is attached
    pub fn is_attached(&self) -> bool {
        self.attachment.lock().is_some()
    }
}

impl core::fmt::Debug for VNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VNode")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Flat path namespace
pub struct Namespace {
    nodes: RwLock<BTreeMap<String, Arc<VNode>>>,
}

impl Namespace {
    /// Create an empty namespace
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(BTreeMap::new()),
        }
    }

    fn check_path(path: &str) -> Result {
        if path.is_empty() || path.len() > PATH_MAX || path.contains('\0') {
            return Err(Error::InvalidArgs);
        }
        Ok(())
    }

    /// Create a node
    ///
    /// # Returns
    ///
    /// - `Err(Error::AlreadyExists)` if the name is taken
    /// - `Err(Error::InvalidArgs)` for an empty or over-long path
    pub fn mknod(&self, path: &str, kind: VNodeKind) -> Result<Arc<VNode>> {
        Self::check_path(path)?;

        let mut nodes = self.nodes.write();
        if nodes.contains_key(path) {
            return Err(Error::AlreadyExists);
        }
        let node = Arc::new(VNode::new(path, kind));
        nodes.insert(String::from(path), node.clone());

        log_debug!("fs: mknod {} ({:?})", path, kind);
        Ok(node)
    }

    /// Resolve a name
    pub fn lookup(&self, path: &str) -> Result<Arc<VNode>> {
        Self::check_path(path)?;
        self.nodes.read().get(path).cloned().ok_or(Error::NotFound)
    }

    /// Remove a name
    pub fn unlink(&self, path: &str) -> Result {
        Self::check_path(path)?;
        match self.nodes.write().remove(path) {
            Some(_) => {
                log_debug!("fs: unlink {}", path);
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    /// Remove `node`'s name if it still refers to `node`
    pub fn unlink_node(&self, node: &Arc<VNode>) -> bool {
        let mut nodes = self.nodes.write();
        let same = nodes
            .get(node.path())
            .is_some_and(|current| Arc::ptr_eq(current, node));
        if same {
            nodes.remove(node.path());
        }
        same
    }

    /// Number of names
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    /// Whether the namespace holds no names
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mknod_lookup_unlink() {
        let ns = Namespace::new();
        let node = ns.mknod("/tmp/sock", VNodeKind::Socket).unwrap();
        assert_eq!(node.kind(), VNodeKind::Socket);
        assert!(Arc::ptr_eq(&ns.lookup("/tmp/sock").unwrap(), &node));

        assert_eq!(ns.mknod("/tmp/sock", VNodeKind::Fifo).err(), Some(Error::AlreadyExists));
        assert_eq!(ns.unlink("/tmp/sock"), Ok(()));
        assert_eq!(ns.lookup("/tmp/sock").err(), Some(Error::NotFound));
        assert!(ns.is_empty());
    }

    #[test]
    fn test_bad_paths() {
        let ns = Namespace::new();
        assert_eq!(ns.mknod("", VNodeKind::Socket).err(), Some(Error::InvalidArgs));
        let long = "x".repeat(PATH_MAX + 1);
        assert_eq!(ns.lookup(&long).err(), Some(Error::InvalidArgs));
    }

    #[test]
    fn test_unlink_node_only_removes_same_node() {
        let ns = Namespace::new();
        let old = ns.mknod("a", VNodeKind::Socket).unwrap();
        ns.unlink("a").unwrap();
        let new = ns.mknod("a", VNodeKind::Socket).unwrap();

        assert!(!ns.unlink_node(&old));
        assert!(ns.unlink_node(&new));
        assert!(ns.is_empty());
    }

    #[test]
    fn test_attachments() {
        let ns = Namespace::new();
        let node = ns.mknod("fifo", VNodeKind::Fifo).unwrap();

        let value = Arc::new(7u32);
        node.attach(value.clone()).unwrap();
        assert_eq!(node.attach(Arc::new(8u32)), Err(Error::AddrInUse));
        assert_eq!(node.attachment::<u32>().as_deref(), Some(&7));
        assert!(node.attachment::<u64>().is_none());

        let again = node
            .attachment_or_insert_with(|| Ok(Arc::new(9u32)))
            .unwrap();
        assert!(Arc::ptr_eq(&again, &value));
        assert_eq!(
            node.attachment_or_insert_with(|| Ok(Arc::new(1u64))).err(),
            Some(Error::WrongType)
        );

        assert!(!node.detach(&Arc::new(7u32)));
        assert!(node.detach(&value));
        assert!(!node.is_attached());
    }
}
