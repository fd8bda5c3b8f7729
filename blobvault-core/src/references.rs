//! Depth-first walk over everything a blob references.
//!
//! Children of a backup record are its metadata tree root; children of a
//! metadata node are its subdirectories and, when files are included, its
//! file blobs; a multi-block blob's children are its blocks. Shared
//! subtrees are visited once per path that reaches them.

use crate::blob::BlobType;
use crate::blob_store::BlobStore;
use crate::error::Result;
use crate::hash::Hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobReference {
    pub hash: Hash,
    pub blob_type: BlobType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalOrder {
    /// Children before their parent.
    BottomUp,
    /// Parents before their children; supports [`BlobReferenceIterator::skip_child`].
    TopDown,
}

struct Frame {
    node: BlobReference,
    children: Vec<BlobReference>,
    next: usize,
}

pub struct BlobReferenceIterator<'a> {
    store: &'a BlobStore,
    include_files: bool,
    order: TraversalOrder,
    root: Option<BlobReference>,
    frames: Vec<Frame>,
    pending: Vec<BlobReference>,
    /// Last top-down result, expanded lazily on the next call.
    unexpanded: Option<BlobReference>,
}

impl<'a> BlobReferenceIterator<'a> {
    pub(crate) fn new(
        store: &'a BlobStore,
        root: BlobReference,
        include_files: bool,
        order: TraversalOrder,
    ) -> Self {
        Self {
            store,
            include_files,
            order,
            root: Some(root),
            frames: Vec::new(),
            pending: Vec::new(),
            unexpanded: None,
        }
    }

    /// Do not descend into the reference most recently returned. Only
    /// meaningful top-down; bottom-up the children were already visited.
    pub fn skip_child(&mut self) {
        if self.order == TraversalOrder::TopDown {
            self.unexpanded = None;
        }
    }

    pub async fn next(&mut self) -> Result<Option<BlobReference>> {
        match self.order {
            TraversalOrder::TopDown => self.next_top_down().await,
            TraversalOrder::BottomUp => self.next_bottom_up().await,
        }
    }

    /// Drain the walk into a vector.
    pub async fn collect_all(mut self) -> Result<Vec<BlobReference>> {
        let mut out = Vec::new();
        while let Some(reference) = self.next().await? {
            out.push(reference);
        }
        Ok(out)
    }

    async fn next_top_down(&mut self) -> Result<Option<BlobReference>> {
        if let Some(root) = self.root.take() {
            self.unexpanded = Some(root);
            return Ok(Some(root));
        }
        if let Some(parent) = self.unexpanded.take() {
            let children = self.store.expand_reference(parent, self.include_files).await?;
            self.pending.extend(children.into_iter().rev());
        }
        let next = self.pending.pop();
        self.unexpanded = next;
        Ok(next)
    }

    async fn next_bottom_up(&mut self) -> Result<Option<BlobReference>> {
        if let Some(root) = self.root.take() {
            self.push_frame(root).await?;
        }
        loop {
            let Some(top) = self.frames.last_mut() else {
                return Ok(None);
            };
            if top.next < top.children.len() {
                let child = top.children[top.next];
                top.next += 1;
                self.push_frame(child).await?;
            } else if let Some(frame) = self.frames.pop() {
                return Ok(Some(frame.node));
            }
        }
    }

    async fn push_frame(&mut self, node: BlobReference) -> Result<()> {
        let children = self.store.expand_reference(node, self.include_files).await?;
        self.frames.push(Frame {
            node,
            children,
            next: 0,
        });
        Ok(())
    }
}
