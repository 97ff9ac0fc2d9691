//! Request tree construction and commit
//!
//! A [`Request`] is built bottom-up from [`Request::byte`] with typed
//! constructors (contiguous, vector, indexed, struct, ...). Subtrees are
//! reference counted and may be shared between parents. Before a request
//! is walked or sent anywhere it is committed into a [`RequestTree`], a flat
//! arena where every distinct node appears once and references are indices.

use crate::{RequestError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Index of a node inside a [`RequestTree`]
pub type NodeIndex = u32;

/// One node of a request tree under construction
#[derive(Debug, Clone)]
pub struct RequestNode {
    /// Displacement of the first block relative to the enclosing repetition
    pub offset: i64,
    /// Element repetitions per block
    pub num_elements: u64,
    /// Number of blocks
    pub block_count: u64,
    /// Distance between block starts
    pub stride: i64,
    /// Lower bound of one repetition
    pub lb: i64,
    /// Upper bound of one repetition
    pub ub: i64,
    /// Bytes touched by one repetition
    pub aggregate_size: u64,
    /// Contiguous pieces touched by one repetition
    pub contiguous_chunks: u64,
    /// Levels from this node down to raw bytes
    pub depth: u32,
    /// Nodes nested below this one
    pub nested_count: u32,
    /// Element type; `None` for raw bytes
    pub element: Option<Request>,
    /// Next node in a sequence chain
    pub sequence_next: Option<Request>,
}

/// Shared handle to a request tree node
#[derive(Debug, Clone)]
pub struct Request(Arc<RequestNode>);

impl Request {
    /// A single raw byte
    pub fn byte() -> Self {
        Self(Arc::new(RequestNode {
            offset: 0,
            num_elements: 1,
            block_count: 0,
            stride: 1,
            lb: 0,
            ub: 1,
            aggregate_size: 1,
            contiguous_chunks: 1,
            depth: 1,
            nested_count: 0,
            element: None,
            sequence_next: None,
        }))
    }

    /// `count` consecutive copies of `old`
    pub fn contiguous(count: u64, old: &Self) -> Result<Self> {
        Self::hvector(1, count, 0, old)
    }

    /// `count` blocks of `block_len` elements, stride counted in extents of `old`
    pub fn vector(count: u64, block_len: u64, stride: i64, old: &Self) -> Result<Self> {
        Self::hvector(count, block_len, stride * old.extent(), old)
    }

    /// `count` blocks of `block_len` elements, stride in bytes
    pub fn hvector(count: u64, block_len: u64, stride: i64, old: &Self) -> Result<Self> {
        check_count("count", count)?;
        check_count("block length", block_len)?;
        let mut node = subrequest(0, block_len, stride, count, old);
        if stride < 0 {
            node.lb = (count as i64 - 1) * stride;
        }
        Ok(Self(Arc::new(node)))
    }

    /// Blocks at displacements counted in extents of `old`
    pub fn indexed(block_lens: &[u64], displacements: &[i64], old: &Self) -> Result<Self> {
        let extent = old.extent();
        let scaled: Vec<i64> = displacements.iter().map(|d| d * extent).collect();
        Self::hindexed(block_lens, &scaled, old)
    }

    /// Blocks at byte displacements
    pub fn hindexed(block_lens: &[u64], displacements: &[i64], old: &Self) -> Result<Self> {
        let olds = vec![old.clone(); block_lens.len()];
        Self::structure(block_lens, displacements, &olds)
    }

    /// Blocks of differing element types at byte displacements
    pub fn structure(block_lens: &[u64], displacements: &[i64], olds: &[Self]) -> Result<Self> {
        if block_lens.is_empty() {
            return Err(RequestError::InvalidRequest(
                "block list must not be empty".to_string(),
            ));
        }
        if block_lens.len() != displacements.len() || block_lens.len() != olds.len() {
            return Err(RequestError::InvalidRequest(format!(
                "mismatched block lists: {} lengths, {} displacements, {} types",
                block_lens.len(),
                displacements.len(),
                olds.len()
            )));
        }
        for len in block_lens {
            check_count("block length", *len)?;
        }

        let mut head: Option<Self> = None;
        for i in (0..block_lens.len()).rev() {
            let mut node = subrequest(displacements[i], block_lens[i], 0, 1, &olds[i]);
            if let Some(next) = &head {
                let next_node = next.node();
                node.lb = node.lb.min(next_node.lb);
                node.ub = node.ub.max(next_node.ub);
                node.depth = node.depth.max(next_node.depth);
                node.aggregate_size += next_node.aggregate_size;
                node.contiguous_chunks += next_node.contiguous_chunks;
                node.nested_count += next_node.nested_count + 1;
                if let (Some(mine), Some(theirs)) = (&node.element, &next_node.element) {
                    if mine.ptr_eq(theirs) {
                        node.nested_count -= mine.node().nested_count + 1;
                    }
                }
            }
            node.sequence_next = head.take();
            head = Some(Self(Arc::new(node)));
        }
        head.ok_or_else(|| RequestError::InvalidRequest("empty block list".to_string()))
    }

    pub fn node(&self) -> &RequestNode {
        &self.0
    }

    /// Span of one repetition, `ub - lb`
    pub fn extent(&self) -> i64 {
        self.0.ub - self.0.lb
    }

    pub fn aggregate_size(&self) -> u64 {
        self.0.aggregate_size
    }

    pub fn depth(&self) -> u32 {
        self.0.depth
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Flatten into an index-addressed arena, sharing preserved.
    ///
    /// Nodes are laid out in pre-order (node, element subtree, sequence
    /// chain); a node reachable from several parents is stored once.
    pub fn commit(&self) -> RequestTree {
        let mut index_of: HashMap<*const RequestNode, NodeIndex> = HashMap::new();
        let mut order: Vec<&Self> = Vec::new();
        let mut pending = vec![self];

        while let Some(request) = pending.pop() {
            let key = Arc::as_ptr(&request.0);
            if index_of.contains_key(&key) {
                continue;
            }
            index_of.insert(key, order.len() as NodeIndex);
            order.push(request);
            // sequence pushed first so the element subtree is laid out first
            if let Some(next) = &request.0.sequence_next {
                pending.push(next);
            }
            if let Some(element) = &request.0.element {
                pending.push(element);
            }
        }

        let lookup = |r: &Option<Self>| r.as_ref().map(|r| index_of[&Arc::as_ptr(&r.0)]);
        let nodes: Vec<CommittedNode> = order
            .iter()
            .map(|request| {
                let n = request.node();
                CommittedNode {
                    offset: n.offset,
                    num_elements: n.num_elements,
                    block_count: n.block_count,
                    stride: n.stride,
                    lb: n.lb,
                    ub: n.ub,
                    aggregate_size: n.aggregate_size,
                    contiguous_chunks: n.contiguous_chunks,
                    depth: n.depth,
                    nested_count: n.nested_count,
                    element: lookup(&n.element),
                    sequence_next: lookup(&n.sequence_next),
                }
            })
            .collect();
        trace!(nodes = nodes.len(), depth = self.depth(), "committed request");
        RequestTree { nodes }
    }
}

fn check_count(what: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(RequestError::InvalidRequest(format!("{what} must be > 0")));
    }
    Ok(())
}

/// `count` blocks of `block_len` copies of `old`, `stride` bytes apart
fn subrequest(offset: i64, block_len: u64, stride: i64, count: u64, old: &Request) -> RequestNode {
    let old_node = old.node();
    let old_extent = old.extent();
    let block_bytes = block_len as i64 * old_node.aggregate_size as i64;
    let contiguous_chunks = if old_node.aggregate_size as i64 != old_extent {
        old_node.contiguous_chunks * count * block_len
    } else if stride != block_bytes && stride != -block_bytes {
        count
    } else {
        1
    };
    RequestNode {
        offset,
        num_elements: block_len,
        block_count: count,
        stride,
        lb: offset,
        ub: offset + (count as i64 - 1) * stride + block_len as i64 * old_extent,
        aggregate_size: old_node.aggregate_size * count * block_len,
        contiguous_chunks,
        depth: old_node.depth + 1,
        nested_count: old_node.nested_count + 1,
        element: Some(old.clone()),
        sequence_next: None,
    }
}

/// A committed node; references are arena indices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedNode {
    pub offset: i64,
    pub num_elements: u64,
    pub block_count: u64,
    pub stride: i64,
    pub lb: i64,
    pub ub: i64,
    pub aggregate_size: u64,
    pub contiguous_chunks: u64,
    pub depth: u32,
    pub nested_count: u32,
    pub element: Option<NodeIndex>,
    pub sequence_next: Option<NodeIndex>,
}

impl CommittedNode {
    pub const fn extent(&self) -> i64 {
        self.ub - self.lb
    }

    /// One repetition touches every byte of its extent in a single run
    pub const fn is_dense(&self) -> bool {
        self.aggregate_size as i64 == self.extent() && self.contiguous_chunks == 1
    }
}

/// Flattened request; node 0 is the root
///
/// Serialized as its node list; deserializing validates the arena.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<CommittedNode>", into = "Vec<CommittedNode>")]
pub struct RequestTree {
    nodes: Vec<CommittedNode>,
}

impl RequestTree {
    /// `len` contiguous bytes
    pub fn contiguous(len: u64) -> Result<Self> {
        Ok(Request::contiguous(len, &Request::byte())?.commit())
    }

    /// Rebuild from decoded nodes, validating references
    pub fn from_nodes(nodes: Vec<CommittedNode>) -> Result<Self> {
        let tree = Self { nodes };
        tree.validate()?;
        Ok(tree)
    }

    pub fn nodes(&self) -> &[CommittedNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub const fn root_index(&self) -> NodeIndex {
        0
    }

    /// Root node; callers must hold a validated, non-empty tree
    pub fn root(&self) -> &CommittedNode {
        &self.nodes[0]
    }

    pub fn node(&self, index: NodeIndex) -> &CommittedNode {
        &self.nodes[index as usize]
    }

    pub fn depth(&self) -> u32 {
        self.root().depth
    }

    pub fn aggregate_size(&self) -> u64 {
        self.root().aggregate_size
    }

    pub fn extent(&self) -> i64 {
        self.root().extent()
    }

    /// Sum of offsets down the element chain below `index`
    pub fn displacement(&self, index: NodeIndex) -> i64 {
        let mut disp = 0;
        let mut cursor = self.node(index).element;
        while let Some(i) = cursor {
            let node = self.node(i);
            disp += node.offset;
            cursor = node.element;
        }
        disp
    }

    /// Check that the arena is a well-formed DAG the walker can traverse.
    ///
    /// Every reference must be in range, element types must be strictly
    /// shallower than their parent and sequence chains must not loop.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(RequestError::CorruptArena("no nodes".to_string()));
        }
        let len = self.nodes.len();
        for (i, node) in self.nodes.iter().enumerate() {
            if node.depth == 0 {
                return Err(RequestError::CorruptArena(format!("node {i} has depth 0")));
            }
            if let Some(e) = node.element {
                let element = self.nodes.get(e as usize).ok_or_else(|| {
                    RequestError::CorruptArena(format!("node {i} element {e} out of range"))
                })?;
                if element.depth >= node.depth {
                    return Err(RequestError::CorruptArena(format!(
                        "node {i} element {e} is not shallower"
                    )));
                }
            }
            if let Some(s) = node.sequence_next {
                if s as usize >= len {
                    return Err(RequestError::CorruptArena(format!(
                        "node {i} sequence {s} out of range"
                    )));
                }
            }
        }
        // 0 unvisited, 1 on the current chain, 2 known to terminate
        let mut mark = vec![0u8; len];
        for start in 0..len {
            let mut cursor = Some(start as NodeIndex);
            while let Some(i) = cursor {
                match mark[i as usize] {
                    2 => break,
                    1 => {
                        return Err(RequestError::CorruptArena(format!(
                            "sequence chain through node {i} loops"
                        )));
                    }
                    _ => {}
                }
                mark[i as usize] = 1;
                cursor = self.nodes[i as usize].sequence_next;
            }
            let mut cursor = Some(start as NodeIndex);
            while let Some(i) = cursor {
                if mark[i as usize] == 2 {
                    break;
                }
                mark[i as usize] = 2;
                cursor = self.nodes[i as usize].sequence_next;
            }
        }
        if self.aggregate_size() == 0 {
            return Err(RequestError::InvalidRequest(
                "request touches no bytes".to_string(),
            ));
        }
        Ok(())
    }
}

impl TryFrom<Vec<CommittedNode>> for RequestTree {
    type Error = RequestError;

    fn try_from(nodes: Vec<CommittedNode>) -> Result<Self> {
        Self::from_nodes(nodes)
    }
}

impl From<RequestTree> for Vec<CommittedNode> {
    fn from(tree: RequestTree) -> Self {
        tree.nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_primitive() {
        let byte = Request::byte();
        assert_eq!(byte.extent(), 1);
        assert_eq!(byte.aggregate_size(), 1);
        assert_eq!(byte.depth(), 1);
        assert!(byte.node().element.is_none());
    }

    #[test]
    fn test_contiguous_statistics() {
        let req = Request::contiguous(300, &Request::byte()).unwrap();
        let node = req.node();
        assert_eq!(node.lb, 0);
        assert_eq!(node.ub, 300);
        assert_eq!(node.aggregate_size, 300);
        assert_eq!(node.contiguous_chunks, 1);
        assert_eq!(node.depth, 2);
    }

    #[test]
    fn test_hvector_statistics() {
        let req = Request::hvector(4, 10, 30, &Request::byte()).unwrap();
        let node = req.node();
        assert_eq!(node.ub, 100);
        assert_eq!(node.aggregate_size, 40);
        assert_eq!(node.contiguous_chunks, 4);
        assert_eq!(req.extent(), 100);

        // stride equal to block size collapses to one chunk
        let dense = Request::hvector(4, 10, 10, &Request::byte()).unwrap();
        assert_eq!(dense.node().contiguous_chunks, 1);
    }

    #[test]
    fn test_negative_stride_lower_bound() {
        let req = Request::hvector(3, 4, -10, &Request::byte()).unwrap();
        assert_eq!(req.node().lb, -20);
        assert_eq!(req.node().ub, 4 - 20);
    }

    #[test]
    fn test_vector_scales_stride_by_extent() {
        let elem = Request::contiguous(8, &Request::byte()).unwrap();
        let req = Request::vector(2, 1, 3, &elem).unwrap();
        assert_eq!(req.node().stride, 24);
        assert_eq!(req.aggregate_size(), 16);
    }

    #[test]
    fn test_hindexed_chain_statistics() {
        let byte = Request::byte();
        let req = Request::hindexed(&[10, 20], &[100, 0], &byte).unwrap();
        let head = req.node();
        assert_eq!(head.lb, 0);
        assert_eq!(head.ub, 110);
        assert_eq!(head.aggregate_size, 30);
        assert_eq!(head.contiguous_chunks, 2);
        let next = head.sequence_next.as_ref().unwrap();
        assert_eq!(next.node().offset, 0);
        assert_eq!(next.aggregate_size(), 20);
        // shared element type is not counted twice
        assert_eq!(head.nested_count, 2);
    }

    #[test]
    fn test_constructor_errors() {
        let byte = Request::byte();
        assert!(Request::contiguous(0, &byte).is_err());
        assert!(Request::hvector(0, 1, 1, &byte).is_err());
        assert!(Request::hindexed(&[], &[], &byte).is_err());
        assert!(Request::hindexed(&[1, 2], &[0], &byte).is_err());
        assert!(Request::hindexed(&[0], &[0], &byte).is_err());
    }

    #[test]
    fn test_commit_preserves_sharing() {
        let byte = Request::byte();
        let elem = Request::contiguous(4, &byte).unwrap();
        let req = Request::structure(&[1, 2], &[0, 16], &[elem.clone(), elem]).unwrap();
        let tree = req.commit();
        // head, elem, byte, second chain node
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.root().element, Some(1));
        assert_eq!(tree.node(1).element, Some(2));
        assert_eq!(tree.root().sequence_next, Some(3));
        assert_eq!(tree.node(3).element, Some(1));
        tree.validate().unwrap();
    }

    #[test]
    fn test_displacement_sums_element_offsets() {
        let byte = Request::byte();
        let inner = Request::hindexed(&[4], &[8], &byte).unwrap();
        let outer = Request::contiguous(2, &inner).unwrap();
        let tree = outer.commit();
        assert_eq!(tree.displacement(0), 8);
    }

    #[test]
    fn test_validate_rejects_corrupt_arena() {
        let tree = RequestTree::contiguous(16).unwrap();
        let mut nodes = tree.nodes().to_vec();
        nodes[0].element = Some(9);
        assert!(matches!(
            RequestTree::from_nodes(nodes),
            Err(RequestError::CorruptArena(_))
        ));

        let mut nodes = tree.nodes().to_vec();
        nodes[0].sequence_next = Some(0);
        assert!(RequestTree::from_nodes(nodes).is_err());

        assert!(RequestTree::from_nodes(Vec::new()).is_err());
    }

    #[test]
    fn test_committed_tree_survives_msgpack() {
        let byte = Request::byte();
        let req = Request::hindexed(&[3, 5], &[0, 40], &byte).unwrap();
        let tree = req.commit();
        let bytes = rmp_serde::to_vec(&tree).unwrap();
        let decoded: RequestTree = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, tree);
    }

    #[test]
    fn test_decode_rejects_corrupt_arena() {
        let tree = RequestTree::contiguous(16).unwrap();
        let mut nodes = tree.nodes().to_vec();
        nodes[1].sequence_next = Some(1);
        let bytes = rmp_serde::to_vec(&nodes).unwrap();
        assert!(rmp_serde::from_slice::<RequestTree>(&bytes).is_err());
    }
}
