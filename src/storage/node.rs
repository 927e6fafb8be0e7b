use std::fmt;

use super::{
    Offset, StorageError, Version, align, codec_config,
    header::node::{
        NODE_DIRECTORY, NODE_ENTRIES, NODE_HEADER_SIZE, NODE_INNER, NODE_KIND, NODE_LEAF,
        NODE_PAYLOAD, NODE_PAYLOAD_SIZE, NODE_TABLE, NODE_VERSION,
    },
    keys::{ObjectKey, TableKey},
};

/// Field values of one object. The schema layer owns their layout.
pub type Values = Vec<u8>;

/// Where a node lives while a write transaction is open.
///
/// Committed nodes are addressed by their arena offset. Nodes created or
/// copied by the open transaction live in its workspace until the commit
/// places them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRef {
    Stored(Offset),
    Dirty(usize),
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRef::Stored(offset) => write!(f, "@{offset}"),
            NodeRef::Dirty(slot) => write!(f, "dirty#{slot}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafNode {
    pub table: TableKey,
    pub version: Version,
    pub entries: Vec<(ObjectKey, Values)>,
}

/// Children are keyed by the largest object key they contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerNode {
    pub table: TableKey,
    pub version: Version,
    pub children: Vec<(ObjectKey, NodeRef)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterNode {
    Leaf(LeafNode),
    Inner(InnerNode),
}

impl ClusterNode {
    pub fn leaf(table: TableKey, entries: Vec<(ObjectKey, Values)>) -> Self {
        ClusterNode::Leaf(LeafNode {
            table,
            version: 0,
            entries,
        })
    }

    pub fn inner(table: TableKey, children: Vec<(ObjectKey, NodeRef)>) -> Self {
        ClusterNode::Inner(InnerNode {
            table,
            version: 0,
            children,
        })
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, ClusterNode::Leaf(_))
    }

    pub fn table(&self) -> TableKey {
        match self {
            ClusterNode::Leaf(leaf) => leaf.table,
            ClusterNode::Inner(inner) => inner.table,
        }
    }

    /// Version of the commit that placed this node.
    pub fn version(&self) -> Version {
        match self {
            ClusterNode::Leaf(leaf) => leaf.version,
            ClusterNode::Inner(inner) => inner.version,
        }
    }

    pub fn set_version(&mut self, version: Version) {
        match self {
            ClusterNode::Leaf(leaf) => leaf.version = version,
            ClusterNode::Inner(inner) => inner.version = version,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ClusterNode::Leaf(leaf) => leaf.entries.len(),
            ClusterNode::Inner(inner) => inner.children.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_key(&self) -> Option<ObjectKey> {
        match self {
            ClusterNode::Leaf(leaf) => leaf.entries.last().map(|(key, _)| *key),
            ClusterNode::Inner(inner) => inner.children.last().map(|(key, _)| *key),
        }
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        match self {
            ClusterNode::Leaf(leaf) => leaf.entries.iter().map(|(key, _)| *key).collect(),
            ClusterNode::Inner(inner) => inner.children.iter().map(|(key, _)| *key).collect(),
        }
    }

    /// Moves entries `at..` into a new sibling of the same kind.
    pub fn split_off(&mut self, at: usize) -> ClusterNode {
        match self {
            ClusterNode::Leaf(leaf) => ClusterNode::Leaf(LeafNode {
                table: leaf.table,
                version: leaf.version,
                entries: leaf.entries.split_off(at),
            }),
            ClusterNode::Inner(inner) => ClusterNode::Inner(InnerNode {
                table: inner.table,
                version: inner.version,
                children: inner.children.split_off(at),
            }),
        }
    }

    /// Appends every entry of `right`, which must hold larger keys.
    pub fn append(&mut self, right: ClusterNode) -> Result<(), StorageError> {
        match (self, right) {
            (ClusterNode::Leaf(left), ClusterNode::Leaf(mut right)) => {
                left.entries.append(&mut right.entries);
                Ok(())
            }
            (ClusterNode::Inner(left), ClusterNode::Inner(mut right)) => {
                left.children.append(&mut right.children);
                Ok(())
            }
            _ => Err(StorageError::corrupted(
                "sibling nodes at the same depth differ in kind",
            )),
        }
    }

    /// Checks that keys are strictly increasing and inner nodes have children.
    pub fn validate(&self) -> Result<(), StorageError> {
        if let ClusterNode::Inner(inner) = self {
            if inner.children.is_empty() {
                return Err(StorageError::corrupted("inner node without children"));
            }
        }
        let keys = self.keys();
        if let Some(pair) = keys.windows(2).find(|pair| pair[0] >= pair[1]) {
            return Err(StorageError::corrupted(format!(
                "keys out of order in node: {} then {}",
                pair[0], pair[1]
            )));
        }
        Ok(())
    }

    /// Serializes the node. Inner nodes must only reference stored children.
    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        let config = codec_config();
        let (kind, payload) = match self {
            ClusterNode::Leaf(leaf) => (
                NODE_LEAF,
                bincode::encode_to_vec(&leaf.entries, config)?,
            ),
            ClusterNode::Inner(inner) => {
                let children = inner
                    .children
                    .iter()
                    .map(|(key, child)| match child {
                        NodeRef::Stored(offset) => Ok((*key, *offset)),
                        NodeRef::Dirty(_) => Err(StorageError::corrupted(format!(
                            "inner node references unplaced child {child}"
                        ))),
                    })
                    .collect::<Result<Vec<(ObjectKey, Offset)>, _>>()?;
                (NODE_INNER, bincode::encode_to_vec(&children, config)?)
            }
        };

        Ok(frame(kind, self.len(), self.version(), self.table(), &payload))
    }

    /// Decodes a node from the start of `bytes`; trailing bytes are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let header = NodeHeader::read(bytes)?;
        let payload = &bytes[NODE_HEADER_SIZE..header.encoded_len()];
        let config = codec_config();

        let node = match header.kind {
            NODE_LEAF => {
                let (entries, _): (Vec<(ObjectKey, Values)>, usize) =
                    bincode::decode_from_slice(payload, config)
                        .map_err(|e| StorageError::corrupted(format!("leaf payload: {e}")))?;
                ClusterNode::Leaf(LeafNode {
                    table: header.table,
                    version: header.version,
                    entries,
                })
            }
            NODE_INNER => {
                let (children, _): (Vec<(ObjectKey, Offset)>, usize) =
                    bincode::decode_from_slice(payload, config)
                        .map_err(|e| StorageError::corrupted(format!("inner payload: {e}")))?;
                ClusterNode::Inner(InnerNode {
                    table: header.table,
                    version: header.version,
                    children: children
                        .into_iter()
                        .map(|(key, offset)| (key, NodeRef::Stored(offset)))
                        .collect(),
                })
            }
            NODE_DIRECTORY => {
                return Err(StorageError::corrupted(
                    "table directory found where a cluster node was expected",
                ));
            }
            kind => {
                return Err(StorageError::corrupted(format!("unknown node kind {kind:#x}")));
            }
        };

        if node.len() != header.entries {
            return Err(StorageError::corrupted(format!(
                "node header announces {} entries, payload holds {}",
                header.entries,
                node.len()
            )));
        }
        node.validate()?;
        Ok(node)
    }
}

/// Prefixes `payload` with a node header.
pub(crate) fn frame(
    kind: u8,
    entries: usize,
    version: Version,
    table: TableKey,
    payload: &[u8],
) -> Vec<u8> {
    let mut buf = vec![0; NODE_HEADER_SIZE + payload.len()];
    buf[NODE_KIND] = kind;
    buf[NODE_ENTRIES..NODE_VERSION].clone_from_slice(&(entries as u32).to_be_bytes());
    buf[NODE_VERSION..NODE_TABLE].clone_from_slice(&version.to_be_bytes());
    buf[NODE_TABLE..NODE_PAYLOAD].clone_from_slice(&table.value().to_be_bytes());
    buf[NODE_PAYLOAD..NODE_HEADER_SIZE].clone_from_slice(&(payload.len() as u32).to_be_bytes());
    buf[NODE_HEADER_SIZE..].clone_from_slice(payload);
    buf
}

/// Fixed-size prefix of every stored node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
    pub kind: u8,
    pub entries: usize,
    pub version: Version,
    pub table: TableKey,
    pub payload: usize,
}

impl NodeHeader {
    pub fn read(bytes: &[u8]) -> Result<Self, StorageError> {
        if bytes.len() < NODE_HEADER_SIZE {
            return Err(StorageError::corrupted(format!(
                "node header truncated to {} bytes",
                bytes.len()
            )));
        }
        let u32_at = |at: usize| {
            let mut raw = [0; 4];
            raw.copy_from_slice(&bytes[at..at + 4]);
            u32::from_be_bytes(raw)
        };
        let mut version = [0; 8];
        version.copy_from_slice(&bytes[NODE_VERSION..NODE_TABLE]);

        let header = Self {
            kind: bytes[NODE_KIND],
            entries: u32_at(NODE_ENTRIES) as usize,
            version: u64::from_be_bytes(version),
            table: TableKey::new(u32_at(NODE_TABLE)),
            payload: u32_at(NODE_PAYLOAD) as usize,
        };
        if ![NODE_LEAF, NODE_INNER, NODE_DIRECTORY].contains(&header.kind) {
            return Err(StorageError::corrupted(format!(
                "unknown node kind {:#x}",
                header.kind
            )));
        }
        if header.encoded_len() > bytes.len() {
            return Err(StorageError::corrupted(format!(
                "node payload of {} bytes runs past the arena",
                header.payload
            )));
        }
        Ok(header)
    }

    pub fn encoded_len(&self) -> usize {
        NODE_HEADER_SIZE + self.payload
    }

    /// Size of the arena region holding the node.
    pub fn stored_len(&self) -> u64 {
        align(self.encoded_len() as u64)
    }
}

const _: () = assert!(NODE_PAYLOAD + NODE_PAYLOAD_SIZE == NODE_HEADER_SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    fn key(k: i64) -> ObjectKey {
        ObjectKey::new(k)
    }

    fn leaf(keys: &[i64]) -> ClusterNode {
        ClusterNode::leaf(
            TableKey::new(2),
            keys.iter().map(|k| (key(*k), vec![*k as u8; 3])).collect(),
        )
    }

    #[test]
    fn leaf_to_bytes() {
        let mut node = leaf(&[1, 4, 9]);
        node.set_version(12);

        let bytes = node.encode().unwrap();
        let header = NodeHeader::read(&bytes).unwrap();
        assert_eq!(header.kind, NODE_LEAF);
        assert_eq!(header.entries, 3);
        assert_eq!(header.version, 12);
        assert_eq!(header.table, TableKey::new(2));
        assert_eq!(header.encoded_len(), bytes.len());

        assert_eq!(ClusterNode::decode(&bytes).unwrap(), node);
    }

    #[test]
    fn inner_to_bytes() {
        let node = ClusterNode::inner(
            TableKey::new(0),
            vec![(key(10), NodeRef::Stored(4096)), (key(20), NodeRef::Stored(4160))],
        );

        let mut bytes = node.encode().unwrap();
        // trailing arena bytes do not disturb decoding
        bytes.extend_from_slice(&[0xff; 16]);
        let decoded = ClusterNode::decode(&bytes).unwrap();

        assert!(!decoded.is_leaf());
        assert_eq!(decoded, node);
    }

    #[test]
    fn inner_with_dirty_child_cannot_encode() {
        let node = ClusterNode::inner(TableKey::new(0), vec![(key(1), NodeRef::Dirty(0))]);
        assert!(matches!(node.encode(), Err(StorageError::Corrupted(_))));
    }

    #[test]
    fn decode_rejects_unordered_keys() {
        let node = leaf(&[5, 3]);
        let bytes = node.encode().unwrap();
        assert!(matches!(
            ClusterNode::decode(&bytes),
            Err(StorageError::Corrupted(_))
        ));
    }

    #[test]
    fn decode_rejects_unknown_kind() {
        let mut bytes = leaf(&[1]).encode().unwrap();
        bytes[NODE_KIND] = 0x7;
        assert!(matches!(
            ClusterNode::decode(&bytes),
            Err(StorageError::Corrupted(_))
        ));
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        let bytes = leaf(&[1, 2, 3]).encode().unwrap();
        assert!(matches!(
            ClusterNode::decode(&bytes[..bytes.len() - 1]),
            Err(StorageError::Corrupted(_))
        ));
    }

    #[test]
    fn split_and_append() {
        let mut left = leaf(&[1, 2, 3, 4, 5]);
        let right = left.split_off(3);

        assert_eq!(left.keys(), vec![key(1), key(2), key(3)]);
        assert_eq!(right.keys(), vec![key(4), key(5)]);
        assert_eq!(right.max_key(), Some(key(5)));

        left.append(right).unwrap();
        assert_eq!(left.len(), 5);
        left.validate().unwrap();
    }

    #[test]
    fn append_mismatched_kinds() {
        let mut left = leaf(&[1]);
        let right = ClusterNode::inner(TableKey::new(2), vec![(key(9), NodeRef::Stored(4096))]);
        assert!(left.append(right).is_err());
    }

    #[test]
    fn stored_len_is_aligned() {
        let bytes = leaf(&[1]).encode().unwrap();
        let header = NodeHeader::read(&bytes).unwrap();
        assert_eq!(header.stored_len() % 8, 0);
        assert!(header.stored_len() >= bytes.len() as u64);
    }
}
