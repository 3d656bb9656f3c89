// Resource identifiers are opaque 64-bit hashes of a resource's lexical
// form, with the kind of resource encoded in the top two bits. The hash
// itself is computed upstream; the stores only ever inspect the type bits
// (URIs feed the prefix machinery, blank nodes are synthesized on read).

pub type Rid = u64;

/// The reserved "no resource" value. Lives in the otherwise-unused `10`
/// type space so it can never collide with a real hash.
pub const RID_NULL: Rid = 0x8000_0000_0000_0000;

const TYPE_MASK: Rid = 0xC000_0000_0000_0000;
const TYPE_URI: Rid = 0x0000_0000_0000_0000;
const TYPE_BNODE: Rid = 0x4000_0000_0000_0000;
const TYPE_LITERAL: Rid = 0xC000_0000_0000_0000;

pub fn is_uri(rid: Rid) -> bool {
    rid & TYPE_MASK == TYPE_URI
}

pub fn is_bnode(rid: Rid) -> bool {
    rid & TYPE_MASK == TYPE_BNODE
}

pub fn is_literal(rid: Rid) -> bool {
    rid & TYPE_MASK == TYPE_LITERAL
}

/// Stamp the URI type bits onto a hash value.
pub fn mk_uri(hash: u64) -> Rid {
    (hash & !TYPE_MASK) | TYPE_URI
}

/// Stamp the blank-node type bits onto a hash value.
pub fn mk_bnode(hash: u64) -> Rid {
    (hash & !TYPE_MASK) | TYPE_BNODE
}

/// Stamp the literal type bits onto a hash value.
pub fn mk_literal(hash: u64) -> Rid {
    (hash & !TYPE_MASK) | TYPE_LITERAL
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn type_bits() {
        assert!(is_uri(mk_uri(0xdead_beef)));
        assert!(is_bnode(mk_bnode(0xdead_beef)));
        assert!(is_literal(mk_literal(0xdead_beef)));
        assert!(!is_uri(mk_literal(0xdead_beef)));
        assert!(!is_uri(RID_NULL));
        assert!(!is_bnode(RID_NULL));
        assert!(!is_literal(RID_NULL));
    }
}
