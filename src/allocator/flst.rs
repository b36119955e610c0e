//! On-disk doubly linked lists
//!
//! A list is anchored by a base node embedded in some page and links nodes
//! embedded in other pages (or the same page) by [`FilAddr`]:
//!
//! ```text
//! base node (16 bytes): [len u32][first FilAddr][last FilAddr]
//! node      (12 bytes): [prev FilAddr][next FilAddr]
//! ```
//!
//! Following a link means fetching the page and reading at the offset; every
//! page touched is latched by the caller's mini-transaction.

use crate::error::{corruption, Result};
use crate::mtr::{Block, Mtr};
use crate::page::FilAddr;

pub const FLST_BASE_NODE_SIZE: usize = 16;
pub const FLST_NODE_SIZE: usize = 12;

const FLST_LEN: usize = 0;
const FLST_FIRST: usize = 4;
const FLST_LAST: usize = 4 + FilAddr::SIZE;

const FLST_PREV: usize = 0;
const FLST_NEXT: usize = FilAddr::SIZE;

/// Location of a list base node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListBase {
    pub block: Block,
    pub offset: usize,
}

impl ListBase {
    pub fn new(block: Block, offset: usize) -> Self {
        ListBase { block, offset }
    }
}

/// Initialize an empty list
pub fn init(mtr: &mut Mtr<'_>, base: ListBase) -> Result<()> {
    mtr.write_u32(base.block, base.offset + FLST_LEN, 0)?;
    mtr.write_addr(base.block, base.offset + FLST_FIRST, FilAddr::NULL)?;
    mtr.write_addr(base.block, base.offset + FLST_LAST, FilAddr::NULL)
}

pub fn len(mtr: &Mtr<'_>, base: ListBase) -> u32 {
    mtr.read_u32(base.block, base.offset + FLST_LEN)
}

pub fn first(mtr: &Mtr<'_>, base: ListBase) -> FilAddr {
    mtr.read_addr(base.block, base.offset + FLST_FIRST)
}

pub fn last(mtr: &Mtr<'_>, base: ListBase) -> FilAddr {
    mtr.read_addr(base.block, base.offset + FLST_LAST)
}

fn node_block(mtr: &mut Mtr<'_>, node: FilAddr) -> Result<Block> {
    if node.is_null() {
        return Err(corruption(
            node.page_no,
            "list link points to a null address",
            &node.to_bytes(),
        ));
    }
    mtr.fetch(node.page_no)
}

/// Successor of `node`
pub fn next(mtr: &mut Mtr<'_>, node: FilAddr) -> Result<FilAddr> {
    let block = node_block(mtr, node)?;
    Ok(mtr.read_addr(block, node.boffset as usize + FLST_NEXT))
}

/// Predecessor of `node`
pub fn prev(mtr: &mut Mtr<'_>, node: FilAddr) -> Result<FilAddr> {
    let block = node_block(mtr, node)?;
    Ok(mtr.read_addr(block, node.boffset as usize + FLST_PREV))
}

fn set_next(mtr: &mut Mtr<'_>, node: FilAddr, next: FilAddr) -> Result<()> {
    let block = node_block(mtr, node)?;
    mtr.write_addr(block, node.boffset as usize + FLST_NEXT, next)
}

fn set_prev(mtr: &mut Mtr<'_>, node: FilAddr, prev: FilAddr) -> Result<()> {
    let block = node_block(mtr, node)?;
    mtr.write_addr(block, node.boffset as usize + FLST_PREV, prev)
}

/// Append `node` to the end of the list
pub fn add_last(mtr: &mut Mtr<'_>, base: ListBase, node: FilAddr) -> Result<()> {
    let count = len(mtr, base);
    let tail = last(mtr, base);

    set_prev(mtr, node, tail)?;
    set_next(mtr, node, FilAddr::NULL)?;

    if tail.is_null() {
        mtr.write_addr(base.block, base.offset + FLST_FIRST, node)?;
    } else {
        set_next(mtr, tail, node)?;
    }
    mtr.write_addr(base.block, base.offset + FLST_LAST, node)?;
    mtr.write_u32(base.block, base.offset + FLST_LEN, count + 1)
}

/// Prepend `node` to the start of the list
pub fn add_first(mtr: &mut Mtr<'_>, base: ListBase, node: FilAddr) -> Result<()> {
    let count = len(mtr, base);
    let head = first(mtr, base);

    set_prev(mtr, node, FilAddr::NULL)?;
    set_next(mtr, node, head)?;

    if head.is_null() {
        mtr.write_addr(base.block, base.offset + FLST_LAST, node)?;
    } else {
        set_prev(mtr, head, node)?;
    }
    mtr.write_addr(base.block, base.offset + FLST_FIRST, node)?;
    mtr.write_u32(base.block, base.offset + FLST_LEN, count + 1)
}

/// Unlink `node`, which must be on this list
pub fn remove(mtr: &mut Mtr<'_>, base: ListBase, node: FilAddr) -> Result<()> {
    let count = len(mtr, base);
    if count == 0 {
        return Err(corruption(
            base.block.page_no(),
            format!(
                "removing node {}:{} from an empty list",
                node.page_no, node.boffset
            ),
            mtr.read_bytes(base.block, base.offset, FLST_BASE_NODE_SIZE),
        ));
    }

    let before = prev(mtr, node)?;
    let after = next(mtr, node)?;

    if before.is_null() {
        if first(mtr, base) != node {
            return Err(corruption(
                node.page_no,
                "list node without predecessor is not the list head",
                mtr.read_bytes(base.block, base.offset, FLST_BASE_NODE_SIZE),
            ));
        }
        mtr.write_addr(base.block, base.offset + FLST_FIRST, after)?;
    } else {
        set_next(mtr, before, after)?;
    }

    if after.is_null() {
        mtr.write_addr(base.block, base.offset + FLST_LAST, before)?;
    } else {
        set_prev(mtr, after, before)?;
    }

    mtr.write_u32(base.block, base.offset + FLST_LEN, count - 1)
}

/// Collect the node addresses of a list, head first.
///
/// Stops with a corruption error if the walk does not end after `len` nodes.
pub fn collect(mtr: &mut Mtr<'_>, base: ListBase) -> Result<Vec<FilAddr>> {
    let count = len(mtr, base);
    let mut nodes = Vec::with_capacity(count as usize);
    let mut addr = first(mtr, base);

    while !addr.is_null() {
        if nodes.len() as u32 >= count {
            return Err(corruption(
                base.block.page_no(),
                format!("list walk exceeds its length counter ({})", count),
                mtr.read_bytes(base.block, base.offset, FLST_BASE_NODE_SIZE),
            ));
        }
        nodes.push(addr);
        addr = next(mtr, addr)?;
    }

    if nodes.len() as u32 != count {
        return Err(corruption(
            base.block.page_no(),
            format!(
                "list length counter is {} but {} nodes are linked",
                count,
                nodes.len()
            ),
            mtr.read_bytes(base.block, base.offset, FLST_BASE_NODE_SIZE),
        ));
    }

    Ok(nodes)
}
