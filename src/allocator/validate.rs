//! Consistency checker
//!
//! Walks every tablespace list, every inode page and every segment list and
//! cross-checks them against the extent descriptors. Problems are collected
//! rather than returned as errors so one pass reports everything it can
//! reach.

use super::flst;
use super::header::{SpaceHeader, SpaceList};
use super::inode::{self, Inode, SegList, FSEG_INODE_PAGE_NODE};
use super::xdes::{BitKind, Xdes, XdesState};
use super::Space;
use crate::error::Result;
use crate::mtr::Mtr;
use crate::page::{PageType, EXTENT_SIZE};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub extents_checked: u32,
    pub segments_checked: u32,
    pub problems: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }

    fn problem(&mut self, message: String) {
        tracing::warn!("Validation: {}", message);
        self.problems.push(message);
    }
}

/// Which list each extent was found on
struct Membership {
    owners: HashMap<u32, String>,
}

impl Membership {
    fn record(&mut self, report: &mut ValidationReport, first_page: u32, owner: String) {
        if let Some(previous) = self.owners.insert(first_page, owner.clone()) {
            report.problem(format!(
                "extent {} is on both {} and {}",
                first_page, previous, owner
            ));
        }
        report.extents_checked += 1;
    }
}

pub(crate) fn validate(mtr: &mut Mtr<'_>, space: &Space<'_>) -> Result<ValidationReport> {
    let mut report = ValidationReport::default();
    match walk(mtr, space, &mut report) {
        Ok(()) => Ok(report),
        Err(e) if e.is_corruption() => {
            report.problems.push(e.to_string());
            Ok(report)
        }
        Err(e) => Err(e),
    }
}

fn walk(mtr: &mut Mtr<'_>, space: &Space<'_>, report: &mut ValidationReport) -> Result<()> {
    let page_size = space.page_size();
    let header = SpaceHeader::get(mtr, page_size)?;
    let mut seen = Membership {
        owners: HashMap::new(),
    };

    let mut frag_used = 0;
    for list in [SpaceList::Free, SpaceList::FreeFrag, SpaceList::FullFrag] {
        for node in flst::collect(mtr, header.list(list))? {
            let xdes = Xdes::from_node(mtr, page_size, node)?;
            seen.record(report, xdes.first_page, format!("{:?}", list));

            let state = xdes.state(mtr)?;
            let n_used = xdes.n_used(mtr);
            let expected = match list {
                SpaceList::Free => XdesState::Free,
                SpaceList::FreeFrag => XdesState::FreeFrag,
                _ => XdesState::FullFrag,
            };
            if state != expected {
                report.problem(format!(
                    "extent {} on {:?} has state {:?}",
                    xdes.first_page, list, state
                ));
            }

            match list {
                SpaceList::Free if n_used != 0 => report.problem(format!(
                    "extent {} on FREE has {} used pages",
                    xdes.first_page, n_used
                )),
                SpaceList::FreeFrag => {
                    if n_used == 0 || n_used == EXTENT_SIZE {
                        report.problem(format!(
                            "extent {} on FREE_FRAG has {} used pages",
                            xdes.first_page, n_used
                        ));
                    }
                    frag_used += n_used;
                }
                SpaceList::FullFrag if n_used != EXTENT_SIZE => report.problem(format!(
                    "extent {} on FULL_FRAG has {} used pages",
                    xdes.first_page, n_used
                )),
                _ => {}
            }
        }
    }

    if frag_used != header.frag_n_used(mtr) {
        report.problem(format!(
            "frag_n_used is {} but FREE_FRAG extents use {} pages",
            header.frag_n_used(mtr),
            frag_used
        ));
    }

    for (list, expect_free) in [
        (SpaceList::SegInodesFull, false),
        (SpaceList::SegInodesFree, true),
    ] {
        for node in flst::collect(mtr, header.list(list))? {
            if node.boffset as usize != FSEG_INODE_PAGE_NODE {
                report.problem(format!(
                    "{:?} links page {} at offset {}",
                    list, node.page_no, node.boffset
                ));
                continue;
            }

            let block = mtr.fetch(node.page_no)?;
            if mtr.page(block).page_type() != Some(PageType::Inode) {
                report.problem(format!("page {} on {:?} is not an inode page", node.page_no, list));
                continue;
            }
            if inode::has_free_inode(mtr, block, page_size) != expect_free {
                report.problem(format!(
                    "inode page {} is on {:?} but its free inode count disagrees",
                    node.page_no, list
                ));
            }

            for inode in inode::used_inodes(mtr, block, page_size) {
                check_segment(mtr, space, &header, &inode, &mut seen, report)?;
            }
        }
    }

    // Every initialized extent is on exactly one list
    let free_limit = header.free_limit(mtr);
    for first_page in (0..free_limit).step_by(EXTENT_SIZE as usize) {
        if !seen.owners.contains_key(&first_page) {
            report.problem(format!("extent {} is on no list", first_page));
        }
    }

    Ok(())
}

fn check_segment(
    mtr: &mut Mtr<'_>,
    space: &Space<'_>,
    header: &SpaceHeader,
    inode: &Inode,
    seen: &mut Membership,
    report: &mut ValidationReport,
) -> Result<()> {
    let seg_id = inode.id(mtr);
    if let Err(e) = inode.check_magic(mtr) {
        report.problem(e.to_string());
        return Ok(());
    }

    let mut not_full_used = 0;
    for list in SegList::ALL {
        for node in flst::collect(mtr, inode.list(list))? {
            let xdes = Xdes::from_node(mtr, space.page_size(), node)?;
            seen.record(report, xdes.first_page, format!("segment {} {:?}", seg_id, list));

            if !xdes.in_segment(mtr, seg_id)? {
                report.problem(format!(
                    "extent {} on segment {} {:?} is owned by segment {} in state {:?}",
                    xdes.first_page,
                    seg_id,
                    list,
                    xdes.segment_id(mtr),
                    xdes.state(mtr)?
                ));
            }

            let unused = xdes.is_unused_by_segment(mtr)?;
            let full = xdes.is_full(mtr);
            match list {
                SegList::Free if !unused => report.problem(format!(
                    "extent {} on segment {} FREE has pages in use",
                    xdes.first_page, seg_id
                )),
                SegList::NotFull => {
                    if unused || full {
                        report.problem(format!(
                            "extent {} on segment {} NOT_FULL is empty or full",
                            xdes.first_page, seg_id
                        ));
                    }
                    not_full_used += xdes.n_used(mtr);
                }
                SegList::Full if !full => report.problem(format!(
                    "extent {} on segment {} FULL has free pages",
                    xdes.first_page, seg_id
                )),
                _ => {}
            }
        }
    }

    if not_full_used != inode.not_full_n_used(mtr) {
        report.problem(format!(
            "segment {} not_full_n_used is {} but its NOT_FULL extents use {} pages",
            seg_id,
            inode.not_full_n_used(mtr),
            not_full_used
        ));
    }

    for page_no in inode.frag_pages(mtr) {
        let Some(xdes) = Xdes::lookup(mtr, header, page_no)? else {
            report.problem(format!(
                "segment {} fragment page {} is outside the tablespace",
                seg_id, page_no
            ));
            continue;
        };
        let state = xdes.state(mtr)?;
        if state != XdesState::FreeFrag && state != XdesState::FullFrag {
            report.problem(format!(
                "segment {} fragment page {} is in an extent of state {:?}",
                seg_id, page_no, state
            ));
        }
        if xdes.get_bit(mtr, BitKind::Free, page_no % EXTENT_SIZE) {
            report.problem(format!(
                "segment {} fragment page {} is marked free",
                seg_id, page_no
            ));
        }
    }

    report.segments_checked += 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::test_support::Fixture;
    use crate::allocator::{fseg, fsp, Direction};
    use crate::config::{CorruptionPolicy, SpaceConfig};
    use crate::page::FIL_PAGE_DATA;

    fn fixture() -> Fixture {
        Fixture::initialized(SpaceConfig {
            page_size: 4096,
            initial_size: 1024,
            autoextend: false,
            on_corruption: CorruptionPolicy::Propagate,
            ..Default::default()
        })
    }

    #[test]
    fn test_fresh_space_is_valid() {
        let fx = fixture();
        let mut mtr = fx.mtr();
        let report = validate(&mut mtr, &fx.space()).unwrap();
        assert!(report.is_ok(), "{:?}", report.problems);
        assert_eq!(report.extents_checked, 5);
        assert_eq!(report.segments_checked, 0);
    }

    #[test]
    fn test_segments_are_valid() {
        let fx = fixture();
        let mut mtr = fx.mtr();
        let space = fx.space();
        let segment = fseg::create(&mut mtr, &space, None, FIL_PAGE_DATA as u16)
            .unwrap()
            .unwrap();
        for _ in 0..50 {
            fseg::alloc_page(&mut mtr, &space, segment, 0, Direction::NoDir, false)
                .unwrap()
                .unwrap();
        }

        let report = validate(&mut mtr, &space).unwrap();
        assert!(report.is_ok(), "{:?}", report.problems);
        assert_eq!(report.segments_checked, 1);
    }

    #[test]
    fn test_detects_frag_n_used_drift() {
        let fx = fixture();
        let mut mtr = fx.mtr();
        let header = SpaceHeader::get(&mut mtr, 4096).unwrap();
        header.set_frag_n_used(&mut mtr, 7).unwrap();

        let report = validate(&mut mtr, &fx.space()).unwrap();
        assert!(!report.is_ok());
        assert!(report.problems[0].contains("frag_n_used"));
    }

    #[test]
    fn test_detects_lost_extent() {
        let fx = fixture();
        let mut mtr = fx.mtr();
        let space = fx.space();
        // Taken off FREE and never put anywhere
        fsp::alloc_free_extent(&mut mtr, &space, 0).unwrap().unwrap();

        let report = validate(&mut mtr, &space).unwrap();
        assert_eq!(report.problems, vec!["extent 64 is on no list".to_string()]);
    }
}
