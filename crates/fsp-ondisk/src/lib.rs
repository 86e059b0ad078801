#![forbid(unsafe_code)]
//! On-disk format parsing for the observed journaling filesystems.
//!
//! Pure parsing crate: no I/O, no side effects. Turns byte slices into
//! typed structures for ext3 superblocks, group descriptors and inode block
//! maps, JBD journal headers, reiserfs journal descriptors and commits, and
//! jfs inline-log pages.

pub mod ext3;
pub mod jbd;
pub mod jfs;
pub mod reiserfs;

pub use ext3::{Ext3GroupDesc, Ext3Inode, Ext3Superblock, InodeLocation, parse_block_pointers};
pub use jbd::{
    JbdBlockKind, JbdHeader, JbdSuperblock, JbdTag, parse_descriptor_tags, parse_revoke_records,
};
pub use jfs::{JfsSuperblock, LogPage, LogRecord, LogRecordKind, Pxd, parse_log_page};
pub use reiserfs::{
    ReiserfsFormat, ReiserfsJournalCommit, ReiserfsJournalDesc, ReiserfsSuperblock,
    is_journal_desc, journal_trans_half,
};

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn journal_parsers_never_panic(block in proptest::collection::vec(any::<u8>(), 0..4200)) {
            let _ = JbdHeader::parse(&block);
            let _ = parse_descriptor_tags(&block);
            let _ = parse_revoke_records(&block);
            let _ = ReiserfsJournalDesc::parse(&block);
            let _ = ReiserfsJournalCommit::parse(&block);
            let _ = parse_log_page(&block);
        }

        #[test]
        fn descriptor_tag_walk_stays_in_block(block in proptest::collection::vec(any::<u8>(), 12..4096)) {
            let tags = parse_descriptor_tags(&block);
            prop_assert!(tags.len() * jbd::JBD_TAG_SIZE <= block.len());
        }
    }
}
