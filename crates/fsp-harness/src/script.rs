//! JSON-lines request scripts.
//!
//! One request per line:
//!
//! ```text
//! {"op":"write","block":21,"content":{"jbd_descriptor":{"sequence":1,"tags":[3,4]}}}
//! {"op":"write","block":22,"content":{"fill":171}}
//! {"op":"read","block":4}
//! ```
//!
//! Blank lines and lines starting with `#` are skipped.

use crate::blocks::{
    LogRecordSpec, filled, jbd_commit, jbd_descriptor, jbd_revoke, jbd_superblock, jfs_log_page,
    reiserfs_commit, reiserfs_desc,
};
use anyhow::{Context, Result, bail};
use fsp_block::{BlockRequest, RequestId};
use fsp_types::{BlockNumber, BlockSize, Direction};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockContent {
    Fill(u8),
    JbdSuperblock { max_len: u32, first: u32 },
    JbdDescriptor { sequence: u32, tags: Vec<u32> },
    JbdCommit { sequence: u32 },
    JbdRevoke { sequence: u32, revoked: Vec<u32> },
    ReiserfsDesc { trans_id: u32, blocks: Vec<u32> },
    ReiserfsCommit { trans_id: u32, blocks: Vec<u32> },
    JfsLogPage { page: u32, records: Vec<LogRecordSpec> },
}

impl Default for BlockContent {
    fn default() -> Self {
        Self::Fill(0)
    }
}

impl BlockContent {
    #[must_use]
    pub fn render(&self, block_size: usize) -> Vec<u8> {
        match self {
            Self::Fill(byte) => filled(block_size, *byte),
            Self::JbdSuperblock { max_len, first } => jbd_superblock(block_size, *max_len, *first),
            Self::JbdDescriptor { sequence, tags } => jbd_descriptor(block_size, *sequence, tags),
            Self::JbdCommit { sequence } => jbd_commit(block_size, *sequence),
            Self::JbdRevoke { sequence, revoked } => jbd_revoke(block_size, *sequence, revoked),
            Self::ReiserfsDesc { trans_id, blocks } => reiserfs_desc(block_size, *trans_id, blocks),
            Self::ReiserfsCommit { trans_id, blocks } => {
                reiserfs_commit(block_size, *trans_id, blocks)
            }
            Self::JfsLogPage { page, records } => jfs_log_page(*page, records),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptedRequest {
    pub op: Direction,
    pub block: u64,
    /// Consecutive blocks covered; every block gets the same content.
    #[serde(default = "one")]
    pub count: u64,
    #[serde(default)]
    pub content: BlockContent,
}

fn one() -> u64 {
    1
}

impl ScriptedRequest {
    pub fn to_request(&self, id: RequestId, block_size: BlockSize) -> Result<BlockRequest> {
        let sector = BlockNumber(self.block)
            .first_sector(block_size)
            .with_context(|| format!("block {} overflows the sector range", self.block))?;
        let count = usize::try_from(self.count).context("block count overflows usize")?;
        if count == 0 {
            bail!("request for block {} covers no blocks", self.block);
        }
        let bs = block_size.as_usize();
        Ok(match self.op {
            Direction::Read => BlockRequest::read(id, sector, bs * count),
            Direction::Write => {
                let block = self.content.render(bs);
                if block.len() != bs {
                    bail!("content renders {} bytes, block size is {bs}", block.len());
                }
                BlockRequest::write(id, sector, block.repeat(count))
            }
        })
    }
}

pub fn parse_request_script(text: &str) -> Result<Vec<ScriptedRequest>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(index, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("invalid request on line {}", index + 1))
        })
        .collect()
}

pub fn load_request_script(path: &Path) -> Result<Vec<ScriptedRequest>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read request script {}", path.display()))?;
    parse_request_script(&text)
        .with_context(|| format!("invalid request script {}", path.display()))
}
