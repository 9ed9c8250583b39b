//! Row-to-model mapping shared by the canonical and session stores.

use crate::store::{parse_opt_ts, parse_ts};
use grove_core::{Attr, Block, BlockId, BlockRef, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

pub(crate) fn block_from_row(row: &SqliteRow) -> Result<Block> {
    Ok(Block {
        id: BlockId::new(row.try_get::<String, _>("id")?),
        parent_id: row
            .try_get::<Option<String>, _>("parent_id")?
            .map(BlockId::new),
        block_type: row.try_get("type")?,
        content: row.try_get("content")?,
        content_html: row.try_get("content_html")?,
        position: row.try_get("position")?,
        hash: row.try_get("hash")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
        created_by: row.try_get("created_by")?,
        published: row.try_get::<i64, _>("published")? != 0,
        deleted_at: parse_opt_ts(row.try_get("deleted_at")?)?,
    })
}

pub(crate) fn ref_from_row(row: &SqliteRow) -> Result<BlockRef> {
    Ok(BlockRef {
        from_id: BlockId::new(row.try_get::<String, _>("from_id")?),
        to_id: BlockId::new(row.try_get::<String, _>("to_id")?),
        ref_type: row.try_get("type")?,
        anchor: row.try_get("anchor")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        created_by: row.try_get("created_by")?,
    })
}

pub(crate) fn attr_from_row(row: &SqliteRow) -> Result<Attr> {
    Ok(Attr {
        block_id: BlockId::new(row.try_get::<String, _>("block_id")?),
        name: row.try_get("name")?,
        value: row.try_get("value")?,
    })
}
