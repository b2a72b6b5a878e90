//! Row-at-a-time writer for collection data files.
//!
//! Each row becomes one JSON array on its own line, values ordered by the
//! collection's recorded columns. Every write awaits the sink, so a slow or
//! full sink stalls the row producer instead of letting rows pile up in
//! memory.

use crate::repository::{AttrDescriptor, CollectionInfo, Row, ValueSerializer};
use crate::utils::Result;
use bytes::{BufMut, BytesMut};
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Column order and per-column descriptors for one collection
#[derive(Debug, Clone)]
pub struct RowLayout {
    columns: Vec<(String, AttrDescriptor)>,
}

impl RowLayout {
    pub fn for_collection(info: &CollectionInfo) -> Self {
        Self {
            columns: info
                .attributes
                .iter()
                .map(|a| (a.name.clone(), a.descriptor.clone()))
                .collect(),
        }
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    /// Pull values out of `row` in column order. Missing columns are `null`.
    pub fn project(&self, mut row: Row, serializer: &dyn ValueSerializer) -> Vec<Value> {
        self.columns
            .iter()
            .map(|(name, attr)| {
                let value = row.remove(name).unwrap_or(Value::Null);
                serializer.serialize(attr, value)
            })
            .collect()
    }
}

/// Newline-delimited JSON-array writer
pub struct RowWriter<W> {
    inner: W,
    line: BytesMut,
    rows_written: u64,
}

impl<W: AsyncWrite + Unpin> RowWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            line: BytesMut::with_capacity(1024),
            rows_written: 0,
        }
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Serialize and write one row. Suspends while the sink is full.
    pub async fn write_row(&mut self, values: &[Value]) -> Result<()> {
        self.line.clear();
        serde_json::to_writer((&mut self.line).writer(), values)?;
        self.line.put_u8(b'\n');

        self.inner.write_all(&self.line).await?;
        self.rows_written += 1;
        Ok(())
    }

    /// Flush and close the sink, returning the number of rows written
    pub async fn finish(mut self) -> Result<u64> {
        self.inner.flush().await?;
        self.inner.shutdown().await?;
        Ok(self.rows_written)
    }
}

/// Drain `rows` into `writer`, one row in flight at a time.
pub async fn write_rows<S, W>(
    rows: S,
    layout: &RowLayout,
    serializer: &dyn ValueSerializer,
    writer: &mut RowWriter<W>,
) -> Result<u64>
where
    S: Stream<Item = Result<Row>>,
    W: AsyncWrite + Unpin,
{
    futures_util::pin_mut!(rows);
    while let Some(row) = rows.next().await {
        let values = layout.project(row?, serializer);
        writer.write_row(&values).await?;
    }
    Ok(writer.rows_written())
}
