//! Chunked file upload with an integrity checksum.
//!
//! A transfer is `put_init`, then one `put_raw` announcement plus the raw
//! block bytes per 50 KB block, then `put_term` carrying the CRC-32 of the
//! exact bytes uploaded. Each block is written while the session operation
//! mutex is held so the keepalive ping cannot interleave mid-transfer.

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use crate::error::Result;
use crate::jsonrpc;

/// Upload block size used by `put_init` and the block loop.
pub const BLOCK_SIZE: usize = 50_000;

#[derive(Debug, Serialize)]
struct PutInitParams<'a> {
    block_size: usize,
    file_id: &'a str,
    file_path: &'a str,
    length: u64,
}

#[derive(Debug, Serialize)]
struct PutRawParams<'a> {
    file_id: &'a str,
    length: usize,
}

#[derive(Debug, Serialize)]
struct PutTermParams<'a> {
    crc: u32,
    file_id: &'a str,
    length: u64,
}

/// Reads a source in blocks of up to [`BLOCK_SIZE`] bytes.
struct Blocks<R> {
    reader: R,
    remaining: u64,
}

impl<R: AsyncRead + Unpin> Blocks<R> {
    fn new(reader: R, total: u64) -> Self {
        Self {
            reader,
            remaining: total,
        }
    }

    async fn next(&mut self) -> Result<Option<Bytes>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let len = self.remaining.min(BLOCK_SIZE as u64) as usize;
        let mut block = BytesMut::zeroed(len);
        self.reader.read_exact(&mut block).await?;
        self.remaining -= len as u64;
        Ok(Some(block.freeze()))
    }
}

/// Drive a complete `put_init` / `put_raw` / `put_term` transfer.
///
/// `size` must be the exact number of bytes `reader` will provide; the
/// printer times out a transfer whose `put_term` never arrives, so any
/// error aborts immediately and nothing is retried.
pub(crate) async fn upload<R: AsyncRead + Unpin>(
    rpc: &jsonrpc::Client,
    op_lock: &tokio::sync::Mutex<()>,
    remote_path: &str,
    reader: R,
    size: u64,
) -> Result<()> {
    let file_id = Uuid::new_v4().to_string();
    tracing::debug!(%file_id, remote_path, size, "starting file transfer");

    rpc.call_no_reply(
        "put_init",
        PutInitParams {
            block_size: BLOCK_SIZE,
            file_id: &file_id,
            file_path: remote_path,
            length: size,
        },
    )
    .await?;

    let mut checksum = crc32fast::Hasher::new();
    let mut blocks = Blocks::new(reader, size);

    while let Some(block) = blocks.next().await? {
        checksum.update(&block);

        // Announcement and payload go out back-to-back under the operation
        // mutex; a keepalive ping between them would corrupt the stream from
        // the printer's point of view.
        let _op = op_lock.lock().await;
        rpc.call_no_reply(
            "put_raw",
            PutRawParams {
                file_id: &file_id,
                length: block.len(),
            },
        )
        .await?;
        rpc.write_raw(&block).await?;
    }

    rpc.call_no_reply(
        "put_term",
        PutTermParams {
            crc: checksum.finalize(),
            file_id: &file_id,
            length: size,
        },
    )
    .await?;

    tracing::debug!(%file_id, "file transfer complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_blocks_split_at_block_size() {
        let data = vec![0xAA; BLOCK_SIZE + 1234];
        let mut blocks = Blocks::new(&data[..], data.len() as u64);

        let first = blocks.next().await.unwrap().unwrap();
        assert_eq!(first.len(), BLOCK_SIZE);
        let second = blocks.next().await.unwrap().unwrap();
        assert_eq!(second.len(), 1234);
        assert!(blocks.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blocks_exact_multiple() {
        let data = vec![0u8; 2 * BLOCK_SIZE];
        let mut blocks = Blocks::new(&data[..], data.len() as u64);
        assert_eq!(blocks.next().await.unwrap().unwrap().len(), BLOCK_SIZE);
        assert_eq!(blocks.next().await.unwrap().unwrap().len(), BLOCK_SIZE);
        assert!(blocks.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blocks_empty_source() {
        let mut blocks = Blocks::new(&[][..], 0);
        assert!(blocks.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blocks_short_source_errors() {
        let data = vec![0u8; 10];
        let mut blocks = Blocks::new(&data[..], 100);
        assert!(blocks.next().await.is_err());
    }

    #[test]
    fn test_crc_of_100k_zero_bytes() {
        // CRC-32/ISO-HDLC reference value for the 100,000-zero-byte upload.
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[0u8; BLOCK_SIZE]);
        hasher.update(&[0u8; BLOCK_SIZE]);
        assert_eq!(hasher.finalize(), 0xC936_9D13);
    }

    #[test]
    fn test_crc_incremental_matches_oneshot() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

        let mut incremental = crc32fast::Hasher::new();
        for chunk in data.chunks(BLOCK_SIZE) {
            incremental.update(chunk);
        }

        let mut oneshot = crc32fast::Hasher::new();
        oneshot.update(&data);

        assert_eq!(incremental.finalize(), oneshot.finalize());
    }
}
