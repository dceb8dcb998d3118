use aws_sdk_s3::{primitives::ByteStream, Client};
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::store::{RawReader, Result, StoreError};

/// Upload a small object with a single PUT
pub(super) async fn put_object(
    client: &Client,
    bucket: &str,
    key: &str,
    mut body: RawReader,
    size: u64,
) -> Result<()> {
    let mut buffer = Vec::with_capacity(size as usize);
    body.read_to_end(&mut buffer)
        .await
        .map_err(StoreError::Body)?;
    let content_length = buffer.len() as i64;

    client
        .put_object()
        .bucket(bucket)
        .key(key)
        .body(ByteStream::from(buffer))
        .content_length(content_length)
        .send()
        .await
        .map_err(|e| StoreError::from_aws_error(bucket, e))?;

    debug!(
        "Uploaded {} bytes to s3://{}/{}",
        content_length, bucket, key
    );

    Ok(())
}
