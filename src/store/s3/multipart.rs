use aws_sdk_s3::{
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart},
    Client,
};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::store::{RawReader, Result, StoreError};

// Size of each part (10MB) - AWS minimum is 5MB
const PART_SIZE: usize = 10 * 1024 * 1024;

// Objects of at least one part go multipart, so a single PUT never buffers
// more than `PART_SIZE` bytes
pub const MULTIPART_THRESHOLD: u64 = PART_SIZE as u64;

/// Upload a large object using S3 multipart upload
///
/// The body is consumed in `PART_SIZE` chunks. A failed part aborts the
/// whole upload.
pub(super) async fn upload_multipart(
    client: &Client,
    bucket: &str,
    key: &str,
    body: RawReader,
    size: u64,
) -> Result<()> {
    info!(
        "Starting multipart upload to s3://{}/{} ({} bytes, {} parts)",
        bucket,
        key,
        size,
        (size as usize).div_ceil(PART_SIZE)
    );

    let multipart = client
        .create_multipart_upload()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .map_err(|e| StoreError::from_aws_error(bucket, e))?;

    let upload_id = multipart
        .upload_id()
        .ok_or_else(|| StoreError::S3 {
            bucket: bucket.to_string(),
            message: "no upload ID returned from S3".to_string(),
        })?
        .to_string();

    debug!("Multipart upload initiated with ID: {}", upload_id);

    match upload_parts(client, bucket, key, &upload_id, body).await {
        Ok(parts) => {
            debug!(
                "All {} parts uploaded, completing multipart upload",
                parts.len()
            );

            let completed = CompletedMultipartUpload::builder()
                .set_parts(Some(parts))
                .build();

            client
                .complete_multipart_upload()
                .bucket(bucket)
                .key(key)
                .upload_id(&upload_id)
                .multipart_upload(completed)
                .send()
                .await
                .map_err(|e| StoreError::from_aws_error(bucket, e))?;

            info!("Completed multipart upload to s3://{}/{}", bucket, key);
            Ok(())
        }
        Err(e) => {
            if let Err(abort_err) = abort_multipart_upload(client, bucket, key, &upload_id).await
            {
                warn!(
                    "Failed to abort multipart upload {}: {}",
                    upload_id, abort_err
                );
            }
            Err(e)
        }
    }
}

async fn upload_parts(
    client: &Client,
    bucket: &str,
    key: &str,
    upload_id: &str,
    mut body: RawReader,
) -> Result<Vec<CompletedPart>> {
    let mut parts = Vec::new();
    let mut part_number = 1i32;

    loop {
        let buffer = read_part(&mut body).await?;
        if buffer.is_empty() {
            break; // EOF
        }

        debug!("Uploading part {} ({} bytes)", part_number, buffer.len());

        let part_result = client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(buffer))
            .send()
            .await
            .map_err(|e| StoreError::from_aws_error(bucket, e))?;

        parts.push(
            CompletedPart::builder()
                .part_number(part_number)
                .e_tag(part_result.e_tag().unwrap_or(""))
                .build(),
        );

        part_number += 1;
    }

    Ok(parts)
}

/// Fill one part buffer; a short read does not end the part, only EOF does
async fn read_part(body: &mut RawReader) -> Result<Vec<u8>> {
    let mut buffer = vec![0u8; PART_SIZE];
    let mut filled = 0;

    while filled < PART_SIZE {
        let bytes_read = body
            .read(&mut buffer[filled..])
            .await
            .map_err(StoreError::Body)?;
        if bytes_read == 0 {
            break;
        }
        filled += bytes_read;
    }

    buffer.truncate(filled);
    Ok(buffer)
}

/// Abort a multipart upload (for cleanup on error)
async fn abort_multipart_upload(
    client: &Client,
    bucket: &str,
    key: &str,
    upload_id: &str,
) -> Result<()> {
    client
        .abort_multipart_upload()
        .bucket(bucket)
        .key(key)
        .upload_id(upload_id)
        .send()
        .await
        .map_err(|e| StoreError::from_aws_error(bucket, e))?;

    debug!("Aborted multipart upload {}", upload_id);

    Ok(())
}
