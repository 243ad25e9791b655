// Copyright 2024 - developers of the `mautrix-telegram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Streaming file download from Telegram servers.

use futures_util::future::try_join_all;
use grammers_tl_types as tl;
use log::{debug, warn};

use crate::client::TelegramClient;

use super::MediaError;

pub(crate) const MAX_CHUNK_SIZE: i32 = 512 * 1024;

/// How many chunks are fetched concurrently when the file size is known.
const PARALLEL_CHUNKS: usize = 4;

/// Files smaller than this are not worth parallel fan-out.
const PARALLEL_THRESHOLD: i64 = 1024 * 1024;

/// Download a file location in full.
///
/// When the expected size is known and large enough, chunks are fetched
/// concurrently across the connection pool and reassembled in order.
/// Returns the payload together with the `storage.FileType` tag the
/// server reported for the first chunk.
pub(crate) async fn download(
    client: &TelegramClient,
    location: tl::enums::InputFileLocation,
    dc_id: Option<i32>,
    size_hint: Option<i64>,
) -> Result<(Vec<u8>, Option<tl::enums::storage::FileType>), MediaError> {
    match size_hint {
        Some(size) if size >= PARALLEL_THRESHOLD => {
            download_parallel(client, location, dc_id, size).await
        }
        _ => download_sequential(client, location, dc_id).await,
    }
}

fn get_file_request(
    location: &tl::enums::InputFileLocation,
    offset: i64,
) -> tl::functions::upload::GetFile {
    tl::functions::upload::GetFile {
        precise: true,
        cdn_supported: false,
        location: location.clone(),
        offset,
        limit: MAX_CHUNK_SIZE,
    }
}

async fn fetch_chunk(
    client: &TelegramClient,
    location: &tl::enums::InputFileLocation,
    dc_id: Option<i32>,
    offset: i64,
) -> Result<(Vec<u8>, Option<tl::enums::storage::FileType>), MediaError> {
    let request = get_file_request(location, offset);
    let response = match dc_id {
        Some(dc_id) => client.invoke_in_dc(dc_id, &request).await,
        None => client.invoke(&request).await,
    };
    let response = match response {
        Ok(response) => response,
        // The file actually lives in another datacenter; retry there.
        Err(err) if err.is("FILE_MIGRATE") => {
            let target = match &err {
                crate::client::ClientError::Invocation(
                    grammers_mtsender::InvocationError::Rpc(rpc),
                ) => rpc.value.map(|dc| dc as i32),
                _ => None,
            };
            let target = target.ok_or(MediaError::Download(err))?;
            debug!("file migrated to dc {target}, retrying there");
            client
                .invoke_in_dc(target, &request)
                .await
                .map_err(MediaError::Download)?
        }
        Err(err) => return Err(MediaError::Download(err)),
    };

    match response {
        tl::enums::upload::File::File(file) => Ok((file.bytes, Some(file.r#type))),
        tl::enums::upload::File::CdnRedirect(_) => {
            warn!("server redirected the download to a CDN, which is not supported");
            Err(MediaError::CdnRedirect)
        }
    }
}

async fn download_sequential(
    client: &TelegramClient,
    location: tl::enums::InputFileLocation,
    dc_id: Option<i32>,
) -> Result<(Vec<u8>, Option<tl::enums::storage::FileType>), MediaError> {
    let mut data = Vec::new();
    let mut file_type = None;
    let mut offset = 0i64;

    loop {
        let (bytes, chunk_type) = fetch_chunk(client, &location, dc_id, offset).await?;
        file_type = file_type.or(chunk_type);
        let done = bytes.len() < MAX_CHUNK_SIZE as usize;
        offset += bytes.len() as i64;
        data.extend(bytes);
        if done {
            break;
        }
    }

    Ok((data, file_type))
}

async fn download_parallel(
    client: &TelegramClient,
    location: tl::enums::InputFileLocation,
    dc_id: Option<i32>,
    size: i64,
) -> Result<(Vec<u8>, Option<tl::enums::storage::FileType>), MediaError> {
    let chunk = MAX_CHUNK_SIZE as i64;
    let offsets: Vec<i64> = (0..)
        .map(|i| i * chunk)
        .take_while(|offset| *offset < size)
        .collect();

    let mut data = Vec::with_capacity(size as usize);
    let mut file_type = None;

    // Waves of a few chunks at a time; results reassemble in offset order.
    for wave in offsets.chunks(PARALLEL_CHUNKS) {
        let chunks = try_join_all(
            wave.iter()
                .map(|offset| fetch_chunk(client, &location, dc_id, *offset)),
        )
        .await?;
        for (bytes, chunk_type) in chunks {
            file_type = file_type.or(chunk_type);
            data.extend(bytes);
        }
    }

    Ok((data, file_type))
}
