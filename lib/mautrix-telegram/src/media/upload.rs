// Copyright 2024 - developers of the `mautrix-telegram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Chunked file upload to Telegram servers.

use grammers_tl_types as tl;
use log::debug;

use crate::client::TelegramClient;
use crate::util::generate_random_id;

use super::MediaError;

const MAX_PART_SIZE: usize = 512 * 1024;

/// Above this size, `upload.saveBigFilePart` must be used (and no MD5
/// checksum is computed).
const BIG_FILE_THRESHOLD: usize = 10 * 1024 * 1024;

/// Upload a payload to Telegram, returning the `InputFile` to attach to a
/// `messages.sendMedia` call.
///
/// Small files go through `upload.saveFilePart` with an MD5 checksum for
/// integrity; large ones use the big-file variant, which skips the
/// checksum but requires the total part count on every call.
pub(crate) async fn upload_to_telegram(
    client: &TelegramClient,
    data: &[u8],
    name: &str,
) -> Result<tl::enums::InputFile, MediaError> {
    let file_id = generate_random_id();
    let total_parts = data.len().div_ceil(MAX_PART_SIZE) as i32;
    let big = data.len() > BIG_FILE_THRESHOLD;
    debug!(
        "uploading {} bytes as {} parts (big = {big})",
        data.len(),
        total_parts
    );

    for (part, bytes) in data.chunks(MAX_PART_SIZE).enumerate() {
        let saved = if big {
            client
                .invoke(&tl::functions::upload::SaveBigFilePart {
                    file_id,
                    file_part: part as i32,
                    file_total_parts: total_parts,
                    bytes: bytes.to_vec(),
                })
                .await
        } else {
            client
                .invoke(&tl::functions::upload::SaveFilePart {
                    file_id,
                    file_part: part as i32,
                    bytes: bytes.to_vec(),
                })
                .await
        };
        match saved {
            Ok(true) => {}
            Ok(false) => return Err(MediaError::UploadRejected),
            Err(err) => return Err(MediaError::Upload(err)),
        }
    }

    Ok(if big {
        tl::types::InputFileBig {
            id: file_id,
            parts: total_parts,
            name: name.to_string(),
        }
        .into()
    } else {
        tl::types::InputFile {
            id: file_id,
            parts: total_parts,
            name: name.to_string(),
            md5_checksum: hex::encode(md5::compute(data).0),
        }
        .into()
    })
}
