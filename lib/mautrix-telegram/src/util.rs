// Copyright 2024 - developers of the `mautrix-telegram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use grammers_tl_types as tl;

/// Generate a random ID suitable for sending messages or media.
pub(crate) fn generate_random_id() -> i64 {
    let mut buffer = [0; 8];
    getrandom::getrandom(&mut buffer).expect("failed to generate random message id");
    i64::from_le_bytes(buffer)
}

/// MIME type for a `storage.FileType` tag, when it names one.
pub(crate) fn storage_file_type_mime(file_type: &tl::enums::storage::FileType) -> Option<&'static str> {
    use tl::enums::storage::FileType as T;
    match file_type {
        T::FileJpeg => Some("image/jpeg"),
        T::FileGif => Some("image/gif"),
        T::FilePng => Some("image/png"),
        T::FilePdf => Some("application/pdf"),
        T::FileMp3 => Some("audio/mpeg"),
        T::FileMov => Some("video/quicktime"),
        T::FileMp4 => Some("video/mp4"),
        T::FileWebp => Some("image/webp"),
        T::FileUnknown | T::FilePartial => None,
    }
}

/// Infer a MIME type from the first bytes of a payload, falling back to
/// `application/octet-stream`.
pub(crate) fn sniff_mime(data: &[u8]) -> &'static str {
    infer::get(data)
        .map(|kind| kind.mime_type())
        .unwrap_or("application/octet-stream")
}

/// Pick a filename extension for a MIME type.
pub(crate) fn extension_for_mime(mime_type: &str) -> &'static str {
    mime_guess::get_mime_extensions_str(mime_type)
        .and_then(|extensions| extensions.first())
        .copied()
        .unwrap_or("bin")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniff_jpeg() {
        let mut data = vec![0xff, 0xd8, 0xff, 0xe0];
        data.extend_from_slice(&[0u8; 64]);
        assert_eq!(sniff_mime(&data), "image/jpeg");
    }

    #[test]
    fn sniff_unknown_falls_back() {
        assert_eq!(sniff_mime(&[0u8; 8]), "application/octet-stream");
    }

    #[test]
    fn random_ids_differ() {
        assert_ne!(generate_random_id(), generate_random_id());
    }
}
