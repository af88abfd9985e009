// Copyright (c) 2025 - Cowboy AI, Inc.
//! OCR service events

use serde::{Deserialize, Serialize};

use super::Payload;

/// Channel owned by the OCR service
pub const OCR_CHANNEL: &str = "ocr";

/// A page of an uploaded file was rendered to an image
#[derive(Clone, PartialEq, Serialize, Deserialize, prost::Message)]
#[serde(default, deny_unknown_fields)]
pub struct FilePageRendered {
    #[prost(string, tag = "1")]
    pub file_key: String,
    #[prost(string, tag = "2")]
    pub page_key: String,
    #[prost(int32, tag = "3")]
    pub page_number: i32,
    #[prost(string, tag = "4")]
    pub page_image_key: String,
}

impl Payload for FilePageRendered {
    const KIND: &'static str = "ocr.file.page.rendered";
}

/// A rendered page was recorded in the OCR database
#[derive(Clone, PartialEq, Serialize, Deserialize, prost::Message)]
#[serde(default, deny_unknown_fields)]
pub struct FilePageRegistered {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub file_id: String,
    #[prost(int32, tag = "3")]
    pub page_number: i32,
    #[prost(string, tag = "4")]
    pub page_image_key: String,
}

impl Payload for FilePageRegistered {
    const KIND: &'static str = "ocr.file.page.registered";
}

/// All pages of the given files were removed
#[derive(Clone, PartialEq, Serialize, Deserialize, prost::Message)]
#[serde(default, deny_unknown_fields)]
pub struct FilePagesDeleted {
    #[prost(string, repeated, tag = "1")]
    pub file_keys: Vec<String>,
}

impl Payload for FilePagesDeleted {
    const KIND: &'static str = "ocr.file.pages.deleted";
}

/// Text was extracted from a page
#[derive(Clone, PartialEq, Serialize, Deserialize, prost::Message)]
#[serde(default, deny_unknown_fields)]
pub struct FilePageOcrGenerated {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub file_id: String,
    #[prost(int32, tag = "3")]
    pub page_number: i32,
    #[prost(string, tag = "4")]
    pub page_image_key: String,
}

impl Payload for FilePageOcrGenerated {
    const KIND: &'static str = "ocr.file.page.ocr_generated";
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_kinds_live_under_ocr_channel() {
        for kind in [
            FilePageRendered::KIND,
            FilePageRegistered::KIND,
            FilePagesDeleted::KIND,
            FilePageOcrGenerated::KIND,
        ] {
            assert!(kind.starts_with(&format!("{OCR_CHANNEL}.")));
        }
    }

    #[test]
    fn test_page_number_survives_protobuf() {
        let rendered = FilePageRendered {
            file_key: "01HZX3V1".to_string(),
            page_key: "01HZX3V2".to_string(),
            page_number: 7,
            page_image_key: "01HZX3V1/7.png".to_string(),
        };

        let decoded = FilePageRendered::decode(rendered.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.page_number, 7);
    }
}
