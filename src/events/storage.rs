// Copyright (c) 2025 - Cowboy AI, Inc.
//! Storage service events

use serde::{Deserialize, Serialize};

use super::Payload;

/// Channel owned by the storage service
pub const STORAGE_CHANNEL: &str = "storage";

/// A file finished uploading to object storage
#[derive(Clone, PartialEq, Serialize, Deserialize, prost::Message)]
#[serde(default, deny_unknown_fields)]
pub struct FileUploaded {
    #[prost(string, tag = "1")]
    pub file_key: String,
    #[prost(string, tag = "2")]
    pub file_name: String,
    #[prost(string, tag = "3")]
    pub bucket_name: String,
}

impl Payload for FileUploaded {
    const KIND: &'static str = "storage.file.uploaded";
}

/// Files were removed by a user
#[derive(Clone, PartialEq, Serialize, Deserialize, prost::Message)]
#[serde(default, deny_unknown_fields)]
pub struct FilesDeleted {
    #[prost(string, repeated, tag = "1")]
    pub file_keys: Vec<String>,
}

impl Payload for FilesDeleted {
    const KIND: &'static str = "storage.files.deleted";
}
