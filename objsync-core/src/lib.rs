mod auth;
mod client;

pub use auth::{Credentials, encode_entry, encode_key};
pub use client::{
    ApiErrorClass, DEFAULT_DOWNLOAD_TTL_SECS, ListPage, ObjectEntry, StoreClient, StoreEndpoints,
    StoreError, UploadTarget, Zone,
};
