//! Status API over resume records: upload, polling, download and deletion.

pub mod handlers;
pub mod upload;
