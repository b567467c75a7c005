pub mod chat;
pub mod dod;
pub mod im;
pub mod login;
pub mod xfer_download;
pub mod xfer_upload;
