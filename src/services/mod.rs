pub mod cache;
pub mod cleanup;
pub mod crypto;
pub mod links;
pub mod metadata;
pub mod notify;
pub mod object_store;
pub mod presign;
pub mod staging;
pub mod state;
pub mod transfer;
