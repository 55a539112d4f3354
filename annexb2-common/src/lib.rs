//! Contracts shared between the B2 adapter and its object store clients.

pub mod backend;
pub mod error;

pub use backend::{
    normalize_prefix, remote_name, Connection, ContentReader, Credentials, ObjectAction,
    ObjectEntry, ObjectInfo, ObjectPage, ObjectStore, StoreConnector, UploadedObject,
};
pub use error::{ErrorKind, StoreError};
