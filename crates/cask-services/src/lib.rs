//! cask-services — record store, storage area, and the session engine
//! that serves the upload protocol.

pub mod server;
pub mod session;
pub mod storage;
pub mod store;

pub use session::{Session, SessionContext, SessionError, SessionSettings, SessionState};
pub use storage::{validate_file_name, FileStorage, StorageError, UploadTarget};
pub use store::{ClientRecord, FileRecord, RecordStore, StoreError};
