//! Repository traits for metadata operations.

pub mod jobs;
pub mod objects;
pub mod quota;
pub mod sessions;

pub use jobs::JobRepo;
pub use objects::ObjectRepo;
pub use quota::QuotaRepo;
pub use sessions::SessionRepo;
