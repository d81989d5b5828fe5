pub mod publish_file;
pub mod resolve_pointer;

pub use publish_file::{
    CommitOutcome, PublishFileOperation, PublishFileOperationRequest, PublishFileOperationResult,
};
pub use resolve_pointer::{
    ResolvePointerOperation, ResolvePointerOperationOutcome, ResolvePointerOperationRequest,
};
