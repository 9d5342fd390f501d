//! Request-level services over the repository and blob store

pub mod deletion_service;
pub mod file_service;
pub mod reconcile_worker;
pub mod user_context;

pub use deletion_service::DeletionService;
pub use file_service::FileService;
pub use reconcile_worker::{ReconcileWorker, SweepReport, SweepScope};
pub use user_context::UserContext;
