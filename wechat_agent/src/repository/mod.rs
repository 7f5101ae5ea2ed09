mod article_repo;
mod auth_repo;
mod coverage_repo;
mod schema;
mod source_repo;
mod subscription_repo;
mod sync_repo;

pub use article_repo::*;
pub use auth_repo::*;
pub use coverage_repo::*;
pub use schema::{connect, migrate};
pub use source_repo::*;
pub use subscription_repo::*;
pub use sync_repo::*;
