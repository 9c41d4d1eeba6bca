pub mod content;
pub mod repository;
pub mod resolver;
pub mod types;
pub mod variants;

pub use content::{ContentRepository, ReferenceRewriter, SqliteContentRepository, UrlReplacement};
pub use repository::{AssetRepository, SqliteAssetRepository};
pub use resolver::AttachmentResolver;
pub use types::{Asset, AssetFlag, AssetFlags, AssetId, MigrationStatus};
