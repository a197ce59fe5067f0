//! 버전 관리되는 스키마 추적
//!
//! - model: Database → Table → Column 트리
//! - change: 해석된 DDL 변경과 순수 적용 함수
//! - resolver / capture: 외부 협력자 경계 (DDL 해석, 라이브 스키마 읽기)
//! - repository / mysql: 스냅샷 영속화
//! - store: 위의 것들을 묶는 SchemaStore

pub mod capture;
pub mod change;
pub mod model;
pub mod mysql;
pub mod repository;
pub mod resolver;
pub mod store;

pub use capture::{MysqlSchemaCapturer, SchemaCapturer, StaticSchemaCapturer};
pub use change::{ColumnMod, SchemaChange, TableRef};
pub use model::{CaseSensitivity, ColumnDef, ColumnPosition, Database, Schema, Table};
pub use mysql::MysqlSchemaRepository;
pub use repository::{MemorySchemaRepository, SavedSchema, SchemaRepository};
pub use resolver::{DdlResolver, StaticDdlResolver};
pub use store::{SchemaStore, SchemaStoreConfig};
