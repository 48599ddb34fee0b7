pub mod db_pool;
pub mod executor;
pub mod pool;
pub mod record;
pub mod schema_manager;
