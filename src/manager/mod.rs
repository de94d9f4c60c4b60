pub mod chain_store;
pub mod control;
pub mod task_manager;
