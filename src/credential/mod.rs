pub mod pool;
pub mod quota;
pub mod rotator;
pub mod types;
