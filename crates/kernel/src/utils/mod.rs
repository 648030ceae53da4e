pub mod locks;
pub mod phys_map;
pub mod pool;
pub mod types;
