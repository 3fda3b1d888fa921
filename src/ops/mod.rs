pub mod hash_join;
pub mod merge;
pub mod shims;
pub mod sort;
