pub mod id;
pub mod keys;
