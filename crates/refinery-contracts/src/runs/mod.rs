pub mod iteration;
pub mod summary;
