// src/lib.rs
pub mod data {
    pub mod columns_file;
    pub mod reduce;
}
