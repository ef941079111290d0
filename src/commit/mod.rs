pub mod constraints;
pub mod insert;
pub mod update;
