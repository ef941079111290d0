pub mod backend;
pub mod index;
pub mod key;
pub mod keyset;
pub mod memory;
pub mod tx;
