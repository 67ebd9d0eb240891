//! Architecture-specific structures and instruction wrappers.

pub mod x86_64;
