pub mod filesystem;
pub mod graph;
pub mod imports;
pub mod invalidation;
pub mod parser;
pub mod symbols;
