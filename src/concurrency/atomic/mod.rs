//! Word-sized atomic primitive underlying every lock word.

pub mod word;

pub use word::AtomicWord;
