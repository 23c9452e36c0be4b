pub mod dead_letter;

pub use dead_letter::{DeadLetter, SpilledRecord};
