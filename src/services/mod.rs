pub mod commerce;
pub mod payments;
