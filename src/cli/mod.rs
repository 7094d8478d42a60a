pub mod check;
pub mod tunables;
