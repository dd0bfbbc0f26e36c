//! API handlers module

pub mod answer;
pub mod documents;
pub mod health;
