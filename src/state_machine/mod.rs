//! State machines built with `statig`.

pub mod lifecycle_sm;
