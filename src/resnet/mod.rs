//! The ResNet network variant: C5 (forward) and C6 (backward).

pub mod backward;
pub mod forward;
pub mod layer;
