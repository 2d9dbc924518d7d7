//! Engine modules: pure planning logic that turns the operator's choices into
//! ordered, validated plans before anything touches the disk.

pub mod storage;
