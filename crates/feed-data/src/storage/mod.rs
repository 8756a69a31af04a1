//! 스토리지 백엔드.

pub mod redis;
pub mod timescale;
