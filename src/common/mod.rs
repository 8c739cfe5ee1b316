//! 共通型定義

/// エラー型定義
pub mod error;

pub use error::{CpError, CpResult};
