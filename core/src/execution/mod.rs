//! Background execution for long-running operations
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

pub mod tasks;

pub use self::tasks::{TaskExecutionError, TaskHandle, TaskRunner};
