// SPDX-FileCopyrightText: 2025 The bblayout developers
// SPDX-License-Identifier: LGPL-3.0-only

/// Recoverable failures of the layout engine. Contract violations (for
/// example an assembly of a chain with itself) are bugs and panic instead.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LayoutError {
    /// A precondition of the requested operation does not hold, e.g. a
    /// cloning conflicts with previously applied clonings or an assembly
    /// has no score gain. Processing continues with the next candidate.
    #[error("{0}")]
    FailedPrecondition(String),
}

impl LayoutError {
    pub fn failed_precondition(msg: impl Into<String>) -> LayoutError {
        LayoutError::FailedPrecondition(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, LayoutError>;
