// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

use thiserror::Error;

/// Precondition violations the dispatcher can detect without involving a
/// callback. Returned to the caller; the dispatcher never mutates state
/// before producing one of these.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError<ExecId: std::fmt::Debug, TaskId: std::fmt::Debug> {
    #[error("executor {0:?} is not known to the dispatcher")]
    UnknownExecutor(ExecId),

    #[error("task {0:?} is not known to the dispatcher")]
    UnknownTask(TaskId),

    #[error("task {task:?} is not currently assigned to executor {executor:?}")]
    TaskNotAssignedToExecutor { task: TaskId, executor: ExecId },
}

/// Top-level error returned by the dispatcher's mutating operations: either
/// a precondition violation detected before anything was touched, or a
/// message surfaced by a callback (or a caught callback panic) partway
/// through an operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatcherOpError<ExecId: std::fmt::Debug, TaskId: std::fmt::Debug> {
    #[error(transparent)]
    Precondition(#[from] DispatchError<ExecId, TaskId>),

    #[error("{0}")]
    Callback(String),
}
