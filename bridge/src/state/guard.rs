// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-memory mutual exclusion: one running instance per task type, and one
//! in-flight withdrawal request per principal.
//!
//! Guards release their slot on drop, so a task that fails or panics never
//! leaves its type marked as running.

use crate::types::Principal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use strum_macros::{Display, EnumIter};
use thiserror::Error;

pub const MAX_CONCURRENT: usize = 100;
pub const MAX_PENDING: usize = 1_000;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumIter, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskType {
    ScrapeLogs,
    MintEvents,
    CreateTransactions,
    SignTransactions,
    SendTransactions,
    FinalizeTransactions,
    ReimburseWithdrawals,
    RefreshFeeEstimate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GuardError {
    #[error("a request from this principal is already being processed")]
    AlreadyProcessing,
    #[error("too many concurrent requests")]
    TooManyConcurrentRequests,
    #[error("too many pending withdrawal requests")]
    TooManyPendingRequests,
}

#[derive(Debug, Default)]
pub struct GuardRegistry {
    active_tasks: BTreeSet<TaskType>,
    principals: BTreeSet<Principal>,
}

pub type SharedGuards = Arc<Mutex<GuardRegistry>>;

fn lock(registry: &SharedGuards) -> MutexGuard<'_, GuardRegistry> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl GuardRegistry {
    pub fn shared() -> SharedGuards {
        Arc::new(Mutex::new(GuardRegistry::default()))
    }

    pub fn active_tasks(&self) -> &BTreeSet<TaskType> {
        &self.active_tasks
    }

    pub fn in_flight_principals(&self) -> usize {
        self.principals.len()
    }
}

/// Marks a task type as running for as long as it is held.
#[derive(Debug)]
pub struct TaskGuard {
    task: TaskType,
    registry: SharedGuards,
}

impl TaskGuard {
    /// `None` when an instance of `task` is already running.
    pub fn new(registry: &SharedGuards, task: TaskType) -> Option<Self> {
        if !lock(registry).active_tasks.insert(task) {
            return None;
        }
        Some(Self {
            task,
            registry: registry.clone(),
        })
    }

    pub fn task(&self) -> TaskType {
        self.task
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        lock(&self.registry).active_tasks.remove(&self.task);
    }
}

/// Reserves a principal while its withdrawal request is being processed.
#[derive(Debug)]
pub struct WithdrawGuard {
    principal: Principal,
    registry: SharedGuards,
}

impl WithdrawGuard {
    pub fn new(
        registry: &SharedGuards,
        principal: Principal,
        pending_requests: usize,
    ) -> Result<Self, GuardError> {
        let mut guards = lock(registry);
        if guards.principals.contains(&principal) {
            return Err(GuardError::AlreadyProcessing);
        }
        if guards.principals.len() >= MAX_CONCURRENT {
            return Err(GuardError::TooManyConcurrentRequests);
        }
        if pending_requests >= MAX_PENDING {
            return Err(GuardError::TooManyPendingRequests);
        }
        guards.principals.insert(principal);
        Ok(Self {
            principal,
            registry: registry.clone(),
        })
    }
}

impl Drop for WithdrawGuard {
    fn drop(&mut self) {
        lock(&self.registry).principals.remove(&self.principal);
    }
}
