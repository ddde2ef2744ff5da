// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

use std::fmt::Debug;
use std::hash::Hash;

/// Anything usable as an opaque id: an executor id, an executor type, or a
/// task id. The dispatcher never inspects these beyond equality, hashing,
/// and cloning, so the blanket impl below covers every plain key type a
/// caller would reach for (`u64`, `String`, `Uuid`, ...).
pub trait Identifier: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> Identifier for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}
