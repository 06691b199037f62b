// Copyright 2025 Lorestore Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Work budgets for long-running analytics.
//!
//! Running out of budget is not an error: the analytic returns what it has
//! computed so far wrapped in [`Bounded`] with `truncated = true`.

use serde::Serialize;
use std::time::{Duration, Instant};

/// Limits on analytic work
#[derive(Debug, Clone, Copy, Default)]
pub struct Budget {
    pub deadline: Option<Instant>,
    pub max_nodes: Option<usize>,
}

impl Budget {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            max_nodes: None,
        }
    }

    pub fn max_nodes(mut self, max_nodes: usize) -> Self {
        self.max_nodes = Some(max_nodes);
        self
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    /// True once `processed` nodes reach the cap
    pub fn node_cap_reached(&self, processed: usize) -> bool {
        self.max_nodes.map_or(false, |cap| processed >= cap)
    }

    pub fn exhausted(&self, processed: usize) -> bool {
        self.node_cap_reached(processed) || self.deadline_passed()
    }
}

/// A possibly partial result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bounded<T> {
    pub value: T,
    pub truncated: bool,
}

impl<T> Bounded<T> {
    pub fn complete(value: T) -> Self {
        Self {
            value,
            truncated: false,
        }
    }

    pub fn partial(value: T) -> Self {
        Self {
            value,
            truncated: true,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Bounded<U> {
        Bounded {
            value: f(self.value),
            truncated: self.truncated,
        }
    }
}
