// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-thread-context timer tree.
//!
//! Timers live in an arena owned by a single thread context and reference each
//! other by index. Only the owning thread mutates the tree, so nothing here is
//! synchronized.

use serde::Serialize;
use ustr::Ustr;

/// Timer identity: a name plus whether it is an extended (synthetic) timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TimerName {
    pub name: Ustr,
    pub extended: bool,
}

impl TimerName {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: Ustr::from(name),
            extended: false,
        }
    }

    #[must_use]
    pub fn extended(name: &str) -> Self {
        Self {
            name: Ustr::from(name),
            extended: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u32);

impl TimerId {
    pub(crate) const ROOT: TimerId = TimerId(0);

    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
struct TimerNode {
    name: TimerName,
    count: u64,
    total_nanos: u64,
    start_tick: u64,
    active: bool,
    self_nesting_level: u32,
    parent: Option<TimerId>,
    children: Vec<TimerId>,
}

impl TimerNode {
    fn new(name: TimerName, parent: Option<TimerId>, start_tick: u64) -> Self {
        Self {
            name,
            count: 1,
            total_nanos: 0,
            start_tick,
            active: true,
            self_nesting_level: 0,
            parent,
            children: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimerTree {
    nodes: Vec<TimerNode>,
    current: TimerId,
}

impl TimerTree {
    /// Creates a tree whose root timer starts running at `start_tick`.
    #[must_use]
    pub fn new(root: TimerName, start_tick: u64) -> Self {
        Self {
            nodes: vec![TimerNode::new(root, None, start_tick)],
            current: TimerId::ROOT,
        }
    }

    /// Starts (or resumes) `name` under the currently running timer.
    ///
    /// Starting the timer that is already running only bumps its count and
    /// nesting level, so recursive calls are not double counted.
    pub fn start_timer(&mut self, name: TimerName, tick: u64) -> TimerId {
        let current = self.current;
        {
            let node = &mut self.nodes[current.index()];
            if node.active && node.name == name {
                node.self_nesting_level += 1;
                node.count += 1;
                return current;
            }
        }
        let existing = self.nodes[current.index()]
            .children
            .iter()
            .copied()
            .find(|child| self.nodes[child.index()].name == name);
        let id = match existing {
            Some(id) => {
                let child = &mut self.nodes[id.index()];
                child.count += 1;
                child.start_tick = tick;
                child.active = true;
                id
            }
            None => {
                #[allow(clippy::cast_possible_truncation)]
                let id = TimerId(self.nodes.len() as u32);
                self.nodes.push(TimerNode::new(name, Some(current), tick));
                self.nodes[current.index()].children.push(id);
                id
            }
        };
        self.current = id;
        id
    }

    /// Ids that do not belong to this tree are ignored.
    pub fn stop(&mut self, id: TimerId, tick: u64) {
        let Some(node) = self.nodes.get_mut(id.index()) else {
            return;
        };
        if !node.active {
            return;
        }
        if node.self_nesting_level > 0 {
            node.self_nesting_level -= 1;
            return;
        }
        node.total_nanos += tick.saturating_sub(node.start_tick);
        node.active = false;
        let parent = node.parent;
        if let Some(parent) = parent {
            self.current = parent;
        }
    }

    /// Stops every timer that is still running, innermost first.
    pub fn stop_all(&mut self, tick: u64) {
        for index in (0..self.nodes.len()).rev() {
            let node = &mut self.nodes[index];
            if node.active {
                node.self_nesting_level = 0;
                node.total_nanos += tick.saturating_sub(node.start_tick);
                node.active = false;
            }
        }
        self.current = TimerId::ROOT;
    }

    #[must_use]
    pub fn current(&self) -> TimerId {
        self.current
    }

    #[must_use]
    pub fn name(&self, id: TimerId) -> TimerName {
        self.nodes[id.index()].name
    }

    /// Immutable copy of the tree. Running timers report elapsed time up to `tick`.
    #[must_use]
    pub fn snapshot(&self, tick: u64) -> TimerSnapshot {
        self.snapshot_node(TimerId::ROOT, tick)
    }

    fn snapshot_node(&self, id: TimerId, tick: u64) -> TimerSnapshot {
        let node = &self.nodes[id.index()];
        let mut total_nanos = node.total_nanos;
        if node.active {
            total_nanos += tick.saturating_sub(node.start_tick);
        }
        TimerSnapshot {
            name: node.name,
            count: node.count,
            total_nanos,
            active: node.active,
            children: node
                .children
                .iter()
                .map(|child| self.snapshot_node(*child, tick))
                .collect(),
        }
    }
}

/// Frozen timer tree handed to aggregation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerSnapshot {
    pub name: TimerName,
    pub count: u64,
    pub total_nanos: u64,
    pub active: bool,
    pub children: Vec<TimerSnapshot>,
}

impl TimerSnapshot {
    /// Leaf timer used for async timers and tests.
    #[must_use]
    pub fn leaf(name: TimerName, count: u64, total_nanos: u64) -> Self {
        Self {
            name,
            count,
            total_nanos,
            active: false,
            children: Vec::new(),
        }
    }

    #[must_use]
    pub fn child(&self, name: &str) -> Option<&TimerSnapshot> {
        self.children.iter().find(|c| c.name.name.as_str() == name)
    }
}
