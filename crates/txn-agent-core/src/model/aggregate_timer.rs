// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Timer trees accumulated across many transactions.

use serde::Serialize;

use crate::model::timer::{TimerName, TimerSnapshot};

/// Built (wire-ready) aggregate timer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateTimer {
    pub name: String,
    pub extended: bool,
    // f64 so that sums over unboundedly many transactions cannot overflow
    pub total_nanos: f64,
    pub count: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub child_timers: Vec<AggregateTimer>,
}

#[derive(Debug, Clone)]
pub struct MutableAggregateTimer {
    name: TimerName,
    total_nanos: f64,
    count: u64,
    children: Vec<MutableAggregateTimer>,
}

impl MutableAggregateTimer {
    #[must_use]
    pub fn new(name: TimerName) -> Self {
        Self {
            name,
            total_nanos: 0.0,
            count: 0,
            children: Vec::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> TimerName {
        self.name
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn merge(&mut self, timer: &TimerSnapshot) {
        self.count += timer.count;
        self.total_nanos += timer.total_nanos as f64;
        for child in &timer.children {
            self.child_mut(child.name).merge(child);
        }
    }

    pub fn merge_aggregate(&mut self, timer: &AggregateTimer) {
        self.count += timer.count;
        self.total_nanos += timer.total_nanos;
        for child in &timer.child_timers {
            let name = aggregate_timer_name(child);
            self.child_mut(name).merge_aggregate(child);
        }
    }

    fn child_mut(&mut self, name: TimerName) -> &mut MutableAggregateTimer {
        let position = self.children.iter().position(|c| c.name == name);
        match position {
            Some(index) => &mut self.children[index],
            None => {
                self.children.push(MutableAggregateTimer::new(name));
                let last = self.children.len() - 1;
                &mut self.children[last]
            }
        }
    }

    #[must_use]
    pub fn build(&self) -> AggregateTimer {
        AggregateTimer {
            name: self.name.name.to_string(),
            extended: self.name.extended,
            total_nanos: self.total_nanos,
            count: self.count,
            child_timers: self.children.iter().map(Self::build).collect(),
        }
    }
}

fn aggregate_timer_name(timer: &AggregateTimer) -> TimerName {
    if timer.extended {
        TimerName::extended(&timer.name)
    } else {
        TimerName::new(&timer.name)
    }
}

/// Root timers of one category (main thread, auxiliary threads or async).
#[derive(Debug, Clone, Default)]
pub struct RootTimerCollector {
    roots: Vec<MutableAggregateTimer>,
}

impl RootTimerCollector {
    pub fn merge_root_timer(&mut self, timer: &TimerSnapshot) {
        self.root_mut(timer.name).merge(timer);
    }

    pub fn merge_aggregate_root_timer(&mut self, timer: &AggregateTimer) {
        self.root_mut(aggregate_timer_name(timer))
            .merge_aggregate(timer);
    }

    fn root_mut(&mut self, name: TimerName) -> &mut MutableAggregateTimer {
        let position = self.roots.iter().position(|r| r.name == name);
        match position {
            Some(index) => &mut self.roots[index],
            None => {
                self.roots.push(MutableAggregateTimer::new(name));
                let last = self.roots.len() - 1;
                &mut self.roots[last]
            }
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    #[must_use]
    pub fn build(&self) -> Vec<AggregateTimer> {
        self.roots.iter().map(MutableAggregateTimer::build).collect()
    }
}
