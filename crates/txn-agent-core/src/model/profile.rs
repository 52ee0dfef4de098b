// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sampled call-stack trees.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileNode {
    pub frame: String,
    pub sample_count: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ProfileNode>,
}

impl ProfileNode {
    fn new(frame: &str) -> Self {
        Self {
            frame: frame.to_string(),
            sample_count: 0,
            children: Vec::new(),
        }
    }

    fn child_mut(&mut self, frame: &str) -> &mut ProfileNode {
        let position = self.children.iter().position(|c| c.frame == frame);
        match position {
            Some(index) => &mut self.children[index],
            None => {
                self.children.push(ProfileNode::new(frame));
                let last = self.children.len() - 1;
                &mut self.children[last]
            }
        }
    }

    fn merge(&mut self, other: &ProfileNode) {
        self.sample_count += other.sample_count;
        for child in &other.children {
            self.child_mut(&child.frame).merge(child);
        }
    }
}

/// Frame tree rooted at the outermost frames. Every node counts the samples
/// that passed through it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub root_nodes: Vec<ProfileNode>,
    pub sample_count: u64,
}

impl Profile {
    /// Adds one sample. `frames` are ordered innermost first, the way stack
    /// traces are usually reported.
    pub fn add_stack_trace<S: AsRef<str>>(&mut self, frames: &[S]) {
        let mut outermost_first = frames.iter().rev();
        let Some(root_frame) = outermost_first.next() else {
            return;
        };
        self.sample_count += 1;
        let mut node = root_mut(&mut self.root_nodes, root_frame.as_ref());
        node.sample_count += 1;
        for frame in outermost_first {
            node = node.child_mut(frame.as_ref());
            node.sample_count += 1;
        }
    }

    pub fn merge(&mut self, other: &Profile) {
        self.sample_count += other.sample_count;
        for root in &other.root_nodes {
            root_mut(&mut self.root_nodes, &root.frame).merge(root);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }
}

fn root_mut<'a>(roots: &'a mut Vec<ProfileNode>, frame: &str) -> &'a mut ProfileNode {
    let position = roots.iter().position(|r| r.frame == frame);
    match position {
        Some(index) => &mut roots[index],
        None => {
            roots.push(ProfileNode::new(frame));
            let last = roots.len() - 1;
            &mut roots[last]
        }
    }
}
