//! Profile data structures
//!
//! A profile is a call tree built from sampled stack traces. Each node counts
//! the samples whose stack passed through it.

use serde::{Deserialize, Serialize};

/// A single frame in a stack trace
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Frame {
    /// Fully qualified function or method name
    pub function: String,

    /// File name (if available)
    pub file: Option<String>,

    /// Line number (if available)
    pub line: Option<u32>,

    /// Module/library name
    pub module: Option<String>,
}

impl Frame {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            file: None,
            line: None,
            module: None,
        }
    }

    pub fn with_location(mut self, file: impl Into<String>, line: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }
}

/// A complete stack trace
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Stack {
    /// Frames from innermost (top) to outermost (bottom)
    pub frames: Vec<Frame>,
}

impl Stack {
    /// Create a stack from function names, innermost first
    pub fn from_functions(functions: &[&str]) -> Self {
        Self {
            frames: functions.iter().map(|f| Frame::new(*f)).collect(),
        }
    }
}

/// One node of the call tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileNode {
    pub frame: Frame,

    /// Samples whose stack passed through this node
    pub sample_count: u64,

    pub children: Vec<ProfileNode>,
}

impl ProfileNode {
    pub fn new(frame: Frame) -> Self {
        Self {
            frame,
            sample_count: 0,
            children: Vec::new(),
        }
    }

    /// Samples that ended exactly at this node
    pub fn self_sample_count(&self) -> u64 {
        let child_total: u64 = self.children.iter().map(|c| c.sample_count).sum();
        self.sample_count.saturating_sub(child_total)
    }
}

/// Call tree with sample counts, rooted at the outermost frames
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub roots: Vec<ProfileNode>,

    /// Total number of samples
    pub total_samples: u64,
}

impl Profile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one sample to the profile
    pub fn add_sample(&mut self, stack: &Stack) {
        self.add_samples(stack, 1);
    }

    /// Add `count` samples sharing the same stack
    pub fn add_samples(&mut self, stack: &Stack, count: u64) {
        if stack.frames.is_empty() || count == 0 {
            return;
        }
        self.total_samples += count;
        let mut level = &mut self.roots;
        for frame in stack.frames.iter().rev() {
            let idx = match level.iter().position(|n| &n.frame == frame) {
                Some(idx) => idx,
                None => {
                    level.push(ProfileNode::new(frame.clone()));
                    level.len() - 1
                }
            };
            let node = &mut level[idx];
            node.sample_count += count;
            level = &mut node.children;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_samples == 0
    }

    /// Number of nodes in the call tree
    pub fn node_count(&self) -> usize {
        fn count(nodes: &[ProfileNode]) -> usize {
            nodes.iter().map(|n| 1 + count(&n.children)).sum()
        }
        count(&self.roots)
    }
}
