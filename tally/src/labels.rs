//! Append-only set of labels seen by a chart.
//!
//! Every topic that ever shows up in a snapshot gets a series in the chart,
//! even after it stops receiving events. [`LabelSet`] only grows, and it hands
//! labels back in lexicographic order so series keys are deterministic.

use std::collections::BTreeSet;

/// A set of unique labels with sorted materialization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSet {
    labels: BTreeSet<String>,
}

impl LabelSet {
    /// Creates an empty label set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a label. Adding a label that is already present is a no-op.
    ///
    /// Returns `true` if the label was not present before.
    pub fn insert(&mut self, label: &str) -> bool {
        if self.labels.contains(label) {
            return false;
        }
        self.labels.insert(label.to_string())
    }

    /// Adds every label yielded by `labels`.
    pub fn extend<'a, I>(&mut self, labels: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for label in labels {
            self.insert(label);
        }
    }

    /// Returns whether `label` has been seen.
    pub fn contains(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    /// Iterates the labels in lexicographic order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }

    /// Returns the labels as a sorted vector.
    pub fn to_sorted_vec(&self) -> Vec<String> {
        self.labels.iter().cloned().collect()
    }

    /// Number of distinct labels.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Returns `true` if no label has been added.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}
