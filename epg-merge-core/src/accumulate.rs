//! The merge accumulator: owns the output root and appends sources into it.

use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, warn};

use crate::contract::FetchOutcome;
use crate::document::{Document, Element, ElementKind, Node, Programme, XMLTV_ROOT};

/// Element counts, per source or for the whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeTotals {
    pub channels: usize,
    pub programmes: usize,
    pub other: usize,
    /// Programmes dropped because their start is after their stop.
    pub dropped: usize,
    /// Channels dropped by channel-id de-duplication.
    pub duplicate_channels: usize,
}

impl MergeTotals {
    fn add(&mut self, other: &MergeTotals) {
        self.channels += other.channels;
        self.programmes += other.programmes;
        self.other += other.other;
        self.dropped += other.dropped;
        self.duplicate_channels += other.duplicate_channels;
    }
}

/// Per-outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct MergeAccumulator {
    document: Document,
    dedupe_channels: bool,
    seen_channels: HashSet<String>,
    totals: MergeTotals,
    counts: OutcomeCounts,
}

impl Default for MergeAccumulator {
    fn default() -> Self {
        Self::new(XMLTV_ROOT)
    }
}

impl MergeAccumulator {
    pub fn new(root_name: &str) -> Self {
        Self {
            document: Document::new(root_name),
            dedupe_channels: false,
            seen_channels: HashSet::new(),
            totals: MergeTotals::default(),
            counts: OutcomeCounts::default(),
        }
    }

    /// Keep only the first `<channel>` seen for each id.
    pub fn with_dedupe_channels(mut self, dedupe: bool) -> Self {
        self.dedupe_channels = dedupe;
        self
    }

    /// Appends every direct child element of `document`'s root, in order.
    pub fn absorb(&mut self, document: Document) -> MergeTotals {
        let mut stats = MergeTotals::default();
        for node in document.root.children {
            let Node::Element(element) = node else {
                continue;
            };
            match element.kind() {
                ElementKind::Channel => {
                    if self.dedupe_channels {
                        let id = element.attribute("id").unwrap_or_default().to_string();
                        if !self.seen_channels.insert(id.clone()) {
                            debug!(channel = %id, "Dropping duplicate channel");
                            stats.duplicate_channels += 1;
                            continue;
                        }
                    }
                    stats.channels += 1;
                }
                ElementKind::Programme => {
                    if !programme_is_well_ordered(&element) {
                        warn!(
                            channel = element.attribute("channel").unwrap_or_default(),
                            start = element.attribute("start").unwrap_or_default(),
                            stop = element.attribute("stop").unwrap_or_default(),
                            "Dropping programme that stops before it starts"
                        );
                        stats.dropped += 1;
                        continue;
                    }
                    stats.programmes += 1;
                }
                ElementKind::Other => stats.other += 1,
            }
            self.document.root.children.push(Node::Element(element));
        }
        self.totals.add(&stats);
        stats
    }

    /// Counts an outcome, absorbing its document on success.
    pub fn record(&mut self, outcome: FetchOutcome) -> Option<MergeTotals> {
        match outcome {
            FetchOutcome::Success { document, .. } => {
                self.counts.succeeded += 1;
                Some(self.absorb(document))
            }
            FetchOutcome::Skipped { .. } => {
                self.counts.skipped += 1;
                None
            }
            FetchOutcome::Failed { .. } => {
                self.counts.failed += 1;
                None
            }
        }
    }

    /// Stable partition: every `<channel>` first, everything else after, each
    /// group in its accumulated order.
    pub fn reorder_channels_first(&mut self) {
        let children = std::mem::take(&mut self.document.root.children);
        let (mut channels, rest): (Vec<Node>, Vec<Node>) = children
            .into_iter()
            .partition(|node| matches!(node, Node::Element(e) if e.kind() == ElementKind::Channel));
        channels.extend(rest);
        self.document.root.children = channels;
    }

    pub fn totals(&self) -> MergeTotals {
        self.totals
    }

    pub fn counts(&self) -> OutcomeCounts {
        self.counts
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn into_document(self) -> Document {
        self.document
    }
}

fn programme_is_well_ordered(element: &Element) -> bool {
    Programme::from_element(element)
        .map(|p| p.is_well_ordered())
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(id: &str) -> Element {
        Element::new("channel")
            .with_attribute("id", id)
            .with_child(Element::new("display-name").with_text(id))
    }

    fn programme(channel: &str, title: &str) -> Element {
        Element::new("programme")
            .with_attribute("start", "20250206120000 +0000")
            .with_attribute("stop", "20250206130000 +0000")
            .with_attribute("channel", channel)
            .with_child(Element::new("title").with_text(title))
    }

    fn doc(children: Vec<Element>) -> Document {
        let mut root = Element::new("tv");
        for child in children {
            root = root.with_child(child);
        }
        Document { root }
    }

    fn names(acc: &MergeAccumulator) -> Vec<String> {
        acc.document()
            .root
            .child_elements()
            .map(|e| {
                e.attribute("id")
                    .map(str::to_string)
                    .or_else(|| e.first_child("title").map(Element::text))
                    .unwrap_or_default()
            })
            .collect()
    }

    #[test]
    fn absorbs_in_source_then_document_order() {
        let mut acc = MergeAccumulator::default();
        acc.absorb(doc(vec![channel("a1"), programme("a1", "a2")]));
        acc.absorb(doc(vec![programme("a1", "b1")]));
        acc.absorb(doc(vec![channel("c1"), programme("c1", "c2")]));
        assert_eq!(names(&acc), vec!["a1", "a2", "b1", "c1", "c2"]);
        assert_eq!(acc.totals().channels, 2);
        assert_eq!(acc.totals().programmes, 3);
    }

    #[test]
    fn reorder_moves_channels_first_and_keeps_relative_order() {
        let mut acc = MergeAccumulator::default();
        acc.absorb(doc(vec![channel("x"), programme("x", "p1")]));
        acc.absorb(doc(vec![programme("y", "p2"), channel("y")]));
        acc.reorder_channels_first();
        assert_eq!(names(&acc), vec!["x", "y", "p1", "p2"]);
    }

    #[test]
    fn duplicate_channels_are_kept_unless_deduped() {
        let mut keep = MergeAccumulator::default();
        keep.absorb(doc(vec![channel("dup")]));
        keep.absorb(doc(vec![channel("dup")]));
        assert_eq!(keep.totals().channels, 2);

        let mut dedupe = MergeAccumulator::default().with_dedupe_channels(true);
        dedupe.absorb(doc(vec![channel("dup")]));
        let second = dedupe.absorb(doc(vec![channel("dup"), channel("other")]));
        assert_eq!(second.duplicate_channels, 1);
        assert_eq!(names(&dedupe), vec!["dup", "other"]);
    }

    #[test]
    fn reversed_programmes_are_dropped() {
        let reversed = Element::new("programme")
            .with_attribute("start", "20250206140000 +0000")
            .with_attribute("stop", "20250206130000 +0000")
            .with_attribute("channel", "x");
        let mut acc = MergeAccumulator::default();
        let stats = acc.absorb(doc(vec![reversed, programme("x", "ok")]));
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.programmes, 1);
        assert_eq!(names(&acc), vec!["ok"]);
    }
}
